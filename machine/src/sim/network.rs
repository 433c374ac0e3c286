// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Simulated host networking

use super::{SimEvent, SimState};
use crate::bundle::BundleMetadata;
use crate::network::{api_hostname, check_resolved, HostNetwork, NetworkError};
use async_trait::async_trait;
use std::net::IpAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;

pub struct SimHostNetwork {
    sim: Arc<SimState>,
}

impl SimHostNetwork {
    pub(crate) fn new(sim: Arc<SimState>) -> Self {
        Self { sim }
    }
}

#[async_trait]
impl HostNetwork for SimHostNetwork {
    async fn determine_host_ip(
        &self,
        vm_ip: IpAddr,
    ) -> Result<IpAddr, NetworkError> {
        self.sim.record(SimEvent::HostIpQuery);
        let query = self.sim.host_ip_queries.fetch_add(1, Ordering::SeqCst);
        if query < self.sim.config.host_ip_failures {
            return Err(NetworkError::HostIp {
                vm_ip,
                err: std::io::Error::other("network is unreachable"),
            });
        }
        Ok(self.sim.config.host_ip)
    }

    async fn check_dns_from_host(
        &self,
        metadata: &BundleMetadata,
        vm_ip: IpAddr,
    ) -> Result<(), NetworkError> {
        self.sim.record(SimEvent::HostDnsQuery);
        let found = if self.sim.config.host_dns_fails {
            Vec::new()
        } else {
            vec![self.sim.config.vm_ip]
        };
        check_resolved(api_hostname(metadata), vm_ip, found)
    }
}
