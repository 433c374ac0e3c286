// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Simulated cluster API

use super::{ClusterOp, SimEvent, SimState};
use crate::cluster::{ClusterApiClient, ClusterError, OperatorsStatus};
use async_trait::async_trait;
use snc_common::proxy::ProxyConfig;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use uuid::Uuid;

pub struct SimCluster {
    sim: Arc<SimState>,
}

impl SimCluster {
    pub(crate) fn new(sim: Arc<SimState>) -> Self {
        Self { sim }
    }

    fn record(&self, op: ClusterOp) {
        debug!(self.sim.log, "cluster API call"; "op" => %op);
        self.sim.record(SimEvent::Cluster(op));
    }
}

#[async_trait]
impl ClusterApiClient for SimCluster {
    async fn renew_certificates(&self) -> Result<(), ClusterError> {
        self.record(ClusterOp::RenewCertificates);
        if self.sim.config.renewal_fails {
            return Err(ClusterError::Api {
                operation: "renew certificates",
                message: "certificate signing requests were not approved"
                    .to_string(),
            });
        }
        Ok(())
    }

    async fn add_pull_secret(
        &self,
        _pull_secret: &str,
    ) -> Result<(), ClusterError> {
        self.record(ClusterOp::AddPullSecret);
        Ok(())
    }

    async fn update_cluster_id(&self, _id: Uuid) -> Result<(), ClusterError> {
        self.record(ClusterOp::UpdateClusterId);
        Ok(())
    }

    async fn approve_node_csr(&self) -> Result<(), ClusterError> {
        self.record(ClusterOp::ApproveNodeCsr);
        Ok(())
    }

    async fn operators_status(&self) -> Result<OperatorsStatus, ClusterError> {
        self.record(ClusterOp::OperatorsStatus);
        if self.sim.config.operators_unreachable {
            return Err(ClusterError::Api {
                operation: "get cluster operators",
                message: "connection refused".to_string(),
            });
        }
        Ok(self.sim.config.operators)
    }

    async fn add_proxy_config(
        &self,
        _proxy: &ProxyConfig,
    ) -> Result<(), ClusterError> {
        self.record(ClusterOp::AddProxyConfig);
        Ok(())
    }

    async fn proxy_settings_applied(
        &self,
        _proxy: &ProxyConfig,
        _package: &str,
        _namespace: &str,
    ) -> Result<bool, ClusterError> {
        self.record(ClusterOp::ProxySettingsApplied);
        let polls = self.sim.proxy_polls.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(self
            .sim
            .config
            .proxy_propagation_polls
            .is_some_and(|needed| polls >= needed))
    }

    async fn wait_for_request_header_client_ca(
        &self,
    ) -> Result<(), ClusterError> {
        self.record(ClusterOp::WaitForRequestHeaderClientCa);
        Ok(())
    }

    async fn delete_openshift_apiserver_pods(
        &self,
    ) -> Result<(), ClusterError> {
        self.record(ClusterOp::DeleteOpenshiftApiserverPods);
        Ok(())
    }
}
