// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Host-side networking checks and nameserver configuration of the VM.

use crate::bundle::BundleMetadata;
use crate::ssh::{RemoteRunner, RunnerError};
use async_trait::async_trait;
use slog::Logger;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

const RESOLV_CONF: &str = "/etc/resolv.conf";

#[derive(thiserror::Error, Debug)]
pub enum NetworkError {
    #[error("cannot determine the host address on the route to {vm_ip}: {err}")]
    HostIp {
        vm_ip: IpAddr,
        #[source]
        err: std::io::Error,
    },

    #[error("the route to {vm_ip} does not use a usable host address ({found})")]
    UnusableHostIp { vm_ip: IpAddr, found: IpAddr },

    #[error("the host address has not been determined yet")]
    HostIpUnknown,

    #[error("failed to resolve {name}: {err}")]
    Lookup {
        name: String,
        #[source]
        err: std::io::Error,
    },

    #[error("{name} resolves to {found:?} instead of {expected}")]
    WrongAddress { name: String, expected: IpAddr, found: Vec<IpAddr> },

    #[error(transparent)]
    Runner(#[from] RunnerError),
}

/// Networking as seen from the host running the controller.
#[async_trait]
pub trait HostNetwork: Send + Sync {
    /// Address of the host on the network it shares with the VM.
    async fn determine_host_ip(
        &self,
        vm_ip: IpAddr,
    ) -> Result<IpAddr, NetworkError>;

    /// Checks that the host resolves the cluster's API name to the VM.
    async fn check_dns_from_host(
        &self,
        metadata: &BundleMetadata,
        vm_ip: IpAddr,
    ) -> Result<(), NetworkError>;
}

/// [`HostNetwork`] backed by the host's network stack and resolver.
#[derive(Clone, Debug, Default)]
pub struct SystemHostNetwork;

#[async_trait]
impl HostNetwork for SystemHostNetwork {
    async fn determine_host_ip(
        &self,
        vm_ip: IpAddr,
    ) -> Result<IpAddr, NetworkError> {
        // Connecting a UDP socket sends nothing, but makes the kernel pick the
        // source address it would route through.
        let unspecified: IpAddr = match vm_ip {
            IpAddr::V4(_) => Ipv4Addr::UNSPECIFIED.into(),
            IpAddr::V6(_) => Ipv6Addr::UNSPECIFIED.into(),
        };
        let host_error = |err| NetworkError::HostIp { vm_ip, err };
        let socket =
            tokio::net::UdpSocket::bind(SocketAddr::new(unspecified, 0))
                .await
                .map_err(host_error)?;
        socket.connect(SocketAddr::new(vm_ip, 22)).await.map_err(host_error)?;
        let found = socket.local_addr().map_err(host_error)?.ip();
        if found.is_unspecified() || (found.is_loopback() && !vm_ip.is_loopback())
        {
            return Err(NetworkError::UnusableHostIp { vm_ip, found });
        }
        Ok(found)
    }

    async fn check_dns_from_host(
        &self,
        metadata: &BundleMetadata,
        vm_ip: IpAddr,
    ) -> Result<(), NetworkError> {
        let name = api_hostname(metadata);
        let found: Vec<IpAddr> = tokio::net::lookup_host((name.as_str(), 6443))
            .await
            .map_err(|err| NetworkError::Lookup { name: name.clone(), err })?
            .map(|addr| addr.ip())
            .collect();
        check_resolved(name, vm_ip, found)
    }
}

/// Host name of the cluster's API server.
pub fn api_hostname(metadata: &BundleMetadata) -> String {
    format!(
        "api.{}.{}",
        metadata.cluster_info.cluster_name, metadata.cluster_info.base_domain
    )
}

/// Verifies that `expected` is among the addresses `name` resolved to.
pub fn check_resolved(
    name: String,
    expected: IpAddr,
    found: Vec<IpAddr>,
) -> Result<(), NetworkError> {
    if found.contains(&expected) {
        Ok(())
    } else {
        Err(NetworkError::WrongAddress { name, expected, found })
    }
}

/// True if the VM already lists `nameserver` in its resolver configuration.
pub async fn has_nameserver_configured(
    runner: &dyn RemoteRunner,
    nameserver: IpAddr,
) -> Result<bool, RunnerError> {
    let resolv = runner.run(&format!("cat {RESOLV_CONF}")).await?;
    let wanted = nameserver.to_string();
    Ok(resolv.lines().any(|line| {
        let mut words = line.split_whitespace();
        words.next() == Some("nameserver") && words.next() == Some(&wanted)
    }))
}

/// Adds `nameserver` to the VM's resolver configuration unless it is already
/// there.
pub async fn add_nameserver_to_instance(
    log: &Logger,
    runner: &dyn RemoteRunner,
    nameserver: IpAddr,
) -> Result<(), RunnerError> {
    if has_nameserver_configured(runner, nameserver).await? {
        debug!(log, "nameserver already configured"; "nameserver" => %nameserver);
        return Ok(());
    }
    info!(log, "Adding {nameserver} as nameserver to the instance ...");
    runner
        .run(&format!(
            "echo 'nameserver {nameserver}' | sudo tee -a {RESOLV_CONF}"
        ))
        .await
        .map(|_| ())
}
