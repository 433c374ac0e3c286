// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The DNS server running inside the VM.
//!
//! The VM runs dnsmasq answering for the cluster's own names, so that both
//! the cluster and the host can resolve them without any external DNS.

use crate::bundle::{BundleError, BundleMetadata};
use crate::ssh::{RemoteRunner, RunnerError};
use crate::systemd::{ServiceCommander, ServiceError};
use slog::Logger;
use std::net::IpAddr;

pub const DNSMASQ_CONF_PATH: &str = "/var/srv/dnsmasq.conf";
pub const DNSMASQ_SERVICE: &str = "dnsmasq";

/// Public name resolved to check that the VM reaches upstream DNS.
const PUBLIC_QUERY_NAME: &str = "quay.io";

#[derive(thiserror::Error, Debug)]
pub enum DnsError {
    #[error(transparent)]
    Bundle(#[from] BundleError),

    #[error("Failed to write the DNS configuration: {0}")]
    Configure(#[source] RunnerError),

    #[error(transparent)]
    Service(#[from] ServiceError),
}

/// What the in-VM DNS server needs to know.
#[derive(Clone, Copy, Debug)]
pub struct DnsContext<'a> {
    pub vm_ip: IpAddr,
    pub host_ip: IpAddr,
    pub metadata: &'a BundleMetadata,
}

/// Contents of the dnsmasq configuration for the cluster.
pub fn dnsmasq_config(ctx: &DnsContext<'_>) -> Result<String, BundleError> {
    let info = &ctx.metadata.cluster_info;
    let cluster_domain = format!("{}.{}", info.cluster_name, info.base_domain);
    let vm_ip = ctx.vm_ip;

    let mut lines = vec![
        "user=root".to_string(),
        "port=53".to_string(),
        "bind-interfaces".to_string(),
        "expand-hosts".to_string(),
        "log-queries".to_string(),
        format!("local=/{cluster_domain}/"),
        format!("domain={cluster_domain}"),
        format!("address=/{}/{vm_ip}", info.apps_domain),
    ];
    for name in ["api", "api-int", "etcd-0"] {
        lines.push(format!("address=/{name}.{cluster_domain}/{vm_ip}"));
    }
    lines.push(format!("address=/host.{cluster_domain}/{}", ctx.host_ip));
    lines.push(format!(
        "address=/{}.{cluster_domain}/{}",
        ctx.metadata.node_hostname()?,
        ctx.metadata.node_internal_ip()?,
    ));

    let mut config = lines.join("\n");
    config.push('\n');
    Ok(config)
}

/// Configures and (re)starts the DNS server inside the VM.
pub async fn run_post_start(
    log: &Logger,
    runner: &dyn RemoteRunner,
    services: &dyn ServiceCommander,
    ctx: &DnsContext<'_>,
) -> Result<(), DnsError> {
    let config = dnsmasq_config(ctx)?;
    debug!(log, "writing dnsmasq configuration"; "path" => DNSMASQ_CONF_PATH);
    runner
        .run(&format!(
            "cat <<EOF | sudo tee {DNSMASQ_CONF_PATH}\n{config}EOF"
        ))
        .await
        .map_err(DnsError::Configure)?;
    services.restart(DNSMASQ_SERVICE).await?;
    Ok(())
}

/// Resolves a name under the apps domain from inside the VM, returning the
/// query output.
pub async fn check_internal_dns(
    runner: &dyn RemoteRunner,
    metadata: &BundleMetadata,
) -> Result<String, RunnerError> {
    runner
        .run(&format!("host -R 3 foo.{}", metadata.cluster_info.apps_domain))
        .await
}

/// Resolves a public name from inside the VM, returning the query output.
pub async fn check_public_dns(
    runner: &dyn RemoteRunner,
) -> Result<String, RunnerError> {
    runner.run(&format!("host -R 3 {PUBLIC_QUERY_NAME}")).await
}
