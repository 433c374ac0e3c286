// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The cluster running inside the VM: its API, and the node-level checks and
//! configuration done over SSH.

use crate::bundle::BundleMetadata;
use crate::ssh::{RemoteRunner, RunnerError};
use crate::Error;
use async_trait::async_trait;
use camino::Utf8PathBuf;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use snc_common::proxy::{resolve_proxy_config, ProxyConfig};
use uuid::Uuid;

/// Client certificate the kubelet authenticates to the API server with. It
/// expires together with the rest of the cluster's certificates.
pub const KUBELET_CLIENT_CERT: &str =
    "/var/lib/kubelet/pki/kubelet-client-current.pem";

/// Services which must see the proxy settings.
const PROXIED_SERVICES: [&str; 2] = ["crio", "kubelet"];

#[derive(thiserror::Error, Debug)]
pub enum ClusterError {
    #[error("cluster API request '{operation}' failed: {message}")]
    Api { operation: &'static str, message: String },

    #[error("proxy changes for the cluster are still in progress")]
    ProxyPropagationPending,

    #[error(transparent)]
    Runner(#[from] RunnerError),

    #[error("unexpected certificate expiry output '{output}'")]
    CertificateDate { output: String },

    #[error("unexpected disk usage output '{output}'")]
    DiskUsage { output: String },
}

/// Whether the cluster's certificates are still valid.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CertExpiryState {
    Valid,
    Expired,
}

/// Aggregated condition of the cluster operators.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct OperatorsStatus {
    pub available: bool,
    pub degraded: bool,
    pub progressing: bool,
}

impl OperatorsStatus {
    /// User-facing summary, checked in the order available, degraded,
    /// progressing.
    pub fn describe(&self, version: Option<&str>) -> String {
        if self.available {
            format!("Running (v{})", version.unwrap_or("4.x"))
        } else if self.degraded {
            "Degraded".to_string()
        } else if self.progressing {
            "Starting".to_string()
        } else {
            "Stopped".to_string()
        }
    }
}

/// Requests against the cluster API.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ClusterApiClient: Send + Sync {
    /// Renews expired cluster certificates. May take several minutes.
    async fn renew_certificates(&self) -> Result<(), ClusterError>;

    async fn add_pull_secret(&self, pull_secret: &str)
        -> Result<(), ClusterError>;

    async fn update_cluster_id(&self, id: Uuid) -> Result<(), ClusterError>;

    async fn approve_node_csr(&self) -> Result<(), ClusterError>;

    async fn operators_status(&self) -> Result<OperatorsStatus, ClusterError>;

    async fn add_proxy_config(
        &self,
        proxy: &ProxyConfig,
    ) -> Result<(), ClusterError>;

    /// True once the operator `package` in `namespace` runs with `proxy`.
    async fn proxy_settings_applied(
        &self,
        proxy: &ProxyConfig,
        package: &str,
        namespace: &str,
    ) -> Result<bool, ClusterError>;

    /// Waits until the request-header client CA has been published.
    async fn wait_for_request_header_client_ca(
        &self,
    ) -> Result<(), ClusterError>;

    async fn delete_openshift_apiserver_pods(&self)
        -> Result<(), ClusterError>;
}

/// How to reach and log into the cluster.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct ClusterConfig {
    pub kubeconfig: Utf8PathBuf,
    pub kubeadmin_password: String,
    pub web_console_url: String,
    pub cluster_api: String,
    pub proxy: ProxyConfig,
}

impl ClusterConfig {
    pub async fn from_bundle(metadata: &BundleMetadata) -> Result<Self, Error> {
        let kubeadmin_password = metadata.kubeadmin_password().await?;
        let proxy = resolve_proxy_config(&metadata.cluster_info.base_domain)?;
        Ok(Self {
            kubeconfig: metadata.kubeconfig_path(),
            kubeadmin_password,
            web_console_url: metadata.web_console_url(),
            cluster_api: metadata.cluster_api_url(),
            proxy,
        })
    }
}

/// Checks whether the cluster certificates have expired as of `now`.
pub async fn check_certs_validity(
    runner: &dyn RemoteRunner,
    now: DateTime<Utc>,
) -> Result<CertExpiryState, ClusterError> {
    let output = runner
        .run(&format!(
            "sudo openssl x509 -noout -enddate -in {KUBELET_CLIENT_CERT}"
        ))
        .await?;
    let not_after = parse_not_after(&output)?;
    if not_after <= now {
        Ok(CertExpiryState::Expired)
    } else {
        Ok(CertExpiryState::Valid)
    }
}

// openssl prints e.g. "notAfter=Oct  5 08:00:00 2024 GMT".
fn parse_not_after(output: &str) -> Result<DateTime<Utc>, ClusterError> {
    let invalid = || ClusterError::CertificateDate { output: output.to_string() };
    let date = output.trim().strip_prefix("notAfter=").ok_or_else(invalid)?;
    let date = date.split_whitespace().collect::<Vec<_>>().join(" ");
    NaiveDateTime::parse_from_str(&date, "%b %d %H:%M:%S %Y GMT")
        .map(|naive| naive.and_utc())
        .map_err(|_| invalid())
}

/// Size and usage of the VM's root filesystem, in bytes.
pub async fn root_partition_usage(
    runner: &dyn RemoteRunner,
) -> Result<(u64, u64), ClusterError> {
    let output =
        runner.run("df -B1 --output=size,used /sysroot | tail -1").await?;
    let invalid = || ClusterError::DiskUsage { output: output.clone() };
    let mut fields = output.split_whitespace().map(str::parse::<u64>);
    match (fields.next(), fields.next(), fields.next()) {
        (Some(Ok(size)), Some(Ok(used)), None) => Ok((size, used)),
        _ => Err(invalid()),
    }
}

fn proxy_drop_in(proxy: &ProxyConfig) -> String {
    let mut unit = String::from("[Service]\n");
    if let Some(http_proxy) = &proxy.http_proxy {
        unit.push_str(&format!("Environment=HTTP_PROXY={http_proxy}\n"));
    }
    if let Some(https_proxy) = &proxy.https_proxy {
        unit.push_str(&format!("Environment=HTTPS_PROXY={https_proxy}\n"));
    }
    unit.push_str(&format!("Environment=NO_PROXY={}\n", proxy.no_proxy_string()));
    unit
}

/// Makes crio and the kubelet use the proxy. The services must be restarted
/// to pick the settings up.
pub async fn add_proxy_to_kubelet_and_crio(
    runner: &dyn RemoteRunner,
    proxy: &ProxyConfig,
) -> Result<(), ClusterError> {
    let drop_in = proxy_drop_in(proxy);
    for service in PROXIED_SERVICES {
        let dir = format!("/etc/systemd/system/{service}.service.d");
        // Proxy URLs may embed credentials.
        runner
            .run_private(&format!(
                "sudo mkdir -p {dir} && \
                 cat <<EOF | sudo tee {dir}/10-default-env.conf\n{drop_in}EOF"
            ))
            .await?;
    }
    Ok(())
}
