// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Inputs of the lifecycle commands and on-disk path conventions.

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use snc_common::backoff::RetryPolicy;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

/// Name of the instance when none is given.
pub const DEFAULT_NAME: &str = "snc";

/// Default CPU count of a new instance.
pub const DEFAULT_CPUS: u32 = 4;

/// Default memory size of a new instance, in MiB.
pub const DEFAULT_MEMORY_MIB: u64 = 9216;

/// Locations of everything the controller keeps on the host.
#[derive(Clone, Debug)]
pub struct Paths {
    base_dir: Utf8PathBuf,
}

impl Paths {
    pub fn new(base_dir: impl Into<Utf8PathBuf>) -> Self {
        Self { base_dir: base_dir.into() }
    }

    pub fn base_dir(&self) -> &Utf8Path {
        &self.base_dir
    }

    pub fn machines_dir(&self) -> Utf8PathBuf {
        self.base_dir.join("machines")
    }

    pub fn instance_dir(&self, name: &str) -> Utf8PathBuf {
        self.machines_dir().join(name)
    }

    /// Extracted bundles, one directory per bundle.
    pub fn cache_dir(&self) -> Utf8PathBuf {
        self.base_dir.join("cache")
    }

    /// Key generated on first boot, replacing the bundle's key.
    pub fn private_key_path(&self, name: &str) -> Utf8PathBuf {
        self.instance_dir(name).join("id_ecdsa")
    }

    pub fn kubeconfig_path(&self, name: &str) -> Utf8PathBuf {
        self.instance_dir(name).join("kubeconfig")
    }

    pub fn log_file(&self) -> Utf8PathBuf {
        self.base_dir.join("snc.log")
    }
}

/// Parameters for creating a new instance. Only meaningful before creation.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct MachineConfig {
    pub name: String,
    pub bundle_name: String,
    pub driver_name: String,
    pub cpus: u32,
    pub memory_mib: u64,
    pub disk_path: Utf8PathBuf,
    pub kernel_path: Option<Utf8PathBuf>,
    pub initramfs_path: Option<Utf8PathBuf>,
    pub kernel_cmdline: Option<String>,
    pub ssh_key_path: Utf8PathBuf,
}

pub type PullSecretError = Box<dyn std::error::Error + Send + Sync>;

/// Supplies the user's pull secret. Only consulted when a new instance is
/// created.
pub trait PullSecretProvider: Send + Sync {
    fn pull_secret(&self) -> Result<String, PullSecretError>;
}

impl<F> PullSecretProvider for F
where
    F: Fn() -> Result<String, PullSecretError> + Send + Sync,
{
    fn pull_secret(&self) -> Result<String, PullSecretError> {
        self()
    }
}

/// Inputs of `start`.
#[derive(Clone)]
pub struct StartConfig {
    pub name: String,
    pub bundle_path: Utf8PathBuf,
    pub cpus: u32,
    pub memory_mib: u64,
    /// Extra nameserver to configure inside the instance.
    pub nameserver: Option<IpAddr>,
    pub pull_secret: Arc<dyn PullSecretProvider>,
}

impl std::fmt::Debug for StartConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StartConfig")
            .field("name", &self.name)
            .field("bundle_path", &self.bundle_path)
            .field("cpus", &self.cpus)
            .field("memory_mib", &self.memory_mib)
            .field("nameserver", &self.nameserver)
            .finish_non_exhaustive()
    }
}

/// Wait budgets of the start sequence.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct Tunables {
    pub ssh_retry: RetryPolicy,
    pub host_ip_retry: RetryPolicy,
    pub proxy_propagation_retry: RetryPolicy,
    /// Unconditional pause letting the control plane settle after kubelet
    /// (re)starts.
    pub settle_delay: Duration,
}

impl Default for Tunables {
    fn default() -> Self {
        Self {
            ssh_retry: RetryPolicy::new(60, Duration::from_secs(1)),
            host_ip_retry: RetryPolicy::new(30, Duration::from_secs(2)),
            proxy_propagation_retry: RetryPolicy::new(
                60,
                Duration::from_secs(2),
            ),
            settle_delay: Duration::from_secs(3 * 60),
        }
    }
}
