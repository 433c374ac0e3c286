// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Simulated backend
//!
//! Stands in for a hypervisor, the VM and the cluster inside it. VM state is
//! persisted next to the instance record so that separate invocations see the
//! same machine; everything else lives for as long as the [`SimBackend`].
//! Every call made to a simulated collaborator is appended to one ordered
//! event log, along with the time it was made.

mod cluster;
mod driver;
mod network;
mod runner;

pub use cluster::SimCluster;
pub use driver::{SimDriver, SimDriverFactory, SIM_DRIVER_NAME};
pub use network::SimHostNetwork;
pub use runner::{SimKeyGenerator, SimRunner};

use crate::backend::Backend;
use crate::bundle::{BundleResolver, DirBundleResolver};
use crate::cluster::{ClusterApiClient, OperatorsStatus};
use crate::config::Paths;
use crate::network::HostNetwork;
use crate::ssh::{KeyGenerator, RemoteRunner};
use crate::store::{FileInstanceStore, InstanceStore};
use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use slog::Logger;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::AtomicU32;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::time::Instant;

/// Behavior of the simulated machine.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct SimConfig {
    pub vm_ip: IpAddr,
    /// Host address on the network shared with the VM.
    pub host_ip: IpAddr,
    /// Host address lookups failing before one succeeds.
    pub host_ip_failures: u32,
    /// SSH connection attempts failing before one succeeds.
    pub ssh_failures: u32,
    pub certs_expired: bool,
    pub renewal_fails: bool,
    pub kubelet_active: bool,
    pub operators_unreachable: bool,
    pub operators: OperatorsStatus,
    /// Polls after which the proxy settings show up in the cluster; never
    /// when `None`.
    pub proxy_propagation_polls: Option<u32>,
    pub remove_fails: bool,
    /// Address lookups of a running VM fail.
    pub ip_lookup_fails: bool,
    pub internal_dns_fails: bool,
    pub public_dns_fails: bool,
    pub host_dns_fails: bool,
    /// Size of the VM's root filesystem, in bytes.
    pub disk_size: u64,
    pub disk_use: u64,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            vm_ip: Ipv4Addr::new(192, 168, 130, 11).into(),
            host_ip: Ipv4Addr::new(192, 168, 130, 1).into(),
            host_ip_failures: 0,
            ssh_failures: 0,
            certs_expired: false,
            renewal_fails: false,
            kubelet_active: true,
            operators_unreachable: false,
            operators: OperatorsStatus {
                available: true,
                degraded: false,
                progressing: false,
            },
            proxy_propagation_polls: Some(1),
            remove_fails: false,
            ip_lookup_fails: false,
            internal_dns_fails: false,
            public_dns_fails: false,
            host_dns_fails: false,
            disk_size: 32 << 30,
            disk_use: 15 << 30,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::Display)]
pub enum DriverOp {
    Create,
    Start,
    Stop,
    Kill,
    Remove,
    State,
    Ip,
}

impl DriverOp {
    /// True for operations that change the VM.
    pub fn is_mutation(&self) -> bool {
        matches!(
            self,
            DriverOp::Create
                | DriverOp::Start
                | DriverOp::Stop
                | DriverOp::Kill
                | DriverOp::Remove
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::Display)]
pub enum ClusterOp {
    RenewCertificates,
    AddPullSecret,
    UpdateClusterId,
    ApproveNodeCsr,
    OperatorsStatus,
    AddProxyConfig,
    ProxySettingsApplied,
    WaitForRequestHeaderClientCa,
    DeleteOpenshiftApiserverPods,
}

/// A call made to one of the simulated collaborators.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SimEvent {
    Driver { op: DriverOp, name: String },
    /// A command run in the VM. Commands run privately are recorded, but
    /// their text is not.
    Ssh { command: String, private: bool },
    Cluster(ClusterOp),
    HostIpQuery,
    HostDnsQuery,
    KeyGenerated { path: Utf8PathBuf },
    SetPrivateKey { path: Utf8PathBuf },
}

impl SimEvent {
    /// The command, for commands run in the VM.
    pub fn command(&self) -> Option<&str> {
        match self {
            SimEvent::Ssh { command, .. } => Some(command),
            _ => None,
        }
    }
}

/// State shared by the collaborators of one [`SimBackend`].
#[derive(Debug)]
pub(crate) struct SimState {
    pub(crate) log: Logger,
    pub(crate) config: SimConfig,
    events: Mutex<Vec<(Instant, SimEvent)>>,
    pub(crate) ssh_attempts: AtomicU32,
    pub(crate) host_ip_queries: AtomicU32,
    pub(crate) proxy_polls: AtomicU32,
    pub(crate) nameservers: Mutex<Vec<IpAddr>>,
}

impl SimState {
    fn new(log: Logger, config: SimConfig) -> Self {
        let nameservers = Mutex::new(vec![config.host_ip]);
        Self {
            log,
            config,
            events: Mutex::new(Vec::new()),
            ssh_attempts: AtomicU32::new(0),
            host_ip_queries: AtomicU32::new(0),
            proxy_polls: AtomicU32::new(0),
            nameservers,
        }
    }

    pub(crate) fn record(&self, event: SimEvent) {
        lock(&self.events).push((Instant::now(), event));
    }
}

/// Locks `mutex`, ignoring poisoning: the simulated state stays meaningful
/// even if a holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// [`Backend`] wiring the simulated collaborators together.
pub struct SimBackend {
    state: Arc<SimState>,
    store: Arc<FileInstanceStore>,
    bundles: Arc<DirBundleResolver>,
    key_generator: Arc<dyn KeyGenerator>,
}

impl SimBackend {
    pub fn new(log: &Logger, config: SimConfig, paths: &Paths) -> Self {
        let log = log.new(o!("component" => "SimBackend"));
        let state = Arc::new(SimState::new(log, config));
        let drivers = Arc::new(SimDriverFactory::new(
            paths.machines_dir(),
            state.clone(),
        ));
        Self {
            store: Arc::new(FileInstanceStore::new(
                paths.machines_dir(),
                drivers,
            )),
            bundles: Arc::new(DirBundleResolver::new(paths.cache_dir())),
            key_generator: Arc::new(SimKeyGenerator::new(state.clone())),
            state,
        }
    }

    /// Uses `key_generator` instead of the simulated one.
    pub fn with_key_generator(
        mut self,
        key_generator: Arc<dyn KeyGenerator>,
    ) -> Self {
        self.key_generator = key_generator;
        self
    }

    pub fn config(&self) -> &SimConfig {
        &self.state.config
    }

    /// Every call recorded so far, oldest first.
    pub fn events(&self) -> Vec<SimEvent> {
        self.timed_events().into_iter().map(|(_, event)| event).collect()
    }

    /// Like [`SimBackend::events`], with the time of each call.
    pub fn timed_events(&self) -> Vec<(Instant, SimEvent)> {
        lock(&self.state.events).clone()
    }

    /// Recorded driver calls which changed a VM.
    pub fn driver_mutations(&self) -> Vec<SimEvent> {
        self.events()
            .into_iter()
            .filter(|event| {
                matches!(event, SimEvent::Driver { op, .. } if op.is_mutation())
            })
            .collect()
    }
}

impl Backend for SimBackend {
    fn driver_name(&self) -> &str {
        SIM_DRIVER_NAME
    }

    fn instance_store(&self) -> Arc<dyn InstanceStore> {
        self.store.clone()
    }

    fn bundles(&self) -> Arc<dyn BundleResolver> {
        self.bundles.clone()
    }

    fn remote_runner(
        &self,
        name: &str,
        _ip: IpAddr,
        private_key: &Utf8Path,
    ) -> Arc<dyn RemoteRunner> {
        Arc::new(SimRunner::new(name, private_key, self.state.clone()))
    }

    fn cluster_client(
        &self,
        _runner: Arc<dyn RemoteRunner>,
    ) -> Arc<dyn ClusterApiClient> {
        Arc::new(SimCluster::new(self.state.clone()))
    }

    fn host_network(&self) -> Arc<dyn HostNetwork> {
        Arc::new(SimHostNetwork::new(self.state.clone()))
    }

    fn key_generator(&self) -> Arc<dyn KeyGenerator> {
        self.key_generator.clone()
    }
}
