// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Lifecycle commands of an instance.

use crate::backend::Backend;
use crate::cluster::ClusterConfig;
use crate::config::{Paths, Tunables};
use crate::driver::VmState;
use serde::Serialize;
use slog::Logger;
use std::net::IpAddr;
use std::sync::Arc;

mod lifecycle;
mod start;

/// Outcome of a successful `start`.
#[derive(Clone, Debug, Serialize)]
pub struct StartResult {
    pub name: String,
    pub kubelet_started: bool,
    /// Absent when the instance was already running.
    pub cluster_config: Option<ClusterConfig>,
    /// State of the VM, as reported by the driver.
    pub status: String,
    pub openshift_version: Option<String>,
}

#[derive(Clone, Debug, Serialize)]
pub struct StopResult {
    pub name: String,
    pub success: bool,
    /// State of the VM before it was stopped, when the driver could tell.
    pub state: Option<VmState>,
}

#[derive(Clone, Debug, Serialize)]
pub struct PowerOffResult {
    pub name: String,
    pub success: bool,
}

#[derive(Clone, Debug, Serialize)]
pub struct DeleteResult {
    pub name: String,
    pub success: bool,
}

#[derive(Clone, Debug, Serialize)]
pub struct IpResult {
    pub name: String,
    pub success: bool,
    pub ip: IpAddr,
}

#[derive(Clone, Debug, Serialize)]
pub struct StatusResult {
    pub name: String,
    pub success: bool,
    pub vm_status: String,
    pub openshift_status: String,
    /// Bytes used on the VM's root filesystem.
    pub disk_use: u64,
    /// Size in bytes of the VM's root filesystem.
    pub disk_size: u64,
}

#[derive(Clone, Debug, Serialize)]
pub struct ConsoleResult {
    pub name: String,
    pub success: bool,
    pub cluster_config: ClusterConfig,
    pub state: VmState,
}

/// Entry point to the lifecycle commands.
///
/// Every command runs to completion on its own: it acquires the instance
/// store and driver from the backend, and releases them before returning.
/// Concurrent commands against the same instance are not serialized.
pub struct Machine {
    log: Logger,
    backend: Arc<dyn Backend>,
    paths: Paths,
    tunables: Tunables,
}

impl Machine {
    pub fn new(
        log: &Logger,
        backend: Arc<dyn Backend>,
        paths: Paths,
        tunables: Tunables,
    ) -> Self {
        Self { log: log.new(o!("component" => "Machine")), backend, paths, tunables }
    }

    pub fn paths(&self) -> &Paths {
        &self.paths
    }

    fn command_log(&self, command: &'static str, name: &str) -> Logger {
        self.log.new(o!(
            "command" => command,
            "instance" => name.to_string(),
        ))
    }
}
