// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Interface to the hypervisor driver running the instance.

use crate::config::MachineConfig;
use async_trait::async_trait;
use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

#[derive(thiserror::Error, Debug)]
pub enum DriverError {
    #[error("no driver named '{0}' is available")]
    UnknownDriver(String),

    #[error("machine '{name}' does not exist")]
    NotFound { name: String },

    #[error("failed to {action} machine '{name}': {message}")]
    Operation { action: &'static str, name: String, message: String },

    #[error("invalid driver configuration: {0}")]
    Config(#[from] serde_json::Error),

    #[error("driver I/O error on {path}: {err}")]
    Io {
        path: Utf8PathBuf,
        #[source]
        err: std::io::Error,
    },
}

/// State of the VM, as reported by the driver.
///
/// The driver is authoritative: the state is always read back from it rather
/// than cached.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Deserialize,
    Serialize,
    strum::Display,
    strum::EnumString,
)]
pub enum VmState {
    Running,
    Stopped,
    Saved,
    Paused,
    Error,
    Timeout,
    Missing,
}

impl VmState {
    pub fn is_running(&self) -> bool {
        matches!(self, VmState::Running)
    }
}

/// Capability interface of a hypervisor backend, bound to one instance.
#[async_trait]
pub trait Driver: Send + Sync {
    /// Identifier of the backend implementing this driver.
    fn driver_name(&self) -> &str;

    /// Serialized driver configuration, persisted in the instance record.
    fn raw_config(&self) -> Result<serde_json::Value, DriverError>;

    /// Provisions the VM described by this driver's configuration and boots
    /// it.
    async fn create(&self) -> Result<(), DriverError>;

    async fn start(&self) -> Result<(), DriverError>;

    /// Gracefully shuts the VM down.
    async fn stop(&self) -> Result<(), DriverError>;

    /// Forcefully powers the VM off.
    async fn kill(&self) -> Result<(), DriverError>;

    /// Destroys the VM and everything the driver allocated for it.
    async fn remove(&self) -> Result<(), DriverError>;

    async fn state(&self) -> Result<VmState, DriverError>;

    async fn ip(&self) -> Result<IpAddr, DriverError>;

    /// Name of the bundle the VM was created from, if recorded.
    fn bundle_name(&self) -> Option<String>;
}

/// Builds drivers, either for a new instance or from a persisted record.
pub trait DriverFactory: Send + Sync {
    fn new_driver(
        &self,
        config: &MachineConfig,
    ) -> Result<Box<dyn Driver>, DriverError>;

    fn load_driver(
        &self,
        name: &str,
        driver_name: &str,
        raw: serde_json::Value,
    ) -> Result<Box<dyn Driver>, DriverError>;
}

/// An instance together with the driver managing its VM.
pub struct Instance {
    pub name: String,
    pub driver: Box<dyn Driver>,
}

impl std::fmt::Debug for Instance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instance")
            .field("name", &self.name)
            .field("driver", &self.driver.driver_name())
            .finish()
    }
}
