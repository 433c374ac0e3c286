// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Simulated hypervisor driver

use super::{DriverOp, SimEvent, SimState};
use crate::config::MachineConfig;
use crate::driver::{Driver, DriverError, DriverFactory, VmState};
use async_trait::async_trait;
use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::sync::Arc;

pub const SIM_DRIVER_NAME: &str = "sim";

/// File, in the instance directory, holding the state of the simulated VM.
const VM_STATE_FILE: &str = "sim-vm.json";

/// Persisted configuration of a simulated VM.
#[derive(Clone, Debug, Deserialize, Serialize)]
struct SimDriverConfig {
    name: String,
    bundle_name: String,
    cpus: u32,
    memory_mib: u64,
    disk_path: Utf8PathBuf,
    state_file: Utf8PathBuf,
}

#[derive(Debug, Deserialize, Serialize)]
struct VmRecord {
    state: VmState,
}

/// Driver of one simulated VM.
pub struct SimDriver {
    config: SimDriverConfig,
    sim: Arc<SimState>,
}

impl SimDriver {
    fn operation_error(&self, action: &'static str, message: &str) -> DriverError {
        DriverError::Operation {
            action,
            name: self.config.name.clone(),
            message: message.to_string(),
        }
    }

    fn record(&self, op: DriverOp) {
        debug!(self.sim.log, "driver call"; "op" => %op, "instance" => &self.config.name);
        self.sim.record(SimEvent::Driver { op, name: self.config.name.clone() });
    }

    async fn read_state(&self) -> Result<VmState, DriverError> {
        let path = &self.config.state_file;
        match tokio::fs::read(path).await {
            Ok(contents) => {
                let record: VmRecord = serde_json::from_slice(&contents)?;
                Ok(record.state)
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Ok(VmState::Missing)
            }
            Err(err) => Err(DriverError::Io { path: path.clone(), err }),
        }
    }

    async fn write_state(&self, state: VmState) -> Result<(), DriverError> {
        let path = &self.config.state_file;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|err| {
                DriverError::Io { path: parent.to_owned(), err }
            })?;
        }
        let contents = serde_json::to_vec(&VmRecord { state })?;
        tokio::fs::write(path, contents)
            .await
            .map_err(|err| DriverError::Io { path: path.clone(), err })
    }
}

#[async_trait]
impl Driver for SimDriver {
    fn driver_name(&self) -> &str {
        SIM_DRIVER_NAME
    }

    fn raw_config(&self) -> Result<serde_json::Value, DriverError> {
        Ok(serde_json::to_value(&self.config)?)
    }

    async fn create(&self) -> Result<(), DriverError> {
        self.record(DriverOp::Create);
        if self.read_state().await? != VmState::Missing {
            return Err(self.operation_error("create", "VM already exists"));
        }
        self.write_state(VmState::Running).await
    }

    async fn start(&self) -> Result<(), DriverError> {
        self.record(DriverOp::Start);
        match self.read_state().await? {
            VmState::Missing => {
                Err(self.operation_error("start", "VM does not exist"))
            }
            _ => self.write_state(VmState::Running).await,
        }
    }

    async fn stop(&self) -> Result<(), DriverError> {
        self.record(DriverOp::Stop);
        match self.read_state().await? {
            VmState::Missing => {
                Err(self.operation_error("stop", "VM does not exist"))
            }
            _ => self.write_state(VmState::Stopped).await,
        }
    }

    async fn kill(&self) -> Result<(), DriverError> {
        self.record(DriverOp::Kill);
        match self.read_state().await? {
            VmState::Missing => {
                Err(self.operation_error("kill", "VM does not exist"))
            }
            _ => self.write_state(VmState::Stopped).await,
        }
    }

    async fn remove(&self) -> Result<(), DriverError> {
        self.record(DriverOp::Remove);
        if self.sim.config.remove_fails {
            return Err(self.operation_error("remove", "simulated failure"));
        }
        let path = &self.config.state_file;
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(DriverError::Io { path: path.clone(), err }),
        }
    }

    async fn state(&self) -> Result<VmState, DriverError> {
        self.record(DriverOp::State);
        self.read_state().await
    }

    async fn ip(&self) -> Result<IpAddr, DriverError> {
        self.record(DriverOp::Ip);
        if !self.read_state().await?.is_running() {
            return Err(self.operation_error("ip", "VM is not running"));
        }
        if self.sim.config.ip_lookup_fails {
            return Err(self.operation_error("ip", "no DHCP lease"));
        }
        Ok(self.sim.config.vm_ip)
    }

    fn bundle_name(&self) -> Option<String> {
        Some(self.config.bundle_name.clone())
    }
}

/// Builds [`SimDriver`]s keeping their state under `machines_dir`.
pub struct SimDriverFactory {
    machines_dir: Utf8PathBuf,
    sim: Arc<SimState>,
}

impl SimDriverFactory {
    pub(crate) fn new(machines_dir: Utf8PathBuf, sim: Arc<SimState>) -> Self {
        Self { machines_dir, sim }
    }
}

impl DriverFactory for SimDriverFactory {
    fn new_driver(
        &self,
        config: &MachineConfig,
    ) -> Result<Box<dyn Driver>, DriverError> {
        if config.driver_name != SIM_DRIVER_NAME {
            return Err(DriverError::UnknownDriver(config.driver_name.clone()));
        }
        let config = SimDriverConfig {
            name: config.name.clone(),
            bundle_name: config.bundle_name.clone(),
            cpus: config.cpus,
            memory_mib: config.memory_mib,
            disk_path: config.disk_path.clone(),
            state_file: self.machines_dir.join(&config.name).join(VM_STATE_FILE),
        };
        Ok(Box::new(SimDriver { config, sim: self.sim.clone() }))
    }

    fn load_driver(
        &self,
        _name: &str,
        driver_name: &str,
        raw: serde_json::Value,
    ) -> Result<Box<dyn Driver>, DriverError> {
        if driver_name != SIM_DRIVER_NAME {
            return Err(DriverError::UnknownDriver(driver_name.to_string()));
        }
        let config: SimDriverConfig = serde_json::from_value(raw)?;
        Ok(Box::new(SimDriver { config, sim: self.sim.clone() }))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::sim::SimConfig;
    use camino_tempfile::Utf8TempDir;
    use slog::Logger;

    fn factory(dir: &Utf8TempDir, config: SimConfig) -> SimDriverFactory {
        let log = Logger::root(slog::Discard, o!());
        SimDriverFactory::new(
            dir.path().to_owned(),
            Arc::new(SimState::new(log, config)),
        )
    }

    fn machine_config() -> MachineConfig {
        MachineConfig {
            name: "demo".to_string(),
            bundle_name: "snc_libvirt_4.17.0.crcbundle".to_string(),
            driver_name: SIM_DRIVER_NAME.to_string(),
            cpus: 4,
            memory_mib: 9216,
            disk_path: "/cache/crc.qcow2".into(),
            kernel_path: None,
            initramfs_path: None,
            kernel_cmdline: None,
            ssh_key_path: "/cache/id_ecdsa_crc".into(),
        }
    }

    #[tokio::test]
    async fn test_state_survives_reload() {
        let dir = Utf8TempDir::new().unwrap();
        let factory = factory(&dir, SimConfig::default());
        let driver = factory.new_driver(&machine_config()).unwrap();
        assert_eq!(driver.state().await.unwrap(), VmState::Missing);

        driver.create().await.unwrap();
        driver.stop().await.unwrap();

        let raw = driver.raw_config().unwrap();
        let reloaded =
            factory.load_driver("demo", SIM_DRIVER_NAME, raw).unwrap();
        assert_eq!(reloaded.state().await.unwrap(), VmState::Stopped);
        assert!(reloaded.ip().await.is_err());
        assert_eq!(
            reloaded.bundle_name().as_deref(),
            Some("snc_libvirt_4.17.0.crcbundle")
        );

        reloaded.start().await.unwrap();
        assert_eq!(driver.ip().await.unwrap(), SimConfig::default().vm_ip);
    }

    #[tokio::test]
    async fn test_remove_failure() {
        let dir = Utf8TempDir::new().unwrap();
        let config = SimConfig { remove_fails: true, ..Default::default() };
        let driver = factory(&dir, config).new_driver(&machine_config()).unwrap();
        driver.create().await.unwrap();
        assert!(matches!(
            driver.remove().await,
            Err(DriverError::Operation { action: "remove", .. })
        ));
        assert_eq!(driver.state().await.unwrap(), VmState::Running);
    }
}
