// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Persisted records of the instances known to this host.

use crate::config::MachineConfig;
use crate::driver::{DriverError, DriverFactory, Instance};
use async_trait::async_trait;
use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

const RECORD_FILE: &str = "config.json";

#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("machine '{0}' does not exist")]
    NotFound(String),

    #[error("Failed to access instance record {path}: {err}")]
    Io {
        path: Utf8PathBuf,
        #[source]
        err: std::io::Error,
    },

    #[error("Failed to parse instance record {path}: {err}")]
    Parse {
        path: Utf8PathBuf,
        #[source]
        err: serde_json::Error,
    },

    #[error(transparent)]
    Driver(#[from] DriverError),
}

/// Storage of instance records, keyed by instance name.
#[async_trait]
pub trait InstanceStore: Send + Sync {
    async fn exists(&self, name: &str) -> Result<bool, StoreError>;

    /// Builds the driver for an instance that has not been created yet.
    /// Nothing is persisted until [`InstanceStore::save`].
    fn new_instance(
        &self,
        config: &MachineConfig,
    ) -> Result<Instance, StoreError>;

    async fn load(&self, name: &str) -> Result<Instance, StoreError>;

    async fn save(&self, instance: &Instance) -> Result<(), StoreError>;

    async fn remove(&self, name: &str) -> Result<(), StoreError>;
}

/// On-disk form of an instance.
#[derive(Debug, Deserialize, Serialize)]
struct InstanceRecord {
    name: String,
    driver_name: String,
    driver: serde_json::Value,
}

/// Keeps one JSON record per instance under `<machines_dir>/<name>/`.
pub struct FileInstanceStore {
    machines_dir: Utf8PathBuf,
    drivers: Arc<dyn DriverFactory>,
}

impl FileInstanceStore {
    pub fn new(
        machines_dir: impl Into<Utf8PathBuf>,
        drivers: Arc<dyn DriverFactory>,
    ) -> Self {
        Self { machines_dir: machines_dir.into(), drivers }
    }

    fn instance_dir(&self, name: &str) -> Utf8PathBuf {
        self.machines_dir.join(name)
    }

    fn record_path(&self, name: &str) -> Utf8PathBuf {
        self.instance_dir(name).join(RECORD_FILE)
    }
}

fn io_error(path: &Utf8Path) -> impl FnOnce(std::io::Error) -> StoreError + '_ {
    move |err| StoreError::Io { path: path.to_owned(), err }
}

#[async_trait]
impl InstanceStore for FileInstanceStore {
    async fn exists(&self, name: &str) -> Result<bool, StoreError> {
        let path = self.record_path(name);
        tokio::fs::try_exists(&path).await.map_err(io_error(&path))
    }

    fn new_instance(
        &self,
        config: &MachineConfig,
    ) -> Result<Instance, StoreError> {
        let driver = self.drivers.new_driver(config)?;
        Ok(Instance { name: config.name.clone(), driver })
    }

    async fn load(&self, name: &str) -> Result<Instance, StoreError> {
        let path = self.record_path(name);
        let contents = match tokio::fs::read(&path).await {
            Ok(contents) => contents,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound(name.to_string()));
            }
            Err(err) => return Err(StoreError::Io { path, err }),
        };
        let record: InstanceRecord = serde_json::from_slice(&contents)
            .map_err(|err| StoreError::Parse { path: path.clone(), err })?;
        let driver = self.drivers.load_driver(
            &record.name,
            &record.driver_name,
            record.driver,
        )?;
        Ok(Instance { name: record.name, driver })
    }

    async fn save(&self, instance: &Instance) -> Result<(), StoreError> {
        let dir = self.instance_dir(&instance.name);
        tokio::fs::create_dir_all(&dir).await.map_err(io_error(&dir))?;

        let record = InstanceRecord {
            name: instance.name.clone(),
            driver_name: instance.driver.driver_name().to_string(),
            driver: instance.driver.raw_config()?,
        };
        let path = self.record_path(&instance.name);
        let contents = serde_json::to_vec_pretty(&record)
            .map_err(|err| StoreError::Parse { path: path.clone(), err })?;

        // Write to a temporary file first so a crash never leaves a truncated
        // record behind.
        let tmp = dir.join(format!("{RECORD_FILE}.tmp"));
        tokio::fs::write(&tmp, contents).await.map_err(io_error(&tmp))?;
        tokio::fs::rename(&tmp, &path).await.map_err(io_error(&path))
    }

    async fn remove(&self, name: &str) -> Result<(), StoreError> {
        let dir = self.instance_dir(name);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(StoreError::Io { path: dir, err }),
        }
    }
}
