// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Commands other than start.

use super::{
    ConsoleResult, DeleteResult, IpResult, Machine, PowerOffResult,
    StatusResult, StopResult,
};
use crate::bundle::BundleMetadata;
use crate::cluster::{self, ClusterConfig};
use crate::driver::{DriverError, Instance};
use crate::error::{CommandError, Error, StageExt};
use snc_common::proxy::{resolve_proxy_config, ProxyConfig};

const NOT_REACHABLE: &str = "Not Reachable";

impl Machine {
    /// Whether an instance named `name` has been created.
    pub async fn exists(&self, name: &str) -> Result<bool, CommandError> {
        self.backend
            .instance_store()
            .exists(name)
            .await
            .stage(name, "Cannot check if machine exists")
    }

    /// Shuts the VM down gracefully.
    pub async fn stop(&self, name: &str) -> Result<StopResult, CommandError> {
        let log = self.command_log("stop", name);
        let instance = self.load(name).await?;
        let state = instance.driver.state().await.ok();

        info!(log, "Stopping the instance, this may take a few minutes...");
        instance.driver.stop().await.stage(name, "Cannot stop machine")?;
        Ok(StopResult { name: name.to_string(), success: true, state })
    }

    /// Stops the VM immediately.
    pub async fn power_off(
        &self,
        name: &str,
    ) -> Result<PowerOffResult, CommandError> {
        let log = self.command_log("power_off", name);
        let instance = self.load(name).await?;

        info!(log, "Powering off the instance");
        instance.driver.kill().await.stage(name, "Cannot kill machine")?;
        Ok(PowerOffResult { name: name.to_string(), success: true })
    }

    /// Destroys the VM, then forgets the instance.
    pub async fn delete(
        &self,
        name: &str,
    ) -> Result<DeleteResult, CommandError> {
        let log = self.command_log("delete", name);
        let store = self.backend.instance_store();
        let instance = self.load(name).await?;

        // The record must outlive the VM, or a failed removal would leave a
        // VM nothing knows about.
        instance
            .driver
            .remove()
            .await
            .stage(name, "Driver cannot remove machine")?;
        store.remove(name).await.stage(name, "Cannot remove machine")?;
        info!(log, "Deleted the instance");
        Ok(DeleteResult { name: name.to_string(), success: true })
    }

    pub async fn ip(&self, name: &str) -> Result<IpResult, CommandError> {
        let instance = self.load(name).await?;
        let ip = instance.driver.ip().await.stage(name, "Cannot get IP")?;
        Ok(IpResult { name: name.to_string(), success: true, ip })
    }

    /// Reports the state of the VM and, when it runs, of the cluster.
    ///
    /// An unreachable cluster, or a VM whose address cannot be found, is
    /// reported in the result rather than as an error.
    pub async fn status(
        &self,
        name: &str,
    ) -> Result<StatusResult, CommandError> {
        let log = self.command_log("status", name);
        let exists = self.exists(name).await?;
        if !exists {
            return Err(CommandError::new(
                name,
                "Cannot load machine",
                DriverError::NotFound { name: name.to_string() },
            ));
        }
        let instance = self.load(name).await?;
        let vm_state = instance
            .driver
            .state()
            .await
            .stage(name, "Cannot get machine state")?;

        if !vm_state.is_running() {
            return Ok(StatusResult {
                name: name.to_string(),
                success: true,
                vm_status: vm_state.to_string(),
                openshift_status: "Stopped".to_string(),
                disk_use: 0,
                disk_size: 0,
            });
        }

        let metadata = self.instance_bundle(name, &instance).await?;
        let proxy = resolve_proxy_config(&metadata.cluster_info.base_domain)
            .stage(name, "Error getting proxy configuration")?;
        let _proxy_env = proxy.apply_to_environment();

        let ip = match instance.driver.ip().await {
            Ok(ip) => ip,
            Err(err) => {
                debug!(log, "cannot get instance IP"; "error" => %err);
                return Ok(StatusResult {
                    name: name.to_string(),
                    success: true,
                    vm_status: vm_state.to_string(),
                    openshift_status: NOT_REACHABLE.to_string(),
                    disk_use: 0,
                    disk_size: 0,
                });
            }
        };
        let runner = self.backend.remote_runner(
            name,
            ip,
            &self.paths.private_key_path(name),
        );
        let cluster = self.backend.cluster_client(runner.clone());

        let openshift_status = match cluster.operators_status().await {
            Ok(status) => status.describe(metadata.openshift_version()),
            Err(err) => {
                debug!(log, "cannot get cluster operators status"; "error" => %err);
                NOT_REACHABLE.to_string()
            }
        };
        let (disk_size, disk_use) = cluster::root_partition_usage(
            runner.as_ref(),
        )
        .await
        .stage(name, "Cannot get root partition usage")?;

        Ok(StatusResult {
            name: name.to_string(),
            success: true,
            vm_status: vm_state.to_string(),
            openshift_status,
            disk_use,
            disk_size,
        })
    }

    /// Proxy settings the instance's cluster runs with.
    pub async fn proxy_config(
        &self,
        name: &str,
    ) -> Result<ProxyConfig, CommandError> {
        Ok(self.cluster_config(name).await?.proxy)
    }

    /// Login details of the cluster.
    pub async fn console_url(
        &self,
        name: &str,
    ) -> Result<ConsoleResult, CommandError> {
        let instance = self.load(name).await?;
        let state = instance
            .driver
            .state()
            .await
            .stage(name, "Error getting the state for host")?;
        let metadata = self.instance_bundle(name, &instance).await?;
        let cluster_config = ClusterConfig::from_bundle(&metadata)
            .await
            .stage(name, "Error loading cluster configuration")?;
        Ok(ConsoleResult {
            name: name.to_string(),
            success: true,
            cluster_config,
            state,
        })
    }

    async fn cluster_config(
        &self,
        name: &str,
    ) -> Result<ClusterConfig, CommandError> {
        let instance = self.load(name).await?;
        let metadata = self.instance_bundle(name, &instance).await?;
        ClusterConfig::from_bundle(&metadata)
            .await
            .stage(name, "Error loading cluster configuration")
    }

    async fn load(&self, name: &str) -> Result<Instance, CommandError> {
        self.backend
            .instance_store()
            .load(name)
            .await
            .stage(name, "Cannot load machine")
    }

    /// Metadata of the bundle `instance` was created from.
    async fn instance_bundle(
        &self,
        name: &str,
        instance: &Instance,
    ) -> Result<BundleMetadata, CommandError> {
        let bundle = instance
            .driver
            .bundle_name()
            .filter(|bundle| !bundle.is_empty())
            .ok_or(Error::MissingBundleName)
            .stage(name, "Error loading bundle metadata")?;
        self.backend
            .bundles()
            .get_cached(&bundle)
            .await
            .stage(name, "Error loading bundle metadata")
    }
}
