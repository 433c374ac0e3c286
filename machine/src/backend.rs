// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Wiring of the collaborators used by the lifecycle commands.

use crate::bundle::BundleResolver;
use crate::cluster::ClusterApiClient;
use crate::network::HostNetwork;
use crate::ssh::{KeyGenerator, RemoteRunner};
use crate::store::InstanceStore;
use crate::systemd::{ServiceCommander, SystemdCommander};
use camino::Utf8Path;
use std::net::IpAddr;
use std::sync::Arc;

/// Supplies the implementations of every collaborator interface.
///
/// Lifecycle commands acquire what they need from the backend when they start
/// and drop it before returning; nothing is kept across commands.
pub trait Backend: Send + Sync {
    /// Driver used when creating new instances.
    fn driver_name(&self) -> &str;

    fn instance_store(&self) -> Arc<dyn InstanceStore>;

    fn bundles(&self) -> Arc<dyn BundleResolver>;

    /// Runner executing commands in the VM of instance `name`, reachable at
    /// `ip` with the key at `private_key`.
    fn remote_runner(
        &self,
        name: &str,
        ip: IpAddr,
        private_key: &Utf8Path,
    ) -> Arc<dyn RemoteRunner>;

    fn service_commander(
        &self,
        runner: Arc<dyn RemoteRunner>,
    ) -> Arc<dyn ServiceCommander> {
        Arc::new(SystemdCommander::new(runner))
    }

    /// Client of the cluster API, reached through `runner`.
    fn cluster_client(
        &self,
        runner: Arc<dyn RemoteRunner>,
    ) -> Arc<dyn ClusterApiClient>;

    fn host_network(&self) -> Arc<dyn HostNetwork>;

    fn key_generator(&self) -> Arc<dyn KeyGenerator>;
}
