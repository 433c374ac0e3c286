// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Starting an instance.
//!
//! Start happens in two phases. Preparation creates the VM, or boots the
//! existing one, and gathers everything the second phase needs; it finishes
//! early if the VM is already running. The second phase configures the
//! booted VM and its cluster by interpreting [`POST_START_STEPS`] in order.
//! There is no rollback: a failed start is recovered by starting again.

use super::{Machine, StartResult};
use crate::bundle::{self, BundleMetadata};
use crate::cluster::{
    self, CertExpiryState, ClusterApiClient, ClusterConfig, ClusterError,
};
use crate::config::{MachineConfig, Paths, StartConfig, Tunables};
use crate::dns::{self, DnsContext};
use crate::driver::VmState;
use crate::error::{CommandError, Error, StageExt};
use crate::network::{self, HostNetwork, NetworkError};
use crate::ssh::{self, KeyGenerator, RemoteRunner};
use crate::systemd::ServiceCommander;
use camino::Utf8Path;
use chrono::Utc;
use slog::Logger;
use snc_common::backoff::{retry_after, retry_after_if, BackoffError};
use snc_common::proxy::{resolve_proxy_config, EnvironmentOverlay, ProxyConfig};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

const KUBELET: &str = "kubelet";
const CRIO: &str = "crio";

/// Operator whose pods show when the cluster-wide proxy has propagated.
const PROXY_PROBE_PACKAGE: &str = "redhat-operators";
const PROXY_PROBE_NAMESPACE: &str = "openshift-marketplace";

/// Bundles are built with certificates valid for this long.
const BUNDLE_CERT_VALIDITY_DAYS: i64 = 30;

/// Configuration steps run once the VM is booted.
#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::Display)]
pub(crate) enum PostStartStep {
    WaitForSsh,
    CheckCertificates,
    AddNameserver,
    DetermineHostIp,
    ApplyProxy,
    StartDns,
    CheckInternalDns,
    CheckPublicDns,
    CheckDnsFromHost,
    RotateSshKey,
    CopyKubeconfig,
    RenewCertificates,
    StartKubelet,
    ConfigureCluster,
    RefreshApiServer,
    Settle,
    ApproveNodeCsr,
    WaitForProxy,
}

pub(crate) const POST_START_STEPS: [PostStartStep; 18] = [
    PostStartStep::WaitForSsh,
    PostStartStep::CheckCertificates,
    PostStartStep::AddNameserver,
    PostStartStep::DetermineHostIp,
    PostStartStep::ApplyProxy,
    PostStartStep::StartDns,
    PostStartStep::CheckInternalDns,
    PostStartStep::CheckPublicDns,
    PostStartStep::CheckDnsFromHost,
    PostStartStep::RotateSshKey,
    PostStartStep::CopyKubeconfig,
    PostStartStep::RenewCertificates,
    PostStartStep::StartKubelet,
    PostStartStep::ConfigureCluster,
    PostStartStep::RefreshApiServer,
    PostStartStep::Settle,
    PostStartStep::ApproveNodeCsr,
    PostStartStep::WaitForProxy,
];

/// How a step ended, when it did not fail.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum StepOutcome {
    Done,
    /// Nothing to do for this instance.
    Skipped,
    /// The step failed in a way start tolerates.
    Recovered(String),
}

enum Prepared {
    /// The VM was already running; start is complete.
    AlreadyRunning(StartResult),
    Booted(Box<PostStart>),
}

/// State only present when the instance was created by this start.
struct FirstBoot {
    pull_secret: String,
}

/// Everything the post-start steps work with.
struct PostStart {
    log: Logger,
    name: String,
    paths: Paths,
    tunables: Tunables,
    metadata: BundleMetadata,
    cluster_config: ClusterConfig,
    vm_state: VmState,
    vm_ip: IpAddr,
    nameserver: Option<IpAddr>,
    first_boot: Option<FirstBoot>,

    runner: Arc<dyn RemoteRunner>,
    services: Arc<dyn ServiceCommander>,
    cluster: Arc<dyn ClusterApiClient>,
    host_network: Arc<dyn HostNetwork>,
    key_generator: Arc<dyn KeyGenerator>,

    needs_certs_renewal: bool,
    host_ip: Option<IpAddr>,
    proxy: ProxyConfig,
    // Restores the process environment when start returns.
    proxy_env: Option<EnvironmentOverlay>,
    kubelet_started: bool,
}

impl Machine {
    /// Creates or boots the instance and brings its cluster up.
    pub async fn start(
        &self,
        config: &StartConfig,
    ) -> Result<StartResult, CommandError> {
        let log = self.command_log("start", &config.name);
        let mut post_start = match self.prepare(&log, config).await? {
            Prepared::AlreadyRunning(result) => return Ok(result),
            Prepared::Booted(post_start) => post_start,
        };

        for step in POST_START_STEPS {
            match post_start.run(step).await? {
                StepOutcome::Recovered(reason) => {
                    debug!(log, "start step failed, continuing";
                        "step" => %step, "reason" => reason);
                }
                outcome => {
                    debug!(log, "start step finished";
                        "step" => %step, "outcome" => ?outcome);
                }
            }
        }
        Ok((*post_start).into_result())
    }

    async fn prepare(
        &self,
        log: &Logger,
        config: &StartConfig,
    ) -> Result<Prepared, CommandError> {
        let name = config.name.as_str();
        let store = self.backend.instance_store();
        let bundles = self.backend.bundles();
        let requested_bundle = bundle::bundle_name(&config.bundle_path)
            .stage(name, "Invalid bundle")?;

        let exists = store
            .exists(name)
            .await
            .stage(name, "Cannot check if machine exists")?;

        let (metadata, private_key, first_boot) = if !exists {
            let pull_secret = config
                .pull_secret
                .pull_secret()
                .map_err(Error::PullSecret)
                .stage(name, "Failed to get pull secret")?;

            let metadata =
                bundle::resolve(log, bundles.as_ref(), &config.bundle_path)
                    .await
                    .stage(name, "Error getting bundle metadata")?;

            let disk_path = metadata
                .disk_image_path()
                .stage(name, "Invalid bundle disk image")?;
            info!(log, "Checking size of the disk image {disk_path} ...");
            metadata.check_disk_image_size().await.stage(
                name,
                &format!("Invalid bundle disk image '{disk_path}'"),
            )?;

            match metadata.openshift_version() {
                Some(version) => {
                    info!(log, "Creating VM for OpenShift {version}...")
                }
                None => info!(log, "Creating VM..."),
            }
            let machine_config = MachineConfig {
                name: name.to_string(),
                bundle_name: requested_bundle,
                driver_name: self.backend.driver_name().to_string(),
                cpus: config.cpus,
                memory_mib: config.memory_mib,
                disk_path,
                kernel_path: metadata.kernel_path(),
                initramfs_path: metadata.initramfs_path(),
                kernel_cmdline: metadata.kernel_cmdline(),
                ssh_key_path: metadata.ssh_key_path(),
            };
            let instance = store
                .new_instance(&machine_config)
                .stage(name, "Error creating machine")?;
            instance
                .driver
                .create()
                .await
                .stage(name, "Error creating machine")?;
            store.save(&instance).await.stage(name, "Error creating machine")?;

            (
                metadata,
                machine_config.ssh_key_path,
                Some(FirstBoot { pull_secret }),
            )
        } else {
            let instance =
                store.load(name).await.stage(name, "Error loading machine")?;

            // Nothing may change on the VM before the bundle is known to
            // match.
            let existing = instance
                .driver
                .bundle_name()
                .filter(|bundle| !bundle.is_empty())
                .ok_or(Error::MissingBundleName)
                .stage(name, "Error loading bundle metadata")?;
            if existing != requested_bundle {
                debug!(
                    log,
                    "Bundle '{requested_bundle}' was requested, but the \
                     existing VM is using '{existing}'"
                );
                return Err(CommandError::new(
                    name,
                    "Invalid bundle",
                    Error::BundleMismatch {
                        requested: requested_bundle,
                        existing,
                    },
                ));
            }
            let metadata = bundles
                .get_cached(&existing)
                .await
                .stage(name, "Error loading bundle metadata")?;

            let state = instance
                .driver
                .state()
                .await
                .stage(name, "Error getting the machine state")?;
            let openshift_version =
                metadata.openshift_version().map(str::to_string);
            if state.is_running() {
                match &openshift_version {
                    Some(version) => info!(
                        log,
                        "A VM for OpenShift {version} is already running"
                    ),
                    None => info!(log, "A VM is already running"),
                }
                return Ok(Prepared::AlreadyRunning(StartResult {
                    name: name.to_string(),
                    kubelet_started: false,
                    cluster_config: None,
                    status: state.to_string(),
                    openshift_version,
                }));
            }

            match &openshift_version {
                Some(version) => {
                    info!(log, "Starting VM for OpenShift {version}...")
                }
                None => info!(log, "Starting VM ..."),
            }
            instance
                .driver
                .start()
                .await
                .stage(name, "Error starting stopped VM")?;
            store.save(&instance).await.stage(name, "Error saving state for VM")?;

            (metadata, self.paths.private_key_path(name), None)
        };

        let cluster_config = ClusterConfig::from_bundle(&metadata)
            .await
            .stage(name, "Cannot create cluster configuration")?;

        // Read everything back from the driver, which is authoritative.
        let instance = store
            .load(name)
            .await
            .stage(name, &format!("Error loading {name} vm"))?;
        let vm_state = instance
            .driver
            .state()
            .await
            .stage(name, "Error getting the state")?;
        let vm_ip =
            instance.driver.ip().await.stage(name, "Error getting the IP")?;

        let runner = self.backend.remote_runner(name, vm_ip, &private_key);
        Ok(Prepared::Booted(Box::new(PostStart {
            log: log.clone(),
            name: name.to_string(),
            paths: self.paths.clone(),
            tunables: self.tunables.clone(),
            proxy: cluster_config.proxy.clone(),
            metadata,
            cluster_config,
            vm_state,
            vm_ip,
            nameserver: config.nameserver,
            first_boot,
            services: self.backend.service_commander(runner.clone()),
            cluster: self.backend.cluster_client(runner.clone()),
            host_network: self.backend.host_network(),
            key_generator: self.backend.key_generator(),
            runner,
            needs_certs_renewal: false,
            host_ip: None,
            proxy_env: None,
            kubelet_started: false,
        })))
    }
}

impl PostStart {
    async fn run(
        &mut self,
        step: PostStartStep,
    ) -> Result<StepOutcome, CommandError> {
        match step {
            PostStartStep::WaitForSsh => self.wait_for_ssh().await,
            PostStartStep::CheckCertificates => self.check_certificates().await,
            PostStartStep::AddNameserver => self.add_nameserver().await,
            PostStartStep::DetermineHostIp => self.determine_host_ip().await,
            PostStartStep::ApplyProxy => self.apply_proxy(),
            PostStartStep::StartDns => self.start_dns().await,
            PostStartStep::CheckInternalDns => self.check_internal_dns().await,
            PostStartStep::CheckPublicDns => self.check_public_dns().await,
            PostStartStep::CheckDnsFromHost => self.check_dns_from_host().await,
            PostStartStep::RotateSshKey => self.rotate_ssh_key().await,
            PostStartStep::CopyKubeconfig => self.copy_kubeconfig().await,
            PostStartStep::RenewCertificates => {
                self.renew_certificates().await
            }
            PostStartStep::StartKubelet => self.start_kubelet().await,
            PostStartStep::ConfigureCluster => self.configure_cluster().await,
            PostStartStep::RefreshApiServer => {
                self.refresh_api_server().await
            }
            PostStartStep::Settle => {
                tokio::time::sleep(self.tunables.settle_delay).await;
                Ok(StepOutcome::Done)
            }
            PostStartStep::ApproveNodeCsr => self.approve_node_csr().await,
            PostStartStep::WaitForProxy => self.wait_for_proxy().await,
        }
    }

    fn into_result(self) -> StartResult {
        let openshift_version =
            self.metadata.openshift_version().map(str::to_string);
        StartResult {
            name: self.name,
            kubelet_started: self.kubelet_started,
            cluster_config: Some(self.cluster_config),
            status: self.vm_state.to_string(),
            openshift_version,
        }
    }

    async fn wait_for_ssh(&mut self) -> Result<StepOutcome, CommandError> {
        debug!(self.log, "Waiting until ssh is available");
        ssh::wait_for_ssh(
            &self.log,
            self.runner.as_ref(),
            &self.tunables.ssh_retry,
        )
        .await
        .stage(
            &self.name,
            "Failed to connect to the VM with SSH -- host might be unreachable",
        )?;
        info!(self.log, "VM is running");
        Ok(StepOutcome::Done)
    }

    async fn check_certificates(
        &mut self,
    ) -> Result<StepOutcome, CommandError> {
        info!(self.log, "Verifying validity of the cluster certificates ...");
        let state =
            cluster::check_certs_validity(self.runner.as_ref(), Utc::now())
                .await
                .stage(&self.name, "Failed to check certificate validity")?;
        match state {
            CertExpiryState::Valid => Ok(StepOutcome::Done),
            CertExpiryState::Expired => {
                self.needs_certs_renewal = true;
                Ok(StepOutcome::Recovered(
                    "cluster certificates have expired".to_string(),
                ))
            }
        }
    }

    async fn add_nameserver(&mut self) -> Result<StepOutcome, CommandError> {
        let Some(nameserver) = self.nameserver else {
            return Ok(StepOutcome::Skipped);
        };
        network::add_nameserver_to_instance(
            &self.log,
            self.runner.as_ref(),
            nameserver,
        )
        .await
        .stage(&self.name, "Failed to add nameserver to the VM")?;
        Ok(StepOutcome::Done)
    }

    async fn determine_host_ip(&mut self) -> Result<StepOutcome, CommandError> {
        let log = &self.log;
        let host_network = &self.host_network;
        let vm_ip = self.vm_ip;
        let host_ip = retry_after_if(
            &self.tunables.host_ip_retry,
            || host_network.determine_host_ip(vm_ip),
            |_| true,
            |err: NetworkError, delay: Duration| {
                debug!(log, "Error finding host IP - retrying";
                    "error" => %err, "retry_in" => ?delay);
            },
        )
        .await
        .stage(&self.name, "Error determining host IP")?;
        debug!(self.log, "found host address"; "host_ip" => %host_ip);
        self.host_ip = Some(host_ip);
        Ok(StepOutcome::Done)
    }

    fn apply_proxy(&mut self) -> Result<StepOutcome, CommandError> {
        let proxy = resolve_proxy_config(&self.metadata.cluster_info.base_domain)
            .stage(&self.name, "Error getting proxy configuration")?;
        self.proxy_env = Some(proxy.apply_to_environment());
        self.proxy = proxy;
        Ok(StepOutcome::Done)
    }

    async fn start_dns(&mut self) -> Result<StepOutcome, CommandError> {
        let host_ip = self
            .host_ip
            .ok_or(NetworkError::HostIpUnknown)
            .stage(&self.name, "Error running post start")?;
        let ctx = DnsContext {
            vm_ip: self.vm_ip,
            host_ip,
            metadata: &self.metadata,
        };
        dns::run_post_start(
            &self.log,
            self.runner.as_ref(),
            self.services.as_ref(),
            &ctx,
        )
        .await
        .stage(&self.name, "Error running post start")?;
        Ok(StepOutcome::Done)
    }

    async fn check_internal_dns(
        &mut self,
    ) -> Result<StepOutcome, CommandError> {
        if let Err(err) =
            dns::check_internal_dns(self.runner.as_ref(), &self.metadata).await
        {
            let output = err.stdout().unwrap_or_default().trim().to_string();
            return Err(CommandError::new(
                &self.name,
                format!("Failed internal DNS query: {output}"),
                err,
            ));
        }
        info!(self.log, "Check internal and public DNS query ...");
        Ok(StepOutcome::Done)
    }

    async fn check_public_dns(&mut self) -> Result<StepOutcome, CommandError> {
        match dns::check_public_dns(self.runner.as_ref()).await {
            Ok(_) => Ok(StepOutcome::Done),
            Err(err) => {
                warn!(self.log, "Failed public DNS query from the cluster";
                    "error" => %err,
                    "output" => err.stdout().unwrap_or_default());
                Ok(StepOutcome::Recovered(err.to_string()))
            }
        }
    }

    async fn check_dns_from_host(
        &mut self,
    ) -> Result<StepOutcome, CommandError> {
        info!(self.log, "Check DNS query from host ...");
        self.host_network
            .check_dns_from_host(&self.metadata, self.vm_ip)
            .await
            .stage(&self.name, "Failed to query DNS from host")?;
        Ok(StepOutcome::Done)
    }

    async fn rotate_ssh_key(&mut self) -> Result<StepOutcome, CommandError> {
        if self.first_boot.is_none() {
            return Ok(StepOutcome::Skipped);
        }
        info!(self.log, "Generating new SSH key");
        let key_path = self.paths.private_key_path(&self.name);
        let public_key = self
            .key_generator
            .generate(&key_path)
            .await
            .stage(&self.name, "Error updating public key")?;
        ssh::update_authorized_keys(self.runner.as_ref(), &public_key)
            .await
            .stage(&self.name, "Error updating public key")?;
        self.runner.set_private_key_path(&key_path);
        Ok(StepOutcome::Done)
    }

    async fn copy_kubeconfig(&mut self) -> Result<StepOutcome, CommandError> {
        if self.first_boot.is_none() {
            return Ok(StepOutcome::Skipped);
        }
        info!(self.log, "Copying kubeconfig file to instance dir ...");
        let kubeconfig = copy_file(
            &self.metadata.kubeconfig_path(),
            &self.paths.kubeconfig_path(&self.name),
        )
        .await
        .stage(&self.name, "Error copying kubeconfig file")?;
        ssh::copy_kubeconfig_to_vm(self.runner.as_ref(), &kubeconfig)
            .await
            .stage(&self.name, "Error copying kubeconfig file in VM")?;
        Ok(StepOutcome::Done)
    }

    async fn renew_certificates(
        &mut self,
    ) -> Result<StepOutcome, CommandError> {
        if !self.needs_certs_renewal {
            return Ok(StepOutcome::Skipped);
        }
        info!(
            self.log,
            "Cluster TLS certificates have expired, renewing them... \
             [will take up to 5 minutes]"
        );
        if let Err(err) = self.cluster.renew_certificates().await {
            debug!(self.log, "Failed to renew TLS certificates"; "error" => %err);
            if let Ok(build_time) = self.metadata.build_time() {
                let age_days = (Utc::now() - build_time).num_days();
                if age_days >= BUNDLE_CERT_VALIDITY_DAYS {
                    debug!(
                        self.log,
                        "Bundle has been generated {age_days} days ago"
                    );
                }
            }
            return Err(CommandError::new(
                &self.name,
                "Failed to renew TLS certificates",
                Error::CertificateRenewal(err),
            ));
        }
        Ok(StepOutcome::Done)
    }

    async fn start_kubelet(&mut self) -> Result<StepOutcome, CommandError> {
        info!(self.log, "Starting kubelet service");
        self.services
            .start(KUBELET)
            .await
            .stage(&self.name, "Error starting kubelet")?;
        Ok(StepOutcome::Done)
    }

    async fn configure_cluster(
        &mut self,
    ) -> Result<StepOutcome, CommandError> {
        let pull_secret = match &self.first_boot {
            Some(first_boot) => first_boot.pull_secret.clone(),
            None => return Ok(StepOutcome::Skipped),
        };
        const STAGE: &str = "Error setting cluster config";

        info!(self.log, "Configuring cluster for first start");
        self.configure_proxy().await.stage(&self.name, STAGE)?;

        info!(self.log, "Adding user's pull secret ...");
        self.cluster
            .add_pull_secret(&pull_secret)
            .await
            .stage(&self.name, STAGE)?;

        info!(self.log, "Updating cluster ID ...");
        self.cluster
            .update_cluster_id(Uuid::new_v4())
            .await
            .stage(&self.name, STAGE)?;
        Ok(StepOutcome::Done)
    }

    /// Pushes the proxy settings into the cluster and the node services.
    async fn configure_proxy(&mut self) -> Result<(), Error> {
        if !self.proxy.is_enabled() {
            return Ok(());
        }
        info!(self.log, "Adding proxy configuration to the cluster ...");
        self.proxy.add_no_proxy(self.vm_ip.to_string());
        let pushed = self.push_proxy_config().await;

        // The services are restarted whether or not the push succeeded, and
        // restarting is what makes them read the new drop-ins.
        let crio = self.services.restart(CRIO).await;
        let kubelet = self.services.restart(KUBELET).await;
        pushed?;
        crio?;
        kubelet?;
        Ok(())
    }

    async fn push_proxy_config(&self) -> Result<(), ClusterError> {
        self.cluster.add_proxy_config(&self.proxy).await?;
        info!(self.log, "Adding proxy configuration to kubelet and crio service ...");
        cluster::add_proxy_to_kubelet_and_crio(self.runner.as_ref(), &self.proxy)
            .await
    }

    async fn refresh_api_server(
        &mut self,
    ) -> Result<StepOutcome, CommandError> {
        self.kubelet_started = self
            .services
            .is_active(KUBELET)
            .await
            .stage(&self.name, "kubelet service is not running")?;
        if !self.kubelet_started {
            return Ok(StepOutcome::Skipped);
        }

        // The API server may come up before the request-header client CA is
        // published and then reject every aggregated request until it is
        // restarted.
        debug!(self.log, "Waiting for update of client-ca request header ...");
        self.cluster.wait_for_request_header_client_ca().await.stage(
            &self.name,
            "Failed to wait for the client-ca request header update",
        )?;
        self.cluster
            .delete_openshift_apiserver_pods()
            .await
            .stage(&self.name, "Cannot delete OpenShift API Server pods")?;

        info!(
            self.log,
            "Starting OpenShift cluster ... [waiting {}s]",
            self.tunables.settle_delay.as_secs()
        );
        Ok(StepOutcome::Done)
    }

    async fn approve_node_csr(&mut self) -> Result<StepOutcome, CommandError> {
        self.cluster
            .approve_node_csr()
            .await
            .stage(&self.name, "Error approving the node csr")?;
        Ok(StepOutcome::Done)
    }

    async fn wait_for_proxy(&mut self) -> Result<StepOutcome, CommandError> {
        if !self.proxy.is_enabled() {
            return Ok(StepOutcome::Skipped);
        }
        info!(self.log, "Waiting for the proxy configuration to be applied ...");

        let log = &self.log;
        let cluster = &self.cluster;
        let proxy = &self.proxy;
        let result = retry_after(
            &self.tunables.proxy_propagation_retry,
            || async {
                match cluster
                    .proxy_settings_applied(
                        proxy,
                        PROXY_PROBE_PACKAGE,
                        PROXY_PROBE_NAMESPACE,
                    )
                    .await
                {
                    Ok(true) => Ok(()),
                    Ok(false) => Err(BackoffError::transient(
                        ClusterError::ProxyPropagationPending,
                    )),
                    Err(err) => Err(BackoffError::transient(err)),
                }
            },
            |err: ClusterError, _: Duration| {
                debug!(log, "proxy settings not applied yet"; "error" => %err);
            },
        )
        .await;

        match result {
            Ok(()) => Ok(StepOutcome::Done),
            Err(err) => {
                debug!(self.log, "Failed to propagate proxy settings to cluster";
                    "error" => %err);
                Ok(StepOutcome::Recovered(err.to_string()))
            }
        }
    }
}

/// Copies `source` to `target`, returning the contents.
async fn copy_file(source: &Utf8Path, target: &Utf8Path) -> Result<String, Error> {
    let contents = tokio::fs::read_to_string(source)
        .await
        .map_err(|err| Error::Io { path: source.to_owned(), err })?;
    if let Some(parent) = target.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|err| Error::Io { path: parent.to_owned(), err })?;
    }
    tokio::fs::write(target, &contents)
        .await
        .map_err(|err| Error::Io { path: target.to_owned(), err })?;
    Ok(contents)
}
