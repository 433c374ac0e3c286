// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Facilities used by the integration tests

use camino::{Utf8Path, Utf8PathBuf};
use camino_tempfile::Utf8TempDir;
use slog::Logger;
use snc_machine::config::{
    Paths, PullSecretError, StartConfig, Tunables, DEFAULT_CPUS,
    DEFAULT_MEMORY_MIB,
};
use snc_machine::sim::{SimBackend, SimConfig, SimEvent};
use snc_machine::Machine;
use std::sync::Arc;

pub const BUNDLE_NAME: &str = "snc_libvirt_4.17.0.crcbundle";
pub const BUNDLE_STEM: &str = "snc_libvirt_4.17.0";
pub const PULL_SECRET: &str = r#"{"auths":{"quay.io":{"auth":"c25jOnNuYw=="}}}"#;
const DISK_SIZE: usize = 4096;

pub fn test_logger() -> Logger {
    Logger::root(slog::Discard, o!())
}

/// An empty controller home with the test bundle already extracted into its
/// cache, and a machine controller over the simulated backend.
pub struct TestContext {
    // Held for its Drop.
    _dir: Utf8TempDir,
    pub paths: Paths,
    pub bundle_path: Utf8PathBuf,
    pub backend: Arc<SimBackend>,
    pub machine: Machine,
}

impl TestContext {
    pub fn new(config: SimConfig) -> Self {
        let dir = Utf8TempDir::new().unwrap();
        let paths = Paths::new(dir.path().join("home"));
        write_bundle(&paths.cache_dir().join(BUNDLE_STEM));
        Self::with_paths(dir, paths, config)
    }

    /// Like [`TestContext::new`], but the bundle is only available as an
    /// archive.
    pub fn with_archive(config: SimConfig) -> Self {
        let dir = Utf8TempDir::new().unwrap();
        let paths = Paths::new(dir.path().join("home"));
        let staging = dir.path().join("staging");
        write_bundle(&staging);

        let file = std::fs::File::create(dir.path().join(BUNDLE_NAME)).unwrap();
        let mut builder = tar::Builder::new(file);
        builder.append_dir_all(BUNDLE_STEM, &staging).unwrap();
        builder.finish().unwrap();
        std::fs::remove_dir_all(&staging).unwrap();

        Self::with_paths(dir, paths, config)
    }

    fn with_paths(dir: Utf8TempDir, paths: Paths, config: SimConfig) -> Self {
        let bundle_path = dir.path().join(BUNDLE_NAME);
        let (backend, machine) = new_machine(&paths, config);
        Self { _dir: dir, paths, bundle_path, backend, machine }
    }

    /// Replaces the controller with a fresh one over the same home, as a
    /// new invocation would see it.
    pub fn reopen(&mut self, config: SimConfig) {
        let (backend, machine) = new_machine(&self.paths, config);
        self.backend = backend;
        self.machine = machine;
    }

    pub fn start_config(&self, name: &str) -> StartConfig {
        StartConfig {
            name: name.to_string(),
            bundle_path: self.bundle_path.clone(),
            cpus: DEFAULT_CPUS,
            memory_mib: DEFAULT_MEMORY_MIB,
            nameserver: None,
            pull_secret: Arc::new(|| -> Result<String, PullSecretError> {
                Ok(PULL_SECRET.to_string())
            }),
        }
    }

    pub fn events(&self) -> Vec<SimEvent> {
        self.backend.events()
    }

    /// Commands run in the VM so far.
    pub fn commands(&self) -> Vec<String> {
        self.events()
            .iter()
            .filter_map(|event| event.command())
            .filter(|command| !command.is_empty())
            .map(str::to_string)
            .collect()
    }
}

fn new_machine(paths: &Paths, config: SimConfig) -> (Arc<SimBackend>, Machine) {
    let log = test_logger();
    let backend = Arc::new(SimBackend::new(&log, config, paths));
    let machine =
        Machine::new(&log, backend.clone(), paths.clone(), Tunables::default());
    (backend, machine)
}

/// Position of the first event matching `predicate`.
pub fn position<F>(events: &[SimEvent], predicate: F) -> usize
where
    F: Fn(&SimEvent) -> bool,
{
    events.iter().position(predicate).unwrap_or_else(|| {
        panic!("no matching event in {events:#?}");
    })
}

pub fn is_command(event: &SimEvent, wanted: &str) -> bool {
    event.command() == Some(wanted)
}

/// Writes an extracted bundle into `dir`.
pub fn write_bundle(dir: &Utf8Path) {
    std::fs::create_dir_all(dir).unwrap();
    let metadata = serde_json::json!({
        "version": "1.4",
        "name": BUNDLE_STEM,
        "buildInfo": {
            "buildTime": "2024-10-01T08:00:00+00:00",
            "installerVersion": "4.17.0",
        },
        "clusterInfo": {
            "openshiftVersion": "4.17.0",
            "clusterName": "crc",
            "baseDomain": "testing",
            "appsDomain": "apps-crc.testing",
            "sshPrivateKeyFile": "id_ecdsa_crc",
            "kubeConfig": "kubeconfig",
            "kubeadminPasswordFile": "kubeadmin-password",
        },
        "nodes": [{
            "kind": ["master", "worker"],
            "hostname": "crc-node",
            "diskImage": "crc.qcow2",
            "internalIp": "192.168.126.11",
        }],
        "storage": {
            "diskImages": [{
                "name": "crc.qcow2",
                "format": "qcow2",
                "size": DISK_SIZE.to_string(),
            }],
        },
    });
    std::fs::write(
        dir.join("bundle-info.json"),
        serde_json::to_vec_pretty(&metadata).unwrap(),
    )
    .unwrap();
    std::fs::write(dir.join("crc.qcow2"), vec![0u8; DISK_SIZE]).unwrap();
    std::fs::write(dir.join("kubeadmin-password"), "s3cret-Pass\n").unwrap();
    std::fs::write(dir.join("kubeconfig"), "apiVersion: v1\nkind: Config\n")
        .unwrap();
    std::fs::write(dir.join("id_ecdsa_crc"), "PRIVATE KEY\n").unwrap();
}
