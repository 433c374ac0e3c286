// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Bundle metadata and the cache of extracted bundles.
//!
//! A bundle is a tar archive containing a single top-level directory named
//! after the archive (without its extension). That directory holds the VM disk
//! image, kernel artifacts, cluster credentials, and `bundle-info.json`
//! describing all of them.

use async_trait::async_trait;
use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use slog::Logger;

/// Name of the metadata file inside an extracted bundle.
pub const METADATA_FILE: &str = "bundle-info.json";

#[derive(thiserror::Error, Debug)]
pub enum BundleError {
    #[error("bundle '{0}' is not in the cache")]
    NotCached(String),

    #[error("'{0}' is not a valid bundle file name")]
    InvalidName(Utf8PathBuf),

    #[error("Failed to read {path}: {err}")]
    Io {
        path: Utf8PathBuf,
        #[source]
        err: std::io::Error,
    },

    #[error("Failed to parse bundle metadata {path}: {err}")]
    Parse {
        path: Utf8PathBuf,
        #[source]
        err: serde_json::Error,
    },

    #[error("Failed to extract bundle {path}: {err}")]
    Extract {
        path: Utf8PathBuf,
        #[source]
        err: std::io::Error,
    },

    #[error("bundle metadata does not list any {0}")]
    Incomplete(&'static str),

    #[error("invalid size '{0}' in bundle metadata")]
    InvalidSize(String),

    #[error("unexpected size for {path}: expected {expected} bytes, found {actual}")]
    DiskImageSize { path: Utf8PathBuf, expected: u64, actual: u64 },

    #[error("invalid build time '{time}' in bundle metadata: {err}")]
    BuildTime {
        time: String,
        #[source]
        err: chrono::ParseError,
    },
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BuildInfo {
    pub build_time: String,
    #[serde(default)]
    pub installer_version: String,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterInfo {
    #[serde(default)]
    pub openshift_version: String,
    pub cluster_name: String,
    pub base_domain: String,
    pub apps_domain: String,
    pub ssh_private_key_file: String,
    pub kube_config: String,
    pub kubeadmin_password_file: String,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    #[serde(default)]
    pub kind: Vec<String>,
    pub hostname: String,
    pub disk_image: String,
    pub internal_ip: String,
    #[serde(default)]
    pub kernel: String,
    #[serde(default)]
    pub initramfs: String,
    #[serde(default)]
    pub kernel_cmd_line: String,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DiskImage {
    pub name: String,
    pub format: String,
    pub size: String,
    #[serde(default)]
    pub sha256sum: String,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Storage {
    pub disk_images: Vec<DiskImage>,
}

/// Contents of `bundle-info.json`, bound to the directory it was read from.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BundleMetadata {
    pub version: String,
    pub name: String,
    pub build_info: BuildInfo,
    pub cluster_info: ClusterInfo,
    pub nodes: Vec<Node>,
    pub storage: Storage,
    #[serde(skip)]
    dir: Utf8PathBuf,
}

impl BundleMetadata {
    /// Reads the metadata of the bundle extracted in `dir`.
    pub async fn load(dir: &Utf8Path) -> Result<Self, BundleError> {
        let path = dir.join(METADATA_FILE);
        let contents = tokio::fs::read(&path)
            .await
            .map_err(|err| BundleError::Io { path: path.clone(), err })?;
        let mut metadata: BundleMetadata = serde_json::from_slice(&contents)
            .map_err(|err| BundleError::Parse { path, err })?;
        metadata.dir = dir.to_owned();
        Ok(metadata)
    }

    /// Directory the bundle was extracted to.
    pub fn dir(&self) -> &Utf8Path {
        &self.dir
    }

    fn resolve(&self, file: &str) -> Utf8PathBuf {
        self.dir.join(file)
    }

    fn first_node(&self) -> Result<&Node, BundleError> {
        self.nodes.first().ok_or(BundleError::Incomplete("nodes"))
    }

    pub fn kubeconfig_path(&self) -> Utf8PathBuf {
        self.resolve(&self.cluster_info.kube_config)
    }

    pub fn ssh_key_path(&self) -> Utf8PathBuf {
        self.resolve(&self.cluster_info.ssh_private_key_file)
    }

    fn disk_image(&self) -> Result<&DiskImage, BundleError> {
        self.storage
            .disk_images
            .first()
            .ok_or(BundleError::Incomplete("disk images"))
    }

    pub fn disk_image_path(&self) -> Result<Utf8PathBuf, BundleError> {
        Ok(self.resolve(&self.disk_image()?.name))
    }

    pub fn kernel_path(&self) -> Option<Utf8PathBuf> {
        let node = self.nodes.first()?;
        (!node.kernel.is_empty()).then(|| self.resolve(&node.kernel))
    }

    pub fn initramfs_path(&self) -> Option<Utf8PathBuf> {
        let node = self.nodes.first()?;
        (!node.initramfs.is_empty()).then(|| self.resolve(&node.initramfs))
    }

    pub fn kernel_cmdline(&self) -> Option<String> {
        let node = self.nodes.first()?;
        (!node.kernel_cmd_line.is_empty()).then(|| node.kernel_cmd_line.clone())
    }

    pub fn node_hostname(&self) -> Result<&str, BundleError> {
        Ok(&self.first_node()?.hostname)
    }

    pub fn node_internal_ip(&self) -> Result<&str, BundleError> {
        Ok(&self.first_node()?.internal_ip)
    }

    pub async fn kubeadmin_password(&self) -> Result<String, BundleError> {
        let path = self.resolve(&self.cluster_info.kubeadmin_password_file);
        let password = tokio::fs::read_to_string(&path)
            .await
            .map_err(|err| BundleError::Io { path, err })?;
        Ok(password.trim().to_string())
    }

    pub fn build_time(&self) -> Result<DateTime<Utc>, BundleError> {
        let time = &self.build_info.build_time;
        DateTime::parse_from_rfc3339(time)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|err| BundleError::BuildTime { time: time.clone(), err })
    }

    /// Product version carried by the bundle, if it declares one.
    pub fn openshift_version(&self) -> Option<&str> {
        let version = self.cluster_info.openshift_version.as_str();
        (!version.is_empty()).then_some(version)
    }

    pub fn cluster_api_url(&self) -> String {
        format!(
            "https://api.{}.{}:6443",
            self.cluster_info.cluster_name, self.cluster_info.base_domain
        )
    }

    pub fn web_console_url(&self) -> String {
        format!(
            "https://console-openshift-console.{}",
            self.cluster_info.apps_domain
        )
    }

    /// Verifies that the disk image on disk has the size the metadata
    /// declares, which catches truncated extractions.
    pub async fn check_disk_image_size(&self) -> Result<(), BundleError> {
        let image = self.disk_image()?;
        let expected: u64 = image
            .size
            .parse()
            .map_err(|_| BundleError::InvalidSize(image.size.clone()))?;
        let path = self.resolve(&image.name);
        let actual = tokio::fs::metadata(&path)
            .await
            .map_err(|err| BundleError::Io { path: path.clone(), err })?
            .len();
        if actual != expected {
            return Err(BundleError::DiskImageSize { path, expected, actual });
        }
        Ok(())
    }
}

/// Name under which a bundle is known: the file name of its archive.
pub fn bundle_name(bundle_path: &Utf8Path) -> Result<String, BundleError> {
    bundle_path
        .file_name()
        .map(str::to_string)
        .ok_or_else(|| BundleError::InvalidName(bundle_path.to_owned()))
}

/// Locates the metadata of bundles, extracting them when needed.
#[async_trait]
pub trait BundleResolver: Send + Sync {
    /// Metadata of a bundle that has already been extracted.
    async fn get_cached(&self, name: &str)
        -> Result<BundleMetadata, BundleError>;

    /// Extracts the bundle archive at `path` and returns its metadata.
    async fn extract(&self, path: &Utf8Path)
        -> Result<BundleMetadata, BundleError>;
}

/// Metadata of the bundle at `bundle_path`, from the cache if it has been
/// extracted before.
pub async fn resolve(
    log: &Logger,
    resolver: &dyn BundleResolver,
    bundle_path: &Utf8Path,
) -> Result<BundleMetadata, BundleError> {
    let name = bundle_name(bundle_path)?;
    match resolver.get_cached(&name).await {
        Ok(metadata) => {
            info!(log, "Loading bundle: {name} ...");
            Ok(metadata)
        }
        Err(err) => {
            debug!(log, "bundle is not usable from the cache"; "error" => %err);
            info!(log, "Extracting bundle: {name} ...");
            resolver.extract(bundle_path).await
        }
    }
}

/// Bundles extracted under a cache directory, one subdirectory per bundle.
pub struct DirBundleResolver {
    cache_dir: Utf8PathBuf,
}

impl DirBundleResolver {
    pub fn new(cache_dir: impl Into<Utf8PathBuf>) -> Self {
        Self { cache_dir: cache_dir.into() }
    }

    fn bundle_dir(&self, name: &str) -> Utf8PathBuf {
        let stem = Utf8Path::new(name).file_stem().unwrap_or(name);
        self.cache_dir.join(stem)
    }
}

#[async_trait]
impl BundleResolver for DirBundleResolver {
    async fn get_cached(
        &self,
        name: &str,
    ) -> Result<BundleMetadata, BundleError> {
        let dir = self.bundle_dir(name);
        if !tokio::fs::try_exists(dir.join(METADATA_FILE))
            .await
            .map_err(|err| BundleError::Io { path: dir.clone(), err })?
        {
            return Err(BundleError::NotCached(name.to_string()));
        }
        BundleMetadata::load(&dir).await
    }

    async fn extract(
        &self,
        path: &Utf8Path,
    ) -> Result<BundleMetadata, BundleError> {
        let name = bundle_name(path)?;
        let archive_path = path.to_owned();
        let cache_dir = self.cache_dir.clone();

        // The tar crate is synchronous; keep it off the runtime's threads.
        let unpacked = tokio::task::spawn_blocking(move || {
            std::fs::create_dir_all(&cache_dir)?;
            let file = std::fs::File::open(&archive_path)?;
            let mut archive = tar::Archive::new(file);
            archive.set_preserve_permissions(true);
            archive.unpack(&cache_dir)
        })
        .await
        .map_err(|err| BundleError::Extract {
            path: path.to_owned(),
            err: std::io::Error::other(err),
        })?;
        unpacked
            .map_err(|err| BundleError::Extract { path: path.to_owned(), err })?;

        self.get_cached(&name).await
    }
}
