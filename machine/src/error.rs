// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::bundle::BundleError;
use crate::cluster::ClusterError;
use crate::config::PullSecretError;
use crate::dns::DnsError;
use crate::driver::DriverError;
use crate::network::NetworkError;
use crate::ssh::{KeyError, RunnerError};
use crate::store::StoreError;
use crate::systemd::ServiceError;
use camino::Utf8PathBuf;
use snc_common::proxy::ProxyError;

/// Any failure of a lifecycle operation, before it is labelled with the stage
/// at which it happened.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Driver(#[from] DriverError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Bundle(#[from] BundleError),

    #[error(transparent)]
    Runner(#[from] RunnerError),

    #[error(transparent)]
    Service(#[from] ServiceError),

    #[error(transparent)]
    Cluster(#[from] ClusterError),

    #[error(transparent)]
    Dns(#[from] DnsError),

    #[error(transparent)]
    Network(#[from] NetworkError),

    #[error(transparent)]
    Proxy(#[from] ProxyError),

    #[error(transparent)]
    Key(#[from] KeyError),

    #[error(
        "bundle mismatch: instance was created with '{existing}' and \
         cannot be started with '{requested}'"
    )]
    BundleMismatch { requested: String, existing: String },

    #[error("driver did not report the bundle this instance was created with")]
    MissingBundleName,

    #[error("please check if a newer bundle is available ({0})")]
    CertificateRenewal(#[source] ClusterError),

    #[error("pull secret unavailable: {0}")]
    PullSecret(#[source] PullSecretError),

    #[error("I/O error on {path}: {err}")]
    Io {
        path: Utf8PathBuf,
        #[source]
        err: std::io::Error,
    },
}

/// Fatal failure of a lifecycle command: the instance it concerned, a short
/// label of the stage that failed, and the underlying cause.
#[derive(thiserror::Error, Debug)]
#[error("{stage}: {source}")]
pub struct CommandError {
    pub name: String,
    pub stage: String,
    #[source]
    pub source: Error,
}

impl CommandError {
    pub fn new(
        name: impl Into<String>,
        stage: impl Into<String>,
        source: impl Into<Error>,
    ) -> Self {
        Self { name: name.into(), stage: stage.into(), source: source.into() }
    }
}

/// Attaches a stage label to a failed step.
pub(crate) trait StageExt<T> {
    fn stage(self, name: &str, stage: &str) -> Result<T, CommandError>;
}

impl<T, E> StageExt<T> for Result<T, E>
where
    E: Into<Error>,
{
    fn stage(self, name: &str, stage: &str) -> Result<T, CommandError> {
        self.map_err(|err| CommandError::new(name, stage, err))
    }
}
