// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Configuration of the `snc` command

use camino::{Utf8Path, Utf8PathBuf};
use serde::Deserialize;
use snc_common::logging::{
    ConfigLogging, ConfigLoggingIfExists, ConfigLoggingLevel,
};
use snc_machine::config::{Paths, PullSecretError, PullSecretProvider, Tunables};
use snc_machine::sim::SimConfig;

/// Environment variable holding the pull secret itself.
pub const PULL_SECRET_ENV: &str = "SNC_PULL_SECRET";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config from {path}: {err}")]
    Io {
        path: Utf8PathBuf,
        #[source]
        err: std::io::Error,
    },
    #[error("Failed to parse config from {path}: {err}")]
    Parse {
        path: Utf8PathBuf,
        #[source]
        err: toml::de::Error,
    },
    #[error("no base directory configured and $HOME is not set")]
    NoHome,
}

/// Contents of the optional configuration file. Every field has a default.
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Where instances, bundles and logs live; `$HOME/.snc` if unset.
    pub base_dir: Option<Utf8PathBuf>,
    /// Log destination; a file under the base directory if unset.
    pub log: Option<ConfigLogging>,
    pub tunables: Tunables,
    /// Behavior of the simulated machine.
    pub sim: SimConfig,
}

impl Config {
    pub fn from_file<P: AsRef<Utf8Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .map_err(|err| ConfigError::Io { path: path.into(), err })?;
        let config = toml::from_str(&contents)
            .map_err(|err| ConfigError::Parse { path: path.into(), err })?;
        Ok(config)
    }

    pub fn paths(&self) -> Result<Paths, ConfigError> {
        match &self.base_dir {
            Some(base_dir) => Ok(Paths::new(base_dir.clone())),
            None => {
                let home = std::env::var("HOME")
                    .ok()
                    .filter(|home| !home.is_empty())
                    .ok_or(ConfigError::NoHome)?;
                Ok(Paths::new(Utf8PathBuf::from(home).join(".snc")))
            }
        }
    }

    /// Where log records go. `debug` sends everything to the terminal.
    pub fn logging(&self, paths: &Paths, debug: bool) -> ConfigLogging {
        if debug {
            return ConfigLogging::StderrTerminal {
                level: ConfigLoggingLevel::Debug,
            };
        }
        self.log.clone().unwrap_or_else(|| ConfigLogging::File {
            level: ConfigLoggingLevel::Debug,
            path: paths.log_file(),
            if_exists: ConfigLoggingIfExists::Append,
            echo: Some(ConfigLoggingLevel::Info),
        })
    }
}

/// Reads the pull secret from a file if one was given, or else from
/// [`PULL_SECRET_ENV`].
#[derive(Clone, Debug)]
pub struct PullSecretSource {
    pub file: Option<Utf8PathBuf>,
}

impl PullSecretProvider for PullSecretSource {
    fn pull_secret(&self) -> Result<String, PullSecretError> {
        let secret = match &self.file {
            Some(path) => std::fs::read_to_string(path).map_err(|err| {
                format!("cannot read pull secret from {path}: {err}")
            })?,
            None => std::env::var(PULL_SECRET_ENV).map_err(|_| {
                format!(
                    "no pull secret given: use --pull-secret-file or set \
                     {PULL_SECRET_ENV}"
                )
            })?,
        };
        let secret = secret.trim().to_string();
        let parsed: serde_json::Value = serde_json::from_str(&secret)
            .map_err(|err| format!("pull secret is not valid JSON: {err}"))?;
        if parsed.get("auths").is_none() {
            return Err("pull secret has no \"auths\" entry".into());
        }
        Ok(secret)
    }
}
