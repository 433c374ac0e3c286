// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Logging configuration.

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use slog::{o, Drain, Level, Logger};
use std::fs::OpenOptions;

#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    #[error("failed to create log directory {path}: {err}")]
    CreateDir {
        path: Utf8PathBuf,
        #[source]
        err: std::io::Error,
    },
    #[error("failed to open log file {path}: {err}")]
    Open {
        path: Utf8PathBuf,
        #[source]
        err: std::io::Error,
    },
}

/// Where log records go.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(tag = "mode")]
pub enum ConfigLogging {
    #[serde(rename = "stderr-terminal")]
    StderrTerminal { level: ConfigLoggingLevel },
    #[serde(rename = "file")]
    File {
        level: ConfigLoggingLevel,
        path: Utf8PathBuf,
        if_exists: ConfigLoggingIfExists,
        /// Also print records at or above this level on stderr.
        #[serde(default)]
        echo: Option<ConfigLoggingLevel>,
    },
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ConfigLoggingIfExists {
    Fail,
    Truncate,
    Append,
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ConfigLoggingLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
    Critical,
}

impl From<ConfigLoggingLevel> for Level {
    fn from(config_level: ConfigLoggingLevel) -> Level {
        match config_level {
            ConfigLoggingLevel::Trace => Level::Trace,
            ConfigLoggingLevel::Debug => Level::Debug,
            ConfigLoggingLevel::Info => Level::Info,
            ConfigLoggingLevel::Warn => Level::Warning,
            ConfigLoggingLevel::Error => Level::Error,
            ConfigLoggingLevel::Critical => Level::Critical,
        }
    }
}

/// A root logger together with the resources backing it.
///
/// Records are written asynchronously; dropping the context flushes pending
/// records and closes the log file.
pub struct LogContext {
    pub log: Logger,
    _guard: slog_async::AsyncGuard,
}

impl ConfigLogging {
    /// Create the root logger based on the requested configuration.
    pub fn to_logger(&self, name: &str) -> Result<LogContext, LoggingError> {
        match self {
            ConfigLogging::StderrTerminal { level } => {
                let drain = slog::LevelFilter(terminal_drain(), (*level).into());
                Ok(async_root_logger(name, drain))
            }

            ConfigLogging::File { level, path, if_exists, echo } => {
                let mut open_options = OpenOptions::new();
                open_options.write(true);
                match if_exists {
                    ConfigLoggingIfExists::Fail => {
                        open_options.create_new(true);
                    }
                    ConfigLoggingIfExists::Append => {
                        open_options.create(true).append(true);
                    }
                    ConfigLoggingIfExists::Truncate => {
                        open_options.create(true).truncate(true);
                    }
                }
                let file = open_log_file(&open_options, path)?;
                let file_drain = slog::LevelFilter(
                    slog_bunyan::with_name("snc", file).build(),
                    (*level).into(),
                );

                match echo {
                    None => Ok(async_root_logger(name, file_drain)),
                    Some(echo) => {
                        let echo_drain = slog::LevelFilter(
                            terminal_drain(),
                            (*echo).into(),
                        );
                        let drain = slog::Duplicate::new(file_drain, echo_drain);
                        Ok(async_root_logger(name, drain))
                    }
                }
            }
        }
    }
}

fn terminal_drain() -> slog_term::FullFormat<slog_term::TermDecorator> {
    let decorator = slog_term::TermDecorator::new().stderr().build();
    slog_term::FullFormat::new(decorator).build()
}

// We use an async drain so that the file and terminal drains, which are not
// `Sync`, can be shared by every clone of the logger.
fn async_root_logger<T>(name: &str, drain: T) -> LogContext
where
    T: Drain + Send + 'static,
    T::Err: std::fmt::Debug,
{
    let (async_drain, guard) =
        slog_async::Async::new(drain.fuse().ignore_res()).build_with_guard();
    let log = Logger::root(
        async_drain.fuse(),
        o!("name" => name.to_string(), "pid" => std::process::id()),
    );
    LogContext { log, _guard: guard }
}

fn open_log_file(
    open_options: &OpenOptions,
    path: &Utf8Path,
) -> Result<std::fs::File, LoggingError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|err| {
            LoggingError::CreateDir { path: parent.to_owned(), err }
        })?;
    }
    open_options
        .open(path)
        .map_err(|err| LoggingError::Open { path: path.to_owned(), err })
}
