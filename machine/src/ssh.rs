// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Command execution inside the VM and SSH key management.

use crate::exec::{run_host_command, HostCommandError};
use async_trait::async_trait;
use camino::{Utf8Path, Utf8PathBuf};
use slog::Logger;
use snc_common::backoff::{retry_after, BackoffError, RetryPolicy};
use std::time::Duration;

/// File the VM's SSH daemon reads the allowed keys from.
pub const AUTHORIZED_KEYS_PATH: &str = "/home/core/.ssh/authorized_keys";

/// Location of the kubeconfig inside the VM.
pub const VM_KUBECONFIG_PATH: &str = "/opt/kubeconfig";

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum RunnerError {
    #[error(
        "remote command [{command}] failed with status {status}: {stderr}"
    )]
    Command { command: String, status: i32, stdout: String, stderr: String },

    #[error("cannot reach the VM over SSH: {0}")]
    Transport(String),
}

impl RunnerError {
    /// Standard output of a command that ran but failed, if any.
    pub fn stdout(&self) -> Option<&str> {
        match self {
            RunnerError::Command { stdout, .. } => Some(stdout),
            RunnerError::Transport(_) => None,
        }
    }
}

/// Runs shell commands inside the VM.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RemoteRunner: Send + Sync {
    /// Runs `command` and returns its standard output.
    async fn run(&self, command: &str) -> Result<String, RunnerError>;

    /// Like [`RemoteRunner::run`], for commands carrying secrets: neither the
    /// command nor its output may be logged.
    async fn run_private(&self, command: &str) -> Result<String, RunnerError>;

    /// Switches the key used for subsequent connections.
    fn set_private_key_path(&self, path: &Utf8Path);
}

/// Waits until the VM accepts SSH connections.
pub async fn wait_for_ssh(
    log: &Logger,
    runner: &dyn RemoteRunner,
    policy: &RetryPolicy,
) -> Result<(), RunnerError> {
    let log_failure = |err: RunnerError, delay: Duration| {
        debug!(log, "ssh not available yet"; "error" => %err, "retry_in" => ?delay);
    };
    retry_after(
        policy,
        || async {
            runner.run("exit 0").await.map(|_| ()).map_err(BackoffError::transient)
        },
        log_failure,
    )
    .await
}

/// Replaces the keys allowed to log into the VM with `public_key`.
pub async fn update_authorized_keys(
    runner: &dyn RemoteRunner,
    public_key: &str,
) -> Result<(), RunnerError> {
    runner
        .run(&format!(
            "echo '{}' > {AUTHORIZED_KEYS_PATH}",
            public_key.trim()
        ))
        .await
        .map(|_| ())
}

/// Writes `kubeconfig` into the VM.
pub async fn copy_kubeconfig_to_vm(
    runner: &dyn RemoteRunner,
    kubeconfig: &str,
) -> Result<(), RunnerError> {
    runner
        .run_private(&format!(
            "cat <<EOF | sudo tee {VM_KUBECONFIG_PATH}\n{}\nEOF",
            kubeconfig.trim_end()
        ))
        .await
        .map(|_| ())
}

#[derive(thiserror::Error, Debug)]
pub enum KeyError {
    #[error("Failed to remove stale key {path}: {err}")]
    RemoveStale {
        path: Utf8PathBuf,
        #[source]
        err: std::io::Error,
    },

    #[error("Failed to write {path}: {err}")]
    Write {
        path: Utf8PathBuf,
        #[source]
        err: std::io::Error,
    },

    #[error("Error generating ssh key pair: {0}")]
    Generate(#[from] HostCommandError),

    #[error("Failed to read public key {path}: {err}")]
    ReadPublic {
        path: Utf8PathBuf,
        #[source]
        err: std::io::Error,
    },
}

/// Creates SSH key pairs.
#[async_trait]
pub trait KeyGenerator: Send + Sync {
    /// Writes a new key pair at `private_key_path` (and `.pub` next to it),
    /// returning the public key.
    async fn generate(
        &self,
        private_key_path: &Utf8Path,
    ) -> Result<String, KeyError>;
}

/// Public half of the key pair stored at `private_key_path`.
pub fn public_key_path(private_key_path: &Utf8Path) -> Utf8PathBuf {
    Utf8PathBuf::from(format!("{private_key_path}.pub"))
}

/// Generates keys with the host's `ssh-keygen`.
#[derive(Clone, Debug, Default)]
pub struct SshKeygen;

#[async_trait]
impl KeyGenerator for SshKeygen {
    async fn generate(
        &self,
        private_key_path: &Utf8Path,
    ) -> Result<String, KeyError> {
        let public_path = public_key_path(private_key_path);
        // ssh-keygen prompts before overwriting, and we cannot answer.
        for path in [private_key_path, public_path.as_path()] {
            match tokio::fs::remove_file(path).await {
                Ok(()) => (),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => (),
                Err(err) => {
                    return Err(KeyError::RemoveStale {
                        path: path.to_owned(),
                        err,
                    })
                }
            }
        }
        if let Some(parent) = private_key_path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|err| {
                KeyError::Write { path: parent.to_owned(), err }
            })?;
        }

        let mut command = tokio::process::Command::new("ssh-keygen");
        command
            .args(["-t", "ecdsa", "-b", "521", "-N", "", "-q", "-f"])
            .arg(private_key_path);
        run_host_command(&mut command).await?;

        tokio::fs::read_to_string(&public_path)
            .await
            .map_err(|err| KeyError::ReadPublic { path: public_path, err })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use mockall::predicate::eq;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::Instant;

    fn test_logger() -> Logger {
        Logger::root(slog::Discard, o!())
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_ssh_retries() {
        let mut runner = MockRemoteRunner::new();
        let attempts = AtomicU32::new(0);
        runner.expect_run().with(eq("exit 0")).times(3).returning(move |_| {
            if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(RunnerError::Transport("connection refused".to_string()))
            } else {
                Ok(String::new())
            }
        });

        let policy = RetryPolicy::new(60, Duration::from_secs(1));
        let start = Instant::now();
        wait_for_ssh(&test_logger(), &runner, &policy).await.unwrap();
        assert_eq!(start.elapsed(), Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_ssh_gives_up() {
        let mut runner = MockRemoteRunner::new();
        runner.expect_run().times(3).returning(|_| {
            Err(RunnerError::Transport("no route to host".to_string()))
        });

        let policy = RetryPolicy::new(3, Duration::from_secs(1));
        let err =
            wait_for_ssh(&test_logger(), &runner, &policy).await.unwrap_err();
        assert_eq!(err, RunnerError::Transport("no route to host".to_string()));
    }

    #[tokio::test]
    async fn test_authorized_keys_and_kubeconfig() {
        let mut runner = MockRemoteRunner::new();
        runner
            .expect_run()
            .with(eq(
                "echo 'ecdsa-sha2-nistp521 AAAA user@host' > \
                 /home/core/.ssh/authorized_keys",
            ))
            .times(1)
            .returning(|_| Ok(String::new()));
        runner
            .expect_run_private()
            .withf(|command: &str| {
                command.starts_with("cat <<EOF | sudo tee /opt/kubeconfig\n")
                    && command.contains("apiVersion: v1")
                    && command.ends_with("\nEOF")
            })
            .times(1)
            .returning(|_| Ok(String::new()));

        update_authorized_keys(&runner, "ecdsa-sha2-nistp521 AAAA user@host\n")
            .await
            .unwrap();
        copy_kubeconfig_to_vm(&runner, "apiVersion: v1\n").await.unwrap();
    }

    #[test]
    fn test_public_key_path() {
        assert_eq!(
            public_key_path(Utf8Path::new("/home/u/.snc/machines/snc/id_ecdsa")),
            "/home/u/.snc/machines/snc/id_ecdsa.pub"
        );
    }
}
