// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Control of systemd units inside the VM.

use crate::ssh::{RemoteRunner, RunnerError};
use async_trait::async_trait;
use std::sync::Arc;

#[derive(thiserror::Error, Debug)]
pub enum ServiceError {
    #[error("Failed to {intent} service '{service}': {err}")]
    Command {
        intent: &'static str,
        service: String,
        #[source]
        err: RunnerError,
    },
}

/// Starts, restarts and queries services inside the VM.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ServiceCommander: Send + Sync {
    async fn start(&self, service: &str) -> Result<(), ServiceError>;

    /// Restarts `service`, picking up changed unit files.
    async fn restart(&self, service: &str) -> Result<(), ServiceError>;

    async fn is_active(&self, service: &str) -> Result<bool, ServiceError>;
}

/// [`ServiceCommander`] driving `systemctl` over a [`RemoteRunner`].
pub struct SystemdCommander {
    runner: Arc<dyn RemoteRunner>,
}

impl SystemdCommander {
    pub fn new(runner: Arc<dyn RemoteRunner>) -> Self {
        Self { runner }
    }

    async fn systemctl(
        &self,
        intent: &'static str,
        args: &str,
        service: &str,
    ) -> Result<String, ServiceError> {
        self.runner
            .run(&format!("sudo systemctl {args} {service}"))
            .await
            .map_err(|err| ServiceError::Command {
                intent,
                service: service.to_string(),
                err,
            })
    }
}

#[async_trait]
impl ServiceCommander for SystemdCommander {
    async fn start(&self, service: &str) -> Result<(), ServiceError> {
        self.systemctl("start", "start", service).await.map(|_| ())
    }

    async fn restart(&self, service: &str) -> Result<(), ServiceError> {
        self.runner.run("sudo systemctl daemon-reload").await.map_err(
            |err| ServiceError::Command {
                intent: "reload units before restarting",
                service: service.to_string(),
                err,
            },
        )?;
        self.systemctl("restart", "restart", service).await.map(|_| ())
    }

    async fn is_active(&self, service: &str) -> Result<bool, ServiceError> {
        match self.systemctl("query", "is-active", service).await {
            Ok(output) => Ok(output.trim() == "active"),
            // is-active exits non-zero for every state other than "active";
            // that is an answer, not a failure.
            Err(ServiceError::Command { err, .. })
                if err.stdout().is_some_and(|stdout| {
                    matches!(
                        stdout.trim(),
                        "inactive"
                            | "failed"
                            | "activating"
                            | "deactivating"
                            | "unknown"
                    )
                }) =>
            {
                Ok(false)
            }
            Err(err) => Err(err),
        }
    }
}
