// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Running commands on the host.

use std::process::{ExitStatus, Output};
use tokio::process::Command;

#[derive(thiserror::Error, Debug)]
pub enum HostCommandError {
    #[error("Failed to run [{command}]: {err}")]
    Spawn {
        command: String,
        #[source]
        err: std::io::Error,
    },

    #[error("[{command}] exited with {status}: {}", .stderr.trim())]
    Failed { command: String, status: ExitStatus, stdout: String, stderr: String },
}

/// The command line of `command`, for messages.
fn describe(command: &Command) -> String {
    let command = command.as_std();
    std::iter::once(command.get_program())
        .chain(command.get_args())
        .map(|arg| arg.to_string_lossy())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Runs `command` to completion, failing unless it exits successfully.
pub async fn run_host_command(
    command: &mut Command,
) -> Result<Output, HostCommandError> {
    let output = command.output().await.map_err(|err| {
        HostCommandError::Spawn { command: describe(command), err }
    })?;
    if !output.status.success() {
        return Err(HostCommandError::Failed {
            command: describe(command),
            status: output.status,
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        });
    }
    Ok(output)
}
