// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! CLI for managing the single-node cluster VM

#[macro_use]
extern crate slog;

use anyhow::Context;
use camino::Utf8PathBuf;
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use snc_machine::config::{
    StartConfig, DEFAULT_CPUS, DEFAULT_MEMORY_MIB, DEFAULT_NAME,
};
use snc_machine::sim::SimBackend;
use snc_machine::ssh::SshKeygen;
use snc_machine::{CommandError, Machine};
use std::net::IpAddr;
use std::process::ExitCode;
use std::sync::Arc;

mod config;
mod output;

use config::{Config, PullSecretSource};
use output::OutputFormat;

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let args = Snc::parse();
    match run(args).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("Error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

/// Manage a single-node OpenShift cluster running in a local VM
#[derive(Debug, Parser)]
#[command(name = "snc", version)]
struct Snc {
    /// Path to a TOML configuration file
    #[arg(long, global = true, env = "SNC_CONFIG")]
    config: Option<Utf8PathBuf>,

    /// Log debug output to the terminal
    #[arg(long, global = true)]
    debug: bool,

    /// Output format
    #[arg(long, short, global = true, value_enum, default_value_t)]
    output: OutputFormat,

    #[command(subcommand)]
    command: SncCommands,
}

#[derive(Debug, Subcommand)]
enum SncCommands {
    /// Create the instance if needed, then start it and its cluster
    Start(StartArgs),
    /// Gracefully stop the instance
    Stop(NameArgs),
    /// Stop the instance immediately
    #[command(alias = "kill")]
    Poweroff(NameArgs),
    /// Delete the instance and its VM
    Delete(NameArgs),
    /// Show the state of the instance and its cluster
    Status(NameArgs),
    /// Print the IP address of the instance
    Ip(NameArgs),
    /// Print the URL of the cluster's web console
    Console(NameArgs),
    /// Print the proxy settings of the cluster
    Proxy(NameArgs),
}

#[derive(Debug, Args)]
struct NameArgs {
    /// Name of the instance
    #[arg(long, short, default_value = DEFAULT_NAME)]
    name: String,
}

#[derive(Debug, Args)]
struct StartArgs {
    #[command(flatten)]
    name: NameArgs,

    /// Bundle to create the instance from
    #[arg(long, short, env = "SNC_BUNDLE")]
    bundle: Utf8PathBuf,

    /// Number of CPUs of a new instance
    #[arg(long, short, default_value_t = DEFAULT_CPUS)]
    cpus: u32,

    /// Memory of a new instance, in MiB
    #[arg(long, short, default_value_t = DEFAULT_MEMORY_MIB)]
    memory: u64,

    /// Additional nameserver for the instance
    #[arg(long)]
    nameserver: Option<IpAddr>,

    /// File containing the pull secret (read from SNC_PULL_SECRET if not
    /// given)
    #[arg(long, short, env = "SNC_PULL_SECRET_FILE")]
    pull_secret_file: Option<Utf8PathBuf>,
}

async fn run(args: Snc) -> anyhow::Result<ExitCode> {
    let config = match &args.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };
    let paths = config.paths()?;
    let log_context = config
        .logging(&paths, args.debug)
        .to_logger("snc")
        .context("failed to create logger")?;
    let log = log_context.log.clone();
    debug!(log, "snc starting"; "base_dir" => %paths.base_dir());

    let backend = SimBackend::new(&log, config.sim.clone(), &paths)
        .with_key_generator(Arc::new(SshKeygen));
    let machine =
        Machine::new(&log, Arc::new(backend), paths, config.tunables.clone());
    let format = args.output;

    let code = match args.command {
        SncCommands::Start(start) => {
            let name = start.name.name.clone();
            let start_config = StartConfig {
                name: name.clone(),
                bundle_path: start.bundle,
                cpus: start.cpus,
                memory_mib: start.memory,
                nameserver: start.nameserver,
                pull_secret: Arc::new(PullSecretSource {
                    file: start.pull_secret_file,
                }),
            };
            let result = machine.start(&start_config).await;
            report(format, &name, result, output::start_text)?
        }
        SncCommands::Stop(NameArgs { name }) => {
            let result = machine.stop(&name).await;
            report(format, &name, result, |_| {
                "Stopped the instance".to_string()
            })?
        }
        SncCommands::Poweroff(NameArgs { name }) => {
            let result = machine.power_off(&name).await;
            report(format, &name, result, |_| {
                "Powered off the instance".to_string()
            })?
        }
        SncCommands::Delete(NameArgs { name }) => {
            let result = machine.delete(&name).await;
            report(format, &name, result, |_| {
                "Deleted the instance".to_string()
            })?
        }
        SncCommands::Status(NameArgs { name }) => {
            let result = machine.status(&name).await;
            report(format, &name, result, output::status_text)?
        }
        SncCommands::Ip(NameArgs { name }) => {
            let result = machine.ip(&name).await;
            report(format, &name, result, |result| result.ip.to_string())?
        }
        SncCommands::Console(NameArgs { name }) => {
            let result = machine.console_url(&name).await;
            report(format, &name, result, output::console_text)?
        }
        SncCommands::Proxy(NameArgs { name }) => {
            let result = machine.proxy_config(&name).await;
            report(format, &name, result, output::proxy_text)?
        }
    };
    Ok(code)
}

/// Prints the outcome of a command in the requested format.
fn report<T, F>(
    format: OutputFormat,
    name: &str,
    result: Result<T, CommandError>,
    text: F,
) -> anyhow::Result<ExitCode>
where
    T: Serialize,
    F: FnOnce(&T) -> String,
{
    let code =
        if result.is_ok() { ExitCode::SUCCESS } else { ExitCode::FAILURE };
    match format {
        OutputFormat::Json => {
            let output = output::command_output(name, &result)
                .context("failed to serialize the result")?;
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Text => match &result {
            Ok(result) => println!("{}", text(result)),
            Err(err) => eprintln!("{err}"),
        },
    }
    Ok(code)
}
