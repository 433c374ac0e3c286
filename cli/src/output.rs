// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Presentation of command results

use serde::Serialize;
use serde_json::{Map, Value};
use snc_common::proxy::ProxyConfig;
use snc_machine::{
    CommandError, ConsoleResult, StartResult, StatusResult,
};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

/// Builds the JSON form of a command's outcome: the result's own fields,
/// plus `name`, `success` and, on failure, `error`.
pub fn command_output<T: Serialize>(
    name: &str,
    result: &Result<T, CommandError>,
) -> Result<Value, serde_json::Error> {
    let mut output = match result {
        Ok(result) => match serde_json::to_value(result)? {
            Value::Object(fields) => fields,
            other => {
                let mut fields = Map::new();
                fields.insert("result".to_string(), other);
                fields
            }
        },
        Err(_) => Map::new(),
    };
    output.insert("name".to_string(), Value::from(name));
    output.insert("success".to_string(), Value::from(result.is_ok()));
    if let Err(err) = result {
        output.insert("error".to_string(), Value::from(err.to_string()));
        output.insert("stage".to_string(), Value::from(err.stage.clone()));
    }
    Ok(Value::Object(output))
}

pub fn start_text(result: &StartResult) -> String {
    let Some(cluster) = &result.cluster_config else {
        return match &result.openshift_version {
            Some(version) => format!(
                "A cluster for OpenShift {version} is already running"
            ),
            None => "A cluster is already running".to_string(),
        };
    };

    let mut lines = Vec::new();
    if result.kubelet_started {
        lines.push("Started the OpenShift cluster.".to_string());
    } else {
        lines.push(
            "The OpenShift cluster was started, but the kubelet is not \
             running yet. Run 'snc status' to follow its progress."
                .to_string(),
        );
    }
    lines.extend([
        String::new(),
        "The server is accessible via web console at:".to_string(),
        format!("  {}", cluster.web_console_url),
        String::new(),
        "Log in as administrator:".to_string(),
        "  Username: kubeadmin".to_string(),
        format!("  Password: {}", cluster.kubeadmin_password),
        String::new(),
        "Log in as user:".to_string(),
        "  Username: developer".to_string(),
        "  Password: developer".to_string(),
        String::new(),
        "Use the 'oc' command line interface:".to_string(),
        format!("  $ oc login -u developer -p developer {}", cluster.cluster_api),
        format!(
            "  $ oc login -u kubeadmin -p {} {}",
            cluster.kubeadmin_password, cluster.cluster_api
        ),
    ]);
    lines.join("\n")
}

pub fn status_text(result: &StatusResult) -> String {
    let mut lines = vec![
        format!("VM:          {}", result.vm_status),
        format!("OpenShift:   {}", result.openshift_status),
    ];
    if result.disk_size > 0 {
        lines.push(format!(
            "Disk Usage:  {} of {} (Inside the VM)",
            gibibytes(result.disk_use),
            gibibytes(result.disk_size),
        ));
    }
    lines.join("\n")
}

pub fn console_text(result: &ConsoleResult) -> String {
    format!(
        "{}\n(VM state: {})",
        result.cluster_config.web_console_url, result.state
    )
}

pub fn proxy_text(proxy: &ProxyConfig) -> String {
    if !proxy.is_enabled() {
        return "No proxy is configured".to_string();
    }
    let unset = || "(unset)".to_string();
    [
        format!("HTTP proxy:  {}", proxy.http_proxy.clone().unwrap_or_else(unset)),
        format!("HTTPS proxy: {}", proxy.https_proxy.clone().unwrap_or_else(unset)),
        format!("No proxy:    {}", proxy.no_proxy_string()),
    ]
    .join("\n")
}

fn gibibytes(bytes: u64) -> String {
    format!("{:.1}GiB", bytes as f64 / f64::from(1u32 << 30))
}
