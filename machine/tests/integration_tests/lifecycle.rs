// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Tests of the commands other than start

use crate::common::TestContext;
use snc_machine::cluster::OperatorsStatus;
use snc_machine::driver::VmState;
use snc_machine::sim::{ClusterOp, DriverOp, SimConfig, SimEvent};
use snc_machine::Error;

async fn started(config: SimConfig) -> TestContext {
    let ctx = TestContext::new(config);
    ctx.machine.start(&ctx.start_config("demo")).await.unwrap();
    ctx
}

#[tokio::test(start_paused = true)]
async fn test_stop_then_status() {
    let ctx = started(SimConfig::default()).await;

    let ip = ctx.machine.ip("demo").await.unwrap();
    assert_eq!(ip.ip, SimConfig::default().vm_ip);

    let stopped = ctx.machine.stop("demo").await.unwrap();
    assert!(stopped.success);
    assert_eq!(stopped.state, Some(VmState::Running));

    let err = ctx.machine.ip("demo").await.unwrap_err();
    assert_eq!(err.stage, "Cannot get IP");

    let status = ctx.machine.status("demo").await.unwrap();
    assert_eq!(status.vm_status, "Stopped");
    assert_eq!(status.openshift_status, "Stopped");
    assert_eq!((status.disk_size, status.disk_use), (0, 0));
}

#[tokio::test(start_paused = true)]
async fn test_power_off() {
    let ctx = started(SimConfig::default()).await;
    let result = ctx.machine.power_off("demo").await.unwrap();
    assert!(result.success);
    assert!(ctx.backend.driver_mutations().contains(&SimEvent::Driver {
        op: DriverOp::Kill,
        name: "demo".into(),
    }));
    let console = ctx.machine.console_url("demo").await.unwrap();
    assert_eq!(console.state, VmState::Stopped);
}

#[tokio::test(start_paused = true)]
async fn test_status_of_running_cluster() {
    let config = SimConfig::default();
    let ctx = started(config.clone()).await;

    let status = ctx.machine.status("demo").await.unwrap();
    assert!(status.success);
    assert_eq!(status.vm_status, "Running");
    assert_eq!(status.openshift_status, "Running (v4.17.0)");
    assert_eq!(status.disk_size, config.disk_size);
    assert_eq!(status.disk_use, config.disk_use);
}

#[tokio::test(start_paused = true)]
async fn test_status_of_degraded_cluster() {
    let ctx = started(SimConfig {
        operators: OperatorsStatus {
            available: false,
            degraded: true,
            progressing: true,
        },
        ..Default::default()
    })
    .await;
    let status = ctx.machine.status("demo").await.unwrap();
    assert_eq!(status.openshift_status, "Degraded");
}

#[tokio::test(start_paused = true)]
async fn test_status_of_unreachable_cluster() {
    let ctx = started(SimConfig {
        operators_unreachable: true,
        ..Default::default()
    })
    .await;
    let status = ctx.machine.status("demo").await.unwrap();
    assert!(status.success);
    assert_eq!(status.vm_status, "Running");
    assert_eq!(status.openshift_status, "Not Reachable");
}

#[tokio::test(start_paused = true)]
async fn test_status_without_vm_address() {
    let mut ctx = started(SimConfig::default()).await;
    ctx.reopen(SimConfig { ip_lookup_fails: true, ..Default::default() });

    let status = ctx.machine.status("demo").await.unwrap();
    assert!(status.success);
    assert_eq!(status.vm_status, "Running");
    assert_eq!(status.openshift_status, "Not Reachable");
    assert_eq!((status.disk_size, status.disk_use), (0, 0));
    assert!(!ctx
        .events()
        .iter()
        .any(|e| *e == SimEvent::Cluster(ClusterOp::OperatorsStatus)));
}

#[tokio::test(start_paused = true)]
async fn test_delete() {
    let ctx = started(SimConfig::default()).await;
    let result = ctx.machine.delete("demo").await.unwrap();
    assert!(result.success);
    assert!(!ctx.machine.exists("demo").await.unwrap());
    assert!(!ctx.paths.instance_dir("demo").exists());
}

#[tokio::test(start_paused = true)]
async fn test_failed_removal_keeps_the_instance() {
    let ctx = started(SimConfig { remove_fails: true, ..Default::default() })
        .await;
    let err = ctx.machine.delete("demo").await.unwrap_err();
    assert_eq!(err.stage, "Driver cannot remove machine");
    assert!(ctx.machine.exists("demo").await.unwrap());
    assert_eq!(
        ctx.machine.status("demo").await.unwrap().vm_status,
        "Running"
    );
}

#[tokio::test]
async fn test_missing_instance() {
    let ctx = TestContext::new(SimConfig::default());

    let err = ctx.machine.stop("nope").await.unwrap_err();
    assert_eq!(err.name, "nope");
    assert_eq!(err.stage, "Cannot load machine");
    assert!(matches!(err.source, Error::Store(_)));

    let err = ctx.machine.status("nope").await.unwrap_err();
    assert_eq!(
        err.to_string(),
        "Cannot load machine: machine 'nope' does not exist"
    );

    assert!(ctx.machine.delete("nope").await.is_err());
    assert!(ctx.machine.power_off("nope").await.is_err());
    assert!(ctx.backend.driver_mutations().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_console_and_proxy() {
    let ctx = started(SimConfig::default()).await;

    let console = ctx.machine.console_url("demo").await.unwrap();
    assert_eq!(console.state, VmState::Running);
    assert_eq!(
        console.cluster_config.web_console_url,
        "https://console-openshift-console.apps-crc.testing"
    );
    assert_eq!(
        console.cluster_config.cluster_api,
        "https://api.crc.testing:6443"
    );

    let proxy = ctx.machine.proxy_config("demo").await.unwrap();
    assert!(proxy.no_proxy().iter().any(|entry| entry == "localhost"));
}
