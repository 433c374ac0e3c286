// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Tests of the start sequence against the simulated backend

use crate::common::{is_command, position, TestContext, BUNDLE_STEM};
use snc_machine::config::PullSecretError;
use snc_machine::sim::{ClusterOp, DriverOp, SimConfig, SimEvent};
use snc_machine::config::Tunables;
use snc_machine::Error;
use std::sync::Arc;
use tokio::time::Instant;

const START_KUBELET: &str = "sudo systemctl start kubelet";

fn count(events: &[SimEvent], wanted: &SimEvent) -> usize {
    events.iter().filter(|event| *event == wanted).count()
}

#[tokio::test(start_paused = true)]
async fn test_first_start() {
    let config = SimConfig { host_ip_failures: 2, ..Default::default() };
    let ctx = TestContext::new(config);
    let settle_delay = Tunables::default().settle_delay;

    let started_at = Instant::now();
    let result = ctx.machine.start(&ctx.start_config("demo")).await.unwrap();
    assert!(started_at.elapsed() >= settle_delay);
    assert_eq!(result.name, "demo");
    assert!(result.kubelet_started);
    assert_eq!(result.status, "Running");
    assert_eq!(result.openshift_version.as_deref(), Some("4.17.0"));
    let cluster_config = result.cluster_config.unwrap();
    assert_eq!(cluster_config.cluster_api, "https://api.crc.testing:6443");
    assert_eq!(cluster_config.kubeadmin_password, "s3cret-Pass");
    assert_eq!(
        cluster_config.kubeconfig,
        ctx.paths.cache_dir().join(BUNDLE_STEM).join("kubeconfig")
    );

    let events = ctx.events();
    // The host address showed up on the third lookup.
    assert_eq!(count(&events, &SimEvent::HostIpQuery), 3);
    assert_eq!(
        ctx.backend.driver_mutations(),
        vec![SimEvent::Driver { op: DriverOp::Create, name: "demo".into() }]
    );

    // The bundle key is replaced by a key of the instance's own.
    let key_path = ctx.paths.private_key_path("demo");
    let generated = position(&events, |e| {
        *e == SimEvent::KeyGenerated { path: key_path.clone() }
    });
    let authorized = position(&events, |e| {
        e.command().is_some_and(|c| c.ends_with("> /home/core/.ssh/authorized_keys"))
    });
    let switched = position(&events, |e| {
        *e == SimEvent::SetPrivateKey { path: key_path.clone() }
    });
    assert!(generated < authorized && authorized < switched);

    let kubeconfig =
        std::fs::read_to_string(ctx.paths.kubeconfig_path("demo")).unwrap();
    assert!(kubeconfig.starts_with("apiVersion: v1"));

    // DNS is configured before anything relies on it.
    let dnsmasq = position(&events, |e| {
        is_command(e, "sudo systemctl restart dnsmasq")
    });
    let internal_query = position(&events, |e| {
        is_command(e, "host -R 3 foo.apps-crc.testing")
    });
    assert!(dnsmasq < internal_query);

    // First-boot cluster configuration, then the API server refresh.
    let cluster = |op| position(&events, |e| *e == SimEvent::Cluster(op));
    assert!(position(&events, |e| is_command(e, START_KUBELET))
        < cluster(ClusterOp::AddPullSecret));
    assert!(cluster(ClusterOp::AddPullSecret) < cluster(ClusterOp::UpdateClusterId));
    assert!(
        cluster(ClusterOp::UpdateClusterId)
            < cluster(ClusterOp::WaitForRequestHeaderClientCa)
    );
    assert!(
        cluster(ClusterOp::WaitForRequestHeaderClientCa)
            < cluster(ClusterOp::DeleteOpenshiftApiserverPods)
    );
    assert!(
        cluster(ClusterOp::DeleteOpenshiftApiserverPods)
            < cluster(ClusterOp::ApproveNodeCsr)
    );
    assert_eq!(
        count(&events, &SimEvent::Cluster(ClusterOp::RenewCertificates)),
        0
    );

    // The node CSR is approved only once the cluster had time to settle.
    let timed = ctx.backend.timed_events();
    let at = |op| {
        timed
            .iter()
            .find(|(_, e)| *e == SimEvent::Cluster(op))
            .map(|(when, _)| *when)
            .unwrap()
    };
    assert!(
        at(ClusterOp::ApproveNodeCsr)
            >= at(ClusterOp::DeleteOpenshiftApiserverPods) + settle_delay
    );

    assert!(ctx.machine.exists("demo").await.unwrap());
}

#[tokio::test(start_paused = true)]
async fn test_start_of_running_instance_does_nothing() {
    let mut ctx = TestContext::new(SimConfig::default());
    ctx.machine.start(&ctx.start_config("demo")).await.unwrap();

    ctx.reopen(SimConfig::default());
    let result = ctx.machine.start(&ctx.start_config("demo")).await.unwrap();
    assert!(!result.kubelet_started);
    assert!(result.cluster_config.is_none());
    assert_eq!(result.status, "Running");
    assert_eq!(result.openshift_version.as_deref(), Some("4.17.0"));

    assert!(ctx.backend.driver_mutations().is_empty());
    assert!(ctx.commands().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_restart_of_stopped_instance() {
    let mut ctx = TestContext::new(SimConfig::default());
    ctx.machine.start(&ctx.start_config("demo")).await.unwrap();
    ctx.machine.stop("demo").await.unwrap();

    ctx.reopen(SimConfig::default());
    let result = ctx.machine.start(&ctx.start_config("demo")).await.unwrap();
    assert!(result.kubelet_started);
    assert!(result.cluster_config.is_some());

    assert_eq!(
        ctx.backend.driver_mutations(),
        vec![SimEvent::Driver { op: DriverOp::Start, name: "demo".into() }]
    );
    // First-boot steps are not repeated.
    let events = ctx.events();
    assert!(!events.iter().any(|e| matches!(e, SimEvent::KeyGenerated { .. })));
    assert_eq!(count(&events, &SimEvent::Cluster(ClusterOp::AddPullSecret)), 0);
    assert_eq!(
        count(&events, &SimEvent::Cluster(ClusterOp::UpdateClusterId)),
        0
    );
    assert_eq!(count(&events, &SimEvent::Cluster(ClusterOp::ApproveNodeCsr)), 1);
}

#[tokio::test(start_paused = true)]
async fn test_bundle_mismatch_changes_nothing() {
    let mut ctx = TestContext::new(SimConfig::default());
    ctx.machine.start(&ctx.start_config("demo")).await.unwrap();
    ctx.machine.stop("demo").await.unwrap();

    ctx.reopen(SimConfig::default());
    let mut config = ctx.start_config("demo");
    config.bundle_path = config.bundle_path.with_file_name("snc_libvirt_4.18.0.crcbundle");
    let err = ctx.machine.start(&config).await.unwrap_err();

    assert_eq!(err.name, "demo");
    assert_eq!(err.stage, "Invalid bundle");
    match &err.source {
        Error::BundleMismatch { requested, existing } => {
            assert_eq!(requested, "snc_libvirt_4.18.0.crcbundle");
            assert_eq!(existing, "snc_libvirt_4.17.0.crcbundle");
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(ctx.backend.driver_mutations().is_empty());
    assert!(ctx.commands().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_expired_certificates_are_renewed_before_kubelet() {
    let ctx = TestContext::new(SimConfig {
        certs_expired: true,
        ..Default::default()
    });
    ctx.machine.start(&ctx.start_config("demo")).await.unwrap();

    let events = ctx.events();
    let renewed = position(&events, |e| {
        *e == SimEvent::Cluster(ClusterOp::RenewCertificates)
    });
    let kubelet = position(&events, |e| is_command(e, START_KUBELET));
    assert!(renewed < kubelet);
}

#[tokio::test(start_paused = true)]
async fn test_certificate_renewal_failure() {
    let ctx = TestContext::new(SimConfig {
        certs_expired: true,
        renewal_fails: true,
        ..Default::default()
    });
    let err = ctx.machine.start(&ctx.start_config("demo")).await.unwrap_err();

    assert_eq!(err.stage, "Failed to renew TLS certificates");
    assert!(matches!(err.source, Error::CertificateRenewal(_)));
    assert!(err
        .to_string()
        .contains("please check if a newer bundle is available"));
    assert!(!ctx.commands().iter().any(|c| c == START_KUBELET));
}

#[tokio::test(start_paused = true)]
async fn test_host_ip_lookup_gives_up() {
    let ctx = TestContext::new(SimConfig {
        host_ip_failures: u32::MAX,
        ..Default::default()
    });
    let err = ctx.machine.start(&ctx.start_config("demo")).await.unwrap_err();

    assert_eq!(err.stage, "Error determining host IP");
    assert_eq!(count(&ctx.events(), &SimEvent::HostIpQuery), 30);
    // Nothing after the failed step ran.
    assert!(!ctx.commands().iter().any(|c| c == "sudo systemctl restart dnsmasq"));
}

#[tokio::test(start_paused = true)]
async fn test_ssh_becomes_available() {
    let ctx = TestContext::new(SimConfig {
        ssh_failures: 5,
        ..Default::default()
    });
    ctx.machine.start(&ctx.start_config("demo")).await.unwrap();
    let attempts = ctx.commands().iter().filter(|c| *c == "exit 0").count();
    assert_eq!(attempts, 6);
}

#[tokio::test(start_paused = true)]
async fn test_internal_dns_failure_is_fatal() {
    let ctx = TestContext::new(SimConfig {
        internal_dns_fails: true,
        ..Default::default()
    });
    let err = ctx.machine.start(&ctx.start_config("demo")).await.unwrap_err();
    assert_eq!(
        err.stage,
        "Failed internal DNS query: Host foo.apps-crc.testing not found: \
         3(NXDOMAIN)"
    );
}

#[tokio::test(start_paused = true)]
async fn test_public_dns_failure_is_tolerated() {
    let ctx = TestContext::new(SimConfig {
        public_dns_fails: true,
        ..Default::default()
    });
    let result = ctx.machine.start(&ctx.start_config("demo")).await.unwrap();
    assert!(result.kubelet_started);
}

#[tokio::test(start_paused = true)]
async fn test_host_dns_failure_is_fatal() {
    let ctx = TestContext::new(SimConfig {
        host_dns_fails: true,
        ..Default::default()
    });
    let err = ctx.machine.start(&ctx.start_config("demo")).await.unwrap_err();
    assert_eq!(err.stage, "Failed to query DNS from host");
    assert!(matches!(err.source, Error::Network(_)));
}

#[tokio::test(start_paused = true)]
async fn test_nameserver_is_added() {
    let ctx = TestContext::new(SimConfig::default());
    let mut config = ctx.start_config("demo");
    config.nameserver = Some("10.0.0.53".parse().unwrap());
    ctx.machine.start(&config).await.unwrap();

    let commands = ctx.commands();
    assert!(commands.iter().any(|c| {
        c == "echo 'nameserver 10.0.0.53' | sudo tee -a /etc/resolv.conf"
    }));
}

#[tokio::test(start_paused = true)]
async fn test_inactive_kubelet_skips_api_server_refresh() {
    let ctx = TestContext::new(SimConfig {
        kubelet_active: false,
        ..Default::default()
    });
    let result = ctx.machine.start(&ctx.start_config("demo")).await.unwrap();
    assert!(!result.kubelet_started);

    let events = ctx.events();
    assert_eq!(
        count(
            &events,
            &SimEvent::Cluster(ClusterOp::WaitForRequestHeaderClientCa)
        ),
        0
    );
    assert_eq!(count(&events, &SimEvent::Cluster(ClusterOp::ApproveNodeCsr)), 1);
}

#[tokio::test(start_paused = true)]
async fn test_pull_secret_failure_creates_nothing() {
    let ctx = TestContext::new(SimConfig::default());
    let mut config = ctx.start_config("demo");
    config.pull_secret = Arc::new(|| -> Result<String, PullSecretError> {
        Err("no pull secret in the keyring".into())
    });
    let err = ctx.machine.start(&config).await.unwrap_err();

    assert_eq!(err.stage, "Failed to get pull secret");
    assert!(matches!(err.source, Error::PullSecret(_)));
    assert!(ctx.backend.driver_mutations().is_empty());
    assert!(!ctx.machine.exists("demo").await.unwrap());
}

#[tokio::test(start_paused = true)]
async fn test_bundle_is_extracted_on_first_use() {
    let ctx = TestContext::with_archive(SimConfig::default());
    assert!(!ctx.paths.cache_dir().join(BUNDLE_STEM).exists());

    ctx.machine.start(&ctx.start_config("demo")).await.unwrap();
    assert!(ctx
        .paths
        .cache_dir()
        .join(BUNDLE_STEM)
        .join("bundle-info.json")
        .exists());
}
