//! Integration tests against a real cluster
//!
//! Run with `cargo test -- --ignored` and a kubeconfig pointing at a
//! disposable cluster (kind, minikube, ...).

use kube_fixtures::{
    FixtureConfig, FixtureContext, FixtureError, KubeClient, PodTemplate, ServiceTemplate,
    WaitFailure, WaitStrategy, WorkerId,
};
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

async fn context() -> FixtureContext {
    kube_fixtures::init_logging();
    FixtureContext::connect(FixtureConfig::from_env())
        .await
        .expect("Should connect to cluster")
}

#[tokio::test]
#[ignore] // Requires real cluster
async fn test_pod_lifecycle() {
    let ctx = context().await;
    let worker = WorkerId::new("pod-lifecycle");

    let pod = ctx.pod(
        PodTemplate::new("main", "busybox:1.36")
            .command(&["sh", "-c", "echo started; sleep 3600"])
            .build(),
    );

    assert!(matches!(
        pod.object_name(&worker),
        Err(FixtureError::NotRunning)
    ));

    let name = pod.create(&worker).await.expect("Should create pod");
    assert!(name.starts_with("kube-fixtures-pod-"));

    let logs = pod.logs(&worker, None).await.expect("Should read logs");
    assert!(logs.contains("started"));

    let mut result = pod
        .exec_in_pod(&worker, &["sh", "-c", "echo out; echo err >&2; exit 3"])
        .await
        .expect("Should exec");
    assert_eq!(result.exit_code(), 3);
    assert_eq!(result.stdout().await.expect("Should read stdout"), "out\n");
    assert_eq!(result.stderr().await.expect("Should read stderr"), "err\n");
    result.close().expect("Should delete capture files");

    pod.remove(&worker).await.expect("Should remove pod");
    pod.remove(&worker).await.expect("Second remove is a no-op");

    assert!(ctx.shutdown().await.is_clean());
}

#[tokio::test]
#[ignore] // Requires real cluster
async fn test_log_wait_and_file_copy() {
    let ctx = context().await;
    let worker = WorkerId::new("log-wait");

    let mut local = tempfile::NamedTempFile::new().expect("Should create temp file");
    writeln!(local, "greeting=hello").expect("Should write temp file");

    let pod = ctx
        .pod(
            PodTemplate::new("main", "busybox:1.36")
                .command(&[
                    "sh",
                    "-c",
                    "echo ready; sleep 1; echo ready; sleep 3600",
                ])
                .build(),
        )
        .with_wait(
            WaitStrategy::log("ready")
                .times(2)
                .with_timeout(Duration::from_secs(60)),
        )
        .with_copy_file_to_container("main", local.path(), "/tmp/conf/app.properties");

    pod.create(&worker).await.expect("Should become ready");

    let result = pod
        .exec_in_pod(&worker, &["cat", "/tmp/conf/app.properties"])
        .await
        .expect("Should exec");
    assert_eq!(
        result.stdout().await.expect("Should read stdout"),
        "greeting=hello\n"
    );

    pod.copy_file_to_container(
        &worker,
        "main",
        local.path(),
        Path::new("/tmp/again.properties"),
    )
    .await
    .expect("Should copy file");

    pod.remove(&worker).await.expect("Should remove pod");
    ctx.shutdown().await;
}

#[tokio::test]
#[ignore] // Requires real cluster
async fn test_log_wait_times_out() {
    let ctx = context().await;
    let worker = WorkerId::new("log-timeout");

    let pod = ctx
        .pod(
            PodTemplate::new("main", "busybox:1.36")
                .command(&["sh", "-c", "echo ready; sleep 3600"])
                .build(),
        )
        .with_wait(
            WaitStrategy::log("ready")
                .times(2)
                .with_timeout(Duration::from_secs(20)),
        );

    match pod.create(&worker).await {
        Err(FixtureError::WaitFailed(err)) => {
            assert_eq!(
                err.failure,
                WaitFailure::ConditionUnmet {
                    expected: 2,
                    observed: 1
                }
            );
        }
        other => panic!("Expected a count mismatch, got {other:?}"),
    }

    // The half-created pod is still removed by the registry
    assert!(ctx.shutdown().await.is_clean());
}

#[tokio::test]
#[ignore] // Requires real cluster with NodePort support
async fn test_port_service_maps_node_ports() {
    kube_fixtures::init_logging();
    let config = FixtureConfig::from_env().use_port_service(true);
    let client = Arc::new(
        KubeClient::connect(&config)
            .await
            .expect("Should connect to cluster"),
    );
    let ctx = FixtureContext::with_clients(config, client.clone(), client);
    let worker = WorkerId::new("port-service");

    let pod = ctx.pod(PodTemplate::new("web", "nginx:1.27").port(80).build());
    pod.create(&worker).await.expect("Should create pod");

    let ports = pod.mapped_ports(&worker).expect("Should be running");
    let node_port = ports.get(&80).copied().expect("Port 80 should be mapped");
    assert!((30000..=32767).contains(&node_port));

    ctx.shutdown().await;
}

#[tokio::test]
#[ignore] // Requires real cluster with a load balancer (e.g. cloud-provider-kind)
async fn test_service_external_ip() {
    let ctx = context().await;
    let worker = WorkerId::new("external-ip");

    let service = ctx
        .service(
            ServiceTemplate::new()
                .selector("app", "nothing")
                .port(80, 80)
                .load_balancer()
                .build(),
        )
        .with_wait(WaitStrategy::external_ip().with_timeout(Duration::from_secs(120)));

    service.create(&worker).await.expect("Should get external IP");
    let ip = service.host_ip(&worker).await.expect("Should have an address");
    assert!(!ip.is_empty());

    service.remove(&worker).await.expect("Should remove service");
    ctx.shutdown().await;
}

#[tokio::test]
#[ignore] // Requires real cluster
async fn test_sweep_leftovers() {
    let ctx = context().await;
    let worker = WorkerId::new("sweep");

    let pod = ctx
        .pod(
            PodTemplate::new("main", "busybox:1.36")
                .command(&["sleep", "3600"])
                .build(),
        )
        .without_wait();
    pod.create(&worker).await.expect("Should create pod");

    let deleted = ctx.sweep_leftovers().await.expect("Should sweep");
    assert!(deleted >= 1);
}
