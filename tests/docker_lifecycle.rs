//! Lifecycle against a real Docker daemon
//!
//! Skipped unless TEST_DOCKER is set. Pulls a small nginx image, so it also
//! needs network access on the first run.

use std::sync::Arc;
use std::time::Duration;

use mandelgate::docker::DockerRuntime;
use mandelgate::lifecycle::{ContainerLifecycle, ContainerState, LifecycleConfig, PullPolicy};
use mandelgate::pool::{ConnectionPool, PoolConfig};
use mandelgate::runtime::ContainerRuntime;
use tokio::sync::watch;

const TEST_IMAGE: &str = "nginx:alpine";

fn docker_tests_enabled() -> bool {
    std::env::var("TEST_DOCKER").is_ok()
}

fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

#[tokio::test]
async fn test_start_wait_ready_stop() {
    if !docker_tests_enabled() {
        eprintln!("Skipping Docker lifecycle test (set TEST_DOCKER=1 to run)");
        return;
    }

    let runtime = DockerRuntime::connect(None).await.unwrap();

    let mut config = LifecycleConfig::new(TEST_IMAGE, 80, free_port());
    config.container_name = format!("mandelgate-test-{}", std::process::id());
    config.pull_policy = PullPolicy::IfNotPresent;
    config.stop_grace = Duration::from_secs(2);

    let pool = Arc::new(ConnectionPool::new(PoolConfig::default()));
    let mut lifecycle = ContainerLifecycle::new(runtime, config, pool);
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);

    let handle = lifecycle.start(&shutdown_rx).await.unwrap();
    assert!(!handle.id().is_empty());
    assert_eq!(handle.image(), TEST_IMAGE);

    let ready = lifecycle
        .wait_ready(&handle, Duration::from_secs(60), &shutdown_rx)
        .await;
    if let Err(e) = ready {
        let _ = lifecycle.stop(handle, Duration::from_secs(30)).await;
        panic!("container never became ready: {}", e);
    }
    assert_eq!(lifecycle.state(), ContainerState::Ready);

    let id = handle.id().to_string();
    lifecycle.stop(handle, Duration::from_secs(30)).await.unwrap();
    assert_eq!(lifecycle.state(), ContainerState::Removed);

    // Already gone: both calls are no-ops
    lifecycle
        .runtime()
        .stop_container(&id, Duration::from_secs(1))
        .await
        .unwrap();
    lifecycle.runtime().remove_container(&id).await.unwrap();
}

#[tokio::test]
async fn test_never_policy_with_missing_image() {
    if !docker_tests_enabled() {
        eprintln!("Skipping Docker lifecycle test (set TEST_DOCKER=1 to run)");
        return;
    }

    let runtime = DockerRuntime::connect(None).await.unwrap();
    assert!(!runtime
        .image_exists("mandelgate/does-not-exist:never")
        .await
        .unwrap());

    let mut config = LifecycleConfig::new("mandelgate/does-not-exist:never", 80, free_port());
    config.container_name = format!("mandelgate-missing-{}", std::process::id());
    config.pull_policy = PullPolicy::Never;

    let pool = Arc::new(ConnectionPool::new(PoolConfig::default()));
    let mut lifecycle = ContainerLifecycle::new(runtime, config, pool);
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);

    assert!(lifecycle.start(&shutdown_rx).await.is_err());
    assert_eq!(lifecycle.state(), ContainerState::Failed);
}
