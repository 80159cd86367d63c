//! Integration tests for the pressure reconciler.
//!
//! Exercises the create loop against a scripted pressure stream and the
//! delete loop's convergence toward the last observed sample, including
//! disconnect fallback behavior.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use fleetd::cloud::MockCloud;
use fleetd::config::Config;
use fleetd::fleet::{PressureSample, RunnerInstance, RunnerState};
use fleetd::jobhost::MockJobHost;
use fleetd::metrics::FleetMetrics;
use fleetd::reconciler::pressure::PressureReconciler;
use fleetd::stream::mock::MockPressureStream;
use tokio::sync::watch;

fn test_config() -> Config {
    Config {
        cloud_api_url: "http://localhost:8100".to_string(),
        cloud_api_token: "cloud-token".to_string(),
        jobhost_api_url: "http://localhost:8200".to_string(),
        jobhost_api_token: "host-token".to_string(),
        jobhost_scope: "acme/widgets".to_string(),
        fleet_name: "ci-fleet".to_string(),
        runner_image: "runner:latest".to_string(),
        runner_cpu_cores: 2,
        runner_memory_mb: 4096,
        max_runners: 16,
        static_runners: 0,
        fallback_runners: 1,
        reconcile_interval: Duration::from_secs(30),
        delete_interval: Duration::from_millis(50),
        registration_grace: Duration::from_secs(120),
        api_timeout: Duration::from_secs(30),
        stream_backoff_base: Duration::from_millis(10),
        stream_backoff_cap: Duration::from_millis(100),
        rate_limit_floor: 10,
        queue_url: None,
        planner_url: Some("http://localhost:8300/pressure".to_string()),
        planner_token: None,
        log_level: "debug".to_string(),
    }
}

fn sample(value: u32) -> PressureSample {
    PressureSample {
        value,
        observed_at: Utc::now(),
    }
}

fn seed_idle(cloud: &MockCloud, jobhost: &MockJobHost, name: &str, age_secs: i64) {
    cloud.insert(RunnerInstance {
        id: format!("i-{name}"),
        name: name.to_string(),
        state: RunnerState::Idle,
        created_at: Utc::now() - chrono::Duration::seconds(age_secs),
    });
    jobhost.register(name, false);
}

fn reconciler_with(
    cloud: Arc<MockCloud>,
    jobhost: Arc<MockJobHost>,
    stream: Arc<MockPressureStream>,
) -> Arc<PressureReconciler> {
    Arc::new(PressureReconciler::new(
        cloud,
        jobhost,
        stream,
        test_config(),
        Arc::new(FleetMetrics::new()),
    ))
}

#[tokio::test]
async fn scale_up_pass_creates_the_deficit() {
    let cloud = Arc::new(MockCloud::new());
    let jobhost = Arc::new(MockJobHost::new());
    let stream = Arc::new(MockPressureStream::scripted(vec![]));
    let reconciler = reconciler_with(cloud.clone(), jobhost, stream);

    reconciler.note_pressure(sample(4)).await;
    reconciler.scale_up_pass(4).await;

    assert_eq!(cloud.instance_count(), 4);
    assert_eq!(reconciler.current_target().await, 4);
}

#[tokio::test]
async fn scale_up_pass_never_deletes() {
    let cloud = Arc::new(MockCloud::new());
    let jobhost = Arc::new(MockJobHost::new());
    for name in ["ci-fleet-a", "ci-fleet-b", "ci-fleet-c"] {
        seed_idle(&cloud, &jobhost, name, 600);
    }
    let stream = Arc::new(MockPressureStream::scripted(vec![]));
    let reconciler = reconciler_with(cloud.clone(), jobhost, stream);

    // Pressure below actual: the create loop leaves scale-down to the
    // delete loop.
    reconciler.scale_up_pass(1).await;
    assert_eq!(cloud.instance_count(), 3);
}

#[tokio::test]
async fn last_pressure_sample_wins() {
    let cloud = Arc::new(MockCloud::new());
    let jobhost = Arc::new(MockJobHost::new());
    let stream = Arc::new(MockPressureStream::scripted(vec![]));
    let reconciler = reconciler_with(cloud, jobhost, stream);

    reconciler.note_pressure(sample(5)).await;
    reconciler.note_pressure(sample(2)).await;

    assert_eq!(reconciler.current_target().await, 2);
}

#[tokio::test]
async fn target_falls_back_before_any_sample() {
    let cloud = Arc::new(MockCloud::new());
    let jobhost = Arc::new(MockJobHost::new());
    let stream = Arc::new(MockPressureStream::scripted(vec![]));
    let reconciler = reconciler_with(cloud, jobhost, stream);

    // fallback_runners = 1 in the test config.
    assert_eq!(reconciler.current_target().await, 1);
}

#[tokio::test]
async fn delete_pass_converges_down_to_last_pressure() {
    let cloud = Arc::new(MockCloud::new());
    let jobhost = Arc::new(MockJobHost::new());
    for name in [
        "ci-fleet-a",
        "ci-fleet-b",
        "ci-fleet-c",
        "ci-fleet-d",
        "ci-fleet-e",
    ] {
        seed_idle(&cloud, &jobhost, name, 600);
    }
    let stream = Arc::new(MockPressureStream::scripted(vec![]));
    let reconciler = reconciler_with(cloud.clone(), jobhost, stream);

    reconciler.note_pressure(sample(2)).await;
    let run = reconciler.delete_pass().await.unwrap();

    assert_eq!(run.desired, 2);
    assert_eq!(run.deleted.len(), 3);
    assert_eq!(cloud.instance_count(), 2);
}

#[tokio::test]
async fn delete_pass_never_creates() {
    let cloud = Arc::new(MockCloud::new());
    let jobhost = Arc::new(MockJobHost::new());
    seed_idle(&cloud, &jobhost, "ci-fleet-a", 600);
    let stream = Arc::new(MockPressureStream::scripted(vec![]));
    let reconciler = reconciler_with(cloud.clone(), jobhost, stream);

    reconciler.note_pressure(sample(8)).await;
    let run = reconciler.delete_pass().await.unwrap();

    assert!(run.created.is_empty());
    assert_eq!(cloud.instance_count(), 1);
}

#[tokio::test]
async fn delete_pass_still_cleans_stale_instances() {
    let cloud = Arc::new(MockCloud::new());
    let jobhost = Arc::new(MockJobHost::new());
    seed_idle(&cloud, &jobhost, "ci-fleet-ok", 600);
    // Unregistered and well past grace.
    cloud.insert(RunnerInstance {
        id: "i-ghost".to_string(),
        name: "ci-fleet-ghost".to_string(),
        state: RunnerState::Provisioning,
        created_at: Utc::now() - chrono::Duration::seconds(600),
    });
    let stream = Arc::new(MockPressureStream::scripted(vec![]));
    let reconciler = reconciler_with(cloud.clone(), jobhost, stream);

    reconciler.note_pressure(sample(1)).await;
    let run = reconciler.delete_pass().await.unwrap();

    assert!(run.deleted.contains(&"ci-fleet-ghost".to_string()));
    assert_eq!(cloud.instance_count(), 1);
}

#[tokio::test]
async fn create_loop_scales_up_on_streamed_samples() {
    let cloud = Arc::new(MockCloud::new());
    let jobhost = Arc::new(MockJobHost::new());
    let (tx, subscription) = MockPressureStream::subscription();
    let stream = Arc::new(MockPressureStream::scripted(vec![subscription]));
    let reconciler = reconciler_with(cloud.clone(), jobhost, stream);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn({
        let reconciler = reconciler.clone();
        async move {
            reconciler.run_create_loop(shutdown_rx).await;
        }
    });

    tx.send(Ok(sample(3))).unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(cloud.instance_count(), 3);
    assert_eq!(reconciler.current_target().await, 3);

    // A higher sample scales up further.
    tx.send(Ok(sample(5))).unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(cloud.instance_count(), 5);

    shutdown_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(1), handle)
        .await
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn disconnect_falls_back_to_configured_count() {
    let cloud = Arc::new(MockCloud::new());
    let jobhost = Arc::new(MockJobHost::new());
    // Single subscription; once the sender drops, every reconnect fails.
    let (tx, subscription) = MockPressureStream::subscription();
    let stream = Arc::new(MockPressureStream::scripted(vec![subscription]));
    let reconciler = reconciler_with(cloud.clone(), jobhost, stream);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn({
        let reconciler = reconciler.clone();
        async move {
            reconciler.run_create_loop(shutdown_rx).await;
        }
    });

    drop(tx);
    tokio::time::sleep(Duration::from_millis(100)).await;

    // fallback_runners = 1: the loop pinned the target and created one.
    assert_eq!(reconciler.current_target().await, 1);
    assert_eq!(cloud.instance_count(), 1);

    shutdown_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(1), handle)
        .await
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn delete_loop_runs_on_its_interval() {
    let cloud = Arc::new(MockCloud::new());
    let jobhost = Arc::new(MockJobHost::new());
    for name in ["ci-fleet-a", "ci-fleet-b", "ci-fleet-c"] {
        seed_idle(&cloud, &jobhost, name, 600);
    }
    let stream = Arc::new(MockPressureStream::scripted(vec![]));
    let reconciler = reconciler_with(cloud.clone(), jobhost, stream);
    reconciler.note_pressure(sample(1)).await;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn({
        let reconciler = reconciler.clone();
        async move {
            reconciler.run_delete_loop(shutdown_rx).await;
        }
    });

    // delete_interval is 50ms in the test config.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(cloud.instance_count(), 1);

    shutdown_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(1), handle)
        .await
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn scale_up_pass_is_counted_even_when_noop() {
    let cloud = Arc::new(MockCloud::new());
    let jobhost = Arc::new(MockJobHost::new());
    let stream = Arc::new(MockPressureStream::scripted(vec![]));
    let metrics = Arc::new(FleetMetrics::new());
    let reconciler = Arc::new(PressureReconciler::new(
        cloud,
        jobhost,
        stream,
        test_config(),
        metrics.clone(),
    ));

    reconciler.scale_up_pass(0).await;
    assert_eq!(metrics.snapshot().passes, 1);
}

#[tokio::test]
async fn pressure_target_is_clamped_to_max_runners() {
    let cloud = Arc::new(MockCloud::new());
    let jobhost = Arc::new(MockJobHost::new());
    let stream = Arc::new(MockPressureStream::scripted(vec![]));
    let reconciler = reconciler_with(cloud.clone(), jobhost, stream);

    reconciler.note_pressure(sample(500)).await;
    assert_eq!(reconciler.current_target().await, 16);

    reconciler.scale_up_pass(500).await;
    assert_eq!(cloud.instance_count(), 16);
}
