//! Health classification with liveness signals flowing from running tasks

use std::sync::Arc;
use std::time::Duration;
use warden_core::{
    CrashReport, ErrorKind, HealthStatus, StageContext, StagePolicy, StageSpec, Supervisor,
    SupervisorConfig, TaskDriver,
};
use warden_events::StageId;

fn supervisor(driver: TaskDriver) -> Supervisor {
    Supervisor::builder()
        .config(
            SupervisorConfig::default()
                .with_default_policy(StagePolicy::default().with_timeout(Duration::from_secs(60))),
        )
        .driver(Arc::new(driver))
        .build()
        .expect("valid config")
}

#[tokio::test(start_paused = true)]
async fn heartbeating_task_stays_healthy_then_stalls_then_hangs() {
    let driver = TaskDriver::new().with_stage("ingest", |ctx: StageContext| async move {
        for _ in 0..3 {
            ctx.heartbeat();
            tokio::time::sleep(Duration::from_secs(10)).await;
        }
        ctx.cancelled().await;
        Ok(())
    });
    let supervisor = supervisor(driver);
    let stage = StageId::new("ingest");
    supervisor.launch(StageSpec::new("ingest")).await.unwrap();

    tokio::time::sleep(Duration::from_secs(25)).await;
    let record = supervisor.evaluate(&stage).unwrap();
    assert_eq!(record.status, HealthStatus::Healthy);
    assert_eq!(record.evidence.heartbeats, 3);

    // Last heartbeat at t=20: stalled from t=50, hung from t=80
    tokio::time::sleep(Duration::from_secs(25)).await;
    assert_eq!(supervisor.evaluate(&stage).unwrap().status, HealthStatus::Stalled);

    tokio::time::sleep(Duration::from_secs(30)).await;
    let record = supervisor.evaluate(&stage).unwrap();
    assert_eq!(record.status, HealthStatus::Hung);
    assert_eq!(record.evidence.since_heartbeat, Some(Duration::from_secs(60)));
}

#[tokio::test(start_paused = true)]
async fn silent_task_goes_straight_to_hung() {
    let driver = TaskDriver::new().with_stage("ingest", |ctx: StageContext| async move {
        ctx.cancelled().await;
        Ok(())
    });
    let supervisor = supervisor(driver);
    let stage = StageId::new("ingest");
    supervisor.launch(StageSpec::new("ingest")).await.unwrap();

    tokio::time::sleep(Duration::from_secs(45)).await;
    assert_eq!(supervisor.evaluate(&stage).unwrap().status, HealthStatus::Healthy);
    tokio::time::sleep(Duration::from_secs(15)).await;
    assert_eq!(supervisor.evaluate(&stage).unwrap().status, HealthStatus::Hung);
}

#[tokio::test(start_paused = true)]
async fn returned_error_is_reported_as_crash() {
    let driver = TaskDriver::new().with_stage("ingest", |_ctx: StageContext| async move {
        Err(CrashReport::from_trace(
            "KeyError",
            "'user_id'",
            "Traceback (most recent call last):\n  File \"run.py\", line 3, in <module>\n  File \"stages/transform.py\", line 4, in transform\nKeyError: 'user_id'",
        ))
    });
    let supervisor = supervisor(driver);
    let stage = StageId::new("ingest");
    supervisor.launch(StageSpec::new("ingest")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;

    let record = supervisor.evaluate(&stage).unwrap();
    assert_eq!(record.status, HealthStatus::Crashed);
    let crash = record.crash().expect("crash attached");
    assert_eq!(crash.kind, ErrorKind::MissingKey);
    let location = crash.location.clone().expect("location parsed");
    assert_eq!(location.unit, "stages/transform.py");
    assert_eq!(location.line, 4);
}

#[tokio::test(start_paused = true)]
async fn evaluation_without_new_signals_is_idempotent() {
    let driver = TaskDriver::new().with_stage("ingest", |ctx: StageContext| async move {
        ctx.heartbeat();
        ctx.cancelled().await;
        Ok(())
    });
    let supervisor = supervisor(driver);
    let stage = StageId::new("ingest");
    supervisor.launch(StageSpec::new("ingest")).await.unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;

    let first = supervisor.evaluate(&stage).unwrap();
    tokio::time::sleep(Duration::from_secs(5)).await;
    let second = supervisor.evaluate(&stage).unwrap();
    assert_eq!(first, second);
}

#[tokio::test(start_paused = true)]
async fn completed_task_is_healthy_and_exited() {
    let driver = TaskDriver::new().with_stage("ingest", |ctx: StageContext| async move {
        ctx.heartbeat();
        Ok(())
    });
    let supervisor = supervisor(driver);
    let stage = StageId::new("ingest");
    supervisor.launch(StageSpec::new("ingest")).await.unwrap();
    tokio::time::sleep(Duration::from_secs(120)).await;

    let record = supervisor.evaluate(&stage).unwrap();
    assert_eq!(record.status, HealthStatus::Healthy);
    assert!(record.evidence.exited);
}
