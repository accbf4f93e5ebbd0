//! Circuit breaker behaviour through the supervisor facade

use proptest::prelude::*;
use std::sync::Arc;
use std::time::Duration;
use warden_core::{
    BreakerConfig, BreakerState, CircuitBreakerRegistry, HealthEventBus, StagePolicy, StageSpec,
    Supervisor, SupervisorConfig,
};
use warden_events::StageId;
use warden_test_utils::FakeDriver;

fn supervisor(driver: Arc<FakeDriver>) -> Supervisor {
    let policy = StagePolicy::default().with_breaker(
        BreakerConfig::default()
            .with_failure_threshold(3)
            .with_cooldown(Duration::from_secs(60)),
    );
    Supervisor::builder()
        .config(SupervisorConfig::default().with_default_policy(policy))
        .driver(driver)
        .build()
        .expect("valid config")
}

#[tokio::test(start_paused = true)]
async fn three_failures_open_and_the_fourth_attempt_never_runs() {
    let driver = FakeDriver::new();
    let supervisor = supervisor(driver.clone());
    let stage = StageId::new("ingest");
    supervisor.register(StageSpec::new("ingest"));

    for _ in 0..3 {
        assert!(supervisor.allow_attempt(&stage));
        supervisor.record_outcome(&stage, false);
    }
    let snapshot = supervisor.snapshot();
    let breaker = snapshot.stages[&stage].breaker.clone().expect("breaker registered");
    assert_eq!(breaker.state, BreakerState::Open);
    assert_eq!(breaker.consecutive_failures, 3);

    assert!(!supervisor.allow_attempt(&stage));
    assert!(driver.calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn cooldown_admits_one_trial_and_success_closes() {
    let driver = FakeDriver::new();
    let supervisor = supervisor(driver);
    let stage = StageId::new("ingest");
    supervisor.register(StageSpec::new("ingest"));
    for _ in 0..3 {
        supervisor.allow_attempt(&stage);
        supervisor.record_outcome(&stage, false);
    }

    tokio::time::advance(Duration::from_secs(59)).await;
    assert!(!supervisor.allow_attempt(&stage));

    tokio::time::advance(Duration::from_secs(1)).await;
    assert!(supervisor.allow_attempt(&stage));
    assert!(!supervisor.allow_attempt(&stage), "only one trial while half-open");

    supervisor.record_outcome(&stage, true);
    let snapshot = supervisor.snapshot();
    let breaker = snapshot.stages[&stage].breaker.clone().expect("breaker registered");
    assert_eq!(breaker.state, BreakerState::Closed);
    assert_eq!(breaker.consecutive_failures, 0);
    assert!(supervisor.allow_attempt(&stage));
}

#[tokio::test(start_paused = true)]
async fn failed_trial_reopens_with_a_longer_cooldown() {
    let bus = Arc::new(HealthEventBus::new(64));
    let config = BreakerConfig::default()
        .with_failure_threshold(1)
        .with_cooldown(Duration::from_secs(60))
        .with_cooldown_growth(2.0, Duration::from_secs(600));
    let registry = CircuitBreakerRegistry::new(config.clone(), bus);
    let stage = StageId::new("s");
    registry.register(&stage, config);

    registry.allow(&stage);
    registry.record_outcome(&stage, false);
    tokio::time::advance(Duration::from_secs(60)).await;
    assert!(registry.allow(&stage));
    registry.record_outcome(&stage, false);

    let snapshot = registry.snapshot(&stage).expect("registered");
    assert_eq!(snapshot.state, BreakerState::Open);
    assert_eq!(snapshot.current_cooldown, Duration::from_secs(120));

    tokio::time::advance(Duration::from_secs(60)).await;
    assert!(!registry.allow(&stage));
    tokio::time::advance(Duration::from_secs(60)).await;
    assert!(registry.allow(&stage));
}

#[derive(Debug, Clone, Copy)]
enum Step {
    Allow,
    Succeed,
    Fail,
    Wait(u64),
}

fn step() -> impl Strategy<Value = Step> {
    prop_oneof![
        Just(Step::Allow),
        Just(Step::Succeed),
        Just(Step::Fail),
        (1u64..120).prop_map(Step::Wait),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn open_never_closes_without_a_half_open_trial(steps in prop::collection::vec(step(), 1..40)) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .start_paused(true)
            .build()
            .expect("runtime");
        runtime.block_on(async {
            let bus = Arc::new(HealthEventBus::new(16));
            let config = BreakerConfig::default()
                .with_failure_threshold(2)
                .with_cooldown(Duration::from_secs(30));
            let registry = CircuitBreakerRegistry::new(config.clone(), bus);
            let stage = StageId::new("p");
            registry.register(&stage, config);

            let mut previous = registry.state(&stage).expect("registered");
            for step in steps {
                match step {
                    Step::Allow => { registry.allow(&stage); }
                    Step::Succeed => registry.record_outcome(&stage, true),
                    Step::Fail => registry.record_outcome(&stage, false),
                    Step::Wait(secs) => tokio::time::advance(Duration::from_secs(secs)).await,
                }
                let current = registry.state(&stage).expect("registered");
                prop_assert!(
                    !(previous == BreakerState::Open && current == BreakerState::Closed),
                    "open went straight to closed"
                );
                previous = current;
            }
            Ok(())
        })?;
    }
}
