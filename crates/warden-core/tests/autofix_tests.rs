//! Crash recovery through auto-fix: diagnosis, fallback rules and patch safety

use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::time::Duration;
use warden_core::{
    AutoFixConfig, ErrorKind, EscalationReason, ExitSignal, PatchOrigin, RecoveryActionKind,
    RecoveryAttempt, RecoveryOutcome, StageSpec, Supervisor, SupervisorConfig,
};
use warden_events::{HealthEventKind, StageId};
use warden_test_utils::{
    crash_of_kind, missing_key_crash, FakeDriver, InMemorySource, RecordingObserver, Script,
    ScriptedDiagnosis, TRANSFORM_SOURCE, TRANSFORM_UNIT,
};

const GUARDED: &str = "        user_id = row.get(\"user_id\")";

struct Harness {
    supervisor: Supervisor,
    driver: Arc<FakeDriver>,
    source: Arc<InMemorySource>,
    observer: Arc<RecordingObserver>,
}

impl Harness {
    fn new(diagnosis: Arc<ScriptedDiagnosis>) -> Self {
        let driver = FakeDriver::new();
        let source = InMemorySource::with_unit(TRANSFORM_UNIT, TRANSFORM_SOURCE);
        let supervisor = Supervisor::builder()
            .config(SupervisorConfig::default().with_autofix(AutoFixConfig {
                diagnosis_timeout: Duration::from_secs(30),
                ..AutoFixConfig::default()
            }))
            .driver(driver.clone())
            .source_access(source.clone())
            .diagnosis(diagnosis)
            .build()
            .expect("valid config");
        let observer = RecordingObserver::new();
        supervisor.subscribe(observer.clone()).unwrap();
        Self {
            supervisor,
            driver,
            source,
            observer,
        }
    }

    async fn crash_and_recover(&self, kind: Option<ErrorKind>) -> RecoveryAttempt {
        let handle = self.supervisor.launch(StageSpec::new("transform")).await.unwrap();
        let crash = match kind {
            Some(kind) => crash_of_kind(kind),
            None => missing_key_crash(),
        };
        self.supervisor
            .report_exit(&handle, ExitSignal::Failed(crash))
            .unwrap();
        self.supervisor
            .recover(&StageId::new("transform"))
            .await
            .unwrap()
    }

    fn patched_line(&self) -> String {
        let text = self.source.text(TRANSFORM_UNIT).expect("unit exists");
        text.lines().nth(3).unwrap_or_default().to_string()
    }
}

#[tokio::test(start_paused = true)]
async fn diagnosis_suggestion_is_backed_up_written_reloaded_then_restarted() {
    let diagnosis = ScriptedDiagnosis::suggesting(
        "user_id = row.get(\"user_id\")",
        "rows from the legacy feed may lack user_id",
    );
    let harness = Harness::new(diagnosis.clone());

    let attempt = harness.crash_and_recover(None).await;
    assert_eq!(attempt.action, RecoveryActionKind::AutoFixAndRestart);
    assert_eq!(attempt.outcome, RecoveryOutcome::Succeeded);
    assert!(attempt.successor.is_some());

    let patch = attempt.patch.expect("patch recorded");
    assert_eq!(patch.origin, PatchOrigin::Diagnosis);
    assert_eq!(patch.line, 4);
    assert_eq!(patch.replacement, GUARDED);
    assert_eq!(patch.backup_location.as_deref(), Some("stages/transform.py.bak"));
    assert!(patch.applied);

    assert_eq!(harness.patched_line(), GUARDED);
    assert_eq!(harness.source.mutation_names(), vec!["backup", "write", "reload"]);
    assert_eq!(harness.driver.call_names(), vec!["launch", "launch"]);

    let requests = diagnosis.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].kind, ErrorKind::MissingKey);
    assert_eq!(requests[0].faulting_line, "        user_id = row[\"user_id\"]");
    assert!(requests[0].context.contains("    4 | "));

    harness.supervisor.shutdown().await;
    assert!(harness.observer.kind_names().contains(&"patch_applied"));
}

#[tokio::test(start_paused = true)]
async fn unreachable_diagnosis_falls_back_to_guarded_lookup() {
    let harness = Harness::new(ScriptedDiagnosis::unreachable());

    let attempt = harness.crash_and_recover(None).await;
    assert_eq!(attempt.outcome, RecoveryOutcome::Succeeded);
    let patch = attempt.patch.expect("patch recorded");
    assert_eq!(
        patch.origin,
        PatchOrigin::Fallback {
            rule: "missing_key_guarded_get".into()
        }
    );
    assert_eq!(harness.patched_line(), GUARDED);
}

#[tokio::test(start_paused = true)]
async fn diagnosis_that_never_answers_times_out_into_the_fallback() {
    let harness = Harness::new(ScriptedDiagnosis::new(Script::Hang));

    let attempt = harness.crash_and_recover(None).await;
    assert_eq!(attempt.outcome, RecoveryOutcome::Succeeded);
    assert!(matches!(
        attempt.patch.map(|p| p.origin),
        Some(PatchOrigin::Fallback { .. })
    ));
}

#[tokio::test(start_paused = true)]
async fn declined_diagnosis_falls_back_too() {
    let harness = Harness::new(ScriptedDiagnosis::new(Script::Unable("not enough context".into())));
    let attempt = harness.crash_and_recover(None).await;
    assert_eq!(harness.patched_line(), GUARDED);
    assert_eq!(attempt.outcome, RecoveryOutcome::Succeeded);
}

#[tokio::test(start_paused = true)]
async fn unsupported_kind_escalates_without_touching_the_source() {
    let harness = Harness::new(ScriptedDiagnosis::unreachable());

    let attempt = harness.crash_and_recover(Some(ErrorKind::TypeMismatch)).await;
    assert_eq!(
        attempt.escalation(),
        Some(&EscalationReason::AutoFixUnsupportedErrorKind {
            kind: "type_mismatch".into()
        })
    );
    assert!(attempt.successor.is_none());
    assert!(harness.source.mutation_names().is_empty());
    assert_eq!(harness.source.text(TRANSFORM_UNIT).as_deref(), Some(TRANSFORM_SOURCE));
    assert_eq!(harness.driver.call_names(), vec!["launch"]);

    harness.supervisor.shutdown().await;
    let escalated = harness.observer.events().into_iter().any(|e| {
        matches!(
            e.kind,
            HealthEventKind::RecoveryEscalated {
                reason: EscalationReason::AutoFixUnsupportedErrorKind { .. }
            }
        )
    });
    assert!(escalated);
}

#[tokio::test(start_paused = true)]
async fn failed_write_escalates_with_the_backup_location() {
    let harness = Harness::new(ScriptedDiagnosis::unreachable());
    harness.source.fail_write();

    let attempt = harness.crash_and_recover(None).await;
    assert_eq!(
        attempt.escalation(),
        Some(&EscalationReason::PatchApplicationFailure {
            unit: TRANSFORM_UNIT.into(),
            backup: "stages/transform.py.bak".into(),
        })
    );
    let patch = attempt.patch.expect("failed patch recorded");
    assert!(!patch.applied);
    assert_eq!(harness.source.mutation_names(), vec!["backup", "write"]);
    assert_eq!(harness.source.text(TRANSFORM_UNIT).as_deref(), Some(TRANSFORM_SOURCE));
}

#[tokio::test(start_paused = true)]
async fn failed_reload_puts_the_original_back() {
    let harness = Harness::new(ScriptedDiagnosis::unreachable());
    harness.source.fail_reload();

    let attempt = harness.crash_and_recover(None).await;
    assert_eq!(
        attempt.escalation(),
        Some(&EscalationReason::PatchApplicationFailure {
            unit: TRANSFORM_UNIT.into(),
            backup: "stages/transform.py.bak".into(),
        })
    );
    assert!(attempt.successor.is_none());
    let patch = attempt.patch.expect("failed patch recorded");
    assert!(!patch.applied);
    assert_eq!(patch.original, TRANSFORM_SOURCE);

    assert_eq!(
        harness.source.mutation_names(),
        vec!["backup", "write", "reload", "restore"]
    );
    assert_eq!(harness.source.text(TRANSFORM_UNIT).as_deref(), Some(TRANSFORM_SOURCE));
    assert_eq!(harness.driver.call_names(), vec!["launch"]);
}

#[tokio::test(start_paused = true)]
async fn crashes_in_one_unit_are_patched_one_at_a_time() {
    let diagnosis = ScriptedDiagnosis::new(Script::Hang);
    let harness = Harness::new(diagnosis.clone());
    let supervisor = &harness.supervisor;
    for stage in ["transform", "enrich"] {
        let handle = supervisor.launch(StageSpec::new(stage)).await.unwrap();
        supervisor
            .report_exit(&handle, ExitSignal::Failed(missing_key_crash()))
            .unwrap();
    }

    let transform_id = StageId::new("transform");
    let enrich_id = StageId::new("enrich");
    let (transform, enrich) = tokio::join!(
        supervisor.recover(&transform_id),
        supervisor.recover(&enrich_id),
    );
    let attempts = [transform.unwrap(), enrich.unwrap()];
    let patched = attempts
        .iter()
        .filter(|a| a.outcome == RecoveryOutcome::Succeeded)
        .count();
    assert_eq!(patched, 1);
    assert!(attempts.iter().any(|a| matches!(
        a.escalation(),
        Some(EscalationReason::AutoFixFailed { .. })
    )));

    // The second attempt only read the unit after the first one was done with it
    assert_eq!(harness.source.mutation_names(), vec!["backup", "write", "reload"]);
    let requests = diagnosis.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[1].faulting_line, GUARDED);
    assert_eq!(harness.patched_line(), GUARDED);
}

#[tokio::test(start_paused = true)]
async fn failed_backup_never_writes() {
    let harness = Harness::new(ScriptedDiagnosis::unreachable());
    harness.source.fail_backup();

    let attempt = harness.crash_and_recover(None).await;
    assert!(matches!(
        attempt.escalation(),
        Some(EscalationReason::AutoFixFailed { .. })
    ));
    assert_eq!(harness.source.mutation_names(), vec!["backup"]);
}

#[tokio::test(start_paused = true)]
async fn rollback_restores_the_backup() {
    let harness = Harness::new(ScriptedDiagnosis::unreachable());
    harness.crash_and_recover(None).await;
    assert_eq!(harness.patched_line(), GUARDED);

    let record = harness.supervisor.rollback(TRANSFORM_UNIT).await.unwrap();
    assert!(!record.applied);
    assert_eq!(harness.source.text(TRANSFORM_UNIT).as_deref(), Some(TRANSFORM_SOURCE));
    assert_eq!(
        harness.source.mutation_names(),
        vec!["backup", "write", "reload", "restore", "reload"]
    );

    let snapshot = harness.supervisor.snapshot();
    assert!(!snapshot.patches[TRANSFORM_UNIT].applied);
}

#[tokio::test(start_paused = true)]
async fn crash_without_location_escalates() {
    let harness = Harness::new(ScriptedDiagnosis::unreachable());
    let handle = harness
        .supervisor
        .launch(StageSpec::new("transform"))
        .await
        .unwrap();
    harness
        .supervisor
        .report_exit(
            &handle,
            ExitSignal::Failed(warden_core::CrashReport::new(ErrorKind::MissingKey, "'id'")),
        )
        .unwrap();

    let attempt = harness
        .supervisor
        .recover(&StageId::new("transform"))
        .await
        .unwrap();
    assert!(matches!(
        attempt.escalation(),
        Some(EscalationReason::AutoFixFailed { .. })
    ));
}
