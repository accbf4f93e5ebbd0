//! Recovery engine
//!
//! Turns an anomalous [`HealthRecord`] into one recovery attempt. The action
//! is picked by [`select_action`], in this order:
//!
//! | Condition | Action |
//! |---|---|
//! | healthy | rejected, nothing to recover |
//! | retry budget used up | `Escalate` |
//! | breaker refuses | `ShortCircuit` |
//! | stalled | `RetryInPlace` |
//! | hung | `TerminateAndRestart` |
//! | crashed, auto-fix available | `AutoFixAndRestart` |
//! | crashed, auto-fix off | `Restart` |
//!
//! Only executed actions count against the budget and reach the breaker.
//! Every attempt is stored and published.

use crate::autofix::AutoFixEngine;
use crate::breaker::CircuitBreakerRegistry;
use crate::config::{StagePolicy, SupervisorConfig};
use crate::error::{AutoFixError, MonitorError, ProcessError, RecoveryError};
use crate::monitor::HealthMonitor;
use crate::process::ProcessController;
use crate::store::SupervisionStore;
use crate::types::{HealthRecord, RecoveryAttempt, RecoveryOutcome, StageHandle};
use dashmap::DashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use warden_events::{
    EscalationReason, HealthEvent, HealthEventBus, HealthEventKind, HealthStatus,
    RecoveryActionKind, StageId,
};

/// Pick the recovery action for a status
///
/// Returns `None` for a healthy status. `breaker_allows` is only consulted
/// once the budget check has passed, since admitting a half-open trial
/// consumes it.
///
/// # Arguments
/// * `status` - Classification to recover from
/// * `executed` - Executed attempts so far in the supervised run
/// * `budget` - Executed attempts allowed per run
/// * `autofix_available` - Whether crashes are patched before restart
/// * `breaker_allows` - Breaker gate for the stage
pub fn select_action(
    status: HealthStatus,
    executed: u32,
    budget: u32,
    autofix_available: bool,
    breaker_allows: impl FnOnce() -> bool,
) -> Option<RecoveryActionKind> {
    if status == HealthStatus::Healthy {
        return None;
    }
    if executed >= budget {
        return Some(RecoveryActionKind::Escalate);
    }
    if !breaker_allows() {
        return Some(RecoveryActionKind::ShortCircuit);
    }
    Some(match status {
        HealthStatus::Stalled => RecoveryActionKind::RetryInPlace,
        HealthStatus::Hung => RecoveryActionKind::TerminateAndRestart,
        HealthStatus::Crashed if autofix_available => RecoveryActionKind::AutoFixAndRestart,
        HealthStatus::Crashed | HealthStatus::Healthy => RecoveryActionKind::Restart,
    })
}

/// Executes recovery strategies
pub struct RecoveryEngine {
    config: Arc<SupervisorConfig>,
    monitor: Arc<HealthMonitor>,
    breakers: Arc<CircuitBreakerRegistry>,
    process: ProcessController,
    autofix: Option<Arc<AutoFixEngine>>,
    store: Arc<SupervisionStore>,
    bus: Arc<HealthEventBus>,
    stage_locks: DashMap<StageId, Arc<tokio::sync::Mutex<()>>>,
}

impl std::fmt::Debug for RecoveryEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecoveryEngine")
            .field("autofix", &self.autofix.is_some())
            .finish_non_exhaustive()
    }
}

/// What executing an action produced
struct Executed {
    outcome: RecoveryOutcome,
    successor: Option<StageHandle>,
    recommended_timeout: Option<std::time::Duration>,
    patch: Option<crate::types::PatchRecord>,
}

impl Executed {
    fn outcome(outcome: RecoveryOutcome) -> Self {
        Self {
            outcome,
            successor: None,
            recommended_timeout: None,
            patch: None,
        }
    }

    fn failed(detail: impl Into<String>) -> Self {
        Self::outcome(RecoveryOutcome::Failed {
            detail: detail.into(),
        })
    }
}

impl RecoveryEngine {
    /// Wire an engine over the shared registries
    #[must_use]
    pub fn new(
        config: Arc<SupervisorConfig>,
        monitor: Arc<HealthMonitor>,
        breakers: Arc<CircuitBreakerRegistry>,
        process: ProcessController,
        store: Arc<SupervisionStore>,
        bus: Arc<HealthEventBus>,
    ) -> Self {
        Self {
            config,
            monitor,
            breakers,
            process,
            autofix: None,
            store,
            bus,
            stage_locks: DashMap::new(),
        }
    }

    /// Patch crashed stages with this engine before restarting them
    #[must_use]
    pub fn with_autofix(mut self, autofix: Arc<AutoFixEngine>) -> Self {
        self.autofix = Some(autofix);
        self
    }

    /// Whether crashes go through auto-fix
    #[must_use]
    pub fn autofix_available(&self) -> bool {
        self.config.autofix.enabled && self.autofix.as_ref().is_some_and(|a| a.is_enabled())
    }

    /// Recover from an anomalous record
    ///
    /// Attempts on one stage are serialized. An attempt that waited behind
    /// another one works on the stage's current execution, re-evaluated.
    ///
    /// # Errors
    /// - `RecoveryError::NothingToRecover` for a healthy record
    /// - `RecoveryError::Monitor` if a restarted execution cannot be adopted
    pub async fn handle(
        &self,
        record: &HealthRecord,
        handle: &StageHandle,
    ) -> Result<RecoveryAttempt, RecoveryError> {
        self.handle_cancellable(record, handle, &CancellationToken::new())
            .await
    }

    /// [`Self::handle`] honouring an operator cancellation
    ///
    /// A cancelled token upgrades a graceful terminate to a forced one,
    /// suppresses the restart and aborts auto-fix before any write.
    ///
    /// # Errors
    /// - Same as [`Self::handle`]
    pub async fn handle_cancellable(
        &self,
        record: &HealthRecord,
        handle: &StageHandle,
        cancel: &CancellationToken,
    ) -> Result<RecoveryAttempt, RecoveryError> {
        let stage_id = &handle.stage_id;
        if record.status == HealthStatus::Healthy {
            return Err(RecoveryError::NothingToRecover(stage_id.clone()));
        }

        let lock = self.stage_lock(stage_id);
        let _guard = lock.lock().await;

        // An attempt that held the lock may have replaced the execution
        let fresh;
        let (record, handle) = match self.monitor.current_handle(stage_id) {
            Some(current) if current.handle_id != handle.handle_id => {
                fresh = (self.monitor.evaluate(&current)?, current);
                (&fresh.0, &fresh.1)
            }
            _ => (record, handle),
        };
        if record.status == HealthStatus::Healthy {
            return Err(RecoveryError::NothingToRecover(stage_id.clone()));
        }

        let policy = self.config.policy_for(stage_id).clone();
        let executed = self.store.executed_attempts(stage_id);
        let Some(action) = select_action(
            record.status,
            executed,
            policy.retry_budget,
            self.autofix_available(),
            || self.breakers.allow(stage_id),
        ) else {
            return Err(RecoveryError::NothingToRecover(stage_id.clone()));
        };

        tracing::info!(
            stage = %stage_id,
            status = %record.status,
            action = %action,
            executed,
            budget = policy.retry_budget,
            "recovery action selected"
        );

        // Dropped unresolved, the guard records a failure so an admitted
        // half-open trial always resolves
        let outcome_guard = action
            .is_executed()
            .then(|| OutcomeGuard::new(&self.breakers, stage_id));

        let result = match action {
            RecoveryActionKind::Escalate => Executed::outcome(RecoveryOutcome::Escalated {
                reason: EscalationReason::RecoveryBudgetExhausted {
                    budget: policy.retry_budget,
                },
            }),
            RecoveryActionKind::ShortCircuit => {
                tracing::warn!(stage = %stage_id, "attempt rejected by open circuit breaker");
                Executed::outcome(RecoveryOutcome::ShortCircuited)
            }
            RecoveryActionKind::RetryInPlace => match self.process.nudge(handle).await {
                Ok(()) => Executed::outcome(RecoveryOutcome::Succeeded),
                Err(e) => Executed::failed(e.to_string()),
            },
            RecoveryActionKind::TerminateAndRestart => {
                self.terminate_and_restart(handle, &policy, cancel).await?
            }
            RecoveryActionKind::AutoFixAndRestart => {
                self.autofix_and_restart(record, handle, cancel).await?
            }
            RecoveryActionKind::Restart => self.restart(handle, handle.timeout, cancel).await?,
        };

        let attempt_number = if let Some(guard) = outcome_guard {
            guard.resolve(result.outcome.is_success());
            executed + 1
        } else {
            executed
        };

        let mut attempt = RecoveryAttempt::new(action, record.clone(), result.outcome, attempt_number);
        attempt.successor = result.successor;
        attempt.recommended_timeout = result.recommended_timeout;
        attempt.patch = result.patch;

        self.publish(handle, &attempt);
        self.store.record(attempt.clone());
        Ok(attempt)
    }

    async fn terminate_and_restart(
        &self,
        handle: &StageHandle,
        policy: &StagePolicy,
        cancel: &CancellationToken,
    ) -> Result<Executed, RecoveryError> {
        let recommended = policy.hang_timeout.recommend(handle.timeout);
        let stopped = self
            .process
            .terminate_with(handle, policy.graceful_timeout, policy.force_timeout, cancel)
            .await;
        if !stopped {
            let mut result = Executed::failed("stage did not stop, restart skipped");
            result.recommended_timeout = Some(recommended);
            return Ok(result);
        }

        let timeout = if policy.adopt_recommended_timeout {
            recommended
        } else {
            handle.timeout
        };
        let mut result = self.restart(handle, timeout, cancel).await?;
        result.recommended_timeout = Some(recommended);
        Ok(result)
    }

    async fn autofix_and_restart(
        &self,
        record: &HealthRecord,
        handle: &StageHandle,
        cancel: &CancellationToken,
    ) -> Result<Executed, RecoveryError> {
        let (Some(autofix), Some(crash)) = (&self.autofix, record.crash()) else {
            return Ok(Executed::outcome(RecoveryOutcome::Escalated {
                reason: EscalationReason::AutoFixFailed {
                    detail: "crash record carries no crash report".into(),
                },
            }));
        };

        match autofix.attempt_fix_with(crash, cancel).await {
            Ok(patch) => {
                self.bus.publish(
                    HealthEvent::new(
                        handle.stage_id.clone(),
                        HealthEventKind::PatchApplied {
                            unit: patch.unit.clone(),
                            line: patch.line,
                            backup: patch.backup_location.clone().unwrap_or_default(),
                        },
                    )
                    .with_handle(handle.handle_id),
                );
                let mut result = self.restart(handle, handle.timeout, cancel).await?;
                result.patch = Some(patch);
                Ok(result)
            }
            Err(AutoFixError::Cancelled) => Ok(Executed::failed("auto-fix cancelled")),
            Err(e) => {
                tracing::warn!(stage = %handle.stage_id, error = %e, "auto-fix failed");
                let reason = escalation_for(&e);
                let mut result = Executed::outcome(RecoveryOutcome::Escalated { reason });
                if let AutoFixError::PatchApplication { record, .. } = e {
                    result.patch = Some(*record);
                }
                Ok(result)
            }
        }
    }

    async fn restart(
        &self,
        handle: &StageHandle,
        timeout: std::time::Duration,
        cancel: &CancellationToken,
    ) -> Result<Executed, RecoveryError> {
        if cancel.is_cancelled() {
            return Ok(Executed::failed("cancelled by operator, restart skipped"));
        }
        let adopted = self
            .process
            .restart_with(handle, timeout, |next| {
                self.monitor
                    .adopt(next.clone())
                    .map_err(|_| ProcessError::UnknownStage(next.stage_id.clone()))
            })
            .await;
        match adopted {
            Ok(next) => Ok(Executed {
                outcome: RecoveryOutcome::Succeeded,
                successor: Some(next),
                recommended_timeout: None,
                patch: None,
            }),
            Err(e) => match self.monitor.current_handle(&handle.stage_id) {
                None => Err(MonitorError::UnknownStage(handle.stage_id.clone()).into()),
                Some(current) => {
                    // Successor adopted but never launched
                    if current.handle_id != handle.handle_id {
                        self.monitor.revert(&current)?;
                    }
                    Ok(Executed::failed(e.to_string()))
                }
            },
        }
    }

    fn publish(&self, handle: &StageHandle, attempt: &RecoveryAttempt) {
        let detail = match &attempt.outcome {
            RecoveryOutcome::Failed { detail } => Some(detail.clone()),
            RecoveryOutcome::Escalated { reason } => Some(reason.to_string()),
            RecoveryOutcome::ShortCircuited => Some("rejected by open circuit breaker".into()),
            RecoveryOutcome::Succeeded => None,
        };
        self.bus.publish(
            HealthEvent::new(
                handle.stage_id.clone(),
                HealthEventKind::RecoveryAttempted {
                    action: attempt.action,
                    success: attempt.outcome.is_success(),
                    attempt: attempt.attempt_number,
                    detail,
                },
            )
            .with_handle(handle.handle_id),
        );

        if let Some(reason) = attempt.escalation() {
            tracing::warn!(stage = %handle.stage_id, reason = %reason, "recovery escalated");
            self.bus.publish(
                HealthEvent::new(
                    handle.stage_id.clone(),
                    HealthEventKind::RecoveryEscalated {
                        reason: reason.clone(),
                    },
                )
                .with_handle(handle.handle_id),
            );
        }
    }

    fn stage_lock(&self, stage_id: &StageId) -> Arc<tokio::sync::Mutex<()>> {
        self.stage_locks
            .entry(stage_id.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }
}

/// Breaker outcome owed by an executed action
struct OutcomeGuard<'a> {
    breakers: &'a CircuitBreakerRegistry,
    stage_id: &'a StageId,
    pending: bool,
}

impl<'a> OutcomeGuard<'a> {
    fn new(breakers: &'a CircuitBreakerRegistry, stage_id: &'a StageId) -> Self {
        Self {
            breakers,
            stage_id,
            pending: true,
        }
    }

    fn resolve(mut self, success: bool) {
        self.pending = false;
        self.breakers.record_outcome(self.stage_id, success);
    }
}

impl Drop for OutcomeGuard<'_> {
    fn drop(&mut self) {
        if self.pending {
            tracing::warn!(stage = %self.stage_id, "recovery aborted, recording failure with the breaker");
            self.breakers.record_outcome(self.stage_id, false);
        }
    }
}

/// Escalation reason for an auto-fix failure
fn escalation_for(error: &AutoFixError) -> EscalationReason {
    match error {
        AutoFixError::UnsupportedErrorKind { kind } => {
            EscalationReason::AutoFixUnsupportedErrorKind { kind: kind.clone() }
        }
        AutoFixError::PatchApplication { record, .. } => EscalationReason::PatchApplicationFailure {
            unit: record.unit.clone(),
            backup: record.backup_location.clone().unwrap_or_default(),
        },
        other => EscalationReason::AutoFixFailed {
            detail: other.to_string(),
        },
    }
}
