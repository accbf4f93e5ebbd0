//! Supervisor facade
//!
//! Wires the monitor, breakers, process controller, auto-fix and recovery
//! engines around one event bus, and exposes the orchestrator-facing API.
//!
//! [`Supervisor::supervise`] spawns a watch loop per stage that evaluates on
//! the poll interval and hands anomalies to the recovery engine until the
//! stage completes, escalates or is stopped.

use crate::autofix::{AutoFixEngine, DiagnosisPort, FallbackRules, SourceAccess};
use crate::breaker::CircuitBreakerRegistry;
use crate::config::SupervisorConfig;
use crate::error::{ConfigError, MonitorError, RecoveryError, SupervisionError};
use crate::monitor::HealthMonitor;
use crate::process::{ProcessController, StageDriver};
use crate::recovery::RecoveryEngine;
use crate::store::{HandleSnapshot, StageSnapshot, SupervisionSnapshot, SupervisionStore};
use crate::types::{
    ExitSignal, HealthRecord, PatchRecord, RecoveryAttempt, RecoveryOutcome, StageHandle,
    StageSpec,
};
use chrono::Utc;
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use warden_events::{
    EscalationReason, HandleId, HealthEvent, HealthEventBus, HealthEventKind, HealthObserver,
    HealthStatus, RecoveryActionKind, StageId, SubscriptionId,
};

/// How a watch loop ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisionOutcome {
    /// The stage finished without error
    Completed {
        /// Execution that completed
        handle_id: HandleId,
        /// Execution number (1 when never restarted)
        attempt: u32,
    },
    /// Automated recovery gave up or the operator took over
    Escalated {
        /// Why
        reason: EscalationReason,
    },
    /// The stage was deregistered while supervised
    Deregistered,
    /// The supervisor shut down
    Stopped,
}

struct Watch {
    cancel: CancellationToken,
    note: Option<String>,
}

struct Inner {
    config: Arc<SupervisorConfig>,
    bus: Arc<HealthEventBus>,
    monitor: Arc<HealthMonitor>,
    breakers: Arc<CircuitBreakerRegistry>,
    process: ProcessController,
    autofix: Option<Arc<AutoFixEngine>>,
    store: Arc<SupervisionStore>,
    recovery: RecoveryEngine,
    watches: DashMap<StageId, Watch>,
    shutdown: CancellationToken,
}

/// Orchestrator-facing supervision API
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("stages", &self.inner.monitor.stage_ids().len())
            .field("supervised", &self.inner.watches.len())
            .finish_non_exhaustive()
    }
}

/// Builder for [`Supervisor`]
#[derive(Default)]
pub struct SupervisorBuilder {
    config: SupervisorConfig,
    driver: Option<Arc<dyn StageDriver>>,
    source: Option<Arc<dyn SourceAccess>>,
    diagnosis: Option<Arc<dyn DiagnosisPort>>,
    rules: Option<FallbackRules>,
    bus: Option<Arc<HealthEventBus>>,
}

impl SupervisorBuilder {
    /// Use this configuration
    #[must_use]
    pub fn config(mut self, config: SupervisorConfig) -> Self {
        self.config = config;
        self
    }

    /// Run stages through this driver (required)
    #[must_use]
    pub fn driver(mut self, driver: Arc<dyn StageDriver>) -> Self {
        self.driver = Some(driver);
        self
    }

    /// Enable auto-fix over this source access
    #[must_use]
    pub fn source_access(mut self, source: Arc<dyn SourceAccess>) -> Self {
        self.source = Some(source);
        self
    }

    /// Diagnosis service for auto-fix
    #[must_use]
    pub fn diagnosis(mut self, diagnosis: Arc<dyn DiagnosisPort>) -> Self {
        self.diagnosis = Some(diagnosis);
        self
    }

    /// Fallback rules for auto-fix
    #[must_use]
    pub fn fallback_rules(mut self, rules: FallbackRules) -> Self {
        self.rules = Some(rules);
        self
    }

    /// Share an existing event bus
    #[must_use]
    pub fn bus(mut self, bus: Arc<HealthEventBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Validate and wire everything
    ///
    /// # Errors
    /// - `SupervisionError::Config` for invalid configuration or a missing driver
    pub fn build(self) -> Result<Supervisor, SupervisionError> {
        self.config.validate()?;
        let driver = self
            .driver
            .ok_or_else(|| ConfigError::invalid("driver", "a stage driver is required"))?;

        let config = Arc::new(self.config);
        let bus = self
            .bus
            .unwrap_or_else(|| Arc::new(HealthEventBus::new(config.event_buffer)));
        let monitor = Arc::new(HealthMonitor::new(config.default_policy.timeout, bus.clone()));
        let breakers = Arc::new(CircuitBreakerRegistry::new(
            config.default_policy.breaker.clone(),
            bus.clone(),
        ));
        let store = Arc::new(SupervisionStore::new(config.history_limit));
        driver.attach(monitor.clone());
        let process = ProcessController::new(driver)
            .with_force_timeout(config.default_policy.force_timeout);

        let autofix = self.source.map(|source| {
            let mut engine = AutoFixEngine::new(source, config.autofix.clone());
            if let Some(diagnosis) = self.diagnosis {
                engine = engine.with_diagnosis(diagnosis);
            }
            if let Some(rules) = self.rules {
                engine = engine.with_rules(rules);
            }
            Arc::new(engine)
        });

        let mut recovery = RecoveryEngine::new(
            config.clone(),
            monitor.clone(),
            breakers.clone(),
            process.clone(),
            store.clone(),
            bus.clone(),
        );
        if let Some(autofix) = &autofix {
            recovery = recovery.with_autofix(autofix.clone());
        }

        tracing::info!(
            poll_interval = ?config.poll_interval,
            autofix = recovery.autofix_available(),
            "supervisor ready"
        );

        Ok(Supervisor {
            inner: Arc::new(Inner {
                config,
                bus,
                monitor,
                breakers,
                process,
                autofix,
                store,
                recovery,
                watches: DashMap::new(),
                shutdown: CancellationToken::new(),
            }),
        })
    }
}

impl Supervisor {
    /// Start building a supervisor
    #[must_use]
    pub fn builder() -> SupervisorBuilder {
        SupervisorBuilder::default()
    }

    /// Register a stage and start a fresh supervised run
    ///
    /// The hang timeout is `spec.timeout`, else the stage's policy timeout.
    pub fn register(&self, spec: StageSpec) -> StageHandle {
        let policy = self.inner.config.policy_for(&spec.stage_id);
        let spec = StageSpec {
            timeout: spec.timeout.or(Some(policy.timeout)),
            ..spec
        };
        self.inner.breakers.register(&spec.stage_id, policy.breaker.clone());
        self.inner.store.begin_run(&spec.stage_id);
        self.inner.monitor.register(spec)
    }

    /// Register a stage and launch its first execution through the driver
    ///
    /// # Errors
    /// - `SupervisionError::Process` if the driver cannot launch it
    pub async fn launch(&self, spec: StageSpec) -> Result<StageHandle, SupervisionError> {
        let handle = self.register(spec);
        self.inner.process.launch(&handle).await?;
        Ok(handle)
    }

    /// Record forward progress
    ///
    /// # Errors
    /// - `SupervisionError::Monitor` for unknown or stale handles
    pub fn heartbeat(&self, handle: &StageHandle) -> Result<(), SupervisionError> {
        Ok(self.inner.monitor.heartbeat(handle)?)
    }

    /// Record termination of an execution
    ///
    /// # Errors
    /// - `SupervisionError::Monitor` for unknown or stale handles
    pub fn report_exit(&self, handle: &StageHandle, signal: ExitSignal) -> Result<(), SupervisionError> {
        Ok(self.inner.monitor.report_exit(handle, signal)?)
    }

    /// Whether the breaker lets an attempt of the stage run now
    #[must_use]
    pub fn allow_attempt(&self, stage_id: &StageId) -> bool {
        self.inner.breakers.allow(stage_id)
    }

    /// Feed the outcome of an orchestrator-run attempt to the breaker
    pub fn record_outcome(&self, stage_id: &StageId, success: bool) {
        self.inner.breakers.record_outcome(stage_id, success);
    }

    /// Classify the current execution of a stage
    ///
    /// # Errors
    /// - `SupervisionError::Monitor` when the stage is not registered
    pub fn evaluate(&self, stage_id: &StageId) -> Result<HealthRecord, SupervisionError> {
        Ok(self.inner.monitor.evaluate_stage(stage_id)?)
    }

    /// Evaluate once and recover if anomalous
    ///
    /// # Errors
    /// - `SupervisionError::Recovery` with `NothingToRecover` when healthy
    /// - `SupervisionError::Monitor` when the stage is not registered
    pub async fn recover(&self, stage_id: &StageId) -> Result<RecoveryAttempt, SupervisionError> {
        let handle = self
            .inner
            .monitor
            .current_handle(stage_id)
            .ok_or_else(|| MonitorError::UnknownStage(stage_id.clone()))?;
        let record = self.inner.monitor.evaluate(&handle)?;
        Ok(self.inner.recovery.handle(&record, &handle).await?)
    }

    /// Watch a stage until it completes, escalates or is stopped
    ///
    /// # Errors
    /// - `SupervisionError::AlreadySupervised` if a watch loop is running
    /// - `SupervisionError::Monitor` if the handle is not current
    pub fn supervise(
        &self,
        handle: StageHandle,
    ) -> Result<JoinHandle<SupervisionOutcome>, SupervisionError> {
        let stage_id = handle.stage_id.clone();
        self.inner.monitor.evaluate(&handle)?;

        let cancel = self.inner.shutdown.child_token();
        match self.inner.watches.entry(stage_id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(SupervisionError::AlreadySupervised(stage_id));
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(Watch {
                    cancel: cancel.clone(),
                    note: None,
                });
            }
        }

        let inner = self.inner.clone();
        Ok(tokio::spawn(async move {
            let outcome = watch(&inner, handle, &cancel).await;
            inner.watches.remove(&stage_id);
            tracing::info!(stage = %stage_id, outcome = ?outcome, "supervision ended");
            outcome
        }))
    }

    /// Hand a stage to the operator
    ///
    /// Publishes an escalation and cancels the stage's watch loop; an
    /// in-flight graceful terminate becomes forced and no restart follows.
    /// Returns `false` for an unknown stage.
    pub fn escalate(&self, stage_id: &StageId, note: Option<String>) -> bool {
        let Some(handle) = self.inner.monitor.current_handle(stage_id) else {
            return false;
        };
        if let Some(mut watch) = self.inner.watches.get_mut(stage_id) {
            watch.note.clone_from(&note);
            watch.cancel.cancel();
        }
        tracing::warn!(stage = %stage_id, note = ?note, "operator escalation");
        self.inner.bus.publish(
            HealthEvent::new(
                stage_id.clone(),
                HealthEventKind::RecoveryEscalated {
                    reason: EscalationReason::OperatorRequested { note },
                },
            )
            .with_handle(handle.handle_id),
        );
        true
    }

    /// Stop tracking a stage
    pub fn deregister(&self, stage_id: &StageId) -> bool {
        self.inner.monitor.deregister(stage_id)
    }

    /// Subscribe an observer to every health event
    ///
    /// # Errors
    /// - `SupervisionError::Bus` outside a tokio runtime
    pub fn subscribe(&self, observer: Arc<dyn HealthObserver>) -> Result<SubscriptionId, SupervisionError> {
        Ok(self.inner.bus.subscribe(observer)?)
    }

    /// Remove a subscription
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner.bus.unsubscribe(id)
    }

    /// The shared event bus
    #[must_use]
    pub fn bus(&self) -> &Arc<HealthEventBus> {
        &self.inner.bus
    }

    /// Recovery history of a stage, oldest first
    #[must_use]
    pub fn history(&self, stage_id: &StageId) -> Vec<RecoveryAttempt> {
        self.inner.store.history(stage_id)
    }

    /// Restore a unit patched by auto-fix
    ///
    /// # Errors
    /// - `SupervisionError::AutoFix` when nothing can be rolled back
    pub async fn rollback(&self, unit: &str) -> Result<PatchRecord, SupervisionError> {
        let autofix = self.inner.autofix.as_ref().ok_or_else(|| {
            crate::error::AutoFixError::NoPatchRecorded(unit.to_string())
        })?;
        Ok(autofix.rollback(unit).await?)
    }

    /// Point-in-time view of every stage and patch
    #[must_use]
    pub fn snapshot(&self) -> SupervisionSnapshot {
        let inner = &self.inner;
        let stages = inner
            .monitor
            .stage_ids()
            .into_iter()
            .map(|stage_id| {
                let snapshot = StageSnapshot {
                    handle: inner
                        .monitor
                        .current_handle(&stage_id)
                        .as_ref()
                        .map(HandleSnapshot::from),
                    health: inner.monitor.last_record(&stage_id),
                    breaker: inner.breakers.snapshot(&stage_id),
                    executed_attempts: inner.store.executed_attempts(&stage_id),
                    history: inner.store.history(&stage_id),
                };
                (stage_id, snapshot)
            })
            .collect::<BTreeMap<_, _>>();
        let patches = inner
            .autofix
            .as_ref()
            .map(|autofix| {
                autofix
                    .patches()
                    .into_iter()
                    .map(|p| (p.unit.clone(), p))
                    .collect()
            })
            .unwrap_or_default();

        SupervisionSnapshot {
            taken_at: Utc::now(),
            stages,
            patches,
        }
    }

    /// Stop every watch loop and drain observers
    pub async fn shutdown(&self) {
        tracing::info!("supervisor shutting down");
        self.inner.shutdown.cancel();
        self.inner.bus.shutdown().await;
    }
}

async fn watch(inner: &Inner, mut handle: StageHandle, cancel: &CancellationToken) -> SupervisionOutcome {
    let stage_id = handle.stage_id.clone();
    let policy = inner.config.policy_for(&stage_id).clone();
    let mut ticker = tokio::time::interval(inner.config.poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut stall_retries: u32 = 0;
    let mut next_retry_at: Option<Instant> = None;
    let mut breaker_reopens_at: Option<Instant> = None;

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => return cancelled_outcome(inner, &stage_id),
            _ = ticker.tick() => {}
        }

        let record = match inner.monitor.evaluate(&handle) {
            Ok(record) => record,
            Err(MonitorError::StaleHandle { .. }) => {
                if let Some(current) = inner.monitor.current_handle(&stage_id) {
                    tracing::debug!(stage = %stage_id, handle = %current.handle_id, "following newer execution");
                    handle = current;
                }
                continue;
            }
            Err(MonitorError::UnknownStage(_)) => return SupervisionOutcome::Deregistered,
        };
        tracing::debug!(stage = %stage_id, status = %record.status, "polled");

        match record.status {
            HealthStatus::Healthy if record.evidence.exited => {
                return SupervisionOutcome::Completed {
                    handle_id: handle.handle_id,
                    attempt: handle.attempt,
                };
            }
            HealthStatus::Healthy => {
                stall_retries = 0;
                next_retry_at = None;
                continue;
            }
            HealthStatus::Stalled if next_retry_at.is_some_and(|at| Instant::now() < at) => {
                continue;
            }
            _ => {}
        }
        if breaker_reopens_at.is_some_and(|at| Instant::now() < at) {
            continue;
        }

        let attempt = match inner.recovery.handle_cancellable(&record, &handle, cancel).await {
            Ok(attempt) => attempt,
            Err(RecoveryError::NothingToRecover(_)) => continue,
            Err(RecoveryError::Monitor(e)) => {
                tracing::warn!(stage = %stage_id, error = %e, "recovery lost track of the stage");
                continue;
            }
        };

        if cancel.is_cancelled() {
            return cancelled_outcome(inner, &stage_id);
        }
        if let Some(reason) = attempt.escalation() {
            return SupervisionOutcome::Escalated {
                reason: reason.clone(),
            };
        }
        if attempt.outcome == RecoveryOutcome::ShortCircuited {
            // One rejection per cooldown
            let wait = inner
                .breakers
                .snapshot(&stage_id)
                .and_then(|breaker| breaker.cooldown_remaining)
                .unwrap_or(inner.config.poll_interval);
            tracing::debug!(stage = %stage_id, wait = ?wait, "breaker open, holding recovery");
            breaker_reopens_at = Some(Instant::now() + wait);
            continue;
        }
        breaker_reopens_at = None;
        if let Some(next) = attempt.successor {
            handle = next;
            stall_retries = 0;
            next_retry_at = None;
        } else if attempt.action == RecoveryActionKind::RetryInPlace {
            stall_retries = stall_retries.saturating_add(1);
            next_retry_at = Some(Instant::now() + policy.retry_backoff.delay_for_attempt(stall_retries));
        }
    }
}

fn cancelled_outcome(inner: &Inner, stage_id: &StageId) -> SupervisionOutcome {
    if inner.shutdown.is_cancelled() {
        return SupervisionOutcome::Stopped;
    }
    let note = inner
        .watches
        .get(stage_id)
        .and_then(|watch| watch.note.clone());
    SupervisionOutcome::Escalated {
        reason: EscalationReason::OperatorRequested { note },
    }
}
