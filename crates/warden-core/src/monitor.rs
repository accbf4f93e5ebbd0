//! Health monitor
//!
//! Tracks the liveness signals of the current execution of every registered
//! stage and classifies it. First match wins:
//! 1. Crashed: the execution exited with an error
//! 2. Hung: no progress (last heartbeat, or start) for the whole timeout
//! 3. Stalled: heartbeats arrived, but none for half the timeout
//! 4. Healthy
//!
//! Evaluation is idempotent: with no new signal and no threshold crossed the
//! previous record is returned unchanged.

use crate::error::MonitorError;
use crate::process::LivenessSink;
use crate::types::{ExitSignal, HealthEvidence, HealthRecord, StageHandle, StageSpec};
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use warden_events::{HealthEvent, HealthEventBus, HealthEventKind, HealthStatus, StageId};

#[derive(Debug)]
struct Liveness {
    handle: StageHandle,
    heartbeats: u64,
    last_heartbeat: Option<Instant>,
    exit: Option<ExitSignal>,
    /// Bumped on every accepted signal
    generation: u64,
    cached: Option<(u64, HealthRecord)>,
    last_status: Option<HealthStatus>,
    /// State of the execution this one replaced, until it launches
    superseded: Option<Box<Liveness>>,
}

impl Liveness {
    fn new(handle: StageHandle) -> Self {
        Self {
            handle,
            heartbeats: 0,
            last_heartbeat: None,
            exit: None,
            generation: 0,
            cached: None,
            last_status: None,
            superseded: None,
        }
    }

    fn ensure_current(&self, handle: &StageHandle) -> Result<(), MonitorError> {
        if self.handle.handle_id == handle.handle_id {
            Ok(())
        } else {
            Err(MonitorError::StaleHandle {
                stage_id: handle.stage_id.clone(),
                handle: handle.handle_id,
            })
        }
    }

    fn classify(&self, now: Instant) -> (HealthStatus, HealthEvidence) {
        let since_start = now.saturating_duration_since(self.handle.started_at);
        let since_heartbeat = self
            .last_heartbeat
            .map(|at| now.saturating_duration_since(at));
        let timeout = self.handle.timeout;

        let mut evidence = HealthEvidence {
            since_start,
            since_heartbeat,
            heartbeats: self.heartbeats,
            timeout,
            exited: self.exit.is_some(),
            crash: None,
        };

        let status = match &self.exit {
            Some(ExitSignal::Failed(report)) => {
                evidence.crash = Some(report.clone());
                HealthStatus::Crashed
            }
            Some(ExitSignal::Completed) => HealthStatus::Healthy,
            None => {
                let idle = since_heartbeat.unwrap_or(since_start);
                if idle >= timeout {
                    HealthStatus::Hung
                } else if since_heartbeat.is_some_and(|d| d >= timeout / 2) {
                    HealthStatus::Stalled
                } else {
                    HealthStatus::Healthy
                }
            }
        };
        (status, evidence)
    }
}

/// Liveness tracking and classification for every registered stage
pub struct HealthMonitor {
    stages: DashMap<StageId, Arc<Mutex<Liveness>>>,
    default_timeout: Duration,
    bus: Arc<HealthEventBus>,
}

impl std::fmt::Debug for HealthMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthMonitor")
            .field("stages", &self.stages.len())
            .field("default_timeout", &self.default_timeout)
            .finish_non_exhaustive()
    }
}

impl HealthMonitor {
    /// Create a monitor
    ///
    /// # Arguments
    /// * `default_timeout` - Hang timeout for specs that do not set one
    /// * `bus` - Event bus for health transitions
    #[must_use]
    pub fn new(default_timeout: Duration, bus: Arc<HealthEventBus>) -> Self {
        Self {
            stages: DashMap::new(),
            default_timeout,
            bus,
        }
    }

    /// Register a stage and return the handle of its first execution
    ///
    /// Registering an already known stage starts over with a fresh handle.
    pub fn register(&self, spec: StageSpec) -> StageHandle {
        let timeout = spec.timeout.unwrap_or(self.default_timeout);
        let handle = StageHandle::new(spec.stage_id.clone(), timeout);
        self.stages
            .insert(spec.stage_id, Arc::new(Mutex::new(Liveness::new(handle.clone()))));
        tracing::info!(
            stage = %handle.stage_id,
            handle = %handle.handle_id,
            timeout = ?timeout,
            "stage registered"
        );
        handle
    }

    /// Install a restarted execution as the current one
    ///
    /// Signals of the replaced execution are kept until [`Self::revert`] or
    /// the next adopt, in case the successor never launches.
    ///
    /// # Errors
    /// - `MonitorError::UnknownStage` if the stage is not registered
    pub fn adopt(&self, handle: StageHandle) -> Result<(), MonitorError> {
        let cell = self.cell(&handle.stage_id)?;
        let mut liveness = cell.lock();
        let last_status = liveness.last_status;
        tracing::debug!(
            stage = %handle.stage_id,
            handle = %handle.handle_id,
            attempt = handle.attempt,
            "adopting restarted execution"
        );
        let mut previous = std::mem::replace(
            &mut *liveness,
            Liveness {
                last_status,
                ..Liveness::new(handle)
            },
        );
        previous.superseded = None;
        liveness.superseded = Some(Box::new(previous));
        Ok(())
    }

    /// Undo [`Self::adopt`] of `handle` after its launch failed
    ///
    /// Returns `false` when `handle` is no longer current or nothing was
    /// replaced.
    ///
    /// # Errors
    /// - `MonitorError::UnknownStage` if the stage is not registered
    pub fn revert(&self, handle: &StageHandle) -> Result<bool, MonitorError> {
        let cell = self.cell(&handle.stage_id)?;
        let mut liveness = cell.lock();
        if liveness.ensure_current(handle).is_err() {
            return Ok(false);
        }
        let Some(mut previous) = liveness.superseded.take() else {
            return Ok(false);
        };
        previous.last_status = liveness.last_status;
        previous.generation += 1;
        tracing::debug!(stage = %handle.stage_id, handle = %previous.handle.handle_id, "restart failed, keeping previous execution");
        *liveness = *previous;
        Ok(true)
    }

    /// Stop tracking a stage
    pub fn deregister(&self, stage_id: &StageId) -> bool {
        self.stages.remove(stage_id).is_some()
    }

    /// Record forward progress
    ///
    /// # Errors
    /// - `MonitorError::UnknownStage` / `StaleHandle`
    pub fn heartbeat(&self, handle: &StageHandle) -> Result<(), MonitorError> {
        let cell = self.cell(&handle.stage_id)?;
        let mut liveness = cell.lock();
        liveness.ensure_current(handle)?;
        liveness.heartbeats += 1;
        liveness.last_heartbeat = Some(Instant::now());
        liveness.generation += 1;
        tracing::trace!(stage = %handle.stage_id, count = liveness.heartbeats, "heartbeat");
        Ok(())
    }

    /// Record termination of an execution
    ///
    /// # Errors
    /// - `MonitorError::UnknownStage` / `StaleHandle`
    pub fn report_exit(&self, handle: &StageHandle, signal: ExitSignal) -> Result<(), MonitorError> {
        let cell = self.cell(&handle.stage_id)?;
        let mut liveness = cell.lock();
        liveness.ensure_current(handle)?;
        match &signal {
            ExitSignal::Completed => tracing::info!(stage = %handle.stage_id, "stage completed"),
            ExitSignal::Failed(report) => tracing::warn!(
                stage = %handle.stage_id,
                kind = %report.kind,
                "stage crashed: {}",
                report.message
            ),
        }
        liveness.exit = Some(signal);
        liveness.generation += 1;
        Ok(())
    }

    /// Classify an execution
    ///
    /// Publishes a health transition when the status differs from the
    /// previous evaluation of the stage.
    ///
    /// # Errors
    /// - `MonitorError::UnknownStage` / `StaleHandle`
    pub fn evaluate(&self, handle: &StageHandle) -> Result<HealthRecord, MonitorError> {
        let cell = self.cell(&handle.stage_id)?;
        let mut liveness = cell.lock();
        liveness.ensure_current(handle)?;
        Ok(self.evaluate_locked(&mut liveness))
    }

    /// Classify the current execution of a stage
    ///
    /// # Errors
    /// - `MonitorError::UnknownStage`
    pub fn evaluate_stage(&self, stage_id: &StageId) -> Result<HealthRecord, MonitorError> {
        let cell = self.cell(stage_id)?;
        let mut liveness = cell.lock();
        Ok(self.evaluate_locked(&mut liveness))
    }

    /// Handle of the current execution
    #[must_use]
    pub fn current_handle(&self, stage_id: &StageId) -> Option<StageHandle> {
        self.stages
            .get(stage_id)
            .map(|cell| cell.value().lock().handle.clone())
    }

    /// Most recent record of a stage, without re-evaluating
    #[must_use]
    pub fn last_record(&self, stage_id: &StageId) -> Option<HealthRecord> {
        self.stages
            .get(stage_id)
            .and_then(|cell| cell.value().lock().cached.as_ref().map(|(_, r)| r.clone()))
    }

    /// Registered stage ids
    #[must_use]
    pub fn stage_ids(&self) -> Vec<StageId> {
        self.stages.iter().map(|entry| entry.key().clone()).collect()
    }

    fn cell(&self, stage_id: &StageId) -> Result<Arc<Mutex<Liveness>>, MonitorError> {
        self.stages
            .get(stage_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| MonitorError::UnknownStage(stage_id.clone()))
    }

    fn evaluate_locked(&self, liveness: &mut Liveness) -> HealthRecord {
        let (status, evidence) = liveness.classify(Instant::now());

        if let Some((generation, record)) = &liveness.cached {
            if *generation == liveness.generation && record.status == status {
                return record.clone();
            }
        }

        let record = HealthRecord {
            stage_id: liveness.handle.stage_id.clone(),
            handle_id: liveness.handle.handle_id,
            status,
            observed_at: Utc::now(),
            evidence,
        };

        let previous = liveness.last_status;
        if previous != Some(status) {
            if status.is_anomaly() {
                tracing::warn!(stage = %record.stage_id, from = ?previous, to = %status, "health changed");
            } else {
                tracing::info!(stage = %record.stage_id, from = ?previous, to = %status, "health changed");
            }
            self.bus.publish(
                HealthEvent::new(
                    record.stage_id.clone(),
                    HealthEventKind::HealthTransition {
                        from: previous,
                        to: status,
                    },
                )
                .with_handle(record.handle_id),
            );
        }

        liveness.last_status = Some(status);
        liveness.cached = Some((liveness.generation, record.clone()));
        record
    }
}

impl LivenessSink for HealthMonitor {
    fn heartbeat(&self, handle: &StageHandle) -> Result<(), MonitorError> {
        Self::heartbeat(self, handle)
    }

    fn report_exit(&self, handle: &StageHandle, signal: ExitSignal) -> Result<(), MonitorError> {
        Self::report_exit(self, handle, signal)
    }
}
