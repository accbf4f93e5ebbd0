//! Supervision store
//!
//! Bounded recovery history and retry-budget accounting per stage, plus the
//! serializable [`SupervisionSnapshot`] of everything the supervisor knows.

use crate::breaker::BreakerSnapshot;
use crate::error::SupervisionError;
use crate::types::{HealthRecord, PatchRecord, RecoveryAttempt, StageHandle};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use warden_events::{HandleId, StageId};

#[derive(Debug, Default)]
struct RunState {
    executed: u32,
    history: VecDeque<RecoveryAttempt>,
}

/// Per-stage recovery history and budget accounting
#[derive(Debug)]
pub struct SupervisionStore {
    history_limit: usize,
    runs: DashMap<StageId, Arc<Mutex<RunState>>>,
}

impl SupervisionStore {
    /// Store keeping at most `history_limit` attempts per stage
    #[must_use]
    pub fn new(history_limit: usize) -> Self {
        Self {
            history_limit: history_limit.max(1),
            runs: DashMap::new(),
        }
    }

    /// Start a new supervised run: the executed-attempt count goes back to zero
    ///
    /// History is kept across runs.
    pub fn begin_run(&self, stage_id: &StageId) {
        self.cell(stage_id).lock().executed = 0;
    }

    /// Executed attempts in the current run
    #[must_use]
    pub fn executed_attempts(&self, stage_id: &StageId) -> u32 {
        self.runs
            .get(stage_id)
            .map_or(0, |cell| cell.value().lock().executed)
    }

    /// Append an attempt, counting it when it was executed
    pub fn record(&self, attempt: RecoveryAttempt) {
        let cell = self.cell(&attempt.stage_id);
        let mut run = cell.lock();
        if attempt.action.is_executed() {
            run.executed = run.executed.saturating_add(1);
        }
        run.history.push_back(attempt);
        while run.history.len() > self.history_limit {
            run.history.pop_front();
        }
    }

    /// Retained attempts, oldest first
    #[must_use]
    pub fn history(&self, stage_id: &StageId) -> Vec<RecoveryAttempt> {
        self.runs
            .get(stage_id)
            .map(|cell| cell.value().lock().history.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn cell(&self, stage_id: &StageId) -> Arc<Mutex<RunState>> {
        self.runs.entry(stage_id.clone()).or_default().clone()
    }
}

/// Serializable view of one execution handle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandleSnapshot {
    /// Execution id
    pub handle_id: HandleId,
    /// Execution number
    pub attempt: u32,
    /// Hang timeout in force
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// Time since the execution started
    #[serde(with = "humantime_serde")]
    pub age: Duration,
}

impl From<&StageHandle> for HandleSnapshot {
    fn from(handle: &StageHandle) -> Self {
        Self {
            handle_id: handle.handle_id,
            attempt: handle.attempt,
            timeout: handle.timeout,
            age: handle.age(),
        }
    }
}

/// Everything known about one stage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageSnapshot {
    /// Current execution
    pub handle: Option<HandleSnapshot>,
    /// Latest health record
    pub health: Option<HealthRecord>,
    /// Breaker state
    pub breaker: Option<BreakerSnapshot>,
    /// Executed attempts in the current run
    pub executed_attempts: u32,
    /// Retained recovery attempts, oldest first
    pub history: Vec<RecoveryAttempt>,
}

/// Point-in-time view of the whole supervisor
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisionSnapshot {
    /// When the snapshot was taken
    pub taken_at: DateTime<Utc>,
    /// Per-stage state keyed by stage id
    pub stages: BTreeMap<StageId, StageSnapshot>,
    /// Latest patch per source unit
    pub patches: BTreeMap<String, PatchRecord>,
}

impl SupervisionSnapshot {
    /// Pretty-printed JSON
    ///
    /// # Errors
    /// - `SupervisionError::Snapshot` if serialization fails
    pub fn to_json(&self) -> Result<String, SupervisionError> {
        serde_json::to_string_pretty(self).map_err(|e| SupervisionError::Snapshot(e.to_string()))
    }

    /// Write pretty-printed JSON to `path`
    ///
    /// # Errors
    /// - `SupervisionError::Snapshot` if serialization or the write fails
    pub fn write_json(&self, path: impl AsRef<Path>) -> Result<(), SupervisionError> {
        let path = path.as_ref();
        let json = self.to_json()?;
        std::fs::write(path, json)
            .map_err(|e| SupervisionError::Snapshot(format!("{}: {e}", path.display())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{HealthEvidence, RecoveryOutcome};
    use warden_events::{HealthStatus, RecoveryActionKind};

    fn attempt(stage: &str, action: RecoveryActionKind) -> RecoveryAttempt {
        let record = HealthRecord {
            stage_id: StageId::new(stage),
            handle_id: HandleId::new(),
            status: HealthStatus::Stalled,
            observed_at: Utc::now(),
            evidence: HealthEvidence {
                since_start: Duration::from_secs(200),
                since_heartbeat: Some(Duration::from_secs(160)),
                heartbeats: 4,
                timeout: Duration::from_secs(300),
                exited: false,
                crash: None,
            },
        };
        RecoveryAttempt::new(action, record, RecoveryOutcome::Succeeded, 1)
    }

    #[test]
    fn only_executed_actions_count() {
        let store = SupervisionStore::new(8);
        let stage = StageId::new("s");
        store.record(attempt("s", RecoveryActionKind::RetryInPlace));
        store.record(attempt("s", RecoveryActionKind::ShortCircuit));
        store.record(attempt("s", RecoveryActionKind::Escalate));
        store.record(attempt("s", RecoveryActionKind::Restart));

        assert_eq!(store.executed_attempts(&stage), 2);
        assert_eq!(store.history(&stage).len(), 4);
    }

    #[test]
    fn history_is_bounded_and_survives_new_run() {
        let store = SupervisionStore::new(2);
        let stage = StageId::new("s");
        for _ in 0..5 {
            store.record(attempt("s", RecoveryActionKind::RetryInPlace));
        }
        assert_eq!(store.history(&stage).len(), 2);

        store.begin_run(&stage);
        assert_eq!(store.executed_attempts(&stage), 0);
        assert_eq!(store.history(&stage).len(), 2);
    }

    #[test]
    fn snapshot_writes_json() {
        let store = SupervisionStore::new(4);
        let stage = StageId::new("s");
        store.record(attempt("s", RecoveryActionKind::RetryInPlace));

        let mut stages = BTreeMap::new();
        stages.insert(
            stage.clone(),
            StageSnapshot {
                handle: None,
                health: None,
                breaker: None,
                executed_attempts: store.executed_attempts(&stage),
                history: store.history(&stage),
            },
        );
        let snapshot = SupervisionSnapshot {
            taken_at: Utc::now(),
            stages,
            patches: BTreeMap::new(),
        };

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snapshot.json");
        snapshot.write_json(&path).unwrap();

        let value: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(value["stages"]["s"]["executed_attempts"], 1);
        assert_eq!(value["stages"]["s"]["history"][0]["action"], "retry_in_place");
        assert_eq!(
            value["stages"]["s"]["history"][0]["input"]["evidence"]["timeout"],
            "5m"
        );
    }
}
