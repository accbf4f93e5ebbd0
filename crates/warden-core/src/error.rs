//! Error types for Warden Core
//!
//! Provides error handling for:
//! - Configuration loading and validation
//! - Liveness bookkeeping (unknown or superseded handles)
//! - Stage driver signalling
//! - Source access, diagnosis and auto-fix
//! - The failure taxonomy used for escalation decisions

use crate::types::PatchRecord;
use std::path::PathBuf;
use std::time::Duration;
use warden_events::{BusError, HandleId, HealthStatus, StageId};

/// Failure taxonomy of the supervision core
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Stage terminated with an attached error
    ProcessCrash,
    /// No heartbeat within the full timeout
    ProcessHang,
    /// No heartbeat within half the timeout after prior progress
    ProcessStall,
    /// Attempt rejected by an open breaker without execution
    BreakerOpenRejection,
    /// Retry budget used up
    RecoveryBudgetExhausted,
    /// Diagnosis port unreachable, timed out or unusable
    AutoFixUnavailable,
    /// Fallback rule set has no rule for the error kind
    AutoFixUnsupportedErrorKind,
    /// Write or reload failed after the backup succeeded
    PatchApplicationFailure,
}

impl FailureKind {
    /// Failure kind implied by a health status
    #[must_use]
    pub fn from_status(status: HealthStatus) -> Option<Self> {
        match status {
            HealthStatus::Healthy => None,
            HealthStatus::Stalled => Some(Self::ProcessStall),
            HealthStatus::Hung => Some(Self::ProcessHang),
            HealthStatus::Crashed => Some(Self::ProcessCrash),
        }
    }

    /// Kinds that are never handled locally
    #[inline]
    #[must_use]
    pub fn always_escalates(self) -> bool {
        matches!(
            self,
            Self::RecoveryBudgetExhausted
                | Self::AutoFixUnsupportedErrorKind
                | Self::PatchApplicationFailure
        )
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Config file could not be read
    #[error("io error reading {path}: {source}")]
    Io {
        /// File path
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// TOML did not parse
    #[error("config parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// A value is out of range
    #[error("invalid config value for {field}: {reason}")]
    Invalid {
        /// Offending field path
        field: String,
        /// Why it is invalid
        reason: String,
    },
}

impl ConfigError {
    /// Create an invalid-value error
    pub fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// Liveness bookkeeping errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MonitorError {
    /// Stage id was never registered (or was deregistered)
    #[error("stage not registered: {0}")]
    UnknownStage(StageId),

    /// Handle was superseded by a restart
    #[error("stale handle {handle} for stage {stage_id}")]
    StaleHandle {
        /// Stage id
        stage_id: StageId,
        /// Superseded handle
        handle: HandleId,
    },
}

/// Stage driver errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProcessError {
    /// Launching a stage execution failed
    #[error("failed to launch stage {stage_id}: {reason}")]
    LaunchFailed {
        /// Stage id
        stage_id: StageId,
        /// Driver-provided reason
        reason: String,
    },

    /// Sending a stop or nudge signal failed
    #[error("failed to signal stage {stage_id}: {reason}")]
    SignalFailed {
        /// Stage id
        stage_id: StageId,
        /// Driver-provided reason
        reason: String,
    },

    /// Driver has no definition for the stage
    #[error("no stage definition for {0}")]
    UnknownStage(StageId),

    /// The process outlived both graceful and forced stop
    #[error("stage {0} is still running after forced stop")]
    StillRunning(StageId),
}

/// Source-access port errors
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    /// Unit does not exist
    #[error("source unit not found: {0}")]
    NotFound(String),

    /// Requested line is outside the unit
    #[error("line {line} out of range for {unit}")]
    LineOutOfRange {
        /// Source unit
        unit: String,
        /// Requested line (1-based)
        line: u32,
    },

    /// Filesystem failure
    #[error("io error on {unit}: {source}")]
    Io {
        /// Source unit
        unit: String,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// Unit could not be reloaded
    #[error("reload of {unit} failed: {reason}")]
    Reload {
        /// Source unit
        unit: String,
        /// Why
        reason: String,
    },

    /// Port-specific failure
    #[error("source access failed for {unit}: {reason}")]
    Other {
        /// Source unit
        unit: String,
        /// Why
        reason: String,
    },
}

impl SourceError {
    /// Create an IO error for a unit
    pub fn io(unit: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            unit: unit.into(),
            source,
        }
    }
}

/// Diagnosis port errors
///
/// Every variant is treated as "diagnosis unavailable" by the auto-fix engine.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DiagnosisError {
    /// Service unreachable
    #[error("diagnosis service unavailable: {0}")]
    Unavailable(String),

    /// Call exceeded the configured bound
    #[error("diagnosis timed out after {0:?}")]
    Timeout(Duration),

    /// Response could not be parsed into a suggestion
    #[error("unusable diagnosis response: {0}")]
    Unusable(String),
}

/// Auto-fix errors
#[derive(Debug, thiserror::Error)]
pub enum AutoFixError {
    /// Crash report names no source location
    #[error("crash report has no source location")]
    MissingLocation,

    /// Faulting unit could not be read; nothing was modified
    #[error("could not read faulting unit: {0}")]
    Read(#[source] SourceError),

    /// Diagnosis unavailable and the fallback rule could not rewrite the line
    #[error("diagnosis unavailable ({diagnosis}) and fallback for '{kind}' did not apply")]
    Unavailable {
        /// Error kind
        kind: String,
        /// Why diagnosis was unusable
        diagnosis: DiagnosisError,
    },

    /// Diagnosis unavailable and no fallback rule covers the kind
    #[error("no fallback rule for error kind '{kind}'")]
    UnsupportedErrorKind {
        /// Error kind
        kind: String,
    },

    /// Backup could not be written; nothing was modified
    #[error("backup failed: {0}")]
    Backup(#[source] SourceError),

    /// Patch write or reload failed after a successful backup
    #[error("patch application failed ({reason}); original saved at {}", .record.backup_location.as_deref().unwrap_or("<none>"))]
    PatchApplication {
        /// Audit record, including the backup location
        record: Box<PatchRecord>,
        /// Failure description
        reason: String,
    },

    /// No audit record exists for a rollback
    #[error("no patch recorded for {0}")]
    NoPatchRecorded(String),

    /// Rollback restore failed
    #[error("rollback failed: {0}")]
    Rollback(#[source] SourceError),

    /// Operator escalation arrived before any mutation
    #[error("auto-fix cancelled")]
    Cancelled,
}

impl AutoFixError {
    /// Taxonomy entry for this error
    #[must_use]
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            Self::UnsupportedErrorKind { .. } => FailureKind::AutoFixUnsupportedErrorKind,
            Self::PatchApplication { .. } => FailureKind::PatchApplicationFailure,
            _ => FailureKind::AutoFixUnavailable,
        }
    }

    /// Backup location surfaced for manual recovery, if any
    #[must_use]
    pub fn backup_location(&self) -> Option<&str> {
        match self {
            Self::PatchApplication { record, .. } => record.backup_location.as_deref(),
            _ => None,
        }
    }
}

/// Recovery engine errors
#[derive(Debug, thiserror::Error)]
pub enum RecoveryError {
    /// Record is healthy
    #[error("stage {0} is healthy, nothing to recover")]
    NothingToRecover(StageId),

    /// Liveness bookkeeping failed
    #[error(transparent)]
    Monitor(#[from] MonitorError),
}

/// Top-level error for the supervision facade
#[derive(Debug, thiserror::Error)]
pub enum SupervisionError {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Liveness bookkeeping error
    #[error("monitor error: {0}")]
    Monitor(#[from] MonitorError),

    /// Stage driver error
    #[error("process error: {0}")]
    Process(#[from] ProcessError),

    /// Auto-fix error
    #[error("auto-fix error: {0}")]
    AutoFix(#[from] AutoFixError),

    /// Recovery error
    #[error("recovery error: {0}")]
    Recovery(#[from] RecoveryError),

    /// Event bus error
    #[error("event bus error: {0}")]
    Bus(#[from] BusError),

    /// Breaker rejected the attempt
    #[error("stage {0} rejected by open circuit breaker")]
    BreakerOpen(StageId),

    /// Stage is already being supervised
    #[error("stage {0} is already supervised")]
    AlreadySupervised(StageId),

    /// Snapshot could not be persisted
    #[error("snapshot error: {0}")]
    Snapshot(String),
}

impl SupervisionError {
    /// Taxonomy entry, when the error maps to one
    #[must_use]
    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            Self::BreakerOpen(_) => Some(FailureKind::BreakerOpenRejection),
            Self::AutoFix(e) => Some(e.failure_kind()),
            _ => None,
        }
    }

    /// Whether this error must be surfaced to an operator
    #[must_use]
    pub fn is_escalation(&self) -> bool {
        self.failure_kind().is_some_and(FailureKind::always_escalates)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escalating_kinds() {
        assert!(FailureKind::RecoveryBudgetExhausted.always_escalates());
        assert!(FailureKind::AutoFixUnsupportedErrorKind.always_escalates());
        assert!(FailureKind::PatchApplicationFailure.always_escalates());
        assert!(!FailureKind::ProcessStall.always_escalates());
        assert!(!FailureKind::BreakerOpenRejection.always_escalates());
        assert!(!FailureKind::AutoFixUnavailable.always_escalates());
    }

    #[test]
    fn status_maps_to_process_failures() {
        assert_eq!(FailureKind::from_status(HealthStatus::Healthy), None);
        assert_eq!(
            FailureKind::from_status(HealthStatus::Hung),
            Some(FailureKind::ProcessHang)
        );
        assert_eq!(
            FailureKind::from_status(HealthStatus::Crashed),
            Some(FailureKind::ProcessCrash)
        );
    }

    #[test]
    fn breaker_rejection_is_fast_failure_not_escalation() {
        let err = SupervisionError::BreakerOpen(StageId::new("codegen"));
        assert_eq!(err.failure_kind(), Some(FailureKind::BreakerOpenRejection));
        assert!(!err.is_escalation());
    }

    #[test]
    fn unsupported_kind_escalates() {
        let err = SupervisionError::from(AutoFixError::UnsupportedErrorKind {
            kind: "SegmentationFault".into(),
        });
        assert!(err.is_escalation());
        assert!(err.to_string().contains("SegmentationFault"));
    }
}
