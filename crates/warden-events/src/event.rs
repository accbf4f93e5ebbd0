//! Health event vocabulary
//!
//! Every state transition made by the supervision core is described by a
//! [`HealthEvent`]. The enums here are the shared language between the
//! monitor, the breaker registry, the recovery engine and any observer.

use crate::ids::{HandleId, StageId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Liveness classification of a supervised stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    /// Progressing normally
    Healthy,
    /// Was progressing, then stopped heartbeating for half its timeout
    Stalled,
    /// No progress for the whole timeout
    Hung,
    /// Terminated with an attached error
    Crashed,
}

impl HealthStatus {
    /// Whether this status calls for recovery
    #[inline]
    #[must_use]
    pub fn is_anomaly(self) -> bool {
        !matches!(self, Self::Healthy)
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Healthy => "healthy",
            Self::Stalled => "stalled",
            Self::Hung => "hung",
            Self::Crashed => "crashed",
        };
        f.write_str(s)
    }
}

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    /// Attempts flow normally
    Closed,
    /// Attempts are rejected until the cooldown elapses
    Open,
    /// A single trial attempt decides the next state
    HalfOpen,
}

impl fmt::Display for BreakerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        };
        f.write_str(s)
    }
}

/// Recovery strategy chosen by the recovery engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryActionKind {
    /// Nudge the stage without terminating it
    RetryInPlace,
    /// Graceful then forced terminate, followed by a restart
    TerminateAndRestart,
    /// Patch the faulting unit, reload it, restart the stage
    AutoFixAndRestart,
    /// Restart without patching
    Restart,
    /// Rejected by an open breaker, nothing executed
    ShortCircuit,
    /// Surfaced to the operator, no further automated action
    Escalate,
}

impl RecoveryActionKind {
    /// Whether the action does work and counts against the retry budget
    #[inline]
    #[must_use]
    pub fn is_executed(self) -> bool {
        !matches!(self, Self::ShortCircuit | Self::Escalate)
    }
}

impl fmt::Display for RecoveryActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::RetryInPlace => "retry_in_place",
            Self::TerminateAndRestart => "terminate_and_restart",
            Self::AutoFixAndRestart => "auto_fix_and_restart",
            Self::Restart => "restart",
            Self::ShortCircuit => "short_circuit",
            Self::Escalate => "escalate",
        };
        f.write_str(s)
    }
}

/// Why a stage was handed to the operator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum EscalationReason {
    /// Retry budget for the supervised run is used up
    RecoveryBudgetExhausted {
        /// Configured budget
        budget: u32,
    },
    /// Diagnosis unavailable and no fallback rule covers the error kind
    AutoFixUnsupportedErrorKind {
        /// Error kind as reported by the crash
        kind: String,
    },
    /// Backup succeeded but the patch could not be written or reloaded
    PatchApplicationFailure {
        /// Patched source unit
        unit: String,
        /// Where the pre-patch content was saved
        backup: String,
    },
    /// Auto-fix failed for another reason (unreadable source, missing location)
    AutoFixFailed {
        /// Failure description
        detail: String,
    },
    /// Operator asked to take over
    OperatorRequested {
        /// Free-form note from the operator
        note: Option<String>,
    },
}

impl fmt::Display for EscalationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RecoveryBudgetExhausted { budget } => {
                write!(f, "recovery budget of {budget} attempts exhausted")
            }
            Self::AutoFixUnsupportedErrorKind { kind } => {
                write!(f, "no auto-fix available for error kind '{kind}'")
            }
            Self::PatchApplicationFailure { unit, backup } => {
                write!(f, "patch of {unit} failed, original saved at {backup}")
            }
            Self::AutoFixFailed { detail } => write!(f, "auto-fix failed: {detail}"),
            Self::OperatorRequested { note: Some(note) } => {
                write!(f, "operator escalation: {note}")
            }
            Self::OperatorRequested { note: None } => f.write_str("operator escalation"),
        }
    }
}

/// Payload of a health event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HealthEventKind {
    /// Classification changed
    HealthTransition {
        /// Previous status (`None` on first evaluation)
        from: Option<HealthStatus>,
        /// New status
        to: HealthStatus,
    },
    /// Breaker moved between states
    BreakerTransition {
        /// Previous state
        from: BreakerState,
        /// New state
        to: BreakerState,
        /// Consecutive failures after the transition
        consecutive_failures: u32,
    },
    /// A recovery action was chosen (and executed unless short-circuited)
    RecoveryAttempted {
        /// Chosen action
        action: RecoveryActionKind,
        /// Whether the action succeeded
        success: bool,
        /// Executed attempts so far in the supervised run
        attempt: u32,
        /// Extra detail for operators
        detail: Option<String>,
    },
    /// Automated recovery gave up
    RecoveryEscalated {
        /// Why
        reason: EscalationReason,
    },
    /// A patched source unit was written and reloaded
    PatchApplied {
        /// Patched source unit
        unit: String,
        /// Faulting line that was replaced (1-based)
        line: u32,
        /// Backup location of the original content
        backup: String,
    },
}

impl HealthEventKind {
    /// Stable short name, used as a metrics label
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::HealthTransition { .. } => "health_transition",
            Self::BreakerTransition { .. } => "breaker_transition",
            Self::RecoveryAttempted { .. } => "recovery_attempted",
            Self::RecoveryEscalated { .. } => "recovery_escalated",
            Self::PatchApplied { .. } => "patch_applied",
        }
    }
}

/// One published state transition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthEvent {
    /// Bus-assigned sequence number (0 until published)
    pub sequence: u64,
    /// Stage the event concerns
    pub stage_id: StageId,
    /// Execution handle, when the event concerns one execution
    pub handle_id: Option<HandleId>,
    /// Wall-clock time of the transition
    pub at: DateTime<Utc>,
    /// What happened
    pub kind: HealthEventKind,
}

impl HealthEvent {
    /// Create an event stamped with the current time
    #[must_use]
    pub fn new(stage_id: StageId, kind: HealthEventKind) -> Self {
        Self {
            sequence: 0,
            stage_id,
            handle_id: None,
            at: Utc::now(),
            kind,
        }
    }

    /// Attach an execution handle
    #[inline]
    #[must_use]
    pub fn with_handle(mut self, handle_id: HandleId) -> Self {
        self.handle_id = Some(handle_id);
        self
    }

    /// Whether this event is an escalation
    #[inline]
    #[must_use]
    pub fn is_escalation(&self) -> bool {
        matches!(self.kind, HealthEventKind::RecoveryEscalated { .. })
    }
}
