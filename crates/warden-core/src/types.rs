//! Core data model
//!
//! - [`StageSpec`] / [`StageHandle`]: what is supervised and one execution of it
//! - [`HealthRecord`]: the latest classification with its evidence
//! - [`CrashReport`] / [`ErrorKind`]: what a failed execution left behind
//! - [`RecoveryAttempt`]: one decision of the recovery engine
//! - [`PatchRecord`]: the audit record of one auto-fix

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::OnceLock;
use std::time::Duration;
use tokio::time::Instant;
use warden_events::{EscalationReason, HandleId, HealthStatus, RecoveryActionKind, StageId};

/// Registration request from the orchestrator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageSpec {
    /// Stage id
    pub stage_id: StageId,
    /// Hang timeout; the stage policy's timeout when `None`
    pub timeout: Option<Duration>,
}

impl StageSpec {
    /// Spec using the policy timeout
    pub fn new(stage_id: impl Into<StageId>) -> Self {
        Self {
            stage_id: stage_id.into(),
            timeout: None,
        }
    }

    /// Override the hang timeout
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// One execution of a stage
///
/// Handles are immutable; a restart produces a new one via
/// [`StageHandle::successor`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageHandle {
    /// Stage id
    pub stage_id: StageId,
    /// Unique execution id
    pub handle_id: HandleId,
    /// 1 for the first execution, +1 per restart
    pub attempt: u32,
    /// When the execution started
    pub started_at: Instant,
    /// Hang timeout in force for this execution
    pub timeout: Duration,
}

impl StageHandle {
    /// First execution of a stage, starting now
    pub fn new(stage_id: impl Into<StageId>, timeout: Duration) -> Self {
        Self {
            stage_id: stage_id.into(),
            handle_id: HandleId::new(),
            attempt: 1,
            started_at: Instant::now(),
            timeout,
        }
    }

    /// Fresh handle for a restart: new id, next attempt, new start time
    #[must_use]
    pub fn successor(&self, timeout: Duration) -> Self {
        Self {
            stage_id: self.stage_id.clone(),
            handle_id: HandleId::new(),
            attempt: self.attempt.saturating_add(1),
            started_at: Instant::now(),
            timeout,
        }
    }

    /// Time since the execution started
    #[inline]
    #[must_use]
    pub fn age(&self) -> Duration {
        self.started_at.elapsed()
    }
}

/// How an execution ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitSignal {
    /// Finished without error
    Completed,
    /// Terminated with an attached error
    Failed(CrashReport),
}

/// Latest classification of a stage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthRecord {
    /// Stage id
    pub stage_id: StageId,
    /// Execution the record describes
    pub handle_id: HandleId,
    /// Classification
    pub status: HealthStatus,
    /// When this classification was made
    pub observed_at: DateTime<Utc>,
    /// Signals that led to the classification
    pub evidence: HealthEvidence,
}

impl HealthRecord {
    /// Crash report, when crashed
    #[must_use]
    pub fn crash(&self) -> Option<&CrashReport> {
        self.evidence.crash.as_ref()
    }
}

/// Signals behind a [`HealthRecord`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthEvidence {
    /// Time since the execution started
    #[serde(with = "humantime_serde")]
    pub since_start: Duration,
    /// Time since the last heartbeat, if any arrived
    #[serde(with = "humantime_serde")]
    pub since_heartbeat: Option<Duration>,
    /// Heartbeats received by this execution
    pub heartbeats: u64,
    /// Timeout applied
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// Whether the execution has exited
    pub exited: bool,
    /// Crash details
    pub crash: Option<CrashReport>,
}

/// Location of a faulting line
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SourceLocation {
    /// Source unit (path or module name)
    pub unit: String,
    /// 1-based line
    pub line: u32,
}

impl SourceLocation {
    /// Create a location
    pub fn new(unit: impl Into<String>, line: u32) -> Self {
        Self {
            unit: unit.into(),
            line,
        }
    }
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.unit, self.line)
    }
}

/// Coarse class of a stage error
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Lookup of an absent key
    MissingKey,
    /// Index past the end of a sequence
    IndexOutOfRange,
    /// Access through a null/none value
    NullReference,
    /// Operation applied to the wrong type
    TypeMismatch,
    /// Operation timed out
    Timeout,
    /// Anything else, with the reported name
    Other(String),
}

impl ErrorKind {
    /// Classify a reported error name and message
    ///
    /// The name is tried first, then the message.
    #[must_use]
    pub fn classify(name: &str, message: &str) -> Self {
        Self::match_text(name)
            .or_else(|| Self::match_text(message))
            .unwrap_or_else(|| {
                let name = name.trim();
                Self::Other(if name.is_empty() { "unknown".into() } else { name.into() })
            })
    }

    fn match_text(text: &str) -> Option<Self> {
        let lower = text.to_lowercase();
        let has = |needles: &[&str]| needles.iter().any(|n| lower.contains(n));

        if has(&["keyerror", "missing key", "missingkey", "key not found", "no such key"]) {
            Some(Self::MissingKey)
        } else if has(&["indexerror", "index out of range", "out of bounds", "indexoutofrange"]) {
            Some(Self::IndexOutOfRange)
        } else if has(&["nonetype", "null pointer", "nullreference", "null reference", "undefined is not", "unwrap on a none"]) {
            Some(Self::NullReference)
        } else if has(&["typeerror", "type mismatch", "mismatched types", "typemismatch"]) {
            Some(Self::TypeMismatch)
        } else if has(&["timeout", "timed out"]) {
            Some(Self::Timeout)
        } else {
            None
        }
    }

    /// Stable name
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::MissingKey => "missing_key",
            Self::IndexOutOfRange => "index_out_of_range",
            Self::NullReference => "null_reference",
            Self::TypeMismatch => "type_mismatch",
            Self::Timeout => "timeout",
            Self::Other(name) => name,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a crashed execution left behind
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrashReport {
    /// Error class
    pub kind: ErrorKind,
    /// Error message
    pub message: String,
    /// Faulting line, when known
    pub location: Option<SourceLocation>,
    /// Source excerpt supplied by the stage
    pub context: Option<String>,
    /// Raw stack trace
    pub trace: Option<String>,
}

impl CrashReport {
    /// Report without location
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            location: None,
            context: None,
            trace: None,
        }
    }

    /// Build from a raw error name, message and stack trace
    ///
    /// The kind is classified from `name` and `message`; the location is the
    /// innermost frame found in `trace`.
    pub fn from_trace(name: &str, message: impl Into<String>, trace: impl Into<String>) -> Self {
        let message = message.into();
        let trace = trace.into();
        Self {
            kind: ErrorKind::classify(name, &message),
            location: innermost_frame(&trace),
            message,
            context: None,
            trace: Some(trace),
        }
    }

    /// Attach a location
    #[must_use]
    pub fn with_location(mut self, location: SourceLocation) -> Self {
        self.location = Some(location);
        self
    }

    /// Attach a source excerpt
    #[must_use]
    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }
}

fn quoted_frame() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r#"File "([^"]+)", line (\d+)"#).ok())
        .as_ref()
}

fn path_frame() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"([\w./\\-]+\.\w+):(\d+)(?::\d+)?").ok())
        .as_ref()
}

/// Innermost stack frame of a trace
///
/// `File "x", line N` traces list the innermost frame last; `path:line[:col]`
/// traces list it first.
fn innermost_frame(trace: &str) -> Option<SourceLocation> {
    let to_location = |caps: regex::Captures<'_>| {
        let line = caps.get(2)?.as_str().parse().ok()?;
        Some(SourceLocation::new(caps.get(1)?.as_str(), line))
    };

    if let Some(found) = quoted_frame()
        .and_then(|re| re.captures_iter(trace).filter_map(to_location).last())
    {
        return Some(found);
    }
    path_frame().and_then(|re| re.captures_iter(trace).find_map(to_location))
}

/// Result of one recovery decision
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RecoveryOutcome {
    /// Executed and succeeded
    Succeeded,
    /// Executed and failed
    Failed {
        /// What went wrong
        detail: String,
    },
    /// Rejected by an open breaker
    ShortCircuited,
    /// Handed to the operator
    Escalated {
        /// Why
        reason: EscalationReason,
    },
}

impl RecoveryOutcome {
    /// Whether the action succeeded
    #[inline]
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded)
    }
}

/// One recovery decision and its outcome
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryAttempt {
    /// Stage id
    pub stage_id: StageId,
    /// Chosen action
    pub action: RecoveryActionKind,
    /// Record that triggered the decision
    pub input: HealthRecord,
    /// Result
    pub outcome: RecoveryOutcome,
    /// Executed attempts in the supervised run, including this one
    pub attempt_number: u32,
    /// When the decision was made
    pub at: DateTime<Utc>,
    /// Longer timeout recommended after a hang
    #[serde(with = "humantime_serde")]
    pub recommended_timeout: Option<Duration>,
    /// Patch applied before a restart
    pub patch: Option<PatchRecord>,
    /// Execution started by this attempt
    #[serde(skip)]
    pub successor: Option<StageHandle>,
}

impl RecoveryAttempt {
    /// Attempt with no successor or patch
    #[must_use]
    pub fn new(
        action: RecoveryActionKind,
        input: HealthRecord,
        outcome: RecoveryOutcome,
        attempt_number: u32,
    ) -> Self {
        Self {
            stage_id: input.stage_id.clone(),
            action,
            input,
            outcome,
            attempt_number,
            at: Utc::now(),
            recommended_timeout: None,
            patch: None,
            successor: None,
        }
    }

    /// Escalation reason, when escalated
    #[must_use]
    pub fn escalation(&self) -> Option<&EscalationReason> {
        match &self.outcome {
            RecoveryOutcome::Escalated { reason } => Some(reason),
            _ => None,
        }
    }
}

/// Where a patch came from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum PatchOrigin {
    /// Diagnosis port suggestion
    Diagnosis,
    /// Built-in rewrite rule
    Fallback {
        /// Rule name
        rule: String,
    },
}

/// Audit record of one auto-fix
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchRecord {
    /// Patched unit
    pub unit: String,
    /// Faulting line (1-based)
    pub line: u32,
    /// Full content before patching
    pub original: String,
    /// Text that replaced the faulting line
    pub replacement: String,
    /// Where the original was saved
    pub backup_location: Option<String>,
    /// Whether the patch was written and reloaded
    pub applied: bool,
    /// Explanation from the diagnosis or rule
    pub rationale: String,
    /// Patch source
    pub origin: PatchOrigin,
    /// When the record was created
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_prefers_name_then_message() {
        assert_eq!(ErrorKind::classify("KeyError", "'user_id'"), ErrorKind::MissingKey);
        assert_eq!(
            ErrorKind::classify("RuntimeError", "list index out of range"),
            ErrorKind::IndexOutOfRange
        );
        assert_eq!(
            ErrorKind::classify("AttributeError", "'NoneType' object has no attribute 'x'"),
            ErrorKind::NullReference
        );
        assert_eq!(
            ErrorKind::classify("SegmentationFault", "core dumped"),
            ErrorKind::Other("SegmentationFault".into())
        );
        assert_eq!(ErrorKind::classify("", ""), ErrorKind::Other("unknown".into()));
    }

    #[test]
    fn python_trace_uses_last_frame() {
        let trace = r#"Traceback (most recent call last):
  File "pipeline/run.py", line 12, in main
    transform(rows)
  File "stages/transform.py", line 42, in transform
    value = row["user_id"]
KeyError: 'user_id'"#;
        let report = CrashReport::from_trace("KeyError", "'user_id'", trace);

        assert_eq!(report.kind, ErrorKind::MissingKey);
        assert_eq!(report.location, Some(SourceLocation::new("stages/transform.py", 42)));
        assert!(report.trace.is_some());
    }

    #[test]
    fn path_line_trace_uses_first_frame() {
        let trace = "thread 'main' panicked at src/stages/render.rs:88:14:\n\
                     index out of bounds\n\
                     note: run with RUST_BACKTRACE=1 from src/main.rs:10:5";
        let report = CrashReport::from_trace("panic", "index out of bounds", trace);

        assert_eq!(report.kind, ErrorKind::IndexOutOfRange);
        assert_eq!(report.location, Some(SourceLocation::new("src/stages/render.rs", 88)));
    }

    #[test]
    fn trace_without_frames_has_no_location() {
        let report = CrashReport::from_trace("Boom", "bad things", "no frames here");
        assert!(report.location.is_none());
    }

    #[test]
    fn successor_is_fresh() {
        let first = StageHandle::new("ingest", Duration::from_secs(300));
        let next = first.successor(Duration::from_secs(600));

        assert_ne!(first.handle_id, next.handle_id);
        assert_eq!(next.attempt, 2);
        assert_eq!(next.stage_id, first.stage_id);
        assert_eq!(next.timeout, Duration::from_secs(600));
    }
}
