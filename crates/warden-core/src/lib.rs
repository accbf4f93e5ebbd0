//! Warden Core
//!
//! Supervision and self-recovery for long-running pipeline stages:
//! - [`HealthMonitor`]: classifies executions as healthy, stalled, hung or crashed
//! - [`CircuitBreakerRegistry`]: per-stage gate on further attempts
//! - [`RecoveryEngine`]: picks and runs a recovery strategy
//! - [`AutoFixEngine`]: diagnoses and patches the faulting line of a crash
//! - [`ProcessController`]: graceful then forced termination, restarts
//! - [`Supervisor`]: the orchestrator-facing facade with per-stage watch loops
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use warden_core::prelude::*;
//!
//! let driver = Arc::new(TaskDriver::new().with_stage("ingest", |ctx: StageContext| async move {
//!     ctx.heartbeat();
//!     Ok(())
//! }));
//! let supervisor = Supervisor::builder()
//!     .config(SupervisorConfig::default())
//!     .driver(driver)
//!     .build()?;
//! let handle = supervisor.launch(StageSpec::new("ingest")).await?;
//! let outcome = supervisor.supervise(handle)?.await?;
//! ```

pub mod autofix;
pub mod breaker;
pub mod config;
pub mod error;
pub mod monitor;
pub mod process;
pub mod recovery;
pub mod store;
pub mod supervisor;
pub mod telemetry;
pub mod types;

pub use autofix::{
    AutoFixEngine, DiagnosisPort, DiagnosisReply, DiagnosisRequest, FallbackRule, FallbackRules,
    FsSourceAccess, LineWindow, MissingKeyRule, SourceAccess, SourceExcerpt,
};
pub use breaker::{BreakerSnapshot, CircuitBreakerRegistry};
pub use config::{
    AutoFixConfig, BreakerConfig, RetryBackoff, StagePolicy, SupervisorConfig, TimeoutGrowth,
};
pub use error::{
    AutoFixError, ConfigError, DiagnosisError, FailureKind, MonitorError, ProcessError,
    RecoveryError, SourceError, SupervisionError,
};
pub use monitor::HealthMonitor;
pub use process::{LivenessSink, ProcessController, StageContext, StageDriver, TaskDriver};
pub use recovery::{select_action, RecoveryEngine};
pub use store::{StageSnapshot, SupervisionSnapshot, SupervisionStore};
pub use supervisor::{SupervisionOutcome, Supervisor, SupervisorBuilder};
pub use types::{
    CrashReport, ErrorKind, ExitSignal, HealthEvidence, HealthRecord, PatchOrigin, PatchRecord,
    RecoveryAttempt, RecoveryOutcome, SourceLocation, StageHandle, StageSpec,
};

pub use warden_events::{
    BreakerState, EscalationReason, EventJournal, HandleId, HealthEvent, HealthEventBus,
    HealthEventKind, HealthObserver, HealthStatus, ObserverError, RecoveryActionKind, StageId,
    SubscriptionId,
};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Prelude for common imports
pub mod prelude {
    pub use crate::config::{AutoFixConfig, BreakerConfig, StagePolicy, SupervisorConfig};
    pub use crate::error::{FailureKind, SupervisionError};
    pub use crate::process::{StageContext, StageDriver, TaskDriver};
    pub use crate::supervisor::{SupervisionOutcome, Supervisor};
    pub use crate::types::{CrashReport, ErrorKind, ExitSignal, StageHandle, StageSpec};
    pub use warden_events::{HealthEvent, HealthEventKind, HealthStatus, StageId};
}
