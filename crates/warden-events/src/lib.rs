//! Warden Events
//!
//! The leaf of the supervision workspace:
//! - Stage and handle identifiers
//! - The health event vocabulary (health, breaker, recovery, escalation)
//! - [`HealthEventBus`], a fire-and-forget publish/subscribe hub
//! - [`EventJournal`], a hash-chained audit trail that subscribes to the bus
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use warden_events::{EventJournal, HealthEventBus};
//!
//! let bus = HealthEventBus::default();
//! let journal = Arc::new(EventJournal::new());
//! bus.subscribe(journal.clone())?;
//! ```

pub mod bus;
pub mod event;
pub mod ids;
pub mod journal;

pub use bus::{BusError, HealthEventBus, HealthObserver, ObserverError, DEFAULT_SUBSCRIBER_CAPACITY};
pub use event::{
    BreakerState, EscalationReason, HealthEvent, HealthEventKind, HealthStatus, RecoveryActionKind,
};
pub use ids::{HandleId, StageId, SubscriptionId};
pub use journal::{EventJournal, JournalEntry, JournalError};
