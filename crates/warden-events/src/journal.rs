//! Tamper-evident event journal
//!
//! Keeps published events in a SHA-256 hash chain so an audit of recovery
//! decisions and patches can detect edits or gaps.

use crate::bus::{HealthObserver, ObserverError};
use crate::event::HealthEvent;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Journal errors
#[derive(Debug, thiserror::Error)]
pub enum JournalError {
    /// A stored hash or link does not match its recomputed value
    #[error("journal integrity violation at entry {index}")]
    IntegrityViolation {
        /// Offending entry
        index: u64,
    },

    /// Event could not be encoded for hashing
    #[error("event encoding failed: {0}")]
    Encoding(#[from] serde_json::Error),
}

/// One chained journal entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalEntry {
    /// Position in the journal (0-based, never reused)
    pub index: u64,
    /// Recorded event
    pub event: HealthEvent,
    /// Hash of the previous entry (hex)
    pub prev_hash: String,
    /// Hash of this entry (hex)
    pub hash: String,
}

#[derive(Debug, Default)]
struct JournalState {
    entries: Vec<JournalEntry>,
    /// `prev_hash` of the oldest retained entry
    anchor: String,
    next_index: u64,
}

/// Hash-chained, optionally bounded, event journal
#[derive(Debug)]
pub struct EventJournal {
    inner: Mutex<JournalState>,
    retain: Option<usize>,
}

impl Default for EventJournal {
    fn default() -> Self {
        Self::new()
    }
}

impl EventJournal {
    /// Unbounded journal
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(JournalState {
                anchor: genesis(),
                ..JournalState::default()
            }),
            retain: None,
        }
    }

    /// Journal keeping only the most recent `retain` entries
    #[must_use]
    pub fn bounded(retain: usize) -> Self {
        Self {
            retain: Some(retain.max(1)),
            ..Self::new()
        }
    }

    /// Append an event, returning its index
    ///
    /// # Errors
    /// - `JournalError::Encoding` if the event cannot be serialized
    pub fn append(&self, event: HealthEvent) -> Result<u64, JournalError> {
        let mut guard = self.inner.lock();
        let prev_hash = guard
            .entries
            .last()
            .map_or_else(|| guard.anchor.clone(), |e| e.hash.clone());
        let index = guard.next_index;
        let hash = compute_hash(index, &event, &prev_hash)?;
        guard.entries.push(JournalEntry {
            index,
            event,
            prev_hash,
            hash,
        });
        guard.next_index += 1;

        if let Some(retain) = self.retain {
            if guard.entries.len() > retain {
                let excess = guard.entries.len() - retain;
                guard.entries.drain(..excess);
                let anchor = guard.entries[0].prev_hash.clone();
                guard.anchor = anchor;
            }
        }
        Ok(index)
    }

    /// Snapshot of retained entries
    #[must_use]
    pub fn entries(&self) -> Vec<JournalEntry> {
        self.inner.lock().entries.clone()
    }

    /// Number of retained entries
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Whether nothing is retained
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Recompute the chain over retained entries
    ///
    /// # Errors
    /// - `JournalError::IntegrityViolation` naming the first bad entry
    pub fn verify_integrity(&self) -> Result<(), JournalError> {
        let guard = self.inner.lock();
        let mut prev = guard.anchor.clone();
        for entry in &guard.entries {
            if entry.prev_hash != prev {
                return Err(JournalError::IntegrityViolation { index: entry.index });
            }
            let expected = compute_hash(entry.index, &entry.event, &entry.prev_hash)?;
            if entry.hash != expected {
                return Err(JournalError::IntegrityViolation { index: entry.index });
            }
            prev.clone_from(&entry.hash);
        }
        Ok(())
    }

    #[cfg(test)]
    fn tamper(&self, position: usize, f: impl FnOnce(&mut JournalEntry)) {
        f(&mut self.inner.lock().entries[position]);
    }
}

#[async_trait::async_trait]
impl HealthObserver for EventJournal {
    fn name(&self) -> &str {
        "event-journal"
    }

    async fn on_event(&self, event: &HealthEvent) -> Result<(), ObserverError> {
        self.append(event.clone())
            .map(|_| ())
            .map_err(|e| ObserverError::new(e.to_string()))
    }
}

fn genesis() -> String {
    hex::encode([0u8; 32])
}

fn compute_hash(index: u64, event: &HealthEvent, prev_hash: &str) -> Result<String, JournalError> {
    let encoded = serde_json::to_vec(event)?;
    let mut hasher = Sha256::new();
    hasher.update(index.to_le_bytes());
    hasher.update(&encoded);
    hasher.update([0]);
    hasher.update(prev_hash.as_bytes());
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EscalationReason, HealthEventKind, HealthStatus};
    use crate::ids::StageId;
    use pretty_assertions::assert_eq;

    fn event(to: HealthStatus) -> HealthEvent {
        HealthEvent::new(
            StageId::new("render"),
            HealthEventKind::HealthTransition { from: None, to },
        )
    }

    #[test]
    fn chain_verifies_after_appends() {
        let journal = EventJournal::new();
        journal.append(event(HealthStatus::Healthy)).unwrap();
        journal.append(event(HealthStatus::Stalled)).unwrap();
        journal
            .append(HealthEvent::new(
                StageId::new("render"),
                HealthEventKind::RecoveryEscalated {
                    reason: EscalationReason::RecoveryBudgetExhausted { budget: 3 },
                },
            ))
            .unwrap();

        assert_eq!(journal.len(), 3);
        assert!(journal.verify_integrity().is_ok());
    }

    #[test]
    fn edited_event_is_detected() {
        let journal = EventJournal::new();
        journal.append(event(HealthStatus::Healthy)).unwrap();
        journal.append(event(HealthStatus::Hung)).unwrap();

        journal.tamper(1, |entry| {
            entry.event.kind = HealthEventKind::HealthTransition {
                from: None,
                to: HealthStatus::Healthy,
            };
        });

        assert!(matches!(
            journal.verify_integrity(),
            Err(JournalError::IntegrityViolation { index: 1 })
        ));
    }

    #[test]
    fn bounded_journal_keeps_recent_entries_and_still_verifies() {
        let journal = EventJournal::bounded(2);
        for status in [
            HealthStatus::Healthy,
            HealthStatus::Stalled,
            HealthStatus::Hung,
            HealthStatus::Crashed,
        ] {
            journal.append(event(status)).unwrap();
        }

        let entries = journal.entries();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].index, 2);
        assert!(journal.verify_integrity().is_ok());
    }
}
