//! Circuit breaker registry
//!
//! One breaker per stage id, created on first use and never deleted. State
//! changes are driven only by recovery outcomes, plus the Open to HalfOpen
//! move that [`CircuitBreakerRegistry::allow`] makes once the cooldown has
//! elapsed.
//!
//! Every breaker sits behind its own lock and transition events are published
//! while it is held, so observers see each stage's transitions in order.

use crate::config::BreakerConfig;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use warden_events::{BreakerState, HealthEvent, HealthEventBus, HealthEventKind, StageId};

/// Point-in-time view of one breaker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakerSnapshot {
    /// Current state
    pub state: BreakerState,
    /// Consecutive failures recorded
    pub consecutive_failures: u32,
    /// Wall-clock time of the last failure
    pub last_failure_at: Option<DateTime<Utc>>,
    /// Open period that applies to the next opening
    #[serde(with = "humantime_serde")]
    pub current_cooldown: Duration,
    /// Time left before an open breaker admits a trial
    #[serde(with = "humantime_serde")]
    pub cooldown_remaining: Option<Duration>,
}

#[derive(Debug)]
struct Breaker {
    config: BreakerConfig,
    state: BreakerState,
    consecutive_failures: u32,
    last_failure_at: Option<DateTime<Utc>>,
    open_until: Option<Instant>,
    current_cooldown: Duration,
    trial_in_flight: bool,
}

impl Breaker {
    fn new(config: BreakerConfig) -> Self {
        Self {
            current_cooldown: config.cooldown,
            config,
            state: BreakerState::Closed,
            consecutive_failures: 0,
            last_failure_at: None,
            open_until: None,
            trial_in_flight: false,
        }
    }

    fn open(&mut self, now: Instant) {
        self.state = BreakerState::Open;
        self.open_until = Some(now + self.current_cooldown);
        self.trial_in_flight = false;
    }

    fn snapshot(&self) -> BreakerSnapshot {
        let now = Instant::now();
        BreakerSnapshot {
            state: self.state,
            consecutive_failures: self.consecutive_failures,
            last_failure_at: self.last_failure_at,
            current_cooldown: self.current_cooldown,
            cooldown_remaining: match (self.state, self.open_until) {
                (BreakerState::Open, Some(until)) => Some(until.saturating_duration_since(now)),
                _ => None,
            },
        }
    }
}

/// Per-stage circuit breakers
pub struct CircuitBreakerRegistry {
    breakers: DashMap<StageId, Arc<Mutex<Breaker>>>,
    default_config: BreakerConfig,
    bus: Arc<HealthEventBus>,
}

impl std::fmt::Debug for CircuitBreakerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreakerRegistry")
            .field("breakers", &self.breakers.len())
            .finish_non_exhaustive()
    }
}

impl CircuitBreakerRegistry {
    /// Create a registry publishing transitions on `bus`
    ///
    /// # Arguments
    /// * `default_config` - Settings for breakers created lazily by [`Self::allow`]
    /// * `bus` - Event bus for breaker transitions
    #[must_use]
    pub fn new(default_config: BreakerConfig, bus: Arc<HealthEventBus>) -> Self {
        Self {
            breakers: DashMap::new(),
            default_config,
            bus,
        }
    }

    /// Ensure a breaker exists for a stage
    ///
    /// An existing breaker keeps its state; only its settings are replaced.
    pub fn register(&self, stage_id: &StageId, config: BreakerConfig) {
        let cell = self
            .breakers
            .entry(stage_id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(Breaker::new(config.clone()))))
            .clone();
        cell.lock().config = config;
    }

    /// Whether an attempt of the stage may run now
    ///
    /// Moves an open breaker whose cooldown has elapsed to HalfOpen and grants
    /// it the single trial. Further calls return `false` until that trial's
    /// outcome is recorded.
    pub fn allow(&self, stage_id: &StageId) -> bool {
        let cell = self.cell(stage_id);
        let mut breaker = cell.lock();
        match breaker.state {
            BreakerState::Closed => true,
            BreakerState::HalfOpen => {
                if breaker.trial_in_flight {
                    false
                } else {
                    breaker.trial_in_flight = true;
                    true
                }
            }
            BreakerState::Open => {
                let now = Instant::now();
                if breaker.open_until.is_some_and(|until| now < until) {
                    return false;
                }
                breaker.state = BreakerState::HalfOpen;
                breaker.open_until = None;
                breaker.trial_in_flight = true;
                tracing::info!(stage = %stage_id, "circuit breaker half-open, admitting trial");
                self.publish(stage_id, BreakerState::Open, &breaker);
                true
            }
        }
    }

    /// Record the outcome of an executed attempt
    pub fn record_outcome(&self, stage_id: &StageId, success: bool) {
        let cell = self.cell(stage_id);
        let mut breaker = cell.lock();
        let from = breaker.state;
        let now = Instant::now();

        if success {
            match from {
                BreakerState::Closed => breaker.consecutive_failures = 0,
                BreakerState::HalfOpen => {
                    breaker.state = BreakerState::Closed;
                    breaker.consecutive_failures = 0;
                    breaker.current_cooldown = breaker.config.cooldown;
                    breaker.trial_in_flight = false;
                    tracing::info!(stage = %stage_id, "circuit breaker closed after successful trial");
                    self.publish(stage_id, from, &breaker);
                }
                BreakerState::Open => {
                    tracing::debug!(stage = %stage_id, "success recorded while open, ignored");
                }
            }
            return;
        }

        breaker.consecutive_failures = breaker.consecutive_failures.saturating_add(1);
        breaker.last_failure_at = Some(Utc::now());
        match from {
            BreakerState::Closed => {
                if breaker.consecutive_failures >= breaker.config.failure_threshold {
                    breaker.open(now);
                    tracing::warn!(
                        stage = %stage_id,
                        failures = breaker.consecutive_failures,
                        "circuit breaker opened after {} consecutive failures",
                        breaker.consecutive_failures,
                    );
                    self.publish(stage_id, from, &breaker);
                }
            }
            BreakerState::HalfOpen => {
                breaker.current_cooldown = breaker.config.next_cooldown(breaker.current_cooldown);
                breaker.open(now);
                tracing::warn!(
                    stage = %stage_id,
                    cooldown = ?breaker.current_cooldown,
                    "trial failed, circuit breaker reopened"
                );
                self.publish(stage_id, from, &breaker);
            }
            BreakerState::Open => {}
        }
    }

    /// Current state, if the breaker exists
    #[must_use]
    pub fn state(&self, stage_id: &StageId) -> Option<BreakerState> {
        self.get(stage_id).map(|cell| cell.lock().state)
    }

    /// View of one breaker
    #[must_use]
    pub fn snapshot(&self, stage_id: &StageId) -> Option<BreakerSnapshot> {
        self.get(stage_id).map(|cell| cell.lock().snapshot())
    }

    /// Views of every breaker
    #[must_use]
    pub fn snapshots(&self) -> Vec<(StageId, BreakerSnapshot)> {
        let cells: Vec<(StageId, Arc<Mutex<Breaker>>)> = self
            .breakers
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        cells
            .into_iter()
            .map(|(id, cell)| {
                let snapshot = cell.lock().snapshot();
                (id, snapshot)
            })
            .collect()
    }

    fn get(&self, stage_id: &StageId) -> Option<Arc<Mutex<Breaker>>> {
        self.breakers.get(stage_id).map(|entry| entry.value().clone())
    }

    fn cell(&self, stage_id: &StageId) -> Arc<Mutex<Breaker>> {
        self.breakers
            .entry(stage_id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(Breaker::new(self.default_config.clone()))))
            .clone()
    }

    fn publish(&self, stage_id: &StageId, from: BreakerState, breaker: &Breaker) {
        self.bus.publish(HealthEvent::new(
            stage_id.clone(),
            HealthEventKind::BreakerTransition {
                from,
                to: breaker.state,
                consecutive_failures: breaker.consecutive_failures,
            },
        ));
    }
}
