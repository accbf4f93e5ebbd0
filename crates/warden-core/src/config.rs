//! Supervisor configuration
//!
//! Everything tunable lives here:
//! - Polling interval and history bounds
//! - Per-stage [`StagePolicy`] (timeouts, retry budget, breaker, backoff)
//! - Auto-fix settings
//!
//! Durations are written in human-readable form (`"5s"`, `"10m"`) when loaded
//! from TOML.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use warden_events::StageId;

/// Top-level supervisor configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// How often each watch loop re-evaluates its stage
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,

    /// Policy applied to stages without an override
    pub default_policy: StagePolicy,

    /// Per-stage overrides keyed by stage id
    pub stages: HashMap<String, StagePolicy>,

    /// Auto-fix settings
    pub autofix: AutoFixConfig,

    /// Recovery attempts retained per stage
    pub history_limit: usize,

    /// Per-subscriber event queue length
    pub event_buffer: usize,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            default_policy: StagePolicy::default(),
            stages: HashMap::new(),
            autofix: AutoFixConfig::default(),
            history_limit: 32,
            event_buffer: warden_events::DEFAULT_SUBSCRIBER_CAPACITY,
        }
    }
}

impl SupervisorConfig {
    /// Parse from a TOML document and validate
    ///
    /// # Errors
    /// - `ConfigError::Parse` on malformed TOML
    /// - `ConfigError::Invalid` when a value is out of range
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a TOML file and validate
    ///
    /// # Errors
    /// - `ConfigError::Io` if the file cannot be read
    /// - Any error from [`SupervisorConfig::from_toml_str`]
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// Check every value is usable
    ///
    /// # Errors
    /// - `ConfigError::Invalid` naming the first offending field
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.poll_interval.is_zero() {
            return Err(ConfigError::invalid("poll_interval", "must be positive"));
        }
        if self.history_limit == 0 {
            return Err(ConfigError::invalid("history_limit", "must be at least 1"));
        }
        if self.event_buffer == 0 {
            return Err(ConfigError::invalid("event_buffer", "must be at least 1"));
        }
        if self.autofix.diagnosis_timeout.is_zero() {
            return Err(ConfigError::invalid(
                "autofix.diagnosis_timeout",
                "must be positive",
            ));
        }
        self.default_policy.validate("default_policy")?;
        for (stage, policy) in &self.stages {
            policy.validate(&format!("stages.{stage}"))?;
        }
        Ok(())
    }

    /// Policy for a stage, falling back to the default
    #[must_use]
    pub fn policy_for(&self, stage_id: &StageId) -> &StagePolicy {
        self.stages
            .get(stage_id.as_str())
            .unwrap_or(&self.default_policy)
    }

    /// Set the polling interval
    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set the default policy
    #[must_use]
    pub fn with_default_policy(mut self, policy: StagePolicy) -> Self {
        self.default_policy = policy;
        self
    }

    /// Override the policy of one stage
    #[must_use]
    pub fn with_stage_policy(mut self, stage_id: impl Into<String>, policy: StagePolicy) -> Self {
        self.stages.insert(stage_id.into(), policy);
        self
    }

    /// Set the auto-fix settings
    #[must_use]
    pub fn with_autofix(mut self, autofix: AutoFixConfig) -> Self {
        self.autofix = autofix;
        self
    }

    /// Set the per-stage history bound
    #[must_use]
    pub fn with_history_limit(mut self, limit: usize) -> Self {
        self.history_limit = limit;
        self
    }
}

/// Supervision policy of one stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StagePolicy {
    /// No progress for this long classifies the stage as hung
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,

    /// Executed recovery attempts allowed per supervised run
    pub retry_budget: u32,

    /// Wait after the graceful stop signal before forcing
    #[serde(with = "humantime_serde")]
    pub graceful_timeout: Duration,

    /// Wait after the forced stop signal
    #[serde(with = "humantime_serde")]
    pub force_timeout: Duration,

    /// Circuit breaker settings
    pub breaker: BreakerConfig,

    /// Timeout growth recommended after a hang
    pub hang_timeout: TimeoutGrowth,

    /// Delay between repeated in-place retries of a stalled stage
    pub retry_backoff: RetryBackoff,

    /// Whether a restarted hung stage runs with the recommended timeout
    pub adopt_recommended_timeout: bool,
}

impl Default for StagePolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(300),
            retry_budget: 3,
            graceful_timeout: Duration::from_secs(10),
            force_timeout: Duration::from_secs(5),
            breaker: BreakerConfig::default(),
            hang_timeout: TimeoutGrowth::default(),
            retry_backoff: RetryBackoff::default(),
            adopt_recommended_timeout: true,
        }
    }
}

impl StagePolicy {
    /// Set the hang timeout
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the retry budget
    #[must_use]
    pub fn with_retry_budget(mut self, budget: u32) -> Self {
        self.retry_budget = budget;
        self
    }

    /// Set the graceful stop wait
    #[must_use]
    pub fn with_graceful_timeout(mut self, timeout: Duration) -> Self {
        self.graceful_timeout = timeout;
        self
    }

    /// Set the breaker settings
    #[must_use]
    pub fn with_breaker(mut self, breaker: BreakerConfig) -> Self {
        self.breaker = breaker;
        self
    }

    /// Set the retry backoff
    #[must_use]
    pub fn with_retry_backoff(mut self, backoff: RetryBackoff) -> Self {
        self.retry_backoff = backoff;
        self
    }

    fn validate(&self, prefix: &str) -> Result<(), ConfigError> {
        if self.timeout.is_zero() {
            return Err(ConfigError::invalid(
                format!("{prefix}.timeout"),
                "must be positive",
            ));
        }
        if self.breaker.failure_threshold == 0 {
            return Err(ConfigError::invalid(
                format!("{prefix}.breaker.failure_threshold"),
                "must be at least 1",
            ));
        }
        if self.breaker.cooldown_multiplier < 1.0 || !self.breaker.cooldown_multiplier.is_finite() {
            return Err(ConfigError::invalid(
                format!("{prefix}.breaker.cooldown_multiplier"),
                "must be a finite value >= 1.0",
            ));
        }
        if self.breaker.max_cooldown < self.breaker.cooldown {
            return Err(ConfigError::invalid(
                format!("{prefix}.breaker.max_cooldown"),
                "must not be shorter than cooldown",
            ));
        }
        if self.hang_timeout.multiplier < 1.0 || !self.hang_timeout.multiplier.is_finite() {
            return Err(ConfigError::invalid(
                format!("{prefix}.hang_timeout.multiplier"),
                "must be a finite value >= 1.0",
            ));
        }
        if let RetryBackoff::Exponential { multiplier, .. } = self.retry_backoff {
            if multiplier < 1.0 || !multiplier.is_finite() {
                return Err(ConfigError::invalid(
                    format!("{prefix}.retry_backoff.multiplier"),
                    "must be a finite value >= 1.0",
                ));
            }
        }
        Ok(())
    }
}

/// Circuit breaker settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Consecutive failures that open the breaker
    pub failure_threshold: u32,

    /// Initial open period
    #[serde(with = "humantime_serde")]
    pub cooldown: Duration,

    /// Growth of the open period after each failed trial
    pub cooldown_multiplier: f64,

    /// Upper bound of the open period
    #[serde(with = "humantime_serde")]
    pub max_cooldown: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            cooldown: Duration::from_secs(60),
            cooldown_multiplier: 2.0,
            max_cooldown: Duration::from_secs(600),
        }
    }
}

impl BreakerConfig {
    /// Set the failure threshold
    #[must_use]
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    /// Set the base cooldown
    #[must_use]
    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }

    /// Set cooldown growth and its cap
    #[must_use]
    pub fn with_cooldown_growth(mut self, multiplier: f64, max_cooldown: Duration) -> Self {
        self.cooldown_multiplier = multiplier;
        self.max_cooldown = max_cooldown;
        self
    }

    /// Cooldown following a failed trial that ran under `current`
    #[must_use]
    pub fn next_cooldown(&self, current: Duration) -> Duration {
        grow(current, self.cooldown_multiplier, self.max_cooldown)
    }
}

/// Multiplier and cap applied to a hung stage's timeout
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutGrowth {
    /// Factor applied to the current timeout
    pub multiplier: f64,

    /// Largest timeout ever recommended
    #[serde(with = "humantime_serde")]
    pub cap: Duration,
}

impl Default for TimeoutGrowth {
    fn default() -> Self {
        Self {
            multiplier: 2.0,
            cap: Duration::from_secs(3600),
        }
    }
}

impl TimeoutGrowth {
    /// Recommended timeout after a hang under `current`
    ///
    /// Never shorter than `current`, even when the cap is.
    #[must_use]
    pub fn recommend(&self, current: Duration) -> Duration {
        grow(current, self.multiplier, self.cap)
    }
}

/// Delay between repeated in-place retries
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RetryBackoff {
    /// Same delay every time
    Fixed {
        /// Delay
        #[serde(with = "humantime_serde")]
        delay: Duration,
    },

    /// Delay grows geometrically up to a maximum
    Exponential {
        /// Delay before the second retry
        #[serde(with = "humantime_serde")]
        initial_delay: Duration,

        /// Largest delay
        #[serde(with = "humantime_serde")]
        max_delay: Duration,

        /// Growth per retry
        multiplier: f64,
    },
}

impl Default for RetryBackoff {
    fn default() -> Self {
        Self::Exponential {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
        }
    }
}

impl RetryBackoff {
    /// Delay before retry number `attempt` (1-based)
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        match self {
            Self::Fixed { delay } => *delay,
            Self::Exponential {
                initial_delay,
                max_delay,
                multiplier,
            } => {
                let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
                let secs = initial_delay.as_secs_f64() * multiplier.powi(exponent);
                if secs < max_delay.as_secs_f64() {
                    Duration::try_from_secs_f64(secs).unwrap_or(*max_delay)
                } else {
                    *max_delay
                }
            }
        }
    }
}

/// Auto-fix settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoFixConfig {
    /// Whether crashed stages are patched before restart
    pub enabled: bool,

    /// Bound on a single diagnosis call
    #[serde(with = "humantime_serde")]
    pub diagnosis_timeout: Duration,

    /// Lines shown on each side of the faulting line
    pub context_radius: u32,
}

impl Default for AutoFixConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            diagnosis_timeout: Duration::from_secs(30),
            context_radius: 5,
        }
    }
}

impl AutoFixConfig {
    /// Disabled auto-fix; crashed stages are restarted unpatched
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }
}

// Multipliers are only range-checked by `validate`, so negative and NaN
// products land on the cap
fn grow(current: Duration, multiplier: f64, cap: Duration) -> Duration {
    let secs = current.as_secs_f64() * multiplier;
    let grown = if secs < cap.as_secs_f64() {
        Duration::try_from_secs_f64(secs).unwrap_or(cap)
    } else {
        cap
    };
    grown.max(current)
}
