//! Logging and metrics
//!
//! - [`init_tracing`] installs a `tracing-subscriber` registry, filtered by
//!   `RUST_LOG` (default `info,warden_core=debug`)
//! - [`MetricsObserver`] turns bus events into `metrics` counters

use async_trait::async_trait;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use warden_events::{HealthEvent, HealthEventKind, HealthObserver, ObserverError};

/// Default filter when `RUST_LOG` is unset
pub const DEFAULT_FILTER: &str = "info,warden_core=debug";

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Human-readable single line
    #[default]
    Compact,
    /// One JSON object per line
    Json,
}

/// Install the global tracing subscriber
///
/// Returns `false` when a subscriber was already installed.
pub fn init_tracing(format: LogFormat) -> bool {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let registry = tracing_subscriber::registry().with(filter);

    let installed = match format {
        LogFormat::Compact => registry
            .with(fmt::layer().with_target(true).compact())
            .try_init()
            .is_ok(),
        LogFormat::Json => registry
            .with(fmt::layer().json().with_current_span(false))
            .try_init()
            .is_ok(),
    };
    if installed {
        tracing::debug!(?format, "tracing initialized");
    }
    installed
}

/// Counts health events with the `metrics` facade
///
/// Counters:
/// - `warden_health_transitions_total{stage, to}`
/// - `warden_breaker_transitions_total{stage, to}`
/// - `warden_recovery_attempts_total{stage, action, success}`
/// - `warden_escalations_total{stage}`
/// - `warden_patches_applied_total{stage}`
#[derive(Debug, Default, Clone, Copy)]
pub struct MetricsObserver;

#[async_trait]
impl HealthObserver for MetricsObserver {
    fn name(&self) -> &str {
        "metrics"
    }

    async fn on_event(&self, event: &HealthEvent) -> Result<(), ObserverError> {
        let stage = event.stage_id.to_string();
        match &event.kind {
            HealthEventKind::HealthTransition { to, .. } => {
                metrics::counter!("warden_health_transitions_total", "stage" => stage, "to" => to.to_string())
                    .increment(1);
            }
            HealthEventKind::BreakerTransition { to, .. } => {
                metrics::counter!("warden_breaker_transitions_total", "stage" => stage, "to" => to.to_string())
                    .increment(1);
            }
            HealthEventKind::RecoveryAttempted { action, success, .. } => {
                metrics::counter!(
                    "warden_recovery_attempts_total",
                    "stage" => stage,
                    "action" => action.to_string(),
                    "success" => success.to_string()
                )
                .increment(1);
            }
            HealthEventKind::RecoveryEscalated { .. } => {
                metrics::counter!("warden_escalations_total", "stage" => stage).increment(1);
            }
            HealthEventKind::PatchApplied { .. } => {
                metrics::counter!("warden_patches_applied_total", "stage" => stage).increment(1);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use warden_events::{HealthStatus, StageId};

    #[tokio::test]
    async fn metrics_observer_accepts_every_event() {
        let observer = MetricsObserver;
        let event = HealthEvent::new(
            StageId::new("s"),
            HealthEventKind::HealthTransition {
                from: None,
                to: HealthStatus::Hung,
            },
        );
        assert!(observer.on_event(&event).await.is_ok());
    }

    #[test]
    fn second_init_reports_already_installed() {
        init_tracing(LogFormat::Compact);
        assert!(!init_tracing(LogFormat::Json));
    }
}
