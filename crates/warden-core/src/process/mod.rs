//! Process control
//!
//! [`ProcessController`] stops and restarts stage executions through a
//! [`StageDriver`]. Termination is always graceful first: signal, wait up to
//! the graceful timeout, then force and wait a bounded force timeout. A
//! cancelled token cuts the graceful wait short.

mod task_driver;

pub use task_driver::{StageContext, TaskDriver};

use crate::error::{MonitorError, ProcessError};
use crate::types::{ExitSignal, StageHandle};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Default wait after the forced stop signal
pub const DEFAULT_FORCE_TIMEOUT: Duration = Duration::from_secs(5);

/// Receives liveness signals from running executions
pub trait LivenessSink: Send + Sync {
    /// Record forward progress
    ///
    /// # Errors
    /// - `MonitorError` when the handle is unknown or superseded
    fn heartbeat(&self, handle: &StageHandle) -> Result<(), MonitorError>;

    /// Record termination
    ///
    /// # Errors
    /// - `MonitorError` when the handle is unknown or superseded
    fn report_exit(&self, handle: &StageHandle, signal: ExitSignal) -> Result<(), MonitorError>;
}

/// Port to whatever actually runs stages
#[async_trait]
pub trait StageDriver: Send + Sync {
    /// Give the driver a sink for heartbeats and exits
    fn attach(&self, _liveness: Arc<dyn LivenessSink>) {}

    /// Start an execution
    async fn launch(&self, handle: &StageHandle) -> Result<(), ProcessError>;

    /// Ask the execution to stop
    async fn signal_graceful(&self, handle: &StageHandle) -> Result<(), ProcessError>;

    /// Stop the execution unconditionally
    async fn signal_force(&self, handle: &StageHandle) -> Result<(), ProcessError>;

    /// Wait up to `timeout` for the execution to stop; `true` once stopped
    async fn wait_stopped(&self, handle: &StageHandle, timeout: Duration) -> bool;

    /// Whether the execution is still running
    fn is_alive(&self, handle: &StageHandle) -> bool;

    /// Prod a stalled execution without stopping it
    async fn nudge(&self, _handle: &StageHandle) -> Result<(), ProcessError> {
        Ok(())
    }
}

/// Terminates, restarts and nudges stage executions
#[derive(Clone)]
pub struct ProcessController {
    driver: Arc<dyn StageDriver>,
    force_timeout: Duration,
}

impl std::fmt::Debug for ProcessController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessController")
            .field("force_timeout", &self.force_timeout)
            .finish_non_exhaustive()
    }
}

impl ProcessController {
    /// Create a controller over a driver
    pub fn new(driver: Arc<dyn StageDriver>) -> Self {
        Self {
            driver,
            force_timeout: DEFAULT_FORCE_TIMEOUT,
        }
    }

    /// Set the default force timeout
    #[must_use]
    pub fn with_force_timeout(mut self, timeout: Duration) -> Self {
        self.force_timeout = timeout;
        self
    }

    /// The underlying driver
    #[must_use]
    pub fn driver(&self) -> &Arc<dyn StageDriver> {
        &self.driver
    }

    /// Stop an execution, graceful first
    ///
    /// Returns `true` when the execution is confirmed stopped.
    pub async fn terminate(&self, handle: &StageHandle, graceful_timeout: Duration) -> bool {
        self.terminate_with(
            handle,
            graceful_timeout,
            self.force_timeout,
            &CancellationToken::new(),
        )
        .await
    }

    /// Stop an execution, graceful first, honouring cancellation
    ///
    /// # Arguments
    /// * `handle` - Execution to stop
    /// * `graceful_timeout` - Wait after the graceful signal
    /// * `force_timeout` - Wait after the forced signal
    /// * `cancel` - When cancelled, the graceful wait ends and force follows
    pub async fn terminate_with(
        &self,
        handle: &StageHandle,
        graceful_timeout: Duration,
        force_timeout: Duration,
        cancel: &CancellationToken,
    ) -> bool {
        tracing::info!(
            stage = %handle.stage_id,
            handle = %handle.handle_id,
            "sending graceful stop"
        );

        let graceful_sent = match self.driver.signal_graceful(handle).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(stage = %handle.stage_id, error = %e, "graceful stop failed");
                false
            }
        };

        if graceful_sent {
            let stopped = tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    tracing::info!(stage = %handle.stage_id, "cancelled, upgrading to forced stop");
                    false
                }
                stopped = self.driver.wait_stopped(handle, graceful_timeout) => stopped,
            };
            if stopped {
                tracing::info!(stage = %handle.stage_id, "stopped gracefully");
                return true;
            }
        }

        tracing::warn!(
            stage = %handle.stage_id,
            handle = %handle.handle_id,
            "forcing stop"
        );
        if let Err(e) = self.driver.signal_force(handle).await {
            tracing::error!(stage = %handle.stage_id, error = %e, "forced stop failed");
            return false;
        }
        let stopped = self.driver.wait_stopped(handle, force_timeout).await;
        if !stopped {
            tracing::error!(stage = %handle.stage_id, "still running after forced stop");
        }
        stopped
    }

    /// Launch a fresh execution replacing `handle`
    ///
    /// # Errors
    /// - `ProcessError::LaunchFailed` / `UnknownStage` from the driver
    pub async fn restart(
        &self,
        handle: &StageHandle,
        timeout: Duration,
    ) -> Result<StageHandle, ProcessError> {
        self.restart_with(handle, timeout, |_| Ok(())).await
    }

    /// [`Self::restart`] running `before_launch` on the fresh handle first
    ///
    /// Lets the caller make the successor current before it can signal, so an
    /// immediate exit is never reported against a stale handle.
    ///
    /// # Errors
    /// - Whatever `before_launch` returns, with nothing launched
    /// - `ProcessError::LaunchFailed` / `UnknownStage` from the driver
    pub async fn restart_with<F>(
        &self,
        handle: &StageHandle,
        timeout: Duration,
        before_launch: F,
    ) -> Result<StageHandle, ProcessError>
    where
        F: FnOnce(&StageHandle) -> Result<(), ProcessError> + Send,
    {
        let next = handle.successor(timeout);
        before_launch(&next)?;
        self.driver.launch(&next).await?;
        tracing::info!(
            stage = %next.stage_id,
            handle = %next.handle_id,
            attempt = next.attempt,
            timeout = ?timeout,
            "stage restarted"
        );
        Ok(next)
    }

    /// Launch the first execution of a stage
    ///
    /// # Errors
    /// - Any driver launch error
    pub async fn launch(&self, handle: &StageHandle) -> Result<(), ProcessError> {
        self.driver.launch(handle).await
    }

    /// Prod a stalled execution
    ///
    /// # Errors
    /// - `ProcessError::SignalFailed` from the driver
    pub async fn nudge(&self, handle: &StageHandle) -> Result<(), ProcessError> {
        tracing::debug!(stage = %handle.stage_id, "nudging stalled stage");
        self.driver.nudge(handle).await
    }

    /// Whether an execution is running
    #[must_use]
    pub fn is_alive(&self, handle: &StageHandle) -> bool {
        self.driver.is_alive(handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};
    use warden_events::HandleId;

    #[derive(Default)]
    struct Scripted {
        calls: Mutex<Vec<&'static str>>,
        stops_on_graceful: bool,
        stopped: AtomicBool,
        launched: Mutex<Vec<HandleId>>,
    }

    #[async_trait]
    impl StageDriver for Scripted {
        async fn launch(&self, handle: &StageHandle) -> Result<(), ProcessError> {
            self.launched.lock().push(handle.handle_id);
            Ok(())
        }

        async fn signal_graceful(&self, _handle: &StageHandle) -> Result<(), ProcessError> {
            self.calls.lock().push("graceful");
            if self.stops_on_graceful {
                self.stopped.store(true, Ordering::SeqCst);
            }
            Ok(())
        }

        async fn signal_force(&self, _handle: &StageHandle) -> Result<(), ProcessError> {
            self.calls.lock().push("force");
            self.stopped.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn wait_stopped(&self, _handle: &StageHandle, timeout: Duration) -> bool {
            if !self.stopped.load(Ordering::SeqCst) {
                tokio::time::sleep(timeout).await;
            }
            self.stopped.load(Ordering::SeqCst)
        }

        fn is_alive(&self, _handle: &StageHandle) -> bool {
            !self.stopped.load(Ordering::SeqCst)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn cooperative_stage_is_not_forced() {
        let driver = Arc::new(Scripted {
            stops_on_graceful: true,
            ..Scripted::default()
        });
        let controller = ProcessController::new(driver.clone());
        let handle = StageHandle::new("load", Duration::from_secs(300));

        assert!(controller.terminate(&handle, Duration::from_secs(10)).await);
        assert_eq!(*driver.calls.lock(), vec!["graceful"]);
    }

    #[tokio::test(start_paused = true)]
    async fn unresponsive_stage_is_forced_after_graceful_timeout() {
        let driver = Arc::new(Scripted::default());
        let controller = ProcessController::new(driver.clone());
        let handle = StageHandle::new("load", Duration::from_secs(300));
        let started = tokio::time::Instant::now();

        assert!(controller.terminate(&handle, Duration::from_secs(10)).await);
        assert_eq!(*driver.calls.lock(), vec!["graceful", "force"]);
        assert_eq!(started.elapsed(), Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_skips_graceful_wait() {
        let driver = Arc::new(Scripted::default());
        let controller = ProcessController::new(driver.clone());
        let handle = StageHandle::new("load", Duration::from_secs(300));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let started = tokio::time::Instant::now();

        assert!(
            controller
                .terminate_with(&handle, Duration::from_secs(10), Duration::from_secs(5), &cancel)
                .await
        );
        assert_eq!(*driver.calls.lock(), vec!["graceful", "force"]);
        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn restart_launches_fresh_handle() {
        let driver = Arc::new(Scripted::default());
        let controller = ProcessController::new(driver.clone());
        let handle = StageHandle::new("load", Duration::from_secs(300));

        let next = controller
            .restart(&handle, Duration::from_secs(600))
            .await
            .unwrap();
        assert_eq!(next.attempt, 2);
        assert_eq!(next.timeout, Duration::from_secs(600));
        assert_eq!(*driver.launched.lock(), vec![next.handle_id]);
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_successor_is_never_launched() {
        let driver = Arc::new(Scripted::default());
        let controller = ProcessController::new(driver.clone());
        let handle = StageHandle::new("load", Duration::from_secs(300));

        let result = controller
            .restart_with(&handle, Duration::from_secs(300), |next| {
                Err(ProcessError::UnknownStage(next.stage_id.clone()))
            })
            .await;
        assert!(matches!(result, Err(ProcessError::UnknownStage(_))));
        assert!(driver.launched.lock().is_empty());
    }
}
