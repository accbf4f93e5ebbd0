//! Stage driver running stages as tokio tasks
//!
//! Stages are registered as async closures taking a [`StageContext`].
//! Graceful stop cancels the context's token; forced stop aborts the task.
//! Completion, returned errors and panics are reported to the attached
//! [`LivenessSink`]. An execution is tracked only while its task runs.

use super::{LivenessSink, StageDriver};
use crate::error::ProcessError;
use crate::types::{CrashReport, ErrorKind, ExitSignal, StageHandle};
use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::RwLock;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;
use warden_events::{HandleId, StageId};

type StageFn = Arc<dyn Fn(StageContext) -> BoxFuture<'static, Result<(), CrashReport>> + Send + Sync>;

/// What a running stage sees of its supervisor
#[derive(Clone)]
pub struct StageContext {
    handle: StageHandle,
    cancel: CancellationToken,
    nudge: Arc<Notify>,
    liveness: Option<Arc<dyn LivenessSink>>,
}

impl std::fmt::Debug for StageContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageContext")
            .field("handle", &self.handle)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl StageContext {
    /// Handle of this execution
    #[inline]
    #[must_use]
    pub fn handle(&self) -> &StageHandle {
        &self.handle
    }

    /// Report forward progress
    pub fn heartbeat(&self) {
        if let Some(liveness) = &self.liveness {
            if let Err(e) = liveness.heartbeat(&self.handle) {
                tracing::debug!(stage = %self.handle.stage_id, error = %e, "heartbeat rejected");
            }
        }
    }

    /// Whether a graceful stop was requested
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves when a graceful stop is requested
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await;
    }

    /// Resolves when the supervisor nudges this execution
    pub async fn nudged(&self) {
        self.nudge.notified().await;
    }
}

struct Running {
    cancel: CancellationToken,
    nudge: Arc<Notify>,
    abort: AbortHandle,
    done: watch::Receiver<bool>,
}

/// Runs registered stages as tokio tasks
#[derive(Default)]
pub struct TaskDriver {
    stages: DashMap<StageId, StageFn>,
    running: Arc<DashMap<HandleId, Running>>,
    liveness: RwLock<Option<Arc<dyn LivenessSink>>>,
}

impl std::fmt::Debug for TaskDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskDriver")
            .field("stages", &self.stages.len())
            .field("running", &self.running.len())
            .finish_non_exhaustive()
    }
}

impl TaskDriver {
    /// Driver with no stages
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Define how a stage runs
    ///
    /// Every launch of `stage_id` calls `body` with a fresh context.
    pub fn register_stage<F, Fut>(&self, stage_id: impl Into<StageId>, body: F)
    where
        F: Fn(StageContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), CrashReport>> + Send + 'static,
    {
        let body: StageFn = Arc::new(move |ctx| body(ctx).boxed());
        self.stages.insert(stage_id.into(), body);
    }

    /// Builder-style [`Self::register_stage`]
    #[must_use]
    pub fn with_stage<F, Fut>(self, stage_id: impl Into<StageId>, body: F) -> Self
    where
        F: Fn(StageContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), CrashReport>> + Send + 'static,
    {
        self.register_stage(stage_id, body);
        self
    }

    /// Executions currently tracked
    #[must_use]
    pub fn running_count(&self) -> usize {
        self.running.len()
    }

    fn done_receiver(&self, handle: &StageHandle) -> Option<watch::Receiver<bool>> {
        self.running.get(&handle.handle_id).map(|r| r.done.clone())
    }
}

#[async_trait]
impl StageDriver for TaskDriver {
    fn attach(&self, liveness: Arc<dyn LivenessSink>) {
        *self.liveness.write() = Some(liveness);
    }

    async fn launch(&self, handle: &StageHandle) -> Result<(), ProcessError> {
        let body = self
            .stages
            .get(&handle.stage_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| ProcessError::UnknownStage(handle.stage_id.clone()))?;

        let liveness = self.liveness.read().clone();
        let cancel = CancellationToken::new();
        let nudge = Arc::new(Notify::new());
        let (done_tx, done_rx) = watch::channel(false);
        let ctx = StageContext {
            handle: handle.clone(),
            cancel: cancel.clone(),
            nudge: nudge.clone(),
            liveness: liveness.clone(),
        };

        let task_handle = handle.clone();
        let task_cancel = cancel.clone();
        let tracked = self.running.clone();
        let task = tokio::spawn(async move {
            let outcome = AssertUnwindSafe(body(ctx)).catch_unwind().await;
            let signal = match outcome {
                Ok(Ok(())) => ExitSignal::Completed,
                Ok(Err(report)) => ExitSignal::Failed(report),
                Err(panic) => ExitSignal::Failed(CrashReport::new(
                    ErrorKind::Other("panic".into()),
                    panic_message(panic.as_ref()),
                )),
            };

            // A stop we asked for is not a crash
            if !task_cancel.is_cancelled() {
                if let Some(liveness) = liveness {
                    if let Err(e) = liveness.report_exit(&task_handle, signal) {
                        tracing::debug!(stage = %task_handle.stage_id, error = %e, "exit report rejected");
                    }
                }
            }
            let _ = done_tx.send(true);
            tracked.remove(&task_handle.handle_id);
        });

        let finished = done_rx.clone();
        self.running.insert(
            handle.handle_id,
            Running {
                cancel,
                nudge,
                abort: task.abort_handle(),
                done: done_rx,
            },
        );
        // The task may have finished before it was tracked
        if *finished.borrow() {
            self.running.remove(&handle.handle_id);
        }
        tracing::debug!(stage = %handle.stage_id, handle = %handle.handle_id, "stage task spawned");
        Ok(())
    }

    async fn signal_graceful(&self, handle: &StageHandle) -> Result<(), ProcessError> {
        if let Some(running) = self.running.get(&handle.handle_id) {
            running.cancel.cancel();
        }
        Ok(())
    }

    async fn signal_force(&self, handle: &StageHandle) -> Result<(), ProcessError> {
        if let Some(running) = self.running.get(&handle.handle_id) {
            running.cancel.cancel();
            running.abort.abort();
        }
        Ok(())
    }

    async fn wait_stopped(&self, handle: &StageHandle, timeout: Duration) -> bool {
        let Some(mut done) = self.done_receiver(handle) else {
            return true;
        };
        let stopped = tokio::time::timeout(timeout, async move {
            loop {
                if *done.borrow_and_update() {
                    return;
                }
                // Sender dropped: the task was aborted
                if done.changed().await.is_err() {
                    return;
                }
            }
        })
        .await
        .is_ok();

        if stopped {
            self.running.remove(&handle.handle_id);
        }
        stopped
    }

    fn is_alive(&self, handle: &StageHandle) -> bool {
        self.running.get(&handle.handle_id).is_some_and(|r| {
            !r.abort.is_finished() && !*r.done.borrow()
        })
    }

    async fn nudge(&self, handle: &StageHandle) -> Result<(), ProcessError> {
        match self.running.get(&handle.handle_id) {
            Some(running) => {
                running.nudge.notify_one();
                Ok(())
            }
            None => Err(ProcessError::SignalFailed {
                stage_id: handle.stage_id.clone(),
                reason: "execution is not running".into(),
            }),
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "stage panicked".to_string()
    }
}
