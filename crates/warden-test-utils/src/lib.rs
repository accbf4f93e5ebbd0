//! Testing utilities for the Warden workspace
//!
//! Scripted, in-memory implementations of every port plus shared fixtures.

#![allow(missing_docs)]

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use warden_core::{
    CrashReport, DiagnosisError, DiagnosisPort, DiagnosisReply, DiagnosisRequest, ErrorKind,
    LineWindow, LivenessSink, ProcessError, SourceAccess, SourceError, SourceExcerpt,
    SourceLocation, StageDriver, StageHandle,
};
use warden_events::{HandleId, HealthEvent, HealthObserver, ObserverError};

// ---------------------------------------------------------------------------
// Stage driver
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverCall {
    Launch(HandleId),
    Graceful(HandleId),
    Force(HandleId),
    Nudge(HandleId),
}

impl DriverCall {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Launch(_) => "launch",
            Self::Graceful(_) => "graceful",
            Self::Force(_) => "force",
            Self::Nudge(_) => "nudge",
        }
    }
}

/// Driver that records every call and stops executions on command
pub struct FakeDriver {
    calls: Mutex<Vec<DriverCall>>,
    stopped: Mutex<HashSet<HandleId>>,
    stops_on_graceful: AtomicBool,
    fail_launch: AtomicBool,
    liveness: Mutex<Option<Arc<dyn LivenessSink>>>,
}

impl Default for FakeDriver {
    fn default() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            stopped: Mutex::new(HashSet::new()),
            stops_on_graceful: AtomicBool::new(false),
            fail_launch: AtomicBool::new(false),
            liveness: Mutex::new(None),
        }
    }
}

impl FakeDriver {
    /// Driver whose executions ignore graceful stops
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Driver whose executions stop on the graceful signal
    pub fn cooperative() -> Arc<Self> {
        let driver = Self::default();
        driver.stops_on_graceful.store(true, Ordering::SeqCst);
        Arc::new(driver)
    }

    pub fn set_fail_launch(&self, fail: bool) {
        self.fail_launch.store(fail, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<DriverCall> {
        self.calls.lock().clone()
    }

    pub fn call_names(&self) -> Vec<&'static str> {
        self.calls.lock().iter().map(DriverCall::name).collect()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().clear();
    }

    /// Sink attached by the supervisor
    pub fn liveness(&self) -> Option<Arc<dyn LivenessSink>> {
        self.liveness.lock().clone()
    }

    fn record(&self, call: DriverCall) {
        self.calls.lock().push(call);
    }
}

#[async_trait]
impl StageDriver for FakeDriver {
    fn attach(&self, liveness: Arc<dyn LivenessSink>) {
        *self.liveness.lock() = Some(liveness);
    }

    async fn launch(&self, handle: &StageHandle) -> Result<(), ProcessError> {
        self.record(DriverCall::Launch(handle.handle_id));
        if self.fail_launch.load(Ordering::SeqCst) {
            return Err(ProcessError::LaunchFailed {
                stage_id: handle.stage_id.clone(),
                reason: "scripted launch failure".into(),
            });
        }
        Ok(())
    }

    async fn signal_graceful(&self, handle: &StageHandle) -> Result<(), ProcessError> {
        self.record(DriverCall::Graceful(handle.handle_id));
        if self.stops_on_graceful.load(Ordering::SeqCst) {
            self.stopped.lock().insert(handle.handle_id);
        }
        Ok(())
    }

    async fn signal_force(&self, handle: &StageHandle) -> Result<(), ProcessError> {
        self.record(DriverCall::Force(handle.handle_id));
        self.stopped.lock().insert(handle.handle_id);
        Ok(())
    }

    async fn wait_stopped(&self, handle: &StageHandle, timeout: Duration) -> bool {
        if !self.stopped.lock().contains(&handle.handle_id) {
            tokio::time::sleep(timeout).await;
        }
        self.stopped.lock().contains(&handle.handle_id)
    }

    fn is_alive(&self, handle: &StageHandle) -> bool {
        !self.stopped.lock().contains(&handle.handle_id)
    }

    async fn nudge(&self, handle: &StageHandle) -> Result<(), ProcessError> {
        self.record(DriverCall::Nudge(handle.handle_id));
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Source access
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceOp {
    Read(String),
    Backup(String),
    Write(String),
    Reload(String),
    Restore(String),
}

/// In-memory units with an operation log and failure injection
#[derive(Default)]
pub struct InMemorySource {
    files: Mutex<HashMap<String, String>>,
    ops: Mutex<Vec<SourceOp>>,
    fail_backup: AtomicBool,
    fail_write: AtomicBool,
    fail_reload: AtomicBool,
}

impl InMemorySource {
    pub fn with_unit(unit: &str, text: &str) -> Arc<Self> {
        let source = Self::default();
        source.files.lock().insert(unit.to_string(), text.to_string());
        Arc::new(source)
    }

    pub fn text(&self, unit: &str) -> Option<String> {
        self.files.lock().get(unit).cloned()
    }

    pub fn ops(&self) -> Vec<SourceOp> {
        self.ops.lock().clone()
    }

    /// Mutating operations only, as short names
    pub fn mutation_names(&self) -> Vec<&'static str> {
        self.ops
            .lock()
            .iter()
            .filter_map(|op| match op {
                SourceOp::Read(_) => None,
                SourceOp::Backup(_) => Some("backup"),
                SourceOp::Write(_) => Some("write"),
                SourceOp::Reload(_) => Some("reload"),
                SourceOp::Restore(_) => Some("restore"),
            })
            .collect()
    }

    pub fn fail_backup(&self) {
        self.fail_backup.store(true, Ordering::SeqCst);
    }

    pub fn fail_write(&self) {
        self.fail_write.store(true, Ordering::SeqCst);
    }

    pub fn fail_reload(&self) {
        self.fail_reload.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl SourceAccess for InMemorySource {
    async fn read(&self, unit: &str, window: LineWindow) -> Result<SourceExcerpt, SourceError> {
        self.ops.lock().push(SourceOp::Read(unit.to_string()));
        let text = self
            .text(unit)
            .ok_or_else(|| SourceError::NotFound(unit.to_string()))?;
        SourceExcerpt::from_text(unit, &text, window)
    }

    async fn write_backup(&self, unit: &str) -> Result<String, SourceError> {
        self.ops.lock().push(SourceOp::Backup(unit.to_string()));
        if self.fail_backup.load(Ordering::SeqCst) {
            return Err(SourceError::Other {
                unit: unit.to_string(),
                reason: "scripted backup failure".into(),
            });
        }
        let text = self
            .text(unit)
            .ok_or_else(|| SourceError::NotFound(unit.to_string()))?;
        let backup = format!("{unit}.bak");
        self.files.lock().insert(backup.clone(), text);
        Ok(backup)
    }

    async fn write(&self, unit: &str, text: &str) -> Result<(), SourceError> {
        self.ops.lock().push(SourceOp::Write(unit.to_string()));
        if self.fail_write.load(Ordering::SeqCst) {
            return Err(SourceError::Other {
                unit: unit.to_string(),
                reason: "scripted write failure".into(),
            });
        }
        self.files.lock().insert(unit.to_string(), text.to_string());
        Ok(())
    }

    async fn reload(&self, unit: &str) -> Result<(), SourceError> {
        self.ops.lock().push(SourceOp::Reload(unit.to_string()));
        if self.fail_reload.load(Ordering::SeqCst) {
            return Err(SourceError::Reload {
                unit: unit.to_string(),
                reason: "scripted reload failure".into(),
            });
        }
        Ok(())
    }

    async fn restore(&self, unit: &str, backup: &str) -> Result<(), SourceError> {
        self.ops.lock().push(SourceOp::Restore(unit.to_string()));
        let text = self
            .text(backup)
            .ok_or_else(|| SourceError::NotFound(backup.to_string()))?;
        self.files.lock().insert(unit.to_string(), text);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Diagnosis
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub enum Script {
    Reply(String),
    Unable(String),
    Fail(DiagnosisError),
    Hang,
}

/// Diagnosis port answering from a script
pub struct ScriptedDiagnosis {
    script: Script,
    requests: Mutex<Vec<DiagnosisRequest>>,
}

impl ScriptedDiagnosis {
    pub fn new(script: Script) -> Arc<Self> {
        Arc::new(Self {
            script,
            requests: Mutex::new(Vec::new()),
        })
    }

    /// Replies with a JSON suggestion
    pub fn suggesting(fixed_code: &str, explanation: &str) -> Arc<Self> {
        let body = format!(
            "```json\n{{\"fixed_code\": {}, \"explanation\": {}}}\n```",
            json_string(fixed_code),
            json_string(explanation)
        );
        Self::new(Script::Reply(body))
    }

    pub fn unreachable() -> Arc<Self> {
        Self::new(Script::Fail(DiagnosisError::Unavailable("connection refused".into())))
    }

    pub fn requests(&self) -> Vec<DiagnosisRequest> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl DiagnosisPort for ScriptedDiagnosis {
    async fn diagnose(&self, request: DiagnosisRequest) -> Result<DiagnosisReply, DiagnosisError> {
        self.requests.lock().push(request);
        match &self.script {
            Script::Reply(text) => Ok(DiagnosisReply::Suggestion(text.clone())),
            Script::Unable(reason) => Ok(DiagnosisReply::Unable {
                reason: reason.clone(),
            }),
            Script::Fail(e) => Err(e.clone()),
            Script::Hang => {
                std::future::pending::<()>().await;
                Err(DiagnosisError::Unavailable("unreachable".into()))
            }
        }
    }
}

fn json_string(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 2);
    out.push('"');
    for c in text.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            c => out.push(c),
        }
    }
    out.push('"');
    out
}

// ---------------------------------------------------------------------------
// Observer
// ---------------------------------------------------------------------------

/// Observer keeping every event it receives
#[derive(Default)]
pub struct RecordingObserver {
    events: Mutex<Vec<HealthEvent>>,
}

impl RecordingObserver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<HealthEvent> {
        self.events.lock().clone()
    }

    pub fn kind_names(&self) -> Vec<&'static str> {
        self.events.lock().iter().map(|e| e.kind.name()).collect()
    }

    /// Poll until at least `count` events arrived or `limit` elapsed
    pub async fn wait_for(&self, count: usize, limit: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + limit;
        loop {
            if self.events.lock().len() >= count {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

#[async_trait]
impl HealthObserver for RecordingObserver {
    fn name(&self) -> &str {
        "recording"
    }

    async fn on_event(&self, event: &HealthEvent) -> Result<(), ObserverError> {
        self.events.lock().push(event.clone());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

pub const TRANSFORM_UNIT: &str = "stages/transform.py";

pub const TRANSFORM_SOURCE: &str = "\
def transform(rows):
    out = []
    for row in rows:
        user_id = row[\"user_id\"]
        out.append(user_id)
    return out
";

/// Line of `TRANSFORM_SOURCE` holding the unguarded lookup
pub const TRANSFORM_FAULT_LINE: u32 = 4;

pub fn missing_key_crash() -> CrashReport {
    CrashReport::new(ErrorKind::MissingKey, "'user_id'")
        .with_location(SourceLocation::new(TRANSFORM_UNIT, TRANSFORM_FAULT_LINE))
}

pub fn crash_of_kind(kind: ErrorKind) -> CrashReport {
    CrashReport::new(kind, "stage failed")
        .with_location(SourceLocation::new(TRANSFORM_UNIT, TRANSFORM_FAULT_LINE))
}
