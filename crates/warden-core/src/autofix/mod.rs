//! Auto-fix engine
//!
//! Patches the faulting line of a crashed stage:
//! 1. Read the unit and a context window around the faulting line
//! 2. Ask the diagnosis port for a replacement (bounded by a timeout)
//! 3. If diagnosis is unavailable or unusable, apply a fallback rule
//! 4. Back up the unit, write the patched content, reload it
//!
//! Nothing is written before the backup succeeds. Attempts on the same unit
//! are serialized, and the latest [`PatchRecord`] per unit is kept for audit
//! and rollback.

pub mod fallback;
pub mod fs;
pub mod parse;
pub mod ports;

pub use fallback::{FallbackRule, FallbackRules, MissingKeyRule};
pub use fs::FsSourceAccess;
pub use parse::{parse_suggestion, Suggestion};
pub use ports::{
    split_terminator, DiagnosisPort, DiagnosisReply, DiagnosisRequest, LineWindow, SourceAccess,
    SourceExcerpt,
};

use crate::config::AutoFixConfig;
use crate::error::{AutoFixError, DiagnosisError, SourceError};
use crate::types::{CrashReport, PatchOrigin, PatchRecord, SourceLocation};
use chrono::Utc;
use dashmap::DashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Diagnose-and-patch engine
pub struct AutoFixEngine {
    source: Arc<dyn SourceAccess>,
    diagnosis: Option<Arc<dyn DiagnosisPort>>,
    rules: FallbackRules,
    config: AutoFixConfig,
    unit_locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    patches: DashMap<String, PatchRecord>,
}

impl std::fmt::Debug for AutoFixEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AutoFixEngine")
            .field("diagnosis", &self.diagnosis.is_some())
            .field("rules", &self.rules)
            .field("config", &self.config)
            .field("patches", &self.patches.len())
            .finish_non_exhaustive()
    }
}

struct Candidate {
    replacement: String,
    rationale: String,
    origin: PatchOrigin,
}

impl AutoFixEngine {
    /// Engine with the standard fallback rules and no diagnosis port
    pub fn new(source: Arc<dyn SourceAccess>, config: AutoFixConfig) -> Self {
        Self {
            source,
            diagnosis: None,
            rules: FallbackRules::standard(),
            config,
            unit_locks: DashMap::new(),
            patches: DashMap::new(),
        }
    }

    /// Attach a diagnosis service
    #[must_use]
    pub fn with_diagnosis(mut self, diagnosis: Arc<dyn DiagnosisPort>) -> Self {
        self.diagnosis = Some(diagnosis);
        self
    }

    /// Replace the fallback rules
    #[must_use]
    pub fn with_rules(mut self, rules: FallbackRules) -> Self {
        self.rules = rules;
        self
    }

    /// Settings in force
    #[must_use]
    pub fn config(&self) -> &AutoFixConfig {
        &self.config
    }

    /// Whether crashes should be patched at all
    #[inline]
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Patch the unit named by a crash report
    ///
    /// # Errors
    /// - `AutoFixError::MissingLocation` when the report has no location
    /// - `AutoFixError::Read` when the unit cannot be read
    /// - `AutoFixError::UnsupportedErrorKind` when diagnosis is unavailable
    ///   and no fallback rule covers the kind
    /// - `AutoFixError::Unavailable` when diagnosis is unavailable and the
    ///   fallback rule does not fit the line
    /// - `AutoFixError::Backup` when the backup cannot be written
    /// - `AutoFixError::PatchApplication` when write or reload fails after the
    ///   backup; the error carries the backup location. A failed reload
    ///   restores the unit from the backup first
    pub async fn attempt_fix(&self, report: &CrashReport) -> Result<PatchRecord, AutoFixError> {
        self.attempt_fix_with(report, &CancellationToken::new()).await
    }

    /// [`Self::attempt_fix`], giving up before any mutation once `cancel` fires
    ///
    /// # Errors
    /// - Everything [`Self::attempt_fix`] returns
    /// - `AutoFixError::Cancelled` when cancelled before the backup
    pub async fn attempt_fix_with(
        &self,
        report: &CrashReport,
        cancel: &CancellationToken,
    ) -> Result<PatchRecord, AutoFixError> {
        let location = report.location.clone().ok_or(AutoFixError::MissingLocation)?;
        let unit = location.unit.clone();

        let lock = self.unit_lock(&unit);
        let _guard = lock.lock().await;

        let full = self
            .source
            .read(&unit, LineWindow::Full)
            .await
            .map_err(AutoFixError::Read)?;
        let faulting_line = full
            .line(location.line)
            .ok_or_else(|| {
                AutoFixError::Read(SourceError::LineOutOfRange {
                    unit: unit.clone(),
                    line: location.line,
                })
            })?
            .to_string();
        let window = self
            .source
            .read(
                &unit,
                LineWindow::Around {
                    line: location.line,
                    radius: self.config.context_radius,
                },
            )
            .await
            .map_err(AutoFixError::Read)?;

        let candidate = match self
            .diagnose(report, &location, &faulting_line, &window, cancel)
            .await
        {
            Ok(suggestion) => Candidate {
                replacement: keep_indent(&faulting_line, &suggestion.fixed_code),
                rationale: suggestion.explanation,
                origin: PatchOrigin::Diagnosis,
            },
            Err(unavailable) => {
                if cancel.is_cancelled() {
                    return Err(AutoFixError::Cancelled);
                }
                tracing::info!(unit = %unit, reason = %unavailable, "diagnosis unavailable, trying fallback rules");
                self.fallback(report, &faulting_line, unavailable)?
            }
        };

        if cancel.is_cancelled() {
            return Err(AutoFixError::Cancelled);
        }

        let original = full.text();
        let patched = replace_line(&original, location.line, &candidate.replacement);
        let mut record = PatchRecord {
            unit: unit.clone(),
            line: location.line,
            original,
            replacement: candidate.replacement,
            backup_location: None,
            applied: false,
            rationale: candidate.rationale,
            origin: candidate.origin,
            created_at: Utc::now(),
        };

        let backup = self
            .source
            .write_backup(&unit)
            .await
            .map_err(AutoFixError::Backup)?;
        record.backup_location = Some(backup.clone());

        if let Err(e) = self.source.write(&unit, &patched).await {
            return Err(self.application_failed(record, format!("write failed: {e}")));
        }
        if let Err(e) = self.source.reload(&unit).await {
            // The patch never went live, so the unit goes back to its original
            let reason = match self.source.restore(&unit, &backup).await {
                Ok(()) => format!("reload failed, original restored: {e}"),
                Err(restore) => format!("reload failed: {e}; restore failed: {restore}"),
            };
            return Err(self.application_failed(record, reason));
        }

        record.applied = true;
        tracing::info!(
            unit = %unit,
            line = record.line,
            origin = ?record.origin,
            "patch applied"
        );
        self.patches.insert(unit, record.clone());
        Ok(record)
    }

    /// Restore a unit from the backup of its latest patch
    ///
    /// # Errors
    /// - `AutoFixError::NoPatchRecorded` when there is nothing to roll back
    /// - `AutoFixError::Rollback` when restore or reload fails
    pub async fn rollback(&self, unit: &str) -> Result<PatchRecord, AutoFixError> {
        let lock = self.unit_lock(unit);
        let _guard = lock.lock().await;

        let mut record = self
            .patches
            .get(unit)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| AutoFixError::NoPatchRecorded(unit.to_string()))?;
        let backup = record
            .backup_location
            .clone()
            .ok_or_else(|| AutoFixError::NoPatchRecorded(unit.to_string()))?;

        self.source
            .restore(unit, &backup)
            .await
            .map_err(AutoFixError::Rollback)?;
        self.source.reload(unit).await.map_err(AutoFixError::Rollback)?;

        record.applied = false;
        self.patches.insert(unit.to_string(), record.clone());
        tracing::info!(unit, backup = %backup, "patch rolled back");
        Ok(record)
    }

    /// Latest patch record of a unit
    #[must_use]
    pub fn latest_patch(&self, unit: &str) -> Option<PatchRecord> {
        self.patches.get(unit).map(|entry| entry.value().clone())
    }

    /// Latest patch record of every unit
    #[must_use]
    pub fn patches(&self) -> Vec<PatchRecord> {
        self.patches.iter().map(|entry| entry.value().clone()).collect()
    }

    async fn diagnose(
        &self,
        report: &CrashReport,
        location: &SourceLocation,
        faulting_line: &str,
        window: &SourceExcerpt,
        cancel: &CancellationToken,
    ) -> Result<Suggestion, DiagnosisError> {
        let Some(port) = &self.diagnosis else {
            return Err(DiagnosisError::Unavailable("no diagnosis service configured".into()));
        };
        let request = DiagnosisRequest {
            kind: report.kind.clone(),
            message: report.message.clone(),
            location: location.clone(),
            faulting_line: faulting_line.to_string(),
            context: window.numbered(),
        };
        let bound = self.config.diagnosis_timeout;

        let reply = tokio::select! {
            biased;
            () = cancel.cancelled() => {
                return Err(DiagnosisError::Unavailable("cancelled".into()));
            }
            reply = tokio::time::timeout(bound, port.diagnose(request)) => reply,
        };

        match reply {
            Err(_) => Err(DiagnosisError::Timeout(bound)),
            Ok(Err(e)) => Err(e),
            Ok(Ok(DiagnosisReply::Unable { reason })) => Err(DiagnosisError::Unavailable(
                format!("service declined: {reason}"),
            )),
            Ok(Ok(DiagnosisReply::Suggestion(text))) => parse_suggestion(&text),
        }
    }

    fn fallback(
        &self,
        report: &CrashReport,
        faulting_line: &str,
        unavailable: DiagnosisError,
    ) -> Result<Candidate, AutoFixError> {
        let kind = report.kind.to_string();
        let rule = self
            .rules
            .find(&report.kind)
            .ok_or_else(|| AutoFixError::UnsupportedErrorKind { kind: kind.clone() })?;
        let replacement = rule.rewrite(faulting_line).ok_or(AutoFixError::Unavailable {
            kind,
            diagnosis: unavailable,
        })?;
        Ok(Candidate {
            replacement,
            rationale: rule.rationale(),
            origin: PatchOrigin::Fallback {
                rule: rule.name().to_string(),
            },
        })
    }

    fn application_failed(&self, record: PatchRecord, reason: String) -> AutoFixError {
        tracing::error!(
            unit = %record.unit,
            backup = ?record.backup_location,
            "{reason}"
        );
        self.patches.insert(record.unit.clone(), record.clone());
        AutoFixError::PatchApplication {
            record: Box::new(record),
            reason,
        }
    }

    fn unit_lock(&self, unit: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.unit_locks
            .entry(unit.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }
}

/// Give an unindented replacement the indentation of the line it replaces
fn keep_indent(original: &str, replacement: &str) -> String {
    let replacement = replacement.trim_end_matches(['\n', '\r']);
    if replacement.starts_with(char::is_whitespace) {
        return replacement.to_string();
    }
    let indent: String = original.chars().take_while(|c| c.is_whitespace()).collect();
    replacement
        .lines()
        .map(|line| format!("{indent}{line}"))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Replace 1-based `line` of `text`
///
/// Every other byte is kept, including line terminators. A multi-line
/// replacement is joined with the terminator of the line it replaces.
fn replace_line(text: &str, line: u32, replacement: &str) -> String {
    let mut patched = String::with_capacity(text.len() + replacement.len());
    for (i, current) in text.split_inclusive('\n').enumerate() {
        if i + 1 != line as usize {
            patched.push_str(current);
            continue;
        }
        let (_, terminator) = split_terminator(current);
        let joint = if terminator.is_empty() { "\n" } else { terminator };
        patched.push_str(&replacement.lines().collect::<Vec<_>>().join(joint));
        patched.push_str(terminator);
    }
    patched
}
