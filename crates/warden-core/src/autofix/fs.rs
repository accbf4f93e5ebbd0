//! Filesystem source access
//!
//! Units are paths, resolved against a root directory unless absolute.
//! Backups are timestamped siblings (`transform.py.bak.20250101T120000123`).
//! Writes go through a temporary sibling and a rename.

use super::ports::{LineWindow, SourceAccess, SourceExcerpt};
use crate::error::SourceError;
use async_trait::async_trait;
use chrono::Utc;
use std::io::ErrorKind as IoErrorKind;
use std::path::{Path, PathBuf};

/// [`SourceAccess`] over the local filesystem
#[derive(Debug, Clone)]
pub struct FsSourceAccess {
    root: PathBuf,
}

impl FsSourceAccess {
    /// Resolve relative units against `root`
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Root directory
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, unit: &str) -> PathBuf {
        let path = Path::new(unit);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        }
    }

    async fn read_text(&self, unit: &str) -> Result<String, SourceError> {
        tokio::fs::read_to_string(self.resolve(unit))
            .await
            .map_err(|e| map_io(unit, e))
    }
}

fn map_io(unit: &str, e: std::io::Error) -> SourceError {
    if e.kind() == IoErrorKind::NotFound {
        SourceError::NotFound(unit.to_string())
    } else {
        SourceError::io(unit, e)
    }
}

#[async_trait]
impl SourceAccess for FsSourceAccess {
    async fn read(&self, unit: &str, window: LineWindow) -> Result<SourceExcerpt, SourceError> {
        let text = self.read_text(unit).await?;
        SourceExcerpt::from_text(unit, &text, window)
    }

    async fn write_backup(&self, unit: &str) -> Result<String, SourceError> {
        let path = self.resolve(unit);
        let stamp = Utc::now().format("%Y%m%dT%H%M%S%3f");
        let mut backup = path.clone().into_os_string();
        backup.push(format!(".bak.{stamp}"));
        let backup = PathBuf::from(backup);

        tokio::fs::copy(&path, &backup)
            .await
            .map_err(|e| map_io(unit, e))?;
        tracing::debug!(unit, backup = %backup.display(), "backup written");
        Ok(backup.to_string_lossy().into_owned())
    }

    async fn write(&self, unit: &str, text: &str) -> Result<(), SourceError> {
        let path = self.resolve(unit);
        let mut staging = path.clone().into_os_string();
        staging.push(".warden-tmp");
        let staging = PathBuf::from(staging);

        tokio::fs::write(&staging, text)
            .await
            .map_err(|e| SourceError::io(unit, e))?;
        if let Err(e) = tokio::fs::rename(&staging, &path).await {
            let _ = tokio::fs::remove_file(&staging).await;
            return Err(SourceError::io(unit, e));
        }
        Ok(())
    }

    async fn reload(&self, unit: &str) -> Result<(), SourceError> {
        // Executions read from disk; confirm the unit is there and readable
        self.read_text(unit)
            .await
            .map(|_| ())
            .map_err(|e| SourceError::Reload {
                unit: unit.to_string(),
                reason: e.to_string(),
            })
    }

    async fn restore(&self, unit: &str, backup: &str) -> Result<(), SourceError> {
        let text = tokio::fs::read_to_string(backup)
            .await
            .map_err(|e| map_io(backup, e))?;
        self.write(unit, &text).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn backup_write_restore_cycle() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("stage.py"), "a\nb\n").await.unwrap();
        let source = FsSourceAccess::new(dir.path());

        let backup = source.write_backup("stage.py").await.unwrap();
        assert!(backup.contains("stage.py.bak."));

        source.write("stage.py", "a\nB\n").await.unwrap();
        source.reload("stage.py").await.unwrap();
        let excerpt = source.read("stage.py", LineWindow::Full).await.unwrap();
        assert_eq!(excerpt.text(), "a\nB\n");

        source.restore("stage.py", &backup).await.unwrap();
        let restored = source.read("stage.py", LineWindow::Full).await.unwrap();
        assert_eq!(restored.text(), "a\nb\n");
    }

    #[tokio::test]
    async fn patching_a_crlf_file_touches_only_the_faulting_line() {
        use crate::autofix::AutoFixEngine;
        use crate::config::AutoFixConfig;
        use crate::types::{CrashReport, ErrorKind, SourceLocation};
        use std::sync::Arc;

        let dir = tempfile::tempdir().unwrap();
        let crlf = "def f(row):\r\n    v = row[\"k\"]\r\n    return v\r\n";
        tokio::fs::write(dir.path().join("f.py"), crlf).await.unwrap();
        let engine = AutoFixEngine::new(Arc::new(FsSourceAccess::new(dir.path())), AutoFixConfig::default());

        let report = CrashReport::new(ErrorKind::MissingKey, "'k'")
            .with_location(SourceLocation::new("f.py", 2));
        let record = engine.attempt_fix(&report).await.unwrap();

        let patched = tokio::fs::read_to_string(dir.path().join("f.py")).await.unwrap();
        assert_eq!(patched.matches("\r\n").count(), 3);
        assert!(patched.contains("    v = row.get(\"k\")\r\n"));
        let backup = tokio::fs::read_to_string(record.backup_location.unwrap()).await.unwrap();
        assert_eq!(backup, crlf);
    }

    #[tokio::test]
    async fn missing_unit_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let source = FsSourceAccess::new(dir.path());
        assert!(matches!(
            source.read("absent.py", LineWindow::Full).await,
            Err(SourceError::NotFound(_))
        ));
        assert!(matches!(
            source.reload("absent.py").await,
            Err(SourceError::Reload { .. })
        ));
    }
}
