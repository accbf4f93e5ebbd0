//! Ports used by the auto-fix engine

use crate::error::{DiagnosisError, SourceError};
use crate::types::{ErrorKind, SourceLocation};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Portion of a source unit to read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineWindow {
    /// The whole unit
    Full,
    /// `radius` lines either side of `line`, clamped to the unit
    Around {
        /// Centre line (1-based)
        line: u32,
        /// Lines on each side
        radius: u32,
    },
}

/// Lines read from a source unit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceExcerpt {
    /// Source unit
    pub unit: String,
    /// Line number of `lines[0]` (1-based)
    pub first_line: u32,
    /// The lines, without terminators
    pub lines: Vec<String>,
    /// The covered text byte for byte, terminators included
    pub raw: String,
}

impl SourceExcerpt {
    /// Split `text` into an excerpt covering `window`
    ///
    /// Lines end at `\n`; a `\r` before it belongs to the terminator.
    ///
    /// # Errors
    /// - `SourceError::LineOutOfRange` when the window's centre line is absent
    pub fn from_text(unit: &str, text: &str, window: LineWindow) -> Result<Self, SourceError> {
        let all: Vec<&str> = text.split_inclusive('\n').collect();
        let total = u32::try_from(all.len()).unwrap_or(u32::MAX);

        let (first, covered) = match window {
            LineWindow::Full => (1, &all[..]),
            LineWindow::Around { line, radius } => {
                if line == 0 || line > total {
                    return Err(SourceError::LineOutOfRange {
                        unit: unit.to_string(),
                        line,
                    });
                }
                let first = line.saturating_sub(radius).max(1);
                let last = line.saturating_add(radius).min(total);
                (first, &all[(first - 1) as usize..last as usize])
            }
        };
        Ok(Self {
            unit: unit.to_string(),
            first_line: first,
            lines: covered
                .iter()
                .map(|l| split_terminator(l).0.to_string())
                .collect(),
            raw: covered.concat(),
        })
    }

    /// Text of one line, by absolute line number
    #[must_use]
    pub fn line(&self, line: u32) -> Option<&str> {
        let offset = line.checked_sub(self.first_line)?;
        self.lines.get(offset as usize).map(String::as_str)
    }

    /// Excerpt joined back into text, exactly as read
    #[must_use]
    pub fn text(&self) -> String {
        self.raw.clone()
    }

    /// Excerpt with line-number gutters, as shown to a diagnosis service
    #[must_use]
    pub fn numbered(&self) -> String {
        self.lines
            .iter()
            .zip(self.first_line..)
            .map(|(text, n)| format!("{n:>5} | {text}"))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Split one line into its content and its terminator (`\n`, `\r\n` or none)
#[must_use]
pub fn split_terminator(line: &str) -> (&str, &str) {
    let body = line.strip_suffix('\n').map_or(line, |l| l.strip_suffix('\r').unwrap_or(l));
    line.split_at(body.len())
}

/// Read, back up, write and reload source units
#[async_trait]
pub trait SourceAccess: Send + Sync {
    /// Read a window of a unit
    async fn read(&self, unit: &str, window: LineWindow) -> Result<SourceExcerpt, SourceError>;

    /// Save the current content and return where it went
    async fn write_backup(&self, unit: &str) -> Result<String, SourceError>;

    /// Replace the content of a unit
    async fn write(&self, unit: &str, text: &str) -> Result<(), SourceError>;

    /// Make the next execution observe the current content
    async fn reload(&self, unit: &str) -> Result<(), SourceError>;

    /// Put a backup back in place
    async fn restore(&self, unit: &str, backup: &str) -> Result<(), SourceError>;
}

/// Everything a diagnosis service is told about a crash
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiagnosisRequest {
    /// Error class
    pub kind: ErrorKind,
    /// Error message
    pub message: String,
    /// Faulting location
    pub location: SourceLocation,
    /// Text of the faulting line
    pub faulting_line: String,
    /// Numbered lines around the faulting line
    pub context: String,
}

/// Diagnosis service answer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiagnosisReply {
    /// Raw suggestion text, expected to hold a JSON object
    Suggestion(String),
    /// The service declined
    Unable {
        /// Why
        reason: String,
    },
}

/// Black-box diagnosis service
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DiagnosisPort: Send + Sync {
    /// Ask for a fix suggestion
    async fn diagnose(&self, request: DiagnosisRequest) -> Result<DiagnosisReply, DiagnosisError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEXT: &str = "a\nb\nc\nd\ne\n";

    #[test]
    fn window_is_clamped() {
        let excerpt =
            SourceExcerpt::from_text("u", TEXT, LineWindow::Around { line: 2, radius: 3 }).unwrap();
        assert_eq!(excerpt.first_line, 1);
        assert_eq!(excerpt.lines, vec!["a", "b", "c", "d", "e"]);
        assert_eq!(excerpt.line(2), Some("b"));

        let tail =
            SourceExcerpt::from_text("u", TEXT, LineWindow::Around { line: 5, radius: 1 }).unwrap();
        assert_eq!(tail.first_line, 4);
        assert_eq!(tail.lines, vec!["d", "e"]);
        assert_eq!(tail.line(1), None);
    }

    #[test]
    fn out_of_range_line_is_an_error() {
        assert!(matches!(
            SourceExcerpt::from_text("u", TEXT, LineWindow::Around { line: 9, radius: 1 }),
            Err(SourceError::LineOutOfRange { line: 9, .. })
        ));
    }

    #[test]
    fn full_read_round_trips_text() {
        let excerpt = SourceExcerpt::from_text("u", TEXT, LineWindow::Full).unwrap();
        assert_eq!(excerpt.text(), TEXT);
    }

    #[test]
    fn crlf_terminators_are_kept_out_of_lines_but_in_text() {
        let text = "def f(row):\r\n    v = row[\"k\"]\r\n    return v\r\n";
        let full = SourceExcerpt::from_text("u", text, LineWindow::Full).unwrap();
        assert_eq!(full.line(2), Some("    v = row[\"k\"]"));
        assert_eq!(full.text(), text);

        let window =
            SourceExcerpt::from_text("u", text, LineWindow::Around { line: 1, radius: 0 }).unwrap();
        assert_eq!(window.lines, vec!["def f(row):"]);
        assert_eq!(window.raw, "def f(row):\r\n");
    }

    #[test]
    fn terminators_split_off() {
        assert_eq!(split_terminator("a\r\n"), ("a", "\r\n"));
        assert_eq!(split_terminator("a\n"), ("a", "\n"));
        assert_eq!(split_terminator("a"), ("a", ""));
        assert_eq!(split_terminator("a\r"), ("a\r", ""));
    }

    #[test]
    fn numbered_context_has_gutters() {
        let excerpt =
            SourceExcerpt::from_text("u", TEXT, LineWindow::Around { line: 3, radius: 0 }).unwrap();
        assert_eq!(excerpt.numbered(), "    3 | c");
    }
}
