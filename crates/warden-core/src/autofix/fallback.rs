//! Fallback rewrite rules
//!
//! Used when the diagnosis port is unavailable or its reply is unusable.
//! The standard set holds a single rule: a missing-key subscript such as
//! `row["id"]` becomes the defaulted lookup `row.get("id")`.

use crate::types::ErrorKind;
use regex::Regex;
use std::fmt;
use std::sync::{Arc, OnceLock};

/// A deterministic single-line rewrite for one error kind
pub trait FallbackRule: Send + Sync {
    /// Rule name, recorded in the patch origin
    fn name(&self) -> &str;

    /// Whether the rule handles this kind
    fn applies_to(&self, kind: &ErrorKind) -> bool;

    /// Rewritten line, or `None` when the line does not fit the rule
    fn rewrite(&self, line: &str) -> Option<String>;

    /// Explanation recorded with the patch
    fn rationale(&self) -> String;
}

/// Missing key access becomes a defaulted `get`
#[derive(Debug, Clone, Copy, Default)]
pub struct MissingKeyRule;

fn subscript() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| {
            Regex::new(r#"([A-Za-z_][\w.]*)\[\s*("[^"]*"|'[^']*'|[A-Za-z_]\w*)\s*\]"#).ok()
        })
        .as_ref()
}

impl FallbackRule for MissingKeyRule {
    fn name(&self) -> &str {
        "missing_key_guarded_get"
    }

    fn applies_to(&self, kind: &ErrorKind) -> bool {
        matches!(kind, ErrorKind::MissingKey)
    }

    fn rewrite(&self, line: &str) -> Option<String> {
        let re = subscript()?;
        // First subscript that is read, not assigned to
        let caps = re.captures_iter(line).find(|caps| {
            caps.get(0).is_some_and(|m| {
                let rest = line[m.end()..].trim_start();
                !(rest.starts_with('=') && !rest.starts_with("=="))
            })
        })?;
        let whole = caps.get(0)?;
        let target = caps.get(1)?.as_str();
        let key = caps.get(2)?.as_str();

        let mut out = String::with_capacity(line.len() + 6);
        out.push_str(&line[..whole.start()]);
        out.push_str(target);
        out.push_str(".get(");
        out.push_str(key);
        out.push(')');
        out.push_str(&line[whole.end()..]);
        Some(out)
    }

    fn rationale(&self) -> String {
        "key may be absent; replaced subscript with a defaulted lookup".to_string()
    }
}

/// Registry of fallback rules, searched in insertion order
#[derive(Clone, Default)]
pub struct FallbackRules {
    rules: Vec<Arc<dyn FallbackRule>>,
}

impl fmt::Debug for FallbackRules {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.rules.iter().map(|r| r.name().to_string()))
            .finish()
    }
}

impl FallbackRules {
    /// The standard rule set
    #[must_use]
    pub fn standard() -> Self {
        Self::empty().with_rule(MissingKeyRule)
    }

    /// No rules at all
    #[must_use]
    pub fn empty() -> Self {
        Self { rules: Vec::new() }
    }

    /// Add a rule
    #[must_use]
    pub fn with_rule(mut self, rule: impl FallbackRule + 'static) -> Self {
        self.rules.push(Arc::new(rule));
        self
    }

    /// First rule handling `kind`
    #[must_use]
    pub fn find(&self, kind: &ErrorKind) -> Option<&dyn FallbackRule> {
        self.rules
            .iter()
            .find(|rule| rule.applies_to(kind))
            .map(AsRef::as_ref)
    }

    /// Number of rules
    #[must_use]
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// Whether there are no rules
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}
