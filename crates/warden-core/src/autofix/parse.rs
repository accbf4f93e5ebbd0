//! Parsing of diagnosis suggestions
//!
//! A suggestion is a JSON object, optionally wrapped in a fenced code block
//! and surrounded by prose:
//!
//! ```text
//! {"fixed_code": "value = row.get(\"id\")", "explanation": "key may be absent"}
//! ```

use crate::error::DiagnosisError;
use serde::Deserialize;

/// A usable fix suggestion
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Suggestion {
    /// Replacement for the faulting line
    #[serde(alias = "replacement", alias = "fix")]
    pub fixed_code: String,
    /// Why the replacement fixes the error
    #[serde(default, alias = "rationale")]
    pub explanation: String,
}

/// Extract a [`Suggestion`] from raw reply text
///
/// # Errors
/// - `DiagnosisError::Unusable` when no JSON object with a non-empty
///   replacement can be found
pub fn parse_suggestion(text: &str) -> Result<Suggestion, DiagnosisError> {
    let body = strip_fence(text);
    let start = body
        .find('{')
        .ok_or_else(|| DiagnosisError::Unusable("no JSON object in reply".into()))?;
    let end = body
        .rfind('}')
        .filter(|end| *end > start)
        .ok_or_else(|| DiagnosisError::Unusable("unterminated JSON object".into()))?;

    let suggestion: Suggestion = serde_json::from_str(&body[start..=end])
        .map_err(|e| DiagnosisError::Unusable(format!("invalid suggestion JSON: {e}")))?;
    if suggestion.fixed_code.trim().is_empty() {
        return Err(DiagnosisError::Unusable("empty replacement".into()));
    }
    Ok(suggestion)
}

fn strip_fence(text: &str) -> &str {
    let Some(open) = text.find("```") else {
        return text;
    };
    let after = &text[open + 3..];
    // Skip a language tag such as ```json
    let body_start = after.find('\n').map_or(0, |i| i + 1);
    let body = &after[body_start..];
    body.find("```").map_or(body, |close| &body[..close])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_json() {
        let s = parse_suggestion(r#"{"fixed_code": "x = d.get('k')", "explanation": "guard"}"#)
            .unwrap();
        assert_eq!(s.fixed_code, "x = d.get('k')");
        assert_eq!(s.explanation, "guard");
    }

    #[test]
    fn fenced_json_with_prose() {
        let reply = "Here is the fix:\n```json\n{\"replacement\": \"x = 1\", \"rationale\": \"r\"}\n```\nGood luck.";
        let s = parse_suggestion(reply).unwrap();
        assert_eq!(s.fixed_code, "x = 1");
        assert_eq!(s.explanation, "r");
    }

    #[test]
    fn missing_explanation_defaults() {
        let s = parse_suggestion(r#"{"fixed_code": "y"}"#).unwrap();
        assert!(s.explanation.is_empty());
    }

    #[test]
    fn unusable_replies() {
        assert!(parse_suggestion("I cannot help with that").is_err());
        assert!(parse_suggestion(r#"{"fixed_code": "  "}"#).is_err());
        assert!(parse_suggestion(r#"{"explanation": "no code"}"#).is_err());
        assert!(parse_suggestion("} {").is_err());
    }
}
