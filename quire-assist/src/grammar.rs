//! Grammar check on top of the text-transform collaborator.
//!
//! The model is asked for a `json`-fenced block holding
//! `{ "issues": [ { "type": "spelling", "position": {"start":0,"end":4}, ... } ] }`.
//! Anything else (no fence, bad JSON, missing `issues`) yields an empty
//! list. Individual malformed issues are skipped.

use std::sync::Arc;

use quire_core::TextSpan;
use serde::{Deserialize, Serialize};

use crate::ai::{AssistError, TextTransform};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IssueKind {
    Spelling,
    Grammar,
    Style,
    Punctuation,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    #[default]
    Medium,
    High,
}

/// Offsets into the plain text that was checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssuePosition {
    pub start: usize,
    pub end: usize,
}

/// One finding. Superseded wholesale by the next check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GrammarIssue {
    #[serde(rename = "type")]
    pub kind: IssueKind,
    pub position: IssuePosition,
    pub original: String,
    pub suggestion: String,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub severity: Severity,
}

impl GrammarIssue {
    pub fn span(&self) -> TextSpan {
        TextSpan::new(self.position.start, self.position.end)
    }
}

#[derive(Deserialize)]
struct IssueList {
    issues: Vec<serde_json::Value>,
}

/// Runs a grammar check through a [`TextTransform`].
#[derive(Clone)]
pub struct GrammarChecker {
    transform: Arc<dyn TextTransform>,
}

impl GrammarChecker {
    pub fn new(transform: Arc<dyn TextTransform>) -> Self {
        Self { transform }
    }

    /// Check `text`. Fails only when the collaborator is unavailable; an
    /// unusable answer is an empty list.
    pub async fn check_text(&self, text: &str) -> Result<Vec<GrammarIssue>, AssistError> {
        let reply = self.transform.transform(&check_prompt(text)).await?;
        Ok(parse_issues(&reply))
    }
}

fn check_prompt(text: &str) -> String {
    format!(
        r#"Check the following text for grammar, spelling, punctuation and style problems and answer in JSON.
Text: {text}
Answer format (a ```json fenced block, nothing else):
{{
  "issues": [
    {{
      "type": "spelling" | "grammar" | "style" | "punctuation",
      "position": {{"start": 0, "end": 0}},
      "original": "the faulty text",
      "suggestion": "the corrected text",
      "reason": "why it is wrong",
      "severity": "low" | "medium" | "high"
    }}
  ]
}}"#
    )
}

/// Body of a ```json fenced block spanning the whole reply.
fn fenced_json(reply: &str) -> Option<&str> {
    let body = reply.trim().strip_prefix("```json")?.strip_suffix("```")?;
    Some(body.trim())
}

/// Parse a model reply into issues, degrading to an empty list.
pub fn parse_issues(reply: &str) -> Vec<GrammarIssue> {
    let Some(body) = fenced_json(reply) else {
        log::warn!("Grammar reply is not a fenced JSON block");
        return Vec::new();
    };
    let list: IssueList = match serde_json::from_str(body) {
        Ok(list) => list,
        Err(e) => {
            log::warn!("Grammar reply is not an issue list: {e}");
            return Vec::new();
        }
    };
    list.issues
        .into_iter()
        .filter_map(|value| match serde_json::from_value::<GrammarIssue>(value) {
            Ok(issue) if issue.position.start <= issue.position.end => Some(issue),
            Ok(issue) => {
                log::debug!("Skipping issue with inverted span {:?}", issue.position);
                None
            }
            Err(e) => {
                log::debug!("Skipping malformed issue: {e}");
                None
            }
        })
        .collect()
}
