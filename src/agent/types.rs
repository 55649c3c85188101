//! JSON contract exchanged with the agent process.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::identity::ChangeId;
use crate::storage::CommitId;

pub const PROTOCOL_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentAction {
    Review,
    GenerateMessage,
    ResolveConflict,
}

impl AgentAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentAction::Review => "review",
            AgentAction::GenerateMessage => "generate_message",
            AgentAction::ResolveConflict => "resolve_conflict",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRequest {
    pub version: u32,
    pub action: AgentAction,
    /// directory the agent runs in and may edit
    pub workspace_path: PathBuf,
    pub context: AgentContext,
}

impl AgentRequest {
    pub fn new(action: AgentAction, workspace_path: impl Into<PathBuf>, context: AgentContext) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            action,
            workspace_path: workspace_path.into(),
            context,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint: Option<CommitId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub change_id: Option<ChangeId>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub diff: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<AgentFile>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conflicts: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ci_results: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentFile {
    pub path: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub content: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentResponse {
    pub version: u32,
    #[serde(default)]
    pub status: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub suggestions: Vec<AgentSuggestion>,
    /// generate_message only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

impl AgentResponse {
    /// anything but an explicit error/failed status counts as success
    pub fn succeeded(&self) -> bool {
        !matches!(
            self.status.trim().to_ascii_lowercase().as_str(),
            "error" | "failed" | "failure"
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentSuggestion {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub commit: String,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub confidence: f64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files_changed: Vec<String>,
}

/// Pull a response out of raw agent output: the whole text as JSON, else the
/// last JSON line, else the first balanced `{...}` block (fences stripped).
pub fn parse_response(data: &[u8]) -> Option<AgentResponse> {
    let text = String::from_utf8_lossy(data);
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    if let Some(resp) = try_parse(text) {
        return Some(resp);
    }
    if let Some(resp) = text
        .lines()
        .rev()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .find_map(|l| try_parse(l).or_else(|| try_parse(extract_json(l))))
    {
        return Some(resp);
    }
    try_parse(extract_json(text))
}

fn try_parse(text: &str) -> Option<AgentResponse> {
    serde_json::from_str::<AgentResponse>(text)
        .ok()
        .filter(|r| r.version != 0)
}

fn extract_json(text: &str) -> &str {
    let trimmed = text.trim();
    let trimmed = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .unwrap_or(trimmed);
    let trimmed = trimmed.strip_suffix("```").unwrap_or(trimmed).trim();
    let Some(start) = trimmed.find('{') else {
        return trimmed;
    };
    let mut depth = 0usize;
    for (i, c) in trimmed[start..].char_indices() {
        match c {
            '{' => depth += 1,
            '}' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return &trimmed[start..start + i + 1];
                }
            }
            _ => {}
        }
    }
    &trimmed[start..]
}
