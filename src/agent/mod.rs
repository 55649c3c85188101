//! The pluggable agent that writes checkpoint messages, reviews
//! checkpoints and resolves merge conflicts.
//!
//! Engines only see [`ConflictAgent`]; [`CommandAgent`] talks to an
//! external process, and tests substitute in-process fakes.

pub mod command;
pub mod types;

use std::io;
use std::time::Duration;

use thiserror::Error;

pub use command::{CommandAgent, HandoffMode};
pub use types::{
    AgentAction, AgentContext, AgentFile, AgentRequest, AgentResponse, AgentSuggestion, PROTOCOL_VERSION,
};

pub type AgentResult<T> = Result<T, AgentError>;

#[derive(Debug, Error)]
pub enum AgentError {
    /// no agent command configured
    #[error("agent not configured")]
    NotConfigured,

    #[error("invalid agent command: {0}")]
    InvalidCommand(String),

    #[error("failed to start agent '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },

    #[error("agent timed out after {}s", .0.as_secs())]
    Timeout(Duration),

    #[error("agent failed (exit {}): {output}", .status.map(|c| c.to_string()).unwrap_or_else(|| "signal".to_string()))]
    Failed { status: Option<i32>, output: String },

    #[error("invalid agent response: {0}")]
    InvalidResponse(String),

    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl AgentError {
    pub fn is_retriable(&self) -> bool {
        matches!(self, AgentError::Timeout(_))
    }
}

/// A synchronous agent call: one JSON request, one JSON response.
pub trait ConflictAgent {
    fn name(&self) -> &str {
        "agent"
    }

    fn invoke(&self, request: &AgentRequest) -> AgentResult<AgentResponse>;

    /// Ask for a checkpoint message; `None` when the agent returned no
    /// summary.
    fn generate_message(&self, request: &AgentRequest) -> AgentResult<Option<String>> {
        let response = self.invoke(request)?;
        if !response.succeeded() {
            return Err(AgentError::InvalidResponse(format!("status {}", response.status)));
        }
        Ok(response
            .summary
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty()))
    }

    /// Ask the agent to resolve conflicts in `request.workspace_path`. The
    /// files it leaves behind are the result.
    fn resolve_conflicts(&self, request: &AgentRequest) -> AgentResult<()> {
        let response = self.invoke(request)?;
        if response.succeeded() {
            Ok(())
        } else {
            Err(AgentError::InvalidResponse(format!("status {}", response.status)))
        }
    }

    fn review(&self, request: &AgentRequest) -> AgentResult<Vec<AgentSuggestion>> {
        Ok(self.invoke(request)?.suggestions)
    }
}

/// Resolve the configured agent; `Ok(None)` when none is configured.
pub fn from_env() -> AgentResult<Option<CommandAgent>> {
    match CommandAgent::from_env() {
        Ok(agent) => Ok(Some(agent)),
        Err(AgentError::NotConfigured) => Ok(None),
        Err(e) => Err(e),
    }
}
