//! Engine-level error types.
//!
//! Every failure an operation can surface to the operator is a
//! [`WorkflowError`]. Besides the message, each variant exposes a stable
//! machine code, a coarse [`ErrorKind`] and remediation hints so that
//! automation can react without parsing text.

use std::path::PathBuf;

use serde::Serialize;
use thiserror::Error;

use crate::agent::AgentError;
use crate::policy::{PolicyError, Strategy};
use crate::storage::{CommitId, InvalidNameError, StorageError};

/// Result type for engine operations.
pub type WorkflowResult<T> = Result<T, WorkflowError>;

/// Coarse classification of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// bad flags, strategy or policy file; nothing was touched
    Configuration,
    /// something the operation needs is missing; nothing was touched
    Precondition,
    /// the refs moved underneath the operation
    Divergence,
    /// content conflicts that need resolution
    Conflict,
    /// the agent or another outside process failed
    External,
    Internal,
}

/// A command the operator can run to move forward.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NextAction {
    pub action: String,
    pub command: String,
}

impl NextAction {
    pub fn new(action: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            command: command.into(),
        }
    }
}

/// Serializable view of an error for `--json` output.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorReport {
    pub code: &'static str,
    pub kind: ErrorKind,
    pub message: String,
    pub next_actions: Vec<NextAction>,
}

#[derive(Debug, Error)]
pub enum WorkflowError {
    /// Object store failure.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Agent failure outside the message/conflict paths that handle it.
    #[error("agent error: {0}")]
    Agent(#[from] AgentError),

    /// Malformed policy file.
    #[error("invalid policy: {0}")]
    Policy(#[from] PolicyError),

    #[error("invalid name: {0}")]
    InvalidName(#[from] InvalidNameError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid configuration for {key}: {reason}")]
    InvalidConfig { key: String, reason: String },

    #[error("unknown promote strategy '{0}' (expected rebase, squash or merge)")]
    InvalidStrategy(String),

    #[error("conflicting options: {0}")]
    ConflictingFlags(String),

    /// A required ref, remote or checkpoint is missing.
    #[error("{message}")]
    Precondition {
        code: &'static str,
        message: String,
        next: Vec<NextAction>,
    },

    /// Lease and workspace ref disagree.
    #[error("workspace diverged: {reason}")]
    WorkspaceDiverged { operation: &'static str, reason: String },

    /// The workspace ref moved past the base this device works on.
    #[error("workspace base advanced: local base {local_base}, workspace at {workspace_tip}")]
    BaseAdvanced {
        operation: &'static str,
        local_base: CommitId,
        workspace_tip: CommitId,
    },

    /// A checkpoint landed between two draft snapshots.
    #[error("checkpoint base diverged: draft {draft} is parented on {parent}, merge base is {merge_base}")]
    CheckpointBaseDiverged {
        draft: CommitId,
        parent: CommitId,
        merge_base: CommitId,
    },

    #[error("target {target} was rewritten: tracked tip {track_tip} is not an ancestor of {remote_tip}")]
    TargetRewritten {
        target: String,
        track_tip: CommitId,
        remote_tip: CommitId,
    },

    #[error("promote to {target} is not a fast-forward: {published} does not descend from {previous}")]
    NotFastForward {
        target: String,
        previous: CommitId,
        published: CommitId,
    },

    #[error("policy check failed for {target}: {}", .failures.join("; "))]
    PolicyFailed {
        target: String,
        commit: CommitId,
        failures: Vec<String>,
    },

    #[error("{strategy} conflict replaying {checkpoint} onto {target}: {}", paths_display(.paths))]
    PromoteConflict {
        strategy: Strategy,
        target: String,
        checkpoint: CommitId,
        paths: Vec<PathBuf>,
    },

    #[error("restack conflict replaying {checkpoint} onto {onto}: {}", paths_display(.paths))]
    RestackConflict {
        onto: String,
        checkpoint: CommitId,
        paths: Vec<PathBuf>,
    },

    #[error("failed to generate checkpoint message: {reason}")]
    MessageGeneration { reason: String },

    #[error("suggestion not found: {0}")]
    SuggestionNotFound(String),

    #[error("suggestion {id} is {status}, only pending suggestions can be resolved")]
    SuggestionNotPending { id: String, status: String },

    #[error("internal error: {0}")]
    Internal(String),
}

fn paths_display(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

impl WorkflowError {
    pub fn precondition(code: &'static str, message: impl Into<String>) -> Self {
        WorkflowError::Precondition {
            code,
            message: message.into(),
            next: Vec::new(),
        }
    }

    /// attach a remediation hint to a precondition error
    pub fn with_next(mut self, action: NextAction) -> Self {
        if let WorkflowError::Precondition { next, .. } = &mut self {
            next.push(action);
        }
        self
    }

    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            WorkflowError::Storage(e) if e.is_conflict() => "concurrent_update",
            WorkflowError::Storage(StorageError::RemoteNotFound(_)) => "remote_missing",
            WorkflowError::Storage(_) => "storage_error",
            WorkflowError::Agent(_) => "agent_failed",
            WorkflowError::Policy(_) => "policy_invalid",
            WorkflowError::InvalidName(_) => "invalid_name",
            WorkflowError::Io(_) => "io_error",
            WorkflowError::Serialization(_) => "serialization_error",
            WorkflowError::InvalidConfig { .. } => "invalid_config",
            WorkflowError::InvalidStrategy(_) => "promote_invalid_strategy",
            WorkflowError::ConflictingFlags(_) => "conflicting_flags",
            WorkflowError::Precondition { code, .. } => code,
            WorkflowError::WorkspaceDiverged { operation: "promote", .. } => "promote_base_diverged",
            WorkflowError::WorkspaceDiverged { .. } => "workspace_diverged",
            WorkflowError::BaseAdvanced { operation: "promote", .. } => "promote_base_advanced",
            WorkflowError::BaseAdvanced { operation: "checkpoint", .. } => "checkpoint_base_advanced",
            WorkflowError::BaseAdvanced { .. } => "base_advanced",
            WorkflowError::CheckpointBaseDiverged { .. } => "checkpoint_base_diverged",
            WorkflowError::TargetRewritten { .. } => "promote_target_rewritten",
            WorkflowError::NotFastForward { .. } => "promote_not_fast_forward",
            WorkflowError::PolicyFailed { .. } => "promote_policy_failed",
            WorkflowError::PromoteConflict { strategy, .. } => match strategy {
                Strategy::Rebase => "promote_rebase_conflict",
                Strategy::Squash => "promote_squash_conflict",
                Strategy::Merge => "promote_merge_conflict",
            },
            WorkflowError::RestackConflict { .. } => "restack_conflict",
            WorkflowError::MessageGeneration { .. } => "checkpoint_message_failed",
            WorkflowError::SuggestionNotFound(_) => "suggestion_not_found",
            WorkflowError::SuggestionNotPending { .. } => "suggestion_not_pending",
            WorkflowError::Internal(_) => "internal_error",
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            WorkflowError::Storage(e) if e.is_conflict() => ErrorKind::Divergence,
            WorkflowError::Storage(StorageError::RemoteNotFound(_)) => ErrorKind::Precondition,
            WorkflowError::Storage(_) => ErrorKind::Internal,
            WorkflowError::Agent(_) | WorkflowError::MessageGeneration { .. } => ErrorKind::External,
            WorkflowError::Policy(_)
            | WorkflowError::InvalidName(_)
            | WorkflowError::InvalidConfig { .. }
            | WorkflowError::InvalidStrategy(_)
            | WorkflowError::ConflictingFlags(_) => ErrorKind::Configuration,
            WorkflowError::Precondition { .. }
            | WorkflowError::PolicyFailed { .. }
            | WorkflowError::SuggestionNotFound(_)
            | WorkflowError::SuggestionNotPending { .. } => ErrorKind::Precondition,
            WorkflowError::WorkspaceDiverged { .. }
            | WorkflowError::BaseAdvanced { .. }
            | WorkflowError::CheckpointBaseDiverged { .. }
            | WorkflowError::TargetRewritten { .. }
            | WorkflowError::NotFastForward { .. } => ErrorKind::Divergence,
            WorkflowError::PromoteConflict { .. } | WorkflowError::RestackConflict { .. } => ErrorKind::Conflict,
            WorkflowError::Io(_) | WorkflowError::Serialization(_) | WorkflowError::Internal(_) => {
                ErrorKind::Internal
            }
        }
    }

    /// Remediation hints, most useful first.
    pub fn next_actions(&self) -> Vec<NextAction> {
        match self {
            WorkflowError::Storage(e) if e.is_conflict() => {
                vec![NextAction::new("merge", "wsync merge")]
            }
            WorkflowError::Storage(StorageError::RemoteNotFound(_)) => {
                vec![NextAction::new("add_remote", "git remote add origin <url>")]
            }
            WorkflowError::InvalidStrategy(_) => vec![NextAction::new(
                "set_strategy",
                "wsync promote --to <branch> --strategy rebase",
            )],
            WorkflowError::Precondition { next, .. } => next.clone(),
            WorkflowError::WorkspaceDiverged { .. } => vec![
                NextAction::new("merge", "wsync merge"),
                NextAction::new("restack", "wsync restack"),
            ],
            WorkflowError::BaseAdvanced { .. } => vec![
                NextAction::new("restack", "wsync restack"),
                NextAction::new("merge", "wsync merge"),
            ],
            WorkflowError::CheckpointBaseDiverged { .. } => {
                vec![NextAction::new("reset", "wsync restack")]
            }
            WorkflowError::TargetRewritten { target, .. } => vec![
                NextAction::new("restack", format!("wsync restack --onto {}", target)),
                NextAction::new(
                    "confirm_rewrite",
                    format!("wsync promote --to {} --confirm-rewrite", target),
                ),
            ],
            WorkflowError::NotFastForward { target, .. } => vec![
                NextAction::new("restack", format!("wsync restack --onto {}", target)),
                NextAction::new("force", format!("wsync promote --to {} --force", target)),
            ],
            WorkflowError::PolicyFailed { target, commit, .. } => vec![
                NextAction::new(
                    "rerun_ci",
                    format!("wsync attest --commit {} --status pass", commit),
                ),
                NextAction::new("bypass", format!("wsync promote --to {} --no-policy", target)),
            ],
            WorkflowError::PromoteConflict { target, .. } => vec![
                NextAction::new("restack", format!("wsync restack --onto {}", target)),
                NextAction::new("merge", "wsync merge"),
            ],
            WorkflowError::RestackConflict { .. } => vec![NextAction::new("merge", "wsync merge")],
            WorkflowError::MessageGeneration { .. } => vec![NextAction::new(
                "message",
                "wsync checkpoint -m \"<message>\"",
            )],
            WorkflowError::SuggestionNotFound(_) | WorkflowError::SuggestionNotPending { .. } => {
                vec![NextAction::new("list", "wsync suggestions --status pending")]
            }
            _ => Vec::new(),
        }
    }

    /// Check if re-running the same command may succeed.
    pub fn is_retriable(&self) -> bool {
        match self {
            WorkflowError::Storage(e) => e.is_retriable(),
            WorkflowError::Agent(e) => e.is_retriable(),
            _ => false,
        }
    }

    pub fn report(&self) -> ErrorReport {
        ErrorReport {
            code: self.code(),
            kind: self.kind(),
            message: self.to_string(),
            next_actions: self.next_actions(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sha(c: char) -> CommitId {
        CommitId::from_hex(&c.to_string().repeat(40)).unwrap()
    }

    #[test]
    fn test_codes_follow_operation() {
        let promote = WorkflowError::BaseAdvanced {
            operation: "promote",
            local_base: sha('a'),
            workspace_tip: sha('b'),
        };
        assert_eq!(promote.code(), "promote_base_advanced");
        assert_eq!(promote.kind(), ErrorKind::Divergence);

        let sync = WorkflowError::BaseAdvanced {
            operation: "sync",
            local_base: sha('a'),
            workspace_tip: sha('b'),
        };
        assert_eq!(sync.code(), "base_advanced");

        let diverged = WorkflowError::WorkspaceDiverged {
            operation: "promote",
            reason: "workspace lease missing".into(),
        };
        assert_eq!(diverged.code(), "promote_base_diverged");
    }

    #[test]
    fn test_conflict_codes_per_strategy() {
        for (strategy, code) in [
            (Strategy::Rebase, "promote_rebase_conflict"),
            (Strategy::Squash, "promote_squash_conflict"),
            (Strategy::Merge, "promote_merge_conflict"),
        ] {
            let err = WorkflowError::PromoteConflict {
                strategy,
                target: "main".into(),
                checkpoint: sha('c'),
                paths: vec![PathBuf::from("a.txt"), PathBuf::from("b.txt")],
            };
            assert_eq!(err.code(), code);
            assert_eq!(err.kind(), ErrorKind::Conflict);
            assert!(err.to_string().ends_with("a.txt, b.txt"));
        }
    }

    #[test]
    fn test_next_actions() {
        let err = WorkflowError::NotFastForward {
            target: "main".into(),
            previous: sha('a'),
            published: sha('b'),
        };
        let actions = err.next_actions();
        assert_eq!(actions[1].command, "wsync promote --to main --force");

        let pre = WorkflowError::precondition("no_checkpoint", "no checkpoint yet")
            .with_next(NextAction::new("checkpoint", "wsync checkpoint"));
        assert_eq!(pre.code(), "no_checkpoint");
        assert_eq!(pre.kind(), ErrorKind::Precondition);
        assert_eq!(pre.next_actions().len(), 1);
    }

    #[test]
    fn test_storage_conflict_is_divergence() {
        let err = WorkflowError::from(StorageError::ConcurrentModification {
            reference: "refs/wsync/workspaces/alice/@".into(),
        });
        assert_eq!(err.kind(), ErrorKind::Divergence);
        assert!(err.is_retriable());
        let report = err.report();
        assert_eq!(report.code, "concurrent_update");
        assert!(serde_json::to_string(&report).unwrap().contains("\"kind\":\"divergence\""));
    }
}
