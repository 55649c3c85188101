//! Accepting and declining pending suggestions.

use serde::Serialize;
use tracing::info;

use crate::engine::Engine;
use crate::error::{NextAction, WorkflowError, WorkflowResult};
use crate::metadata::{Suggestion, SuggestionStatus, SuggestionStore};
use crate::storage::{CommitId, TreeMerge};
use crate::workspace::state;

use super::{MERGE_CONFLICT_REASON, MERGE_REASON};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ApplyResult {
    pub suggestion: Suggestion,
    /// this device's draft after applying
    pub draft: CommitId,
    pub files_changed: Vec<String>,
}

impl<'a> Engine<'a> {
    /// Apply a pending suggestion.
    ///
    /// Merge suggestions are accepted exactly as [`Engine::merge`] would
    /// with `apply` set. Review suggestions are laid over the working tree
    /// as a three-way merge and synced; one made for an older base is
    /// refused unless `force` is set.
    pub fn apply_suggestion(&self, id: &str, force: bool) -> WorkflowResult<ApplyResult> {
        let suggestions = SuggestionStore::new(self.store());
        let suggestion = self.pending_suggestion(&suggestions, id)?;
        let base_tree = self.store().tree_of(suggestion.base_commit_sha)?;
        let suggested_tree = self.store().tree_of(suggestion.suggested_commit_sha)?;
        let files_changed = self
            .store()
            .diff_summary(Some(base_tree), suggested_tree)?
            .into_iter()
            .map(|c| c.path.display().to_string())
            .collect();

        let draft = if is_merge_suggestion(&suggestion) {
            // the merge only holds for the workspace it was computed against
            let workspace_tip = self.fetch_workspace()?;
            if workspace_tip != suggestion.workspace_tip {
                suggestions.set_status(id, SuggestionStatus::Stale, Some("workspace moved since the merge"))?;
                return Err(WorkflowError::precondition(
                    "suggestion_stale",
                    format!(
                        "workspace moved to {} since merge suggestion {} was made",
                        workspace_tip.map(|c| c.short()).unwrap_or_else(|| "none".into()),
                        id
                    ),
                )
                .with_next(NextAction::new("merge", "wsync merge")));
            }
            self.accept_merge(
                suggestion.suggested_commit_sha,
                suggestion.workspace_tip,
                suggestion.workspace_remote,
            )?;
            suggestion.suggested_commit_sha
        } else {
            let current_base = match self.state().lease()? {
                Some(lease) => state::draft_base(self.store(), lease)?,
                None => None,
            };
            if let Some(current) = current_base {
                if current != suggestion.base_commit_sha && !force {
                    return Err(WorkflowError::precondition(
                        "suggestion_stale",
                        format!(
                            "suggestion {} was made for {}, current base is {}",
                            id,
                            suggestion.base_commit_sha.short(),
                            current.short()
                        ),
                    )
                    .with_next(NextAction::new("force", format!("wsync apply {} --force", id))));
                }
            }
            let working = self.snapshot()?;
            match self.store().merge_trees(Some(base_tree), working, suggested_tree)? {
                TreeMerge::Clean(tree) => self.checkout_tree(tree)?,
                TreeMerge::Conflicted { paths } => {
                    let listed: Vec<String> = paths.iter().map(|p| p.display().to_string()).collect();
                    return Err(WorkflowError::precondition(
                        "suggestion_conflict",
                        format!("suggestion {} conflicts with local edits in {}", id, listed.join(", ")),
                    ));
                }
            }
            self.sync()?.draft
        };

        let suggestion = suggestions
            .set_status(id, SuggestionStatus::Applied, None)?
            .ok_or_else(|| WorkflowError::SuggestionNotFound(id.to_string()))?;
        info!(suggestion = id, draft = %draft.short(), "suggestion applied");
        Ok(ApplyResult {
            suggestion,
            draft,
            files_changed,
        })
    }

    /// Decline a pending suggestion. A reconciliation worktree is left
    /// where it is so a later merge can pick it up.
    pub fn reject_suggestion(&self, id: &str, reason: Option<&str>) -> WorkflowResult<Suggestion> {
        let suggestions = SuggestionStore::new(self.store());
        self.pending_suggestion(&suggestions, id)?;
        let suggestion = suggestions
            .set_status(id, SuggestionStatus::Rejected, reason)?
            .ok_or_else(|| WorkflowError::SuggestionNotFound(id.to_string()))?;
        info!(suggestion = id, "suggestion rejected");
        Ok(suggestion)
    }

    fn pending_suggestion(&self, suggestions: &SuggestionStore<'_>, id: &str) -> WorkflowResult<Suggestion> {
        let suggestion = suggestions
            .get(id)?
            .ok_or_else(|| WorkflowError::SuggestionNotFound(id.to_string()))?;
        if suggestion.status != SuggestionStatus::Pending {
            return Err(WorkflowError::SuggestionNotPending {
                id: id.to_string(),
                status: suggestion.status.as_str().to_string(),
            });
        }
        Ok(suggestion)
    }
}

fn is_merge_suggestion(suggestion: &Suggestion) -> bool {
    suggestion.reason == MERGE_CONFLICT_REASON || suggestion.reason == MERGE_REASON
}
