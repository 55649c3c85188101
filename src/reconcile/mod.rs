//! Reconciliation of diverging drafts.
//!
//! "Ours" is this device's draft; "theirs" is the workspace ref or another
//! device's draft. The two are merged three-way in a disposable worktree,
//! the agent gets a chance to resolve conflicts, and the result becomes a
//! pending suggestion that can be accepted on the spot or later through
//! [`Engine::apply_suggestion`].
//!
//! Unresolved conflicts are an ordinary [`MergeOutcome`], not an error.

pub mod resolve;
pub mod worktree;

use std::fs;
use std::path::PathBuf;

use serde::Serialize;
use tracing::{info, warn};

use crate::agent::{AgentAction, AgentFile, AgentRequest};
use crate::engine::Engine;
use crate::error::{NextAction, WorkflowError, WorkflowResult};
use crate::identity::{refs, trailers};
use crate::metadata::{NewSuggestion, SuggestionStatus, SuggestionStore};
use crate::storage::{CommitId, Expect, RefUpdate};

pub use resolve::ApplyResult;
pub use worktree::{MergeState, MergeWorktree};

/// Suggestion reasons written by reconciliation.
pub const MERGE_CONFLICT_REASON: &str = "merge_conflict";
pub const MERGE_REASON: &str = "merge";

/// agent payloads carry at most this much of each conflicted file
const MAX_FILE_CONTEXT: usize = 64 * 1024;

/// Where "theirs" comes from.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum MergeSource {
    /// the workspace ref (fetched first when there is a remote)
    #[default]
    Workspace,
    /// another device's draft of the same workspace
    Device(String),
}

#[derive(Debug, Clone, Default)]
pub struct MergeOptions {
    pub theirs: MergeSource,
    /// accept the result without asking
    pub apply: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum MergeOutcome {
    UpToDate,
    Resolved {
        merged: CommitId,
        base: CommitId,
        suggestion_id: String,
        /// paths that conflicted before resolution
        conflicts: Vec<PathBuf>,
        applied: bool,
    },
    Conflicts {
        paths: Vec<PathBuf>,
        worktree: PathBuf,
    },
}

impl MergeOutcome {
    pub fn next_actions(&self) -> Vec<NextAction> {
        match self {
            MergeOutcome::UpToDate => Vec::new(),
            MergeOutcome::Resolved {
                suggestion_id,
                applied: false,
                ..
            } => vec![
                NextAction::new("apply", format!("wsync apply {}", suggestion_id)),
                NextAction::new("reject", format!("wsync reject {}", suggestion_id)),
            ],
            MergeOutcome::Resolved { .. } => Vec::new(),
            MergeOutcome::Conflicts { worktree, .. } => vec![NextAction::new(
                "resolve",
                format!("edit files in {} then rerun `wsync merge`", worktree.display()),
            )],
        }
    }
}

impl<'a> Engine<'a> {
    /// Reconcile this device's draft with `options.theirs`.
    pub fn merge(&self, options: &MergeOptions) -> WorkflowResult<MergeOutcome> {
        let sync_ref = self.sync_ref()?;
        let workspace_ref = self.workspace_ref()?;
        let ours = self.store().resolve_ref(sync_ref.as_str())?.ok_or_else(|| {
            WorkflowError::precondition("sync_missing", "no draft for this device yet")
                .with_next(NextAction::new("sync", "wsync sync"))
        })?;
        // accepting later is keyed on these two values
        let workspace_tip = self.fetch_workspace()?;
        let workspace_remote = self.remote_value(&workspace_ref);
        let theirs = self.resolve_theirs(&options.theirs, workspace_tip)?;

        if ours == theirs || self.store().is_ancestor(theirs, ours)? {
            return Ok(MergeOutcome::UpToDate);
        }
        let base = self.store().merge_base(ours, theirs)?.ok_or_else(|| {
            WorkflowError::precondition(
                "no_merge_base",
                format!("{} and {} share no history", ours.short(), theirs.short()),
            )
        })?;

        for draft in [ours, theirs] {
            if let Some(parent) = self.draft_parent(draft)? {
                if parent != base {
                    return Err(WorkflowError::CheckpointBaseDiverged {
                        draft,
                        parent,
                        merge_base: base,
                    });
                }
            }
        }
        // a checkpoint on their side becomes the new base as-is
        let theirs_is_draft = self.draft_parent(theirs)?.is_some();
        let new_base = if theirs_is_draft { base } else { theirs };
        let change_id = self.resolve_change_id(&[Some(ours), Some(base)], Some(base))?;

        let worktree = MergeWorktree::new(self.store().workdir());
        let (state, reused) = worktree.prepare(self.store(), base, ours, theirs)?;
        let mut unresolved = worktree.unresolved(&state.conflicts)?;
        if !unresolved.is_empty() {
            if let Some(agent) = self.agent() {
                let mut context = self.diff_context(
                    &change_id,
                    Some(base),
                    Some(self.store().tree_of(ours)?),
                    self.store().tree_of(theirs)?,
                )?;
                context.files = unresolved
                    .iter()
                    .map(|path| {
                        let mut content = fs::read(worktree.path().join(path))?;
                        content.truncate(MAX_FILE_CONTEXT);
                        Ok(AgentFile {
                            path: path.display().to_string(),
                            content: String::from_utf8_lossy(&content).into_owned(),
                        })
                    })
                    .collect::<std::io::Result<Vec<_>>>()?;
                context.conflicts = unresolved.iter().map(|p| p.display().to_string()).collect();
                let request = AgentRequest::new(AgentAction::ResolveConflict, worktree.path(), context);
                match agent.resolve_conflicts(&request) {
                    Ok(()) => unresolved = worktree.unresolved(&state.conflicts)?,
                    Err(e) => warn!(agent = agent.name(), error = %e, "conflict resolution failed"),
                }
            }
        }
        if !unresolved.is_empty() {
            info!(conflicts = unresolved.len(), reused, "merge needs resolution");
            return Ok(MergeOutcome::Conflicts {
                paths: unresolved,
                worktree: worktree.path(),
            });
        }

        let tree = self.store().snapshot_dir(&worktree.path())?;
        let merged = self
            .store()
            .create_commit(tree, &[new_base], &trailers::draft_message(&change_id))?;
        let (reason, description) = if state.conflicts.is_empty() {
            (MERGE_REASON, "clean merge")
        } else {
            (MERGE_CONFLICT_REASON, "conflict resolution")
        };
        let suggestions = SuggestionStore::new(self.store());
        // an identical rerun lands on the same commit
        let pending = suggestions
            .list(Some(&change_id), Some(SuggestionStatus::Pending))?
            .into_iter()
            .find(|s| {
                s.suggested_commit_sha == merged
                    && s.workspace_tip == workspace_tip
                    && s.workspace_remote == workspace_remote
            });
        let suggestion = match pending {
            Some(suggestion) => suggestion,
            None => suggestions.create(NewSuggestion {
                change_id: Some(change_id),
                base: Some(base),
                suggested: Some(merged),
                created_by: self.agent().map(|a| a.name().to_string()).unwrap_or_else(|| "user".to_string()),
                reason: reason.to_string(),
                description: description.to_string(),
                confidence: 0.0,
                workspace_tip,
                workspace_remote,
            })?,
        };

        let applied = options.apply || self.context().auto_apply;
        if applied {
            self.accept_merge(merged, workspace_tip, workspace_remote)?;
            suggestions.set_status(&suggestion.suggestion_id, SuggestionStatus::Applied, Some("merge accepted"))?;
        }

        info!(
            merged = %merged.short(),
            base = %base.short(),
            suggestion = suggestion.suggestion_id.as_str(),
            applied,
            "merge resolved"
        );
        Ok(MergeOutcome::Resolved {
            merged,
            base,
            suggestion_id: suggestion.suggestion_id,
            conflicts: state.conflicts,
            applied,
        })
    }

    fn resolve_theirs(&self, source: &MergeSource, workspace_tip: Option<CommitId>) -> WorkflowResult<CommitId> {
        let (name, missing) = match source {
            MergeSource::Workspace => {
                return workspace_tip.ok_or_else(|| {
                    WorkflowError::precondition("workspace_missing", "workspace has no checkpoint to merge with")
                        .with_next(NextAction::new("checkpoint", "wsync checkpoint -m \"<message>\""))
                });
            }
            MergeSource::Device(device) => (
                refs::sync_ref(&self.context().user, device, &self.context().workspace)?,
                format!("no draft from device {}", device),
            ),
        };
        if let Some(remote) = self.context().remote.as_deref() {
            if let Err(e) = self.store().fetch_ref(remote, name.as_str(), name.as_str()) {
                warn!(remote, reference = name.as_str(), error = %e, "draft fetch failed");
            }
        }
        self.store()
            .resolve_ref(name.as_str())?
            .ok_or_else(|| WorkflowError::precondition("draft_missing", missing))
    }

    /// Adopt a merged draft: the sync ref takes it, the workspace ref and
    /// lease move to its parent, the working tree follows, and both refs
    /// are pushed. The local workspace ref must still be `workspace_tip`
    /// and the workspace push is refused if the remote no longer holds
    /// `workspace_remote`.
    pub(crate) fn accept_merge(
        &self,
        merged: CommitId,
        workspace_tip: Option<CommitId>,
        workspace_remote: Option<CommitId>,
    ) -> WorkflowResult<()> {
        let new_base = self
            .store()
            .commit_info(merged)?
            .first_parent()
            .ok_or_else(|| WorkflowError::Internal(format!("merged draft {} has no parent", merged)))?;
        let sync_ref = self.sync_ref()?;
        let workspace_ref = self.workspace_ref()?;
        let ours = self.store().resolve_ref(sync_ref.as_str())?;

        self.store().apply_ref_updates(
            &[
                RefUpdate::new(sync_ref.clone(), merged).expecting(Expect::from_option(ours)),
                RefUpdate::new(workspace_ref.clone(), new_base).expecting(Expect::from_option(workspace_tip)),
            ],
            "wsync: accept merge",
        )?;
        self.state().write_lease(new_base)?;
        self.checkout(merged)?;
        self.move_head_branch(new_base)?;

        if let Some(remote) = self.context().remote.as_deref() {
            if self.context().sync_drafts {
                self.store().push_ref(remote, sync_ref.as_str(), true)?;
            }
            if self.context().sync_checkpoints {
                self.push_leased(&workspace_ref, workspace_remote)?;
            }
        }
        MergeWorktree::new(self.store().workdir()).remove()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::ObjectStore;
    use crate::testing::{self, Device, ScriptedAgent};

    fn resolver() -> ScriptedAgent {
        ScriptedAgent {
            resolution: Some("merged\n".into()),
            ..Default::default()
        }
    }

    /// desktop and laptop both on checkpoint B, each with a draft editing
    /// `shared.txt`
    fn setup() -> (tempfile::TempDir, Device, Device) {
        let remote = testing::remote();
        let desktop = Device::new("desktop", Some(remote.path()));
        desktop.write("shared.txt", "base\n");
        desktop.engine().checkpoint(Some("base")).unwrap();

        let laptop = Device::clone_of("laptop", remote.path());
        laptop.engine().checkout_workspace().unwrap();

        desktop.write("shared.txt", "ours\n");
        desktop.engine().sync().unwrap();
        laptop.write("shared.txt", "theirs\n");
        laptop.engine().sync().unwrap();
        (remote, desktop, laptop)
    }

    fn from_laptop() -> MergeOptions {
        MergeOptions {
            theirs: MergeSource::Device("laptop".into()),
            apply: false,
        }
    }

    #[test]
    fn test_conflict_then_agent_resolution() {
        let (_remote, desktop, _laptop) = setup();

        let outcome = desktop.engine().merge(&from_laptop()).unwrap();
        let MergeOutcome::Conflicts { paths, worktree } = outcome else {
            panic!("expected conflicts, got {:?}", outcome);
        };
        assert_eq!(paths, vec![PathBuf::from("shared.txt")]);
        assert!(worktree.join("shared.txt").exists());

        let agent = resolver();
        let outcome = desktop.engine().with_agent(&agent).merge(&from_laptop()).unwrap();
        let MergeOutcome::Resolved {
            merged,
            suggestion_id,
            conflicts,
            applied,
            ..
        } = outcome
        else {
            panic!("expected resolution, got {:?}", outcome);
        };
        assert!(!applied);
        assert_eq!(conflicts, vec![PathBuf::from("shared.txt")]);
        assert_eq!(agent.calls.borrow().as_slice(), &[AgentAction::ResolveConflict]);
        assert_eq!(desktop.file_at(merged, "shared.txt").as_deref(), Some("merged\n"));

        let suggestions = SuggestionStore::new(&desktop.repo);
        let pending = suggestions.get(&suggestion_id).unwrap().unwrap();
        assert_eq!(pending.status, SuggestionStatus::Pending);
        assert_eq!(pending.reason, MERGE_CONFLICT_REASON);

        desktop.engine().apply_suggestion(&suggestion_id, false).unwrap();
        let sync = desktop.engine().sync_ref().unwrap();
        assert_eq!(desktop.resolve(sync.as_str()), Some(merged));
        assert_eq!(desktop.read("shared.txt"), "merged\n");
        let applied = suggestions.get(&suggestion_id).unwrap().unwrap();
        assert_eq!(applied.status, SuggestionStatus::Applied);
        assert!(!MergeWorktree::new(desktop.dir.path()).path().exists());

        // nothing left to reconcile on the next sync
        let synced = desktop.engine().sync().unwrap();
        assert!(!synced.base_advanced);
        assert_eq!(synced.draft, merged);
    }

    #[test]
    fn test_rerun_without_edits_reports_same_conflicts() {
        let (_remote, desktop, _laptop) = setup();
        let first = desktop.engine().merge(&from_laptop()).unwrap();
        let second = desktop.engine().merge(&from_laptop()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_reject_then_rerun() {
        let (_remote, desktop, _laptop) = setup();
        let agent = resolver();
        let first = desktop.engine().with_agent(&agent).merge(&from_laptop()).unwrap();
        let MergeOutcome::Resolved {
            suggestion_id,
            conflicts,
            ..
        } = first
        else {
            panic!("expected resolution");
        };

        let rejected = desktop
            .engine()
            .reject_suggestion(&suggestion_id, Some("not yet"))
            .unwrap();
        assert_eq!(rejected.status, SuggestionStatus::Rejected);
        let err = desktop.engine().reject_suggestion(&suggestion_id, None).unwrap_err();
        assert!(matches!(err, WorkflowError::SuggestionNotPending { .. }));

        // the worktree was kept, so the rerun needs no agent at all
        let rerun = desktop.engine().merge(&from_laptop()).unwrap();
        let MergeOutcome::Resolved {
            conflicts: again,
            suggestion_id: second_id,
            ..
        } = rerun
        else {
            panic!("expected resolution on rerun");
        };
        assert_eq!(again, conflicts);
        assert_ne!(second_id, suggestion_id);
    }

    #[test]
    fn test_apply_after_workspace_moved_is_refused() {
        let (_remote, desktop, laptop) = setup();
        let agent = resolver();
        let outcome = desktop.engine().with_agent(&agent).merge(&from_laptop()).unwrap();
        let MergeOutcome::Resolved { suggestion_id, .. } = outcome else {
            panic!("expected resolution");
        };

        let moved = laptop.engine().checkpoint(Some("laptop checkpoint")).unwrap().checkpoint;

        let err = desktop.engine().apply_suggestion(&suggestion_id, false).unwrap_err();
        assert!(matches!(err, WorkflowError::Precondition { code: "suggestion_stale", .. }));
        let stale = SuggestionStore::new(&desktop.repo).get(&suggestion_id).unwrap().unwrap();
        assert_eq!(stale.status, SuggestionStatus::Stale);

        // the laptop checkpoint is still what the remote holds
        let workspace = desktop.engine().workspace_ref().unwrap();
        assert_eq!(desktop.repo.remote_tip("origin", workspace.as_str()).unwrap(), Some(moved));
        assert_eq!(desktop.read("shared.txt"), "ours\n");
    }

    #[test]
    fn test_checkpoint_between_drafts_is_refused() {
        let (_remote, desktop, laptop) = setup();
        laptop.engine().checkpoint(Some("laptop checkpoint")).unwrap();
        laptop.write("shared.txt", "later\n");
        laptop.engine().sync().unwrap();

        let err = desktop.engine().merge(&from_laptop()).unwrap_err();
        assert!(matches!(err, WorkflowError::CheckpointBaseDiverged { .. }));
    }

    #[test]
    fn test_clean_merge_with_workspace_checkpoint() {
        let remote = testing::remote();
        let desktop = Device::new("desktop", Some(remote.path()));
        desktop.write("a.txt", "a\n");
        desktop.engine().checkpoint(Some("base")).unwrap();
        let laptop = Device::clone_of("laptop", remote.path());
        laptop.engine().checkout_workspace().unwrap();

        assert_eq!(desktop.engine().merge(&MergeOptions::default()).unwrap(), MergeOutcome::UpToDate);

        laptop.write("b.txt", "from laptop\n");
        let theirs = laptop.engine().checkpoint(Some("laptop")).unwrap();
        desktop.write("a.txt", "a edited\n");
        desktop.engine().sync().unwrap();

        let outcome = desktop
            .engine()
            .merge(&MergeOptions {
                theirs: MergeSource::Workspace,
                apply: true,
            })
            .unwrap();
        let MergeOutcome::Resolved { merged, applied, conflicts, .. } = outcome else {
            panic!("expected resolution");
        };
        assert!(applied);
        assert!(conflicts.is_empty());
        assert_eq!(desktop.repo.commit_info(merged).unwrap().first_parent(), Some(theirs.checkpoint));
        assert_eq!(desktop.engine().state().lease().unwrap(), Some(theirs.checkpoint));
        assert_eq!(desktop.read("a.txt"), "a edited\n");
        assert_eq!(desktop.read("b.txt"), "from laptop\n");

        let synced = desktop.engine().sync().unwrap();
        assert!(!synced.base_advanced);
        assert!(synced.diverged.is_none());
    }
}
