//! Publishing a change to a target branch.
//!
//! A promote takes the checkpoint chain of one change, builds the commits
//! the chosen [`Strategy`] publishes on top of the target tip, and moves
//! the target only when the result descends from every tip it replaces.
//! The workspace then continues from the published tip with a fresh draft
//! and a new Change-Id.
//!
//! A workspace stacked on other workspaces promotes them first, bottom up,
//! onto the same target with the same strategy.

pub mod strategy;

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::context::{WorkspaceContext, STATE_DIR};
use crate::engine::Engine;
use crate::error::{NextAction, WorkflowError, WorkflowResult};
use crate::identity::trailers::{self, CommitMessage};
use crate::identity::{refs, ChangeId};
use crate::metadata::{AttestationStore, ChangeIdNote, ChangeMetaStore, PromoteEvent, SuggestionStore};
use crate::policy::{gate, resolve_strategy, PolicyError, PromotePolicy, Strategy};
use crate::storage::{BranchName, CommitId, Expect, RefName, RefUpdate, TreeMerge};
use crate::workspace::{checkpoint_chain, state};

pub use strategy::{BuildOutcome, Built};

#[derive(Debug, Clone, Default)]
pub struct PromoteOptions {
    /// branch name, with or without `refs/heads/`
    pub target: String,
    pub strategy: Option<String>,
    /// checkpoint to promote; the latest one by default
    pub commit: Option<CommitId>,
    pub skip_policy: bool,
    /// publish even when the target would not fast-forward
    pub force: bool,
    /// publish onto a target rewritten since the last promote
    pub confirm_rewrite: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PromoteResult {
    pub workspace: String,
    pub target: String,
    pub strategy: Strategy,
    pub change_id: ChangeId,
    /// promoted checkpoints, oldest first
    pub checkpoints: Vec<CommitId>,
    pub published: Vec<CommitId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub merge_commit: Option<CommitId>,
    pub previous_tip: Option<CommitId>,
    pub event_id: usize,
    /// fresh draft on the published tip
    pub draft: CommitId,
    pub next_change_id: ChangeId,
    pub remote_pushed: bool,
    /// workspaces below this one promoted first, bottom up
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub stacked: Vec<PromoteResult>,
    pub warnings: Vec<String>,
}

impl PromoteResult {
    pub fn tip(&self) -> Option<CommitId> {
        self.published.last().copied()
    }
}

impl<'a> Engine<'a> {
    pub fn promote(&self, options: &PromoteOptions) -> WorkflowResult<PromoteResult> {
        let branch = BranchName::new(options.target.as_str())?;
        let state_dir = self.store().workdir().join(STATE_DIR);
        let policy = PromotePolicy::load(&state_dir, branch.as_str())?;
        let strategy = resolve_strategy(options.strategy.as_deref(), &policy).map_err(|e| match e {
            PolicyError::InvalidStrategy(raw) => WorkflowError::InvalidStrategy(raw),
            other => other.into(),
        })?;

        let mut stacked = Vec::new();
        for (user, workspace) in self.stack_below()? {
            let ctx = WorkspaceContext {
                user,
                workspace,
                ..self.context().clone()
            };
            let mut lower = Engine::new(self.store(), &ctx);
            if let Some(agent) = self.agent() {
                lower = lower.with_agent(agent);
            }
            let lower_options = PromoteOptions {
                commit: None,
                ..options.clone()
            };
            match lower.promote_workspace(&branch, strategy, &policy, &lower_options, false)? {
                Some(result) => stacked.push(result),
                None => debug!(workspace = ctx.workspace.as_str(), "nothing to promote below"),
            }
        }

        let mut result = self
            .promote_workspace(&branch, strategy, &policy, options, true)?
            .ok_or_else(|| {
                WorkflowError::precondition(
                    "nothing_to_promote",
                    format!("{} already contains the latest checkpoint", branch.as_str()),
                )
                .with_next(NextAction::new("checkpoint", "wsync checkpoint -m \"<message>\""))
            })?;
        result.stacked = stacked;
        Ok(result)
    }

    /// Promote this workspace alone. `None` when the target already holds
    /// the checkpoint. Only the top of a stack touches the working tree.
    fn promote_workspace(
        &self,
        branch: &BranchName,
        strategy: Strategy,
        policy: &PromotePolicy,
        options: &PromoteOptions,
        top: bool,
    ) -> WorkflowResult<Option<PromoteResult>> {
        let target = branch.to_ref_name()?;
        let workspace_ref = self.workspace_ref()?;
        let sync_ref = self.sync_ref()?;
        let state = self.state();

        let workspace_tip = self.fetch_workspace()?;
        let alignment = state::check_alignment(self.store(), state.lease()?, workspace_tip)?;
        if let Some(reason) = alignment.diverged {
            return Err(WorkflowError::WorkspaceDiverged {
                operation: "promote",
                reason,
            });
        }
        if let (Some(local_base), Some(workspace_base)) = (alignment.lease_base, alignment.workspace_base) {
            if local_base != workspace_base {
                return Err(WorkflowError::BaseAdvanced {
                    operation: "promote",
                    local_base,
                    workspace_tip: workspace_base,
                });
            }
        }
        let workspace_remote = self.remote_value(&workspace_ref);

        let commit = match options.commit.filter(|_| top) {
            Some(commit) => commit,
            None => alignment
                .lease_base
                .or(alignment.workspace_base)
                .ok_or_else(|| {
                    WorkflowError::precondition("checkpoint_required", "no checkpoint to promote yet")
                        .with_next(NextAction::new("checkpoint", "wsync checkpoint -m \"<message>\""))
                })?,
        };
        let info = self.store().commit_info(commit)?;
        if trailers::is_draft(&info.message) {
            return Err(WorkflowError::precondition(
                "draft_commit",
                format!("{} is a draft; checkpoint it first", commit.short()),
            )
            .with_next(NextAction::new("checkpoint", "wsync checkpoint -m \"<message>\"")));
        }
        let change_id = trailers::extract_change_id(&info.message).unwrap_or_else(|| ChangeId::fallback_for(commit));

        let remote_tip = self.fetch_target(branch)?;
        let local_tip = self.store().resolve_ref(target.as_str())?;
        let current = remote_tip.or(local_tip);
        if let Some(tip) = current {
            if tip == commit || self.store().is_ancestor(commit, tip)? {
                return Ok(None);
            }
        }

        let ctx = self.context();
        let chain = checkpoint_chain(self.store(), &ctx.user, &ctx.workspace, commit, &change_id)?;

        if !options.skip_policy {
            let view = AttestationStore::new(self.store()).view(commit)?;
            let pending = SuggestionStore::new(self.store()).pending_count(&change_id)?;
            if let Err(failures) = gate::enforce(policy, view.as_ref(), pending) {
                return Err(WorkflowError::PolicyFailed {
                    target: branch.as_str().to_string(),
                    commit,
                    failures,
                });
            }
        }

        let config = state.config()?;
        if let (Some(track_ref), Some(track_tip), Some(tip)) = (config.track_ref.as_deref(), config.track_tip, current) {
            if track_ref == target.as_str() && track_tip != tip && !options.confirm_rewrite {
                // a tip this clone no longer has cannot be an ancestor
                let descends = match self.store().is_ancestor(track_tip, tip) {
                    Ok(descends) => descends,
                    Err(e) if e.is_not_found() => false,
                    Err(e) => return Err(e.into()),
                };
                if !descends {
                    return Err(WorkflowError::TargetRewritten {
                        target: branch.as_str().to_string(),
                        track_tip,
                        remote_tip: tip,
                    });
                }
            }
        }

        let base_tip = match current {
            Some(tip) => tip,
            None => self.store().commit_info(chain[0])?.first_parent().ok_or_else(|| {
                WorkflowError::precondition(
                    "target_missing",
                    format!("{} does not exist and the change has no base", branch.as_str()),
                )
            })?,
        };
        let built = match strategy::build(self.store(), strategy, base_tip, &chain, &change_id)? {
            BuildOutcome::Built(built) => built,
            BuildOutcome::Conflict { checkpoint, paths } => {
                return Err(WorkflowError::PromoteConflict {
                    strategy,
                    target: branch.as_str().to_string(),
                    checkpoint,
                    paths,
                })
            }
        };
        let tip = built
            .tip()
            .ok_or_else(|| WorkflowError::Internal("promote built no commits".to_string()))?;

        if !options.force {
            for previous in [remote_tip, local_tip].into_iter().flatten() {
                if previous != tip && !self.store().is_ancestor(previous, tip)? {
                    return Err(WorkflowError::NotFastForward {
                        target: branch.as_str().to_string(),
                        previous,
                        published: tip,
                    });
                }
            }
        }

        // edits past the promoted checkpoint move onto the published tree
        let existing = self.store().resolve_ref(sync_ref.as_str())?;
        let working = if top {
            self.snapshot()?
        } else {
            match existing {
                Some(draft) => self.store().tree_of(draft)?,
                None => info.tree_id,
            }
        };
        let published_tree = self.store().tree_of(tip)?;
        let carried = if working == info.tree_id {
            published_tree
        } else {
            match self.store().merge_trees(Some(info.tree_id), published_tree, working)? {
                TreeMerge::Clean(tree) => tree,
                TreeMerge::Conflicted { paths } => {
                    let listed: Vec<String> = paths.iter().map(|p| p.display().to_string()).collect();
                    return Err(WorkflowError::precondition(
                        "local_edits_conflict",
                        format!("uncommitted edits in {} conflict with the published result", listed.join(", ")),
                    )
                    .with_next(NextAction::new("checkpoint", "wsync checkpoint -m \"<message>\"")));
                }
            }
        };

        let remote_pushed = self.publish_target(&target, tip, local_tip, remote_tip)?;
        let event_id = self.record_promote(branch, strategy, &change_id, &chain, &built)?;

        let next_change_id = ChangeId::generate();
        let draft = self
            .store()
            .create_commit(carried, &[tip], &trailers::draft_message(&next_change_id))?;
        self.store().apply_ref_updates(
            &[
                RefUpdate::new(sync_ref.clone(), draft).expecting(Expect::from_option(existing)),
                RefUpdate::new(workspace_ref.clone(), tip).expecting(Expect::from_option(workspace_tip)),
            ],
            "wsync: promote",
        )?;
        state.write_lease(tip)?;
        state.update_config(|config| {
            config.track_ref = Some(target.as_str().to_string());
            config.track_tip = Some(tip);
            if config.base_ref.is_none() || config.base_ref.as_deref() == Some(target.as_str()) {
                config.base_ref = Some(target.as_str().to_string());
                config.base_sha = Some(tip);
            }
        })?;
        if top {
            self.checkout_tree(carried)?;
            self.move_head_branch(tip)?;
        }

        let mut warnings = Vec::new();
        if let Some(remote) = ctx.pushes_checkpoints() {
            if let Err(e) = self.push_leased(&workspace_ref, workspace_remote) {
                warn!(remote, error = %e, "workspace push failed");
                warnings.push(format!("workspace push failed: {}", e));
            }
        }
        if let Some(remote) = ctx.pushes_drafts() {
            if let Err(e) = self.store().push_ref(remote, sync_ref.as_str(), true) {
                warn!(remote, error = %e, "draft push failed");
                warnings.push(format!("draft push failed: {}", e));
            }
        }

        info!(
            target = branch.as_str(),
            strategy = strategy.as_str(),
            published = built.published.len(),
            tip = %tip.short(),
            "promoted {}",
            change_id.short()
        );
        Ok(Some(PromoteResult {
            workspace: ctx.workspace.clone(),
            target: target.as_str().to_string(),
            strategy,
            change_id,
            checkpoints: chain,
            published: built.published,
            merge_commit: built.merge_commit,
            previous_tip: current,
            event_id,
            draft,
            next_change_id,
            remote_pushed,
            stacked: Vec::new(),
            warnings,
        }))
    }

    /// Fetch the target into its remote-tracking ref and return the remote
    /// tip. A failed fetch falls back to the last tracked value.
    pub(crate) fn fetch_target(&self, branch: &BranchName) -> WorkflowResult<Option<CommitId>> {
        let Some(remote) = self.context().remote.as_deref() else {
            return Ok(None);
        };
        let tracking = RefName::new(format!("refs/remotes/{}/{}", remote, branch.as_str()))?;
        match self.store().fetch_ref(remote, &branch.as_ref_path(), tracking.as_str()) {
            Ok(tip) => Ok(tip),
            Err(e) => {
                warn!(remote, target = branch.as_str(), error = %e, "target fetch failed");
                Ok(self.store().resolve_ref(tracking.as_str())?)
            }
        }
    }

    /// Move the local target and push it under a lease on the fetched tip.
    /// A rejected push puts the local target back.
    fn publish_target(
        &self,
        target: &RefName,
        tip: CommitId,
        local_tip: Option<CommitId>,
        remote_tip: Option<CommitId>,
    ) -> WorkflowResult<bool> {
        self.store()
            .update_ref(target, tip, Expect::from_option(local_tip), "wsync: promote")?;
        let Some(remote) = self.context().remote.as_deref() else {
            return Ok(false);
        };
        if let Err(e) = self.store().push_with_lease(remote, target.as_str(), remote_tip) {
            let restored = match local_tip {
                Some(previous) => self
                    .store()
                    .update_ref(target, previous, Expect::Value(tip), "wsync: promote rollback"),
                None => self.store().delete_ref(target).map(|_| ()),
            };
            if let Err(rollback) = restored {
                warn!(target = target.as_str(), error = %rollback, "failed to restore target after rejected push");
            }
            return Err(e.into());
        }
        Ok(true)
    }

    /// Append the promote event to the change's metadata and note every
    /// published commit. Returns the event id.
    fn record_promote(
        &self,
        branch: &BranchName,
        strategy: Strategy,
        change_id: &ChangeId,
        chain: &[CommitId],
        built: &Built,
    ) -> WorkflowResult<usize> {
        let anchor = refs::anchor_ref(change_id)?;
        let anchor_sha = match self.store().resolve_ref(anchor.as_str())? {
            Some(sha) => sha,
            None => chain[0],
        };
        let metas = ChangeMetaStore::new(self.store());
        let mut meta = metas.read_or_new(change_id, anchor_sha)?;
        let mut messages = Vec::with_capacity(chain.len());
        for &checkpoint in chain {
            let message = CommitMessage::parse(&self.store().commit_info(checkpoint)?.message);
            meta.add_checkpoint(checkpoint, &message.body);
            messages.push(message);
        }
        let event_id = meta.push_event(PromoteEvent {
            target: branch.as_str().to_string(),
            strategy,
            timestamp: Utc::now(),
            checkpoint_shas: chain.to_vec(),
            published_shas: built.published.clone(),
            merge_commit_sha: built.merge_commit,
        });
        metas.write(&meta)?;

        for (i, &published) in built.published.iter().enumerate() {
            let note = match strategy {
                Strategy::Rebase => ChangeIdNote {
                    change_id: change_id.clone(),
                    promote_event_id: event_id,
                    strategy,
                    source_checkpoint_sha: chain.get(i).copied(),
                    checkpoint_shas: Vec::new(),
                    trace_base: messages.get(i).and_then(|m| m.trace_base()),
                    trace_head: messages.get(i).and_then(|m| m.trace_head()),
                },
                Strategy::Squash | Strategy::Merge => ChangeIdNote {
                    change_id: change_id.clone(),
                    promote_event_id: event_id,
                    strategy,
                    source_checkpoint_sha: None,
                    checkpoint_shas: chain.to_vec(),
                    trace_base: messages.first().and_then(|m| m.trace_base()),
                    trace_head: messages.last().and_then(|m| m.trace_head()),
                },
            };
            metas.write_change_id_note(published, &note)?;
        }
        Ok(event_id)
    }
}
