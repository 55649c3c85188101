//! Draft and checkpoint lifecycle.
//!
//! A device's working tree is mirrored into a draft on its sync ref by
//! [`Engine::sync`]. [`Engine::checkpoint`] turns the current snapshot into
//! an immutable checkpoint pinned by a keep ref and opens a fresh draft on
//! top of it. Every object is written before the first ref moves, so an
//! interrupted checkpoint leaves nothing visible behind.

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::agent::{AgentAction, AgentContext, AgentFile, AgentRequest};
use crate::engine::{anchor_mismatch, Engine};
use crate::error::{NextAction, WorkflowError, WorkflowResult};
use crate::identity::trailers::{self, CommitMessage, CHANGE_ID, TRACE_BASE, TRACE_HEAD};
use crate::identity::{refs, ChangeId};
use crate::metadata::{ChangeMetaStore, NewSuggestion, SuggestionStore};
use crate::storage::{CommitId, Expect, RefName, RefUpdate, TreeId};
use crate::workspace::ignore::SyncIgnore;
use crate::workspace::secrets;
use crate::workspace::state;
use crate::workspace::trace::{self, TraceKind};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncResult {
    pub draft: CommitId,
    pub tree: TreeId,
    pub change_id: ChangeId,
    pub parent: Option<CommitId>,
    /// false when the existing draft already matched
    pub created: bool,
    /// the workspace moved past this device's base and the draft was kept
    /// on the old one
    pub base_advanced: bool,
    pub fast_forwarded: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diverged: Option<String>,
    pub remote_pushed: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CheckpointResult {
    pub checkpoint: CommitId,
    pub draft: CommitId,
    pub change_id: ChangeId,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_base: Option<CommitId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_head: Option<CommitId>,
    pub keep_ref: String,
    pub remote_pushed: bool,
    /// ids of review suggestions recorded for the checkpoint
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub suggestions: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

/// Everything a checkpoint needs once its objects exist: the ref burst and
/// the remote values the pushes are leased against.
#[derive(Debug)]
pub(crate) struct CheckpointPlan {
    result: CheckpointResult,
    parent_tree: Option<TreeId>,
    tree: TreeId,
    updates: Vec<RefUpdate>,
    keep: RefName,
    change: RefName,
    anchor: RefName,
    workspace_remote: Option<CommitId>,
}

impl<'a> Engine<'a> {
    /// Mirror the working tree into this device's draft.
    ///
    /// Re-syncing an unchanged tree on an unchanged base returns the
    /// existing draft without writing anything.
    pub fn sync(&self) -> WorkflowResult<SyncResult> {
        let sync_ref = self.sync_ref()?;
        let workspace_ref = self.workspace_ref()?;
        let state = self.state();

        let workspace_tip = self.fetch_workspace()?;
        let alignment = state::check_alignment(self.store(), state.lease()?, workspace_tip)?;

        let existing = self.store().resolve_ref(sync_ref.as_str())?;
        let draft_parent = match existing {
            Some(sha) => self.draft_parent(sha)?,
            None => None,
        };
        let local_base = draft_parent.or(alignment.lease_base);
        let mut base_advanced = !alignment.is_diverged()
            && matches!((local_base, alignment.workspace_base), (Some(local), Some(ws)) if local != ws);

        let mut parent = match local_base.or(alignment.workspace_base) {
            Some(sha) => Some(sha),
            None => self.store().head_commit()?,
        };
        let named = match existing.or(workspace_tip) {
            Some(sha) => Some(sha),
            None => self.store().head_commit()?,
        };
        let change_id = self.resolve_change_id(&[named, parent], parent)?;

        let mut tree = self.snapshot()?;
        let mut fast_forwarded = false;
        if base_advanced {
            if let (Some(current), Some(target)) = (parent, alignment.workspace_base) {
                // nothing on top of the old base, so moving cannot lose work
                if self.store().tree_of(current)? == tree {
                    self.checkout(target)?;
                    state.write_lease(target)?;
                    self.move_head_branch(target)?;
                    parent = Some(target);
                    tree = self.snapshot()?;
                    base_advanced = false;
                    fast_forwarded = true;
                    info!(from = %current.short(), to = %target.short(), "fast-forwarded workspace");
                }
            }
        }

        let reusable = match existing {
            Some(sha) => self.is_reusable_draft(sha, parent, tree)?,
            None => false,
        };
        let (draft, created) = match existing {
            Some(sha) if reusable => (sha, false),
            _ => {
                let parents: Vec<CommitId> = parent.into_iter().collect();
                let draft = self
                    .store()
                    .create_commit(tree, &parents, &trailers::draft_message(&change_id))?;
                self.store()
                    .update_ref(&sync_ref, draft, Expect::from_option(existing), "wsync: sync")?;
                (draft, true)
            }
        };

        let mut warnings = Vec::new();
        let mut remote_pushed = false;
        if let Some(remote) = self.context().remote.as_deref() {
            if self.context().sync_drafts {
                remote_pushed = self.push_draft(remote, &sync_ref, parent, draft, &mut warnings)?;
            } else {
                warnings.push("draft sync disabled".to_string());
            }

            // publish a workspace ref the remote has never seen
            if self.context().sync_checkpoints && !alignment.is_diverged() && !base_advanced {
                let local = self.store().resolve_ref(workspace_ref.as_str())?;
                if local.is_some() && self.remote_value(&workspace_ref).is_none() {
                    if let Err(e) = self.push_leased(&workspace_ref, None) {
                        warn!(remote, error = %e, "workspace push failed");
                        warnings.push(format!("workspace push failed: {}", e));
                    }
                }
            }
        }

        if base_advanced {
            warnings.push("base advanced; run `wsync restack` or `wsync merge` to update".to_string());
        }
        let diverged = alignment
            .diverged
            .map(|reason| format!("{}; run `wsync checkout` to realign", reason));

        info!(
            draft = %draft.short(),
            change_id = change_id.short(),
            created,
            base_advanced,
            "synced workspace {}",
            self.context().workspace
        );
        Ok(SyncResult {
            draft,
            tree,
            change_id,
            parent,
            created,
            base_advanced,
            fast_forwarded,
            diverged,
            remote_pushed,
            warnings,
        })
    }

    /// Turn the current snapshot into a checkpoint. Without a message the
    /// agent is asked for one.
    pub fn checkpoint(&self, message: Option<&str>) -> WorkflowResult<CheckpointResult> {
        let plan = self.prepare_checkpoint(message)?;
        self.finish_checkpoint(plan)
    }

    /// Write every object a checkpoint needs without touching a ref.
    pub(crate) fn prepare_checkpoint(&self, message: Option<&str>) -> WorkflowResult<CheckpointPlan> {
        let sync_ref = self.sync_ref()?;
        let workspace_ref = self.workspace_ref()?;
        let trace_ref = self.trace_ref()?;

        let workspace_tip = self.fetch_workspace()?;
        let alignment = state::check_alignment(self.store(), self.state().lease()?, workspace_tip)?;
        if let Some(reason) = alignment.diverged {
            return Err(WorkflowError::WorkspaceDiverged {
                operation: "checkpoint",
                reason,
            });
        }
        if let (Some(local_base), Some(workspace_base)) = (alignment.lease_base, alignment.workspace_base) {
            if local_base != workspace_base {
                return Err(WorkflowError::BaseAdvanced {
                    operation: "checkpoint",
                    local_base,
                    workspace_tip: workspace_base,
                });
            }
        }

        let existing = self.store().resolve_ref(sync_ref.as_str())?;
        let mut parent = alignment.lease_base.or(alignment.workspace_base);
        if parent.is_none() {
            if let Some(draft) = existing {
                parent = self.draft_parent(draft)?;
            }
        }
        if parent.is_none() {
            parent = self.store().head_commit()?;
        }
        let change_id = self.resolve_change_id(&[existing, parent], parent)?;

        let tree = self.snapshot()?;
        let parent_tree = match parent {
            Some(sha) => Some(self.store().tree_of(sha)?),
            None => None,
        };
        let text = match message.map(str::trim).filter(|m| !m.is_empty()) {
            Some(text) => text.to_string(),
            None => self.generate_message(&change_id, parent_tree, tree)?,
        };

        let trace_tip = self.store().resolve_ref(trace_ref.as_str())?;
        let parents: Vec<CommitId> = trace_tip.into_iter().collect();
        let recorded = trace::record(self.store(), TraceKind::Checkpoint, tree, &parents)?;

        let mut message = CommitMessage::parse(&text);
        message.ensure(CHANGE_ID, change_id.as_str());
        message.set(TRACE_HEAD, recorded.head.to_string());
        match recorded.base {
            Some(base) => message.set(TRACE_BASE, base.to_string()),
            None => {
                message.remove(TRACE_BASE);
            }
        }
        let message = message.to_string();

        let parents: Vec<CommitId> = parent.into_iter().collect();
        let checkpoint = self.store().create_commit(tree, &parents, &message)?;
        let draft = self
            .store()
            .create_commit(tree, &[checkpoint], &trailers::draft_message(&change_id))?;

        self.fetch_change_refs(&change_id)?;
        let keep = self.keep_ref(&change_id, checkpoint)?;
        let change = refs::change_ref(&change_id)?;
        let anchor = refs::anchor_ref(&change_id)?;
        let mut updates = vec![
            RefUpdate::new(sync_ref, draft).expecting(Expect::from_option(existing)),
            RefUpdate::new(trace_ref, recorded.head).expecting(Expect::from_option(trace_tip)),
            RefUpdate::new(workspace_ref.clone(), checkpoint).expecting(Expect::from_option(workspace_tip)),
        ];
        if self.store().resolve_ref(anchor.as_str())?.is_none() {
            updates.push(RefUpdate::new(anchor.clone(), checkpoint).expecting(Expect::Absent));
        }
        updates.push(RefUpdate::new(keep.clone(), checkpoint));
        updates.push(RefUpdate::new(change.clone(), checkpoint));

        debug!(checkpoint = %checkpoint.short(), refs = updates.len(), "checkpoint objects written");
        Ok(CheckpointPlan {
            result: CheckpointResult {
                checkpoint,
                draft,
                change_id,
                message,
                trace_base: recorded.base,
                trace_head: Some(recorded.head),
                keep_ref: keep.as_str().to_string(),
                remote_pushed: false,
                suggestions: Vec::new(),
                warnings: Vec::new(),
            },
            parent_tree,
            tree,
            updates,
            keep,
            change,
            anchor,
            workspace_remote: self.remote_value(&workspace_ref),
        })
    }

    /// The ref burst, then lease, metadata, pushes and review.
    pub(crate) fn finish_checkpoint(&self, plan: CheckpointPlan) -> WorkflowResult<CheckpointResult> {
        let CheckpointPlan {
            mut result,
            parent_tree,
            tree,
            updates,
            keep,
            change,
            anchor,
            workspace_remote,
        } = plan;

        self.store().apply_ref_updates(&updates, "wsync: checkpoint")?;
        self.state().write_lease(result.checkpoint)?;
        self.move_head_branch(result.checkpoint)?;
        self.record_checkpoint_meta(&result.change_id, &anchor, result.checkpoint, &result.message)?;

        self.publish_checkpoint(&mut result, &keep, &change, &anchor, workspace_remote)?;
        result.suggestions = self.review_checkpoint(&result.change_id, result.checkpoint, parent_tree, tree);

        info!(
            checkpoint = %result.checkpoint.short(),
            change_id = result.change_id.short(),
            "checkpoint created"
        );
        Ok(result)
    }

    /// Adopt the commit at `HEAD` as a checkpoint of its change.
    pub fn adopt_checkpoint(&self) -> WorkflowResult<CheckpointResult> {
        let synced = self.sync()?;
        if let Some(reason) = synced.diverged {
            return Err(WorkflowError::WorkspaceDiverged {
                operation: "adopt",
                reason,
            });
        }

        let head = self.store().head_commit()?.ok_or_else(|| {
            WorkflowError::precondition("head_missing", "HEAD commit required to adopt a checkpoint")
        })?;
        let info = self.store().commit_info(head)?;
        if trailers::is_draft(&info.message) {
            return Err(WorkflowError::precondition(
                "draft_head",
                format!("cannot adopt draft commit {}", head.short()),
            )
            .with_next(NextAction::new("checkpoint", "wsync checkpoint -m \"<message>\"")));
        }
        let change_id = trailers::extract_change_id(&info.message).unwrap_or_else(|| ChangeId::fallback_for(head));

        let sync_ref = self.sync_ref()?;
        let workspace_ref = self.workspace_ref()?;
        let trace_ref = self.trace_ref()?;
        let workspace_tip = self.store().resolve_ref(workspace_ref.as_str())?;
        let workspace_remote = self.remote_value(&workspace_ref);

        let tree = self.snapshot()?;
        let trace_tip = self.store().resolve_ref(trace_ref.as_str())?;
        let parents: Vec<CommitId> = trace_tip.into_iter().collect();
        let recorded = trace::record(self.store(), TraceKind::Checkpoint, tree, &parents)?;
        let draft = self
            .store()
            .create_commit(tree, &[head], &trailers::draft_message(&change_id))?;

        self.fetch_change_refs(&change_id)?;
        let keep = self.keep_ref(&change_id, head)?;
        let change = refs::change_ref(&change_id)?;
        let anchor = refs::anchor_ref(&change_id)?;
        let mut updates = vec![
            RefUpdate::new(sync_ref, draft).expecting(Expect::Value(synced.draft)),
            RefUpdate::new(trace_ref, recorded.head).expecting(Expect::from_option(trace_tip)),
            RefUpdate::new(workspace_ref, head).expecting(Expect::from_option(workspace_tip)),
        ];
        if self.store().resolve_ref(anchor.as_str())?.is_none() {
            updates.push(RefUpdate::new(anchor.clone(), head).expecting(Expect::Absent));
        }
        updates.push(RefUpdate::new(keep.clone(), head));
        updates.push(RefUpdate::new(change.clone(), head));
        self.store().apply_ref_updates(&updates, "wsync: adopt checkpoint")?;
        self.state().write_lease(head)?;
        self.move_head_branch(head)?;
        self.record_checkpoint_meta(&change_id, &anchor, head, &info.message)?;

        let mut result = CheckpointResult {
            checkpoint: head,
            draft,
            change_id,
            message: info.message,
            trace_base: recorded.base,
            trace_head: Some(recorded.head),
            keep_ref: keep.as_str().to_string(),
            remote_pushed: false,
            suggestions: Vec::new(),
            warnings: synced.warnings,
        };
        self.publish_checkpoint(&mut result, &keep, &change, &anchor, workspace_remote)?;
        info!(checkpoint = %head.short(), change_id = result.change_id.short(), "adopted HEAD as checkpoint");
        Ok(result)
    }

    /// Realign this device with the published workspace: check out its
    /// tip, reset the lease and start a fresh draft.
    pub fn checkout_workspace(&self) -> WorkflowResult<SyncResult> {
        let tip = self.fetch_workspace()?.ok_or_else(|| {
            WorkflowError::precondition(
                "workspace_missing",
                format!(
                    "workspace {}/{} has no checkpoint yet",
                    self.context().user,
                    self.context().workspace
                ),
            )
            .with_next(NextAction::new("checkpoint", "wsync checkpoint -m \"<message>\""))
        })?;
        let base = state::draft_base(self.store(), tip)?.unwrap_or(tip);

        self.checkout(tip)?;
        self.state().write_lease(base)?;
        self.move_head_branch(base)?;
        // the old draft belongs to the abandoned base
        let sync_ref = self.sync_ref()?;
        self.store().delete_ref(&sync_ref)?;
        info!(base = %base.short(), "checked out workspace {}", self.context().workspace);
        self.sync()
    }

    // ==================== Helpers ====================

    /// first parent of a draft commit, `None` for anything else
    pub(crate) fn draft_parent(&self, sha: CommitId) -> WorkflowResult<Option<CommitId>> {
        let info = self.store().commit_info(sha)?;
        if trailers::is_draft(&info.message) {
            Ok(info.first_parent())
        } else {
            Ok(None)
        }
    }

    fn is_reusable_draft(&self, sha: CommitId, parent: Option<CommitId>, tree: TreeId) -> WorkflowResult<bool> {
        let info = self.store().commit_info(sha)?;
        Ok(trailers::is_draft(&info.message) && info.first_parent() == parent && info.tree_id == tree)
    }

    /// First Change-Id carried by `candidates`, else one derived from
    /// `parent`, else a fresh one.
    pub(crate) fn resolve_change_id(
        &self,
        candidates: &[Option<CommitId>],
        parent: Option<CommitId>,
    ) -> WorkflowResult<ChangeId> {
        for sha in candidates.iter().flatten() {
            let info = self.store().commit_info(*sha)?;
            if let Some(id) = trailers::extract_change_id(&info.message) {
                return Ok(id);
            }
        }
        Ok(match parent {
            Some(sha) => ChangeId::fallback_for(sha),
            None => ChangeId::generate(),
        })
    }

    fn generate_message(
        &self,
        change_id: &ChangeId,
        parent_tree: Option<TreeId>,
        tree: TreeId,
    ) -> WorkflowResult<String> {
        let Some(agent) = self.agent() else {
            return Err(WorkflowError::MessageGeneration {
                reason: "no message given and no agent configured".to_string(),
            });
        };
        let context = self.diff_context(change_id, None, parent_tree, tree)?;
        let request = AgentRequest::new(AgentAction::GenerateMessage, self.store().workdir(), context);
        let raw = agent
            .generate_message(&request)
            .map_err(|e| WorkflowError::MessageGeneration { reason: e.to_string() })?
            .ok_or_else(|| WorkflowError::MessageGeneration {
                reason: "agent returned no summary".to_string(),
            })?;
        trailers::sanitize_generated(&raw).ok_or_else(|| WorkflowError::MessageGeneration {
            reason: "agent summary only contained reserved trailers".to_string(),
        })
    }

    pub(crate) fn diff_context(
        &self,
        change_id: &ChangeId,
        checkpoint: Option<CommitId>,
        old: Option<TreeId>,
        new: TreeId,
    ) -> WorkflowResult<AgentContext> {
        let files = self
            .store()
            .diff_summary(old, new)?
            .into_iter()
            .map(|c| AgentFile {
                path: c.path.display().to_string(),
                content: String::new(),
            })
            .collect();
        Ok(AgentContext {
            checkpoint,
            change_id: Some(change_id.clone()),
            diff: self.store().diff_patch(old, new)?,
            files,
            ..Default::default()
        })
    }

    pub(crate) fn record_checkpoint_meta(
        &self,
        change_id: &ChangeId,
        anchor: &RefName,
        checkpoint: CommitId,
        message: &str,
    ) -> WorkflowResult<()> {
        let anchor_sha = self.store().resolve_ref(anchor.as_str())?.unwrap_or(checkpoint);
        let metas = ChangeMetaStore::new(self.store());
        let mut meta = metas.read_or_new(change_id, anchor_sha)?;
        meta.add_checkpoint(checkpoint, CommitMessage::parse(message).body.as_str());
        metas.write(&meta)?;
        Ok(())
    }

    /// Push the draft and, with checkpoint sync, the workspace, keep,
    /// change and anchor refs. A published anchor is never overwritten.
    fn publish_checkpoint(
        &self,
        result: &mut CheckpointResult,
        keep: &RefName,
        change: &RefName,
        anchor: &RefName,
        workspace_remote: Option<CommitId>,
    ) -> WorkflowResult<()> {
        let Some(remote) = self.context().remote.as_deref() else {
            return Ok(());
        };
        let sync_ref = self.sync_ref()?;
        if self.context().sync_drafts {
            result.remote_pushed =
                self.push_draft(remote, &sync_ref, Some(result.checkpoint), result.draft, &mut result.warnings)?;
        } else {
            result.warnings.push("draft sync disabled".to_string());
        }
        if !self.context().sync_checkpoints {
            return Ok(());
        }

        // the anchor is settled before anything is published
        let local_anchor = self.store().resolve_ref(anchor.as_str())?.ok_or_else(|| {
            WorkflowError::Internal(format!("anchor ref missing for change {}", result.change_id))
        })?;
        let remote_anchor = self.remote_value(anchor);
        if let Some(published) = remote_anchor {
            if published != local_anchor {
                return Err(anchor_mismatch(&result.change_id, published, local_anchor));
            }
        }

        let workspace_ref = self.workspace_ref()?;
        self.push_leased(&workspace_ref, workspace_remote)?;
        self.store().push_ref(remote, keep.as_str(), true)?;
        let change_remote = self.remote_value(change);
        self.push_leased(change, change_remote)?;
        if remote_anchor.is_none() {
            self.store().push_ref(remote, anchor.as_str(), false)?;
        }
        result.remote_pushed = true;
        Ok(())
    }

    /// Push this device's draft unless it adds something that looks like a
    /// credential. Refusals and push failures end up in `warnings`; the
    /// flag says whether the draft reached the remote.
    fn push_draft(
        &self,
        remote: &str,
        sync_ref: &RefName,
        base: Option<CommitId>,
        draft: CommitId,
        warnings: &mut Vec<String>,
    ) -> WorkflowResult<bool> {
        if !self.context().allow_secrets {
            let ignore = SyncIgnore::load(self.store().workdir());
            let base_tree = base.map(|c| self.store().tree_of(c)).transpose()?;
            let draft_tree = self.store().tree_of(draft)?;
            if let Some(path) = secrets::find_secret(self.store(), &ignore, base_tree, draft_tree)? {
                warn!(path = %path.display(), "draft push blocked by secret scan");
                warnings.push(format!(
                    "draft sync blocked: potential secret in {} (use --allow-secrets to override)",
                    path.display()
                ));
                return Ok(false);
            }
        }
        match self.store().push_ref(remote, sync_ref.as_str(), true) {
            Ok(()) => Ok(true),
            Err(e) => {
                warn!(remote, error = %e, "draft push failed");
                warnings.push(format!("draft push failed: {}", e));
                Ok(false)
            }
        }
    }

    /// Best-effort agent review; suggestions come back as pending
    /// [`crate::metadata::Suggestion`]s.
    fn review_checkpoint(
        &self,
        change_id: &ChangeId,
        checkpoint: CommitId,
        parent_tree: Option<TreeId>,
        tree: TreeId,
    ) -> Vec<String> {
        let Some(agent) = self.agent() else {
            return Vec::new();
        };
        let context = match self.diff_context(change_id, Some(checkpoint), parent_tree, tree) {
            Ok(context) => context,
            Err(e) => {
                warn!(error = %e, "review skipped");
                return Vec::new();
            }
        };
        let request = AgentRequest::new(AgentAction::Review, self.store().workdir(), context);
        let proposals = match agent.review(&request) {
            Ok(proposals) => proposals,
            Err(e) => {
                warn!(agent = agent.name(), error = %e, "review failed");
                return Vec::new();
            }
        };

        let suggestions = SuggestionStore::new(self.store());
        let mut created = Vec::new();
        for proposal in proposals {
            let Ok(suggested) = CommitId::from_hex(proposal.commit.trim()) else {
                warn!(commit = proposal.commit.as_str(), "ignoring suggestion with invalid commit");
                continue;
            };
            if suggested == checkpoint || self.store().commit_info(suggested).is_err() {
                continue;
            }
            let request = NewSuggestion {
                change_id: Some(change_id.clone()),
                base: Some(checkpoint),
                suggested: Some(suggested),
                created_by: agent.name().to_string(),
                reason: proposal.reason,
                description: proposal.description,
                confidence: proposal.confidence,
                ..Default::default()
            };
            match suggestions.create(request) {
                Ok(s) => created.push(s.suggestion_id),
                Err(e) => warn!(error = %e, "failed to record suggestion"),
            }
        }
        created
    }
}
