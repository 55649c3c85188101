//! Restack: move a change's checkpoints onto a newer base.
//!
//! Every checkpoint of the current change is replayed, oldest first, onto
//! the tip of the base it should now sit on. The rewritten checkpoints get
//! their own keep refs and a `[trace] restack` record joining the new trace
//! line to the old one; the old checkpoints stay pinned until retention
//! pruning drops them.

pub mod prune;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::engine::Engine;
use crate::error::{NextAction, WorkflowError, WorkflowResult};
use crate::identity::trailers::{self, CommitMessage, TRACE_BASE, TRACE_HEAD};
use crate::identity::{refs, ChangeId, RefKind};
use crate::metadata::AttestationStore;
use crate::promote::strategy::replay_tree;
use crate::storage::{BranchName, CommitId, Expect, RefName, RefUpdate, TreeMerge};
use crate::workspace::trace::{self, TraceKind};
use crate::workspace::{checkpoint_chain, latest_for_change, state};

pub use prune::PruneResult;

const DEFAULT_BRANCHES: [&str; 2] = ["refs/heads/main", "refs/heads/master"];

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RestackResult {
    /// the ref the change now sits on
    pub onto: String,
    pub base_tip: CommitId,
    pub change_id: ChangeId,
    /// rewritten checkpoints, oldest first
    pub checkpoints: Vec<CommitId>,
    /// the checkpoints they replace
    pub previous: Vec<CommitId>,
    pub draft: CommitId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_head: Option<CommitId>,
    pub remote_pushed: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

impl RestackResult {
    pub fn tip(&self) -> Option<CommitId> {
        self.checkpoints.last().copied()
    }
}

/// One rewritten checkpoint, written but not yet pinned.
struct Rewritten {
    checkpoint: CommitId,
    message: String,
    keep: RefName,
    /// checkpoint whose CI result the rewrite carries
    inherits: Option<CommitId>,
}

impl<'a> Engine<'a> {
    /// Replay the current change onto `onto`: a branch name, a full ref, a
    /// workspace ref (its checkpoint is used, not its draft) or a change
    /// ref. Without one the recorded base ref is used, then the default
    /// branch.
    ///
    /// Uncommitted edits ride along into the new draft.
    pub fn restack(&self, onto: Option<&str>) -> WorkflowResult<RestackResult> {
        let onto = self.restack_target(onto)?;
        let base_tip = self.resolve_base(&onto)?;

        let synced = self.sync()?;
        if let Some(reason) = synced.diverged {
            return Err(WorkflowError::WorkspaceDiverged {
                operation: "restack",
                reason,
            });
        }
        let change_id = synced.change_id.clone();
        let workspace_ref = self.workspace_ref()?;
        let sync_ref = self.sync_ref()?;
        let trace_ref = self.trace_ref()?;
        let workspace_tip = self.store().resolve_ref(workspace_ref.as_str())?;
        let workspace_remote = self.remote_value(&workspace_ref);
        let preferred = match workspace_tip {
            Some(tip) => state::draft_base(self.store(), tip)?,
            None => None,
        };

        let ctx = self.context();
        let latest = latest_for_change(self.store(), &ctx.user, &ctx.workspace, &change_id, preferred)?
            .ok_or_else(|| {
                WorkflowError::precondition("checkpoint_required", "checkpoint required before restack")
                    .with_next(NextAction::new("checkpoint", "wsync checkpoint -m \"<message>\""))
            })?;
        let chain = checkpoint_chain(self.store(), &ctx.user, &ctx.workspace, latest, &change_id)?;
        if chain.contains(&base_tip) || self.store().is_ancestor(latest, base_tip)? {
            return Err(WorkflowError::precondition(
                "base_contains_change",
                format!("{} already contains checkpoint {}", onto.as_str(), latest.short()),
            )
            .with_next(NextAction::new("checkout", "wsync checkout")));
        }

        // every object first; refs move in one burst below
        let attestations = AttestationStore::new(self.store());
        let mut parent = base_tip;
        let mut prev_trace: Option<CommitId> = None;
        let mut last_attested: Option<CommitId> = None;
        let mut rewritten: Vec<Rewritten> = Vec::with_capacity(chain.len());
        for (i, &old) in chain.iter().enumerate() {
            if let Some(att) = attestations.get(old)? {
                if !att.status.is_empty() {
                    last_attested = Some(old);
                } else if let Some(from) = att.inherit_from {
                    if attestations.get(from)?.is_some_and(|a| !a.status.is_empty()) {
                        last_attested = Some(from);
                    }
                }
            }

            let tree = match replay_tree(self.store(), self.store().tree_of(parent)?, old)? {
                TreeMerge::Clean(tree) => tree,
                TreeMerge::Conflicted { paths } => {
                    return Err(WorkflowError::RestackConflict {
                        onto: onto.as_str().to_string(),
                        checkpoint: old,
                        paths,
                    })
                }
            };

            let mut message = CommitMessage::parse(&self.store().commit_info(old)?.message);
            let old_head = message.trace_head();
            if i == 0 {
                prev_trace = message.trace_base();
            }
            let parents: Vec<CommitId> = prev_trace.into_iter().chain(old_head).collect();
            let recorded = trace::record(self.store(), TraceKind::Restack, tree, &parents)?;
            message.remove(TRACE_HEAD);
            message.remove(TRACE_BASE);
            if let Some(base) = prev_trace {
                message.set(TRACE_BASE, base.to_string());
            }
            message.set(TRACE_HEAD, recorded.head.to_string());
            let message = message.to_string();

            let checkpoint = self.store().create_commit(tree, &[parent], &message)?;
            debug!(old = %old.short(), new = %checkpoint.short(), "checkpoint replayed");
            rewritten.push(Rewritten {
                checkpoint,
                message,
                keep: self.keep_ref(&change_id, checkpoint)?,
                inherits: last_attested,
            });
            parent = checkpoint;
            prev_trace = Some(recorded.head);
        }
        let tip = parent;
        let old_tip = latest;

        let old_tree = self.store().tree_of(old_tip)?;
        let new_tree = self.store().tree_of(tip)?;
        let carried = if synced.tree == old_tree {
            new_tree
        } else {
            match self.store().merge_trees(Some(old_tree), new_tree, synced.tree)? {
                TreeMerge::Clean(tree) => tree,
                TreeMerge::Conflicted { paths } => {
                    return Err(WorkflowError::RestackConflict {
                        onto: onto.as_str().to_string(),
                        checkpoint: synced.draft,
                        paths,
                    })
                }
            }
        };
        let draft = self
            .store()
            .create_commit(carried, &[tip], &trailers::draft_message(&change_id))?;

        self.fetch_change_refs(&change_id)?;
        let change = refs::change_ref(&change_id)?;
        let anchor = refs::anchor_ref(&change_id)?;
        let mut updates = vec![
            RefUpdate::new(sync_ref.clone(), draft).expecting(Expect::Value(synced.draft)),
            RefUpdate::new(workspace_ref.clone(), tip).expecting(Expect::from_option(workspace_tip)),
        ];
        if self.store().resolve_ref(anchor.as_str())?.is_none() {
            updates.push(RefUpdate::new(anchor.clone(), rewritten[0].checkpoint).expecting(Expect::Absent));
        }
        // only a trace ref still ending at the old chain is moved
        let trace_tip = self.store().resolve_ref(trace_ref.as_str())?;
        let old_trace_head = CommitMessage::parse(&self.store().commit_info(old_tip)?.message).trace_head();
        if let Some(head) = prev_trace.filter(|_| trace_tip.is_none() || trace_tip == old_trace_head) {
            updates.push(RefUpdate::new(trace_ref, head).expecting(Expect::from_option(trace_tip)));
        }
        updates.extend(
            rewritten
                .iter()
                .map(|r| RefUpdate::new(r.keep.clone(), r.checkpoint).expecting(Expect::Absent)),
        );
        updates.push(RefUpdate::new(change.clone(), tip));
        self.store().apply_ref_updates(&updates, "wsync: restack")?;

        self.state().write_lease(tip)?;
        let branch_base = onto.as_str().starts_with("refs/heads/");
        self.state().update_config(|config| {
            config.base_ref = Some(onto.as_str().to_string());
            config.base_sha = Some(base_tip);
            if branch_base {
                config.track_ref = Some(onto.as_str().to_string());
                config.track_tip = Some(base_tip);
            } else {
                config.track_ref = None;
                config.track_tip = None;
            }
        })?;
        for r in &rewritten {
            self.record_checkpoint_meta(&change_id, &anchor, r.checkpoint, &r.message)?;
            if let Some(from) = r.inherits {
                attestations.record_inheritance(r.checkpoint, from)?;
            }
        }
        self.checkout_tree(carried)?;
        self.move_head_branch(tip)?;

        let mut warnings = synced.warnings;
        let remote_pushed = self.publish_restack(&rewritten, &change, &anchor, workspace_remote, &mut warnings);

        info!(
            onto = onto.as_str(),
            checkpoints = rewritten.len(),
            tip = %tip.short(),
            "restacked {}",
            change_id.short()
        );
        Ok(RestackResult {
            onto: onto.as_str().to_string(),
            base_tip,
            change_id,
            checkpoints: rewritten.iter().map(|r| r.checkpoint).collect(),
            previous: chain,
            draft,
            trace_head: prev_trace,
            remote_pushed,
            warnings,
        })
    }

    /// Full name of the ref to restack onto.
    fn restack_target(&self, explicit: Option<&str>) -> WorkflowResult<RefName> {
        if let Some(raw) = explicit.map(str::trim).filter(|s| !s.is_empty()) {
            if raw.starts_with("refs/") {
                return Ok(RefName::new(raw)?);
            }
            return Ok(BranchName::new(raw)?.to_ref_name()?);
        }
        if let Some(base_ref) = self.state().config()?.base_ref {
            return Ok(RefName::new(base_ref)?);
        }
        for candidate in DEFAULT_BRANCHES {
            if self.store().resolve_ref(candidate)?.is_some() {
                return Ok(RefName::new(candidate)?);
            }
        }
        Err(WorkflowError::precondition(
            "base_ref_missing",
            "no base ref recorded and no default branch found",
        )
        .with_next(NextAction::new("restack", "wsync restack --onto <branch>")))
    }

    /// Tip a change restacked onto `onto` sits on.
    fn resolve_base(&self, onto: &RefName) -> WorkflowResult<CommitId> {
        let tip = match RefKind::parse(onto.as_str()) {
            Some(RefKind::Workspace { user, workspace }) => {
                if user == self.context().user && workspace == self.context().workspace {
                    return Err(WorkflowError::ConflictingFlags(format!(
                        "cannot restack workspace {} onto itself",
                        workspace
                    )));
                }
                match self.store().resolve_ref(onto.as_str())? {
                    Some(tip) => state::draft_base(self.store(), tip)?,
                    None => None,
                }
            }
            Some(_) => self.store().resolve_ref(onto.as_str())?,
            None => match onto.as_str().strip_prefix("refs/heads/") {
                Some(branch) if self.context().remote.is_some() => {
                    let fetched = self.fetch_target(&BranchName::new(branch)?)?;
                    match fetched {
                        Some(tip) => Some(tip),
                        None => self.store().resolve_ref(onto.as_str())?,
                    }
                }
                _ => self.store().resolve_ref(onto.as_str())?,
            },
        };
        tip.ok_or_else(|| {
            WorkflowError::precondition("base_ref_missing", format!("base ref {} does not resolve", onto.as_str()))
        })
    }

    /// Push the rewritten state; failures only produce warnings since every
    /// local ref has already moved.
    fn publish_restack(
        &self,
        rewritten: &[Rewritten],
        change: &RefName,
        anchor: &RefName,
        workspace_remote: Option<CommitId>,
        warnings: &mut Vec<String>,
    ) -> bool {
        let Some(remote) = self.context().remote.as_deref() else {
            return false;
        };
        let mut failures: Vec<String> = Vec::new();
        if self.context().sync_drafts {
            match self.sync_ref() {
                Ok(sync_ref) => {
                    if let Err(e) = self.store().push_ref(remote, sync_ref.as_str(), true) {
                        failures.push(format!("draft push failed: {}", e));
                    }
                }
                Err(e) => failures.push(e.to_string()),
            }
        }
        if self.context().sync_checkpoints {
            match self.workspace_ref() {
                Ok(workspace_ref) => {
                    if let Err(e) = self.push_leased(&workspace_ref, workspace_remote) {
                        failures.push(format!("workspace push failed: {}", e));
                    }
                }
                Err(e) => failures.push(e.to_string()),
            }
            for r in rewritten {
                if let Err(e) = self.store().push_ref(remote, r.keep.as_str(), true) {
                    failures.push(format!("keep ref push failed: {}", e));
                }
            }
            let change_remote = self.remote_value(change);
            if let Err(e) = self.push_leased(change, change_remote) {
                failures.push(format!("change ref push failed: {}", e));
            }
            if self.remote_value(anchor).is_none() {
                if let Err(e) = self.store().push_ref(remote, anchor.as_str(), false) {
                    failures.push(format!("anchor push failed: {}", e));
                }
            }
        }
        for failure in &failures {
            warn!(remote, "{}", failure);
        }
        let pushed = failures.is_empty();
        warnings.extend(failures);
        pushed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::WorkspaceContext;
    use crate::metadata::AttestationInput;
    use crate::storage::ObjectStore;
    use crate::testing::{Device, MAIN};
    use std::fs;
    use std::path::PathBuf;

    fn setup() -> Device {
        Device::new("desktop", None)
    }

    fn advance_main(device: &Device, path: &str, content: &str) -> CommitId {
        let tip = device.resolve(MAIN).unwrap();
        let scratch = tempfile::TempDir::new().unwrap();
        device.repo.materialize_tree(device.repo.tree_of(tip).unwrap(), scratch.path()).unwrap();
        fs::write(scratch.path().join(path), content).unwrap();
        let tree = device.repo.snapshot_dir(scratch.path()).unwrap();
        let commit = device.repo.create_commit(tree, &[tip], "upstream\n").unwrap();
        let main = RefName::new(MAIN).unwrap();
        device.repo.update_ref(&main, commit, Expect::Value(tip), "test").unwrap();
        commit
    }

    #[test]
    fn test_restack_onto_advanced_main() {
        let device = setup();
        device.write("a.txt", "one\n");
        let first = device.engine().checkpoint(Some("first")).unwrap();
        device.write("b.txt", "two\n");
        let second = device.engine().checkpoint(Some("second")).unwrap();
        device.write("scratch.txt", "wip\n");
        let upstream = advance_main(&device, "upstream.txt", "up\n");

        let result = device.engine().restack(None).unwrap();
        assert_eq!(result.onto, MAIN);
        assert_eq!(result.base_tip, upstream);
        assert_eq!(result.previous, vec![first.checkpoint, second.checkpoint]);
        assert_eq!(result.checkpoints.len(), 2);
        assert_eq!(result.change_id, first.change_id);

        let tip = result.tip().unwrap();
        let new_first = device.repo.commit_info(result.checkpoints[0]).unwrap();
        assert_eq!(new_first.parent_ids, vec![upstream]);
        assert_eq!(device.repo.commit_info(tip).unwrap().parent_ids, vec![result.checkpoints[0]]);
        assert_eq!(device.file_at(tip, "upstream.txt").as_deref(), Some("up\n"));
        assert_eq!(device.file_at(tip, "b.txt").as_deref(), Some("two\n"));
        assert_eq!(trailers::extract_change_id(&new_first.message), Some(first.change_id.clone()));

        // provenance: the first rewrite keeps the original Trace-Base
        let message = CommitMessage::parse(&new_first.message);
        assert_eq!(message.trace_base(), first.trace_base);
        let trace_commit = device.repo.commit_info(message.trace_head().unwrap()).unwrap();
        assert!(trace::is_trace(&trace_commit.message));
        assert!(trace_commit.parent_ids.contains(&first.trace_head.unwrap()));
        let second_message = CommitMessage::parse(&device.repo.commit_info(tip).unwrap().message);
        assert_eq!(second_message.trace_base(), message.trace_head());
        assert_eq!(device.resolve("refs/wsync/traces/alice/@"), result.trace_head);

        // old checkpoints stay pinned next to the new ones
        for sha in result.previous.iter().chain(&result.checkpoints) {
            let keep = refs::keep_ref("alice", "@", &result.change_id, *sha).unwrap();
            assert_eq!(device.resolve(keep.as_str()), Some(*sha));
        }
        assert_eq!(device.resolve("refs/wsync/workspaces/alice/@"), Some(tip));
        assert_eq!(device.resolve("refs/wsync/sync/alice/desktop/@"), Some(result.draft));
        assert_eq!(device.engine().state().lease().unwrap(), Some(tip));
        assert_eq!(device.read("scratch.txt"), "wip\n");
        assert_eq!(device.read("upstream.txt"), "up\n");
        let config = device.engine().state().config().unwrap();
        assert_eq!(config.base_ref.as_deref(), Some(MAIN));
        assert_eq!(config.track_tip, Some(upstream));

        // and the change can be checkpointed and promoted from there
        device.write("c.txt", "three\n");
        let third = device.engine().checkpoint(Some("third")).unwrap();
        assert_eq!(device.repo.commit_info(third.checkpoint).unwrap().parent_ids, vec![tip]);
    }

    #[test]
    fn test_restack_conflict_moves_nothing() {
        let device = setup();
        device.write("README.md", "mine\n");
        device.engine().checkpoint(Some("edit readme")).unwrap();
        advance_main(&device, "README.md", "theirs\n");
        let before = device.resolve("refs/wsync/workspaces/alice/@");
        let draft = device.resolve("refs/wsync/sync/alice/desktop/@");

        let err = device.engine().restack(Some("main")).unwrap_err();
        assert!(matches!(err, WorkflowError::RestackConflict { ref paths, .. } if paths == &[PathBuf::from("README.md")]));
        assert_eq!(err.code(), "restack_conflict");
        assert_eq!(device.resolve("refs/wsync/workspaces/alice/@"), before);
        assert_eq!(device.resolve("refs/wsync/sync/alice/desktop/@"), draft);
        assert_eq!(device.read("README.md"), "mine\n");
    }

    #[test]
    fn test_restack_requires_checkpoint() {
        let device = setup();
        advance_main(&device, "upstream.txt", "up\n");
        let err = device.engine().restack(None).unwrap_err();
        assert!(matches!(err, WorkflowError::Precondition { code: "checkpoint_required", .. }));
    }

    #[test]
    fn test_restack_inherits_attestation() {
        let device = setup();
        device.write("a.txt", "one\n");
        let checkpoint = device.engine().checkpoint(Some("first")).unwrap().checkpoint;
        AttestationStore::new(&device.repo)
            .record(
                checkpoint,
                AttestationInput {
                    status: "pass".into(),
                    ..Default::default()
                },
            )
            .unwrap();
        advance_main(&device, "upstream.txt", "up\n");

        let result = device.engine().restack(None).unwrap();
        let view = AttestationStore::new(&device.repo)
            .view(result.tip().unwrap())
            .unwrap()
            .unwrap();
        assert!(view.stale);
        assert_eq!(view.attestation.commit_sha, checkpoint);
    }

    #[test]
    fn test_restack_stacked_workspace_onto_new_checkpoint() {
        let device = setup();
        device.write("base.txt", "v1\n");
        device.engine().checkpoint(Some("base v1")).unwrap();
        device.engine().stack_workspace("feature").unwrap();

        let ctx = WorkspaceContext {
            workspace: "feature".into(),
            ..device.ctx.clone()
        };
        let upper = Engine::new(&device.repo, &ctx);
        device.write("feature.txt", "feature\n");
        upper.checkpoint(Some("feature")).unwrap();

        // the lower workspace moves on
        let lower_tip = device.resolve("refs/wsync/workspaces/alice/@").unwrap();
        let scratch = tempfile::TempDir::new().unwrap();
        device.repo.materialize_tree(device.repo.tree_of(lower_tip).unwrap(), scratch.path()).unwrap();
        fs::write(scratch.path().join("base.txt"), "v2\n").unwrap();
        let tree = device.repo.snapshot_dir(scratch.path()).unwrap();
        let message = trailers::ensure_trailer(
            "base v2\n",
            trailers::CHANGE_ID,
            trailers::extract_change_id(&device.repo.commit_info(lower_tip).unwrap().message)
                .unwrap()
                .as_str(),
        );
        let v2 = device.repo.create_commit(tree, &[lower_tip], &message).unwrap();
        let lower_ref = RefName::new("refs/wsync/workspaces/alice/@").unwrap();
        device.repo.update_ref(&lower_ref, v2, Expect::Value(lower_tip), "test").unwrap();

        let result = upper.restack(None).unwrap();
        assert_eq!(result.onto, "refs/wsync/workspaces/alice/@");
        assert_eq!(result.base_tip, v2);
        let tip = result.tip().unwrap();
        assert_eq!(device.file_at(tip, "base.txt").as_deref(), Some("v2\n"));
        assert_eq!(device.file_at(tip, "feature.txt").as_deref(), Some("feature\n"));
        assert!(upper.state().config().unwrap().track_ref.is_none());

        let err = upper.restack(Some("refs/wsync/workspaces/alice/feature")).unwrap_err();
        assert!(matches!(err, WorkflowError::ConflictingFlags(_)));
    }
}
