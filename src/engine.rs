//! The engine handle every workflow operation hangs off.
//!
//! `Engine` bundles the three collaborators an operation needs: the object
//! store, the workspace context and (optionally) the agent. The operations
//! themselves live next to their subsystems as `impl Engine` blocks:
//!
//! | operation                              | module                 |
//! |----------------------------------------|------------------------|
//! | sync, checkpoint, adopt, checkout      | [`crate::workspace`]   |
//! | stack a workspace                      | [`crate::workspace`]   |
//! | merge, apply/reject suggestion         | [`crate::reconcile`]   |
//! | promote                                | [`crate::promote`]     |
//! | restack, prune                         | [`crate::restack`]     |

use tracing::warn;

use crate::agent::ConflictAgent;
use crate::context::WorkspaceContext;
use crate::error::{WorkflowError, WorkflowResult};
use crate::identity::{refs, ChangeId};
use crate::storage::{CommitId, Expect, ObjectStore, RefName, StorageResult, TreeId};
use crate::workspace::ignore::SyncIgnore;
use crate::workspace::state::{self, WorkspaceState};

pub struct Engine<'a> {
    store: &'a dyn ObjectStore,
    ctx: &'a WorkspaceContext,
    agent: Option<&'a dyn ConflictAgent>,
}

impl<'a> Engine<'a> {
    pub fn new(store: &'a dyn ObjectStore, ctx: &'a WorkspaceContext) -> Self {
        Self { store, ctx, agent: None }
    }

    pub fn with_agent(mut self, agent: &'a dyn ConflictAgent) -> Self {
        self.agent = Some(agent);
        self
    }

    pub fn store(&self) -> &'a dyn ObjectStore {
        self.store
    }

    pub fn context(&self) -> &'a WorkspaceContext {
        self.ctx
    }

    pub fn agent(&self) -> Option<&'a dyn ConflictAgent> {
        self.agent
    }

    // ==================== Names ====================

    pub(crate) fn workspace_ref(&self) -> WorkflowResult<RefName> {
        Ok(refs::workspace_ref(&self.ctx.user, &self.ctx.workspace)?)
    }

    pub(crate) fn sync_ref(&self) -> WorkflowResult<RefName> {
        Ok(refs::sync_ref(&self.ctx.user, &self.ctx.device, &self.ctx.workspace)?)
    }

    pub(crate) fn trace_ref(&self) -> WorkflowResult<RefName> {
        Ok(refs::trace_ref(&self.ctx.user, &self.ctx.workspace)?)
    }

    pub(crate) fn head_branch(&self) -> WorkflowResult<RefName> {
        Ok(refs::head_branch(&self.ctx.workspace)?)
    }

    pub(crate) fn keep_ref(&self, change_id: &ChangeId, checkpoint: CommitId) -> WorkflowResult<RefName> {
        Ok(refs::keep_ref(&self.ctx.user, &self.ctx.workspace, change_id, checkpoint)?)
    }

    pub(crate) fn state(&self) -> WorkspaceState {
        WorkspaceState::new(self.store.workdir(), &self.ctx.workspace)
    }

    // ==================== Working tree ====================

    /// Tree of the current working set, minus sync-ignored paths.
    pub(crate) fn snapshot(&self) -> WorkflowResult<TreeId> {
        state::ensure_state_dir(self.store)?;
        let ignore = SyncIgnore::load(self.store.workdir());
        Ok(self
            .store
            .snapshot_workdir(&|rel, is_dir| ignore.is_ignored(rel, is_dir))?)
    }

    /// Force the working tree to `commit`'s tree.
    pub(crate) fn checkout(&self, commit: CommitId) -> WorkflowResult<()> {
        let tree = self.store.tree_of(commit)?;
        self.checkout_tree(tree)
    }

    /// Force the working tree to `tree`. Only paths of the current working
    /// set can be removed, so sync-ignored and state files survive.
    pub(crate) fn checkout_tree(&self, tree: TreeId) -> WorkflowResult<()> {
        let current = self.snapshot()?;
        self.store.checkout_workdir(Some(current), tree)?;
        Ok(())
    }

    /// Point the workspace head branch at `sha` and make it HEAD.
    pub(crate) fn move_head_branch(&self, sha: CommitId) -> WorkflowResult<()> {
        let branch = self.head_branch()?;
        self.store.update_ref(&branch, sha, Expect::Any, "wsync: workspace head")?;
        self.store.set_head(&branch)?;
        Ok(())
    }

    // ==================== Remote ====================

    /// Refresh the local workspace ref from the remote (when there is one)
    /// and return its tip. Fetch problems are logged and the local value is
    /// used.
    pub(crate) fn fetch_workspace(&self) -> WorkflowResult<Option<CommitId>> {
        let name = self.workspace_ref()?;
        if let Some(remote) = self.ctx.remote.as_deref() {
            if let Err(e) = self.store.fetch_ref(remote, name.as_str(), name.as_str()) {
                warn!(remote, reference = name.as_str(), error = %e, "workspace fetch failed");
            }
        }
        Ok(self.store.resolve_ref(name.as_str())?)
    }

    /// Remote value of `reference`, `None` without a remote or on error.
    pub(crate) fn remote_value(&self, reference: &RefName) -> Option<CommitId> {
        let remote = self.ctx.remote.as_deref()?;
        match self.store.remote_tip(remote, reference.as_str()) {
            Ok(tip) => tip,
            Err(e) => {
                warn!(remote, reference = reference.as_str(), error = %e, "remote lookup failed");
                None
            }
        }
    }

    /// Bring the change's anchor and change refs in from the remote when
    /// this device has never seen them. A local anchor that disagrees with
    /// the published one is refused before anything is written.
    pub(crate) fn fetch_change_refs(&self, change_id: &ChangeId) -> WorkflowResult<()> {
        if self.ctx.remote.is_none() {
            return Ok(());
        }
        let anchor = refs::anchor_ref(change_id)?;
        if let Some(published) = self.remote_value(&anchor) {
            match self.store.resolve_ref(anchor.as_str())? {
                None => self
                    .store
                    .update_ref(&anchor, published, Expect::Absent, "wsync: fetch anchor")?,
                Some(local) if local != published => return Err(anchor_mismatch(change_id, published, local)),
                Some(_) => {}
            }
        }
        let change = refs::change_ref(change_id)?;
        if let Some(published) = self.remote_value(&change) {
            if self.store.resolve_ref(change.as_str())?.is_none() {
                self.store
                    .update_ref(&change, published, Expect::Absent, "wsync: fetch change")?;
            }
        }
        Ok(())
    }

    /// Push `reference` only if the remote still holds `expected`.
    pub(crate) fn push_leased(&self, reference: &RefName, expected: Option<CommitId>) -> StorageResult<()> {
        match self.ctx.remote.as_deref() {
            Some(remote) => self.store.push_with_lease(remote, reference.as_str(), expected),
            None => Ok(()),
        }
    }
}

pub(crate) fn anchor_mismatch(change_id: &ChangeId, published: CommitId, local: CommitId) -> WorkflowError {
    WorkflowError::precondition(
        "anchor_mismatch",
        format!(
            "anchor ref mismatch for change {}: remote {} local {}",
            change_id,
            published.short(),
            local.short()
        ),
    )
}

impl std::fmt::Debug for Engine<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("context", self.ctx)
            .field("agent", &self.agent.map(|a| a.name().to_string()))
            .finish()
    }
}
