//! Workspace stacking: a workspace whose base is another workspace's
//! latest checkpoint rather than a branch.

use serde::Serialize;
use tracing::info;

use crate::context::WorkspaceContext;
use crate::engine::Engine;
use crate::error::{NextAction, WorkflowError, WorkflowResult};
use crate::identity::{refs, trailers, ChangeId, RefKind};
use crate::storage::{CommitId, Expect, RefUpdate};
use crate::workspace::state::{self, WorkspaceState};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StackResult {
    pub workspace: String,
    /// the workspace ref the new one is stacked on
    pub base_ref: String,
    pub base: CommitId,
    pub draft: CommitId,
    pub change_id: ChangeId,
}

impl<'a> Engine<'a> {
    /// Start workspace `name` on top of this workspace's latest checkpoint
    /// and switch the working tree to it.
    ///
    /// Uncommitted edits stay in this workspace's draft.
    pub fn stack_workspace(&self, name: &str) -> WorkflowResult<StackResult> {
        let ctx = WorkspaceContext {
            workspace: name.to_string(),
            ..self.context().clone()
        };
        refs::validate_component(name)?;
        if name == self.context().workspace {
            return Err(WorkflowError::ConflictingFlags(format!(
                "workspace {} cannot be stacked on itself",
                name
            )));
        }

        self.sync()?;
        let workspace_ref = self.workspace_ref()?;
        let base = match self.store().resolve_ref(workspace_ref.as_str())? {
            Some(tip) => state::draft_base(self.store(), tip)?,
            None => None,
        }
        .ok_or_else(|| {
            WorkflowError::precondition("checkpoint_required", "checkpoint required before stacking")
                .with_next(NextAction::new("checkpoint", "wsync checkpoint -m \"<message>\""))
        })?;

        let upper = Engine::new(self.store(), &ctx);
        let new_workspace_ref = upper.workspace_ref()?;
        let new_sync_ref = upper.sync_ref()?;
        for existing in [&new_workspace_ref, &new_sync_ref] {
            if self.store().resolve_ref(existing.as_str())?.is_some() {
                return Err(WorkflowError::precondition(
                    "workspace_exists",
                    format!("workspace already exists: {}/{}", ctx.user, name),
                ));
            }
        }

        let change_id = ChangeId::generate();
        let tree = self.store().tree_of(base)?;
        let draft = self
            .store()
            .create_commit(tree, &[base], &trailers::draft_message(&change_id))?;
        self.store().apply_ref_updates(
            &[
                RefUpdate::new(new_workspace_ref, base).expecting(Expect::Absent),
                RefUpdate::new(new_sync_ref, draft).expecting(Expect::Absent),
            ],
            "wsync: stack workspace",
        )?;

        let upper_state = upper.state();
        upper_state.write_lease(base)?;
        upper_state.update_config(|config| {
            config.base_ref = Some(workspace_ref.as_str().to_string());
            config.base_sha = Some(base);
            config.track_ref = None;
            config.track_tip = None;
        })?;
        upper.checkout(base)?;
        upper.move_head_branch(base)?;

        info!(workspace = name, base = %base.short(), "stacked on {}", self.context().workspace);
        Ok(StackResult {
            workspace: name.to_string(),
            base_ref: workspace_ref.as_str().to_string(),
            base,
            draft,
            change_id,
        })
    }

    /// Workspaces this one is stacked on, bottom first.
    pub(crate) fn stack_below(&self) -> WorkflowResult<Vec<(String, String)>> {
        let mut seen = vec![(self.context().user.clone(), self.context().workspace.clone())];
        let mut below = Vec::new();
        let mut config = self.state().config()?;
        while let Some(base_ref) = config.base_ref.clone() {
            let Some(RefKind::Workspace { user, workspace }) = RefKind::parse(&base_ref) else {
                break;
            };
            let key = (user, workspace);
            if seen.contains(&key) {
                return Err(WorkflowError::precondition(
                    "stack_cycle",
                    format!("workspace stack loops back to {}/{}", key.0, key.1),
                ));
            }
            config = WorkspaceState::new(self.store().workdir(), &key.1).config()?;
            seen.push(key.clone());
            below.push(key);
        }
        below.reverse();
        Ok(below)
    }
}
