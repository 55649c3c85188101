//! The reconciliation worktree.
//!
//! Conflicts are written out under `.wsync/agent-workspace/worktree` where
//! the agent (or a person) edits them. `MERGE_STATE.json` next to it records
//! which (ours, theirs) pair the directory belongs to, so a rerun can pick
//! up manual edits instead of starting over.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::context::STATE_DIR;
use crate::error::WorkflowResult;
use crate::storage::{has_conflict_markers, CommitId, ObjectStore};

const AGENT_DIR: &str = "agent-workspace";
const WORKTREE_DIR: &str = "worktree";
const STATE_FILE: &str = "MERGE_STATE.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeState {
    pub ours: CommitId,
    pub theirs: CommitId,
    pub base: CommitId,
    /// paths that conflicted when the worktree was written
    #[serde(default)]
    pub conflicts: Vec<PathBuf>,
}

impl MergeState {
    fn matches(&self, ours: CommitId, theirs: CommitId) -> bool {
        self.ours == ours && self.theirs == theirs
    }
}

#[derive(Debug, Clone)]
pub struct MergeWorktree {
    root: PathBuf,
}

impl MergeWorktree {
    pub fn new(workdir: &Path) -> Self {
        Self {
            root: workdir.join(STATE_DIR).join(AGENT_DIR),
        }
    }

    pub fn path(&self) -> PathBuf {
        self.root.join(WORKTREE_DIR)
    }

    /// Recorded merge state; an unreadable file counts as none.
    pub fn state(&self) -> WorkflowResult<Option<MergeState>> {
        let text = match fs::read_to_string(self.root.join(STATE_FILE)) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(serde_json::from_str(&text).ok())
    }

    /// Make the worktree hold the merge of `ours` and `theirs`.
    ///
    /// A worktree already prepared for the same pair is reused untouched;
    /// anything else is wiped and rewritten. The flag is true on reuse.
    pub fn prepare(
        &self,
        store: &dyn ObjectStore,
        base: CommitId,
        ours: CommitId,
        theirs: CommitId,
    ) -> WorkflowResult<(MergeState, bool)> {
        if let Some(state) = self.state()? {
            if state.matches(ours, theirs) && self.path().is_dir() {
                debug!(worktree = %self.path().display(), "reusing merge worktree");
                return Ok((state, true));
            }
        }

        self.remove()?;
        let dir = self.path();
        fs::create_dir_all(&dir)?;
        let conflicts = store.materialize_merge(
            Some(store.tree_of(base)?),
            store.tree_of(ours)?,
            store.tree_of(theirs)?,
            &dir,
        )?;
        let state = MergeState {
            ours,
            theirs,
            base,
            conflicts,
        };
        fs::write(self.root.join(STATE_FILE), serde_json::to_vec_pretty(&state)?)?;
        debug!(worktree = %dir.display(), conflicts = state.conflicts.len(), "prepared merge worktree");
        Ok((state, false))
    }

    /// The subset of `paths` still carrying conflict markers. A deleted
    /// file counts as resolved.
    pub fn unresolved(&self, paths: &[PathBuf]) -> io::Result<Vec<PathBuf>> {
        let dir = self.path();
        let mut remaining = Vec::new();
        for path in paths {
            match fs::read(dir.join(path)) {
                Ok(content) if has_conflict_markers(&content) => remaining.push(path.clone()),
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
        }
        Ok(remaining)
    }

    /// Tear the worktree and its state down.
    pub fn remove(&self) -> io::Result<()> {
        match fs::remove_dir_all(&self.root) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}
