//! The object-store contract the engine is written against.
//!
//! [`GitRepository`](crate::storage::GitRepository) is the production
//! implementation. Engines only ever see `&dyn ObjectStore`, so anything
//! honoring the same contract can stand in for it.

use std::path::{Path, PathBuf};

use crate::storage::commit::CommitInfo;
use crate::storage::error::StorageResult;
use crate::storage::tree::{SkipFn, TreeMerge};
use crate::storage::types::{Change, CommitId, Expect, RefName, RefUpdate, TreeId};

pub trait ObjectStore {
    /// root of the working directory
    fn workdir(&self) -> &Path;

    /// the repository's `.git` directory
    fn git_dir(&self) -> PathBuf;

    // ==================== Refs ====================

    fn resolve_ref(&self, name: &str) -> StorageResult<Option<CommitId>>;

    fn head_commit(&self) -> StorageResult<Option<CommitId>>;

    fn list_refs(&self, prefix: &str) -> StorageResult<Vec<(RefName, CommitId)>>;

    /// compare-and-swap ref write
    fn update_ref(&self, name: &RefName, target: CommitId, expect: Expect, reason: &str) -> StorageResult<()>;

    fn delete_ref(&self, name: &RefName) -> StorageResult<bool>;

    /// ordered burst of ref writes; stops at the first failure
    fn apply_ref_updates(&self, updates: &[RefUpdate], reason: &str) -> StorageResult<()> {
        for update in updates {
            self.update_ref(&update.name, update.target, update.expect, reason)?;
        }
        Ok(())
    }

    fn set_head(&self, name: &RefName) -> StorageResult<()>;

    // ==================== Commits ====================

    fn commit_info(&self, id: CommitId) -> StorageResult<CommitInfo>;

    fn create_commit(&self, tree: TreeId, parents: &[CommitId], message: &str) -> StorageResult<CommitId>;

    fn tree_of(&self, id: CommitId) -> StorageResult<TreeId> {
        Ok(self.commit_info(id)?.tree_id)
    }

    fn merge_base(&self, a: CommitId, b: CommitId) -> StorageResult<Option<CommitId>>;

    fn is_ancestor(&self, ancestor: CommitId, descendant: CommitId) -> StorageResult<bool>;

    // ==================== Trees ====================

    fn empty_tree(&self) -> StorageResult<TreeId>;

    /// snapshot of the working set, honoring ignore rules and `skip`
    fn snapshot_workdir(&self, skip: SkipFn<'_>) -> StorageResult<TreeId>;

    /// snapshot of an arbitrary directory, without ignore rules
    fn snapshot_dir(&self, dir: &Path) -> StorageResult<TreeId>;

    fn merge_trees(&self, base: Option<TreeId>, ours: TreeId, theirs: TreeId) -> StorageResult<TreeMerge>;

    /// write the merge result into `dir`, returning the conflicted paths
    fn materialize_merge(
        &self,
        base: Option<TreeId>,
        ours: TreeId,
        theirs: TreeId,
        dir: &Path,
    ) -> StorageResult<Vec<PathBuf>>;

    fn materialize_tree(&self, tree: TreeId, dir: &Path) -> StorageResult<()>;

    fn read_path(&self, tree: TreeId, path: &Path) -> StorageResult<Option<Vec<u8>>>;

    fn diff_summary(&self, old: Option<TreeId>, new: TreeId) -> StorageResult<Vec<Change>>;

    fn diff_patch(&self, old: Option<TreeId>, new: TreeId) -> StorageResult<String>;

    /// Force the working directory (and index) from `from` to `to`.
    /// Paths in `from` that `to` lacks are deleted; untracked files are
    /// left alone.
    fn checkout_workdir(&self, from: Option<TreeId>, to: TreeId) -> StorageResult<()>;

    // ==================== Remotes ====================

    fn remote_names(&self) -> StorageResult<Vec<String>>;

    fn remote_tip(&self, remote: &str, reference: &str) -> StorageResult<Option<CommitId>>;

    fn fetch_ref(&self, remote: &str, remote_ref: &str, local_ref: &str) -> StorageResult<Option<CommitId>>;

    fn push_ref(&self, remote: &str, reference: &str, force: bool) -> StorageResult<()>;

    fn push_with_lease(&self, remote: &str, reference: &str, expected: Option<CommitId>) -> StorageResult<()>;

    // ==================== Notes ====================

    fn read_note(&self, notes_ref: &str, target: CommitId) -> StorageResult<Option<String>>;

    fn write_note(&self, notes_ref: &str, target: CommitId, body: &str) -> StorageResult<()>;

    fn remove_note(&self, notes_ref: &str, target: CommitId) -> StorageResult<bool>;

    fn list_notes(&self, notes_ref: &str) -> StorageResult<Vec<(CommitId, String)>>;

    // ==================== Config ====================

    /// a string value from the repository's git config
    fn config_value(&self, key: &str) -> StorageResult<Option<String>>;
}
