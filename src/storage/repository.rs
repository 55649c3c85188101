//! Core Git repository wrapper.
//!
//! This is the central component of the storage layer. It wraps
//! `git2::Repository` with thread-safe access and implements
//! [`ObjectStore`] on top of the free functions in the sibling modules.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use git2::{build::CheckoutBuilder, ErrorCode, Repository};
use parking_lot::RwLock;

use crate::storage::commit::{self, CommitBuilder, CommitInfo};
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::notes;
use crate::storage::refs::RefManager;
use crate::storage::remote;
use crate::storage::store::ObjectStore;
use crate::storage::tree::{self, SkipFn, TreeMerge};
use crate::storage::types::{Change, ChangeStatus, CommitId, Expect, GitSignature, RefName, RefUpdate, TreeId};

/// The main Git repository wrapper.
///
/// Clone this to share across threads - it uses Arc internally.
#[derive(Clone)]
pub struct GitRepository {
    inner: Arc<GitRepositoryInner>,
}

struct GitRepositoryInner {
    repo: RwLock<Repository>,
    workdir: PathBuf,
    git_dir: PathBuf,
    signature: GitSignature,
}

impl GitRepository {
    /// Open the repository containing `path` (searching upwards).
    pub fn open(path: impl AsRef<Path>) -> StorageResult<Self> {
        let path = path.as_ref();
        let repo = Repository::discover(path).map_err(|_| StorageError::NotInitialized(path.to_path_buf()))?;
        Self::from_repository(repo, path)
    }

    /// Initialize a new non-bare repository.
    pub fn init(path: impl AsRef<Path>) -> StorageResult<Self> {
        let path = path.as_ref();
        let repo = Repository::init(path)?;
        Self::from_repository(repo, path)
    }

    fn from_repository(repo: Repository, path: &Path) -> StorageResult<Self> {
        let workdir = repo
            .workdir()
            .ok_or_else(|| StorageError::BareRepository(path.to_path_buf()))?
            .to_path_buf();
        let git_dir = repo.path().to_path_buf();

        // commits are authored as the configured user when there is one
        let signature = match repo.signature() {
            Ok(sig) => match (sig.name(), sig.email()) {
                (Some(name), Some(email)) => GitSignature::new(name, email),
                _ => GitSignature::wsync(),
            },
            Err(_) => GitSignature::wsync(),
        };

        Ok(Self {
            inner: Arc::new(GitRepositoryInner {
                repo: RwLock::new(repo),
                workdir,
                git_dir,
                signature,
            }),
        })
    }

    /// Execute a function with read access to the repository.
    pub fn with_repo<F, T>(&self, f: F) -> StorageResult<T>
    where
        F: FnOnce(&Repository) -> StorageResult<T>,
    {
        let repo = self.inner.repo.read();
        f(&repo)
    }

    /// Execute a function with write access to the repository.
    pub fn with_repo_mut<F, T>(&self, f: F) -> StorageResult<T>
    where
        F: FnOnce(&Repository) -> StorageResult<T>,
    {
        let repo = self.inner.repo.write();
        f(&repo)
    }
}

impl ObjectStore for GitRepository {
    fn workdir(&self) -> &Path {
        &self.inner.workdir
    }

    fn git_dir(&self) -> PathBuf {
        self.inner.git_dir.clone()
    }

    // ==================== Refs ====================

    fn resolve_ref(&self, name: &str) -> StorageResult<Option<CommitId>> {
        self.with_repo(|repo| RefManager::resolve(repo, name))
    }

    fn head_commit(&self) -> StorageResult<Option<CommitId>> {
        self.with_repo(RefManager::head_commit)
    }

    fn list_refs(&self, prefix: &str) -> StorageResult<Vec<(RefName, CommitId)>> {
        self.with_repo(|repo| RefManager::list(repo, prefix))
    }

    fn update_ref(&self, name: &RefName, target: CommitId, expect: Expect, reason: &str) -> StorageResult<()> {
        self.with_repo_mut(|repo| RefManager::update(repo, name, target, expect, reason))
    }

    fn delete_ref(&self, name: &RefName) -> StorageResult<bool> {
        self.with_repo_mut(|repo| RefManager::delete(repo, name))
    }

    fn apply_ref_updates(&self, updates: &[RefUpdate], reason: &str) -> StorageResult<()> {
        self.with_repo_mut(|repo| RefManager::apply(repo, updates, reason))
    }

    fn set_head(&self, name: &RefName) -> StorageResult<()> {
        self.with_repo_mut(|repo| RefManager::set_head(repo, name))
    }

    // ==================== Commits ====================

    fn commit_info(&self, id: CommitId) -> StorageResult<CommitInfo> {
        self.with_repo(|repo| commit::get_commit(repo, id))
    }

    fn create_commit(&self, tree: TreeId, parents: &[CommitId], message: &str) -> StorageResult<CommitId> {
        self.with_repo_mut(|repo| {
            CommitBuilder::new(repo)
                .tree(tree)
                .parents(parents.to_vec())
                .message(message)
                .signature(self.inner.signature.clone())
                .commit()
        })
    }

    fn merge_base(&self, a: CommitId, b: CommitId) -> StorageResult<Option<CommitId>> {
        self.with_repo(|repo| commit::find_merge_base(repo, a, b))
    }

    fn is_ancestor(&self, ancestor: CommitId, descendant: CommitId) -> StorageResult<bool> {
        self.with_repo(|repo| commit::is_ancestor(repo, ancestor, descendant))
    }

    // ==================== Trees ====================

    fn empty_tree(&self) -> StorageResult<TreeId> {
        self.with_repo_mut(tree::empty_tree)
    }

    fn snapshot_workdir(&self, skip: SkipFn<'_>) -> StorageResult<TreeId> {
        self.with_repo_mut(|repo| tree::snapshot_dir(repo, &self.inner.workdir, skip, true))
    }

    fn snapshot_dir(&self, dir: &Path) -> StorageResult<TreeId> {
        self.with_repo_mut(|repo| tree::snapshot_dir(repo, dir, &|_, _| false, false))
    }

    fn merge_trees(&self, base: Option<TreeId>, ours: TreeId, theirs: TreeId) -> StorageResult<TreeMerge> {
        self.with_repo_mut(|repo| tree::merge_trees(repo, base, ours, theirs))
    }

    fn materialize_merge(
        &self,
        base: Option<TreeId>,
        ours: TreeId,
        theirs: TreeId,
        dir: &Path,
    ) -> StorageResult<Vec<PathBuf>> {
        self.with_repo(|repo| tree::materialize_merge(repo, base, ours, theirs, dir))
    }

    fn materialize_tree(&self, tree_id: TreeId, dir: &Path) -> StorageResult<()> {
        self.with_repo(|repo| tree::materialize_tree(repo, tree_id, dir))
    }

    fn read_path(&self, tree_id: TreeId, path: &Path) -> StorageResult<Option<Vec<u8>>> {
        self.with_repo(|repo| tree::read_path(repo, tree_id, path))
    }

    fn diff_summary(&self, old: Option<TreeId>, new: TreeId) -> StorageResult<Vec<Change>> {
        self.with_repo(|repo| commit::diff_trees(repo, old, new))
    }

    fn diff_patch(&self, old: Option<TreeId>, new: TreeId) -> StorageResult<String> {
        self.with_repo(|repo| commit::diff_patch(repo, old, new))
    }

    fn checkout_workdir(&self, from: Option<TreeId>, to: TreeId) -> StorageResult<()> {
        self.with_repo_mut(|repo| {
            let tree = repo.find_tree(to.raw())?;
            let mut checkout = CheckoutBuilder::new();
            checkout.force();
            repo.checkout_tree(tree.as_object(), Some(&mut checkout))?;

            // untracked files are never touched; only what `from` had and
            // `to` dropped goes away
            if let Some(from) = from {
                for change in commit::diff_trees(repo, Some(from), to)? {
                    if change.status == ChangeStatus::Deleted {
                        tree::remove_workdir_path(&self.inner.workdir, &change.path)?;
                    }
                }
            }
            Ok(())
        })
    }

    // ==================== Remotes ====================

    fn remote_names(&self) -> StorageResult<Vec<String>> {
        self.with_repo(remote::remote_names)
    }

    fn remote_tip(&self, name: &str, reference: &str) -> StorageResult<Option<CommitId>> {
        self.with_repo_mut(|repo| remote::remote_tip(repo, name, reference))
    }

    fn fetch_ref(&self, name: &str, remote_ref: &str, local_ref: &str) -> StorageResult<Option<CommitId>> {
        self.with_repo_mut(|repo| remote::fetch_ref(repo, name, remote_ref, local_ref))
    }

    fn push_ref(&self, name: &str, reference: &str, force: bool) -> StorageResult<()> {
        self.with_repo(|repo| remote::push_ref(repo, name, reference, force))
    }

    fn push_with_lease(&self, name: &str, reference: &str, expected: Option<CommitId>) -> StorageResult<()> {
        self.with_repo_mut(|repo| remote::push_with_lease(repo, name, reference, expected))
    }

    // ==================== Notes ====================

    fn read_note(&self, notes_ref: &str, target: CommitId) -> StorageResult<Option<String>> {
        self.with_repo(|repo| notes::read(repo, notes_ref, target))
    }

    fn write_note(&self, notes_ref: &str, target: CommitId, body: &str) -> StorageResult<()> {
        self.with_repo_mut(|repo| notes::write(repo, &self.inner.signature, notes_ref, target, body))
    }

    fn remove_note(&self, notes_ref: &str, target: CommitId) -> StorageResult<bool> {
        self.with_repo_mut(|repo| notes::remove(repo, &self.inner.signature, notes_ref, target))
    }

    fn list_notes(&self, notes_ref: &str) -> StorageResult<Vec<(CommitId, String)>> {
        self.with_repo(|repo| notes::list(repo, notes_ref))
    }

    // ==================== Config ====================

    fn config_value(&self, key: &str) -> StorageResult<Option<String>> {
        self.with_repo(|repo| {
            let config = repo.config()?;
            match config.get_string(key) {
                Ok(value) => Ok(Some(value)),
                Err(e) if e.code() == ErrorCode::NotFound => Ok(None),
                Err(e) => Err(StorageError::Git(e)),
            }
        })
    }
}

impl std::fmt::Debug for GitRepository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GitRepository")
            .field("workdir", &self.inner.workdir)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn setup() -> (TempDir, GitRepository) {
        let dir = TempDir::new().unwrap();
        let repo = GitRepository::init(dir.path()).unwrap();
        (dir, repo)
    }

    #[test]
    fn test_open_discovers_from_subdir() {
        let (dir, _repo) = setup();
        fs::create_dir_all(dir.path().join("a/b")).unwrap();
        let opened = GitRepository::open(dir.path().join("a/b")).unwrap();
        assert_eq!(
            opened.workdir().canonicalize().unwrap(),
            dir.path().canonicalize().unwrap()
        );
    }

    #[test]
    fn test_open_bare_fails() {
        let dir = TempDir::new().unwrap();
        Repository::init_bare(dir.path()).unwrap();
        assert!(matches!(
            GitRepository::open(dir.path()),
            Err(StorageError::BareRepository(_))
        ));
    }

    #[test]
    fn test_snapshot_commit_and_checkout() {
        let (dir, repo) = setup();
        fs::write(dir.path().join("file.txt"), "v1\n").unwrap();
        let first_tree = repo.snapshot_workdir(&|rel, _| rel.starts_with(".wsync")).unwrap();
        let first = repo.create_commit(first_tree, &[], "first").unwrap();

        fs::write(dir.path().join("file.txt"), "v2\n").unwrap();
        fs::write(dir.path().join("extra.txt"), "extra\n").unwrap();
        let second_tree = repo.snapshot_workdir(&|rel, _| rel.starts_with(".wsync")).unwrap();
        let second = repo.create_commit(second_tree, &[first], "second").unwrap();

        assert!(repo.is_ancestor(first, second).unwrap());
        assert_eq!(repo.tree_of(second).unwrap(), second_tree);
        assert_eq!(repo.diff_summary(Some(first_tree), second_tree).unwrap().len(), 2);

        fs::write(dir.path().join(".env"), "TOKEN=1\n").unwrap();
        repo.checkout_workdir(Some(second_tree), first_tree).unwrap();
        assert_eq!(fs::read_to_string(dir.path().join("file.txt")).unwrap(), "v1\n");
        assert!(!dir.path().join("extra.txt").exists());
        // untracked and never snapshotted
        assert_eq!(fs::read_to_string(dir.path().join(".env")).unwrap(), "TOKEN=1\n");
    }

    #[test]
    fn test_ref_cas_through_store() {
        let (_dir, repo) = setup();
        let tree = repo.snapshot_workdir(&|_, _| false).unwrap();
        let a = repo.create_commit(tree, &[], "a").unwrap();
        let b = repo.create_commit(tree, &[a], "b").unwrap();
        let name = RefName::new("refs/wsync/sync/alice/laptop/@").unwrap();

        repo.update_ref(&name, a, Expect::Absent, "sync").unwrap();
        let lost = repo.update_ref(&name, b, Expect::Value(b), "sync");
        assert!(matches!(lost, Err(StorageError::ConcurrentModification { .. })));
        repo.update_ref(&name, b, Expect::Value(a), "sync").unwrap();
        assert_eq!(repo.resolve_ref(name.as_str()).unwrap(), Some(b));
    }

    #[test]
    fn test_notes_and_config() {
        let (_dir, repo) = setup();
        let tree = repo.snapshot_workdir(&|_, _| false).unwrap();
        let a = repo.create_commit(tree, &[], "a").unwrap();

        repo.write_note("refs/notes/wsync/meta", a, "hello").unwrap();
        assert_eq!(
            repo.read_note("refs/notes/wsync/meta", a).unwrap().as_deref(),
            Some("hello")
        );
        assert_eq!(repo.config_value("wsync.missing").unwrap(), None);
    }
}
