//! Commit creation, ancestry and diff operations
//!
//! every engine-visible state is a commit:
//! - drafts and checkpoints wrap a tree with one parent
//! - published merge commits have two parents
//! - trace commits form a side chain of provenance records
//!
//! this module handles commit creation, ancestry queries, and diff rendering

use std::path::PathBuf;

use chrono::{DateTime, TimeZone, Utc};
use git2::{Delta, Diff, DiffFormat, DiffOptions, ErrorCode, Repository};

use crate::storage::error::{StorageError, StorageResult};
use crate::storage::types::{Change, ChangeStatus, CommitId, GitSignature, TreeId};

/// information about a commit
#[derive(Debug, Clone)]
pub struct CommitInfo {
    pub id: CommitId,
    pub tree_id: TreeId,
    pub parent_ids: Vec<CommitId>,
    pub message: String,
    pub author_name: String,
    pub author_email: String,
    pub timestamp: DateTime<Utc>,
}

impl CommitInfo {
    /// create CommitInfo from a git2::Commit
    pub(crate) fn from_git2(commit: &git2::Commit<'_>) -> Self {
        let author = commit.author();
        let time = commit.time();
        let timestamp = Utc
            .timestamp_opt(time.seconds(), 0)
            .single()
            .unwrap_or_else(Utc::now);

        Self {
            id: CommitId::new(commit.id()),
            tree_id: TreeId::new(commit.tree_id()),
            parent_ids: commit.parent_ids().map(CommitId::new).collect(),
            message: commit.message().unwrap_or("").to_string(),
            author_name: author.name().unwrap_or("Unknown").to_string(),
            author_email: author.email().unwrap_or("unknown@unknown").to_string(),
            timestamp,
        }
    }

    /// check if this is a merge commit (has multiple parents)
    pub fn is_merge(&self) -> bool {
        self.parent_ids.len() > 1
    }

    /// get the first (or only) parent
    pub fn first_parent(&self) -> Option<CommitId> {
        self.parent_ids.first().copied()
    }

    /// get a short summary of the commit (first line of message)
    pub fn summary(&self) -> &str {
        self.message.lines().next().unwrap_or(&self.message)
    }
}

/// builder for creating commits with a fluent interface
pub struct CommitBuilder<'a> {
    repo: &'a Repository,
    tree_id: Option<TreeId>,
    parents: Vec<CommitId>,
    message: String,
    signature: GitSignature,
}

impl<'a> CommitBuilder<'a> {
    pub fn new(repo: &'a Repository) -> Self {
        Self {
            repo,
            tree_id: None,
            parents: Vec::new(),
            message: String::new(),
            signature: GitSignature::wsync(),
        }
    }

    pub fn tree(mut self, tree_id: TreeId) -> Self {
        self.tree_id = Some(tree_id);
        self
    }

    pub fn parent(mut self, parent: CommitId) -> Self {
        self.parents.push(parent);
        self
    }

    /// set multiple parents (for merge and trace commits)
    pub fn parents(mut self, parents: Vec<CommitId>) -> Self {
        self.parents = parents;
        self
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    pub fn signature(mut self, signature: GitSignature) -> Self {
        self.signature = signature;
        self
    }

    /// create the commit object and return its ID. No ref is touched.
    pub fn commit(self) -> StorageResult<CommitId> {
        let tree_id = self
            .tree_id
            .ok_or_else(|| StorageError::Internal("commit requires a tree".to_string()))?;

        let tree = self.repo.find_tree(tree_id.raw())?;
        let sig = self.signature.to_git2_signature()?;

        let parent_commits: Vec<git2::Commit<'_>> = self
            .parents
            .iter()
            .map(|id| {
                self.repo
                    .find_commit(id.raw())
                    .map_err(|_| StorageError::CommitNotFound(id.to_string()))
            })
            .collect::<Result<_, _>>()?;

        let parent_refs: Vec<&git2::Commit<'_>> = parent_commits.iter().collect();

        let oid = self
            .repo
            .commit(None, &sig, &sig, &self.message, &tree, &parent_refs)?;

        Ok(CommitId::new(oid))
    }
}

/// get information about a commit
pub fn get_commit(repo: &Repository, id: CommitId) -> StorageResult<CommitInfo> {
    let commit = repo
        .find_commit(id.raw())
        .map_err(|_| StorageError::CommitNotFound(id.to_string()))?;

    Ok(CommitInfo::from_git2(&commit))
}

/// find the merge base (common ancestor) of two commits
///
/// returns None if there is no common ancestor
pub fn find_merge_base(repo: &Repository, a: CommitId, b: CommitId) -> StorageResult<Option<CommitId>> {
    match repo.merge_base(a.raw(), b.raw()) {
        Ok(oid) => Ok(Some(CommitId::new(oid))),
        Err(e) if e.code() == ErrorCode::NotFound => Ok(None),
        Err(e) => Err(StorageError::Git(e)),
    }
}

/// true when `ancestor` is reachable from `descendant` (or equal to it)
pub fn is_ancestor(repo: &Repository, ancestor: CommitId, descendant: CommitId) -> StorageResult<bool> {
    if ancestor == descendant {
        return Ok(true);
    }
    Ok(repo.graph_descendant_of(descendant.raw(), ancestor.raw())?)
}

fn diff_between<'r>(
    repo: &'r Repository,
    old: Option<TreeId>,
    new: TreeId,
) -> StorageResult<Diff<'r>> {
    let old_tree = match old {
        Some(id) => Some(repo.find_tree(id.raw())?),
        None => None,
    };
    let new_tree = repo.find_tree(new.raw())?;

    let mut opts = DiffOptions::new();
    let diff = repo.diff_tree_to_tree(old_tree.as_ref(), Some(&new_tree), Some(&mut opts))?;
    Ok(diff)
}

/// name-status changes between two trees; `None` means the empty tree
pub fn diff_trees(repo: &Repository, old: Option<TreeId>, new: TreeId) -> StorageResult<Vec<Change>> {
    let diff = diff_between(repo, old, new)?;
    extract_changes_from_diff(&diff)
}

/// unified patch text between two trees
pub fn diff_patch(repo: &Repository, old: Option<TreeId>, new: TreeId) -> StorageResult<String> {
    let diff = diff_between(repo, old, new)?;
    let mut out = String::new();
    diff.print(DiffFormat::Patch, |_delta, _hunk, line| {
        if matches!(line.origin(), '+' | '-' | ' ') {
            out.push(line.origin());
        }
        out.push_str(&String::from_utf8_lossy(line.content()));
        true
    })?;
    Ok(out)
}

/// compute changes from a diff
fn extract_changes_from_diff(diff: &Diff<'_>) -> StorageResult<Vec<Change>> {
    let mut changes = Vec::new();

    for delta in diff.deltas() {
        let path = delta
            .new_file()
            .path()
            .or_else(|| delta.old_file().path())
            .map(PathBuf::from)
            .unwrap_or_default();

        let status = match delta.status() {
            Delta::Added => ChangeStatus::Added,
            Delta::Deleted => ChangeStatus::Deleted,
            Delta::Modified => ChangeStatus::Modified,
            Delta::Renamed => ChangeStatus::Renamed,
            Delta::Copied => ChangeStatus::Copied,
            _ => ChangeStatus::Other,
        };

        changes.push(Change { path, status });
    }

    Ok(changes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use git2::FileMode;
    use tempfile::TempDir;

    fn setup() -> (TempDir, Repository) {
        let dir = TempDir::new().unwrap();
        let repo = Repository::init(dir.path()).unwrap();
        (dir, repo)
    }

    fn tree_with(repo: &Repository, files: &[(&str, &str)]) -> TreeId {
        let mut builder = repo.treebuilder(None).unwrap();
        for (name, content) in files {
            let blob = repo.blob(content.as_bytes()).unwrap();
            builder.insert(name, blob, FileMode::Blob.into()).unwrap();
        }
        TreeId::new(builder.write().unwrap())
    }

    #[test]
    fn test_commit_builder() {
        let (_dir, repo) = setup();
        let tree = tree_with(&repo, &[("a.txt", "one\n")]);

        let root = CommitBuilder::new(&repo)
            .tree(tree)
            .message("root")
            .commit()
            .unwrap();
        let child = CommitBuilder::new(&repo)
            .tree(tree)
            .parent(root)
            .message("child\n\nChange-Id: I0\n")
            .commit()
            .unwrap();

        let info = get_commit(&repo, child).unwrap();
        assert_eq!(info.parent_ids, vec![root]);
        assert_eq!(info.summary(), "child");
        assert_eq!(info.tree_id, tree);
        assert!(!info.is_merge());
        // no ref was moved
        assert!(repo.head().is_err());
    }

    #[test]
    fn test_commit_requires_tree() {
        let (_dir, repo) = setup();
        let result = CommitBuilder::new(&repo).message("no tree").commit();
        assert!(matches!(result, Err(StorageError::Internal(_))));
    }

    #[test]
    fn test_merge_base_and_ancestry() {
        let (_dir, repo) = setup();
        let tree = tree_with(&repo, &[]);

        let base = CommitBuilder::new(&repo).tree(tree).message("base").commit().unwrap();
        let a = CommitBuilder::new(&repo).tree(tree).parent(base).message("A").commit().unwrap();
        let b = CommitBuilder::new(&repo).tree(tree).parent(base).message("B").commit().unwrap();

        assert_eq!(find_merge_base(&repo, a, b).unwrap(), Some(base));
        assert!(is_ancestor(&repo, base, a).unwrap());
        assert!(is_ancestor(&repo, a, a).unwrap());
        assert!(!is_ancestor(&repo, a, b).unwrap());

        let unrelated = CommitBuilder::new(&repo).tree(tree).message("other root").commit().unwrap();
        assert_eq!(find_merge_base(&repo, a, unrelated).unwrap(), None);
    }

    #[test]
    fn test_diff_trees() {
        let (_dir, repo) = setup();
        let old = tree_with(&repo, &[("keep.txt", "same\n"), ("edit.txt", "before\n")]);
        let new = tree_with(&repo, &[("keep.txt", "same\n"), ("edit.txt", "after\n"), ("new.txt", "x\n")]);

        let changes = diff_trees(&repo, Some(old), new).unwrap();
        assert_eq!(changes.len(), 2);
        assert!(changes
            .iter()
            .any(|c| c.path == PathBuf::from("edit.txt") && c.status == ChangeStatus::Modified));
        assert!(changes
            .iter()
            .any(|c| c.path == PathBuf::from("new.txt") && c.status == ChangeStatus::Added));

        let patch = diff_patch(&repo, Some(old), new).unwrap();
        assert!(patch.contains("-before"));
        assert!(patch.contains("+after"));
    }
}
