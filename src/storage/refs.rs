//! Reference management.
//!
//! Git refs are pointers to commits. This module handles:
//! - ref resolution (direct and symbolic)
//! - prefix listing of the private `refs/wsync/` namespace
//! - compare-and-swap updates, the only concurrency primitive the engine has
//!
//! Every write goes through [`RefManager::update`] so a lost race always
//! surfaces as [`StorageError::ConcurrentModification`].

use git2::{ErrorCode, Repository};

use crate::storage::error::{StorageError, StorageResult};
use crate::storage::types::{CommitId, Expect, RefName, RefUpdate};

/// Manages Git references.
pub struct RefManager;

impl RefManager {
    /// Resolve a ref to the commit it points at, `None` when absent.
    pub fn resolve(repo: &Repository, name: &str) -> StorageResult<Option<CommitId>> {
        match repo.refname_to_id(name) {
            Ok(oid) => Ok(Some(CommitId::new(oid))),
            Err(e) if e.code() == ErrorCode::NotFound => Ok(None),
            Err(e) if e.code() == ErrorCode::InvalidSpec => {
                Err(StorageError::RefNotFound(name.to_string()))
            }
            Err(e) => Err(StorageError::Git(e)),
        }
    }

    /// Get the commit HEAD points at; `None` on an unborn branch.
    pub fn head_commit(repo: &Repository) -> StorageResult<Option<CommitId>> {
        let head = match repo.head() {
            Ok(head) => head,
            Err(e) if e.code() == ErrorCode::UnbornBranch || e.code() == ErrorCode::NotFound => {
                return Ok(None)
            }
            Err(e) => return Err(StorageError::Git(e)),
        };
        let commit = head.peel_to_commit()?;
        Ok(Some(CommitId::new(commit.id())))
    }

    /// List every direct ref under `prefix`, sorted by name.
    pub fn list(repo: &Repository, prefix: &str) -> StorageResult<Vec<(RefName, CommitId)>> {
        let mut result = Vec::new();
        for reference in repo.references()? {
            let reference = reference?;
            let Some(name) = reference.name() else {
                continue;
            };
            if !name.starts_with(prefix) {
                continue;
            }
            let Some(target) = reference.target() else {
                continue;
            };
            if let Ok(ref_name) = RefName::new(name) {
                result.push((ref_name, CommitId::new(target)));
            }
        }
        result.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(result)
    }

    /// Point `name` at `target` if its current value matches `expect`.
    ///
    /// This provides compare-and-swap semantics for safe concurrent updates.
    pub fn update(
        repo: &Repository,
        name: &RefName,
        target: CommitId,
        expect: Expect,
        reason: &str,
    ) -> StorageResult<()> {
        let result = match expect {
            Expect::Any => repo.reference(name.as_str(), target.raw(), true, reason).map(|_| ()),
            Expect::Absent => match Self::resolve(repo, name.as_str())? {
                // already where we want it: the write is idempotent
                Some(current) if current == target => Ok(()),
                _ => repo.reference(name.as_str(), target.raw(), false, reason).map(|_| ()),
            },
            Expect::Value(current) if current == target => {
                match Self::resolve(repo, name.as_str())? {
                    Some(actual) if actual == current => Ok(()),
                    _ => {
                        return Err(StorageError::ConcurrentModification {
                            reference: name.to_string(),
                        })
                    }
                }
            }
            Expect::Value(current) => repo
                .reference_matching(name.as_str(), target.raw(), true, current.raw(), reason)
                .map(|_| ()),
        };

        result.map_err(|e| match e.code() {
            ErrorCode::Modified | ErrorCode::Exists | ErrorCode::NotFound => {
                StorageError::ConcurrentModification {
                    reference: name.to_string(),
                }
            }
            _ => StorageError::Git(e),
        })
    }

    /// Apply a burst of updates in order. Each entry is individually
    /// idempotent; the first failure stops the burst.
    ///
    /// Every expectation is checked before the first write, so a burst that
    /// already lost a race moves nothing.
    pub fn apply(repo: &Repository, updates: &[RefUpdate], reason: &str) -> StorageResult<()> {
        for update in updates {
            Self::check(repo, update)?;
        }
        for update in updates {
            Self::update(repo, &update.name, update.target, update.expect, reason)?;
        }
        Ok(())
    }

    /// Fail with `ConcurrentModification` unless `update`'s expectation
    /// holds right now.
    fn check(repo: &Repository, update: &RefUpdate) -> StorageResult<()> {
        let current = Self::resolve(repo, update.name.as_str())?;
        let holds = match update.expect {
            Expect::Any => true,
            Expect::Absent => current.is_none() || current == Some(update.target),
            Expect::Value(expected) => current == Some(expected),
        };
        if holds {
            Ok(())
        } else {
            Err(StorageError::ConcurrentModification {
                reference: update.name.to_string(),
            })
        }
    }

    /// Delete a ref. Returns false when it did not exist.
    pub fn delete(repo: &Repository, name: &RefName) -> StorageResult<bool> {
        match repo.find_reference(name.as_str()) {
            Ok(mut reference) => {
                reference.delete()?;
                Ok(true)
            }
            Err(e) if e.code() == ErrorCode::NotFound => Ok(false),
            Err(e) => Err(StorageError::Git(e)),
        }
    }

    /// Point HEAD at a branch ref (symbolic).
    pub fn set_head(repo: &Repository, name: &RefName) -> StorageResult<()> {
        repo.set_head(name.as_str())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn setup() -> (TempDir, Repository, CommitId, CommitId) {
        let dir = TempDir::new().unwrap();
        let repo = Repository::init(dir.path()).unwrap();

        let (first, second) = {
            let tree_id = repo.treebuilder(None).unwrap().write().unwrap();
            let tree = repo.find_tree(tree_id).unwrap();
            let sig = git2::Signature::now("Test", "test@test.com").unwrap();
            let first = repo
                .commit(Some("HEAD"), &sig, &sig, "first", &tree, &[])
                .unwrap();
            let parent = repo.find_commit(first).unwrap();
            let second = repo
                .commit(None, &sig, &sig, "second", &tree, &[&parent])
                .unwrap();
            (CommitId::new(first), CommitId::new(second))
        };

        (dir, repo, first, second)
    }

    #[test]
    fn test_resolve_missing_ref() {
        let (_dir, repo, _, _) = setup();
        let resolved = RefManager::resolve(&repo, "refs/wsync/workspaces/alice/@").unwrap();
        assert!(resolved.is_none());
    }

    #[test]
    fn test_head_commit() {
        let (_dir, repo, first, _) = setup();
        assert_eq!(RefManager::head_commit(&repo).unwrap(), Some(first));
    }

    #[test]
    fn test_update_absent_then_value() {
        let (_dir, repo, first, second) = setup();
        let name = RefName::new("refs/wsync/workspaces/alice/@").unwrap();

        RefManager::update(&repo, &name, first, Expect::Absent, "create").unwrap();
        assert_eq!(RefManager::resolve(&repo, name.as_str()).unwrap(), Some(first));

        // re-creating at the same target is a no-op
        RefManager::update(&repo, &name, first, Expect::Absent, "create").unwrap();

        let result = RefManager::update(&repo, &name, second, Expect::Absent, "create");
        assert!(matches!(result, Err(StorageError::ConcurrentModification { .. })));

        RefManager::update(&repo, &name, second, Expect::Value(first), "advance").unwrap();
        assert_eq!(RefManager::resolve(&repo, name.as_str()).unwrap(), Some(second));

        // stale expectation loses the race
        let result = RefManager::update(&repo, &name, first, Expect::Value(first), "stale");
        assert!(matches!(result, Err(StorageError::ConcurrentModification { .. })));
        assert_eq!(RefManager::resolve(&repo, name.as_str()).unwrap(), Some(second));
    }

    #[test]
    fn test_lost_burst_writes_nothing() {
        let (_dir, repo, first, second) = setup();
        let keep = RefName::new("refs/wsync/keep/alice/@/Iabc/one").unwrap();
        let sync = RefName::new("refs/wsync/sync/alice/laptop/@").unwrap();
        RefManager::update(&repo, &sync, second, Expect::Any, "moved elsewhere").unwrap();

        let result = RefManager::apply(
            &repo,
            &[
                RefUpdate::new(keep.clone(), first),
                RefUpdate::new(sync.clone(), first).expecting(Expect::Value(first)),
            ],
            "burst",
        );
        assert!(matches!(result, Err(StorageError::ConcurrentModification { .. })));
        assert_eq!(RefManager::resolve(&repo, keep.as_str()).unwrap(), None);
        assert_eq!(RefManager::resolve(&repo, sync.as_str()).unwrap(), Some(second));
    }

    #[test]
    fn test_list_and_delete() {
        let (_dir, repo, first, second) = setup();
        let a = RefName::new("refs/wsync/keep/alice/@/Iabc/one").unwrap();
        let b = RefName::new("refs/wsync/keep/alice/@/Iabc/two").unwrap();
        let other = RefName::new("refs/wsync/changes/Iabc").unwrap();
        RefManager::apply(
            &repo,
            &[
                RefUpdate::new(a.clone(), first),
                RefUpdate::new(b.clone(), second),
                RefUpdate::new(other, second),
            ],
            "burst",
        )
        .unwrap();

        let keeps = RefManager::list(&repo, "refs/wsync/keep/").unwrap();
        assert_eq!(keeps.len(), 2);
        assert_eq!(keeps[0], (a.clone(), first));

        assert!(RefManager::delete(&repo, &a).unwrap());
        assert!(!RefManager::delete(&repo, &a).unwrap());
        assert_eq!(RefManager::list(&repo, "refs/wsync/keep/").unwrap().len(), 1);
    }
}
