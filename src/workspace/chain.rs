//! Checkpoint discovery: keep refs and parent chains.

use chrono::{DateTime, Utc};

use crate::identity::{refs, trailers, ChangeId, RefKind};
use crate::storage::{CommitId, ObjectStore, StorageResult};

/// A checkpoint pinned by a keep ref.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckpointEntry {
    pub sha: CommitId,
    pub change_id: ChangeId,
    pub message: String,
    pub when: DateTime<Utc>,
}

/// Every checkpoint of a workspace, newest first.
pub fn list_checkpoints(store: &dyn ObjectStore, user: &str, workspace: &str) -> StorageResult<Vec<CheckpointEntry>> {
    let prefix = format!("{}{}/{}/", refs::KEEP, user, workspace);
    let mut entries = Vec::new();
    for (name, target) in store.list_refs(&prefix)? {
        let Some(RefKind::Keep { change_id, .. }) = RefKind::parse(name.as_str()) else {
            continue;
        };
        let info = match store.commit_info(target) {
            Ok(info) => info,
            Err(e) if e.is_not_found() => continue,
            Err(e) => return Err(e),
        };
        let change_id = trailers::extract_change_id(&info.message).unwrap_or(change_id);
        entries.push(CheckpointEntry {
            sha: target,
            change_id,
            message: info.message,
            when: info.timestamp,
        });
    }
    entries.sort_by(|a, b| b.when.cmp(&a.when));
    entries.dedup_by_key(|e| e.sha);
    Ok(entries)
}

/// The newest checkpoint of `change_id`.
///
/// Candidates are the change's keep refs. `preferred` (usually the
/// workspace base) wins when it is one of them; otherwise the chain tips
/// (candidates no other candidate descends from) are compared by time.
pub fn latest_for_change(
    store: &dyn ObjectStore,
    user: &str,
    workspace: &str,
    change_id: &ChangeId,
    preferred: Option<CommitId>,
) -> StorageResult<Option<CommitId>> {
    let candidates: Vec<CheckpointEntry> = list_checkpoints(store, user, workspace)?
        .into_iter()
        .filter(|e| &e.change_id == change_id)
        .collect();
    if let Some(preferred) = preferred {
        if candidates.iter().any(|e| e.sha == preferred) {
            return Ok(Some(preferred));
        }
    }
    // newest first, so the first tip found is the newest one
    for entry in &candidates {
        let mut superseded = false;
        for other in &candidates {
            if other.sha != entry.sha && store.is_ancestor(entry.sha, other.sha)? {
                superseded = true;
                break;
            }
        }
        if !superseded {
            return Ok(Some(entry.sha));
        }
    }
    Ok(None)
}

/// Walk first parents from `latest` while the Change-Id matches, returning
/// the chain oldest to newest.
///
/// A parent only joins the chain while it is pinned by one of this
/// workspace's keep refs; published copies of earlier checkpoints carry the
/// same Change-Id but are not checkpoints themselves.
pub fn checkpoint_chain(
    store: &dyn ObjectStore,
    user: &str,
    workspace: &str,
    latest: CommitId,
    change_id: &ChangeId,
) -> StorageResult<Vec<CommitId>> {
    let mut chain = vec![latest];
    let mut current = store.commit_info(latest)?;
    while let Some(parent) = current.first_parent() {
        let info = store.commit_info(parent)?;
        if trailers::is_draft(&info.message) || trailers::extract_change_id(&info.message).as_ref() != Some(change_id) {
            break;
        }
        let pinned = match refs::keep_ref(user, workspace, change_id, parent) {
            Ok(keep) => store.resolve_ref(keep.as_str())? == Some(parent),
            Err(_) => false,
        };
        if !pinned {
            break;
        }
        chain.push(parent);
        current = info;
    }
    chain.reverse();
    Ok(chain)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::trailers::{CommitMessage, CHANGE_ID};
    use crate::storage::{Expect, GitRepository};
    use tempfile::TempDir;

    fn setup() -> (TempDir, GitRepository) {
        let dir = TempDir::new().unwrap();
        let repo = GitRepository::init(dir.path()).unwrap();
        (dir, repo)
    }

    fn checkpoint(repo: &GitRepository, parent: CommitId, id: &ChangeId, subject: &str) -> CommitId {
        let mut message = CommitMessage::new(subject);
        message.set(CHANGE_ID, id.as_str());
        let tree = repo.tree_of(parent).unwrap();
        let sha = repo.create_commit(tree, &[parent], &message.to_string()).unwrap();
        let keep = refs::keep_ref("alice", "@", id, sha).unwrap();
        repo.update_ref(&keep, sha, Expect::Absent, "test").unwrap();
        sha
    }

    #[test]
    fn test_chain_stops_at_other_change() {
        let (_dir, repo) = setup();
        let tree = repo.empty_tree().unwrap();
        let base = repo.create_commit(tree, &[], "base").unwrap();
        let id = ChangeId::generate();
        let first = checkpoint(&repo, base, &id, "one");
        let second = checkpoint(&repo, first, &id, "two");
        let third = checkpoint(&repo, second, &id, "three");

        let chain = checkpoint_chain(&repo, "alice", "@", third, &id).unwrap();
        assert_eq!(chain, vec![first, second, third]);
        assert_eq!(
            checkpoint_chain(&repo, "alice", "@", second, &id).unwrap(),
            vec![first, second]
        );

        for sha in &chain {
            let keep = refs::keep_ref("alice", "@", &id, *sha).unwrap();
            assert_eq!(repo.resolve_ref(keep.as_str()).unwrap(), Some(*sha));
        }
    }

    #[test]
    fn test_chain_skips_unpinned_copies() {
        let (_dir, repo) = setup();
        let tree = repo.empty_tree().unwrap();
        let base = repo.create_commit(tree, &[], "base").unwrap();
        let id = ChangeId::generate();

        // a published copy: same Change-Id, no keep ref
        let mut message = CommitMessage::new("published");
        message.set(CHANGE_ID, id.as_str());
        let copy = repo.create_commit(tree, &[base], &message.to_string()).unwrap();
        let next = checkpoint(&repo, copy, &id, "after promote");

        assert_eq!(checkpoint_chain(&repo, "alice", "@", next, &id).unwrap(), vec![next]);
    }

    #[test]
    fn test_latest_for_change() {
        let (_dir, repo) = setup();
        let tree = repo.empty_tree().unwrap();
        let base = repo.create_commit(tree, &[], "base").unwrap();
        let id = ChangeId::generate();
        let other = ChangeId::generate();
        let first = checkpoint(&repo, base, &id, "one");
        let second = checkpoint(&repo, first, &id, "two");
        checkpoint(&repo, base, &other, "elsewhere");

        assert_eq!(latest_for_change(&repo, "alice", "@", &id, None).unwrap(), Some(second));
        assert_eq!(latest_for_change(&repo, "alice", "@", &id, Some(first)).unwrap(), Some(first));
        assert_eq!(
            latest_for_change(&repo, "alice", "@", &ChangeId::generate(), None).unwrap(),
            None
        );
        assert_eq!(list_checkpoints(&repo, "alice", "@").unwrap().len(), 3);
    }
}
