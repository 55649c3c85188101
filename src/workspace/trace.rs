//! The provenance trace chain.
//!
//! `refs/wsync/traces/<user>/<ws>` is a linear history of working-tree
//! snapshots recorded at every checkpoint. Checkpoints point into it with
//! their `Trace-Base` (trace tip before) and `Trace-Head` (trace recorded
//! for them) trailers; restack records merge-like traces that join the
//! rewritten chain with the original one.

use crate::storage::{CommitId, ObjectStore, StorageResult, TreeId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceKind {
    Checkpoint,
    Restack,
}

impl TraceKind {
    pub fn message(&self) -> &'static str {
        match self {
            TraceKind::Checkpoint => "[trace] checkpoint\n",
            TraceKind::Restack => "[trace] restack\n",
        }
    }
}

/// A trace commit that has been written but not yet published on the
/// trace ref.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Trace {
    /// trace tip the record was stacked on
    pub base: Option<CommitId>,
    pub head: CommitId,
}

/// Write a trace commit for `tree`. Parents are taken in order with
/// duplicates dropped; the ref is left alone.
pub fn record(
    store: &dyn ObjectStore,
    kind: TraceKind,
    tree: TreeId,
    parents: &[CommitId],
) -> StorageResult<Trace> {
    let mut unique: Vec<CommitId> = Vec::with_capacity(parents.len());
    for parent in parents {
        if !unique.contains(parent) {
            unique.push(*parent);
        }
    }
    let head = store.create_commit(tree, &unique, kind.message())?;
    Ok(Trace {
        base: unique.first().copied(),
        head,
    })
}

pub fn is_trace(message: &str) -> bool {
    message.trim_start().starts_with("[trace]")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::GitRepository;
    use tempfile::TempDir;

    fn setup() -> (TempDir, GitRepository) {
        let dir = TempDir::new().unwrap();
        let repo = GitRepository::init(dir.path()).unwrap();
        (dir, repo)
    }

    #[test]
    fn test_record_chain() {
        let (_dir, repo) = setup();
        let tree = repo.empty_tree().unwrap();

        let first = record(&repo, TraceKind::Checkpoint, tree, &[]).unwrap();
        assert_eq!(first.base, None);
        let second = record(&repo, TraceKind::Checkpoint, tree, &[first.head]).unwrap();
        assert_eq!(second.base, Some(first.head));

        let info = repo.commit_info(second.head).unwrap();
        assert!(is_trace(&info.message));
        assert_eq!(info.parent_ids, vec![first.head]);
    }

    #[test]
    fn test_restack_trace_joins_chains() {
        let (_dir, repo) = setup();
        let tree = repo.empty_tree().unwrap();
        let a = record(&repo, TraceKind::Checkpoint, tree, &[]).unwrap();
        let b = record(&repo, TraceKind::Checkpoint, tree, &[a.head]).unwrap();

        let joined = record(&repo, TraceKind::Restack, tree, &[a.head, b.head, a.head]).unwrap();
        let info = repo.commit_info(joined.head).unwrap();
        assert_eq!(info.parent_ids, vec![a.head, b.head]);
        assert_eq!(info.summary(), "[trace] restack");
    }
}
