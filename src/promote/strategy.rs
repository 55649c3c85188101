//! Building published commits.
//!
//! Every strategy works on trees in the object store: a checkpoint is
//! replayed by merging its own change (parent tree to checkpoint tree) into
//! the tree it lands on. Nothing is committed to a ref here.

use std::path::PathBuf;

use crate::identity::trailers::{self, CHANGE_ID};
use crate::identity::ChangeId;
use crate::policy::Strategy;
use crate::storage::{CommitId, ObjectStore, StorageError, StorageResult, TreeId, TreeMerge};

/// Commits written for one promote.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Built {
    /// oldest first; the last one is the new target tip
    pub published: Vec<CommitId>,
    pub merge_commit: Option<CommitId>,
}

impl Built {
    pub fn tip(&self) -> Option<CommitId> {
        self.published.last().copied()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildOutcome {
    Built(Built),
    Conflict { checkpoint: CommitId, paths: Vec<PathBuf> },
}

/// Replay `checkpoint`'s own change onto `onto`.
pub fn replay_tree(store: &dyn ObjectStore, onto: TreeId, checkpoint: CommitId) -> StorageResult<TreeMerge> {
    let info = store.commit_info(checkpoint)?;
    let parent_tree = match info.first_parent() {
        Some(parent) => Some(store.tree_of(parent)?),
        None => None,
    };
    if parent_tree == Some(onto) {
        return Ok(TreeMerge::Clean(info.tree_id));
    }
    store.merge_trees(parent_tree, onto, info.tree_id)
}

/// Build the commits `strategy` publishes for `chain` (oldest first) on
/// top of `base_tip`.
pub fn build(
    store: &dyn ObjectStore,
    strategy: Strategy,
    base_tip: CommitId,
    chain: &[CommitId],
    change_id: &ChangeId,
) -> StorageResult<BuildOutcome> {
    let Some(&last) = chain.last() else {
        return Err(StorageError::Internal("empty checkpoint chain".to_string()));
    };
    match strategy {
        Strategy::Rebase => {
            let mut tip = base_tip;
            let mut published = Vec::with_capacity(chain.len());
            for &checkpoint in chain {
                let tree = match replay_tree(store, store.tree_of(tip)?, checkpoint)? {
                    TreeMerge::Clean(tree) => tree,
                    TreeMerge::Conflicted { paths } => return Ok(BuildOutcome::Conflict { checkpoint, paths }),
                };
                let message = store.commit_info(checkpoint)?.message;
                tip = store.create_commit(tree, &[tip], &message)?;
                published.push(tip);
            }
            Ok(BuildOutcome::Built(Built {
                published,
                merge_commit: None,
            }))
        }
        Strategy::Squash => {
            let mut tree = store.tree_of(base_tip)?;
            for &checkpoint in chain {
                tree = match replay_tree(store, tree, checkpoint)? {
                    TreeMerge::Clean(tree) => tree,
                    TreeMerge::Conflicted { paths } => return Ok(BuildOutcome::Conflict { checkpoint, paths }),
                };
            }
            let message = final_message(store, last, change_id)?;
            let squashed = store.create_commit(tree, &[base_tip], &message)?;
            Ok(BuildOutcome::Built(Built {
                published: vec![squashed],
                merge_commit: None,
            }))
        }
        Strategy::Merge => {
            let ancestor = match store.merge_base(base_tip, last)? {
                Some(sha) => Some(store.tree_of(sha)?),
                None => None,
            };
            let tree = match store.merge_trees(ancestor, store.tree_of(base_tip)?, store.tree_of(last)?)? {
                TreeMerge::Clean(tree) => tree,
                TreeMerge::Conflicted { paths } => {
                    return Ok(BuildOutcome::Conflict {
                        checkpoint: last,
                        paths,
                    })
                }
            };
            let message = final_message(store, last, change_id)?;
            let merge = store.create_commit(tree, &[base_tip, last], &message)?;
            Ok(BuildOutcome::Built(Built {
                published: vec![merge],
                merge_commit: Some(merge),
            }))
        }
    }
}

fn final_message(store: &dyn ObjectStore, checkpoint: CommitId, change_id: &ChangeId) -> StorageResult<String> {
    let message = store.commit_info(checkpoint)?.message;
    Ok(trailers::ensure_trailer(&message, CHANGE_ID, change_id.as_str()))
}
