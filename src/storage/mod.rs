//! storage layer for wsync
//!
//! this module provides the object-store abstraction the engines write
//! through. The upper layers (lifecycle, reconciliation, promote, restack)
//! use the [`ObjectStore`] trait and never touch git2 directly.
//!
//!  # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │              ObjectStore  (implemented by GitRepository)    │
//! └─────────────────────────────────────────────────────────────┘
//!        │              │              │              │
//!        ▼              ▼              ▼              ▼
//!  ┌───────────┐  ┌───────────┐  ┌───────────┐  ┌───────────┐
//!  │   refs    │  │   tree    │  │  remote   │  │   notes   │
//!  │   (CAS)   │  │ (merges)  │  │  (lease)  │  │  (meta)   │
//!  └───────────┘  └───────────┘  └───────────┘  └───────────┘
//!                       │
//!                       ▼
//!                ┌─────────────┐
//!                │   commit    │
//!                │  (history)  │
//!                └─────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use wsync::storage::{GitRepository, ObjectStore};
//!
//! let repo = GitRepository::open(".")?;
//! let tree = repo.snapshot_workdir(&|rel, _| rel.starts_with(".wsync"))?;
//! let draft = repo.create_commit(tree, &[base], "[draft] WIP")?;
//! ```

mod commit;
mod error;
mod notes;
mod refs;
mod remote;
mod repository;
mod store;
mod tree;
mod types;

pub use commit::{CommitBuilder, CommitInfo};
pub use error::{StorageError, StorageResult};
pub use repository::GitRepository;
pub use store::ObjectStore;
pub use tree::{conflict_block, has_conflict_markers, SkipFn, TreeMerge};
pub use types::{
    BranchName, Change, ChangeStatus, CommitId, Expect, GitSignature, InvalidNameError, RefName,
    RefUpdate, TreeId,
};
