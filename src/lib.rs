//! wsync - multi-device workspace sync and promotion on top of git
//!
//! Every device mirrors its working tree into a draft commit on a private
//! sync ref. Checkpoints freeze a draft into an immutable, keep-ref pinned
//! commit carrying a `Change-Id`; the checkpoint chain of a change is what
//! gets promoted onto a real branch, restacked onto a newer base, or
//! reconciled with another device's work.
//!
//! All state lives in git: refs under `refs/wsync/`, JSON notes under
//! `refs/notes/wsync/`, plus a small `.wsync/` directory in the working
//! tree for the per-device lease.
//!
//! # Example
//!
//! ```no_run
//! use wsync::{Engine, GitRepository, WorkspaceContext};
//! use wsync::promote::PromoteOptions;
//!
//! let repo = GitRepository::open(".").unwrap();
//! let ctx = WorkspaceContext::from_env(&repo).unwrap();
//! let engine = Engine::new(&repo, &ctx);
//!
//! engine.checkpoint(Some("Add retry loop")).unwrap();
//! engine
//!     .promote(&PromoteOptions {
//!         target: "main".into(),
//!         ..Default::default()
//!     })
//!     .unwrap();
//! ```

pub mod agent;
pub mod context;
pub mod engine;
pub mod error;
pub mod identity;
pub mod metadata;
pub mod policy;
pub mod promote;
pub mod reconcile;
pub mod restack;
pub mod storage;
pub mod workspace;

#[cfg(test)]
mod testing;

pub use context::WorkspaceContext;
pub use engine::Engine;
pub use error::{ErrorKind, ErrorReport, WorkflowError, WorkflowResult};
pub use storage::GitRepository;
