//! Storage layer error types
//!
//! All errors that can occur while talking to the object store are defined here.
//! We use `thiserror` for ergonomic error definition and better error messages

use std::path::PathBuf;

use thiserror::Error;

use crate::storage::types::InvalidNameError;

/// the main error type for object store operations
#[derive(Debug, Error)]
pub enum StorageError {
    /// error from the underlying Git library
    #[error("git error: {0}")]
    Git(#[from] git2::Error),

    /// the specified ref was not found
    #[error("ref not found: {0}")]
    RefNotFound(String),

    /// the commit was not found
    #[error("commit not found: {0}")]
    CommitNotFound(String),

    /// invalid ref or branch name
    #[error("invalid name: {0}")]
    InvalidName(#[from] InvalidNameError),

    /// JSON serialization or deserialization failed
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// ref update lost a compare-and-swap race
    #[error("concurrent modification: {reference} was updated by another writer")]
    ConcurrentModification { reference: String },

    /// the named remote is not configured
    #[error("remote not found: {0}")]
    RemoteNotFound(String),

    /// the remote refused a push (lease mismatch or server-side rejection)
    #[error("push of {reference} rejected: {reason}")]
    PushRejected { reference: String, reason: String },

    /// repo could not be opened at the path
    #[error("repository not found: {0}")]
    NotInitialized(PathBuf),

    /// repository has no working directory
    #[error("repository is bare: {0}")]
    BareRepository(PathBuf),

    /// I/O error (filesystem level)
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// the tree entry has an unexpected type
    #[error("unexpected entry at {path}: {reason}")]
    UnexpectedEntry { path: PathBuf, reason: String },

    /// internal error that shouldn't happen
    #[error("internal error: {0}")]
    Internal(String),
}

impl StorageError {
    /// check if this error indicates the resource doesn't exist
    pub fn is_not_found(&self) -> bool {
        match self {
            StorageError::RefNotFound(_)
            | StorageError::CommitNotFound(_)
            | StorageError::RemoteNotFound(_) => true,
            StorageError::Git(e) => e.code() == git2::ErrorCode::NotFound,
            _ => false,
        }
    }

    /// check if this error is a lost race against another writer
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            StorageError::ConcurrentModification { .. } | StorageError::PushRejected { .. }
        )
    }

    /// check if this error is recoverable by re-running reconciliation
    pub fn is_retriable(&self) -> bool {
        self.is_conflict()
    }
}

/// result type alias for storage operations
pub type StorageResult<T> = Result<T, StorageError>;
