//! Per-change side metadata and per-published-commit promote notes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::identity::refs::{NOTES_CHANGE_ID, NOTES_META};
use crate::identity::ChangeId;
use crate::policy::Strategy;
use crate::storage::{CommitId, ObjectStore, StorageResult};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeCheckpoint {
    pub sha: CommitId,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromoteEvent {
    pub target: String,
    pub strategy: Strategy,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub checkpoint_shas: Vec<CommitId>,
    #[serde(default)]
    pub published_shas: Vec<CommitId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merge_commit_sha: Option<CommitId>,
}

/// Stored as a note on the change's anchor commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeMeta {
    pub change_id: ChangeId,
    pub anchor_sha: CommitId,
    #[serde(default)]
    pub checkpoints: Vec<ChangeCheckpoint>,
    #[serde(default)]
    pub promote_events: Vec<PromoteEvent>,
}

impl ChangeMeta {
    pub fn new(change_id: ChangeId, anchor_sha: CommitId) -> Self {
        Self {
            change_id,
            anchor_sha,
            checkpoints: Vec::new(),
            promote_events: Vec::new(),
        }
    }

    /// append unless already listed
    pub fn add_checkpoint(&mut self, sha: CommitId, message: &str) {
        if self.checkpoints.iter().any(|c| c.sha == sha) {
            return;
        }
        self.checkpoints.push(ChangeCheckpoint {
            sha,
            message: message.trim().to_string(),
        });
    }

    /// Record a promote and return its 1-based event id.
    pub fn push_event(&mut self, event: PromoteEvent) -> usize {
        self.promote_events.push(event);
        self.promote_events.len()
    }

    /// a change stays open until it has been promoted once
    pub fn is_open(&self) -> bool {
        self.promote_events.is_empty()
    }
}

/// Reverse index from a published commit back to its change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeIdNote {
    pub change_id: ChangeId,
    pub promote_event_id: usize,
    pub strategy: Strategy,
    /// rebase: the checkpoint this commit replays
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_checkpoint_sha: Option<CommitId>,
    /// squash and merge: every checkpoint folded in
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub checkpoint_shas: Vec<CommitId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_base: Option<CommitId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_head: Option<CommitId>,
}

pub struct ChangeMetaStore<'a> {
    store: &'a dyn ObjectStore,
}

impl<'a> ChangeMetaStore<'a> {
    pub fn new(store: &'a dyn ObjectStore) -> Self {
        Self { store }
    }

    pub fn read(&self, anchor: CommitId) -> StorageResult<Option<ChangeMeta>> {
        match self.store.read_note(NOTES_META, anchor)? {
            Some(body) => Ok(Some(serde_json::from_str(&body)?)),
            None => Ok(None),
        }
    }

    /// existing metadata, or a fresh record for the anchor
    pub fn read_or_new(&self, change_id: &ChangeId, anchor: CommitId) -> StorageResult<ChangeMeta> {
        Ok(self
            .read(anchor)?
            .unwrap_or_else(|| ChangeMeta::new(change_id.clone(), anchor)))
    }

    pub fn write(&self, meta: &ChangeMeta) -> StorageResult<()> {
        let body = serde_json::to_string(meta)?;
        self.store.write_note(NOTES_META, meta.anchor_sha, &body)
    }

    pub fn write_change_id_note(&self, published: CommitId, note: &ChangeIdNote) -> StorageResult<()> {
        let body = serde_json::to_string(note)?;
        self.store.write_note(NOTES_CHANGE_ID, published, &body)
    }

    pub fn read_change_id_note(&self, published: CommitId) -> StorageResult<Option<ChangeIdNote>> {
        match self.store.read_note(NOTES_CHANGE_ID, published)? {
            Some(body) => Ok(Some(serde_json::from_str(&body)?)),
            None => Ok(None),
        }
    }
}
