//! CI attestations keyed by commit.
//!
//! A commit without its own result may carry an inheritance record pointing
//! at an ancestor's attestation; reading through it yields a stale view.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::identity::refs::NOTES_ATTESTATIONS;
use crate::identity::trailers::extract_change_id;
use crate::identity::ChangeId;
use crate::storage::{CommitId, ObjectStore, StorageResult};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attestation {
    pub attestation_id: String,
    pub commit_sha: CommitId,
    pub change_id: ChangeId,
    /// overall status; empty on inheritance records
    #[serde(default)]
    pub status: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub compile_status: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub test_status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coverage_line_pct: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coverage_branch_pct: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inherit_from: Option<CommitId>,
    pub created_at: DateTime<Utc>,
}

/// CI result fields supplied by the caller.
#[derive(Debug, Clone, Default)]
pub struct AttestationInput {
    pub status: String,
    pub compile_status: String,
    pub test_status: String,
    pub coverage_line_pct: Option<f64>,
    pub coverage_branch_pct: Option<f64>,
}

/// The attestation that applies to a commit.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttestationView {
    pub attestation: Attestation,
    /// result came from an ancestor through inheritance
    pub stale: bool,
}

pub struct AttestationStore<'a> {
    store: &'a dyn ObjectStore,
}

impl<'a> AttestationStore<'a> {
    pub fn new(store: &'a dyn ObjectStore) -> Self {
        Self { store }
    }

    pub fn record(&self, commit: CommitId, input: AttestationInput) -> StorageResult<Attestation> {
        let attestation = Attestation {
            attestation_id: Ulid::new().to_string(),
            commit_sha: commit,
            change_id: self.change_id_of(commit)?,
            status: input.status.trim().to_string(),
            compile_status: input.compile_status.trim().to_string(),
            test_status: input.test_status.trim().to_string(),
            coverage_line_pct: input.coverage_line_pct,
            coverage_branch_pct: input.coverage_branch_pct,
            inherit_from: None,
            created_at: Utc::now(),
        };
        self.write(&attestation)?;
        Ok(attestation)
    }

    pub fn get(&self, commit: CommitId) -> StorageResult<Option<Attestation>> {
        match self.store.read_note(NOTES_ATTESTATIONS, commit)? {
            Some(body) => Ok(Some(serde_json::from_str(&body)?)),
            None => Ok(None),
        }
    }

    /// Point `commit` at `from`'s result. A commit that already has a result
    /// or an inheritance record keeps it.
    pub fn record_inheritance(&self, commit: CommitId, from: CommitId) -> StorageResult<bool> {
        if commit == from {
            return Ok(false);
        }
        if let Some(existing) = self.get(commit)? {
            if !existing.status.is_empty() || existing.inherit_from.is_some() {
                return Ok(false);
            }
        }
        let attestation = Attestation {
            attestation_id: Ulid::new().to_string(),
            commit_sha: commit,
            change_id: self.change_id_of(commit)?,
            status: String::new(),
            compile_status: String::new(),
            test_status: String::new(),
            coverage_line_pct: None,
            coverage_branch_pct: None,
            inherit_from: Some(from),
            created_at: Utc::now(),
        };
        self.write(&attestation)?;
        Ok(true)
    }

    /// Resolve the result that applies to `commit`, following one
    /// inheritance hop.
    pub fn view(&self, commit: CommitId) -> StorageResult<Option<AttestationView>> {
        let Some(own) = self.get(commit)? else {
            return Ok(None);
        };
        if !own.status.is_empty() {
            return Ok(Some(AttestationView {
                attestation: own,
                stale: false,
            }));
        }
        if let Some(from) = own.inherit_from {
            if let Some(inherited) = self.get(from)? {
                if !inherited.status.is_empty() {
                    return Ok(Some(AttestationView {
                        attestation: inherited,
                        stale: true,
                    }));
                }
            }
        }
        Ok(Some(AttestationView {
            attestation: own,
            stale: false,
        }))
    }

    pub fn remove(&self, commit: CommitId) -> StorageResult<bool> {
        self.store.remove_note(NOTES_ATTESTATIONS, commit)
    }

    fn change_id_of(&self, commit: CommitId) -> StorageResult<ChangeId> {
        let message = self.store.commit_info(commit)?.message;
        Ok(extract_change_id(&message).unwrap_or_else(|| ChangeId::fallback_for(commit)))
    }

    fn write(&self, attestation: &Attestation) -> StorageResult<()> {
        let body = serde_json::to_string(attestation)?;
        self.store.write_note(NOTES_ATTESTATIONS, attestation.commit_sha, &body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::GitRepository;
    use tempfile::TempDir;

    fn setup() -> (TempDir, GitRepository, CommitId, CommitId) {
        let dir = TempDir::new().unwrap();
        let repo = GitRepository::init(dir.path()).unwrap();
        let tree = repo.empty_tree().unwrap();
        let first = repo.create_commit(tree, &[], "first\n").unwrap();
        let second = repo.create_commit(tree, &[first], "second\n").unwrap();
        (dir, repo, first, second)
    }

    #[test]
    fn test_record_and_view() {
        let (_dir, repo, first, _) = setup();
        let store = AttestationStore::new(&repo);
        let att = store
            .record(
                first,
                AttestationInput {
                    status: "pass".into(),
                    coverage_line_pct: Some(91.0),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(att.change_id, ChangeId::fallback_for(first));

        let view = store.view(first).unwrap().unwrap();
        assert!(!view.stale);
        assert_eq!(view.attestation.coverage_line_pct, Some(91.0));
    }

    #[test]
    fn test_inherited_view_is_stale() {
        let (_dir, repo, first, second) = setup();
        let store = AttestationStore::new(&repo);
        assert!(store.view(second).unwrap().is_none());

        store
            .record(first, AttestationInput { status: "pass".into(), ..Default::default() })
            .unwrap();
        assert!(store.record_inheritance(second, first).unwrap());
        // existing records win
        assert!(!store.record_inheritance(second, first).unwrap());

        let view = store.view(second).unwrap().unwrap();
        assert!(view.stale);
        assert_eq!(view.attestation.commit_sha, first);

        // a real result replaces the inheritance record
        store
            .record(second, AttestationInput { status: "fail".into(), ..Default::default() })
            .unwrap();
        let view = store.view(second).unwrap().unwrap();
        assert!(!view.stale);
        assert_eq!(view.attestation.status, "fail");
    }
}
