//! Suggestions: proposed commits waiting for accept or reject.
//!
//! Each suggestion is a JSON note on its suggested commit under
//! `refs/notes/wsync/suggestions`, and the commit itself is pinned by a
//! `refs/wsync/suggest/<changeId>/<id>` ref so it survives gc.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;
use ulid::Ulid;

use crate::identity::refs::{suggest_ref, NOTES_SUGGESTIONS};
use crate::identity::trailers::extract_change_id;
use crate::identity::ChangeId;
use crate::storage::{CommitId, Expect, ObjectStore, StorageError, StorageResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SuggestionStatus {
    #[serde(alias = "open")]
    Pending,
    #[serde(alias = "accepted")]
    Applied,
    Rejected,
    Stale,
}

impl SuggestionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SuggestionStatus::Pending => "pending",
            SuggestionStatus::Applied => "applied",
            SuggestionStatus::Rejected => "rejected",
            SuggestionStatus::Stale => "stale",
        }
    }

    /// transitions only ever leave `pending`
    pub fn can_transition_to(&self, next: SuggestionStatus) -> bool {
        *self == SuggestionStatus::Pending && next != SuggestionStatus::Pending
    }
}

impl fmt::Display for SuggestionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SuggestionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" | "open" => Ok(SuggestionStatus::Pending),
            "applied" | "accepted" => Ok(SuggestionStatus::Applied),
            "rejected" => Ok(SuggestionStatus::Rejected),
            "stale" => Ok(SuggestionStatus::Stale),
            other => Err(format!("unknown suggestion status '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Suggestion {
    pub suggestion_id: String,
    pub change_id: ChangeId,
    pub base_commit_sha: CommitId,
    pub suggested_commit_sha: CommitId,
    pub created_by: String,
    pub reason: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub confidence: f64,
    pub status: SuggestionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution_message: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
    /// merge suggestions: the workspace ref when the merge was computed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace_tip: Option<CommitId>,
    /// merge suggestions: the remote's workspace ref at the same moment
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace_remote: Option<CommitId>,
}

/// Input for [`SuggestionStore::create`].
#[derive(Debug, Clone, Default)]
pub struct NewSuggestion {
    /// derived from the base commit when absent
    pub change_id: Option<ChangeId>,
    pub base: Option<CommitId>,
    pub suggested: Option<CommitId>,
    pub created_by: String,
    pub reason: String,
    pub description: String,
    pub confidence: f64,
    pub workspace_tip: Option<CommitId>,
    pub workspace_remote: Option<CommitId>,
}

pub struct SuggestionStore<'a> {
    store: &'a dyn ObjectStore,
}

impl<'a> SuggestionStore<'a> {
    pub fn new(store: &'a dyn ObjectStore) -> Self {
        Self { store }
    }

    pub fn create(&self, req: NewSuggestion) -> StorageResult<Suggestion> {
        let (base, suggested) = match (req.base, req.suggested) {
            (Some(base), Some(suggested)) => (base, suggested),
            _ => return Err(StorageError::Internal("base and suggested commit required".into())),
        };
        let change_id = match req.change_id {
            Some(id) => id,
            None => {
                let message = self.store.commit_info(base)?.message;
                extract_change_id(&message).unwrap_or_else(|| ChangeId::fallback_for(base))
            }
        };

        let created_by = req.created_by.trim();
        let reason = req.reason.trim();
        let suggestion = Suggestion {
            suggestion_id: Ulid::new().to_string(),
            change_id,
            base_commit_sha: base,
            suggested_commit_sha: suggested,
            created_by: if created_by.is_empty() { "user".into() } else { created_by.into() },
            reason: if reason.is_empty() { "unspecified".into() } else { reason.into() },
            description: req.description.trim().to_string(),
            confidence: req.confidence,
            status: SuggestionStatus::Pending,
            resolution_message: None,
            created_at: Utc::now(),
            resolved_at: None,
            workspace_tip: req.workspace_tip,
            workspace_remote: req.workspace_remote,
        };

        // pin first so the note never points at a collectable commit
        let pin = suggest_ref(&suggestion.change_id, &suggestion.suggestion_id)?;
        self.store.update_ref(&pin, suggested, Expect::Any, "wsync: pin suggestion")?;
        self.write(&suggestion)?;
        debug!(id = %suggestion.suggestion_id, change = %suggestion.change_id.short(), "suggestion created");
        Ok(suggestion)
    }

    /// All suggestions, oldest first.
    pub fn all(&self) -> StorageResult<Vec<Suggestion>> {
        let mut out = Vec::new();
        for (_, body) in self.store.list_notes(NOTES_SUGGESTIONS)? {
            match serde_json::from_str::<Suggestion>(&body) {
                Ok(s) => out.push(s),
                Err(e) => debug!(error = %e, "skipping unreadable suggestion note"),
            }
        }
        out.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.suggestion_id.cmp(&b.suggestion_id))
        });
        Ok(out)
    }

    pub fn list(&self, change_id: Option<&ChangeId>, status: Option<SuggestionStatus>) -> StorageResult<Vec<Suggestion>> {
        Ok(self
            .all()?
            .into_iter()
            .filter(|s| change_id.map_or(true, |id| &s.change_id == id))
            .filter(|s| status.map_or(true, |st| s.status == st))
            .collect())
    }

    pub fn get(&self, id: &str) -> StorageResult<Option<Suggestion>> {
        let id = id.trim();
        Ok(self.all()?.into_iter().find(|s| s.suggestion_id == id))
    }

    pub fn pending_count(&self, change_id: &ChangeId) -> StorageResult<usize> {
        Ok(self.list(Some(change_id), Some(SuggestionStatus::Pending))?.len())
    }

    /// Move a suggestion out of `pending`. Returns `Ok(None)` when the id is
    /// unknown; a second resolution of the same suggestion is refused.
    pub fn set_status(
        &self,
        id: &str,
        status: SuggestionStatus,
        resolution: Option<&str>,
    ) -> StorageResult<Option<Suggestion>> {
        let Some(mut suggestion) = self.get(id)? else {
            return Ok(None);
        };
        if !suggestion.status.can_transition_to(status) {
            return Err(StorageError::Internal(format!(
                "suggestion {} cannot move from {} to {}",
                suggestion.suggestion_id, suggestion.status, status
            )));
        }
        suggestion.status = status;
        if let Some(message) = resolution.map(str::trim).filter(|m| !m.is_empty()) {
            suggestion.resolution_message = Some(message.to_string());
        }
        suggestion.resolved_at = Some(Utc::now());
        self.write(&suggestion)?;
        Ok(Some(suggestion))
    }

    /// Drop the note and pin ref of every suggestion based on `base`.
    pub fn remove_for_base(&self, base: CommitId) -> StorageResult<usize> {
        let mut removed = 0;
        for suggestion in self.all()?.into_iter().filter(|s| s.base_commit_sha == base) {
            self.store.remove_note(NOTES_SUGGESTIONS, suggestion.suggested_commit_sha)?;
            let pin = suggest_ref(&suggestion.change_id, &suggestion.suggestion_id)?;
            self.store.delete_ref(&pin)?;
            removed += 1;
        }
        Ok(removed)
    }

    fn write(&self, suggestion: &Suggestion) -> StorageResult<()> {
        let body = serde_json::to_string(suggestion)?;
        self.store
            .write_note(NOTES_SUGGESTIONS, suggestion.suggested_commit_sha, &body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::trailers::draft_message;
    use crate::storage::GitRepository;
    use tempfile::TempDir;

    fn setup() -> (TempDir, GitRepository, ChangeId, CommitId, CommitId) {
        let dir = TempDir::new().unwrap();
        let repo = GitRepository::init(dir.path()).unwrap();
        let id = ChangeId::generate();
        let tree = repo.empty_tree().unwrap();
        let base = repo.create_commit(tree, &[], &draft_message(&id)).unwrap();
        let suggested = repo.create_commit(tree, &[base], "suggested\n").unwrap();
        (dir, repo, id, base, suggested)
    }

    #[test]
    fn test_create_derives_change_id_and_pins() {
        let (_dir, repo, id, base, suggested) = setup();
        let store = SuggestionStore::new(&repo);
        let s = store
            .create(NewSuggestion {
                base: Some(base),
                suggested: Some(suggested),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(s.change_id, id);
        assert_eq!(s.status, SuggestionStatus::Pending);
        assert_eq!(s.created_by, "user");
        assert_eq!(s.reason, "unspecified");

        let pin = suggest_ref(&id, &s.suggestion_id).unwrap();
        assert_eq!(repo.resolve_ref(pin.as_str()).unwrap(), Some(suggested));
        assert_eq!(store.pending_count(&id).unwrap(), 1);
        assert_eq!(store.get(&s.suggestion_id).unwrap(), Some(s));
    }

    #[test]
    fn test_status_transitions_are_one_way() {
        let (_dir, repo, id, base, suggested) = setup();
        let store = SuggestionStore::new(&repo);
        let s = store
            .create(NewSuggestion {
                change_id: Some(id.clone()),
                base: Some(base),
                suggested: Some(suggested),
                reason: "merge_conflict".into(),
                ..Default::default()
            })
            .unwrap();

        let applied = store
            .set_status(&s.suggestion_id, SuggestionStatus::Applied, Some("merged"))
            .unwrap()
            .unwrap();
        assert_eq!(applied.status, SuggestionStatus::Applied);
        assert_eq!(applied.resolution_message.as_deref(), Some("merged"));
        assert!(applied.resolved_at.is_some());

        let again = store.set_status(&s.suggestion_id, SuggestionStatus::Rejected, None);
        assert!(matches!(again, Err(StorageError::Internal(_))));
        assert!(store.set_status("missing", SuggestionStatus::Applied, None).unwrap().is_none());
        assert_eq!(store.pending_count(&id).unwrap(), 0);
    }

    #[test]
    fn test_legacy_status_aliases() {
        assert_eq!("open".parse::<SuggestionStatus>().unwrap(), SuggestionStatus::Pending);
        assert_eq!("Accepted".parse::<SuggestionStatus>().unwrap(), SuggestionStatus::Applied);
        let parsed: SuggestionStatus = serde_json::from_str("\"accepted\"").unwrap();
        assert_eq!(parsed, SuggestionStatus::Applied);
    }

    #[test]
    fn test_remove_for_base() {
        let (_dir, repo, id, base, suggested) = setup();
        let store = SuggestionStore::new(&repo);
        let s = store
            .create(NewSuggestion {
                change_id: Some(id.clone()),
                base: Some(base),
                suggested: Some(suggested),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(store.remove_for_base(base).unwrap(), 1);
        assert!(store.all().unwrap().is_empty());
        let pin = suggest_ref(&id, &s.suggestion_id).unwrap();
        assert_eq!(repo.resolve_ref(pin.as_str()).unwrap(), None);
    }
}
