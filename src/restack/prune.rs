//! Retention pruning of keep refs.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{debug, info};

use crate::engine::Engine;
use crate::error::WorkflowResult;
use crate::identity::{refs, ChangeId, RefKind};
use crate::metadata::{AttestationStore, ChangeMetaStore, SuggestionStore};
use crate::storage::CommitId;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PruneResult {
    /// false when retention is disabled
    pub enabled: bool,
    pub pruned_refs: usize,
    pub notes_removed: usize,
    pub suggestions_removed: usize,
}

impl<'a> Engine<'a> {
    /// Drop keep refs older than `retention_days` (the configured value by
    /// default). A negative retention disables pruning.
    pub fn prune(&self, retention_days: Option<i64>) -> WorkflowResult<PruneResult> {
        let days = retention_days.unwrap_or(self.context().retention_days);
        if days < 0 {
            info!("retention disabled; nothing to prune");
            return Ok(PruneResult::default());
        }
        // a retention reaching past the calendar keeps everything
        let cutoff = Duration::try_days(days)
            .and_then(|age| Utc::now().checked_sub_signed(age))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        self.prune_before(cutoff)
    }

    /// Drop every keep ref whose checkpoint was committed before `cutoff`,
    /// along with its attestation and the suggestions made against it. The
    /// anchor of a change that was never promoted is kept.
    pub fn prune_before(&self, cutoff: DateTime<Utc>) -> WorkflowResult<PruneResult> {
        let attestations = AttestationStore::new(self.store());
        let suggestions = SuggestionStore::new(self.store());
        let mut result = PruneResult {
            enabled: true,
            ..Default::default()
        };

        for (name, target) in self.store().list_refs(refs::KEEP)? {
            let Some(RefKind::Keep { change_id, checkpoint, .. }) = RefKind::parse(name.as_str()) else {
                continue;
            };
            let info = match self.store().commit_info(target) {
                Ok(info) => info,
                Err(e) if e.is_not_found() => continue,
                Err(e) => return Err(e.into()),
            };
            if info.timestamp >= cutoff || self.is_open_anchor(&change_id, checkpoint)? {
                continue;
            }

            self.store().delete_ref(&name)?;
            result.pruned_refs += 1;
            if attestations.remove(checkpoint)? {
                result.notes_removed += 1;
            }
            result.suggestions_removed += suggestions.remove_for_base(checkpoint)?;
            debug!(reference = name.as_str(), "pruned keep ref");
        }

        info!(
            pruned = result.pruned_refs,
            notes = result.notes_removed,
            suggestions = result.suggestions_removed,
            "prune finished"
        );
        Ok(result)
    }

    /// `checkpoint` anchors `change_id` and the change has no promote yet.
    fn is_open_anchor(&self, change_id: &ChangeId, checkpoint: CommitId) -> WorkflowResult<bool> {
        let anchor = refs::anchor_ref(change_id)?;
        if self.store().resolve_ref(anchor.as_str())? != Some(checkpoint) {
            return Ok(false);
        }
        let open = match ChangeMetaStore::new(self.store()).read(checkpoint)? {
            Some(meta) => meta.is_open(),
            None => true,
        };
        Ok(open)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{AttestationInput, NewSuggestion};
    use crate::promote::PromoteOptions;
    use crate::storage::ObjectStore;
    use crate::testing::Device;

    fn setup() -> Device {
        Device::new("desktop", None)
    }

    fn keep_refs(device: &Device) -> Vec<CommitId> {
        device
            .repo
            .list_refs(refs::KEEP)
            .unwrap()
            .into_iter()
            .map(|(_, sha)| sha)
            .collect()
    }

    fn tomorrow() -> DateTime<Utc> {
        Utc::now() + Duration::days(1)
    }

    #[test]
    fn test_negative_retention_disables_pruning() {
        let device = setup();
        device.write("a.txt", "one\n");
        device.engine().checkpoint(Some("first")).unwrap();
        let result = device.engine().prune(Some(-1)).unwrap();
        assert!(!result.enabled);
        assert_eq!(keep_refs(&device).len(), 1);
    }

    #[test]
    fn test_huge_retention_keeps_everything() {
        let device = setup();
        device.write("a.txt", "one\n");
        device.engine().checkpoint(Some("first")).unwrap();
        for days in [1_000_000_000, i64::MAX] {
            let result = device.engine().prune(Some(days)).unwrap();
            assert!(result.enabled);
            assert_eq!(result.pruned_refs, 0);
        }
        assert_eq!(keep_refs(&device).len(), 1);
    }

    #[test]
    fn test_recent_checkpoints_survive() {
        let device = setup();
        device.write("a.txt", "one\n");
        device.engine().checkpoint(Some("first")).unwrap();
        device.write("b.txt", "two\n");
        device.engine().checkpoint(Some("second")).unwrap();
        let result = device.engine().prune(Some(30)).unwrap();
        assert!(result.enabled);
        assert_eq!(result.pruned_refs, 0);
        assert_eq!(keep_refs(&device).len(), 2);
    }

    #[test]
    fn test_open_anchor_is_kept() {
        let device = setup();
        device.write("a.txt", "one\n");
        let first = device.engine().checkpoint(Some("first")).unwrap().checkpoint;
        device.write("b.txt", "two\n");
        let second = device.engine().checkpoint(Some("second")).unwrap().checkpoint;
        AttestationStore::new(&device.repo)
            .record(
                second,
                AttestationInput {
                    status: "pass".into(),
                    ..Default::default()
                },
            )
            .unwrap();
        let suggested = device
            .repo
            .create_commit(device.repo.tree_of(second).unwrap(), &[second], "suggested\n")
            .unwrap();
        SuggestionStore::new(&device.repo)
            .create(NewSuggestion {
                base: Some(second),
                suggested: Some(suggested),
                created_by: "reviewer".into(),
                reason: "style".into(),
                ..Default::default()
            })
            .unwrap();

        let result = device.engine().prune_before(tomorrow()).unwrap();
        assert_eq!(result.pruned_refs, 1);
        assert_eq!(result.notes_removed, 1);
        assert_eq!(result.suggestions_removed, 1);
        assert_eq!(keep_refs(&device), vec![first]);
        assert!(SuggestionStore::new(&device.repo).all().unwrap().is_empty());
    }

    #[test]
    fn test_promoted_anchor_is_pruned() {
        let device = setup();
        device.write("a.txt", "one\n");
        device.engine().checkpoint(Some("first")).unwrap();
        device
            .engine()
            .promote(&PromoteOptions {
                target: "main".into(),
                ..Default::default()
            })
            .unwrap();

        let result = device.engine().prune_before(tomorrow()).unwrap();
        assert_eq!(result.pruned_refs, 1);
        assert!(keep_refs(&device).is_empty());
    }
}
