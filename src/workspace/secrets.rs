//! Secret scan run before a draft leaves the device.
//!
//! Only files that differ between the draft and its base are read, and
//! sync-ignored paths are skipped. A hit blocks the draft push until the
//! context allows secrets.

use std::path::PathBuf;
use std::sync::OnceLock;

use regex::bytes::RegexSet;

use crate::storage::{ChangeStatus, ObjectStore, StorageResult, TreeId};

use super::ignore::SyncIgnore;

const PATTERNS: &[&str] = &[
    r"AKIA[0-9A-Z]{16}",
    r"ghp_[A-Za-z0-9]{30,}",
    r"xox[baprs]-[A-Za-z0-9-]{10,}",
    r"sk-[A-Za-z0-9]{16,}",
    r"(?i)bearer\s+[A-Za-z0-9._-]+",
    r"(?i)(api[_-]?key|secret|token|password|pwd)\s*[:=]\s*\S+",
];

fn secret_patterns() -> &'static RegexSet {
    static SET: OnceLock<RegexSet> = OnceLock::new();
    SET.get_or_init(|| RegexSet::new(PATTERNS).unwrap_or_else(|_| RegexSet::empty()))
}

pub fn contains_secret(content: &[u8]) -> bool {
    secret_patterns().is_match(content)
}

/// First path changed between `base` and `draft` whose draft content
/// looks like a credential.
pub fn find_secret(
    store: &dyn ObjectStore,
    ignore: &SyncIgnore,
    base: Option<TreeId>,
    draft: TreeId,
) -> StorageResult<Option<PathBuf>> {
    for change in store.diff_summary(base, draft)? {
        if change.status == ChangeStatus::Deleted || ignore.is_ignored(&change.path, false) {
            continue;
        }
        if let Some(content) = store.read_path(draft, &change.path)? {
            if contains_secret(&content) {
                return Ok(Some(change.path));
            }
        }
    }
    Ok(None)
}
