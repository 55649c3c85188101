//! Per-workspace files under the state directory.
//!
//! ```text
//! .wsync/
//! └── workspaces/<ws>/
//!     ├── lease     last base this device synced to ("<sha>\n")
//!     └── config    base_ref / base_sha / track_ref / track_tip
//! ```
//!
//! The lease mirrors the workspace ref locally; comparing the two is how
//! sync, checkpoint and promote notice that another device moved the
//! workspace.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::context::STATE_DIR;
use crate::error::{WorkflowError, WorkflowResult};
use crate::identity::trailers;
use crate::storage::{CommitId, ObjectStore, StorageResult};

const LEASE_FILE: &str = "lease";
const CONFIG_FILE: &str = "config";

/// Create the state directory and keep it out of `git status`.
pub fn ensure_state_dir(store: &dyn ObjectStore) -> io::Result<PathBuf> {
    let dir = store.workdir().join(STATE_DIR);
    fs::create_dir_all(&dir)?;

    let info = store.git_dir().join("info");
    fs::create_dir_all(&info)?;
    let exclude = info.join("exclude");
    let entry = format!("{}/", STATE_DIR);
    let existing = fs::read_to_string(&exclude).unwrap_or_default();
    if !existing.lines().any(|l| l.trim() == entry) {
        let mut file = fs::OpenOptions::new().create(true).append(true).open(&exclude)?;
        if !existing.is_empty() && !existing.ends_with('\n') {
            writeln!(file)?;
        }
        writeln!(file, "{}", entry)?;
    }
    Ok(dir)
}

/// Handle on `.wsync/workspaces/<ws>/`.
#[derive(Debug, Clone)]
pub struct WorkspaceState {
    dir: PathBuf,
}

impl WorkspaceState {
    pub fn new(workdir: &Path, workspace: &str) -> Self {
        Self {
            dir: workdir.join(STATE_DIR).join("workspaces").join(workspace),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn lease(&self) -> WorkflowResult<Option<CommitId>> {
        let text = match fs::read_to_string(self.dir.join(LEASE_FILE)) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let text = text.trim();
        if text.is_empty() {
            return Ok(None);
        }
        // an unparsable lease is treated like a missing one
        Ok(CommitId::from_hex(text).ok())
    }

    pub fn write_lease(&self, sha: CommitId) -> WorkflowResult<()> {
        fs::create_dir_all(&self.dir)?;
        write_atomic(&self.dir.join(LEASE_FILE), format!("{}\n", sha).as_bytes())?;
        Ok(())
    }

    pub fn config(&self) -> WorkflowResult<WorkspaceConfig> {
        match fs::read_to_string(self.dir.join(CONFIG_FILE)) {
            Ok(text) => toml::from_str(&text).map_err(|e| self.config_error(e.to_string())),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(WorkspaceConfig::default()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn write_config(&self, config: &WorkspaceConfig) -> WorkflowResult<()> {
        fs::create_dir_all(&self.dir)?;
        let contents = toml::to_string_pretty(config).map_err(|e| self.config_error(e.to_string()))?;
        write_atomic(&self.dir.join(CONFIG_FILE), contents.as_bytes())?;
        Ok(())
    }

    fn config_error(&self, reason: String) -> WorkflowError {
        WorkflowError::InvalidConfig {
            key: self.dir.join(CONFIG_FILE).display().to_string(),
            reason,
        }
    }

    /// Load, modify and save the config in one step.
    pub fn update_config(&self, f: impl FnOnce(&mut WorkspaceConfig)) -> WorkflowResult<WorkspaceConfig> {
        let mut config = self.config()?;
        f(&mut config);
        self.write_config(&config)?;
        Ok(config)
    }
}

fn write_atomic(path: &Path, data: &[u8]) -> io::Result<()> {
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, data)?;
    fs::rename(&tmp, path)
}

/// What a workspace is stacked on and the target tip it last saw.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkspaceConfig {
    /// branch (`refs/heads/..`), workspace ref or change ref
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_sha: Option<CommitId>,
    /// target branch of the last promote
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub track_ref: Option<String>,
    /// tip of `track_ref` right after the last promote or restack
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub track_tip: Option<CommitId>,
}

/// The base a commit stands for: a draft's parent, anything else itself.
pub fn draft_base(store: &dyn ObjectStore, sha: CommitId) -> StorageResult<Option<CommitId>> {
    let info = store.commit_info(sha)?;
    if trailers::is_draft(&info.message) {
        Ok(info.first_parent())
    } else {
        Ok(Some(sha))
    }
}

/// Outcome of comparing the local lease with the workspace ref.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Alignment {
    pub lease_base: Option<CommitId>,
    pub workspace_base: Option<CommitId>,
    /// set when the lease can no longer be trusted
    pub diverged: Option<String>,
}

impl Alignment {
    pub fn is_diverged(&self) -> bool {
        self.diverged.is_some()
    }
}

/// Compare the lease with the workspace tip, both normalized through
/// [`draft_base`].
///
/// A missing lease next to an existing workspace ref means this device
/// never synced the workspace; a lease that is not an ancestor of the
/// workspace base means the workspace was rewritten underneath it.
pub fn check_alignment(
    store: &dyn ObjectStore,
    lease: Option<CommitId>,
    workspace_tip: Option<CommitId>,
) -> StorageResult<Alignment> {
    let lease_base = match lease {
        Some(sha) => draft_base(store, sha)?,
        None => None,
    };
    let workspace_base = match workspace_tip {
        Some(sha) => draft_base(store, sha)?,
        None => None,
    };

    let mut alignment = Alignment {
        lease_base,
        workspace_base,
        diverged: None,
    };
    if let Some(workspace_base) = workspace_base {
        match lease_base {
            None => alignment.diverged = Some("workspace lease missing".to_string()),
            Some(lease_base) if lease_base != workspace_base => {
                if !store.is_ancestor(lease_base, workspace_base)? {
                    alignment.diverged = Some("workspace lease corrupted".to_string());
                }
            }
            Some(_) => {}
        }
    }
    Ok(alignment)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{trailers::draft_message, ChangeId};
    use crate::storage::GitRepository;
    use tempfile::TempDir;

    fn setup() -> (TempDir, GitRepository) {
        let dir = TempDir::new().unwrap();
        let repo = GitRepository::init(dir.path()).unwrap();
        (dir, repo)
    }

    #[test]
    fn test_lease_round_trip() {
        let (dir, repo) = setup();
        let state = WorkspaceState::new(dir.path(), "@");
        assert_eq!(state.lease().unwrap(), None);

        let tree = repo.empty_tree().unwrap();
        let base = repo.create_commit(tree, &[], "base").unwrap();
        state.write_lease(base).unwrap();
        assert_eq!(state.lease().unwrap(), Some(base));
        let raw = fs::read_to_string(state.dir().join(LEASE_FILE)).unwrap();
        assert_eq!(raw, format!("{}\n", base));

        fs::write(state.dir().join(LEASE_FILE), "garbage").unwrap();
        assert_eq!(state.lease().unwrap(), None);
    }

    #[test]
    fn test_config_round_trip() {
        let (dir, repo) = setup();
        let tree = repo.empty_tree().unwrap();
        let tip = repo.create_commit(tree, &[], "tip").unwrap();
        let state = WorkspaceState::new(dir.path(), "feature");

        assert_eq!(state.config().unwrap(), WorkspaceConfig::default());
        state
            .update_config(|c| {
                c.base_ref = Some("refs/heads/main".into());
                c.track_tip = Some(tip);
            })
            .unwrap();
        let config = state.config().unwrap();
        assert_eq!(config.base_ref.as_deref(), Some("refs/heads/main"));
        assert_eq!(config.track_tip, Some(tip));
        assert_eq!(config.base_sha, None);

        let written = fs::read_to_string(state.dir().join(CONFIG_FILE)).unwrap();
        assert!(written.contains("base_ref = \"refs/heads/main\""));
        assert!(!written.contains("base_sha"));

        fs::write(state.dir().join(CONFIG_FILE), "# comment\nbase_ref = \"refs/wsync/workspaces/alice/api\"\n").unwrap();
        assert_eq!(
            state.config().unwrap().base_ref.as_deref(),
            Some("refs/wsync/workspaces/alice/api")
        );

        fs::write(state.dir().join(CONFIG_FILE), "base_ref = \"x\"\nbogus\n").unwrap();
        assert!(matches!(state.config(), Err(WorkflowError::InvalidConfig { .. })));
        fs::write(state.dir().join(CONFIG_FILE), "track_tip = \"not-a-sha\"\n").unwrap();
        assert!(matches!(state.config(), Err(WorkflowError::InvalidConfig { .. })));
    }

    #[test]
    fn test_ensure_state_dir_is_excluded_once() {
        let (dir, repo) = setup();
        ensure_state_dir(&repo).unwrap();
        ensure_state_dir(&repo).unwrap();
        assert!(dir.path().join(STATE_DIR).is_dir());
        let exclude = fs::read_to_string(repo.git_dir().join("info/exclude")).unwrap();
        assert_eq!(exclude.lines().filter(|l| l.trim() == ".wsync/").count(), 1);
    }

    #[test]
    fn test_alignment() {
        let (_dir, repo) = setup();
        let tree = repo.empty_tree().unwrap();
        let base = repo.create_commit(tree, &[], "base").unwrap();
        let next = repo.create_commit(tree, &[base], "next").unwrap();
        let draft = repo
            .create_commit(tree, &[next], &draft_message(&ChangeId::generate()))
            .unwrap();
        let other = repo.create_commit(tree, &[], "unrelated").unwrap();

        // nothing published yet
        let fresh = check_alignment(&repo, None, None).unwrap();
        assert!(!fresh.is_diverged());

        let missing = check_alignment(&repo, None, Some(base)).unwrap();
        assert_eq!(missing.diverged.as_deref(), Some("workspace lease missing"));

        // a draft on the workspace ref stands for its parent
        let behind = check_alignment(&repo, Some(base), Some(draft)).unwrap();
        assert!(!behind.is_diverged());
        assert_eq!(behind.workspace_base, Some(next));

        let corrupted = check_alignment(&repo, Some(other), Some(next)).unwrap();
        assert_eq!(corrupted.diverged.as_deref(), Some("workspace lease corrupted"));
    }
}
