//! The explicit context threaded into every engine call.
//!
//! Identity (user, device, workspace) and sync settings are resolved once,
//! from the builder or the environment, and never read from globals later.

use std::env;
use std::fs;

use crate::error::{WorkflowError, WorkflowResult};
use crate::identity::refs::validate_component;
use crate::storage::ObjectStore;

pub const DEFAULT_WORKSPACE: &str = "@";
pub const DEFAULT_RETENTION_DAYS: i64 = 90;

/// Directory (relative to the workdir) holding engine state.
pub const STATE_DIR: &str = ".wsync";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkspaceContext {
    pub user: String,
    pub device: String,
    pub workspace: String,
    /// remote the workspace syncs through; `None` keeps everything local
    pub remote: Option<String>,
    /// push drafts on every sync
    pub sync_drafts: bool,
    /// push keep/change/anchor/workspace refs on checkpoint
    pub sync_checkpoints: bool,
    /// accept reconciliation results without asking
    pub auto_apply: bool,
    /// keep-ref retention; negative disables pruning
    pub retention_days: i64,
    /// push drafts even when they look like they carry credentials
    pub allow_secrets: bool,
}

impl WorkspaceContext {
    pub fn builder() -> WorkspaceContextBuilder {
        WorkspaceContextBuilder::default()
    }

    /// Resolve a context from `WSYNC_*` variables, falling back to git
    /// config and host information.
    pub fn from_env(store: &dyn ObjectStore) -> WorkflowResult<Self> {
        let mut builder = Self::builder();
        if let Some(user) = env_value("WSYNC_USER") {
            builder = builder.user(user);
        }
        if let Some(device) = env_value("WSYNC_DEVICE") {
            builder = builder.device(device);
        }
        if let Some(workspace) = env_value("WSYNC_WORKSPACE") {
            // `user/workspace` selects another user's workspace
            match workspace.split_once('/') {
                Some((user, ws)) => builder = builder.user(user).workspace(ws),
                None => builder = builder.workspace(workspace),
            }
        }
        if let Some(remote) = env_value("WSYNC_REMOTE") {
            builder = builder.remote(remote);
        }
        if let Some(flag) = env_value("WSYNC_DRAFT_SYNC") {
            builder = builder.sync_drafts(parse_flag("WSYNC_DRAFT_SYNC", &flag)?);
        }
        if let Some(flag) = env_value("WSYNC_CHECKPOINT_SYNC") {
            builder = builder.sync_checkpoints(parse_flag("WSYNC_CHECKPOINT_SYNC", &flag)?);
        }
        if let Some(flag) = env_value("WSYNC_ALLOW_SECRETS") {
            builder = builder.allow_secrets(parse_flag("WSYNC_ALLOW_SECRETS", &flag)?);
        }
        if let Some(days) = env_value("WSYNC_RETENTION_DAYS") {
            let days = days.parse::<i64>().map_err(|_| WorkflowError::InvalidConfig {
                key: "WSYNC_RETENTION_DAYS".to_string(),
                reason: format!("expected an integer, got '{}'", days),
            })?;
            builder = builder.retention_days(days);
        }
        builder.build(store)
    }

    /// the sync flags only matter with a remote
    pub fn pushes_drafts(&self) -> Option<&str> {
        self.remote.as_deref().filter(|_| self.sync_drafts)
    }

    pub fn pushes_checkpoints(&self) -> Option<&str> {
        self.remote.as_deref().filter(|_| self.sync_checkpoints)
    }
}

/// builder for [`WorkspaceContext`]; unset fields are resolved in `build`
#[derive(Debug, Clone, Default)]
pub struct WorkspaceContextBuilder {
    user: Option<String>,
    device: Option<String>,
    workspace: Option<String>,
    remote: Option<String>,
    local_only: bool,
    sync_drafts: Option<bool>,
    sync_checkpoints: Option<bool>,
    auto_apply: bool,
    retention_days: Option<i64>,
    allow_secrets: bool,
}

impl WorkspaceContextBuilder {
    pub fn user(mut self, value: impl Into<String>) -> Self {
        self.user = Some(value.into());
        self
    }

    pub fn device(mut self, value: impl Into<String>) -> Self {
        self.device = Some(value.into());
        self
    }

    pub fn workspace(mut self, value: impl Into<String>) -> Self {
        self.workspace = Some(value.into());
        self
    }

    pub fn remote(mut self, value: impl Into<String>) -> Self {
        self.remote = Some(value.into());
        self
    }

    /// never auto-select a remote
    pub fn local_only(mut self) -> Self {
        self.local_only = true;
        self
    }

    pub fn sync_drafts(mut self, value: bool) -> Self {
        self.sync_drafts = Some(value);
        self
    }

    pub fn sync_checkpoints(mut self, value: bool) -> Self {
        self.sync_checkpoints = Some(value);
        self
    }

    pub fn auto_apply(mut self, value: bool) -> Self {
        self.auto_apply = value;
        self
    }

    pub fn retention_days(mut self, value: i64) -> Self {
        self.retention_days = Some(value);
        self
    }

    pub fn allow_secrets(mut self, value: bool) -> Self {
        self.allow_secrets = value;
        self
    }

    pub fn build(self, store: &dyn ObjectStore) -> WorkflowResult<WorkspaceContext> {
        let user = match self.user {
            Some(user) => user,
            None => store
                .config_value("user.name")?
                .map(|name| slugify(&name))
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| "user".to_string()),
        };
        let device = match self.device {
            Some(device) => device,
            None => hostname()
                .map(|h| slugify(&h))
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| "device".to_string()),
        };
        let workspace = self.workspace.unwrap_or_else(|| DEFAULT_WORKSPACE.to_string());

        for (key, value) in [("user", &user), ("device", &device), ("workspace", &workspace)] {
            validate_component(value).map_err(|e| WorkflowError::InvalidConfig {
                key: key.to_string(),
                reason: e.to_string(),
            })?;
        }

        let remote = match (self.remote, self.local_only) {
            (_, true) => None,
            (Some(remote), false) => {
                if !store.remote_names()?.contains(&remote) {
                    return Err(WorkflowError::Precondition {
                        code: "remote_missing",
                        message: format!("remote '{}' is not configured", remote),
                        next: Vec::new(),
                    });
                }
                Some(remote)
            }
            // exactly one remote is picked up without asking
            (None, false) => {
                let names = store.remote_names()?;
                if names.len() == 1 {
                    names.into_iter().next()
                } else {
                    None
                }
            }
        };

        Ok(WorkspaceContext {
            user,
            device,
            workspace,
            remote,
            sync_drafts: self.sync_drafts.unwrap_or(true),
            sync_checkpoints: self.sync_checkpoints.unwrap_or(true),
            auto_apply: self.auto_apply,
            retention_days: self.retention_days.unwrap_or(DEFAULT_RETENTION_DAYS),
            allow_secrets: self.allow_secrets,
        })
    }
}

fn env_value(key: &str) -> Option<String> {
    env::var(key).ok().map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn parse_flag(key: &str, value: &str) -> WorkflowResult<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" | "enabled" => Ok(true),
        "0" | "false" | "no" | "off" | "disabled" => Ok(false),
        other => Err(WorkflowError::InvalidConfig {
            key: key.to_string(),
            reason: format!("expected a boolean, got '{}'", other),
        }),
    }
}

fn hostname() -> Option<String> {
    env_value("HOSTNAME").or_else(|| {
        fs::read_to_string("/etc/hostname")
            .ok()
            .map(|h| h.trim().to_string())
            .filter(|h| !h.is_empty())
    })
}

/// lowercase, runs of anything but `[a-z0-9]` collapse into one `-`
pub fn slugify(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.trim().chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
        } else if !out.ends_with('-') {
            out.push('-');
        }
    }
    out.trim_matches('-').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::GitRepository;
    use tempfile::TempDir;

    fn setup() -> (TempDir, GitRepository) {
        let dir = TempDir::new().unwrap();
        let repo = GitRepository::init(dir.path()).unwrap();
        (dir, repo)
    }

    #[test]
    fn test_slugify() {
        assert_eq!(slugify("Alice Smith"), "alice-smith");
        assert_eq!(slugify("  my.Laptop--01 "), "my-laptop-01");
        assert_eq!(slugify("???"), "");
    }

    #[test]
    fn test_builder_defaults() {
        let (_dir, repo) = setup();
        let ctx = WorkspaceContext::builder()
            .user("alice")
            .device("laptop")
            .build(&repo)
            .unwrap();
        assert_eq!(ctx.workspace, DEFAULT_WORKSPACE);
        assert_eq!(ctx.remote, None);
        assert_eq!(ctx.retention_days, DEFAULT_RETENTION_DAYS);
        assert!(ctx.pushes_drafts().is_none());
    }

    #[test]
    fn test_builder_rejects_bad_components() {
        let (_dir, repo) = setup();
        let result = WorkspaceContext::builder()
            .user("alice")
            .device("my laptop")
            .build(&repo);
        assert!(matches!(result, Err(WorkflowError::InvalidConfig { .. })));
    }

    #[test]
    fn test_single_remote_is_auto_selected() {
        let (dir, repo) = setup();
        let bare = dir.path().join("remote.git");
        git2::Repository::init_bare(&bare).unwrap();
        repo.with_repo(|r| {
            r.remote("origin", bare.to_str().unwrap())?;
            Ok(())
        })
        .unwrap();

        let ctx = WorkspaceContext::builder()
            .user("alice")
            .device("laptop")
            .build(&repo)
            .unwrap();
        assert_eq!(ctx.remote.as_deref(), Some("origin"));
        assert_eq!(ctx.pushes_checkpoints(), Some("origin"));

        let local = WorkspaceContext::builder()
            .user("alice")
            .device("laptop")
            .local_only()
            .build(&repo)
            .unwrap();
        assert_eq!(local.remote, None);

        let missing = WorkspaceContext::builder()
            .user("alice")
            .device("laptop")
            .remote("upstream")
            .build(&repo);
        assert!(matches!(missing, Err(WorkflowError::Precondition { .. })));
    }
}
