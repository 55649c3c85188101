//! Ref naming for the private `refs/wsync/` namespace.
//!
//! Every ref the engine writes is built here, and [`RefKind::parse`] turns a
//! full name back into its typed components.

use crate::identity::change_id::ChangeId;
use crate::storage::{CommitId, InvalidNameError, RefName};

pub const NAMESPACE: &str = "refs/wsync/";
pub const WORKSPACES: &str = "refs/wsync/workspaces/";
pub const SYNC: &str = "refs/wsync/sync/";
pub const KEEP: &str = "refs/wsync/keep/";
pub const CHANGES: &str = "refs/wsync/changes/";
pub const ANCHORS: &str = "refs/wsync/anchors/";
pub const TRACES: &str = "refs/wsync/traces/";
pub const SUGGEST: &str = "refs/wsync/suggest/";
pub const HEAD_BRANCHES: &str = "refs/heads/wsync/";

pub const NOTES_ATTESTATIONS: &str = "refs/notes/wsync/attestations";
pub const NOTES_SUGGESTIONS: &str = "refs/notes/wsync/suggestions";
pub const NOTES_META: &str = "refs/notes/wsync/meta";
pub const NOTES_CHANGE_ID: &str = "refs/notes/wsync/change-id";

const MAX_COMPONENT_LEN: usize = 128;

/// Validate one user/device/workspace component.
pub fn validate_component(value: &str) -> Result<(), InvalidNameError> {
    if value.is_empty() {
        return Err(InvalidNameError::Empty);
    }
    if value.len() > MAX_COMPONENT_LEN {
        return Err(InvalidNameError::TooLong(value.len()));
    }
    if value == "." || value == ".." || value.contains("..") {
        return Err(InvalidNameError::Reserved(value.to_string()));
    }
    if let Some((position, c)) = value
        .char_indices()
        .find(|(_, c)| *c == '/' || c.is_whitespace() || c.is_control() || matches!(*c, '~' | '^' | ':' | '?' | '*' | '[' | '\\'))
    {
        return Err(InvalidNameError::InvalidCharacter { char: c, position });
    }
    Ok(())
}

fn build(parts: &[&str]) -> Result<RefName, InvalidNameError> {
    for part in parts {
        validate_component(part)?;
    }
    RefName::new(format!("{}{}", NAMESPACE, parts.join("/")))
}

pub fn workspace_ref(user: &str, workspace: &str) -> Result<RefName, InvalidNameError> {
    build(&["workspaces", user, workspace])
}

pub fn sync_ref(user: &str, device: &str, workspace: &str) -> Result<RefName, InvalidNameError> {
    build(&["sync", user, device, workspace])
}

pub fn keep_ref(
    user: &str,
    workspace: &str,
    change_id: &ChangeId,
    checkpoint: CommitId,
) -> Result<RefName, InvalidNameError> {
    build(&["keep", user, workspace, change_id.as_str(), &checkpoint.to_string()])
}

/// prefix listing every keep ref of one change
pub fn keep_prefix(user: &str, workspace: &str, change_id: &ChangeId) -> String {
    format!("{}{}/{}/{}/", KEEP, user, workspace, change_id)
}

pub fn change_ref(change_id: &ChangeId) -> Result<RefName, InvalidNameError> {
    build(&["changes", change_id.as_str()])
}

pub fn anchor_ref(change_id: &ChangeId) -> Result<RefName, InvalidNameError> {
    build(&["anchors", change_id.as_str()])
}

pub fn trace_ref(user: &str, workspace: &str) -> Result<RefName, InvalidNameError> {
    build(&["traces", user, workspace])
}

pub fn suggest_ref(change_id: &ChangeId, suggestion_id: &str) -> Result<RefName, InvalidNameError> {
    build(&["suggest", change_id.as_str(), suggestion_id])
}

/// local branch that mirrors the workspace's checkpoint
pub fn head_branch(workspace: &str) -> Result<RefName, InvalidNameError> {
    validate_component(workspace)?;
    RefName::new(format!("{}{}", HEAD_BRANCHES, workspace))
}

/// typed view of a ref in the private namespace
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefKind {
    Workspace { user: String, workspace: String },
    Sync { user: String, device: String, workspace: String },
    Keep { user: String, workspace: String, change_id: ChangeId, checkpoint: CommitId },
    Change { change_id: ChangeId },
    Anchor { change_id: ChangeId },
    Trace { user: String, workspace: String },
    Suggest { change_id: ChangeId, suggestion_id: String },
}

impl RefKind {
    /// Parse a full ref name; `None` for anything outside the namespace or
    /// with the wrong shape.
    pub fn parse(name: &str) -> Option<Self> {
        let rest = name.strip_prefix(NAMESPACE)?;
        let parts: Vec<&str> = rest.split('/').collect();
        if parts.iter().skip(1).any(|p| validate_component(p).is_err()) {
            return None;
        }
        match parts.as_slice() {
            ["workspaces", user, ws] => Some(RefKind::Workspace {
                user: user.to_string(),
                workspace: ws.to_string(),
            }),
            ["sync", user, device, ws] => Some(RefKind::Sync {
                user: user.to_string(),
                device: device.to_string(),
                workspace: ws.to_string(),
            }),
            ["keep", user, ws, change, sha] => Some(RefKind::Keep {
                user: user.to_string(),
                workspace: ws.to_string(),
                change_id: ChangeId::parse(change).ok()?,
                checkpoint: CommitId::from_hex(sha).ok()?,
            }),
            ["changes", change] => Some(RefKind::Change {
                change_id: ChangeId::parse(change).ok()?,
            }),
            ["anchors", change] => Some(RefKind::Anchor {
                change_id: ChangeId::parse(change).ok()?,
            }),
            ["traces", user, ws] => Some(RefKind::Trace {
                user: user.to_string(),
                workspace: ws.to_string(),
            }),
            ["suggest", change, id] => Some(RefKind::Suggest {
                change_id: ChangeId::parse(change).ok()?,
                suggestion_id: id.to_string(),
            }),
            _ => None,
        }
    }

    /// rebuild the full ref name
    pub fn to_ref_name(&self) -> Result<RefName, InvalidNameError> {
        match self {
            RefKind::Workspace { user, workspace } => workspace_ref(user, workspace),
            RefKind::Sync { user, device, workspace } => sync_ref(user, device, workspace),
            RefKind::Keep { user, workspace, change_id, checkpoint } => {
                keep_ref(user, workspace, change_id, *checkpoint)
            }
            RefKind::Change { change_id } => change_ref(change_id),
            RefKind::Anchor { change_id } => anchor_ref(change_id),
            RefKind::Trace { user, workspace } => trace_ref(user, workspace),
            RefKind::Suggest { change_id, suggestion_id } => suggest_ref(change_id, suggestion_id),
        }
    }
}
