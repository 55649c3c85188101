//! Remote transport: tip queries, single-ref fetches and pushes with a
//! lease on the previous remote value.
//!
//! Tips are never read from the advertised ref list. Each query fetches the
//! one ref into a mirror under `refs/wsync-remote/<remote>/` and resolves
//! that locally, which also works against a remote with no refs at all.
//!
//! libgit2 has no native force-with-lease, so [`push_with_lease`] compares
//! the fetched tip first and then pushes with force. The remaining window
//! is closed by the server-side rejection reported through the push
//! callback.

use std::cell::RefCell;

use git2::{AutotagOption, Cred, CredentialType, ErrorCode, FetchOptions, PushOptions, RemoteCallbacks, Repository};

use crate::storage::error::{StorageError, StorageResult};
use crate::storage::types::CommitId;

fn callbacks<'a>(repo: &'a Repository) -> RemoteCallbacks<'a> {
    let mut callbacks = RemoteCallbacks::new();
    callbacks.credentials(move |url, username, allowed| {
        if allowed.contains(CredentialType::SSH_KEY) {
            return Cred::ssh_key_from_agent(username.unwrap_or("git"));
        }
        if allowed.contains(CredentialType::USER_PASS_PLAINTEXT) {
            let config = repo.config()?;
            return Cred::credential_helper(&config, url, username);
        }
        Cred::default()
    });
    callbacks
}

fn find_remote<'r>(repo: &'r Repository, remote: &str) -> StorageResult<git2::Remote<'r>> {
    repo.find_remote(remote).map_err(|e| {
        if e.code() == ErrorCode::NotFound || e.code() == ErrorCode::InvalidSpec {
            StorageError::RemoteNotFound(remote.to_string())
        } else {
            StorageError::Git(e)
        }
    })
}

/// names of the configured remotes
pub fn remote_names(repo: &Repository) -> StorageResult<Vec<String>> {
    let names = repo.remotes()?;
    Ok(names.iter().flatten().map(str::to_string).collect())
}

/// where [`remote_tip`] mirrors `reference` of `remote`
pub fn mirror_ref(remote: &str, reference: &str) -> String {
    format!(
        "refs/wsync-remote/{}/{}",
        remote,
        reference.strip_prefix("refs/").unwrap_or(reference)
    )
}

/// The tip the remote currently has for `reference`, `None` when it has no
/// such ref.
pub fn remote_tip(repo: &Repository, remote: &str, reference: &str) -> StorageResult<Option<CommitId>> {
    let mut handle = find_remote(repo, remote)?;
    let mirror = mirror_ref(remote, reference);
    // a ref the remote dropped must not survive in the mirror
    if let Ok(mut stale) = repo.find_reference(&mirror) {
        stale.delete()?;
    }

    let mut opts = FetchOptions::new();
    opts.remote_callbacks(callbacks(repo));
    opts.download_tags(AutotagOption::None);
    let refspec = format!("+{}:{}", reference, mirror);
    handle.fetch(&[refspec.as_str()], Some(&mut opts), None)?;

    match repo.refname_to_id(&mirror) {
        Ok(oid) => Ok(Some(CommitId::new(oid))),
        Err(e) if e.code() == ErrorCode::NotFound => Ok(None),
        Err(e) => Err(StorageError::Git(e)),
    }
}

/// Fetch `remote_ref` into `local_ref` (forced). Returns the fetched tip,
/// or `None` when the remote does not have the ref; `local_ref` is then
/// left untouched.
pub fn fetch_ref(
    repo: &Repository,
    remote: &str,
    remote_ref: &str,
    local_ref: &str,
) -> StorageResult<Option<CommitId>> {
    let Some(tip) = remote_tip(repo, remote, remote_ref)? else {
        return Ok(None);
    };
    repo.reference(local_ref, tip.raw(), true, "wsync: fetch")?;
    Ok(Some(tip))
}

/// Push the local `reference` to the same name on the remote.
pub fn push_ref(repo: &Repository, remote: &str, reference: &str, force: bool) -> StorageResult<()> {
    let refspec = if force {
        format!("+{}:{}", reference, reference)
    } else {
        format!("{}:{}", reference, reference)
    };
    push_refspec(repo, remote, reference, &refspec)
}

/// Push `reference` only if the remote still has `expected` (`None`
/// meaning the remote must not have the ref yet).
pub fn push_with_lease(
    repo: &Repository,
    remote: &str,
    reference: &str,
    expected: Option<CommitId>,
) -> StorageResult<()> {
    let current = remote_tip(repo, remote, reference)?;
    if current != expected {
        return Err(StorageError::PushRejected {
            reference: reference.to_string(),
            reason: format!(
                "stale lease: expected {}, remote has {}",
                expected.map(|c| c.short()).unwrap_or_else(|| "none".into()),
                current.map(|c| c.short()).unwrap_or_else(|| "none".into())
            ),
        });
    }
    push_ref(repo, remote, reference, true)
}

fn push_refspec(repo: &Repository, remote: &str, reference: &str, refspec: &str) -> StorageResult<()> {
    let mut handle = find_remote(repo, remote)?;
    let rejection: RefCell<Option<String>> = RefCell::new(None);

    {
        let mut cbs = callbacks(repo);
        cbs.push_update_reference(|_refname, status| {
            if let Some(message) = status {
                *rejection.borrow_mut() = Some(message.to_string());
            }
            Ok(())
        });
        let mut opts = PushOptions::new();
        opts.remote_callbacks(cbs);

        handle.push(&[refspec], Some(&mut opts)).map_err(|e| {
            if e.code() == ErrorCode::NotFastForward {
                StorageError::PushRejected {
                    reference: reference.to_string(),
                    reason: "non-fast-forward".to_string(),
                }
            } else {
                StorageError::Git(e)
            }
        })?;
    }

    match rejection.into_inner() {
        Some(reason) => Err(StorageError::PushRejected {
            reference: reference.to_string(),
            reason,
        }),
        None => Ok(()),
    }
}
