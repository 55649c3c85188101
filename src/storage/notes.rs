//! Side metadata stored as git notes.
//!
//! Notes attach a text body to an object without touching the commit graph.
//! Each metadata family gets its own notes ref under `refs/notes/wsync/`.

use git2::{ErrorCode, Repository};

use crate::storage::error::{StorageError, StorageResult};
use crate::storage::types::{CommitId, GitSignature};

pub fn read(repo: &Repository, notes_ref: &str, target: CommitId) -> StorageResult<Option<String>> {
    match repo.find_note(Some(notes_ref), target.raw()) {
        Ok(note) => Ok(note.message().map(str::to_string)),
        Err(e) if e.code() == ErrorCode::NotFound => Ok(None),
        Err(e) => Err(StorageError::Git(e)),
    }
}

/// write (or overwrite) the note on `target`
pub fn write(
    repo: &Repository,
    signature: &GitSignature,
    notes_ref: &str,
    target: CommitId,
    body: &str,
) -> StorageResult<()> {
    let sig = signature.to_git2_signature()?;
    repo.note(&sig, &sig, Some(notes_ref), target.raw(), body, true)?;
    Ok(())
}

/// remove the note on `target`; false when there was none
pub fn remove(
    repo: &Repository,
    signature: &GitSignature,
    notes_ref: &str,
    target: CommitId,
) -> StorageResult<bool> {
    let sig = signature.to_git2_signature()?;
    match repo.note_delete(target.raw(), Some(notes_ref), &sig, &sig) {
        Ok(()) => Ok(true),
        Err(e) if e.code() == ErrorCode::NotFound => Ok(false),
        Err(e) => Err(StorageError::Git(e)),
    }
}

/// every (annotated object, body) pair under `notes_ref`
pub fn list(repo: &Repository, notes_ref: &str) -> StorageResult<Vec<(CommitId, String)>> {
    let notes = match repo.notes(Some(notes_ref)) {
        Ok(notes) => notes,
        Err(e) if e.code() == ErrorCode::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(StorageError::Git(e)),
    };

    let mut result = Vec::new();
    for item in notes {
        let (_note_id, annotated) = item?;
        let target = CommitId::new(annotated);
        if let Some(body) = read(repo, notes_ref, target)? {
            result.push((target, body));
        }
    }
    Ok(result)
}
