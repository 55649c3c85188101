//! tree operations: working-set snapshots, three-way merges and
//! materialization into plain directories.
//!
//! in git a tree is a directory. The engine never stages through the
//! repository index; instead:
//! - a working directory is snapshotted straight into tree objects
//! - merges run on an in-memory index and are either written back as a
//!   tree or materialized into a disposable directory with conflict markers
//!
//! none of these operations move a ref.

use std::fs;
use std::path::{Path, PathBuf};

use git2::{FileMode, Index, IndexEntry, Repository};

use crate::storage::error::{StorageError, StorageResult};
use crate::storage::types::TreeId;

/// result of a three-way tree merge
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TreeMerge {
    /// merged cleanly into this tree
    Clean(TreeId),
    /// paths both sides changed incompatibly
    Conflicted { paths: Vec<PathBuf> },
}

impl TreeMerge {
    pub fn is_clean(&self) -> bool {
        matches!(self, TreeMerge::Clean(_))
    }
}

const MODE_EXECUTABLE: u32 = 0o100755;
const MODE_LINK: u32 = 0o120000;
const MODE_COMMIT: u32 = 0o160000;

/// the empty tree, written on demand
pub fn empty_tree(repo: &Repository) -> StorageResult<TreeId> {
    let builder = repo.treebuilder(None)?;
    Ok(TreeId::new(builder.write()?))
}

/// filter over root-relative paths; the flag is true for directories
pub type SkipFn<'a> = &'a dyn Fn(&Path, bool) -> bool;

/// Snapshot a directory into a tree.
///
/// Paths `skip` accepts are left out (the `.git` directory always is).
/// With `honor_ignores`, paths the repository's ignore rules match are
/// skipped too; `root` must then be the workdir.
pub fn snapshot_dir(
    repo: &Repository,
    root: &Path,
    skip: SkipFn<'_>,
    honor_ignores: bool,
) -> StorageResult<TreeId> {
    match write_dir(repo, root, root, skip, honor_ignores)? {
        Some(oid) => Ok(TreeId::new(oid)),
        None => empty_tree(repo),
    }
}

/// returns None for a directory with nothing to record
fn write_dir(
    repo: &Repository,
    root: &Path,
    dir: &Path,
    skip: SkipFn<'_>,
    honor_ignores: bool,
) -> StorageResult<Option<git2::Oid>> {
    let mut entries: Vec<fs::DirEntry> = fs::read_dir(dir)?.collect::<Result<_, _>>()?;
    entries.sort_by_key(|e| e.file_name());

    let mut builder = repo.treebuilder(None)?;

    for entry in entries {
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            return Err(StorageError::UnexpectedEntry {
                path: entry.path(),
                reason: "file name is not valid UTF-8".to_string(),
            });
        };
        if name == ".git" {
            continue;
        }

        let path = entry.path();
        let file_type = entry.file_type()?;
        let rel = path.strip_prefix(root).unwrap_or(&path).to_path_buf();
        if skip(&rel, file_type.is_dir()) {
            continue;
        }

        if honor_ignores {
            let candidate = if file_type.is_dir() {
                format!("{}/", rel.to_string_lossy())
            } else {
                rel.to_string_lossy().into_owned()
            };
            if repo.is_path_ignored(&candidate)? {
                continue;
            }
        }

        if file_type.is_symlink() {
            let target = fs::read_link(&path)?;
            let oid = repo.blob(target.to_string_lossy().as_bytes())?;
            builder.insert(name, oid, FileMode::Link.into())?;
        } else if file_type.is_dir() {
            if let Some(oid) = write_dir(repo, root, &path, skip, honor_ignores)? {
                builder.insert(name, oid, FileMode::Tree.into())?;
            }
        } else if file_type.is_file() {
            let oid = repo.blob_path(&path)?;
            let mode = if is_executable(&entry.metadata()?) {
                FileMode::BlobExecutable
            } else {
                FileMode::Blob
            };
            builder.insert(name, oid, mode.into())?;
        }
    }

    if builder.len() == 0 {
        return Ok(None);
    }
    Ok(Some(builder.write()?))
}

#[cfg(unix)]
fn is_executable(meta: &fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o111 != 0
}

#[cfg(not(unix))]
fn is_executable(_meta: &fs::Metadata) -> bool {
    false
}

fn merge_index(
    repo: &Repository,
    base: Option<TreeId>,
    ours: TreeId,
    theirs: TreeId,
) -> StorageResult<Index> {
    let base = match base {
        Some(id) => id,
        None => empty_tree(repo)?,
    };
    let ancestor = repo.find_tree(base.raw())?;
    let our_tree = repo.find_tree(ours.raw())?;
    let their_tree = repo.find_tree(theirs.raw())?;
    Ok(repo.merge_trees(&ancestor, &our_tree, &their_tree, None)?)
}

fn conflicted_paths(index: &Index) -> StorageResult<Vec<PathBuf>> {
    let mut paths = Vec::new();
    for conflict in index.conflicts()? {
        let conflict = conflict?;
        let entry = conflict
            .our
            .as_ref()
            .or(conflict.their.as_ref())
            .or(conflict.ancestor.as_ref());
        if let Some(entry) = entry {
            paths.push(entry_path(entry));
        }
    }
    paths.sort();
    paths.dedup();
    Ok(paths)
}

fn entry_path(entry: &IndexEntry) -> PathBuf {
    PathBuf::from(String::from_utf8_lossy(&entry.path).into_owned())
}

/// three-way merge of trees; `base` None merges against the empty tree
pub fn merge_trees(
    repo: &Repository,
    base: Option<TreeId>,
    ours: TreeId,
    theirs: TreeId,
) -> StorageResult<TreeMerge> {
    // trivial cases skip the index entirely
    if ours == theirs || Some(theirs) == base {
        return Ok(TreeMerge::Clean(ours));
    }
    if Some(ours) == base {
        return Ok(TreeMerge::Clean(theirs));
    }

    let mut index = merge_index(repo, base, ours, theirs)?;
    if index.has_conflicts() {
        return Ok(TreeMerge::Conflicted {
            paths: conflicted_paths(&index)?,
        });
    }
    Ok(TreeMerge::Clean(TreeId::new(index.write_tree_to(repo)?)))
}

/// Write the three-way merge of the trees into `dir`.
///
/// Cleanly merged paths are written as-is; each conflicted path is written
/// as a whole-file conflict block. Returns the conflicted paths.
pub fn materialize_merge(
    repo: &Repository,
    base: Option<TreeId>,
    ours: TreeId,
    theirs: TreeId,
    dir: &Path,
) -> StorageResult<Vec<PathBuf>> {
    let index = merge_index(repo, base, ours, theirs)?;
    fs::create_dir_all(dir)?;

    for entry in index.iter() {
        // stage bits live in flags 12..14; only stage 0 is resolved
        if (entry.flags >> 12) & 0x3 != 0 {
            continue;
        }
        write_entry(repo, dir, &entry)?;
    }

    let mut paths = Vec::new();
    for conflict in index.conflicts()? {
        let conflict = conflict?;
        let Some(path) = conflict
            .our
            .as_ref()
            .or(conflict.their.as_ref())
            .or(conflict.ancestor.as_ref())
            .map(entry_path)
        else {
            continue;
        };
        let ours = side_content(repo, conflict.our.as_ref())?;
        let theirs = side_content(repo, conflict.their.as_ref())?;
        write_file(&dir.join(&path), &conflict_block(&ours, &theirs), false)?;
        paths.push(path);
    }
    paths.sort();
    paths.dedup();
    Ok(paths)
}

/// Write a tree's files into `dir` (which is created if missing).
pub fn materialize_tree(repo: &Repository, tree: TreeId, dir: &Path) -> StorageResult<()> {
    let tree = repo.find_tree(tree.raw())?;
    let mut index = Index::new()?;
    index.read_tree(&tree)?;
    fs::create_dir_all(dir)?;
    for entry in index.iter() {
        write_entry(repo, dir, &entry)?;
    }
    Ok(())
}

/// Remove `rel` from the working directory along with any parent
/// directories it leaves empty. A missing file is not an error.
pub fn remove_workdir_path(workdir: &Path, rel: &Path) -> StorageResult<()> {
    let path = workdir.join(rel);
    match fs::symlink_metadata(&path) {
        Ok(meta) if meta.is_dir() => return Ok(()),
        Ok(_) => fs::remove_file(&path)?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    }
    let mut parent = path.parent();
    while let Some(dir) = parent {
        if dir == workdir || !dir.starts_with(workdir) {
            break;
        }
        // only succeeds on an empty directory
        if fs::remove_dir(dir).is_err() {
            break;
        }
        parent = dir.parent();
    }
    Ok(())
}

/// read a file's bytes out of a tree, `None` when absent or not a blob
pub fn read_path(repo: &Repository, tree: TreeId, path: &Path) -> StorageResult<Option<Vec<u8>>> {
    let tree = repo.find_tree(tree.raw())?;
    let entry = match tree.get_path(path) {
        Ok(entry) => entry,
        Err(e) if e.code() == git2::ErrorCode::NotFound => return Ok(None),
        Err(e) => return Err(StorageError::Git(e)),
    };
    match repo.find_blob(entry.id()) {
        Ok(blob) => Ok(Some(blob.content().to_vec())),
        Err(_) => Ok(None),
    }
}

fn side_content(repo: &Repository, entry: Option<&IndexEntry>) -> StorageResult<Vec<u8>> {
    match entry {
        Some(entry) => Ok(repo.find_blob(entry.id)?.content().to_vec()),
        None => Ok(Vec::new()),
    }
}

/// whole-file conflict block in the usual marker format
pub fn conflict_block(ours: &[u8], theirs: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(ours.len() + theirs.len() + 48);
    out.extend_from_slice(b"<<<<<<< ours\n");
    out.extend_from_slice(ours);
    if !ours.is_empty() && !ours.ends_with(b"\n") {
        out.push(b'\n');
    }
    out.extend_from_slice(b"=======\n");
    out.extend_from_slice(theirs);
    if !theirs.is_empty() && !theirs.ends_with(b"\n") {
        out.push(b'\n');
    }
    out.extend_from_slice(b">>>>>>> theirs\n");
    out
}

/// true when the content still carries an unresolved conflict block
pub fn has_conflict_markers(content: &[u8]) -> bool {
    let text = String::from_utf8_lossy(content);
    let mut open = false;
    for line in text.lines() {
        if line.starts_with("<<<<<<< ") {
            open = true;
        } else if open && line.starts_with(">>>>>>> ") {
            return true;
        }
    }
    false
}

fn write_entry(repo: &Repository, dir: &Path, entry: &IndexEntry) -> StorageResult<()> {
    if entry.mode == MODE_COMMIT {
        // submodules are not materialized
        return Ok(());
    }
    let path = dir.join(entry_path(entry));
    let blob = repo.find_blob(entry.id)?;

    if entry.mode == MODE_LINK {
        return write_link(&path, blob.content());
    }
    write_file(&path, blob.content(), entry.mode == MODE_EXECUTABLE)
}

fn write_file(path: &Path, content: &[u8], executable: bool) -> StorageResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    if fs::symlink_metadata(path).is_ok() {
        fs::remove_file(path)?;
    }
    fs::write(path, content)?;
    set_executable(path, executable)?;
    Ok(())
}

#[cfg(unix)]
fn set_executable(path: &Path, executable: bool) -> StorageResult<()> {
    use std::os::unix::fs::PermissionsExt;
    let mode = if executable { 0o755 } else { 0o644 };
    fs::set_permissions(path, fs::Permissions::from_mode(mode))?;
    Ok(())
}

#[cfg(not(unix))]
fn set_executable(_path: &Path, _executable: bool) -> StorageResult<()> {
    Ok(())
}

#[cfg(unix)]
fn write_link(path: &Path, target: &[u8]) -> StorageResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    if fs::symlink_metadata(path).is_ok() {
        fs::remove_file(path)?;
    }
    let target = String::from_utf8_lossy(target).into_owned();
    std::os::unix::fs::symlink(target, path)?;
    Ok(())
}

#[cfg(not(unix))]
fn write_link(path: &Path, target: &[u8]) -> StorageResult<()> {
    write_file(path, target, false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn setup() -> (TempDir, Repository) {
        let dir = TempDir::new().unwrap();
        let repo = Repository::init(dir.path()).unwrap();
        (dir, repo)
    }

    fn tree_with(repo: &Repository, files: &[(&str, &str)]) -> TreeId {
        let mut builder = repo.treebuilder(None).unwrap();
        for (name, content) in files {
            let blob = repo.blob(content.as_bytes()).unwrap();
            builder.insert(name, blob, FileMode::Blob.into()).unwrap();
        }
        TreeId::new(builder.write().unwrap())
    }

    #[test]
    fn test_snapshot_dir_skips_excludes_and_ignores() {
        let (dir, repo) = setup();
        let root = dir.path();
        fs::write(root.join("a.txt"), "alpha\n").unwrap();
        fs::create_dir_all(root.join("src/nested")).unwrap();
        fs::write(root.join("src/nested/lib.rs"), "fn main() {}\n").unwrap();
        fs::create_dir_all(root.join(".wsync/workspaces/@")).unwrap();
        fs::write(root.join(".wsync/workspaces/@/lease"), "abc\n").unwrap();
        fs::write(root.join(".gitignore"), "target/\n*.log\n").unwrap();
        fs::create_dir_all(root.join("target")).unwrap();
        fs::write(root.join("target/out.bin"), "bin").unwrap();
        fs::write(root.join("debug.log"), "log").unwrap();
        fs::create_dir_all(root.join("empty")).unwrap();

        let skip = |rel: &Path, _dir: bool| rel.starts_with(".wsync");
        let tree_id = snapshot_dir(&repo, root, &skip, true).unwrap();
        let tree = repo.find_tree(tree_id.raw()).unwrap();

        assert!(tree.get_name("a.txt").is_some());
        assert!(tree.get_name(".gitignore").is_some());
        assert!(tree.get_path(Path::new("src/nested/lib.rs")).is_ok());
        assert!(tree.get_name(".wsync").is_none());
        assert!(tree.get_name("target").is_none());
        assert!(tree.get_name("debug.log").is_none());
        assert!(tree.get_name("empty").is_none());

        // snapshots are content addressed
        let again = snapshot_dir(&repo, root, &skip, true).unwrap();
        assert_eq!(tree_id, again);
    }

    #[cfg(unix)]
    #[test]
    fn test_snapshot_records_exec_bit() {
        use std::os::unix::fs::PermissionsExt;
        let (dir, repo) = setup();
        let script = dir.path().join("run.sh");
        fs::write(&script, "#!/bin/sh\n").unwrap();
        fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();

        let tree_id = snapshot_dir(&repo, dir.path(), &|_, _| false, false).unwrap();
        let tree = repo.find_tree(tree_id.raw()).unwrap();
        let entry = tree.get_name("run.sh").unwrap();
        assert_eq!(entry.filemode(), i32::from(FileMode::BlobExecutable));
    }

    #[test]
    fn test_merge_trees_clean() {
        let (_dir, repo) = setup();
        let base = tree_with(&repo, &[("a.txt", "a\n"), ("b.txt", "b\n")]);
        let ours = tree_with(&repo, &[("a.txt", "a2\n"), ("b.txt", "b\n")]);
        let theirs = tree_with(&repo, &[("a.txt", "a\n"), ("b.txt", "b2\n")]);

        let merged = merge_trees(&repo, Some(base), ours, theirs).unwrap();
        let TreeMerge::Clean(tree_id) = merged else {
            panic!("expected clean merge");
        };
        assert_eq!(
            read_path(&repo, tree_id, Path::new("a.txt")).unwrap().unwrap(),
            b"a2\n"
        );
        assert_eq!(
            read_path(&repo, tree_id, Path::new("b.txt")).unwrap().unwrap(),
            b"b2\n"
        );
    }

    #[test]
    fn test_merge_trees_conflict() {
        let (_dir, repo) = setup();
        let base = tree_with(&repo, &[("shared.txt", "base\n")]);
        let ours = tree_with(&repo, &[("shared.txt", "ours\n")]);
        let theirs = tree_with(&repo, &[("shared.txt", "theirs\n")]);

        let merged = merge_trees(&repo, Some(base), ours, theirs).unwrap();
        assert_eq!(
            merged,
            TreeMerge::Conflicted {
                paths: vec![PathBuf::from("shared.txt")]
            }
        );
    }

    #[test]
    fn test_materialize_merge_writes_markers() {
        let (dir, repo) = setup();
        let base = tree_with(&repo, &[("shared.txt", "base\n"), ("other.txt", "o\n")]);
        let ours = tree_with(&repo, &[("shared.txt", "ours\n"), ("other.txt", "o\n")]);
        let theirs = tree_with(&repo, &[("shared.txt", "theirs\n"), ("other.txt", "o2\n")]);

        let out = dir.path().join("worktree");
        let conflicts = materialize_merge(&repo, Some(base), ours, theirs, &out).unwrap();
        assert_eq!(conflicts, vec![PathBuf::from("shared.txt")]);

        let shared = fs::read(out.join("shared.txt")).unwrap();
        assert_eq!(
            String::from_utf8(shared.clone()).unwrap(),
            "<<<<<<< ours\nours\n=======\ntheirs\n>>>>>>> theirs\n"
        );
        assert!(has_conflict_markers(&shared));
        assert_eq!(fs::read_to_string(out.join("other.txt")).unwrap(), "o2\n");
    }

    #[test]
    fn test_materialize_tree_round_trips_snapshot() {
        let (dir, repo) = setup();
        let tree = tree_with(&repo, &[("x.txt", "x\n"), ("y.txt", "y\n")]);
        let out = dir.path().join("copy");
        materialize_tree(&repo, tree, &out).unwrap();
        let again = snapshot_dir(&repo, &out, &|_, _| false, false).unwrap();
        assert_eq!(tree, again);
    }

    #[test]
    fn test_has_conflict_markers() {
        assert!(!has_conflict_markers(b"plain text\n"));
        assert!(!has_conflict_markers(b"<<<<<<< only an opener\n"));
        assert!(has_conflict_markers(&conflict_block(b"a", b"b")));
    }
}
