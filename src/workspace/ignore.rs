//! Paths that never leave the device.
//!
//! Draft and checkpoint snapshots skip the state directory and common
//! secret files on top of the repository's own ignore rules. Extra
//! patterns come from `.wsync/syncignore`, one per line.

use std::fs;
use std::path::Path;

use crate::context::STATE_DIR;

pub const SYNCIGNORE_FILE: &str = "syncignore";

pub const DEFAULT_PATTERNS: &[&str] = &[
    ".wsync/",
    ".env",
    ".env.*",
    "*.pem",
    "*.key",
    "id_rsa",
    ".aws/credentials",
    ".npmrc",
    ".pypirc",
    ".netrc",
];

/// A set of sync-ignore patterns.
///
/// - `dir/` matches the directory and everything under it
/// - a pattern containing `/` is matched against the whole relative path
/// - anything else is matched against the basename
///
/// `*` and `?` never match `/`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncIgnore {
    patterns: Vec<String>,
}

impl Default for SyncIgnore {
    fn default() -> Self {
        Self {
            patterns: DEFAULT_PATTERNS.iter().map(|p| p.to_string()).collect(),
        }
    }
}

impl SyncIgnore {
    /// Defaults plus the patterns in `<workdir>/.wsync/syncignore`. A missing
    /// or unreadable file only yields the defaults.
    pub fn load(workdir: &Path) -> Self {
        let mut ignore = Self::default();
        let path = workdir.join(STATE_DIR).join(SYNCIGNORE_FILE);
        if let Ok(text) = fs::read_to_string(path) {
            ignore.extend_from_str(&text);
        }
        ignore
    }

    /// Append patterns from syncignore text; blank lines and `#` comments
    /// are skipped.
    pub fn extend_from_str(&mut self, text: &str) {
        self.patterns.extend(
            text.lines()
                .map(str::trim)
                .filter(|l| !l.is_empty() && !l.starts_with('#'))
                .map(|l| l.replace('\\', "/")),
        );
    }

    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }

    /// Check a workdir-relative path. Directories match their own name, so
    /// a skipped directory is never descended into.
    pub fn is_ignored(&self, rel: &Path, _is_dir: bool) -> bool {
        let path = rel.to_string_lossy().replace('\\', "/");
        let path = path.trim_matches('/');
        if path.is_empty() {
            return false;
        }
        let basename = path.rsplit('/').next().unwrap_or(path);
        self.patterns.iter().any(|pattern| {
            if let Some(prefix) = pattern.strip_suffix('/') {
                path == prefix || path.starts_with(&format!("{}/", prefix))
            } else if pattern.contains('/') {
                glob_match(pattern.as_bytes(), path.as_bytes())
            } else {
                glob_match(pattern.as_bytes(), basename.as_bytes())
            }
        })
    }
}

/// `*` and `?` wildcard match; neither crosses a `/`.
fn glob_match(pattern: &[u8], text: &[u8]) -> bool {
    let (mut p, mut t) = (0, 0);
    let mut backtrack: Option<(usize, usize)> = None;
    while t < text.len() {
        match pattern.get(p) {
            Some(b'*') => {
                backtrack = Some((p, t));
                p += 1;
            }
            Some(b'?') if text[t] != b'/' => {
                p += 1;
                t += 1;
            }
            Some(&c) if c == text[t] => {
                p += 1;
                t += 1;
            }
            _ => match backtrack {
                // the star absorbs one more byte, but never a separator
                Some((star, from)) if text[from] != b'/' => {
                    p = star + 1;
                    t = from + 1;
                    backtrack = Some((star, from + 1));
                }
                _ => return false,
            },
        }
    }
    pattern[p..].iter().all(|&c| c == b'*')
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn ignored(ignore: &SyncIgnore, path: &str) -> bool {
        ignore.is_ignored(&PathBuf::from(path), false)
    }

    #[test]
    fn test_defaults() {
        let ignore = SyncIgnore::default();
        assert!(ignore.is_ignored(Path::new(".wsync"), true));
        assert!(ignored(&ignore, ".wsync/workspaces/@/lease"));
        assert!(ignored(&ignore, ".env"));
        assert!(ignored(&ignore, "config/.env.production"));
        assert!(ignored(&ignore, "certs/server.pem"));
        assert!(ignored(&ignore, ".aws/credentials"));
        assert!(!ignored(&ignore, "home/.aws/credentials"));
        assert!(!ignored(&ignore, "src/env.rs"));
        assert!(!ignored(&ignore, "keys.txt"));
    }

    #[test]
    fn test_glob_match() {
        assert!(glob_match(b"*.log", b"debug.log"));
        assert!(glob_match(b"a?c", b"abc"));
        assert!(!glob_match(b"a?c", b"a/c"));
        assert!(glob_match(b"build/*.o", b"build/main.o"));
        assert!(!glob_match(b"build/*.o", b"build/sub/main.o"));
        assert!(glob_match(b"**", b"anything"));
        assert!(!glob_match(b"*.rs", b"main.rsx"));
    }

    #[test]
    fn test_load_user_patterns() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join(STATE_DIR)).unwrap();
        fs::write(
            dir.path().join(STATE_DIR).join(SYNCIGNORE_FILE),
            "# local scratch\n\nscratch/\n*.sqlite\n",
        )
        .unwrap();

        let ignore = SyncIgnore::load(dir.path());
        assert_eq!(ignore.patterns().len(), DEFAULT_PATTERNS.len() + 2);
        assert!(ignored(&ignore, "scratch/notes.md"));
        assert!(ignored(&ignore, "data/app.sqlite"));
        assert!(!ignored(&ignore, "scratchpad.md"));
    }
}
