//! Fixtures shared by the engine tests: devices backed by real repositories
//! in temp dirs, a bare repository standing in for the remote, and
//! scripted agents.

use std::cell::RefCell;
use std::fs;
use std::path::{Path, PathBuf};

use tempfile::TempDir;

use crate::agent::{AgentAction, AgentError, AgentRequest, AgentResponse, AgentResult, ConflictAgent};
use crate::context::WorkspaceContext;
use crate::engine::Engine;
use crate::storage::{CommitId, Expect, GitRepository, ObjectStore, RefName};

pub const MAIN: &str = "refs/heads/main";

/// A bare repository in a temp dir.
pub fn remote() -> TempDir {
    let dir = TempDir::new().unwrap();
    git2::Repository::init_bare(dir.path()).unwrap();
    dir
}

pub struct Device {
    pub dir: TempDir,
    pub repo: GitRepository,
    pub ctx: WorkspaceContext,
}

impl Device {
    /// Fresh repository with one commit on `main` (README.md = "hello\n").
    /// With a remote, `main` is pushed there.
    pub fn new(name: &str, remote: Option<&Path>) -> Self {
        let dir = TempDir::new().unwrap();
        let repo = GitRepository::init(dir.path()).unwrap();
        fs::write(dir.path().join("README.md"), "hello\n").unwrap();
        let tree = repo.snapshot_workdir(&|_, _| false).unwrap();
        let initial = repo.create_commit(tree, &[], "initial\n").unwrap();
        let main = RefName::new(MAIN).unwrap();
        repo.update_ref(&main, initial, Expect::Any, "test").unwrap();
        repo.set_head(&main).unwrap();

        let mut builder = WorkspaceContext::builder().user("alice").device(name);
        match remote {
            Some(path) => {
                repo.with_repo(|r| {
                    r.remote("origin", path.to_str().unwrap())?;
                    Ok(())
                })
                .unwrap();
                repo.push_ref("origin", MAIN, false).unwrap();
                builder = builder.remote("origin");
            }
            None => builder = builder.local_only(),
        }
        let ctx = builder.build(&repo).unwrap();
        Self { dir, repo, ctx }
    }

    /// Second device cloned from the same remote: shares `main` with the
    /// first one.
    pub fn clone_of(name: &str, remote: &Path) -> Self {
        let dir = TempDir::new().unwrap();
        let repo = GitRepository::init(dir.path()).unwrap();
        repo.with_repo(|r| {
            r.remote("origin", remote.to_str().unwrap())?;
            Ok(())
        })
        .unwrap();
        let tip = repo.fetch_ref("origin", MAIN, MAIN).unwrap().unwrap();
        let main = RefName::new(MAIN).unwrap();
        repo.set_head(&main).unwrap();
        repo.checkout_workdir(None, repo.tree_of(tip).unwrap()).unwrap();
        let ctx = WorkspaceContext::builder()
            .user("alice")
            .device(name)
            .remote("origin")
            .build(&repo)
            .unwrap();
        Self { dir, repo, ctx }
    }

    pub fn engine(&self) -> Engine<'_> {
        Engine::new(&self.repo, &self.ctx)
    }

    pub fn path(&self, rel: &str) -> PathBuf {
        self.dir.path().join(rel)
    }

    pub fn write(&self, rel: &str, content: &str) {
        let path = self.path(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, content).unwrap();
    }

    pub fn read(&self, rel: &str) -> String {
        fs::read_to_string(self.path(rel)).unwrap()
    }

    pub fn resolve(&self, name: &str) -> Option<CommitId> {
        self.repo.resolve_ref(name).unwrap()
    }

    pub fn file_at(&self, commit: CommitId, rel: &str) -> Option<String> {
        let tree = self.repo.tree_of(commit).unwrap();
        self.repo
            .read_path(tree, Path::new(rel))
            .unwrap()
            .map(|b| String::from_utf8(b).unwrap())
    }
}

/// Agent returning canned answers; resolve requests overwrite the listed
/// conflict files with `resolution`.
#[derive(Default)]
pub struct ScriptedAgent {
    pub summary: Option<String>,
    pub resolution: Option<String>,
    pub review_commits: Vec<CommitId>,
    pub fail: bool,
    pub calls: RefCell<Vec<AgentAction>>,
}

impl ConflictAgent for ScriptedAgent {
    fn name(&self) -> &str {
        "scripted"
    }

    fn invoke(&self, request: &AgentRequest) -> AgentResult<AgentResponse> {
        self.calls.borrow_mut().push(request.action);
        if self.fail {
            return Err(AgentError::Failed {
                status: Some(1),
                output: "scripted failure".into(),
            });
        }
        let mut response = AgentResponse {
            version: 1,
            status: "ok".into(),
            ..Default::default()
        };
        match request.action {
            AgentAction::GenerateMessage => response.summary = self.summary.clone(),
            AgentAction::ResolveConflict => {
                if let Some(content) = &self.resolution {
                    for path in &request.context.conflicts {
                        fs::write(request.workspace_path.join(path), content).unwrap();
                    }
                }
            }
            AgentAction::Review => {
                response.suggestions = self
                    .review_commits
                    .iter()
                    .map(|c| crate::agent::AgentSuggestion {
                        commit: c.to_string(),
                        reason: "review".into(),
                        description: "tidy up".into(),
                        confidence: 0.5,
                        ..Default::default()
                    })
                    .collect();
            }
        }
        Ok(response)
    }
}
