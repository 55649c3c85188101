//! wsync - multi-device workspace sync and promotion
//!
//! Command-line entry point. Every subcommand maps onto one engine
//! operation; `--json` prints the operation's result (or error report) as
//! JSON on stdout.

use std::path::PathBuf;
use std::process::ExitCode;
use std::str::FromStr;

use serde::Serialize;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Registry};

use wsync::agent::AgentError;
use wsync::identity::ChangeId;
use wsync::metadata::{AttestationInput, AttestationStore, SuggestionStatus, SuggestionStore};
use wsync::promote::PromoteOptions;
use wsync::reconcile::{MergeOptions, MergeOutcome, MergeSource};
use wsync::storage::{CommitId, InvalidNameError, ObjectStore, StorageError};
use wsync::workspace::state::{self, WorkspaceState};
use wsync::{agent, Engine, GitRepository, WorkflowError, WorkspaceContext};

/// Bad command line; reported before anything runs.
struct Usage(String);

/// Remaining arguments of one subcommand.
struct Args {
    items: Vec<String>,
}

impl Args {
    /// Remove `names` if present.
    fn flag(&mut self, names: &[&str]) -> bool {
        match self.items.iter().position(|a| names.contains(&a.as_str())) {
            Some(i) => {
                self.items.remove(i);
                true
            }
            None => false,
        }
    }

    /// Remove `names VALUE` (or `--name=VALUE`) and return the value.
    fn value(&mut self, names: &[&str]) -> Result<Option<String>, Usage> {
        for i in 0..self.items.len() {
            let arg = self.items[i].clone();
            if names.contains(&arg.as_str()) {
                if i + 1 >= self.items.len() {
                    return Err(Usage(format!("{} requires a value", arg)));
                }
                let value = self.items.remove(i + 1);
                self.items.remove(i);
                return Ok(Some(value));
            }
            if let Some((name, value)) = arg.split_once('=') {
                if names.contains(&name) {
                    self.items.remove(i);
                    return Ok(Some(value.to_string()));
                }
            }
        }
        Ok(None)
    }

    fn parsed<T: FromStr>(&mut self, names: &[&str]) -> Result<Option<T>, Usage> {
        match self.value(names)? {
            Some(raw) => raw
                .parse()
                .map(Some)
                .map_err(|_| Usage(format!("invalid value for {}: {}", names[0], raw))),
            None => Ok(None),
        }
    }

    fn positional(&mut self) -> Option<String> {
        let i = self.items.iter().position(|a| !a.starts_with('-'))?;
        Some(self.items.remove(i))
    }

    /// Anything left over is an error.
    fn finish(self) -> Result<(), Usage> {
        match self.items.first() {
            Some(extra) => Err(Usage(format!("unexpected argument: {}", extra))),
            None => Ok(()),
        }
    }
}

struct Global {
    dir: PathBuf,
    verbose: bool,
    json: bool,
}

fn main() -> ExitCode {
    let mut global = Global {
        dir: PathBuf::from("."),
        verbose: false,
        json: false,
    };
    let mut command: Option<String> = None;
    let mut rest = Vec::new();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "-C" if command.is_none() => {
                i += 1;
                match args.get(i) {
                    Some(dir) => global.dir = PathBuf::from(dir),
                    None => {
                        eprintln!("-C requires a directory");
                        return ExitCode::from(2);
                    }
                }
            }
            "-v" | "--verbose" => global.verbose = true,
            "--json" => global.json = true,
            "-h" | "--help" if command.is_none() => {
                print_help();
                return ExitCode::SUCCESS;
            }
            "--version" if command.is_none() => {
                println!("wsync v{}", env!("CARGO_PKG_VERSION"));
                return ExitCode::SUCCESS;
            }
            arg if command.is_none() && !arg.starts_with('-') => command = Some(arg.to_string()),
            arg => rest.push(arg.to_string()),
        }
        i += 1;
    }

    let Some(command) = command else {
        print_help();
        return ExitCode::from(2);
    };
    init_logging(global.verbose);

    match run(&global, &command, Args { items: rest }) {
        Ok(()) => ExitCode::SUCCESS,
        Err(Failure::Usage(Usage(message))) => {
            eprintln!("error: {}", message);
            eprintln!("run `wsync --help` for usage");
            ExitCode::from(2)
        }
        Err(Failure::Workflow(e)) => {
            report_error(&global, &e);
            ExitCode::FAILURE
        }
    }
}

enum Failure {
    Usage(Usage),
    Workflow(WorkflowError),
}

impl From<Usage> for Failure {
    fn from(usage: Usage) -> Self {
        Failure::Usage(usage)
    }
}

impl From<WorkflowError> for Failure {
    fn from(e: WorkflowError) -> Self {
        Failure::Workflow(e)
    }
}

impl From<StorageError> for Failure {
    fn from(e: StorageError) -> Self {
        Failure::Workflow(e.into())
    }
}

impl From<AgentError> for Failure {
    fn from(e: AgentError) -> Self {
        Failure::Workflow(e.into())
    }
}

impl From<InvalidNameError> for Failure {
    fn from(e: InvalidNameError) -> Self {
        Failure::Workflow(e.into())
    }
}

fn init_logging(verbose: bool) {
    let default = if verbose { "wsync=debug" } else { "wsync=warn" };
    let filter = EnvFilter::try_from_env("WSYNC_LOG").unwrap_or_else(|_| EnvFilter::new(default));
    let layer = tracing_subscriber::fmt::layer()
        .compact()
        .with_writer(std::io::stderr)
        .with_target(verbose);
    // a second init (tests, embedding) keeps the first subscriber
    let _ = Registry::default().with(filter).with(layer).try_init();
}

fn run(global: &Global, command: &str, mut args: Args) -> Result<(), Failure> {
    let repo = GitRepository::open(&global.dir)?;
    let mut ctx = WorkspaceContext::from_env(&repo)?;
    if matches!(command, "sync" | "checkpoint") && args.flag(&["--allow-secrets"]) {
        ctx.allow_secrets = true;
    }
    let agent = agent::from_env()?;
    let mut engine = Engine::new(&repo, &ctx);
    if let Some(agent) = agent.as_ref() {
        engine = engine.with_agent(agent);
    }

    match command {
        "sync" => {
            args.finish()?;
            let result = engine.sync()?;
            emit(global, &result, || {
                let verb = if result.created { "synced" } else { "unchanged" };
                println!("{} draft {} ({})", verb, result.draft.short(), result.change_id.short());
                print_warnings(&result.warnings);
            })
        }
        "checkout" => {
            args.finish()?;
            let result = engine.checkout_workspace()?;
            emit(global, &result, || {
                println!("checked out {} at {}", ctx.workspace, result.draft.short());
            })
        }
        "checkpoint" => {
            let adopt = args.flag(&["--adopt"]);
            let message = args.value(&["-m", "--message"])?;
            args.finish()?;
            if adopt && message.is_some() {
                return Err(WorkflowError::ConflictingFlags("--adopt takes its message from HEAD".into()).into());
            }
            let result = if adopt {
                engine.adopt_checkpoint()?
            } else {
                engine.checkpoint(message.as_deref())?
            };
            emit(global, &result, || {
                let subject = result.message.lines().next().unwrap_or_default();
                println!("checkpoint {} {}", result.checkpoint.short(), subject);
                println!("  change {}", result.change_id);
                for id in &result.suggestions {
                    println!("  suggestion {}", id);
                }
                print_warnings(&result.warnings);
            })
        }
        "merge" => {
            let apply = args.flag(&["--apply", "-y"]);
            let device = args.value(&["--device"])?;
            args.finish()?;
            let options = MergeOptions {
                theirs: device.map(MergeSource::Device).unwrap_or_default(),
                apply: apply || ctx.auto_apply,
            };
            let outcome = engine.merge(&options)?;
            emit(global, &outcome, || {
                match &outcome {
                    MergeOutcome::UpToDate => println!("already up to date"),
                    MergeOutcome::Resolved {
                        merged,
                        suggestion_id,
                        conflicts,
                        applied,
                        ..
                    } => {
                        let state = if *applied { "applied" } else { "pending" };
                        println!("merged {} ({}, suggestion {})", merged.short(), state, suggestion_id);
                        for path in conflicts {
                            println!("  resolved {}", path.display());
                        }
                    }
                    MergeOutcome::Conflicts { paths, worktree } => {
                        println!("conflicts in {}", worktree.display());
                        for path in paths {
                            println!("  {}", path.display());
                        }
                    }
                }
                for next in outcome.next_actions() {
                    println!("  next: {}", next.command);
                }
            })
        }
        "promote" => {
            let skip_policy = args.flag(&["--no-policy"]);
            let force = args.flag(&["--force"]);
            let confirm_rewrite = args.flag(&["--confirm-rewrite"]);
            let target = args
                .value(&["--to"])?
                .ok_or_else(|| Usage("promote requires --to BRANCH".into()))?;
            let strategy = args.value(&["--strategy"])?;
            let commit = match args.value(&["--commit"])? {
                Some(raw) => Some(resolve_commit(&repo, &raw)?),
                None => None,
            };
            args.finish()?;
            let result = engine.promote(&PromoteOptions {
                target,
                strategy,
                commit,
                skip_policy,
                force,
                confirm_rewrite,
            })?;
            emit(global, &result, || {
                for lower in &result.stacked {
                    println!("promoted {} ({} commit(s))", lower.workspace, lower.published.len());
                }
                let tip = result.tip().map(|t| t.short()).unwrap_or_default();
                println!(
                    "promoted {} to {} via {} at {}",
                    result.change_id.short(),
                    result.target,
                    result.strategy,
                    tip
                );
                println!("  next change {}", result.next_change_id.short());
                print_warnings(&result.warnings);
            })
        }
        "restack" => {
            let onto = args.value(&["--onto"])?;
            args.finish()?;
            let result = engine.restack(onto.as_deref())?;
            emit(global, &result, || {
                println!(
                    "restacked {} checkpoint(s) onto {} ({})",
                    result.checkpoints.len(),
                    result.onto,
                    result.base_tip.short()
                );
                print_warnings(&result.warnings);
            })
        }
        "stack" => {
            let name = args
                .positional()
                .ok_or_else(|| Usage("stack requires a workspace name".into()))?;
            args.finish()?;
            let result = engine.stack_workspace(&name)?;
            emit(global, &result, || {
                println!("workspace {} stacked on {} ({})", result.workspace, result.base_ref, result.base.short());
            })
        }
        "suggestions" => {
            let change = match args.value(&["--change"])? {
                Some(raw) => Some(ChangeId::parse(&raw)?),
                None => None,
            };
            let status = match args.value(&["--status"])? {
                Some(raw) => Some(
                    SuggestionStatus::from_str(&raw).map_err(|_| Usage(format!("unknown status: {}", raw)))?,
                ),
                None => None,
            };
            args.finish()?;
            let list = SuggestionStore::new(&repo).list(change.as_ref(), status)?;
            emit(global, &list, || {
                if list.is_empty() {
                    println!("no suggestions");
                }
                for s in &list {
                    println!(
                        "{} {:<8} {} {} ({})",
                        s.suggestion_id,
                        s.status.as_str(),
                        s.change_id.short(),
                        s.reason,
                        s.created_by
                    );
                }
            })
        }
        "apply" => {
            let force = args.flag(&["--force"]);
            let id = args
                .positional()
                .ok_or_else(|| Usage("apply requires a suggestion id".into()))?;
            args.finish()?;
            let result = engine.apply_suggestion(&id, force)?;
            emit(global, &result, || {
                println!("applied {} ({} file(s))", id, result.files_changed.len());
            })
        }
        "reject" => {
            let reason = args.value(&["-m", "--message"])?;
            let id = args
                .positional()
                .ok_or_else(|| Usage("reject requires a suggestion id".into()))?;
            args.finish()?;
            let result = engine.reject_suggestion(&id, reason.as_deref())?;
            emit(global, &result, || println!("rejected {}", id))
        }
        "attest" => {
            let commit = args.value(&["--commit"])?;
            let input = AttestationInput {
                status: args
                    .value(&["--status"])?
                    .ok_or_else(|| Usage("attest requires --status".into()))?,
                compile_status: args.value(&["--compile"])?.unwrap_or_default(),
                test_status: args.value(&["--test"])?.unwrap_or_default(),
                coverage_line_pct: args.parsed(&["--coverage-line"])?,
                coverage_branch_pct: args.parsed(&["--coverage-branch"])?,
            };
            args.finish()?;
            let commit = match commit {
                Some(raw) => resolve_commit(&repo, &raw)?,
                None => latest_checkpoint(&repo, &ctx)?,
            };
            let attestation = AttestationStore::new(&repo).record(commit, input)?;
            emit(global, &attestation, || {
                println!("recorded {} for {}", attestation.status, commit.short());
            })
        }
        "prune" => {
            let days = args.parsed(&["--days"])?;
            args.finish()?;
            let result = engine.prune(days)?;
            emit(global, &result, || {
                if result.enabled {
                    println!(
                        "pruned {} keep ref(s), removed {} note(s), {} suggestion(s)",
                        result.pruned_refs, result.notes_removed, result.suggestions_removed
                    );
                } else {
                    println!("retention disabled; nothing to prune");
                }
            })
        }
        other => Err(Usage(format!("unknown command: {}", other)).into()),
    }
}

/// Print `value` as JSON, or run `human`.
fn emit<T: Serialize>(global: &Global, value: &T, human: impl FnOnce()) -> Result<(), Failure> {
    if global.json {
        let text = serde_json::to_string_pretty(value).map_err(WorkflowError::from)?;
        println!("{}", text);
    } else {
        human();
    }
    Ok(())
}

fn print_warnings(warnings: &[String]) {
    for warning in warnings {
        eprintln!("warning: {}", warning);
    }
}

fn report_error(global: &Global, e: &WorkflowError) {
    let report = e.report();
    if global.json {
        match serde_json::to_string_pretty(&report) {
            Ok(text) => println!("{}", text),
            Err(_) => eprintln!("error[{}]: {}", report.code, report.message),
        }
        return;
    }
    eprintln!("error[{}]: {}", report.code, report.message);
    for next in &report.next_actions {
        eprintln!("  next: {}", next.command);
    }
}

/// A full sha, or any ref name that resolves.
fn resolve_commit(repo: &GitRepository, raw: &str) -> Result<CommitId, Failure> {
    if let Ok(sha) = CommitId::from_hex(raw) {
        if raw.len() == 40 {
            return Ok(sha);
        }
    }
    for candidate in [raw.to_string(), format!("refs/heads/{}", raw)] {
        if let Some(sha) = repo.resolve_ref(&candidate)? {
            return Ok(sha);
        }
    }
    Err(Usage(format!("cannot resolve commit: {}", raw)).into())
}

/// The checkpoint this device's workspace currently sits on.
fn latest_checkpoint(repo: &GitRepository, ctx: &WorkspaceContext) -> Result<CommitId, Failure> {
    let lease = WorkspaceState::new(repo.workdir(), &ctx.workspace).lease()?;
    let base = match lease {
        Some(sha) => state::draft_base(repo, sha)?,
        None => None,
    };
    base.ok_or_else(|| {
        Failure::Workflow(WorkflowError::precondition(
            "checkpoint_required",
            "no checkpoint yet; pass --commit",
        ))
    })
}

fn print_help() {
    println!("wsync - multi-device workspace sync and promotion");
    println!();
    println!("Usage: wsync [-C DIR] [-v] [--json] <COMMAND> [ARGS]");
    println!();
    println!("Commands:");
    println!("  sync [--allow-secrets]       Mirror the working tree into this device's draft");
    println!("  checkout                     Realign this device with the published workspace");
    println!("  checkpoint [-m MSG] [--allow-secrets]");
    println!("                               Freeze the draft into a checkpoint");
    println!("  checkpoint --adopt           Adopt HEAD as a checkpoint");
    println!("  merge [--apply] [--device D] Reconcile with the workspace or another device");
    println!("  promote --to BRANCH          Publish the change to BRANCH");
    println!("      [--strategy rebase|squash|merge] [--commit SHA]");
    println!("      [--no-policy] [--force] [--confirm-rewrite]");
    println!("  restack [--onto REF]         Replay the change onto a newer base");
    println!("  stack NAME                   Start workspace NAME on the latest checkpoint");
    println!("  suggestions [--change ID] [--status S]");
    println!("  apply ID [--force]           Apply a pending suggestion");
    println!("  reject ID [-m REASON]        Reject a pending suggestion");
    println!("  attest --status S [--commit SHA] [--compile S] [--test S]");
    println!("      [--coverage-line PCT] [--coverage-branch PCT]");
    println!("  prune [--days N]             Drop expired keep refs");
    println!();
    println!("Options:");
    println!("  -C DIR          Run in DIR instead of the current directory");
    println!("  -v, --verbose   Debug logging (or set WSYNC_LOG)");
    println!("  --json          Machine-readable output");
    println!("  -h, --help      Show this help message");
    println!("  --version       Show version");
}
