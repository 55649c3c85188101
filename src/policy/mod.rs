//! Promote policy: strategy selection and the checks gating a promote.
//!
//! The policy file is `.wsync/policy.toml`:
//!
//! ```text
//! [promote]
//! strategy = "rebase"
//! required_checks = ["test", "compile"]
//!
//! [promote.main]
//! min_coverage_pct = 80
//! require_suggestions_addressed = true
//! ```
//!
//! A `[promote.<branch>]` table overrides `[promote]` key by key.

pub mod gate;

use std::fmt;
use std::fs;
use std::io;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use gate::{enforce, is_passing_status};

pub const POLICY_FILE: &str = "policy.toml";

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("invalid policy file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("unknown strategy '{0}'")]
    InvalidStrategy(String),

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// How a checkpoint chain lands on the target branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    /// one published commit per checkpoint
    #[default]
    Rebase,
    /// a single commit carrying the final checkpoint's message
    Squash,
    /// a non-fast-forward merge commit
    Merge,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::Rebase => "rebase",
            Strategy::Squash => "squash",
            Strategy::Merge => "merge",
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Strategy {
    type Err = PolicyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "rebase" => Ok(Strategy::Rebase),
            "squash" => Ok(Strategy::Squash),
            "merge" => Ok(Strategy::Merge),
            _ => Err(PolicyError::InvalidStrategy(s.trim().to_string())),
        }
    }
}

/// Effective promote policy for one target branch.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PromotePolicy {
    /// raw value; validated when the strategy is resolved
    pub strategy: Option<String>,
    pub min_coverage_pct: Option<f64>,
    pub required_checks: Vec<String>,
    pub require_suggestions_addressed: Option<bool>,
}

impl PromotePolicy {
    /// Load the policy for `target` from `<state_dir>/policy.toml`; a missing
    /// file is an empty policy.
    pub fn load(state_dir: &Path, target: &str) -> Result<Self, PolicyError> {
        match fs::read_to_string(state_dir.join(POLICY_FILE)) {
            Ok(text) => Self::parse(&text, target),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn parse(text: &str, target: &str) -> Result<Self, PolicyError> {
        let file: PolicyFile = toml::from_str(text)?;
        let mut policy = Self::default();
        policy.overlay(toml::Value::Table(file.promote.clone()).try_into()?);
        let target = target.trim().trim_start_matches("refs/heads/");
        if !target.is_empty() {
            if let Some(toml::Value::Table(branch)) = file.promote.get(target) {
                policy.overlay(toml::Value::Table(branch.clone()).try_into()?);
            }
        }
        Ok(policy)
    }

    fn overlay(&mut self, keys: PolicyKeys) {
        if let Some(strategy) = keys.strategy.filter(|s| !s.trim().is_empty()) {
            self.strategy = Some(strategy.trim().to_string());
        }
        if keys.min_coverage_pct.is_some() {
            self.min_coverage_pct = keys.min_coverage_pct;
        }
        if let Some(checks) = keys.required_checks.filter(|c| !c.is_empty()) {
            self.required_checks = checks;
        }
        if keys.require_suggestions_addressed.is_some() {
            self.require_suggestions_addressed = keys.require_suggestions_addressed;
        }
    }

    /// nothing to check
    pub fn is_empty(&self) -> bool {
        self.min_coverage_pct.is_none()
            && self.required_checks.is_empty()
            && !self.require_suggestions_addressed.unwrap_or(false)
    }
}

/// Explicit flag, then policy, then `rebase`.
pub fn resolve_strategy(explicit: Option<&str>, policy: &PromotePolicy) -> Result<Strategy, PolicyError> {
    let raw = explicit
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .or_else(|| policy.strategy.as_deref());
    match raw {
        Some(raw) => raw.parse(),
        None => Ok(Strategy::default()),
    }
}

/// `.wsync/policy.toml`; branch tables sit inside `promote`
#[derive(Debug, Default, Deserialize)]
struct PolicyFile {
    #[serde(default)]
    promote: toml::Table,
}

/// keys of one `[promote]` or `[promote.<branch>]` table; unknown keys
/// and nested tables are ignored
#[derive(Debug, Default, Deserialize)]
struct PolicyKeys {
    strategy: Option<String>,
    min_coverage_pct: Option<f64>,
    required_checks: Option<Vec<String>>,
    require_suggestions_addressed: Option<bool>,
}
