//! The checks a checkpoint must pass before it is promoted.

use crate::metadata::AttestationView;
use crate::policy::PromotePolicy;

/// `pass`, `passed`, `ok`, `success` or `succeeded`, in any case
pub fn is_passing_status(status: &str) -> bool {
    matches!(
        status.trim().to_ascii_lowercase().as_str(),
        "pass" | "passed" | "ok" | "success" | "succeeded"
    )
}

fn label(status: &str) -> &str {
    let trimmed = status.trim();
    if trimmed.is_empty() {
        "missing"
    } else {
        trimmed
    }
}

/// Evaluate `policy` against the attestation of the promoted commit.
///
/// Returns every failure found; an empty policy always passes. A missing or
/// stale attestation fails on its own, since the remaining checks would be
/// judged against the wrong commit.
pub fn enforce(
    policy: &PromotePolicy,
    view: Option<&AttestationView>,
    pending_suggestions: usize,
) -> Result<(), Vec<String>> {
    if policy.is_empty() {
        return Ok(());
    }
    let needs_ci = policy.min_coverage_pct.is_some() || !policy.required_checks.is_empty();
    let mut failures = Vec::new();

    if needs_ci {
        match view {
            None => failures.push("no CI results found for the promoted checkpoint".to_string()),
            Some(view) if view.stale => failures.push(format!(
                "CI results are stale (inherited from {}); rerun CI on the latest checkpoint",
                view.attestation.commit_sha.short()
            )),
            Some(view) => {
                let att = &view.attestation;
                for check in &policy.required_checks {
                    let name = check.trim().to_ascii_lowercase();
                    let (what, status) = match name.as_str() {
                        "" => continue,
                        "test" | "tests" => ("test", att.test_status.as_str()),
                        "compile" | "build" => ("compile", att.compile_status.as_str()),
                        _ => ("CI", att.status.as_str()),
                    };
                    if !is_passing_status(status) {
                        failures.push(format!("{} status {}", what, label(status)));
                    }
                }
                if let Some(min) = policy.min_coverage_pct {
                    match att.coverage_line_pct.or(att.coverage_branch_pct) {
                        None => failures.push("coverage data missing".to_string()),
                        Some(pct) if pct < min => failures.push(format!(
                            "coverage {:.1}% below policy threshold {:.1}%",
                            pct, min
                        )),
                        Some(_) => {}
                    }
                }
            }
        }
    }

    if policy.require_suggestions_addressed.unwrap_or(false) && pending_suggestions > 0 {
        failures.push(format!(
            "{} pending suggestion(s) must be addressed",
            pending_suggestions
        ));
    }

    if failures.is_empty() {
        Ok(())
    } else {
        Err(failures)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::ChangeId;
    use crate::metadata::Attestation;
    use crate::storage::CommitId;
    use chrono::Utc;

    fn view(status: &str, test: &str, coverage: Option<f64>, stale: bool) -> AttestationView {
        let sha = CommitId::from_hex(&"a".repeat(40)).unwrap();
        AttestationView {
            attestation: Attestation {
                attestation_id: "01".into(),
                commit_sha: sha,
                change_id: ChangeId::fallback_for(sha),
                status: status.into(),
                compile_status: String::new(),
                test_status: test.into(),
                coverage_line_pct: None,
                coverage_branch_pct: coverage,
                inherit_from: None,
                created_at: Utc::now(),
            },
            stale,
        }
    }

    fn policy(checks: &[&str], min: Option<f64>) -> PromotePolicy {
        PromotePolicy {
            required_checks: checks.iter().map(|s| s.to_string()).collect(),
            min_coverage_pct: min,
            ..Default::default()
        }
    }

    #[test]
    fn test_empty_policy_passes() {
        assert!(enforce(&PromotePolicy::default(), None, 3).is_ok());
    }

    #[test]
    fn test_required_checks() {
        let p = policy(&["tests", "build", "lint"], None);
        let failures = enforce(&p, Some(&view("OK", "passed", None, false)), 0).unwrap_err();
        assert_eq!(failures, vec!["compile status missing".to_string()]);

        let failures = enforce(&p, Some(&view("failed", "passed", None, false)), 0).unwrap_err();
        assert_eq!(failures.len(), 2);
        assert!(failures[1].starts_with("CI status failed"));
    }

    #[test]
    fn test_stale_and_missing_results_fail() {
        let p = policy(&["test"], None);
        assert!(enforce(&p, None, 0).is_err());
        let failures = enforce(&p, Some(&view("pass", "pass", None, true)), 0).unwrap_err();
        assert!(failures[0].contains("stale"));
    }

    #[test]
    fn test_coverage_uses_branch_when_line_missing() {
        let p = policy(&[], Some(80.0));
        assert!(enforce(&p, Some(&view("pass", "", Some(85.0), false)), 0).is_ok());
        let failures = enforce(&p, Some(&view("pass", "", Some(70.0), false)), 0).unwrap_err();
        assert_eq!(failures, vec!["coverage 70.0% below policy threshold 80.0%".to_string()]);
        assert!(enforce(&p, Some(&view("pass", "", None, false)), 0).is_err());
    }

    #[test]
    fn test_pending_suggestions() {
        let p = PromotePolicy {
            require_suggestions_addressed: Some(true),
            ..Default::default()
        };
        assert!(enforce(&p, None, 0).is_ok());
        assert!(enforce(&p, None, 1).is_err());
    }
}
