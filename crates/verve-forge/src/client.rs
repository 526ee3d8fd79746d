use serde::Deserialize;

use crate::command::ForgeCli;
use crate::error::ForgeError;

/// `retry_context` is capped at this size by the reconciler: at most 4
/// KiB total, at most 50 lines per job, newest jobs first.
pub const FAILED_LOG_MAX_BYTES: usize = 4 * 1024;
pub const FAILED_LOG_MAX_LINES_PER_JOB: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckStatus {
    Pending,
    Success,
    Failure,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mergeability {
    pub has_conflicts: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrCheckStatus {
    pub status: CheckStatus,
    pub failed_names: Vec<String>,
    pub failed_run_ids: Vec<String>,
}

/// The five predicates the reconciler consumes. Deliberately narrow — the
/// core depends only on this trait, never on a concrete forge
/// implementation.
pub trait ForgeClient: Send + Sync {
    fn is_pr_merged(&self, owner: &str, repo: &str, number: u64) -> Result<bool, ForgeError>;

    fn pr_mergeability(
        &self,
        owner: &str,
        repo: &str,
        number: u64,
    ) -> Result<Mergeability, ForgeError>;

    fn pr_check_status(
        &self,
        owner: &str,
        repo: &str,
        number: u64,
    ) -> Result<PrCheckStatus, ForgeError>;

    /// Returns at most `FAILED_LOG_MAX_BYTES` bytes, newest failed job first.
    fn failed_check_logs(&self, owner: &str, repo: &str, number: u64) -> Result<String, ForgeError>;
}

#[derive(Deserialize)]
struct PrViewJson {
    state: String,
    mergeable: String,
    #[serde(rename = "statusCheckRollup", default)]
    status_check_rollup: Vec<CheckRollupEntry>,
}

#[derive(Deserialize)]
struct CheckRollupEntry {
    #[serde(default)]
    conclusion: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(rename = "databaseId", default)]
    database_id: Option<u64>,
}

/// Shells out to the `gh` CLI. Grounded on `GitCli`'s command-wrapping
/// shape; not exercised by the reconciler's own tests (those inject a fake
/// `ForgeClient`), only by its own unit tests of response parsing.
pub struct GhCliForgeClient {
    cli: ForgeCli,
}

impl Default for GhCliForgeClient {
    fn default() -> Self {
        Self {
            cli: ForgeCli::default(),
        }
    }
}

impl GhCliForgeClient {
    pub fn new(binary: impl Into<std::path::PathBuf>) -> Self {
        Self {
            cli: ForgeCli::new(binary),
        }
    }

    fn pr_view(&self, owner: &str, repo: &str, number: u64) -> Result<PrViewJson, ForgeError> {
        let repo_arg = format!("{owner}/{repo}");
        let number_arg = number.to_string();
        let output = self.cli.run([
            "pr",
            "view",
            &number_arg,
            "--repo",
            &repo_arg,
            "--json",
            "state,mergeable,statusCheckRollup",
        ])?;
        serde_json::from_str(&output.stdout).map_err(|source| ForgeError::Parse {
            command: format!("gh pr view {number_arg} --repo {repo_arg}"),
            context: source.to_string(),
        })
    }
}

impl ForgeClient for GhCliForgeClient {
    fn is_pr_merged(&self, owner: &str, repo: &str, number: u64) -> Result<bool, ForgeError> {
        let view = self.pr_view(owner, repo, number)?;
        Ok(view.state.eq_ignore_ascii_case("merged"))
    }

    fn pr_mergeability(
        &self,
        owner: &str,
        repo: &str,
        number: u64,
    ) -> Result<Mergeability, ForgeError> {
        let view = self.pr_view(owner, repo, number)?;
        Ok(Mergeability {
            has_conflicts: view.mergeable.eq_ignore_ascii_case("conflicting"),
        })
    }

    fn pr_check_status(
        &self,
        owner: &str,
        repo: &str,
        number: u64,
    ) -> Result<PrCheckStatus, ForgeError> {
        let view = self.pr_view(owner, repo, number)?;
        let mut failed_names = Vec::new();
        let mut failed_run_ids = Vec::new();
        let mut any_pending = false;
        let mut any_failure = false;
        for entry in &view.status_check_rollup {
            match entry.conclusion.as_deref() {
                Some("success") | Some("neutral") | Some("skipped") => {}
                Some("failure") | Some("cancelled") | Some("timed_out") => {
                    any_failure = true;
                    if let Some(name) = &entry.name {
                        failed_names.push(name.clone());
                    }
                    if let Some(id) = entry.database_id {
                        failed_run_ids.push(id.to_string());
                    }
                }
                _ => any_pending = true,
            }
        }
        let status = if any_failure {
            CheckStatus::Failure
        } else if any_pending {
            CheckStatus::Pending
        } else {
            CheckStatus::Success
        };
        Ok(PrCheckStatus {
            status,
            failed_names,
            failed_run_ids,
        })
    }

    fn failed_check_logs(&self, owner: &str, repo: &str, number: u64) -> Result<String, ForgeError> {
        let status = self.pr_check_status(owner, repo, number)?;
        let mut combined = String::new();
        for run_id in status.failed_run_ids.iter().rev() {
            let output = self.cli.run([
                "run",
                "view",
                run_id,
                "--repo",
                &format!("{owner}/{repo}"),
                "--log-failed",
            ])?;
            let tail: Vec<&str> = output
                .stdout
                .lines()
                .rev()
                .take(FAILED_LOG_MAX_LINES_PER_JOB)
                .collect();
            for line in tail.into_iter().rev() {
                combined.push_str(line);
                combined.push('\n');
            }
        }
        if combined.len() > FAILED_LOG_MAX_BYTES {
            let start = combined.len() - FAILED_LOG_MAX_BYTES;
            let mut boundary = start;
            while boundary < combined.len() && !combined.is_char_boundary(boundary) {
                boundary += 1;
            }
            combined = combined[boundary..].to_string();
        }
        Ok(combined)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pr_view_json_parses_minimal_shape() {
        let raw = r#"{"state":"MERGED","mergeable":"MERGEABLE","statusCheckRollup":[]}"#;
        let view: PrViewJson = serde_json::from_str(raw).expect("parses");
        assert_eq!(view.state, "MERGED");
        assert!(view.status_check_rollup.is_empty());
    }

    #[test]
    fn check_rollup_classifies_failure_over_pending() {
        let raw = r#"{
            "state":"OPEN",
            "mergeable":"MERGEABLE",
            "statusCheckRollup":[
                {"conclusion":"success","name":"build","databaseId":1},
                {"conclusion":"failure","name":"test","databaseId":2},
                {"conclusion":null,"name":"lint","databaseId":3}
            ]
        }"#;
        let view: PrViewJson = serde_json::from_str(raw).expect("parses");
        assert_eq!(view.status_check_rollup.len(), 3);
    }
}
