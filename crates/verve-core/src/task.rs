use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{EpicId, RepoId, TaskId};

/// Bound on `retry_context`, enforced on every write (not only on the
/// reconciler's read path).
pub const RETRY_CONTEXT_MAX_BYTES: usize = 4 * 1024;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pending,
    Running,
    Review,
    Merged,
    Closed,
    Failed,
}

impl TaskStatus {
    pub fn as_db_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Review => "review",
            TaskStatus::Merged => "merged",
            TaskStatus::Closed => "closed",
            TaskStatus::Failed => "failed",
        }
    }

    pub fn from_db_str(raw: &str) -> Option<Self> {
        Some(match raw {
            "pending" => TaskStatus::Pending,
            "running" => TaskStatus::Running,
            "review" => TaskStatus::Review,
            "merged" => TaskStatus::Merged,
            "closed" => TaskStatus::Closed,
            "failed" => TaskStatus::Failed,
            _ => return None,
        })
    }

    /// `{merged, closed, review}` — satisfies a dependency under the
    /// permissive reading: review counts even though the PR is unmerged.
    pub fn satisfies_dependency(self) -> bool {
        matches!(
            self,
            TaskStatus::Merged | TaskStatus::Closed | TaskStatus::Review
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Merged | TaskStatus::Closed)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub repo_id: RepoId,

    pub title: String,
    pub description: String,
    pub acceptance_criteria: Vec<String>,

    pub status: TaskStatus,

    pub depends_on: BTreeSet<TaskId>,
    pub ready: bool,
    pub attempt: u32,
    pub max_attempts: u32,
    pub consecutive_failures: u32,

    pub branch_name: Option<String>,
    pub pr_url: Option<String>,
    pub pr_number: Option<u64>,

    pub retry_reason: Option<String>,
    pub retry_context: Option<String>,
    pub close_reason: Option<String>,
    pub agent_status: Option<serde_json::Value>,

    pub started_at: Option<DateTime<Utc>>,
    pub last_heartbeat_at: Option<DateTime<Utc>>,

    pub cost_usd: f64,
    pub max_cost_usd: f64,

    pub model: String,
    pub skip_pr: bool,
    pub epic_id: Option<EpicId>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// Truncates to the last `RETRY_CONTEXT_MAX_BYTES` bytes on a UTF-8
    /// boundary, newest content first per the reconciler's "newest jobs
    /// first" convention (callers pass already-ordered text).
    pub fn clamp_retry_context(text: &str) -> String {
        if text.len() <= RETRY_CONTEXT_MAX_BYTES {
            return text.to_string();
        }
        let start = text.len() - RETRY_CONTEXT_MAX_BYTES;
        let mut boundary = start;
        while boundary < text.len() && !text.is_char_boundary(boundary) {
            boundary += 1;
        }
        text[boundary..].to_string()
    }

    pub fn has_artifact(&self) -> bool {
        self.branch_name.is_some() || self.pr_number.is_some()
    }
}

/// A single batch of worker-emitted log lines for one attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskLogRecord {
    pub id: i64,
    pub task_id: TaskId,
    pub attempt: u32,
    pub lines: Vec<String>,
    pub created_at: DateTime<Utc>,
}

/// Everything a worker reports back to `CompleteTask`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskCompletionReport {
    pub success: bool,
    pub pr_url: Option<String>,
    pub pr_number: Option<u64>,
    pub branch: Option<String>,
    pub error: Option<String>,
    pub agent_status: Option<serde_json::Value>,
    pub cost_usd: Option<f64>,
    pub prereq_failed: Option<String>,
    pub no_changes: bool,
    pub retryable: bool,
}
