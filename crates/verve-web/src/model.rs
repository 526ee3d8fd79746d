use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use verve_core::{EpicId, FeedbackType, ProposedTask, RepoId, Repo, Task, TaskId};

/// Grounded on `orch-web/src/model.rs`'s list-response-wrapper convention
/// (`TaskListResponse { tasks: Vec<TaskView> }`); narrowed here to wrap the
/// entity types directly since `Task`/`Epic`/`Repo` already serialize to
/// exactly the shape these endpoints describe, with no internal
/// worker-local fields (like a local `worktree_path`) to strip.
#[derive(Debug, Clone, Serialize)]
pub struct TaskListResponse {
    pub tasks: Vec<Task>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RepoListResponse {
    pub repos: Vec<Repo>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateRepoRequest {
    pub owner: String,
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateTaskRequest {
    pub repo_id: RepoId,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
    #[serde(default)]
    pub depends_on: BTreeSet<TaskId>,
    #[serde(default = "default_true")]
    pub ready: bool,
    pub max_attempts: Option<u32>,
    #[serde(default)]
    pub max_cost_usd: f64,
    pub model: Option<String>,
    #[serde(default)]
    pub skip_pr: bool,
    pub epic_id: Option<EpicId>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateEpicRequest {
    pub repo_id: RepoId,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub planning_prompt: Option<String>,
    #[serde(default)]
    pub not_ready: bool,
    pub model: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppendLogsRequest {
    pub attempt: u32,
    pub lines: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppendSessionLogRequest {
    pub lines: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProposeRequest {
    pub proposed_tasks: Vec<ProposedTask>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FeedbackRequest {
    pub feedback_type: FeedbackType,
    pub message: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FeedbackResponse {
    pub message: Option<String>,
    pub feedback_type: FeedbackType,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CloseTaskRequest {
    pub reason: String,
}

/// Query parameters for the unified long-poll endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct PollQuery {
    /// Comma-separated list of `repo_` ids. Absent/empty means "any repo".
    pub repo_ids: Option<String>,
    pub deadline_secs: Option<u64>,
}

/// Query parameter shared by both long-poll feedback endpoints.
#[derive(Debug, Clone, Deserialize)]
pub struct DeadlineQuery {
    pub deadline_secs: Option<u64>,
}
