use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use verve_core::TaskId;

/// One broadcast unit on a task's event stream — a log append or a status
/// change, mirroring the two channels logs are emitted on (persisted and
/// broadcast).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskEvent {
    Logs {
        task_id: TaskId,
        attempt: u32,
        lines: Vec<String>,
        at: DateTime<Utc>,
    },
    StatusChanged {
        task_id: TaskId,
        status: verve_core::TaskStatus,
        at: DateTime<Utc>,
    },
}

/// The payload a planning worker's `poll-feedback` call receives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum FeedbackPollResult {
    Feedback {
        message: Option<String>,
        feedback_type: verve_core::FeedbackType,
    },
    Timeout,
}
