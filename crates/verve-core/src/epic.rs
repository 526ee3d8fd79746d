use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{EpicId, RepoId, TaskId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EpicStatus {
    Planning,
    Draft,
    Ready,
    Active,
    Completed,
    Closed,
}

impl EpicStatus {
    pub fn as_db_str(self) -> &'static str {
        match self {
            EpicStatus::Planning => "planning",
            EpicStatus::Draft => "draft",
            EpicStatus::Ready => "ready",
            EpicStatus::Active => "active",
            EpicStatus::Completed => "completed",
            EpicStatus::Closed => "closed",
        }
    }

    pub fn from_db_str(raw: &str) -> Option<Self> {
        Some(match raw {
            "planning" => EpicStatus::Planning,
            "draft" => EpicStatus::Draft,
            "ready" => EpicStatus::Ready,
            "active" => EpicStatus::Active,
            "completed" => EpicStatus::Completed,
            "closed" => EpicStatus::Closed,
            _ => return None,
        })
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, EpicStatus::Completed | EpicStatus::Closed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedbackType {
    Message,
    Confirmed,
    Closed,
}

impl FeedbackType {
    pub fn as_db_str(self) -> &'static str {
        match self {
            FeedbackType::Message => "message",
            FeedbackType::Confirmed => "confirmed",
            FeedbackType::Closed => "closed",
        }
    }

    pub fn from_db_str(raw: &str) -> Option<Self> {
        Some(match raw {
            "message" => FeedbackType::Message,
            "confirmed" => FeedbackType::Confirmed,
            "closed" => FeedbackType::Closed,
            _ => return None,
        })
    }
}

/// An editable draft task inside an epic; not yet part of the dispatch set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProposedTask {
    pub temp_id: String,
    pub title: String,
    pub description: String,
    pub depends_on_temp_ids: Vec<String>,
    pub acceptance_criteria: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Epic {
    pub id: EpicId,
    pub repo_id: RepoId,
    pub title: String,
    pub description: String,

    pub status: EpicStatus,

    pub proposed_tasks: Vec<ProposedTask>,
    pub planning_prompt: Option<String>,
    pub session_log: Vec<String>,

    pub task_ids: Vec<TaskId>,

    pub claimed_at: Option<DateTime<Utc>>,
    pub last_heartbeat_at: Option<DateTime<Utc>>,

    pub feedback: Option<String>,
    pub feedback_type: Option<FeedbackType>,

    pub not_ready: bool,
    pub model: String,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn epic_status_db_roundtrip() {
        for s in [
            EpicStatus::Planning,
            EpicStatus::Draft,
            EpicStatus::Ready,
            EpicStatus::Active,
            EpicStatus::Completed,
            EpicStatus::Closed,
        ] {
            assert_eq!(EpicStatus::from_db_str(s.as_db_str()), Some(s));
        }
    }

    #[test]
    fn only_completed_and_closed_are_terminal() {
        assert!(EpicStatus::Completed.is_terminal());
        assert!(EpicStatus::Closed.is_terminal());
        assert!(!EpicStatus::Active.is_terminal());
        assert!(!EpicStatus::Draft.is_terminal());
    }

    #[test]
    fn feedback_type_db_roundtrip() {
        for t in [
            FeedbackType::Message,
            FeedbackType::Confirmed,
            FeedbackType::Closed,
        ] {
            assert_eq!(FeedbackType::from_db_str(t.as_db_str()), Some(t));
        }
    }

    #[test]
    fn feedback_type_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&FeedbackType::Confirmed).unwrap(),
            "\"confirmed\""
        );
    }
}
