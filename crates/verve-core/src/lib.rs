pub mod config;
pub mod epic;
pub mod error;
pub mod ids;
pub mod log;
pub mod task;

pub use config::{Config, ConfigError};
pub use epic::{Epic, EpicStatus, FeedbackType, ProposedTask};
pub use error::AppError;
pub use ids::{EpicId, RepoId, TaskId};
pub use task::{Task, TaskCompletionReport, TaskLogRecord, TaskStatus};

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Repo {
    pub id: RepoId,
    pub owner: String,
    pub name: String,
    pub full_name: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
}
