//! The unified long-poll dispatch endpoint (C5). One request
//! considers both the epic-claim pool and the task-claim pool so a worker
//! never needs a second round-trip to learn there was nothing to do.
//! Grounded on `orchd/src/scheduler.rs`'s candidate-iteration shape and on
//! `Hub::wait_dispatch`'s `tokio::select!` wait, reused as-is.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use verve_core::{AppError, Epic, RepoId, Task};
use verve_notify::Hub;

use crate::epic_store::EpicStore;
use crate::task_store::TaskStore;

/// Re-fetched on every poll so a rotated credential takes effect
/// immediately, rather than being cached on the envelope.
pub trait ForgeTokenProvider: Send + Sync {
    fn current_token(&self) -> Option<String>;
}

/// Reads `GITHUB_TOKEN` fresh on every call, matching the `gh` CLI's own
/// convention (`verve-forge`'s `ForgeCli` shells out to `gh` directly and
/// lets it resolve credentials the same way).
pub struct EnvForgeTokenProvider;

impl ForgeTokenProvider for EnvForgeTokenProvider {
    fn current_token(&self) -> Option<String> {
        std::env::var("GITHUB_TOKEN").ok()
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkEnvelope {
    Epic {
        epic: Epic,
        repo_full_name: String,
        forge_token: Option<String>,
    },
    Task {
        task: Task,
        repo_full_name: String,
        forge_token: Option<String>,
    },
}

pub struct Dispatch {
    epics: Arc<EpicStore>,
    tasks: Arc<TaskStore>,
    hub: Hub,
    tokens: Arc<dyn ForgeTokenProvider>,
}

impl Dispatch {
    pub fn new(epics: Arc<EpicStore>, tasks: Arc<TaskStore>, hub: Hub) -> Self {
        Self::with_token_provider(epics, tasks, hub, Arc::new(EnvForgeTokenProvider))
    }

    pub fn with_token_provider(
        epics: Arc<EpicStore>,
        tasks: Arc<TaskStore>,
        hub: Hub,
        tokens: Arc<dyn ForgeTokenProvider>,
    ) -> Self {
        Self {
            epics,
            tasks,
            hub,
            tokens,
        }
    }

    /// Blocks up to `deadline`, returning `Ok(None)` on timeout rather than
    /// an error — an empty poll is the expected common case, not a failure.
    pub async fn poll(
        &self,
        repo_filter: Option<&[RepoId]>,
        deadline: Duration,
    ) -> Result<Option<WorkEnvelope>, AppError> {
        let deadline_at = tokio::time::Instant::now() + deadline;
        loop {
            if let Some(epic) = self.epics.claim_pending()? {
                let repo_full_name = self.tasks.get_repo(&epic.repo_id)?.full_name;
                return Ok(Some(WorkEnvelope::Epic {
                    epic,
                    repo_full_name,
                    forge_token: self.tokens.current_token(),
                }));
            }
            if let Some(task) = self.tasks.claim_pending(repo_filter).await? {
                let repo_full_name = self.tasks.get_repo(&task.repo_id)?.full_name;
                return Ok(Some(WorkEnvelope::Task {
                    task,
                    repo_full_name,
                    forge_token: self.tokens.current_token(),
                }));
            }

            let remaining = deadline_at.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            self.hub.wait_dispatch(remaining).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use std::sync::Mutex;
    use verve_core::{Repo, RepoId};
    use verve_notify::Hub;

    use crate::persistence::SqliteStore;

    struct FixedTokenProvider(Option<String>);

    impl ForgeTokenProvider for FixedTokenProvider {
        fn current_token(&self) -> Option<String> {
            self.0.clone()
        }
    }

    fn fixture() -> (Arc<EpicStore>, Arc<TaskStore>, Hub, RepoId) {
        let store = Arc::new(Mutex::new(SqliteStore::open_in_memory().unwrap()));
        let hub = Hub::new();
        let repo_id = RepoId::new("acme-api");
        store
            .lock()
            .unwrap()
            .create_repo(&Repo {
                id: repo_id.clone(),
                owner: "acme".to_string(),
                name: "api".to_string(),
                full_name: "acme/api".to_string(),
                created_at: chrono::Utc::now(),
            })
            .unwrap();
        let epics = Arc::new(EpicStore::new(store.clone(), hub.clone()));
        let tasks = Arc::new(TaskStore::new(store, hub.clone()));
        (epics, tasks, hub, repo_id)
    }

    #[tokio::test]
    async fn poll_returns_no_content_when_nothing_pending() {
        let (epics, tasks, hub, _repo_id) = fixture();
        let dispatch = Dispatch::with_token_provider(
            epics,
            tasks,
            hub,
            Arc::new(FixedTokenProvider(None)),
        );
        let result = dispatch
            .poll(None, Duration::from_millis(20))
            .await
            .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn poll_prefers_epic_over_task_when_both_pending() {
        let (epics, tasks, hub, repo_id) = fixture();
        tasks
            .create(
                repo_id.clone(),
                "t1".to_string(),
                "d".to_string(),
                vec![],
                BTreeSet::new(),
                true,
                3,
                0.0,
                "m".to_string(),
                false,
                None,
            )
            .unwrap();
        epics
            .create(repo_id, "e1".to_string(), "d".to_string(), None, false, "m".to_string())
            .unwrap();

        let dispatch = Dispatch::with_token_provider(
            epics,
            tasks,
            hub,
            Arc::new(FixedTokenProvider(Some("tok".to_string()))),
        );
        let envelope = dispatch
            .poll(None, Duration::from_secs(1))
            .await
            .unwrap()
            .expect("work available");
        match envelope {
            WorkEnvelope::Epic {
                repo_full_name,
                forge_token,
                ..
            } => {
                assert_eq!(repo_full_name, "acme/api");
                assert_eq!(forge_token.as_deref(), Some("tok"));
            }
            WorkEnvelope::Task { .. } => panic!("expected epic to be claimed first"),
        }
    }

    #[tokio::test]
    async fn poll_returns_task_when_no_epic_pending() {
        let (epics, tasks, hub, repo_id) = fixture();
        tasks
            .create(
                repo_id,
                "t1".to_string(),
                "d".to_string(),
                vec![],
                BTreeSet::new(),
                true,
                3,
                0.0,
                "m".to_string(),
                false,
                None,
            )
            .unwrap();

        let dispatch = Dispatch::with_token_provider(
            epics,
            tasks,
            hub,
            Arc::new(FixedTokenProvider(None)),
        );
        let envelope = dispatch
            .poll(None, Duration::from_secs(1))
            .await
            .unwrap()
            .expect("work available");
        assert!(matches!(envelope, WorkEnvelope::Task { .. }));
    }

    #[tokio::test]
    async fn poll_wakes_on_task_pending_signal_instead_of_waiting_full_deadline() {
        let (epics, tasks, hub, repo_id) = fixture();
        let dispatch = Dispatch::with_token_provider(
            epics.clone(),
            tasks.clone(),
            hub,
            Arc::new(FixedTokenProvider(None)),
        );

        let poll = tokio::spawn(async move { dispatch.poll(None, Duration::from_secs(5)).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        tasks
            .create(
                repo_id,
                "t1".to_string(),
                "d".to_string(),
                vec![],
                BTreeSet::new(),
                true,
                3,
                0.0,
                "m".to_string(),
                false,
                None,
            )
            .unwrap();

        let result = tokio::time::timeout(Duration::from_secs(2), poll)
            .await
            .expect("poll returned before the 5s deadline")
            .unwrap()
            .unwrap();
        assert!(result.is_some());
    }
}
