//! The task store (C3): state machine, dependency evaluation, atomic claim,
//! retry bookkeeping, log append, heartbeat, staleness reaper. Grounded on
//! the *pattern* of `orchd/src/state_machine.rs` (validated transitions) and
//! `orchd/src/scheduler.rs` (candidate iteration order), with the decision
//! decision tables are implemented directly since there is no equivalent
//! bounded-retry / dependency-claim workflow to copy verbatim.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use verve_core::{
    log_info, AppError, Epic, EpicId, RepoId, Task, TaskCompletionReport, TaskId, TaskLogRecord,
    TaskStatus,
};
use verve_notify::{Hub, TaskEvent};

use crate::epic_store::{TaskCreator, TaskStatusReader};
use crate::persistence::SqliteStore;
use crate::state_machine::is_task_transition_allowed;

const LOG_TAG: &str = "task-store";

/// Sanity check before committing a status change: the trigger-specific
/// methods below have already decided *which* transition to take, this just
/// confirms it is one the table allows.
fn check_transition(from: TaskStatus, to: TaskStatus) -> Result<(), AppError> {
    if from == to || is_task_transition_allowed(from, to) {
        Ok(())
    } else {
        Err(AppError::internal(format!(
            "illegal task transition {from:?} -> {to:?}"
        )))
    }
}

/// Standard reason recorded when a worker reports success with no branch
/// and no PR: this is success, not failure.
pub const NO_CHANGES_REASON: &str = "no_changes: worker reported no changes to make";

pub struct TaskStore {
    store: Arc<Mutex<SqliteStore>>,
    hub: Hub,
}

impl TaskStore {
    pub fn new(store: Arc<Mutex<SqliteStore>>, hub: Hub) -> Self {
        Self { store, hub }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SqliteStore> {
        self.store.lock().unwrap_or_else(|poison| poison.into_inner())
    }

    pub fn get(&self, id: &TaskId) -> Result<Task, AppError> {
        self.lock().get_task(id)
    }

    pub fn list_by_repo(&self, repo_id: &RepoId) -> Result<Vec<Task>, AppError> {
        self.lock().list_tasks_by_repo(repo_id)
    }

    pub fn get_repo(&self, repo_id: &RepoId) -> Result<verve_core::Repo, AppError> {
        self.lock().get_repo(repo_id)
    }

    pub fn list_repos(&self) -> Result<Vec<verve_core::Repo>, AppError> {
        self.lock().list_repos()
    }

    pub fn create_repo(&self, repo: &verve_core::Repo) -> Result<(), AppError> {
        self.lock().create_repo(repo)
    }

    pub fn list_logs(&self, task_id: &TaskId) -> Result<Vec<TaskLogRecord>, AppError> {
        self.lock().list_task_logs(task_id)
    }

    /// Reconciler candidates: every `review` task with a PR
    /// number, across all repos.
    pub fn list_review_with_pr(&self) -> Result<Vec<Task>, AppError> {
        self.lock().list_review_tasks_with_pr()
    }

    #[allow(clippy::too_many_arguments)]
    pub fn create(
        &self,
        repo_id: RepoId,
        title: String,
        description: String,
        acceptance_criteria: Vec<String>,
        depends_on: std::collections::BTreeSet<TaskId>,
        ready: bool,
        max_attempts: u32,
        max_cost_usd: f64,
        model: String,
        skip_pr: bool,
        epic_id: Option<verve_core::EpicId>,
    ) -> Result<Task, AppError> {
        if title.trim().is_empty() {
            return Err(AppError::invalid("task title must not be empty"));
        }
        if title.len() > 150 {
            return Err(AppError::invalid("task title must be at most 150 characters"));
        }
        if max_attempts == 0 {
            return Err(AppError::invalid("max_attempts must be at least 1"));
        }

        let store = self.lock();
        // T4: every dependency must exist and belong to the same repo.
        for dep_id in &depends_on {
            let dep = store.get_task(dep_id).map_err(|_| {
                AppError::invalid(format!("depends_on references unknown task {dep_id}"))
            })?;
            if dep.repo_id != repo_id {
                return Err(AppError::invalid(format!(
                    "depends_on task {dep_id} belongs to a different repo"
                )));
            }
        }

        let now = Utc::now();
        let task = Task {
            id: TaskId::new(new_suffix()),
            repo_id,
            title,
            description,
            acceptance_criteria,
            status: TaskStatus::Pending,
            depends_on,
            ready,
            attempt: 1,
            max_attempts,
            consecutive_failures: 0,
            branch_name: None,
            pr_url: None,
            pr_number: None,
            retry_reason: None,
            retry_context: None,
            close_reason: None,
            agent_status: None,
            started_at: None,
            last_heartbeat_at: None,
            cost_usd: 0.0,
            max_cost_usd,
            model,
            skip_pr,
            epic_id,
            created_at: now,
            updated_at: now,
        };
        store.create_task(&task)?;
        drop(store);
        if task.ready {
            self.hub.notify_task_pending();
        }
        Ok(task)
    }

    /// The atomic claim loop: iterate pending-ready candidates
    /// in FIFO `created_at, id` order, skip ineligible ones (unsatisfied
    /// dependency), attempt the conditional claim on the first eligible
    /// one, and keep going on conflict.
    pub async fn claim_pending(
        &self,
        repo_filter: Option<&[RepoId]>,
    ) -> Result<Option<Task>, AppError> {
        let claimed = {
            let store = self.lock();
            let candidates = store.list_pending_ready_tasks(repo_filter)?;
            let mut claimed = None;
            for candidate in candidates {
                if !self.dependencies_satisfied(&store, &candidate)? {
                    continue;
                }
                let now = Utc::now();
                if store.try_claim_task(&candidate.id, now)? {
                    claimed = Some(store.get_task(&candidate.id)?);
                    break;
                }
                // lost the race; another poller claimed it first, try the next candidate.
            }
            claimed
        };
        if let Some(claimed) = &claimed {
            self.hub
                .publish_task_event(
                    &claimed.id,
                    TaskEvent::StatusChanged {
                        task_id: claimed.id.clone(),
                        status: claimed.status,
                        at: claimed.updated_at,
                    },
                )
                .await;
        }
        Ok(claimed)
    }

    fn dependencies_satisfied(
        &self,
        store: &SqliteStore,
        task: &Task,
    ) -> Result<bool, AppError> {
        for dep_id in &task.depends_on {
            let status = store.get_task_status(dep_id)?;
            if !status.satisfies_dependency() {
                return Ok(false);
            }
        }
        Ok(true)
    }

    pub async fn append_logs(
        &self,
        task_id: &TaskId,
        attempt: u32,
        lines: Vec<String>,
    ) -> Result<(), AppError> {
        let now = Utc::now();
        {
            let store = self.lock();
            store.get_task(task_id)?; // NotFound if unknown
            store.append_task_log(task_id, attempt, &lines, now)?;
        }
        self.hub
            .publish_task_event(
                task_id,
                TaskEvent::Logs {
                    task_id: task_id.clone(),
                    attempt,
                    lines,
                    at: now,
                },
            )
            .await;
        Ok(())
    }

    /// No-op if the task is not currently running.
    pub fn heartbeat(&self, task_id: &TaskId) -> Result<(), AppError> {
        let store = self.lock();
        let mut task = store.get_task(task_id)?;
        if task.status != TaskStatus::Running {
            return Ok(());
        }
        task.last_heartbeat_at = Some(Utc::now());
        task.updated_at = Utc::now();
        store.update_task(&task)
    }

    /// `CompleteTask`: records cost/status before transitioning.
    pub async fn complete(
        &self,
        task_id: &TaskId,
        report: TaskCompletionReport,
    ) -> Result<Task, AppError> {
        let store = self.lock();
        let mut task = store.get_task(task_id)?;
        if task.status != TaskStatus::Running {
            return Err(AppError::precondition(format!(
                "task {task_id} is not running (status={:?})",
                task.status
            )));
        }

        // Record cost, record agent_status, set close_reason if
        // prereq_failed, then transition.
        if let Some(cost) = report.cost_usd {
            task.cost_usd += cost;
        }
        if report.agent_status.is_some() {
            task.agent_status = report.agent_status.clone();
        }
        if let Some(reason) = &report.prereq_failed {
            task.close_reason = Some(reason.clone());
        }

        if let Some(branch) = &report.branch {
            task.branch_name = Some(branch.clone());
        }
        if let Some(pr_url) = &report.pr_url {
            task.pr_url = Some(pr_url.clone());
        }
        if let Some(pr_number) = report.pr_number {
            task.pr_number = Some(pr_number);
        }

        let had_artifact_before = task.has_artifact() || report.branch.is_some() || report.pr_url.is_some();

        if report.prereq_failed.is_some() {
            // Precondition failures are never retried, terminal regardless
            // of `retryable`.
            task.status = TaskStatus::Failed;
            task.consecutive_failures += 1;
        } else if report.success {
            if report.no_changes && !had_artifact_before {
                task.status = TaskStatus::Closed;
                task.close_reason = Some(NO_CHANGES_REASON.to_string());
                task.consecutive_failures = 0;
            } else if had_artifact_before {
                task.status = TaskStatus::Review;
                task.consecutive_failures = 0;
            } else {
                task.status = TaskStatus::Closed;
                task.close_reason = Some(NO_CHANGES_REASON.to_string());
                task.consecutive_failures = 0;
            }
        } else if had_artifact_before {
            // failed-with-artifact is treated as reviewable.
            task.status = TaskStatus::Review;
            task.consecutive_failures += 1;
        } else if report.retryable && task.attempt < task.max_attempts {
            task.status = TaskStatus::Pending;
            task.attempt += 1;
            task.started_at = None;
            task.agent_status = None;
            task.retry_reason = report.error.clone().or_else(|| Some("retryable failure".to_string()));
            task.consecutive_failures += 1;
        } else {
            task.status = TaskStatus::Failed;
            if task.close_reason.is_none() {
                task.close_reason = report.error.clone();
            }
            task.consecutive_failures += 1;
        }

        check_transition(TaskStatus::Running, task.status)?;
        task.updated_at = Utc::now();
        store.update_task(&task)?;
        log_info!(
            LOG_TAG,
            "task {} completed attempt -> {:?}",
            task.id,
            task.status
        );
        drop(store);
        if task.status == TaskStatus::Pending && task.ready {
            self.hub.notify_task_pending();
        }
        self.hub
            .publish_task_event(
                &task.id,
                TaskEvent::StatusChanged {
                    task_id: task.id.clone(),
                    status: task.status,
                    at: task.updated_at,
                },
            )
            .await;
        Ok(task)
    }

    /// Manual retry from `failed`: increment attempt, clear retry/close context, drop
    /// `pr_*`/`branch_name`.
    pub fn manual_retry(&self, task_id: &TaskId) -> Result<Task, AppError> {
        let store = self.lock();
        let mut task = store.get_task(task_id)?;
        if task.status != TaskStatus::Failed {
            return Err(AppError::precondition(format!(
                "task {task_id} is not failed (status={:?})",
                task.status
            )));
        }
        if task.attempt >= task.max_attempts {
            return Err(AppError::precondition(format!(
                "task {task_id} has exhausted its retry budget"
            )));
        }
        task.status = TaskStatus::Pending;
        task.attempt += 1;
        task.retry_reason = None;
        task.retry_context = None;
        task.close_reason = None;
        task.pr_url = None;
        task.pr_number = None;
        task.branch_name = None;
        task.consecutive_failures = 0;
        check_transition(TaskStatus::Failed, task.status)?;
        task.updated_at = Utc::now();
        store.update_task(&task)?;
        drop(store);
        if task.ready {
            self.hub.notify_task_pending();
        }
        Ok(task)
    }

    /// User feedback retry from `review`: increments both
    /// `attempt` and `max_attempts` — user-initiated retries never count
    /// against the cap.
    pub fn feedback_retry(&self, task_id: &TaskId) -> Result<Task, AppError> {
        let store = self.lock();
        let mut task = store.get_task(task_id)?;
        if task.status != TaskStatus::Review {
            return Err(AppError::precondition(format!(
                "task {task_id} is not in review (status={:?})",
                task.status
            )));
        }
        task.status = TaskStatus::Pending;
        task.attempt += 1;
        task.max_attempts += 1;
        task.consecutive_failures = 0;
        check_transition(TaskStatus::Review, task.status)?;
        task.updated_at = Utc::now();
        store.update_task(&task)?;
        drop(store);
        if task.ready {
            self.hub.notify_task_pending();
        }
        Ok(task)
    }

    /// "Start over": reset attempt=1, max_attempts=5, drop all
    /// artifacts and logs. Allowed from `review` or `failed`.
    pub fn start_over(&self, task_id: &TaskId) -> Result<Task, AppError> {
        let store = self.lock();
        let mut task = store.get_task(task_id)?;
        if !matches!(task.status, TaskStatus::Review | TaskStatus::Failed) {
            return Err(AppError::precondition(format!(
                "task {task_id} cannot start over from status={:?}",
                task.status
            )));
        }
        let previous_status = task.status;
        task.status = TaskStatus::Pending;
        task.attempt = 1;
        task.max_attempts = verve_core::task::DEFAULT_MAX_ATTEMPTS;
        task.consecutive_failures = 0;
        task.branch_name = None;
        task.pr_url = None;
        task.pr_number = None;
        task.retry_reason = None;
        task.retry_context = None;
        task.close_reason = None;
        task.agent_status = None;
        task.started_at = None;
        task.last_heartbeat_at = None;
        check_transition(previous_status, task.status)?;
        task.updated_at = Utc::now();
        store.update_task(&task)?;
        store.delete_task_logs(&task.id)?;
        drop(store);
        if task.ready {
            self.hub.notify_task_pending();
        }
        Ok(task)
    }

    /// Explicit close from `review`.
    pub fn close(&self, task_id: &TaskId, reason: String) -> Result<Task, AppError> {
        let store = self.lock();
        let mut task = store.get_task(task_id)?;
        if task.status != TaskStatus::Review {
            return Err(AppError::precondition(format!(
                "task {task_id} is not in review (status={:?})",
                task.status
            )));
        }
        task.status = TaskStatus::Closed;
        task.close_reason = Some(reason);
        check_transition(TaskStatus::Review, task.status)?;
        task.updated_at = Utc::now();
        store.update_task(&task)?;
        Ok(task)
    }

    /// Explicit delete; allowed from `pending`, `review`, or `failed`
    /// (`closed`/`merged` are preserved for history).
    pub async fn delete(&self, task_id: &TaskId) -> Result<(), AppError> {
        {
            let store = self.lock();
            let task = store.get_task(task_id)?;
            if !matches!(
                task.status,
                TaskStatus::Pending | TaskStatus::Review | TaskStatus::Failed
            ) {
                return Err(AppError::precondition(format!(
                    "task {task_id} cannot be deleted from status={:?}",
                    task.status
                )));
            }
            store.delete_task(task_id)?;
        }
        self.hub.remove_task_events(task_id).await;
        Ok(())
    }

    /// Reconciler hook: `review -> merged`.
    pub fn mark_merged(&self, task_id: &TaskId) -> Result<Task, AppError> {
        let store = self.lock();
        let mut task = store.get_task(task_id)?;
        if task.status != TaskStatus::Review {
            return Err(AppError::precondition(format!(
                "task {task_id} is not in review (status={:?})",
                task.status
            )));
        }
        task.status = TaskStatus::Merged;
        check_transition(TaskStatus::Review, task.status)?;
        task.updated_at = Utc::now();
        store.update_task(&task)?;
        Ok(task)
    }

    /// Reconciler hook: `review -> pending` (retry) or `review -> failed`
    /// (exhausted). The reconciler never advances `review -> failed` except
    /// via this exhaustion path, which belongs to the task store's own
    /// retry policy.
    pub fn schedule_review_retry(
        &self,
        task_id: &TaskId,
        reason: String,
        context: Option<String>,
    ) -> Result<Task, AppError> {
        let store = self.lock();
        let mut task = store.get_task(task_id)?;
        if task.status != TaskStatus::Review {
            return Err(AppError::precondition(format!(
                "task {task_id} is not in review (status={:?})",
                task.status
            )));
        }
        let context = context.map(|c| verve_core::Task::clamp_retry_context(&c));
        if task.attempt < task.max_attempts {
            task.status = TaskStatus::Pending;
            task.attempt += 1;
            task.retry_reason = Some(reason);
            task.retry_context = context;
            task.consecutive_failures += 1;
        } else {
            task.status = TaskStatus::Failed;
            task.retry_reason = Some(reason);
            task.retry_context = context;
            task.consecutive_failures += 1;
        }
        check_transition(TaskStatus::Review, task.status)?;
        task.updated_at = Utc::now();
        store.update_task(&task)?;
        drop(store);
        if task.status == TaskStatus::Pending && task.ready {
            self.hub.notify_task_pending();
        }
        Ok(task)
    }

    /// Staleness reaper: any `running`
    /// task whose `last_heartbeat_at` is older than `stale_after` is
    /// returned to `pending` (attempt incremented), or to `failed` if that
    /// would exceed `max_attempts`. Runs over every repo; returns the
    /// number of tasks reaped.
    pub fn reap_stale(&self, stale_after: Duration, repo_ids: &[RepoId]) -> Result<usize, AppError> {
        let mut reaped = 0usize;
        let store = self.lock();
        let now = Utc::now();
        for repo_id in repo_ids {
            for task in store.list_tasks_by_repo(repo_id)? {
                if task.status != TaskStatus::Running {
                    continue;
                }
                let reference = task.last_heartbeat_at.or(task.started_at);
                let Some(reference) = reference else {
                    continue;
                };
                let age = now.signed_duration_since(reference);
                if age.num_seconds() < stale_after.as_secs() as i64 {
                    continue;
                }
                let mut task = task;
                if task.attempt < task.max_attempts {
                    task.status = TaskStatus::Pending;
                    task.attempt += 1;
                    task.retry_reason = Some("stale".to_string());
                    task.started_at = None;
                } else {
                    task.status = TaskStatus::Failed;
                    task.retry_reason = Some("stale".to_string());
                }
                task.consecutive_failures += 1;
                check_transition(TaskStatus::Running, task.status)?;
                task.updated_at = now;
                store.update_task(&task)?;
                log_info!(LOG_TAG, "reaped stale task {} -> {:?}", task.id, task.status);
                reaped += 1;
                if task.status == TaskStatus::Pending && task.ready {
                    self.hub.notify_task_pending();
                }
            }
        }
        Ok(reaped)
    }
}

/// Materializes a confirmed epic's tasks atomically with the epic's own
/// transition, using the same
/// `Arc<Mutex<SqliteStore>>` this store already shares with `EpicStore`.
impl TaskCreator for TaskStore {
    fn materialize(&self, epic: &Epic, tasks: &[Task]) -> Result<(), AppError> {
        let mut store = self.lock();
        store.with_transaction(|conn| {
            for task in tasks {
                SqliteStore::create_task_in_transaction(conn, task)?;
            }
            SqliteStore::update_epic_in_transaction(conn, epic)
        })
    }
}

impl TaskStatusReader for TaskStore {
    fn task_statuses_for_epic(&self, epic_id: &EpicId) -> Result<Vec<TaskStatus>, AppError> {
        let store = self.lock();
        Ok(store
            .list_tasks_by_epic(epic_id)?
            .into_iter()
            .map(|t| t.status)
            .collect())
    }
}

fn new_suffix() -> String {
    use std::sync::atomic::{AtomicU64, Ordering};
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    let now = Utc::now().timestamp_nanos_opt().unwrap_or(0);
    format!("{now:x}{n:x}")
}
