//! The epic store (C4): the interactive planning coordinator. Mirrors
//! `task_store.rs`'s shape (shared `Arc<Mutex<SqliteStore>>` + `Hub`, atomic
//! claim via conditional update, hub signal on anything dispatch-relevant)
//! and adds the parts the task store has no analogue for: a single-slot
//! feedback mailbox and topological materialization of proposed tasks into
//! real ones.
//!
//! Materialization needs to create Tasks and, for epic-completion, read
//! their statuses back — but `EpicStore` must not depend on `TaskStore`
//! directly, or the two modules would need each other at construction time.
//! Two narrow interfaces injected after construction keep that split
//! instead of a shared mutable registry; `TaskStore` implements both against
//! the same underlying `Arc<Mutex<SqliteStore>>` it already holds.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use chrono::Utc;
use verve_core::{
    log_info, log_warn, AppError, Epic, EpicId, EpicStatus, FeedbackType, ProposedTask, RepoId,
    Task, TaskId, TaskStatus,
};
use verve_notify::Hub;

use crate::persistence::SqliteStore;
use crate::state_machine::is_epic_transition_allowed;

const LOG_TAG: &str = "epic-store";

/// Sanity check before committing a status change, same discipline as
/// `task_store`'s `check_transition`.
fn check_transition(from: EpicStatus, to: EpicStatus) -> Result<(), AppError> {
    if from == to || is_epic_transition_allowed(from, to) {
        Ok(())
    } else {
        Err(AppError::internal(format!(
            "illegal epic transition {from:?} -> {to:?}"
        )))
    }
}

/// Injected into `EpicStore` after construction: materializes a
/// confirmed epic's proposed tasks into real ones, atomically with the
/// epic's own transition.
pub trait TaskCreator: Send + Sync {
    fn materialize(&self, epic: &Epic, tasks: &[Task]) -> Result<(), AppError>;
}

/// Injected into `EpicStore` after construction: lets epic
/// completion watch its children without `EpicStore` knowing about
/// `TaskStore`.
pub trait TaskStatusReader: Send + Sync {
    fn task_statuses_for_epic(&self, epic_id: &EpicId) -> Result<Vec<TaskStatus>, AppError>;
}

pub struct EpicStore {
    store: Arc<Mutex<SqliteStore>>,
    hub: Hub,
    task_creator: OnceLock<Arc<dyn TaskCreator>>,
    task_status_reader: OnceLock<Arc<dyn TaskStatusReader>>,
}

impl EpicStore {
    pub fn new(store: Arc<Mutex<SqliteStore>>, hub: Hub) -> Self {
        Self {
            store,
            hub,
            task_creator: OnceLock::new(),
            task_status_reader: OnceLock::new(),
        }
    }

    /// Called once from `main` after both stores exist. A second call is a
    /// programming error, not a runtime one — `set` failing is ignored
    /// since there is nothing a caller could usefully do differently.
    pub fn set_task_creator(&self, creator: Arc<dyn TaskCreator>) {
        let _ = self.task_creator.set(creator);
    }

    pub fn set_task_status_reader(&self, reader: Arc<dyn TaskStatusReader>) {
        let _ = self.task_status_reader.set(reader);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SqliteStore> {
        self.store.lock().unwrap_or_else(|poison| poison.into_inner())
    }

    pub fn get(&self, id: &EpicId) -> Result<Epic, AppError> {
        self.lock().get_epic(id)
    }

    pub fn create(
        &self,
        repo_id: RepoId,
        title: String,
        description: String,
        planning_prompt: Option<String>,
        not_ready: bool,
        model: String,
    ) -> Result<Epic, AppError> {
        if title.trim().is_empty() {
            return Err(AppError::invalid("epic title must not be empty"));
        }
        let now = Utc::now();
        let epic = Epic {
            id: EpicId::new(new_suffix()),
            repo_id,
            title,
            description,
            status: EpicStatus::Planning,
            proposed_tasks: Vec::new(),
            planning_prompt,
            session_log: Vec::new(),
            task_ids: Vec::new(),
            claimed_at: None,
            last_heartbeat_at: None,
            feedback: None,
            feedback_type: None,
            not_ready,
            model,
            created_at: now,
            updated_at: now,
        };
        self.lock().create_epic(&epic)?;
        self.hub.notify_epic_pending();
        Ok(epic)
    }

    /// The atomic claim loop, same shape as
    /// `TaskStore::claim_pending` but over unclaimed planning epics.
    pub fn claim_pending(&self) -> Result<Option<Epic>, AppError> {
        let store = self.lock();
        let candidates = store.list_unclaimed_planning_epics()?;
        for candidate in candidates {
            let now = Utc::now();
            if store.try_claim_epic(&candidate.id, now)? {
                return Ok(Some(store.get_epic(&candidate.id)?));
            }
            // lost the race; another poller claimed it first.
        }
        Ok(None)
    }

    pub fn append_session_log(&self, epic_id: &EpicId, lines: Vec<String>) -> Result<(), AppError> {
        let store = self.lock();
        let mut epic = store.get_epic(epic_id)?;
        epic.session_log.extend(lines);
        epic.updated_at = Utc::now();
        store.update_epic(&epic)
    }

    /// No-op if the epic is not currently claimed, same
    /// discipline as `TaskStore::heartbeat`.
    pub fn heartbeat(&self, epic_id: &EpicId) -> Result<(), AppError> {
        let store = self.lock();
        let mut epic = store.get_epic(epic_id)?;
        if epic.claimed_at.is_none() {
            return Ok(());
        }
        let now = Utc::now();
        epic.last_heartbeat_at = Some(now);
        epic.updated_at = now;
        store.update_epic(&epic)
    }

    /// `EpicPropose`: validates `temp_id` uniqueness and
    /// that every `depends_on_temp_ids` reference resolves within the same
    /// replacement set, then wholesale-replaces `proposed_tasks` and moves
    /// the epic to `draft`.
    pub fn propose(&self, epic_id: &EpicId, proposed_tasks: Vec<ProposedTask>) -> Result<Epic, AppError> {
        validate_proposed_tasks(&proposed_tasks)?;
        let store = self.lock();
        let mut epic = store.get_epic(epic_id)?;
        if !matches!(epic.status, EpicStatus::Planning | EpicStatus::Draft) {
            return Err(AppError::precondition(format!(
                "epic {epic_id} cannot receive a proposal from status={:?}",
                epic.status
            )));
        }
        let previous_status = epic.status;
        epic.proposed_tasks = proposed_tasks;
        epic.status = EpicStatus::Draft;
        check_transition(previous_status, epic.status)?;
        epic.updated_at = Utc::now();
        store.update_epic(&epic)?;
        Ok(epic)
    }

    /// While `draft` or `ready`, wholesale-replace `proposed_tasks` without
    /// touching status.
    pub fn replace_proposed_tasks(
        &self,
        epic_id: &EpicId,
        proposed_tasks: Vec<ProposedTask>,
    ) -> Result<Epic, AppError> {
        validate_proposed_tasks(&proposed_tasks)?;
        let store = self.lock();
        let mut epic = store.get_epic(epic_id)?;
        if !matches!(epic.status, EpicStatus::Draft | EpicStatus::Ready) {
            return Err(AppError::precondition(format!(
                "epic {epic_id} proposed tasks are not editable from status={:?}",
                epic.status
            )));
        }
        epic.proposed_tasks = proposed_tasks;
        epic.updated_at = Utc::now();
        store.update_epic(&epic)?;
        Ok(epic)
    }

    /// Writes the single-slot feedback mailbox and signals the per-epic
    /// channel. `message` re-plans (back to
    /// `planning`, unclaimed); `confirmed` materializes tasks; `closed`
    /// closes the epic. All three leave the mailbox populated for the
    /// worker's next `poll-feedback` call.
    pub async fn submit_feedback(
        &self,
        epic_id: &EpicId,
        feedback_type: FeedbackType,
        message: Option<String>,
    ) -> Result<Epic, AppError> {
        let epic = match feedback_type {
            FeedbackType::Message => {
                let store = self.lock();
                let mut epic = store.get_epic(epic_id)?;
                if epic.status != EpicStatus::Draft {
                    return Err(AppError::precondition(format!(
                        "epic {epic_id} cannot accept a message from status={:?}",
                        epic.status
                    )));
                }
                epic.status = EpicStatus::Planning;
                epic.claimed_at = None;
                epic.feedback = message;
                epic.feedback_type = Some(FeedbackType::Message);
                check_transition(EpicStatus::Draft, epic.status)?;
                epic.updated_at = Utc::now();
                store.update_epic(&epic)?;
                drop(store);
                self.hub.notify_epic_pending();
                epic
            }
            FeedbackType::Confirmed => self.confirm(epic_id).await?,
            FeedbackType::Closed => {
                let store = self.lock();
                let mut epic = store.get_epic(epic_id)?;
                if !matches!(epic.status, EpicStatus::Draft | EpicStatus::Ready) {
                    return Err(AppError::precondition(format!(
                        "epic {epic_id} cannot be closed from status={:?}",
                        epic.status
                    )));
                }
                let previous_status = epic.status;
                epic.status = EpicStatus::Closed;
                epic.feedback = message;
                epic.feedback_type = Some(FeedbackType::Closed);
                check_transition(previous_status, epic.status)?;
                epic.updated_at = Utc::now();
                store.update_epic(&epic)?;
                epic
            }
        };
        self.hub.notify_epic_feedback(epic_id).await;
        if epic.status.is_terminal() {
            self.hub.remove_epic_feedback(epic_id).await;
        }
        Ok(epic)
    }

    /// `EpicPollFeedback`: reads the
    /// mailbox, clearing it if non-empty; otherwise waits on the per-epic
    /// signal up to `deadline`. A redelivered `confirmed`/`closed` after a
    /// clear is still a correct exit signal for the worker, so clearing the
    /// slot (rather than erroring on an empty re-read) is idempotent by
    /// construction.
    pub async fn poll_feedback(
        &self,
        epic_id: &EpicId,
        deadline: Duration,
    ) -> Result<Option<(Option<String>, FeedbackType)>, AppError> {
        if let Some(payload) = self.take_feedback(epic_id)? {
            return Ok(Some(payload));
        }
        self.hub.wait_epic_feedback(epic_id, deadline).await;
        self.take_feedback(epic_id)
    }

    fn take_feedback(
        &self,
        epic_id: &EpicId,
    ) -> Result<Option<(Option<String>, FeedbackType)>, AppError> {
        let store = self.lock();
        let mut epic = store.get_epic(epic_id)?;
        let Some(feedback_type) = epic.feedback_type else {
            return Ok(None);
        };
        let message = epic.feedback.take();
        epic.feedback_type = None;
        epic.updated_at = Utc::now();
        store.update_epic(&epic)?;
        Ok(Some((message, feedback_type)))
    }

    /// Confirmation materialization. Runs entirely
    /// inside the injected `TaskCreator`'s atomic transaction so the epic's
    /// transition and the task batch-insert commit or roll back together.
    async fn confirm(&self, epic_id: &EpicId) -> Result<Epic, AppError> {
        let Some(creator) = self.task_creator.get() else {
            return Err(AppError::internal("epic store has no task creator wired up"));
        };
        let store = self.lock();
        let mut epic = store.get_epic(epic_id)?;
        // Confirmation materializes proposed_tasks exactly once; `ready` is
        // already the post-materialization state, so only `draft` is a
        // valid source.
        if epic.status != EpicStatus::Draft {
            return Err(AppError::precondition(format!(
                "epic {epic_id} cannot be confirmed from status={:?}",
                epic.status
            )));
        }
        if epic.proposed_tasks.is_empty() {
            return Err(AppError::invalid(format!(
                "epic {epic_id} has no proposed tasks to confirm"
            )));
        }
        let order = topological_order(&epic.proposed_tasks)?;

        let mut temp_to_task_id: HashMap<String, TaskId> = HashMap::new();
        let mut tasks = Vec::with_capacity(order.len());
        let now = Utc::now();
        for proposed in &order {
            let depends_on = proposed
                .depends_on_temp_ids
                .iter()
                .map(|temp_id| {
                    temp_to_task_id.get(temp_id).cloned().ok_or_else(|| {
                        AppError::internal(format!(
                            "dependency {temp_id} materialized after dependent {}",
                            proposed.temp_id
                        ))
                    })
                })
                .collect::<Result<_, AppError>>()?;
            let task_id = TaskId::new(new_suffix());
            temp_to_task_id.insert(proposed.temp_id.clone(), task_id.clone());
            tasks.push(Task {
                id: task_id,
                repo_id: epic.repo_id.clone(),
                title: proposed.title.clone(),
                description: proposed.description.clone(),
                acceptance_criteria: proposed.acceptance_criteria.clone(),
                status: TaskStatus::Pending,
                depends_on,
                ready: !epic.not_ready,
                attempt: 1,
                max_attempts: verve_core::task::DEFAULT_MAX_ATTEMPTS,
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
                max_cost_usd: 0.0,
                model: epic.model.clone(),
                skip_pr: false,
                epic_id: Some(epic.id.clone()),
                created_at: now,
                updated_at: now,
            });
        }

        epic.task_ids = tasks.iter().map(|t| t.id.clone()).collect();
        let previous_status = epic.status;
        epic.status = if epic.not_ready { EpicStatus::Ready } else { EpicStatus::Active };
        check_transition(previous_status, epic.status)?;
        epic.feedback = None;
        epic.feedback_type = Some(FeedbackType::Confirmed);
        epic.updated_at = now;

        drop(store);
        creator.materialize(&epic, &tasks)?;
        log_info!(
            LOG_TAG,
            "epic {} confirmed, materialized {} tasks -> {:?}",
            epic.id,
            tasks.len(),
            epic.status
        );
        if epic.status == EpicStatus::Active {
            self.hub.notify_task_pending();
        }
        Ok(epic)
    }

    /// E4: only `draft` epics may be deleted. Non-terminal child tasks are
    /// closed with reason `"epic deleted"` and detached; `merged` tasks are
    /// preserved untouched.
    pub async fn delete(&self, epic_id: &EpicId) -> Result<(), AppError> {
        {
            let store = self.lock();
            let epic = store.get_epic(epic_id)?;
            if epic.status != EpicStatus::Draft {
                return Err(AppError::precondition(format!(
                    "epic {epic_id} cannot be deleted from status={:?}",
                    epic.status
                )));
            }
            for mut task in store.list_tasks_by_epic(epic_id)? {
                if task.status == TaskStatus::Merged {
                    continue;
                }
                if !task.status.is_terminal() {
                    task.status = TaskStatus::Closed;
                    task.close_reason = Some("epic deleted".to_string());
                }
                task.epic_id = None;
                task.updated_at = Utc::now();
                store.update_task(&task)?;
            }
            store.delete_epic(epic_id)?;
        }
        self.hub.remove_epic_feedback(epic_id).await;
        Ok(())
    }

    /// Stale-claim release: any claimed `planning` epic whose
    /// heartbeat is older than `stale_after` has its claim released and a
    /// timeout note appended to `session_log`.
    pub fn release_stale_claims(&self, stale_after: Duration) -> Result<usize, AppError> {
        let store = self.lock();
        let now = Utc::now();
        let mut released = 0usize;
        for epic in store.list_claimed_planning_epics()? {
            let Some(last_heartbeat) = epic.last_heartbeat_at.or(epic.claimed_at) else {
                continue;
            };
            let age = now.signed_duration_since(last_heartbeat);
            if age.num_seconds() < stale_after.as_secs() as i64 {
                continue;
            }
            let mut epic = epic;
            epic.claimed_at = None;
            epic.last_heartbeat_at = None;
            epic
                .session_log
                .push(format!("planning session timed out at {}", now.to_rfc3339()));
            epic.updated_at = now;
            store.update_epic(&epic)?;
            log_warn!(LOG_TAG, "released stale planning claim on epic {}", epic.id);
            released += 1;
        }
        drop(store);
        if released > 0 {
            self.hub.notify_epic_pending();
        }
        Ok(released)
    }

    /// Epic completion watcher: for every `active` epic, if every child task is terminal-success
    /// (`merged` or `closed`) and none is `failed`, transition to
    /// `completed`. Returns the number of epics completed.
    pub fn sweep_completion(&self) -> Result<usize, AppError> {
        let Some(reader) = self.task_status_reader.get() else {
            return Ok(0);
        };
        let store = self.lock();
        let mut completed = 0usize;
        for epic in store.list_active_epics()? {
            let statuses = reader.task_statuses_for_epic(&epic.id)?;
            if statuses.is_empty() {
                continue;
            }
            if statuses.iter().any(|s| *s == TaskStatus::Failed) {
                continue;
            }
            if !statuses.iter().all(|s| s.is_terminal()) {
                continue;
            }
            let mut epic = epic;
            check_transition(epic.status, EpicStatus::Completed)?;
            epic.status = EpicStatus::Completed;
            epic.updated_at = Utc::now();
            store.update_epic(&epic)?;
            log_info!(LOG_TAG, "epic {} completed", epic.id);
            completed += 1;
        }
        Ok(completed)
    }
}

fn validate_proposed_tasks(proposed_tasks: &[ProposedTask]) -> Result<(), AppError> {
    let mut seen = HashSet::new();
    for task in proposed_tasks {
        if task.temp_id.trim().is_empty() {
            return Err(AppError::invalid("proposed task temp_id must not be empty"));
        }
        if !seen.insert(task.temp_id.as_str()) {
            return Err(AppError::invalid(format!(
                "duplicate proposed task temp_id {}",
                task.temp_id
            )));
        }
    }
    let known: HashSet<&str> = proposed_tasks.iter().map(|t| t.temp_id.as_str()).collect();
    for task in proposed_tasks {
        for dep in &task.depends_on_temp_ids {
            if !known.contains(dep.as_str()) {
                return Err(AppError::invalid(format!(
                    "proposed task {} depends on unknown temp_id {dep}",
                    task.temp_id
                )));
            }
        }
    }
    Ok(())
}

/// Kahn's algorithm over `temp_id`s; plain loops and explicit `Vec`/
/// `HashMap` bookkeeping, no graph crate. Ties broken by the proposed tasks' original
/// order, matching the FIFO tie-break discipline used elsewhere in the
/// store layer.
fn topological_order(proposed_tasks: &[ProposedTask]) -> Result<Vec<ProposedTask>, AppError> {
    let index_of: HashMap<&str, usize> = proposed_tasks
        .iter()
        .enumerate()
        .map(|(i, t)| (t.temp_id.as_str(), i))
        .collect();

    let mut in_degree = vec![0usize; proposed_tasks.len()];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); proposed_tasks.len()];
    for (i, task) in proposed_tasks.iter().enumerate() {
        for dep in &task.depends_on_temp_ids {
            let dep_index = *index_of.get(dep.as_str()).ok_or_else(|| {
                AppError::invalid(format!("task {} depends on unknown temp_id {dep}", task.temp_id))
            })?;
            dependents[dep_index].push(i);
            in_degree[i] += 1;
        }
    }

    // FIFO order among equally-ready nodes falls out of iterating
    // `in_degree` in the proposed tasks' original order.
    let mut ready: VecDeque<usize> = in_degree
        .iter()
        .enumerate()
        .filter(|(_, deg)| **deg == 0)
        .map(|(i, _)| i)
        .collect();

    let mut order = Vec::with_capacity(proposed_tasks.len());
    while let Some(i) = ready.pop_front() {
        order.push(proposed_tasks[i].clone());
        for &dependent in &dependents[i] {
            in_degree[dependent] -= 1;
            if in_degree[dependent] == 0 {
                ready.push_back(dependent);
            }
        }
    }

    if order.len() != proposed_tasks.len() {
        return Err(AppError::invalid(
            "proposed tasks contain a dependency cycle",
        ));
    }
    Ok(order)
}

fn new_suffix() -> String {
    use std::sync::atomic::{AtomicU64, Ordering};
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    let now = Utc::now().timestamp_nanos_opt().unwrap_or(0);
    format!("{now:x}{n:x}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use verve_core::Repo;

    /// A minimal in-test `TaskCreator` that just inserts rows directly,
    /// exercising `EpicStore::confirm` without pulling in `TaskStore`.
    struct DirectTaskCreator(Arc<Mutex<SqliteStore>>);
    impl TaskCreator for DirectTaskCreator {
        fn materialize(&self, epic: &Epic, tasks: &[Task]) -> Result<(), AppError> {
            let mut store = self.0.lock().unwrap_or_else(|p| p.into_inner());
            store.with_transaction(|conn| {
                for task in tasks {
                    SqliteStore::create_task_in_transaction(conn, task)?;
                }
                SqliteStore::update_epic_in_transaction(conn, epic)
            })
        }
    }

    fn fixture() -> (EpicStore, RepoId) {
        let store = Arc::new(Mutex::new(SqliteStore::open_in_memory().unwrap()));
        let hub = Hub::new();
        let repo_id = RepoId::new("acme-api");
        let repo = Repo {
            id: repo_id.clone(),
            owner: "acme".to_string(),
            name: "api".to_string(),
            full_name: "acme/api".to_string(),
            created_at: Utc::now(),
        };
        store.lock().unwrap().create_repo(&repo).unwrap();
        let es = EpicStore::new(store.clone(), hub);
        es.set_task_creator(Arc::new(DirectTaskCreator(store)));
        (es, repo_id)
    }

    fn create_simple(es: &EpicStore, repo_id: &RepoId) -> Epic {
        es.create(
            repo_id.clone(),
            "build the thing".to_string(),
            "desc".to_string(),
            None,
            false,
            "default".to_string(),
        )
        .unwrap()
    }

    #[test]
    fn create_rejects_empty_title() {
        let (es, repo_id) = fixture();
        let err = es
            .create(repo_id, "".to_string(), "d".to_string(), None, false, "m".to_string())
            .unwrap_err();
        assert!(matches!(err, AppError::Invalid(_)));
    }

    #[test]
    fn claim_pending_returns_planning_epic_once() {
        let (es, repo_id) = fixture();
        let epic = create_simple(&es, &repo_id);
        let claimed = es.claim_pending().unwrap().expect("claims one");
        assert_eq!(claimed.id, epic.id);
        assert!(claimed.claimed_at.is_some());
        assert!(es.claim_pending().unwrap().is_none());
    }

    #[test]
    fn propose_moves_planning_to_draft() {
        let (es, repo_id) = fixture();
        let epic = create_simple(&es, &repo_id);
        es.claim_pending().unwrap();
        let proposed = vec![ProposedTask {
            temp_id: "a".to_string(),
            title: "task a".to_string(),
            description: "d".to_string(),
            depends_on_temp_ids: vec![],
            acceptance_criteria: vec![],
        }];
        let epic = es.propose(&epic.id, proposed).unwrap();
        assert_eq!(epic.status, EpicStatus::Draft);
        assert_eq!(epic.proposed_tasks.len(), 1);
    }

    #[test]
    fn propose_rejects_duplicate_temp_ids() {
        let (es, repo_id) = fixture();
        let epic = create_simple(&es, &repo_id);
        let proposed = vec![
            ProposedTask {
                temp_id: "a".to_string(),
                title: "t".to_string(),
                description: "d".to_string(),
                depends_on_temp_ids: vec![],
                acceptance_criteria: vec![],
            },
            ProposedTask {
                temp_id: "a".to_string(),
                title: "t2".to_string(),
                description: "d".to_string(),
                depends_on_temp_ids: vec![],
                acceptance_criteria: vec![],
            },
        ];
        let err = es.propose(&epic.id, proposed).unwrap_err();
        assert!(matches!(err, AppError::Invalid(_)));
    }

    #[test]
    fn propose_rejects_unknown_dependency_reference() {
        let (es, repo_id) = fixture();
        let epic = create_simple(&es, &repo_id);
        let proposed = vec![ProposedTask {
            temp_id: "a".to_string(),
            title: "t".to_string(),
            description: "d".to_string(),
            depends_on_temp_ids: vec!["missing".to_string()],
            acceptance_criteria: vec![],
        }];
        let err = es.propose(&epic.id, proposed).unwrap_err();
        assert!(matches!(err, AppError::Invalid(_)));
    }

    #[tokio::test]
    async fn confirm_materializes_tasks_in_dependency_order() {
        let (es, repo_id) = fixture();
        let epic = create_simple(&es, &repo_id);
        es.claim_pending().unwrap();
        let proposed = vec![
            ProposedTask {
                temp_id: "b".to_string(),
                title: "second".to_string(),
                description: "d".to_string(),
                depends_on_temp_ids: vec!["a".to_string()],
                acceptance_criteria: vec![],
            },
            ProposedTask {
                temp_id: "a".to_string(),
                title: "first".to_string(),
                description: "d".to_string(),
                depends_on_temp_ids: vec![],
                acceptance_criteria: vec![],
            },
        ];
        es.propose(&epic.id, proposed).unwrap();
        let confirmed = es
            .submit_feedback(&epic.id, FeedbackType::Confirmed, None)
            .await
            .unwrap();
        assert_eq!(confirmed.status, EpicStatus::Active);
        assert_eq!(confirmed.task_ids.len(), 2);
    }

    #[tokio::test]
    async fn confirm_rejects_cyclic_dependencies() {
        let (es, repo_id) = fixture();
        let epic = create_simple(&es, &repo_id);
        let proposed = vec![
            ProposedTask {
                temp_id: "a".to_string(),
                title: "a".to_string(),
                description: "d".to_string(),
                depends_on_temp_ids: vec!["b".to_string()],
                acceptance_criteria: vec![],
            },
            ProposedTask {
                temp_id: "b".to_string(),
                title: "b".to_string(),
                description: "d".to_string(),
                depends_on_temp_ids: vec!["a".to_string()],
                acceptance_criteria: vec![],
            },
        ];
        es.propose(&epic.id, proposed).unwrap();
        let err = es
            .submit_feedback(&epic.id, FeedbackType::Confirmed, None)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Invalid(_)));
    }

    #[tokio::test]
    async fn message_feedback_returns_epic_to_planning_unclaimed() {
        let (es, repo_id) = fixture();
        let epic = create_simple(&es, &repo_id);
        es.claim_pending().unwrap();
        let proposed = vec![ProposedTask {
            temp_id: "a".to_string(),
            title: "t".to_string(),
            description: "d".to_string(),
            depends_on_temp_ids: vec![],
            acceptance_criteria: vec![],
        }];
        es.propose(&epic.id, proposed).unwrap();
        let epic = es
            .submit_feedback(&epic.id, FeedbackType::Message, Some("try again".to_string()))
            .await
            .unwrap();
        assert_eq!(epic.status, EpicStatus::Planning);
        assert!(epic.claimed_at.is_none());
        let reclaimed = es.claim_pending().unwrap().expect("requeued");
        assert_eq!(reclaimed.id, epic.id);
    }

    #[tokio::test]
    async fn poll_feedback_returns_queued_confirmed_payload() {
        let (es, repo_id) = fixture();
        let epic = create_simple(&es, &repo_id);
        let proposed = vec![ProposedTask {
            temp_id: "a".to_string(),
            title: "t".to_string(),
            description: "d".to_string(),
            depends_on_temp_ids: vec![],
            acceptance_criteria: vec![],
        }];
        es.propose(&epic.id, proposed).unwrap();
        es.submit_feedback(&epic.id, FeedbackType::Confirmed, None)
            .await
            .unwrap();
        let (message, feedback_type) = es
            .poll_feedback(&epic.id, Duration::from_millis(50))
            .await
            .unwrap()
            .expect("feedback queued");
        assert_eq!(feedback_type, FeedbackType::Confirmed);
        assert!(message.is_none());
    }

    #[tokio::test]
    async fn poll_feedback_times_out_with_empty_mailbox() {
        let (es, repo_id) = fixture();
        let epic = create_simple(&es, &repo_id);
        let result = es
            .poll_feedback(&epic.id, Duration::from_millis(20))
            .await
            .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn delete_only_allowed_from_draft() {
        let (es, repo_id) = fixture();
        let epic = create_simple(&es, &repo_id);
        let err = es.delete(&epic.id).await.unwrap_err();
        assert!(matches!(err, AppError::Precondition(_)));
    }

    #[tokio::test]
    async fn delete_cascades_close_to_non_terminal_children_and_preserves_merged() {
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
                created_at: Utc::now(),
            })
            .unwrap();
        let es = EpicStore::new(store.clone(), hub);
        let epic = create_simple(&es, &repo_id);
        let proposed = vec![ProposedTask {
            temp_id: "a".to_string(),
            title: "t".to_string(),
            description: "d".to_string(),
            depends_on_temp_ids: vec![],
            acceptance_criteria: vec![],
        }];
        let epic = es.propose(&epic.id, proposed).unwrap();
        assert_eq!(epic.status, EpicStatus::Draft);

        let now = Utc::now();
        let running_child = Task {
            id: TaskId::new("running-child"),
            repo_id: repo_id.clone(),
            title: "running".to_string(),
            description: "d".to_string(),
            acceptance_criteria: vec![],
            status: TaskStatus::Running,
            depends_on: Default::default(),
            ready: true,
            attempt: 1,
            max_attempts: 5,
            consecutive_failures: 0,
            branch_name: None,
            pr_url: None,
            pr_number: None,
            retry_reason: None,
            retry_context: None,
            close_reason: None,
            agent_status: None,
            started_at: Some(now),
            last_heartbeat_at: None,
            cost_usd: 0.0,
            max_cost_usd: 0.0,
            model: "m".to_string(),
            skip_pr: false,
            epic_id: Some(epic.id.clone()),
            created_at: now,
            updated_at: now,
        };
        let mut merged_child = running_child.clone();
        merged_child.id = TaskId::new("merged-child");
        merged_child.status = TaskStatus::Merged;
        merged_child.branch_name = Some("verve/merged".to_string());

        {
            let guard = store.lock().unwrap();
            guard.create_task(&running_child).unwrap();
            guard.create_task(&merged_child).unwrap();
        }

        es.delete(&epic.id).await.unwrap();
        assert!(es.get(&epic.id).is_err());

        let guard = store.lock().unwrap();
        let reaped = guard.get_task(&running_child.id).unwrap();
        assert_eq!(reaped.status, TaskStatus::Closed);
        assert_eq!(reaped.close_reason.as_deref(), Some("epic deleted"));
        assert!(reaped.epic_id.is_none());

        let preserved = guard.get_task(&merged_child.id).unwrap();
        assert_eq!(preserved.status, TaskStatus::Merged);
        assert_eq!(preserved.epic_id, Some(epic.id));
    }

    struct AllMerged;
    impl TaskStatusReader for AllMerged {
        fn task_statuses_for_epic(&self, _epic_id: &EpicId) -> Result<Vec<TaskStatus>, AppError> {
            Ok(vec![TaskStatus::Merged])
        }
    }

    #[test]
    fn sweep_completion_transitions_active_epic_with_all_children_merged() {
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
                created_at: Utc::now(),
            })
            .unwrap();
        let es = EpicStore::new(store.clone(), hub);
        es.set_task_creator(Arc::new(DirectTaskCreator(store.clone())));
        es.set_task_status_reader(Arc::new(AllMerged));

        let epic = create_simple(&es, &repo_id);
        let mut epic = epic;
        epic.status = EpicStatus::Active;
        epic.task_ids = vec![TaskId::new("x")];
        store.lock().unwrap().update_epic(&epic).unwrap();

        let completed = es.sweep_completion().unwrap();
        assert_eq!(completed, 1);
        assert_eq!(es.get(&epic.id).unwrap().status, EpicStatus::Completed);
    }

    #[test]
    fn sweep_completion_is_a_noop_with_no_reader_wired() {
        let store = Arc::new(Mutex::new(SqliteStore::open_in_memory().unwrap()));
        let hub = Hub::new();
        let es = EpicStore::new(store, hub);
        assert_eq!(es.sweep_completion().unwrap(), 0);
    }
}
