//! The outcome reconciler (C7): polls the forge for every
//! `review` task's PR state and translates merges, conflicts, and CI
//! failures into task-store transitions. Grounded on the periodic-tick
//! shape of `orchd/src/daemon_loop.rs` (one pass over candidates per tick,
//! per-item errors logged and skipped rather than aborting the sweep) and
//! on `verve-forge`'s `ForgeClient` trait for the five predicates it needs.

use std::sync::Arc;

use verve_core::{log_error, log_info, log_warn, Task, TaskId};
use verve_forge::{CheckStatus, ForgeClient};

use crate::task_store::TaskStore;

const LOG_TAG: &str = "reconciler";

pub const MERGE_CONFLICT_REASON: &str = "merge_conflict: PR has conflicts with base branch";

pub struct Reconciler {
    task_store: Arc<TaskStore>,
    forge: Arc<dyn ForgeClient>,
}

impl Reconciler {
    pub fn new(task_store: Arc<TaskStore>, forge: Arc<dyn ForgeClient>) -> Self {
        Self { task_store, forge }
    }

    /// One sweep over every `review` task with a PR number. Forge errors
    /// are logged per task and never abort the sweep. Returns the number of
    /// tasks transitioned.
    pub async fn run_once(&self) -> usize {
        let candidates = match self.task_store.list_review_with_pr() {
            Ok(candidates) => candidates,
            Err(err) => {
                log_error!(LOG_TAG, "failed to list review candidates: {err}");
                return 0;
            }
        };

        let mut transitioned = 0;
        for task in candidates {
            match self.reconcile_one(&task).await {
                Ok(true) => transitioned += 1,
                Ok(false) => {}
                Err(err) => {
                    log_warn!(LOG_TAG, "task {} reconcile failed: {err}", task.id);
                }
            }
        }
        transitioned
    }

    /// Returns `Ok(true)` if the task transitioned, `Ok(false)` if it is
    /// still awaiting CI or human merge, `Err` on a forge-level failure.
    async fn reconcile_one(&self, task: &Task) -> Result<bool, ReconcileError> {
        let pr_number = task.pr_number.ok_or(ReconcileError::NoPrNumber)?;
        let repo = self
            .task_store
            .get_repo(&task.repo_id)
            .map_err(ReconcileError::Store)?;

        if self.forge_call({
            let forge = self.forge.clone();
            let owner = repo.owner.clone();
            let name = repo.name.clone();
            move || forge.is_pr_merged(&owner, &name, pr_number)
        })
        .await?
        {
            self.task_store
                .mark_merged(&task.id)
                .map_err(ReconcileError::Store)?;
            log_info!(LOG_TAG, "task {} merged", task.id);
            return Ok(true);
        }

        let mergeability = self
            .forge_call({
                let forge = self.forge.clone();
                let owner = repo.owner.clone();
                let name = repo.name.clone();
                move || forge.pr_mergeability(&owner, &name, pr_number)
            })
            .await?;
        if mergeability.has_conflicts {
            self.task_store
                .schedule_review_retry(&task.id, MERGE_CONFLICT_REASON.to_string(), None)
                .map_err(ReconcileError::Store)?;
            log_info!(LOG_TAG, "task {} has merge conflicts, scheduled retry", task.id);
            return Ok(true);
        }

        let check_status = self
            .forge_call({
                let forge = self.forge.clone();
                let owner = repo.owner.clone();
                let name = repo.name.clone();
                move || forge.pr_check_status(&owner, &name, pr_number)
            })
            .await?;
        match check_status.status {
            CheckStatus::Failure => {
                let logs = self
                    .forge_call({
                        let forge = self.forge.clone();
                        let owner = repo.owner.clone();
                        let name = repo.name.clone();
                        move || forge.failed_check_logs(&owner, &name, pr_number)
                    })
                    .await?;
                let summary = summarize_failed_checks(&task.id, &check_status.failed_names);
                self.task_store
                    .schedule_review_retry(
                        &task.id,
                        format!("ci_failure: {summary}"),
                        Some(logs),
                    )
                    .map_err(ReconcileError::Store)?;
                log_info!(LOG_TAG, "task {} CI failed, scheduled retry", task.id);
                Ok(true)
            }
            CheckStatus::Pending | CheckStatus::Success => Ok(false),
        }
    }

    /// Shells out via `spawn_blocking` — `ForgeClient` methods run `gh`
    /// synchronously and must not block the async executor.
    async fn forge_call<F, T>(&self, call: F) -> Result<T, ReconcileError>
    where
        F: FnOnce() -> Result<T, verve_forge::ForgeError> + Send + 'static,
        T: Send + 'static,
    {
        tokio::task::spawn_blocking(call)
            .await
            .map_err(|err| ReconcileError::Forge(format!("join error: {err}")))?
            .map_err(|err| ReconcileError::Forge(err.to_string()))
    }
}

fn summarize_failed_checks(task_id: &TaskId, failed_names: &[String]) -> String {
    if failed_names.is_empty() {
        format!("task {task_id} has failing required checks")
    } else {
        format!("failing checks: {}", failed_names.join(", "))
    }
}

#[derive(Debug, thiserror::Error)]
enum ReconcileError {
    #[error("task has no pr_number")]
    NoPrNumber,
    #[error("store error: {0}")]
    Store(#[source] verve_core::AppError),
    #[error("forge error: {0}")]
    Forge(String),
}
