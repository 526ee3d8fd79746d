//! The HTTP front end (C6), covering every logical endpoint the task,
//! epic, and dispatch layers expose.
//! Grounded on `orch-web/src/routes.rs`'s `Router` wiring, `State<...>`
//! extractor usage and `#[tokio::test]` + `tower::ServiceExt::oneshot`
//! test style.

use std::convert::Infallible;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;

use verve_core::{Epic, RepoId, Task, TaskCompletionReport, TaskId};
use verve_notify::TaskEvent;

use crate::error::ApiError;
use crate::model::{
    AppendLogsRequest, AppendSessionLogRequest, CloseTaskRequest, CreateEpicRequest,
    CreateRepoRequest, CreateTaskRequest, DeadlineQuery, FeedbackRequest, FeedbackResponse,
    PollQuery, ProposeRequest, RepoListResponse, TaskListResponse,
};
use crate::state::AppState;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/health", get(health))
        .route("/repos", post(create_repo).get(list_repos))
        .route("/repos/{repo_id}/tasks", get(list_tasks_by_repo))
        .route("/tasks", post(create_task))
        .route("/tasks/{task_id}", get(get_task).delete(delete_task))
        .route("/tasks/{task_id}/logs", get(list_task_logs).post(append_task_logs))
        .route("/tasks/{task_id}/events", get(stream_task_events))
        .route("/tasks/{task_id}/heartbeat", post(task_heartbeat))
        .route("/tasks/{task_id}/complete", post(complete_task))
        .route("/tasks/{task_id}/manual-retry", post(manual_retry_task))
        .route("/tasks/{task_id}/feedback-retry", post(feedback_retry_task))
        .route("/tasks/{task_id}/start-over", post(start_over_task))
        .route("/tasks/{task_id}/close", post(close_task))
        .route("/epics", post(create_epic))
        .route("/epics/{epic_id}", get(get_epic).delete(delete_epic))
        .route("/epics/{epic_id}/propose", post(propose_epic_tasks))
        .route("/epics/{epic_id}/logs", post(append_epic_session_log))
        .route("/epics/{epic_id}/heartbeat", post(epic_heartbeat))
        .route("/epics/{epic_id}/feedback", post(submit_epic_feedback))
        .route("/epics/{epic_id}/poll-feedback", get(poll_epic_feedback))
        .route("/poll", get(poll_dispatch))
        .with_state(state)
}

async fn index() -> impl IntoResponse {
    "verve-web running"
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "ok": true }))
}

async fn create_repo(
    State(state): State<AppState>,
    Json(request): Json<CreateRepoRequest>,
) -> Result<Json<verve_core::Repo>, ApiError> {
    let repo = verve_core::Repo {
        id: RepoId::new(format!("{}-{}", request.owner, request.name)),
        full_name: format!("{}/{}", request.owner, request.name),
        owner: request.owner,
        name: request.name,
        created_at: chrono::Utc::now(),
    };
    state.tasks.create_repo(&repo)?;
    Ok(Json(repo))
}

async fn list_repos(State(state): State<AppState>) -> Result<Json<RepoListResponse>, ApiError> {
    let repos = state.tasks.list_repos()?;
    Ok(Json(RepoListResponse { repos }))
}

async fn list_tasks_by_repo(
    State(state): State<AppState>,
    Path(repo_id): Path<String>,
) -> Result<Json<TaskListResponse>, ApiError> {
    let repo_id = RepoId::parse(repo_id)?;
    let tasks = state.tasks.list_by_repo(&repo_id)?;
    Ok(Json(TaskListResponse { tasks }))
}

async fn create_task(
    State(state): State<AppState>,
    Json(request): Json<CreateTaskRequest>,
) -> Result<Json<Task>, ApiError> {
    let task = state.tasks.create(
        request.repo_id,
        request.title,
        request.description,
        request.acceptance_criteria,
        request.depends_on,
        request.ready,
        request.max_attempts.unwrap_or(state.defaults.max_attempts_default),
        request.max_cost_usd,
        request.model.unwrap_or_else(|| state.defaults.default_model.clone()),
        request.skip_pr,
        request.epic_id,
    )?;
    Ok(Json(task))
}

async fn get_task(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> Result<Json<Task>, ApiError> {
    let task_id = TaskId::parse(task_id)?;
    Ok(Json(state.tasks.get(&task_id)?))
}

async fn delete_task(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> Result<(), ApiError> {
    let task_id = TaskId::parse(task_id)?;
    state.tasks.delete(&task_id).await?;
    Ok(())
}

async fn list_task_logs(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> Result<Json<Vec<verve_core::TaskLogRecord>>, ApiError> {
    let task_id = TaskId::parse(task_id)?;
    Ok(Json(state.tasks.list_logs(&task_id)?))
}

async fn append_task_logs(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
    Json(request): Json<AppendLogsRequest>,
) -> Result<(), ApiError> {
    let task_id = TaskId::parse(task_id)?;
    state.tasks.append_logs(&task_id, request.attempt, request.lines).await?;
    Ok(())
}

async fn stream_task_events(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> Result<Sse<impl tokio_stream::Stream<Item = Result<SseEvent, Infallible>>>, ApiError> {
    let task_id = TaskId::parse(task_id)?;
    let rx = state.hub.subscribe_task_events(&task_id).await;
    let stream = BroadcastStream::new(rx).map(|message| {
        let event = match message {
            Ok(payload) => {
                let data = serde_json::to_string(&payload).unwrap_or_else(|_| "{}".to_string());
                let name = match &payload {
                    TaskEvent::Logs { .. } => "logs",
                    TaskEvent::StatusChanged { .. } => "status_changed",
                };
                SseEvent::default().event(name).data(data)
            }
            Err(_) => SseEvent::default().event("lagged").data("{}"),
        };
        Ok(event)
    });
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

async fn task_heartbeat(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> Result<(), ApiError> {
    let task_id = TaskId::parse(task_id)?;
    state.tasks.heartbeat(&task_id)?;
    Ok(())
}

async fn complete_task(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
    Json(report): Json<TaskCompletionReport>,
) -> Result<Json<Task>, ApiError> {
    let task_id = TaskId::parse(task_id)?;
    Ok(Json(state.tasks.complete(&task_id, report).await?))
}

async fn manual_retry_task(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> Result<Json<Task>, ApiError> {
    let task_id = TaskId::parse(task_id)?;
    Ok(Json(state.tasks.manual_retry(&task_id)?))
}

async fn feedback_retry_task(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> Result<Json<Task>, ApiError> {
    let task_id = TaskId::parse(task_id)?;
    Ok(Json(state.tasks.feedback_retry(&task_id)?))
}

async fn start_over_task(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> Result<Json<Task>, ApiError> {
    let task_id = TaskId::parse(task_id)?;
    Ok(Json(state.tasks.start_over(&task_id)?))
}

async fn close_task(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
    Json(request): Json<CloseTaskRequest>,
) -> Result<Json<Task>, ApiError> {
    let task_id = TaskId::parse(task_id)?;
    Ok(Json(state.tasks.close(&task_id, request.reason)?))
}

async fn create_epic(
    State(state): State<AppState>,
    Json(request): Json<CreateEpicRequest>,
) -> Result<Json<Epic>, ApiError> {
    let epic = state.epics.create(
        request.repo_id,
        request.title,
        request.description,
        request.planning_prompt,
        request.not_ready,
        request.model.unwrap_or_else(|| state.defaults.default_model.clone()),
    )?;
    Ok(Json(epic))
}

async fn get_epic(
    State(state): State<AppState>,
    Path(epic_id): Path<String>,
) -> Result<Json<Epic>, ApiError> {
    let epic_id = verve_core::EpicId::parse(epic_id)?;
    Ok(Json(state.epics.get(&epic_id)?))
}

async fn delete_epic(
    State(state): State<AppState>,
    Path(epic_id): Path<String>,
) -> Result<(), ApiError> {
    let epic_id = verve_core::EpicId::parse(epic_id)?;
    state.epics.delete(&epic_id).await?;
    Ok(())
}

async fn propose_epic_tasks(
    State(state): State<AppState>,
    Path(epic_id): Path<String>,
    Json(request): Json<ProposeRequest>,
) -> Result<Json<Epic>, ApiError> {
    let epic_id = verve_core::EpicId::parse(epic_id)?;
    Ok(Json(state.epics.propose(&epic_id, request.proposed_tasks)?))
}

async fn append_epic_session_log(
    State(state): State<AppState>,
    Path(epic_id): Path<String>,
    Json(request): Json<AppendSessionLogRequest>,
) -> Result<(), ApiError> {
    let epic_id = verve_core::EpicId::parse(epic_id)?;
    state.epics.append_session_log(&epic_id, request.lines)?;
    Ok(())
}

async fn epic_heartbeat(
    State(state): State<AppState>,
    Path(epic_id): Path<String>,
) -> Result<(), ApiError> {
    let epic_id = verve_core::EpicId::parse(epic_id)?;
    state.epics.heartbeat(&epic_id)?;
    Ok(())
}

async fn submit_epic_feedback(
    State(state): State<AppState>,
    Path(epic_id): Path<String>,
    Json(request): Json<FeedbackRequest>,
) -> Result<Json<Epic>, ApiError> {
    let epic_id = verve_core::EpicId::parse(epic_id)?;
    Ok(Json(
        state
            .epics
            .submit_feedback(&epic_id, request.feedback_type, request.message)
            .await?,
    ))
}

async fn poll_epic_feedback(
    State(state): State<AppState>,
    Path(epic_id): Path<String>,
    Query(query): Query<DeadlineQuery>,
) -> Result<Json<Option<FeedbackResponse>>, ApiError> {
    let epic_id = verve_core::EpicId::parse(epic_id)?;
    let deadline = Duration::from_secs(query.deadline_secs.unwrap_or(state.default_poll_deadline.as_secs()));
    let result = state.epics.poll_feedback(&epic_id, deadline).await?;
    Ok(Json(result.map(|(message, feedback_type)| FeedbackResponse {
        message,
        feedback_type,
    })))
}

/// The unified long-poll dispatch endpoint (C5).
async fn poll_dispatch(
    State(state): State<AppState>,
    Query(query): Query<PollQuery>,
) -> Result<Json<Option<verved::WorkEnvelope>>, ApiError> {
    let repo_ids = match query.repo_ids {
        Some(raw) if !raw.trim().is_empty() => {
            let mut ids = Vec::new();
            for part in raw.split(',') {
                ids.push(RepoId::parse(part.trim())?);
            }
            Some(ids)
        }
        _ => None,
    };
    let deadline = Duration::from_secs(query.deadline_secs.unwrap_or(state.default_poll_deadline.as_secs()));
    let envelope = state
        .dispatch
        .poll(repo_ids.as_deref(), deadline)
        .await
        .map_err(ApiError::from)?;
    Ok(Json(envelope))
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    use verve_core::Repo;
    use verved::{Dispatch, EpicStore, SqliteStore, TaskStore};

    use super::*;

    fn test_state() -> AppState {
        let store = Arc::new(Mutex::new(SqliteStore::open_in_memory().expect("in-memory store")));
        let hub = verve_notify::Hub::new();
        let tasks = Arc::new(TaskStore::new(store.clone(), hub.clone()));
        let epics = Arc::new(EpicStore::new(store, hub.clone()));
        epics.set_task_creator(tasks.clone());
        epics.set_task_status_reader(tasks.clone());
        let dispatch = Arc::new(Dispatch::new(epics.clone(), tasks.clone(), hub.clone()));
        AppState::new(
            tasks,
            epics,
            dispatch,
            hub,
            Duration::from_millis(50),
            verve_core::config::DefaultsConfig::default(),
        )
    }

    fn mk_repo(state: &AppState, suffix: &str) -> Repo {
        let repo = Repo {
            id: RepoId::new(suffix),
            owner: "acme".to_string(),
            name: suffix.to_string(),
            full_name: format!("acme/{suffix}"),
            created_at: chrono::Utc::now(),
        };
        state.tasks.create_repo(&repo).expect("create repo");
        repo
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let app = router(test_state());
        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn create_and_fetch_task_round_trips() {
        let state = test_state();
        let repo = mk_repo(&state, "widgets");
        let app = router(state);

        let body = serde_json::json!({
            "repo_id": repo.id.0,
            "title": "fix the thing",
        });
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/tasks")
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let task: Task = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(task.title, "fix the thing");

        let response = app
            .oneshot(
                Request::builder()
                    .uri(format!("/tasks/{}", task.id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn unknown_task_returns_404_with_error_body() {
        let app = router(test_state());
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/tasks/tsk_does-not-exist")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let payload: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(payload["code"], "not_found");
    }

    #[tokio::test]
    async fn poll_times_out_with_no_work() {
        let app = router(test_state());
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/poll?deadline_secs=0")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let payload: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert!(payload.is_null());
    }
}
