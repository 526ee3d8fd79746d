//! The store adapter (C1): transactional CRUD plus the conditional-update
//! claim primitives every higher layer builds on. Grounded on
//! `orchd/src/persistence.rs`'s `SqliteStore` (schema-as-code migrate,
//! JSON-encoded collection columns, RFC3339 timestamp columns, one mutating
//! statement per method), redesigned around the four tables this store
//! actually needs.

use std::collections::BTreeSet;
use std::path::Path;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use verve_core::{
    AppError, Epic, EpicId, EpicStatus, FeedbackType, ProposedTask, Repo, RepoId, Task, TaskId,
    TaskLogRecord, TaskStatus,
};

pub struct SqliteStore {
    conn: Connection,
}

fn sql_err(context: &str) -> impl Fn(rusqlite::Error) -> AppError + '_ {
    move |err| AppError::internal(format!("{context}: {err}"))
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, AppError> {
        let conn = Connection::open(path).map_err(sql_err("open store"))?;
        let store = Self { conn };
        store.migrate()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self, AppError> {
        let conn = Connection::open_in_memory().map_err(sql_err("open in-memory store"))?;
        let store = Self { conn };
        store.migrate()?;
        Ok(store)
    }

    fn migrate(&self) -> Result<(), AppError> {
        self.conn
            .execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS repo (
                    id TEXT PRIMARY KEY,
                    owner TEXT NOT NULL,
                    name TEXT NOT NULL,
                    full_name TEXT NOT NULL UNIQUE,
                    created_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS task (
                    id TEXT PRIMARY KEY,
                    repo_id TEXT NOT NULL REFERENCES repo(id),
                    title TEXT NOT NULL,
                    description TEXT NOT NULL,
                    acceptance_criteria TEXT NOT NULL,
                    status TEXT NOT NULL,
                    depends_on TEXT NOT NULL,
                    ready INTEGER NOT NULL,
                    attempt INTEGER NOT NULL,
                    max_attempts INTEGER NOT NULL,
                    consecutive_failures INTEGER NOT NULL,
                    branch_name TEXT,
                    pr_url TEXT,
                    pr_number INTEGER,
                    retry_reason TEXT,
                    retry_context TEXT,
                    close_reason TEXT,
                    agent_status TEXT,
                    started_at TEXT,
                    last_heartbeat_at TEXT,
                    cost_usd REAL NOT NULL,
                    max_cost_usd REAL NOT NULL,
                    model TEXT NOT NULL,
                    skip_pr INTEGER NOT NULL,
                    epic_id TEXT,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_task_status_ready_created
                    ON task(status, ready, created_at);
                CREATE INDEX IF NOT EXISTS idx_task_repo ON task(repo_id);
                CREATE INDEX IF NOT EXISTS idx_task_epic ON task(epic_id);

                CREATE TABLE IF NOT EXISTS task_log (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    task_id TEXT NOT NULL REFERENCES task(id),
                    attempt INTEGER NOT NULL,
                    lines TEXT NOT NULL,
                    created_at TEXT NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_task_log_task ON task_log(task_id, id);

                CREATE TABLE IF NOT EXISTS epic (
                    id TEXT PRIMARY KEY,
                    repo_id TEXT NOT NULL REFERENCES repo(id),
                    title TEXT NOT NULL,
                    description TEXT NOT NULL,
                    status TEXT NOT NULL,
                    proposed_tasks TEXT NOT NULL,
                    task_ids TEXT NOT NULL,
                    planning_prompt TEXT,
                    session_log TEXT NOT NULL,
                    not_ready INTEGER NOT NULL,
                    model TEXT NOT NULL,
                    claimed_at TEXT,
                    last_heartbeat_at TEXT,
                    feedback TEXT,
                    feedback_type TEXT,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_epic_status_claimed ON epic(status, claimed_at);
                "#,
            )
            .map_err(sql_err("migrate"))?;
        Ok(())
    }

    // ---- repo ----

    pub fn create_repo(&self, repo: &Repo) -> Result<(), AppError> {
        self.conn
            .execute(
                "INSERT INTO repo (id, owner, name, full_name, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    repo.id.0,
                    repo.owner,
                    repo.name,
                    repo.full_name,
                    repo.created_at.to_rfc3339(),
                ],
            )
            .map_err(|e| match e {
                rusqlite::Error::SqliteFailure(err, _)
                    if err.code == rusqlite::ErrorCode::ConstraintViolation =>
                {
                    AppError::conflict(format!("repo {} already exists", repo.full_name))
                }
                other => AppError::internal(format!("create_repo: {other}")),
            })?;
        Ok(())
    }

    pub fn get_repo(&self, id: &RepoId) -> Result<Repo, AppError> {
        self.conn
            .query_row(
                "SELECT id, owner, name, full_name, created_at FROM repo WHERE id = ?1",
                params![id.0],
                row_to_repo,
            )
            .optional()
            .map_err(sql_err("get_repo"))?
            .ok_or_else(|| AppError::not_found(format!("repo {id} not found")))
    }

    pub fn delete_repo(&self, id: &RepoId) -> Result<(), AppError> {
        let task_count: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM task WHERE repo_id = ?1",
                params![id.0],
                |row| row.get(0),
            )
            .map_err(sql_err("delete_repo count"))?;
        if task_count > 0 {
            return Err(AppError::precondition(format!(
                "repo {id} still has {task_count} task(s)"
            )));
        }
        let affected = self
            .conn
            .execute("DELETE FROM repo WHERE id = ?1", params![id.0])
            .map_err(sql_err("delete_repo"))?;
        if affected == 0 {
            return Err(AppError::not_found(format!("repo {id} not found")));
        }
        Ok(())
    }

    // ---- task ----

    pub fn create_task(&self, task: &Task) -> Result<(), AppError> {
        Self::insert_task_conn(&self.conn, task).map_err(|e| match e {
            rusqlite::Error::SqliteFailure(err, _)
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                AppError::conflict(format!("task {} already exists", task.id))
            }
            other => AppError::internal(format!("create_task: {other}")),
        })
    }

    /// Same insert, usable against a live `rusqlite::Transaction` (which
    /// derefs to `Connection`) — the epic store's confirmation
    /// materialization runs a whole batch of these inside one transaction.
    pub fn create_task_in_transaction(conn: &Connection, task: &Task) -> Result<(), AppError> {
        Self::insert_task_conn(conn, task).map_err(|e| match e {
            rusqlite::Error::SqliteFailure(err, _)
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                AppError::conflict(format!("task {} already exists", task.id))
            }
            other => AppError::internal(format!("create_task: {other}")),
        })
    }

    fn insert_task_conn(conn: &Connection, task: &Task) -> Result<(), rusqlite::Error> {
        conn.execute(
            "INSERT INTO task (
                id, repo_id, title, description, acceptance_criteria, status, depends_on,
                ready, attempt, max_attempts, consecutive_failures, branch_name, pr_url,
                pr_number, retry_reason, retry_context, close_reason, agent_status,
                started_at, last_heartbeat_at, cost_usd, max_cost_usd, model, skip_pr,
                epic_id, created_at, updated_at
            ) VALUES (
                ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17,
                ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25, ?26, ?27
            )",
            params![
                task.id.0,
                task.repo_id.0,
                task.title,
                task.description,
                json(&task.acceptance_criteria),
                task.status.as_db_str(),
                json(&task.depends_on),
                task.ready,
                task.attempt,
                task.max_attempts,
                task.consecutive_failures,
                task.branch_name,
                task.pr_url,
                task.pr_number.map(|n| n as i64),
                task.retry_reason,
                task.retry_context,
                task.close_reason,
                task.agent_status.as_ref().map(|v| v.to_string()),
                task.started_at.map(|t| t.to_rfc3339()),
                task.last_heartbeat_at.map(|t| t.to_rfc3339()),
                task.cost_usd,
                task.max_cost_usd,
                task.model,
                task.skip_pr,
                task.epic_id.as_ref().map(|e| e.0.clone()),
                task.created_at.to_rfc3339(),
                task.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn get_task(&self, id: &TaskId) -> Result<Task, AppError> {
        self.conn
            .query_row("SELECT * FROM task WHERE id = ?1", params![id.0], row_to_task)
            .optional()
            .map_err(sql_err("get_task"))?
            .ok_or_else(|| AppError::not_found(format!("task {id} not found")))
    }

    pub fn get_task_status(&self, id: &TaskId) -> Result<TaskStatus, AppError> {
        let raw: String = self
            .conn
            .query_row(
                "SELECT status FROM task WHERE id = ?1",
                params![id.0],
                |row| row.get(0),
            )
            .optional()
            .map_err(sql_err("get_task_status"))?
            .ok_or_else(|| AppError::not_found(format!("task {id} not found")))?;
        TaskStatus::from_db_str(&raw)
            .ok_or_else(|| AppError::internal(format!("unrecognized task status '{raw}'")))
    }

    pub fn list_tasks_by_repo(&self, repo_id: &RepoId) -> Result<Vec<Task>, AppError> {
        let mut stmt = self
            .conn
            .prepare("SELECT * FROM task WHERE repo_id = ?1 ORDER BY created_at, id")
            .map_err(sql_err("list_tasks_by_repo prepare"))?;
        let rows = stmt
            .query_map(params![repo_id.0], row_to_task)
            .map_err(sql_err("list_tasks_by_repo query"))?;
        collect(rows)
    }

    pub fn list_tasks_by_epic(&self, epic_id: &EpicId) -> Result<Vec<Task>, AppError> {
        let mut stmt = self
            .conn
            .prepare("SELECT * FROM task WHERE epic_id = ?1 ORDER BY created_at, id")
            .map_err(sql_err("list_tasks_by_epic prepare"))?;
        let rows = stmt
            .query_map(params![epic_id.0], row_to_task)
            .map_err(sql_err("list_tasks_by_epic query"))?;
        collect(rows)
    }

    /// Pending-ready candidates in FIFO `created_at` order, tie-broken by
    /// id, optionally filtered to a subset of repos.
    pub fn list_pending_ready_tasks(
        &self,
        repo_filter: Option<&[RepoId]>,
    ) -> Result<Vec<Task>, AppError> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT * FROM task WHERE status = 'pending' AND ready = 1
                 ORDER BY created_at, id",
            )
            .map_err(sql_err("list_pending_ready_tasks prepare"))?;
        let rows = stmt
            .query_map([], row_to_task)
            .map_err(sql_err("list_pending_ready_tasks query"))?;
        let all = collect(rows)?;
        Ok(match repo_filter {
            None => all,
            Some(repos) => {
                let allowed: BTreeSet<&str> = repos.iter().map(|r| r.0.as_str()).collect();
                all.into_iter()
                    .filter(|t| allowed.contains(t.repo_id.0.as_str()))
                    .collect()
            }
        })
    }

    /// Candidates for the outcome reconciler: every task in
    /// `review` carrying a PR number, across all repos.
    pub fn list_review_tasks_with_pr(&self) -> Result<Vec<Task>, AppError> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT * FROM task WHERE status = 'review' AND pr_number > 0
                 ORDER BY created_at, id",
            )
            .map_err(sql_err("list_review_tasks_with_pr prepare"))?;
        let rows = stmt
            .query_map([], row_to_task)
            .map_err(sql_err("list_review_tasks_with_pr query"))?;
        collect(rows)
    }

    pub fn list_repos(&self) -> Result<Vec<Repo>, AppError> {
        let mut stmt = self
            .conn
            .prepare("SELECT * FROM repo ORDER BY created_at, id")
            .map_err(sql_err("list_repos prepare"))?;
        let rows = stmt
            .query_map([], row_to_repo)
            .map_err(sql_err("list_repos query"))?;
        collect(rows)
    }

    /// The atomic claim primitive: a single conditional
    /// `UPDATE`, success determined by rows-affected, never a
    /// read-then-write under an application lock.
    pub fn try_claim_task(&self, id: &TaskId, now: DateTime<Utc>) -> Result<bool, AppError> {
        let affected = self
            .conn
            .execute(
                "UPDATE task SET status = 'running', started_at = ?2, updated_at = ?2
                 WHERE id = ?1 AND status = 'pending' AND ready = 1",
                params![id.0, now.to_rfc3339()],
            )
            .map_err(sql_err("try_claim_task"))?;
        Ok(affected == 1)
    }

    pub fn update_task(&self, task: &Task) -> Result<(), AppError> {
        let affected = self
            .conn
            .execute(
                "UPDATE task SET
                    title = ?2, description = ?3, acceptance_criteria = ?4, status = ?5,
                    depends_on = ?6, ready = ?7, attempt = ?8, max_attempts = ?9,
                    consecutive_failures = ?10, branch_name = ?11, pr_url = ?12,
                    pr_number = ?13, retry_reason = ?14, retry_context = ?15,
                    close_reason = ?16, agent_status = ?17, started_at = ?18,
                    last_heartbeat_at = ?19, cost_usd = ?20, max_cost_usd = ?21,
                    model = ?22, skip_pr = ?23, epic_id = ?24, updated_at = ?25
                 WHERE id = ?1",
                params![
                    task.id.0,
                    task.title,
                    task.description,
                    json(&task.acceptance_criteria),
                    task.status.as_db_str(),
                    json(&task.depends_on),
                    task.ready,
                    task.attempt,
                    task.max_attempts,
                    task.consecutive_failures,
                    task.branch_name,
                    task.pr_url,
                    task.pr_number.map(|n| n as i64),
                    task.retry_reason,
                    task.retry_context,
                    task.close_reason,
                    task.agent_status.as_ref().map(|v| v.to_string()),
                    task.started_at.map(|t| t.to_rfc3339()),
                    task.last_heartbeat_at.map(|t| t.to_rfc3339()),
                    task.cost_usd,
                    task.max_cost_usd,
                    task.model,
                    task.skip_pr,
                    task.epic_id.as_ref().map(|e| e.0.clone()),
                    task.updated_at.to_rfc3339(),
                ],
            )
            .map_err(sql_err("update_task"))?;
        if affected == 0 {
            return Err(AppError::not_found(format!("task {} not found", task.id)));
        }
        Ok(())
    }

    pub fn delete_task(&self, id: &TaskId) -> Result<(), AppError> {
        self.conn
            .execute("DELETE FROM task_log WHERE task_id = ?1", params![id.0])
            .map_err(sql_err("delete_task logs"))?;
        let affected = self
            .conn
            .execute("DELETE FROM task WHERE id = ?1", params![id.0])
            .map_err(sql_err("delete_task"))?;
        if affected == 0 {
            return Err(AppError::not_found(format!("task {id} not found")));
        }
        Ok(())
    }

    pub fn append_task_log(
        &self,
        task_id: &TaskId,
        attempt: u32,
        lines: &[String],
        now: DateTime<Utc>,
    ) -> Result<(), AppError> {
        self.conn
            .execute(
                "INSERT INTO task_log (task_id, attempt, lines, created_at) VALUES (?1, ?2, ?3, ?4)",
                params![task_id.0, attempt, json(lines), now.to_rfc3339()],
            )
            .map_err(sql_err("append_task_log"))?;
        Ok(())
    }

    pub fn list_task_logs(&self, task_id: &TaskId) -> Result<Vec<TaskLogRecord>, AppError> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, task_id, attempt, lines, created_at FROM task_log
                 WHERE task_id = ?1 ORDER BY id",
            )
            .map_err(sql_err("list_task_logs prepare"))?;
        let rows = stmt
            .query_map(params![task_id.0], row_to_log)
            .map_err(sql_err("list_task_logs query"))?;
        collect(rows)
    }

    pub fn delete_task_logs(&self, task_id: &TaskId) -> Result<(), AppError> {
        self.conn
            .execute("DELETE FROM task_log WHERE task_id = ?1", params![task_id.0])
            .map_err(sql_err("delete_task_logs"))?;
        Ok(())
    }

    // ---- epic ----

    pub fn create_epic(&self, epic: &Epic) -> Result<(), AppError> {
        self.conn
            .execute(
                "INSERT INTO epic (
                    id, repo_id, title, description, status, proposed_tasks, task_ids,
                    planning_prompt, session_log, not_ready, model, claimed_at,
                    last_heartbeat_at, feedback, feedback_type, created_at, updated_at
                ) VALUES (
                    ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17
                )",
                params![
                    epic.id.0,
                    epic.repo_id.0,
                    epic.title,
                    epic.description,
                    epic.status.as_db_str(),
                    json(&epic.proposed_tasks),
                    json(&epic.task_ids),
                    epic.planning_prompt,
                    json(&epic.session_log),
                    epic.not_ready,
                    epic.model,
                    epic.claimed_at.map(|t| t.to_rfc3339()),
                    epic.last_heartbeat_at.map(|t| t.to_rfc3339()),
                    epic.feedback,
                    epic.feedback_type.map(|f| f.as_db_str().to_string()),
                    epic.created_at.to_rfc3339(),
                    epic.updated_at.to_rfc3339(),
                ],
            )
            .map_err(|e| match e {
                rusqlite::Error::SqliteFailure(err, _)
                    if err.code == rusqlite::ErrorCode::ConstraintViolation =>
                {
                    AppError::conflict(format!("epic {} already exists", epic.id))
                }
                other => AppError::internal(format!("create_epic: {other}")),
            })?;
        Ok(())
    }

    pub fn get_epic(&self, id: &EpicId) -> Result<Epic, AppError> {
        self.conn
            .query_row("SELECT * FROM epic WHERE id = ?1", params![id.0], row_to_epic)
            .optional()
            .map_err(sql_err("get_epic"))?
            .ok_or_else(|| AppError::not_found(format!("epic {id} not found")))
    }

    pub fn list_unclaimed_planning_epics(&self) -> Result<Vec<Epic>, AppError> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT * FROM epic WHERE status = 'planning' AND claimed_at IS NULL
                 ORDER BY created_at, id",
            )
            .map_err(sql_err("list_unclaimed_planning_epics prepare"))?;
        let rows = stmt
            .query_map([], row_to_epic)
            .map_err(sql_err("list_unclaimed_planning_epics query"))?;
        collect(rows)
    }

    /// Claimed `planning` epics, for the staleness sweep.
    pub fn list_claimed_planning_epics(&self) -> Result<Vec<Epic>, AppError> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT * FROM epic WHERE status = 'planning' AND claimed_at IS NOT NULL
                 ORDER BY claimed_at, id",
            )
            .map_err(sql_err("list_claimed_planning_epics prepare"))?;
        let rows = stmt
            .query_map([], row_to_epic)
            .map_err(sql_err("list_claimed_planning_epics query"))?;
        collect(rows)
    }

    pub fn list_active_epics(&self) -> Result<Vec<Epic>, AppError> {
        let mut stmt = self
            .conn
            .prepare("SELECT * FROM epic WHERE status = 'active' ORDER BY created_at, id")
            .map_err(sql_err("list_active_epics prepare"))?;
        let rows = stmt
            .query_map([], row_to_epic)
            .map_err(sql_err("list_active_epics query"))?;
        collect(rows)
    }

    /// Same atomic pattern as `try_claim_task`.
    pub fn try_claim_epic(&self, id: &EpicId, now: DateTime<Utc>) -> Result<bool, AppError> {
        let affected = self
            .conn
            .execute(
                "UPDATE epic SET claimed_at = ?2, last_heartbeat_at = ?2, updated_at = ?2
                 WHERE id = ?1 AND status = 'planning' AND claimed_at IS NULL",
                params![id.0, now.to_rfc3339()],
            )
            .map_err(sql_err("try_claim_epic"))?;
        Ok(affected == 1)
    }

    pub fn update_epic(&self, epic: &Epic) -> Result<(), AppError> {
        Self::update_epic_conn(&self.conn, epic)
    }

    /// Same update, usable against a live `rusqlite::Transaction` — see
    /// `create_task_in_transaction`.
    pub fn update_epic_in_transaction(conn: &Connection, epic: &Epic) -> Result<(), AppError> {
        Self::update_epic_conn(conn, epic)
    }

    fn update_epic_conn(conn: &Connection, epic: &Epic) -> Result<(), AppError> {
        let affected = conn
            .execute(
                "UPDATE epic SET
                    title = ?2, description = ?3, status = ?4, proposed_tasks = ?5,
                    task_ids = ?6, planning_prompt = ?7, session_log = ?8, not_ready = ?9,
                    model = ?10, claimed_at = ?11, last_heartbeat_at = ?12, feedback = ?13,
                    feedback_type = ?14, updated_at = ?15
                 WHERE id = ?1",
                params![
                    epic.id.0,
                    epic.title,
                    epic.description,
                    epic.status.as_db_str(),
                    json(&epic.proposed_tasks),
                    json(&epic.task_ids),
                    epic.planning_prompt,
                    json(&epic.session_log),
                    epic.not_ready,
                    epic.model,
                    epic.claimed_at.map(|t| t.to_rfc3339()),
                    epic.last_heartbeat_at.map(|t| t.to_rfc3339()),
                    epic.feedback,
                    epic.feedback_type.map(|f| f.as_db_str().to_string()),
                    epic.updated_at.to_rfc3339(),
                ],
            )
            .map_err(sql_err("update_epic"))?;
        if affected == 0 {
            return Err(AppError::not_found(format!("epic {} not found", epic.id)));
        }
        Ok(())
    }

    pub fn delete_epic(&self, id: &EpicId) -> Result<(), AppError> {
        let affected = self
            .conn
            .execute("DELETE FROM epic WHERE id = ?1", params![id.0])
            .map_err(sql_err("delete_epic"))?;
        if affected == 0 {
            return Err(AppError::not_found(format!("epic {id} not found")));
        }
        Ok(())
    }

    /// Runs `op` inside a SQLite transaction, rolling back on error — used
    /// by epic confirmation: if any task create fails, the whole batch rolls
    /// back along with the epic's own transition.
    pub fn with_transaction<T>(
        &mut self,
        op: impl FnOnce(&Connection) -> Result<T, AppError>,
    ) -> Result<T, AppError> {
        let tx = self.conn.transaction().map_err(sql_err("begin transaction"))?;
        let result = op(&tx)?;
        tx.commit().map_err(sql_err("commit transaction"))?;
        Ok(result)
    }
}

fn json(value: &impl serde::Serialize) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| "null".to_string())
}

fn parse_rfc3339(raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e)))
}

fn row_to_repo(row: &rusqlite::Row) -> rusqlite::Result<Repo> {
    Ok(Repo {
        id: RepoId(row.get("id")?),
        owner: row.get("owner")?,
        name: row.get("name")?,
        full_name: row.get("full_name")?,
        created_at: parse_rfc3339(&row.get::<_, String>("created_at")?)?,
    })
}

fn row_to_task(row: &rusqlite::Row) -> rusqlite::Result<Task> {
    let status_raw: String = row.get("status")?;
    let status = TaskStatus::from_db_str(&status_raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Text,
            Box::new(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("unrecognized task status '{status_raw}'"),
            )),
        )
    })?;
    let depends_on_raw: String = row.get("depends_on")?;
    let depends_on: BTreeSet<TaskId> =
        serde_json::from_str(&depends_on_raw).unwrap_or_default();
    let acceptance_raw: String = row.get("acceptance_criteria")?;
    let acceptance_criteria: Vec<String> = serde_json::from_str(&acceptance_raw).unwrap_or_default();
    let agent_status_raw: Option<String> = row.get("agent_status")?;
    let agent_status = agent_status_raw.and_then(|s| serde_json::from_str(&s).ok());
    let started_at_raw: Option<String> = row.get("started_at")?;
    let last_heartbeat_raw: Option<String> = row.get("last_heartbeat_at")?;

    Ok(Task {
        id: TaskId(row.get("id")?),
        repo_id: RepoId(row.get("repo_id")?),
        title: row.get("title")?,
        description: row.get("description")?,
        acceptance_criteria,
        status,
        depends_on,
        ready: row.get("ready")?,
        attempt: row.get("attempt")?,
        max_attempts: row.get("max_attempts")?,
        consecutive_failures: row.get("consecutive_failures")?,
        branch_name: row.get("branch_name")?,
        pr_url: row.get("pr_url")?,
        pr_number: row.get::<_, Option<i64>>("pr_number")?.map(|n| n as u64),
        retry_reason: row.get("retry_reason")?,
        retry_context: row.get("retry_context")?,
        close_reason: row.get("close_reason")?,
        agent_status,
        started_at: started_at_raw.map(|s| parse_rfc3339(&s)).transpose()?,
        last_heartbeat_at: last_heartbeat_raw.map(|s| parse_rfc3339(&s)).transpose()?,
        cost_usd: row.get("cost_usd")?,
        max_cost_usd: row.get("max_cost_usd")?,
        model: row.get("model")?,
        skip_pr: row.get("skip_pr")?,
        epic_id: row.get::<_, Option<String>>("epic_id")?.map(EpicId),
        created_at: parse_rfc3339(&row.get::<_, String>("created_at")?)?,
        updated_at: parse_rfc3339(&row.get::<_, String>("updated_at")?)?,
    })
}

fn row_to_log(row: &rusqlite::Row) -> rusqlite::Result<TaskLogRecord> {
    let lines_raw: String = row.get("lines")?;
    Ok(TaskLogRecord {
        id: row.get("id")?,
        task_id: TaskId(row.get("task_id")?),
        attempt: row.get("attempt")?,
        lines: serde_json::from_str(&lines_raw).unwrap_or_default(),
        created_at: parse_rfc3339(&row.get::<_, String>("created_at")?)?,
    })
}

fn row_to_epic(row: &rusqlite::Row) -> rusqlite::Result<Epic> {
    let status_raw: String = row.get("status")?;
    let status = EpicStatus::from_db_str(&status_raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Text,
            Box::new(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("unrecognized epic status '{status_raw}'"),
            )),
        )
    })?;
    let proposed_raw: String = row.get("proposed_tasks")?;
    let proposed_tasks: Vec<ProposedTask> = serde_json::from_str(&proposed_raw).unwrap_or_default();
    let task_ids_raw: String = row.get("task_ids")?;
    let task_ids: Vec<TaskId> = serde_json::from_str(&task_ids_raw).unwrap_or_default();
    let session_log_raw: String = row.get("session_log")?;
    let session_log: Vec<String> = serde_json::from_str(&session_log_raw).unwrap_or_default();
    let feedback_type_raw: Option<String> = row.get("feedback_type")?;
    let claimed_at_raw: Option<String> = row.get("claimed_at")?;
    let last_heartbeat_raw: Option<String> = row.get("last_heartbeat_at")?;

    Ok(Epic {
        id: EpicId(row.get("id")?),
        repo_id: RepoId(row.get("repo_id")?),
        title: row.get("title")?,
        description: row.get("description")?,
        status,
        proposed_tasks,
        planning_prompt: row.get("planning_prompt")?,
        session_log,
        task_ids,
        claimed_at: claimed_at_raw.map(|s| parse_rfc3339(&s)).transpose()?,
        last_heartbeat_at: last_heartbeat_raw.map(|s| parse_rfc3339(&s)).transpose()?,
        feedback: row.get("feedback")?,
        feedback_type: feedback_type_raw.and_then(|s| FeedbackType::from_db_str(&s)),
        not_ready: row.get("not_ready")?,
        model: row.get("model")?,
        created_at: parse_rfc3339(&row.get::<_, String>("created_at")?)?,
        updated_at: parse_rfc3339(&row.get::<_, String>("updated_at")?)?,
    })
}

fn collect<T>(
    rows: rusqlite::MappedRows<impl FnMut(&rusqlite::Row) -> rusqlite::Result<T>>,
) -> Result<Vec<T>, AppError> {
    rows.collect::<Result<Vec<T>, rusqlite::Error>>()
        .map_err(sql_err("collect rows"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn sample_repo() -> Repo {
        Repo {
            id: RepoId::new("acme-api"),
            owner: "acme".to_string(),
            name: "api".to_string(),
            full_name: "acme/api".to_string(),
            created_at: Utc::now(),
        }
    }

    fn sample_task(repo_id: &RepoId, suffix: &str) -> Task {
        let now = Utc::now();
        Task {
            id: TaskId::new(suffix),
            repo_id: repo_id.clone(),
            title: "add health endpoint".to_string(),
            description: "expose /health".to_string(),
            acceptance_criteria: vec!["returns 200".to_string()],
            status: TaskStatus::Pending,
            depends_on: BTreeSet::new(),
            ready: true,
            attempt: 1,
            max_attempts: 3,
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
            model: "default".to_string(),
            skip_pr: false,
            epic_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn create_and_get_repo_roundtrips() {
        let store = SqliteStore::open_in_memory().unwrap();
        let repo = sample_repo();
        store.create_repo(&repo).unwrap();
        let loaded = store.get_repo(&repo.id).unwrap();
        assert_eq!(loaded.full_name, "acme/api");
    }

    #[test]
    fn duplicate_repo_full_name_conflicts() {
        let store = SqliteStore::open_in_memory().unwrap();
        let repo = sample_repo();
        store.create_repo(&repo).unwrap();
        let mut dup = sample_repo();
        dup.id = RepoId::new("other");
        let err = store.create_repo(&dup).unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));
    }

    #[test]
    fn delete_repo_with_tasks_is_refused() {
        let store = SqliteStore::open_in_memory().unwrap();
        let repo = sample_repo();
        store.create_repo(&repo).unwrap();
        let task = sample_task(&repo.id, "t1");
        store.create_task(&task).unwrap();
        let err = store.delete_repo(&repo.id).unwrap_err();
        assert!(matches!(err, AppError::Precondition(_)));
    }

    #[test]
    fn create_and_get_task_roundtrips() {
        let store = SqliteStore::open_in_memory().unwrap();
        let repo = sample_repo();
        store.create_repo(&repo).unwrap();
        let task = sample_task(&repo.id, "t1");
        store.create_task(&task).unwrap();
        let loaded = store.get_task(&task.id).unwrap();
        assert_eq!(loaded.title, task.title);
        assert_eq!(loaded.status, TaskStatus::Pending);
    }

    #[test]
    fn claim_only_succeeds_once() {
        let store = SqliteStore::open_in_memory().unwrap();
        let repo = sample_repo();
        store.create_repo(&repo).unwrap();
        let task = sample_task(&repo.id, "t1");
        store.create_task(&task).unwrap();

        let now = Utc::now();
        assert!(store.try_claim_task(&task.id, now).unwrap());
        assert!(!store.try_claim_task(&task.id, now).unwrap());

        let loaded = store.get_task(&task.id).unwrap();
        assert_eq!(loaded.status, TaskStatus::Running);
        assert!(loaded.started_at.is_some());
    }

    #[test]
    fn claim_ignores_not_ready_tasks() {
        let store = SqliteStore::open_in_memory().unwrap();
        let repo = sample_repo();
        store.create_repo(&repo).unwrap();
        let mut task = sample_task(&repo.id, "t1");
        task.ready = false;
        store.create_task(&task).unwrap();
        assert!(!store.try_claim_task(&task.id, Utc::now()).unwrap());
    }

    #[test]
    fn list_pending_ready_tasks_orders_by_created_at_then_id() {
        let store = SqliteStore::open_in_memory().unwrap();
        let repo = sample_repo();
        store.create_repo(&repo).unwrap();
        let mut t1 = sample_task(&repo.id, "b");
        let mut t2 = sample_task(&repo.id, "a");
        t1.created_at = Utc::now();
        t2.created_at = t1.created_at;
        store.create_task(&t1).unwrap();
        store.create_task(&t2).unwrap();
        let pending = store.list_pending_ready_tasks(None).unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].id, t2.id);
        assert_eq!(pending[1].id, t1.id);
    }

    #[test]
    fn append_and_list_task_logs() {
        let store = SqliteStore::open_in_memory().unwrap();
        let repo = sample_repo();
        store.create_repo(&repo).unwrap();
        let task = sample_task(&repo.id, "t1");
        store.create_task(&task).unwrap();
        store
            .append_task_log(&task.id, 1, &["line one".to_string()], Utc::now())
            .unwrap();
        store
            .append_task_log(&task.id, 1, &["line two".to_string()], Utc::now())
            .unwrap();
        let logs = store.list_task_logs(&task.id).unwrap();
        assert_eq!(logs.len(), 2);
        assert_eq!(logs[0].lines, vec!["line one".to_string()]);
    }

    #[test]
    fn delete_task_cascades_logs() {
        let store = SqliteStore::open_in_memory().unwrap();
        let repo = sample_repo();
        store.create_repo(&repo).unwrap();
        let task = sample_task(&repo.id, "t1");
        store.create_task(&task).unwrap();
        store
            .append_task_log(&task.id, 1, &["line".to_string()], Utc::now())
            .unwrap();
        store.delete_task(&task.id).unwrap();
        assert!(store.get_task(&task.id).is_err());
        assert_eq!(store.list_task_logs(&task.id).unwrap().len(), 0);
    }

    #[test]
    fn list_review_tasks_with_pr_excludes_zero_pr_number() {
        let store = SqliteStore::open_in_memory().unwrap();
        let repo = sample_repo();
        store.create_repo(&repo).unwrap();

        let mut zero_pr = sample_task(&repo.id, "t1");
        zero_pr.status = TaskStatus::Review;
        zero_pr.pr_number = Some(0);
        store.create_task(&zero_pr).unwrap();

        let mut real_pr = sample_task(&repo.id, "t2");
        real_pr.status = TaskStatus::Review;
        real_pr.pr_number = Some(7);
        store.create_task(&real_pr).unwrap();

        let candidates = store.list_review_tasks_with_pr().unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].id, real_pr.id);
    }

    #[test]
    fn file_backed_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("verve.sqlite3");
        let repo = sample_repo();
        {
            let store = SqliteStore::open(&path).unwrap();
            store.create_repo(&repo).unwrap();
            let task = sample_task(&repo.id, "t1");
            store.create_task(&task).unwrap();
        }
        let reopened = SqliteStore::open(&path).unwrap();
        assert_eq!(reopened.list_repos().unwrap().len(), 1);
        assert_eq!(reopened.list_tasks_by_repo(&repo.id).unwrap().len(), 1);
    }
}
