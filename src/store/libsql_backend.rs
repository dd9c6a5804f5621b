//! libSQL backend — `TaskSource` and `EventSink` over a local database.
//!
//! Supports local file and in-memory databases. The queue lives in the
//! `todolist` table; participants in `users`; form definitions in
//! `form_def`; emitted events in `events`.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::events::CrewEvent;
use crate::store::migrations;
use crate::store::retry::{RetryPolicy, with_retry};
use crate::store::traits::{EventSink, TaskSource};
use crate::tasks::model::{
    AgentInfo, FormType, ParticipantsInfo, Task, TaskId, TaskStatus, UserInfo,
};

/// Prefix some tool values carry in front of the form id.
const FORM_HANDLER_PREFIX: &str = "formHandler:";

const TASK_COLUMNS: &str = "id, proc_inst_id, root_proc_inst_id, activity_name, description, user_id, tool, tenant_id, draft_status, consumer";

const AGENT_COLUMNS: &str = "id, username, role, goal, persona, tools, profile, model, tenant_id";

const EVENT_COLUMNS: &str = "id, job_id, todo_id, proc_inst_id, event_type, crew_type, data, timestamp";

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
    consumer_id: String,
    retry: RetryPolicy,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let backend = Self::from_database(db)?;
        backend.init_schema().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let backend = Self::from_database(db)?;
        backend.init_schema().await?;
        Ok(backend)
    }

    fn from_database(db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;
        Ok(Self {
            db: Arc::new(db),
            conn,
            consumer_id: "supervisor".to_string(),
            retry: RetryPolicy::default(),
        })
    }

    /// Builder: identity written into the `consumer` column when claiming.
    pub fn with_consumer_id(mut self, consumer_id: impl Into<String>) -> Self {
        self.consumer_id = consumer_id.into();
        self
    }

    /// Builder: retry policy for queue fetches and status polls.
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Verify the connection answers a trivial query.
    pub async fn ping(&self) -> Result<(), DatabaseError> {
        let mut rows = self
            .conn()
            .query("SELECT 1", ())
            .await
            .map_err(|e| DatabaseError::Pool(format!("ping: {e}")))?;
        rows.next()
            .await
            .map_err(|e| DatabaseError::Pool(format!("ping row: {e}")))?;
        Ok(())
    }

    /// Return this consumer's pending claims to the shared queue.
    ///
    /// Claims survive a crash mid-task; clearing them on startup lets any
    /// supervisor pick the rows up again. Returns the number of rows released.
    pub async fn release_stale_claims(&self) -> Result<u64, DatabaseError> {
        let now = Utc::now().to_rfc3339();
        let released = self
            .conn()
            .execute(
                "UPDATE todolist SET consumer = NULL, updated_at = ?1
                 WHERE consumer = ?2 AND draft_status = 'PENDING'",
                params![now, self.consumer_id.as_str()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("release_stale_claims: {e}")))?;
        if released > 0 {
            info!(consumer = %self.consumer_id, released, "Released stale task claims");
        }
        Ok(released)
    }

    async fn init_schema(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }

    // ── Queue administration ────────────────────────────────────────

    /// Insert a task row. Its status is taken from `task.status`.
    pub async fn enqueue_task(&self, task: &Task) -> Result<(), DatabaseError> {
        let now = Utc::now().to_rfc3339();
        self.conn()
            .execute(
                "INSERT INTO todolist (id, proc_inst_id, root_proc_inst_id, activity_name, description, user_id, tool, tenant_id, draft_status, consumer, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                params![
                    task.id.as_str(),
                    opt_text(task.proc_inst_id.as_deref()),
                    opt_text(task.root_proc_inst_id.as_deref()),
                    opt_text(task.activity_name.as_deref()),
                    opt_text(task.description.as_deref()),
                    opt_text(task.user_ids.as_deref()),
                    opt_text(task.tool.as_deref()),
                    opt_text(task.tenant_id.as_deref()),
                    task.status.as_str(),
                    opt_text(task.consumer.as_deref()),
                    now.as_str(),
                    now.as_str(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("enqueue_task: {e}")))?;
        debug!(task_id = %task.id, "Task enqueued");
        Ok(())
    }

    /// Get a task row by id.
    pub async fn get_task(&self, id: &TaskId) -> Result<Option<Task>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {TASK_COLUMNS} FROM todolist WHERE id = ?1"),
                params![id.as_str()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_task: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_task(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_task row: {e}"))),
        }
    }

    /// Overwrite a task's status (what cancelling clients do).
    pub async fn set_task_status(
        &self,
        id: &TaskId,
        status: &TaskStatus,
    ) -> Result<(), DatabaseError> {
        let now = Utc::now().to_rfc3339();
        let changed = self
            .conn()
            .execute(
                "UPDATE todolist SET draft_status = ?1, updated_at = ?2 WHERE id = ?3",
                params![status.as_str(), now, id.as_str()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("set_task_status: {e}")))?;
        ensure_changed(changed, id)
    }

    /// Store a task's output object (`{activity_name: output}`).
    pub async fn set_task_output(&self, id: &TaskId, output: &Value) -> Result<(), DatabaseError> {
        let json = serde_json::to_string(output)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
        let now = Utc::now().to_rfc3339();
        let changed = self
            .conn()
            .execute(
                "UPDATE todolist SET output = ?1, updated_at = ?2 WHERE id = ?3",
                params![json, now, id.as_str()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("set_task_output: {e}")))?;
        ensure_changed(changed, id)
    }

    /// Insert or replace a human participant.
    pub async fn upsert_user(&self, id: &str, user: &UserInfo) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT OR REPLACE INTO users (id, email, username, is_agent, tenant_id) VALUES (?1, ?2, ?3, 0, ?4)",
                params![
                    id,
                    opt_text(user.email.as_deref()),
                    opt_text(user.name.as_deref()),
                    opt_text(user.tenant_id.as_deref()),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("upsert_user: {e}")))?;
        Ok(())
    }

    /// Insert or replace an agent participant.
    pub async fn upsert_agent(&self, agent: &AgentInfo) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT OR REPLACE INTO users (id, username, role, goal, persona, tools, profile, model, tenant_id, is_agent)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 1)",
                params![
                    agent.id.as_str(),
                    opt_text(agent.name.as_deref()),
                    opt_text(agent.role.as_deref()),
                    opt_text(agent.goal.as_deref()),
                    opt_text(agent.persona.as_deref()),
                    opt_text(agent.tools.as_deref()),
                    opt_text(agent.profile.as_deref()),
                    opt_text(agent.model.as_deref()),
                    opt_text(agent.tenant_id.as_deref()),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("upsert_agent: {e}")))?;
        Ok(())
    }

    /// Insert or replace a form definition.
    pub async fn upsert_form(
        &self,
        form_id: &str,
        tenant_id: &str,
        fields: Option<&Value>,
    ) -> Result<(), DatabaseError> {
        let fields_json = fields
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
        self.conn()
            .execute(
                "INSERT OR REPLACE INTO form_def (id, tenant_id, fields_json) VALUES (?1, ?2, ?3)",
                params![form_id, tenant_id, opt_text_owned(fields_json)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("upsert_form: {e}")))?;
        Ok(())
    }

    /// Events recorded for a task, oldest first.
    pub async fn events_for_task(&self, id: &TaskId) -> Result<Vec<CrewEvent>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {EVENT_COLUMNS} FROM events WHERE todo_id = ?1 ORDER BY timestamp ASC, rowid ASC"),
                params![id.as_str()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("events_for_task: {e}")))?;

        let mut events = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("events_for_task row: {e}")))?
        {
            events.push(row_to_event(&row)?);
        }
        Ok(events)
    }

    // ── Raw queries (wrapped with retry in the trait impl) ──────────

    /// Claim the oldest pending row, preferring rows this consumer already
    /// holds. Re-running after a lost response or a restart returns the same
    /// row instead of claiming another one.
    async fn claim_next_pending(&self) -> Result<Option<Task>, DatabaseError> {
        let now = Utc::now().to_rfc3339();
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "UPDATE todolist SET consumer = ?1, updated_at = ?2
                     WHERE id = (
                         SELECT id FROM todolist
                         WHERE draft_status = 'PENDING'
                           AND (consumer IS NULL OR consumer = ?1)
                         ORDER BY consumer IS NULL, created_at ASC, rowid ASC
                         LIMIT 1
                     )
                     RETURNING {TASK_COLUMNS}"
                ),
                params![self.consumer_id.as_str(), now],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("fetch_pending_task: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_task(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("fetch_pending_task row: {e}"))),
        }
    }

    async fn query_status(&self, id: &TaskId) -> Result<Option<TaskStatus>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT draft_status FROM todolist WHERE id = ?1",
                params![id.as_str()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("fetch_task_status: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let status: String = row
                    .get(0)
                    .map_err(|e| DatabaseError::Query(format!("todolist.draft_status: {e}")))?;
                Ok(Some(TaskStatus::parse(&status)))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("fetch_task_status row: {e}"))),
        }
    }

    async fn find_user_by_email(&self, email: &str) -> Result<Option<UserInfo>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT email, username, tenant_id FROM users WHERE email = ?1 LIMIT 1",
                params![email],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("find_user_by_email: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(UserInfo {
                email: row.get::<String>(0).ok(),
                name: row.get::<String>(1).ok(),
                tenant_id: row.get::<String>(2).ok(),
            })),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("find_user_by_email row: {e}"))),
        }
    }

    async fn find_agent_by_id(&self, id: &str) -> Result<Option<AgentInfo>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {AGENT_COLUMNS} FROM users WHERE id = ?1 AND is_agent = 1"),
                params![id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("find_agent_by_id: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(AgentInfo {
                id: row
                    .get(0)
                    .map_err(|e| DatabaseError::Query(format!("users.id: {e}")))?,
                name: row.get::<String>(1).ok(),
                role: row.get::<String>(2).ok(),
                goal: row.get::<String>(3).ok(),
                persona: row.get::<String>(4).ok(),
                tools: row.get::<String>(5).ok(),
                profile: row.get::<String>(6).ok(),
                model: row.get::<String>(7).ok(),
                tenant_id: row.get::<String>(8).ok(),
            })),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("find_agent_by_id row: {e}"))),
        }
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Convert `Option<&str>` to libsql Value.
fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

/// Convert `Option<String>` to libsql Value.
fn opt_text_owned(s: Option<String>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s),
        None => libsql::Value::Null,
    }
}

fn ensure_changed(changed: u64, id: &TaskId) -> Result<(), DatabaseError> {
    if changed == 0 {
        return Err(DatabaseError::NotFound {
            entity: "task".to_string(),
            id: id.to_string(),
        });
    }
    Ok(())
}

/// Parse an RFC 3339 timestamp, falling back to the epoch.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Map a libsql Row (TASK_COLUMNS order) to a Task.
fn row_to_task(row: &libsql::Row) -> Result<Task, DatabaseError> {
    let id: String = row
        .get(0)
        .map_err(|e| DatabaseError::Query(format!("todolist.id: {e}")))?;
    let status: String = row.get(8).unwrap_or_else(|_| "PENDING".to_string());

    Ok(Task {
        id: TaskId::from(id),
        status: TaskStatus::parse(&status),
        proc_inst_id: row.get::<String>(1).ok(),
        root_proc_inst_id: row.get::<String>(2).ok(),
        activity_name: row.get::<String>(3).ok(),
        description: row.get::<String>(4).ok(),
        user_ids: row.get::<String>(5).ok(),
        tool: row.get::<String>(6).ok(),
        tenant_id: row.get::<String>(7).ok(),
        consumer: row.get::<String>(9).ok(),
    })
}

/// Map a libsql Row (EVENT_COLUMNS order) to a CrewEvent.
fn row_to_event(row: &libsql::Row) -> Result<CrewEvent, DatabaseError> {
    let id_str: String = row
        .get(0)
        .map_err(|e| DatabaseError::Query(format!("events.id: {e}")))?;
    let id = Uuid::parse_str(&id_str)
        .map_err(|e| DatabaseError::Query(format!("events.id parse: {e}")))?;
    let data_str: String = row.get(6).unwrap_or_else(|_| "{}".to_string());
    let timestamp: String = row.get(7).unwrap_or_default();

    Ok(CrewEvent {
        id,
        job_id: row.get(1).unwrap_or_default(),
        todo_id: row.get::<String>(2).ok().map(TaskId::from),
        proc_inst_id: row.get::<String>(3).ok(),
        event_type: row.get(4).unwrap_or_default(),
        crew_type: row.get(5).unwrap_or_default(),
        data: serde_json::from_str(&data_str).unwrap_or(Value::Null),
        timestamp: parse_datetime(&timestamp),
    })
}

/// Form id a tool value refers to.
pub fn form_id_from_tool(tool: &str) -> &str {
    tool.strip_prefix(FORM_HANDLER_PREFIX).unwrap_or(tool)
}

/// Normalize a form's `fields_json` into worker-facing form types.
///
/// `report` and `slide` fields keep their type; everything else becomes
/// `text`. A form without fields yields a single default entry.
pub fn normalize_form_fields(form_id: &str, fields: Option<&Value>) -> Vec<FormType> {
    let entries = match fields.and_then(Value::as_array) {
        Some(entries) if !entries.is_empty() => entries,
        _ => return vec![FormType::default_for(form_id)],
    };

    entries
        .iter()
        .map(|field| {
            let key = field.get("key").and_then(Value::as_str).map(str::to_string);
            let declared = field
                .get("type")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_lowercase();
            let kind = match declared.as_str() {
                "report" | "slide" => declared,
                _ => "text".to_string(),
            };
            FormType {
                id: key.clone(),
                kind,
                key,
                text: Some(
                    field
                        .get("text")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                ),
            }
        })
        .collect()
}

/// Merge stage outputs (`{activity_name: output}` objects) into one map.
///
/// Later outputs win on duplicate activity names. Non-object outputs are
/// ignored.
fn merge_outputs(outputs: impl IntoIterator<Item = Value>) -> Map<String, Value> {
    let mut merged = Map::new();
    for output in outputs {
        if let Value::Object(entries) = output {
            for (activity, value) in entries {
                merged.insert(activity, value);
            }
        }
    }
    merged
}

// ── Trait implementations ───────────────────────────────────────────

#[async_trait]
impl TaskSource for LibSqlBackend {
    async fn fetch_pending_task(&self) -> Result<Option<Task>, DatabaseError> {
        let task = with_retry("fetch_pending_task", self.retry, || self.claim_next_pending()).await?;
        if let Some(ref task) = task {
            debug!(task_id = %task.id, consumer = %self.consumer_id, "Claimed pending task");
        }
        Ok(task)
    }

    async fn fetch_task_status(&self, id: &TaskId) -> Result<Option<TaskStatus>, DatabaseError> {
        with_retry("fetch_task_status", self.retry, || self.query_status(id)).await
    }

    async fn update_task_completed(&self, id: &TaskId) -> Result<(), DatabaseError> {
        let now = Utc::now().to_rfc3339();
        let changed = self
            .conn()
            .execute(
                "UPDATE todolist SET draft_status = 'COMPLETED', consumer = NULL, updated_at = ?1 WHERE id = ?2",
                params![now, id.as_str()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("update_task_completed: {e}")))?;
        ensure_changed(changed, id)?;
        info!(task_id = %id, "Task marked completed");
        Ok(())
    }

    async fn release_task(&self, id: &TaskId) -> Result<(), DatabaseError> {
        let now = Utc::now().to_rfc3339();
        self.conn()
            .execute(
                "UPDATE todolist SET consumer = NULL, updated_at = ?1 WHERE id = ?2 AND consumer = ?3",
                params![now, id.as_str(), self.consumer_id.as_str()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("release_task: {e}")))?;
        debug!(task_id = %id, "Task claim released");
        Ok(())
    }

    async fn fetch_previous_output(
        &self,
        proc_inst_id: &str,
    ) -> Result<Map<String, Value>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT output FROM todolist
                 WHERE (proc_inst_id = ?1 OR root_proc_inst_id = ?1)
                   AND draft_status = 'COMPLETED'
                   AND output IS NOT NULL
                 ORDER BY updated_at ASC, rowid ASC",
                params![proc_inst_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("fetch_previous_output: {e}")))?;

        let mut outputs = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("fetch_previous_output row: {e}")))?
        {
            let raw: String = row.get(0).unwrap_or_default();
            match serde_json::from_str::<Value>(&raw) {
                Ok(value) => outputs.push(value),
                Err(e) => warn!(proc_inst_id, error = %e, "Skipping unparseable stage output"),
            }
        }
        Ok(merge_outputs(outputs))
    }

    async fn fetch_participants_info(
        &self,
        user_ids: &str,
    ) -> Result<ParticipantsInfo, DatabaseError> {
        let mut info = ParticipantsInfo::default();
        for id in user_ids.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            if let Some(user) = self.find_user_by_email(id).await? {
                info.user_info.push(user);
                continue;
            }
            if let Some(agent) = self.find_agent_by_id(id).await? {
                info.agent_info.push(agent);
            }
        }
        debug!(
            users = info.user_info.len(),
            agents = info.agent_info.len(),
            "Resolved participants"
        );
        Ok(info)
    }

    async fn fetch_form_types(
        &self,
        tool: &str,
        tenant_id: &str,
    ) -> Result<(String, Vec<FormType>), DatabaseError> {
        let form_id = form_id_from_tool(tool).to_string();
        let mut rows = self
            .conn()
            .query(
                "SELECT fields_json FROM form_def WHERE id = ?1 AND tenant_id = ?2",
                params![form_id.as_str(), tenant_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("fetch_form_types: {e}")))?;

        let fields_json: Option<String> = match rows.next().await {
            Ok(Some(row)) => row.get::<String>(0).ok(),
            Ok(None) => None,
            Err(e) => return Err(DatabaseError::Query(format!("fetch_form_types row: {e}"))),
        };

        let fields = fields_json
            .filter(|s| !s.trim().is_empty())
            .map(|s| serde_json::from_str::<Value>(&s))
            .transpose()
            .map_err(|e| DatabaseError::Serialization(format!("form_def.fields_json: {e}")))?;

        let form_types = normalize_form_fields(&form_id, fields.as_ref());
        Ok((form_id, form_types))
    }
}

#[async_trait]
impl EventSink for LibSqlBackend {
    async fn emit_event(&self, event: &CrewEvent) -> Result<(), DatabaseError> {
        let data = serde_json::to_string(&event.data)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
        self.conn()
            .execute(
                &format!("INSERT INTO events ({EVENT_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"),
                params![
                    event.id.to_string(),
                    event.job_id.as_str(),
                    opt_text(event.todo_id.as_ref().map(TaskId::as_str)),
                    opt_text(event.proc_inst_id.as_deref()),
                    event.event_type.as_str(),
                    event.crew_type.as_str(),
                    data,
                    event.timestamp.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("emit_event: {e}")))?;
        debug!(event_type = %event.event_type, todo_id = ?event.todo_id, "Event recorded");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn test_db() -> LibSqlBackend {
        LibSqlBackend::new_memory()
            .await
            .unwrap()
            .with_consumer_id("test-host")
            .with_retry_policy(RetryPolicy::none())
    }

    fn agent(id: &str, tools: Option<&str>) -> AgentInfo {
        AgentInfo {
            id: id.to_string(),
            name: Some(format!("agent-{id}")),
            role: Some("researcher".into()),
            goal: None,
            persona: None,
            tools: tools.map(str::to_string),
            profile: None,
            model: Some("gpt-4o".into()),
            tenant_id: Some("t1".into()),
        }
    }

    // ── Queue ───────────────────────────────────────────────────────

    #[tokio::test]
    async fn fetch_pending_claims_oldest_task() {
        let db = test_db().await;
        db.enqueue_task(&Task::new("a")).await.unwrap();
        db.enqueue_task(&Task::new("b")).await.unwrap();

        let first = db.fetch_pending_task().await.unwrap().unwrap();
        assert_eq!(first.id, TaskId::from("a"));
        assert_eq!(first.consumer.as_deref(), Some("test-host"));

        db.update_task_completed(&first.id).await.unwrap();
        let second = db.fetch_pending_task().await.unwrap().unwrap();
        assert_eq!(second.id, TaskId::from("b"));

        db.update_task_completed(&second.id).await.unwrap();
        assert!(db.fetch_pending_task().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn repeated_fetch_returns_held_claim() {
        let db = test_db().await;
        db.enqueue_task(&Task::new("a")).await.unwrap();
        db.enqueue_task(&Task::new("b")).await.unwrap();

        let first = db.fetch_pending_task().await.unwrap().unwrap();
        let again = db.fetch_pending_task().await.unwrap().unwrap();
        assert_eq!(again.id, first.id);

        let b = db.get_task(&TaskId::from("b")).await.unwrap().unwrap();
        assert!(b.consumer.is_none());
    }

    #[tokio::test]
    async fn claim_held_by_other_consumer_is_skipped() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("queue.db");
        let host_a = LibSqlBackend::new_local(&path)
            .await
            .unwrap()
            .with_consumer_id("host-a");
        let host_b = LibSqlBackend::new_local(&path)
            .await
            .unwrap()
            .with_consumer_id("host-b");
        host_a.enqueue_task(&Task::new("a")).await.unwrap();
        host_a.fetch_pending_task().await.unwrap().unwrap();

        assert!(host_b.fetch_pending_task().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn restart_recovers_claim_left_by_crash() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("queue.db");

        {
            let db = LibSqlBackend::new_local(&path)
                .await
                .unwrap()
                .with_consumer_id("host-a");
            db.enqueue_task(&Task::new("t1")).await.unwrap();
            let claimed = db.fetch_pending_task().await.unwrap().unwrap();
            assert_eq!(claimed.id, TaskId::from("t1"));
        }

        let db = LibSqlBackend::new_local(&path)
            .await
            .unwrap()
            .with_consumer_id("host-a");
        let again = db.fetch_pending_task().await.unwrap().unwrap();
        assert_eq!(again.id, TaskId::from("t1"));
        assert_eq!(again.status, TaskStatus::Pending);
    }

    #[tokio::test]
    async fn release_stale_claims_frees_only_own_pending_rows() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("queue.db");

        {
            let db = LibSqlBackend::new_local(&path)
                .await
                .unwrap()
                .with_consumer_id("host-a");
            db.enqueue_task(&Task::new("mine")).await.unwrap();
            db.fetch_pending_task().await.unwrap().unwrap();
        }
        {
            let db = LibSqlBackend::new_local(&path)
                .await
                .unwrap()
                .with_consumer_id("host-b");
            db.enqueue_task(&Task::new("theirs")).await.unwrap();
            db.fetch_pending_task().await.unwrap().unwrap();
        }

        let db = LibSqlBackend::new_local(&path)
            .await
            .unwrap()
            .with_consumer_id("host-a");
        assert_eq!(db.release_stale_claims().await.unwrap(), 1);
        assert_eq!(db.release_stale_claims().await.unwrap(), 0);

        let mine = db.get_task(&TaskId::from("mine")).await.unwrap().unwrap();
        assert!(mine.consumer.is_none());
        let theirs = db.get_task(&TaskId::from("theirs")).await.unwrap().unwrap();
        assert_eq!(theirs.consumer.as_deref(), Some("host-b"));
    }

    #[tokio::test]
    async fn fetch_pending_skips_non_pending() {
        let db = test_db().await;
        let mut done = Task::new("done");
        done.status = TaskStatus::Completed;
        db.enqueue_task(&done).await.unwrap();
        let mut cancelled = Task::new("cancelled");
        cancelled.status = TaskStatus::Cancelled;
        db.enqueue_task(&cancelled).await.unwrap();

        assert!(db.fetch_pending_task().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn fetch_pending_returns_row_fields() {
        let db = test_db().await;
        let task = Task::new("42")
            .with_proc_inst_id("P1")
            .with_activity_name("draft")
            .with_description("Write the 보고서")
            .with_tool("formHandler:report_form")
            .with_tenant_id("t1");
        db.enqueue_task(&task).await.unwrap();

        let fetched = db.fetch_pending_task().await.unwrap().unwrap();
        assert_eq!(fetched.proc_inst_id.as_deref(), Some("P1"));
        assert_eq!(fetched.activity_name.as_deref(), Some("draft"));
        assert_eq!(fetched.description.as_deref(), Some("Write the 보고서"));
        assert_eq!(fetched.tool.as_deref(), Some("formHandler:report_form"));
        assert!(fetched.user_ids.is_none());
        assert_eq!(fetched.status, TaskStatus::Pending);
    }

    #[tokio::test]
    async fn status_roundtrip() {
        let db = test_db().await;
        let id = TaskId::from("7");
        db.enqueue_task(&Task::new("7")).await.unwrap();
        assert_eq!(
            db.fetch_task_status(&id).await.unwrap(),
            Some(TaskStatus::Pending)
        );

        db.set_task_status(&id, &TaskStatus::FeedbackRequested)
            .await
            .unwrap();
        assert_eq!(
            db.fetch_task_status(&id).await.unwrap(),
            Some(TaskStatus::FeedbackRequested)
        );
    }

    #[tokio::test]
    async fn status_of_missing_task_is_none() {
        let db = test_db().await;
        assert!(db
            .fetch_task_status(&TaskId::from("nope"))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn update_completed_clears_claim() {
        let db = test_db().await;
        db.enqueue_task(&Task::new("1")).await.unwrap();
        let task = db.fetch_pending_task().await.unwrap().unwrap();

        db.update_task_completed(&task.id).await.unwrap();

        let stored = db.get_task(&task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Completed);
        assert!(stored.consumer.is_none());
    }

    #[tokio::test]
    async fn update_completed_missing_task_errors() {
        let db = test_db().await;
        let result = db.update_task_completed(&TaskId::from("ghost")).await;
        assert!(matches!(result, Err(DatabaseError::NotFound { .. })));
    }

    #[tokio::test]
    async fn release_makes_task_fetchable_again() {
        let db = test_db().await;
        db.enqueue_task(&Task::new("1")).await.unwrap();
        let task = db.fetch_pending_task().await.unwrap().unwrap();

        db.release_task(&task.id).await.unwrap();
        let released = db.get_task(&task.id).await.unwrap().unwrap();
        assert!(released.consumer.is_none());

        let again = db.fetch_pending_task().await.unwrap().unwrap();
        assert_eq!(again.id, task.id);
        assert_eq!(again.status, TaskStatus::Pending);
    }

    // ── Lookups ─────────────────────────────────────────────────────

    #[tokio::test]
    async fn previous_output_merges_completed_stages() {
        let db = test_db().await;
        for (id, output) in [
            ("s1", json!({"collect": {"rows": 3}})),
            ("s2", json!({"analyze": "중간 결과"})),
        ] {
            let mut task = Task::new(id).with_proc_inst_id("P1");
            task.status = TaskStatus::Completed;
            db.enqueue_task(&task).await.unwrap();
            db.set_task_output(&TaskId::from(id), &output).await.unwrap();
        }
        // Unfinished stage and other process are ignored
        db.enqueue_task(&Task::new("s3").with_proc_inst_id("P1"))
            .await
            .unwrap();
        db.set_task_output(&TaskId::from("s3"), &json!({"draft": "wip"}))
            .await
            .unwrap();
        let mut other = Task::new("o1").with_proc_inst_id("P2");
        other.status = TaskStatus::Completed;
        db.enqueue_task(&other).await.unwrap();
        db.set_task_output(&TaskId::from("o1"), &json!({"x": 1}))
            .await
            .unwrap();

        let outputs = db.fetch_previous_output("P1").await.unwrap();
        assert_eq!(outputs.len(), 2);
        assert_eq!(outputs["collect"], json!({"rows": 3}));
        assert_eq!(outputs["analyze"], json!("중간 결과"));
    }

    #[tokio::test]
    async fn previous_output_empty_for_unknown_process() {
        let db = test_db().await;
        assert!(db.fetch_previous_output("none").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn participants_split_users_and_agents() {
        let db = test_db().await;
        db.upsert_user(
            "u1",
            &UserInfo {
                email: Some("kim@example.com".into()),
                name: Some("Kim".into()),
                tenant_id: Some("t1".into()),
            },
        )
        .await
        .unwrap();
        db.upsert_agent(&agent("a1", Some("mem0,perplexity")))
            .await
            .unwrap();
        db.upsert_agent(&agent("a2", None)).await.unwrap();

        let info = db
            .fetch_participants_info(" kim@example.com , a1,a2, unknown ,")
            .await
            .unwrap();
        assert_eq!(info.user_info.len(), 1);
        assert_eq!(info.user_info[0].name.as_deref(), Some("Kim"));
        assert_eq!(info.agent_info.len(), 2);
        assert_eq!(info.primary_tools().as_deref(), Some("mem0,perplexity"));
    }

    #[tokio::test]
    async fn non_agent_user_id_is_not_an_agent() {
        let db = test_db().await;
        db.upsert_user(
            "u1",
            &UserInfo {
                email: Some("lee@example.com".into()),
                name: None,
                tenant_id: None,
            },
        )
        .await
        .unwrap();

        let info = db.fetch_participants_info("u1").await.unwrap();
        assert!(info.agent_info.is_empty());
        assert!(info.user_info.is_empty());
    }

    #[tokio::test]
    async fn form_types_normalized() {
        let db = test_db().await;
        db.upsert_form(
            "report_form",
            "t1",
            Some(&json!([
                {"key": "summary", "type": "REPORT", "text": "요약"},
                {"key": "deck", "type": "slide"},
                {"key": "note", "type": "textarea", "text": "Note"},
            ])),
        )
        .await
        .unwrap();

        let (form_id, types) = db
            .fetch_form_types("formHandler:report_form", "t1")
            .await
            .unwrap();
        assert_eq!(form_id, "report_form");
        let kinds: Vec<&str> = types.iter().map(|t| t.kind.as_str()).collect();
        assert_eq!(kinds, vec!["report", "slide", "text"]);
        assert_eq!(types[0].id.as_deref(), Some("summary"));
        assert_eq!(types[0].text.as_deref(), Some("요약"));
        assert_eq!(types[1].text.as_deref(), Some(""));
    }

    #[tokio::test]
    async fn form_types_default_when_missing() {
        let db = test_db().await;
        let (form_id, types) = db.fetch_form_types("plain_form", "t1").await.unwrap();
        assert_eq!(form_id, "plain_form");
        assert_eq!(types, vec![FormType::default_for("plain_form")]);
    }

    #[tokio::test]
    async fn form_types_scoped_by_tenant() {
        let db = test_db().await;
        db.upsert_form("f", "t1", Some(&json!([{"key": "a", "type": "report"}])))
            .await
            .unwrap();
        let (_, types) = db.fetch_form_types("f", "t2").await.unwrap();
        assert_eq!(types, vec![FormType::default_for("f")]);
    }

    #[tokio::test]
    async fn corrupt_form_fields_error() {
        let db = test_db().await;
        db.conn()
            .execute(
                "INSERT INTO form_def (id, tenant_id, fields_json) VALUES ('bad', 't1', '{not json')",
                (),
            )
            .await
            .unwrap();
        let result = db.fetch_form_types("bad", "t1").await;
        assert!(matches!(result, Err(DatabaseError::Serialization(_))));
    }

    // ── Events ──────────────────────────────────────────────────────

    #[tokio::test]
    async fn emit_event_persists_record() {
        let db = test_db().await;
        let id = TaskId::from("42");
        let event = CrewEvent::crew_completed(&id, Some("P1"));
        db.emit_event(&event).await.unwrap();

        let events = db.events_for_task(&id).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].id, event.id);
        assert_eq!(events[0].event_type, "crew_completed");
        assert_eq!(events[0].job_id, "CREW_FINISHED");
        assert_eq!(events[0].proc_inst_id.as_deref(), Some("P1"));
        assert_eq!(events[0].data, json!({}));
    }

    // ── Pure helpers ────────────────────────────────────────────────

    #[test]
    fn form_handler_prefix_stripped() {
        assert_eq!(form_id_from_tool("formHandler:abc"), "abc");
        assert_eq!(form_id_from_tool("abc"), "abc");
        assert_eq!(form_id_from_tool(""), "");
    }

    #[test]
    fn empty_field_list_yields_default() {
        assert_eq!(
            normalize_form_fields("f", Some(&json!([]))),
            vec![FormType::default_for("f")]
        );
        assert_eq!(
            normalize_form_fields("f", None),
            vec![FormType::default_for("f")]
        );
    }

    #[test]
    fn field_without_key_has_null_id() {
        let types = normalize_form_fields("f", Some(&json!([{"type": "report", "text": "x"}])));
        assert_eq!(types[0].id, None);
        assert_eq!(types[0].kind, "report");

        let json = serde_json::to_value(&types[0]).unwrap();
        assert_eq!(json["id"], Value::Null);
    }

    #[test]
    fn later_outputs_override_earlier() {
        let merged = merge_outputs(vec![
            json!({"a": 1, "b": 1}),
            json!("not an object"),
            json!({"b": 2}),
        ]);
        assert_eq!(merged["a"], json!(1));
        assert_eq!(merged["b"], json!(2));
    }

    #[tokio::test]
    async fn open_local_creates_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("nested").join("queue.db");
        let db = LibSqlBackend::new_local(&path).await.unwrap();
        db.ping().await.unwrap();
        assert!(path.exists());
    }
}
