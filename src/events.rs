//! Events emitted by the supervisor for downstream consumers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::tasks::model::TaskId;

/// Event type recorded when a worker for a task has finished.
pub const CREW_COMPLETED: &str = "crew_completed";

/// Job id attached to completion events.
pub const CREW_FINISHED_JOB: &str = "CREW_FINISHED";

/// A single event record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrewEvent {
    pub id: Uuid,
    pub event_type: String,
    pub job_id: String,
    pub crew_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub todo_id: Option<TaskId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proc_inst_id: Option<String>,
    pub data: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl CrewEvent {
    /// Create an event. A missing job id falls back to the event type and a
    /// missing crew type to `action`.
    pub fn new(
        event_type: impl Into<String>,
        data: serde_json::Value,
        job_id: Option<&str>,
        crew_type: Option<&str>,
    ) -> Self {
        let event_type = event_type.into();
        Self {
            id: Uuid::new_v4(),
            job_id: job_id.map(str::to_string).unwrap_or_else(|| event_type.clone()),
            crew_type: crew_type.unwrap_or("action").to_string(),
            event_type,
            todo_id: None,
            proc_inst_id: None,
            data,
            timestamp: Utc::now(),
        }
    }

    /// Completion notification for a task whose worker has exited.
    pub fn crew_completed(task_id: &TaskId, proc_inst_id: Option<&str>) -> Self {
        Self::new(
            CREW_COMPLETED,
            serde_json::json!({}),
            Some(CREW_FINISHED_JOB),
            Some("crew"),
        )
        .with_todo_id(task_id.clone())
        .with_proc_inst_id(proc_inst_id)
    }

    /// Builder: attach the task id.
    pub fn with_todo_id(mut self, id: TaskId) -> Self {
        self.todo_id = Some(id);
        self
    }

    /// Builder: attach the process instance id.
    pub fn with_proc_inst_id(mut self, id: Option<&str>) -> Self {
        self.proc_inst_id = id.map(str::to_string);
        self
    }
}
