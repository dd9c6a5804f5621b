//! Collaborator traits — the task queue and the event sink.
//!
//! The supervisor only ever talks to storage through these two traits, so
//! tests can swap in scripted fakes and deployments can swap backends.

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::error::DatabaseError;
use crate::events::CrewEvent;
use crate::tasks::model::{FormType, ParticipantsInfo, Task, TaskId, TaskStatus};

/// Task queue access used by the supervisor and the input assembler.
///
/// Claiming a task atomically is the implementor's responsibility.
#[async_trait]
pub trait TaskSource: Send + Sync {
    /// Claim and return the next pending task, if any.
    async fn fetch_pending_task(&self) -> Result<Option<Task>, DatabaseError>;

    /// Current status of a task. `None` if the row no longer exists.
    async fn fetch_task_status(&self, id: &TaskId) -> Result<Option<TaskStatus>, DatabaseError>;

    /// Mark a task completed and clear its claim.
    async fn update_task_completed(&self, id: &TaskId) -> Result<(), DatabaseError>;

    /// Drop this supervisor's claim on a task, leaving its status untouched.
    async fn release_task(&self, id: &TaskId) -> Result<(), DatabaseError>;

    /// Outputs of finished stages of a process instance, keyed by activity name.
    async fn fetch_previous_output(
        &self,
        proc_inst_id: &str,
    ) -> Result<Map<String, Value>, DatabaseError>;

    /// Resolve comma-separated participant ids into users and agents.
    async fn fetch_participants_info(
        &self,
        user_ids: &str,
    ) -> Result<ParticipantsInfo, DatabaseError>;

    /// Resolve a task's tool value into a form id and its output fields.
    async fn fetch_form_types(
        &self,
        tool: &str,
        tenant_id: &str,
    ) -> Result<(String, Vec<FormType>), DatabaseError>;
}

/// Destination for supervisor events.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Persist or forward one event.
    async fn emit_event(&self, event: &CrewEvent) -> Result<(), DatabaseError>;
}
