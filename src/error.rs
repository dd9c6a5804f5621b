//! Error types for the worker supervisor.

use crate::tasks::model::TaskId;

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// The lookup performed by the input assembler that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssemblyLookup {
    PreviousOutput,
    Participants,
    FormTypes,
}

impl std::fmt::Display for AssemblyLookup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::PreviousOutput => "previous_output",
            Self::Participants => "participants",
            Self::FormTypes => "form_types",
        };
        write!(f, "{s}")
    }
}

/// Notification step that failed after a worker exited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationStep {
    EmitEvent,
    MarkCompleted,
}

impl std::fmt::Display for NotificationStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::EmitEvent => "emit_event",
            Self::MarkCompleted => "mark_completed",
        };
        write!(f, "{s}")
    }
}

/// Errors raised while supervising tasks and their worker processes.
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("Initialization failed: {0}")]
    Initialization(String),

    #[error("Releasing stale claims failed: {0}")]
    ClaimRecovery(#[source] DatabaseError),

    #[error("Task {task_id} assembly failed during {lookup}: {source}")]
    TaskAssembly {
        task_id: TaskId,
        lookup: AssemblyLookup,
        #[source]
        source: DatabaseError,
    },

    #[error("Worker for task {task_id} failed: {reason}")]
    WorkerExecution { task_id: TaskId, reason: String },

    #[error("Status query for task {task_id} failed: {source}")]
    StatusQuery {
        task_id: TaskId,
        #[source]
        source: DatabaseError,
    },

    #[error("Notification {step} for task {task_id} failed: {source}")]
    Notification {
        task_id: TaskId,
        step: NotificationStep,
        #[source]
        source: DatabaseError,
    },
}

impl SupervisorError {
    /// Fatal errors abort startup; everything else is logged and the
    /// supervisor carries on.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Initialization(_))
    }
}
