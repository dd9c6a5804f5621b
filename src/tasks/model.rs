//! Task data model — task rows, statuses, and lookup results.

use serde::{Deserialize, Serialize};

/// Opaque identifier of a task row.
///
/// Numeric ids from the queue are carried as their decimal text.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for TaskId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<i64> for TaskId {
    fn from(n: i64) -> Self {
        Self(n.to_string())
    }
}

/// Persisted status of a task (the `draft_status` column).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TaskStatus {
    /// Waiting to be claimed.
    Pending,
    /// A worker is active for this task.
    Running,
    /// Cancelled externally while running.
    Cancelled,
    /// A reviewer asked for changes; the current run is superseded.
    FeedbackRequested,
    /// Worker finished (for any reason).
    Completed,
    /// Marked failed by another component.
    Failed,
    /// Any status written by another system that we don't model.
    Other(String),
}

impl TaskStatus {
    /// Storage representation.
    pub fn as_str(&self) -> &str {
        match self {
            Self::Pending => "PENDING",
            Self::Running => "IN_PROGRESS",
            Self::Cancelled => "CANCELLED",
            Self::FeedbackRequested => "FB_REQUESTED",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Other(s) => s,
        }
    }

    /// Parse a stored status. Unknown values are kept verbatim.
    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_uppercase().as_str() {
            "PENDING" => Self::Pending,
            "IN_PROGRESS" | "RUNNING" => Self::Running,
            "CANCELLED" | "CANCELED" => Self::Cancelled,
            "FB_REQUESTED" | "FEEDBACK_REQUESTED" => Self::FeedbackRequested,
            "COMPLETED" => Self::Completed,
            "FAILED" => Self::Failed,
            _ => Self::Other(s.to_string()),
        }
    }

    /// Whether a worker running for a task in this status must be stopped.
    pub fn requires_termination(&self) -> bool {
        matches!(self, Self::Cancelled | Self::FeedbackRequested)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A task row as read from the queue.
#[derive(Debug, Clone)]
pub struct Task {
    pub id: TaskId,
    pub status: TaskStatus,
    pub proc_inst_id: Option<String>,
    /// Root process instance; preferred over `proc_inst_id` when set.
    pub root_proc_inst_id: Option<String>,
    pub activity_name: Option<String>,
    /// Task instructions for the worker.
    pub description: Option<String>,
    /// Comma-separated participant ids (the `user_id` column).
    pub user_ids: Option<String>,
    pub tool: Option<String>,
    pub tenant_id: Option<String>,
    /// Supervisor instance holding the claim.
    pub consumer: Option<String>,
}

impl Task {
    /// Create a pending task with every optional field unset.
    pub fn new(id: impl Into<TaskId>) -> Self {
        Self {
            id: id.into(),
            status: TaskStatus::Pending,
            proc_inst_id: None,
            root_proc_inst_id: None,
            activity_name: None,
            description: None,
            user_ids: None,
            tool: None,
            tenant_id: None,
            consumer: None,
        }
    }

    /// Builder: set process instance id.
    pub fn with_proc_inst_id(mut self, id: impl Into<String>) -> Self {
        self.proc_inst_id = Some(id.into());
        self
    }

    /// Builder: set activity name.
    pub fn with_activity_name(mut self, name: impl Into<String>) -> Self {
        self.activity_name = Some(name.into());
        self
    }

    /// Builder: set description.
    pub fn with_description(mut self, desc: impl Into<String>) -> Self {
        self.description = Some(desc.into());
        self
    }

    /// Builder: set participant ids.
    pub fn with_user_ids(mut self, ids: impl Into<String>) -> Self {
        self.user_ids = Some(ids.into());
        self
    }

    /// Builder: set tool value.
    pub fn with_tool(mut self, tool: impl Into<String>) -> Self {
        self.tool = Some(tool.into());
        self
    }

    /// Builder: set tenant.
    pub fn with_tenant_id(mut self, tenant: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant.into());
        self
    }

    /// Process instance used for prior-output lookups and the payload.
    ///
    /// An empty root id counts as absent.
    pub fn effective_proc_inst_id(&self) -> Option<&str> {
        fn non_empty(s: &Option<String>) -> Option<&str> {
            s.as_deref().filter(|s| !s.is_empty())
        }
        non_empty(&self.root_proc_inst_id).or_else(|| non_empty(&self.proc_inst_id))
    }

    /// Non-empty participant ids, if any.
    pub fn participant_ids(&self) -> Option<&str> {
        self.user_ids
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }
}

/// A human participant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserInfo {
    pub email: Option<String>,
    pub name: Option<String>,
    pub tenant_id: Option<String>,
}

/// An agent participant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentInfo {
    pub id: String,
    pub name: Option<String>,
    pub role: Option<String>,
    pub goal: Option<String>,
    pub persona: Option<String>,
    /// Tool list the agent is allowed to use.
    pub tools: Option<String>,
    pub profile: Option<String>,
    pub model: Option<String>,
    pub tenant_id: Option<String>,
}

/// Participants resolved from a task's user ids.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParticipantsInfo {
    #[serde(default)]
    pub user_info: Vec<UserInfo>,
    #[serde(default)]
    pub agent_info: Vec<AgentInfo>,
}

impl ParticipantsInfo {
    /// Tools of the first agent, if that agent has any.
    pub fn primary_tools(&self) -> Option<String> {
        self.agent_info.first().and_then(|a| a.tools.clone())
    }
}

/// One normalized output field of a form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormType {
    /// Field key; `null` when the field declares none.
    pub id: Option<String>,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

impl FormType {
    /// Placeholder entry used when a form declares no fields.
    pub fn default_for(form_id: &str) -> Self {
        Self {
            id: Some(form_id.to_string()),
            kind: "default".to_string(),
            key: None,
            text: None,
        }
    }
}
