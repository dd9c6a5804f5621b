//! Supervisor state and the per-task scope guard.

use tokio::sync::watch;

use crate::tasks::model::TaskId;

/// What the supervisor is doing right now.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SupervisorState {
    /// No task taken up.
    #[default]
    Idle,
    /// A task was claimed and its worker input is being built.
    Assembling { task_id: TaskId },
    /// A worker process is running for a task.
    Running { task_id: TaskId, pid: Option<u32> },
}

impl SupervisorState {
    pub fn is_idle(&self) -> bool {
        matches!(self, Self::Idle)
    }

    /// Task currently taken up, if any.
    pub fn task_id(&self) -> Option<&TaskId> {
        match self {
            Self::Idle => None,
            Self::Assembling { task_id } | Self::Running { task_id, .. } => Some(task_id),
        }
    }
}

impl std::fmt::Display for SupervisorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Assembling { task_id } => write!(f, "assembling({task_id})"),
            Self::Running { task_id, pid } => match pid {
                Some(pid) => write!(f, "running({task_id}, pid {pid})"),
                None => write!(f, "running({task_id})"),
            },
        }
    }
}

/// Scope of one task being processed.
///
/// Publishes state transitions for the task and resets the supervisor to
/// `Idle` when dropped, however processing ended.
pub struct ActiveTask<'a> {
    task_id: TaskId,
    state_tx: &'a watch::Sender<SupervisorState>,
}

impl<'a> ActiveTask<'a> {
    /// Take up `task_id`. State becomes `Assembling`.
    pub fn begin(task_id: TaskId, state_tx: &'a watch::Sender<SupervisorState>) -> Self {
        state_tx.send_replace(SupervisorState::Assembling {
            task_id: task_id.clone(),
        });
        Self { task_id, state_tx }
    }

    pub fn task_id(&self) -> &TaskId {
        &self.task_id
    }

    /// Record that the worker process is running.
    pub fn mark_running(&self, pid: Option<u32>) {
        self.state_tx.send_replace(SupervisorState::Running {
            task_id: self.task_id.clone(),
            pid,
        });
    }
}

impl Drop for ActiveTask<'_> {
    fn drop(&mut self) {
        self.state_tx.send_replace(SupervisorState::Idle);
    }
}
