//! Cancellation watcher — polls a running task's status.
//!
//! The watcher never touches the worker process. It resolves with the
//! status that requires termination and the launcher acts on it. Dropping
//! the future stops the watcher at its next suspension point.

use std::time::Duration;

use tracing::{debug, info, warn};

use crate::error::SupervisorError;
use crate::store::traits::TaskSource;
use crate::tasks::model::{TaskId, TaskStatus};

/// Poll `task_id`'s status every `interval` until it becomes `CANCELLED` or
/// `FEEDBACK_REQUESTED`, then return that status.
///
/// Returns `None` immediately when there is no task to watch. Query
/// failures are logged and polling continues.
pub async fn watch_cancel_status(
    source: &dyn TaskSource,
    task_id: Option<&TaskId>,
    interval: Duration,
) -> Option<TaskStatus> {
    let Some(task_id) = task_id else {
        debug!("No task id to watch, cancellation watcher exiting");
        return None;
    };

    loop {
        tokio::time::sleep(interval).await;

        match source.fetch_task_status(task_id).await {
            Ok(Some(status)) if status.requires_termination() => {
                info!(task_id = %task_id, status = %status, "Task status requires worker termination");
                return Some(status);
            }
            Ok(Some(status)) => {
                debug!(task_id = %task_id, status = %status, "Task still active");
            }
            Ok(None) => {
                debug!(task_id = %task_id, "Task row not found, continuing to watch");
            }
            Err(e) => {
                let err = SupervisorError::StatusQuery {
                    task_id: task_id.clone(),
                    source: e,
                };
                warn!(task_id = %task_id, error = %err, "Cancellation check failed, will retry");
            }
        }
    }
}
