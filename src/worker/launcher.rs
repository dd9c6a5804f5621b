//! Worker launcher — runs one task's worker process to completion.
//!
//! The cancellation watcher runs as a structured child of the process wait:
//! both are driven by one `select!` loop, so the watcher is gone before any
//! completion notification is sent.

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};

use crate::config::WorkerCommand;
use crate::error::{NotificationStep, SupervisorError};
use crate::events::CrewEvent;
use crate::store::traits::{EventSink, TaskSource};
use crate::tasks::assembler::WorkerInput;
use crate::tasks::model::{TaskId, TaskStatus};
use crate::worker::handle::{WorkerHandle, WorkerOutcome};
use crate::worker::watcher::watch_cancel_status;

/// Result of running one worker process.
#[derive(Debug)]
pub struct WorkerResult {
    pub task_id: TaskId,
    pub outcome: WorkerOutcome,
    /// Exit code, `None` when the process was killed by a signal.
    pub exit_code: Option<i32>,
    pub pid: Option<u32>,
    /// Status that made the supervisor stop the worker.
    pub cancel_status: Option<TaskStatus>,
    /// Notification steps that failed after the worker exited.
    pub notification_failures: Vec<SupervisorError>,
}

impl WorkerResult {
    fn failed(&self, step: NotificationStep) -> bool {
        self.notification_failures
            .iter()
            .any(|e| matches!(e, SupervisorError::Notification { step: s, .. } if *s == step))
    }

    /// Whether the completion event was recorded.
    pub fn event_emitted(&self) -> bool {
        !self.failed(NotificationStep::EmitEvent)
    }

    /// Whether the task was marked completed.
    pub fn completion_recorded(&self) -> bool {
        !self.failed(NotificationStep::MarkCompleted)
    }
}

/// Starts worker processes and reconciles their exit with the task row.
pub struct WorkerLauncher {
    source: Arc<dyn TaskSource>,
    events: Arc<dyn EventSink>,
    command: WorkerCommand,
    cancel_check_interval: Duration,
}

impl WorkerLauncher {
    pub fn new(
        source: Arc<dyn TaskSource>,
        events: Arc<dyn EventSink>,
        command: WorkerCommand,
        cancel_check_interval: Duration,
    ) -> Self {
        Self {
            source,
            events,
            command,
            cancel_check_interval,
        }
    }

    /// Run a worker for `task_id` with `input` and wait for it to finish.
    pub async fn launch(
        &self,
        task_id: &TaskId,
        input: &WorkerInput,
    ) -> Result<WorkerResult, SupervisorError> {
        self.launch_with(task_id, input, |_| {}).await
    }

    /// Like [`launch`](Self::launch), calling `on_spawn` with the pid once
    /// the process is running.
    pub async fn launch_with<F>(
        &self,
        task_id: &TaskId,
        input: &WorkerInput,
        on_spawn: F,
    ) -> Result<WorkerResult, SupervisorError>
    where
        F: FnOnce(Option<u32>),
    {
        let inputs = input
            .to_json()
            .map_err(|e| SupervisorError::WorkerExecution {
                task_id: task_id.clone(),
                reason: format!("failed to serialize worker input: {e}"),
            })?;

        let mut handle = WorkerHandle::spawn(&self.command, task_id.clone(), &inputs).map_err(|e| {
            SupervisorError::WorkerExecution {
                task_id: task_id.clone(),
                reason: format!("failed to spawn '{}': {e}", self.command.program),
            }
        })?;
        let pid = handle.pid();
        on_spawn(pid);

        let (wait_result, cancel_status) = {
            let watched = Some(task_id).filter(|id| !id.as_str().is_empty());
            let watcher =
                watch_cancel_status(self.source.as_ref(), watched, self.cancel_check_interval);
            tokio::pin!(watcher);
            let mut watching = true;
            let mut cancel_status = None;

            let wait_result = loop {
                tokio::select! {
                    result = handle.wait() => break result,
                    status = &mut watcher, if watching => {
                        watching = false;
                        if let Some(status) = status {
                            handle.request_termination();
                            cancel_status = Some(status);
                        }
                    }
                }
            };
            (wait_result, cancel_status)
        };

        let exit = wait_result.map_err(|e| SupervisorError::WorkerExecution {
            task_id: task_id.clone(),
            reason: format!("failed to wait for worker: {e}"),
        })?;
        let outcome = WorkerOutcome::classify(&exit, handle.terminated_by_supervisor());
        drop(handle);

        match outcome {
            WorkerOutcome::TerminatedBySupervisor => info!(
                task_id = %task_id,
                pid = ?pid,
                status = ?cancel_status,
                "Worker terminated by supervisor"
            ),
            WorkerOutcome::AbnormalExit => warn!(
                task_id = %task_id,
                pid = ?pid,
                exit_code = ?exit.code(),
                "Worker exited abnormally"
            ),
            WorkerOutcome::NormalExit => info!(task_id = %task_id, pid = ?pid, "Worker finished"),
        }

        let notification_failures = self.notify_completed(task_id, input).await;

        Ok(WorkerResult {
            task_id: task_id.clone(),
            outcome,
            exit_code: exit.code(),
            pid,
            cancel_status,
            notification_failures,
        })
    }

    /// Emit the completion event, then mark the task completed. Each step
    /// runs once; a failed event does not skip the status update.
    async fn notify_completed(
        &self,
        task_id: &TaskId,
        input: &WorkerInput,
    ) -> Vec<SupervisorError> {
        let mut failures = Vec::new();

        let event = CrewEvent::crew_completed(task_id, input.proc_inst_id.as_deref());
        if let Err(e) = self.events.emit_event(&event).await {
            let err = SupervisorError::Notification {
                task_id: task_id.clone(),
                step: NotificationStep::EmitEvent,
                source: e,
            };
            error!(task_id = %task_id, error = %err, "Failed to emit completion event");
            failures.push(err);
        }

        if let Err(e) = self.source.update_task_completed(task_id).await {
            let err = SupervisorError::Notification {
                task_id: task_id.clone(),
                step: NotificationStep::MarkCompleted,
                source: e,
            };
            error!(task_id = %task_id, error = %err, "Failed to mark task completed");
            failures.push(err);
        }

        failures
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::error::DatabaseError;
    use crate::store::LibSqlBackend;
    use crate::store::retry::RetryPolicy;
    use crate::tasks::assembler::assemble_input;
    use crate::tasks::model::Task;

    struct FailingSink;

    #[async_trait]
    impl EventSink for FailingSink {
        async fn emit_event(&self, _event: &CrewEvent) -> Result<(), DatabaseError> {
            Err(DatabaseError::Query("event log offline".into()))
        }
    }

    fn sh(script: &str) -> WorkerCommand {
        WorkerCommand::new("sh").with_args(["-c", script, "worker"])
    }

    async fn setup(id: &str) -> (Arc<LibSqlBackend>, TaskId, WorkerInput) {
        let db = Arc::new(
            LibSqlBackend::new_memory()
                .await
                .unwrap()
                .with_retry_policy(RetryPolicy::none()),
        );
        db.enqueue_task(&Task::new(id).with_proc_inst_id("P1"))
            .await
            .unwrap();
        let task = db.fetch_pending_task().await.unwrap().unwrap();
        let input = assemble_input(db.as_ref(), &task).await.unwrap();
        (db, task.id, input)
    }

    fn launcher(db: &Arc<LibSqlBackend>, command: WorkerCommand) -> WorkerLauncher {
        WorkerLauncher::new(
            db.clone(),
            db.clone(),
            command,
            Duration::from_millis(50),
        )
    }

    #[tokio::test]
    async fn normal_exit_completes_task_and_emits_event() {
        let (db, id, input) = setup("1").await;
        let mut seen_pid = None;

        let result = launcher(&db, sh("exit 0"))
            .launch_with(&id, &input, |pid| seen_pid = pid)
            .await
            .unwrap();

        assert_eq!(result.outcome, WorkerOutcome::NormalExit);
        assert_eq!(result.exit_code, Some(0));
        assert!(seen_pid.is_some());
        assert_eq!(result.pid, seen_pid);
        assert!(result.event_emitted() && result.completion_recorded());

        let events = db.events_for_task(&id).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, "crew_completed");
        assert_eq!(events[0].proc_inst_id.as_deref(), Some("P1"));
        assert_eq!(
            db.fetch_task_status(&id).await.unwrap(),
            Some(TaskStatus::Completed)
        );
    }

    #[tokio::test]
    async fn abnormal_exit_still_completes_task() {
        let (db, id, input) = setup("2").await;

        let result = launcher(&db, sh("exit 3")).launch(&id, &input).await.unwrap();

        assert_eq!(result.outcome, WorkerOutcome::AbnormalExit);
        assert_eq!(result.exit_code, Some(3));
        assert_eq!(db.events_for_task(&id).await.unwrap().len(), 1);
        assert_eq!(
            db.fetch_task_status(&id).await.unwrap(),
            Some(TaskStatus::Completed)
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn cancelled_task_terminates_worker() {
        let (db, id, input) = setup("3").await;
        let launcher = launcher(&db, sh("sleep 30"));

        let cancel = {
            let db = db.clone();
            let id = id.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                db.set_task_status(&id, &TaskStatus::Cancelled).await.unwrap();
            }
        };

        let started = std::time::Instant::now();
        let (result, ()) = tokio::join!(launcher.launch(&id, &input), cancel);
        let result = result.unwrap();

        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(result.outcome, WorkerOutcome::TerminatedBySupervisor);
        assert_eq!(result.cancel_status, Some(TaskStatus::Cancelled));
        assert_eq!(db.events_for_task(&id).await.unwrap().len(), 1);
        assert_eq!(
            db.fetch_task_status(&id).await.unwrap(),
            Some(TaskStatus::Completed)
        );
    }

    #[tokio::test]
    async fn spawn_failure_is_worker_execution_error() {
        let (db, id, input) = setup("4").await;

        let err = launcher(&db, WorkerCommand::new("/nonexistent/worker-binary"))
            .launch(&id, &input)
            .await
            .unwrap_err();

        assert!(matches!(err, SupervisorError::WorkerExecution { .. }));
        assert!(db.events_for_task(&id).await.unwrap().is_empty());
        assert_eq!(
            db.fetch_task_status(&id).await.unwrap(),
            Some(TaskStatus::Pending)
        );
    }

    #[tokio::test]
    async fn event_failure_does_not_block_completion() {
        let (db, id, input) = setup("5").await;
        let launcher = WorkerLauncher::new(
            db.clone(),
            Arc::new(FailingSink),
            sh("exit 0"),
            Duration::from_millis(50),
        );

        let result = launcher.launch(&id, &input).await.unwrap();

        assert!(!result.event_emitted());
        assert!(result.completion_recorded());
        assert_eq!(result.notification_failures.len(), 1);
        assert_eq!(
            db.fetch_task_status(&id).await.unwrap(),
            Some(TaskStatus::Completed)
        );
    }

    #[tokio::test]
    async fn completion_failure_is_recorded() {
        let (db, _, input) = setup("6").await;
        let missing = TaskId::from("missing");

        let result = launcher(&db, sh("exit 0"))
            .launch(&missing, &input)
            .await
            .unwrap();

        assert!(result.event_emitted());
        assert!(!result.completion_recorded());
    }
}
