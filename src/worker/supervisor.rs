//! Supervisor loop — polls the queue and runs one task at a time.
//!
//! Each cycle claims at most one pending task, runs it to completion, then
//! sleeps the poll interval. Per-task failures are logged and the claim is
//! released so the task stays pending; the loop itself only stops on
//! shutdown.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::SupervisorConfig;
use crate::error::SupervisorError;
use crate::store::traits::{EventSink, TaskSource};
use crate::tasks::assembler::assemble_input;
use crate::tasks::model::Task;
use crate::worker::launcher::{WorkerLauncher, WorkerResult};
use crate::worker::state::{ActiveTask, SupervisorState};

/// Polls the task source and supervises worker processes.
pub struct Supervisor {
    source: Arc<dyn TaskSource>,
    launcher: WorkerLauncher,
    poll_interval: Duration,
    state_tx: watch::Sender<SupervisorState>,
}

impl Supervisor {
    pub fn new(
        source: Arc<dyn TaskSource>,
        events: Arc<dyn EventSink>,
        config: &SupervisorConfig,
    ) -> Self {
        let launcher = WorkerLauncher::new(
            source.clone(),
            events,
            config.worker.clone(),
            config.cancel_check_interval,
        );
        let (state_tx, _) = watch::channel(SupervisorState::Idle);
        Self {
            source,
            launcher,
            poll_interval: config.poll_interval,
            state_tx,
        }
    }

    /// Observe state changes.
    pub fn subscribe(&self) -> watch::Receiver<SupervisorState> {
        self.state_tx.subscribe()
    }

    /// Current state.
    pub fn state(&self) -> SupervisorState {
        self.state_tx.borrow().clone()
    }

    /// Run until `shutdown` becomes `true` or its sender is dropped.
    ///
    /// Shutdown is checked between cycles and during the inter-cycle sleep;
    /// a task in flight runs to completion first.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            poll_interval_ms = self.poll_interval.as_millis() as u64,
            "Supervisor loop started"
        );

        loop {
            if *shutdown.borrow_and_update() {
                break;
            }

            self.poll_once().await;

            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        debug!("Shutdown sender dropped");
                        break;
                    }
                }
            }
        }

        info!("Supervisor loop stopped");
    }

    /// One cycle: claim a pending task, if any, and process it.
    ///
    /// Never fails; errors are logged and the cycle is dropped.
    pub async fn poll_once(&self) -> Option<WorkerResult> {
        let task = match self.source.fetch_pending_task().await {
            Ok(Some(task)) => task,
            Ok(None) => {
                debug!("No pending task");
                return None;
            }
            Err(e) => {
                warn!(error = %e, "Failed to fetch pending task");
                return None;
            }
        };

        let task_id = task.id.clone();
        match self.process_task(task).await {
            Ok(result) => Some(result),
            Err(e) => {
                error!(task_id = %task_id, error = %e, "Task processing failed, releasing claim");
                if let Err(e) = self.source.release_task(&task_id).await {
                    warn!(task_id = %task_id, error = %e, "Failed to release task claim");
                }
                None
            }
        }
    }

    /// Assemble the task's input and run its worker.
    ///
    /// State returns to `Idle` on every exit path.
    pub async fn process_task(&self, task: Task) -> Result<WorkerResult, SupervisorError> {
        let active = ActiveTask::begin(task.id.clone(), &self.state_tx);
        info!(
            task_id = %active.task_id(),
            activity = task.activity_name.as_deref().unwrap_or_default(),
            "Processing task"
        );

        let input = assemble_input(self.source.as_ref(), &task).await?;

        let result = self
            .launcher
            .launch_with(&task.id, &input, |pid| active.mark_running(pid))
            .await?;

        info!(
            task_id = %result.task_id,
            outcome = %result.outcome,
            exit_code = ?result.exit_code,
            "Task finished"
        );
        Ok(result)
    }
}

/// Spawn the supervisor loop as a background task.
pub fn spawn_supervisor(
    supervisor: Arc<Supervisor>,
    shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move { supervisor.run(shutdown).await })
}
