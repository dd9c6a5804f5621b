//! Worker process handle and exit classification.

use std::process::{ExitStatus, Stdio};

use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use crate::config::WorkerCommand;
use crate::tasks::model::TaskId;

/// How a worker process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerOutcome {
    /// The supervisor asked the process to stop before it exited.
    TerminatedBySupervisor,
    /// Non-zero exit or killed by a signal we did not send.
    AbnormalExit,
    /// Exit code 0.
    NormalExit,
}

impl WorkerOutcome {
    /// Classify an exit status. A termination request takes precedence over
    /// the exit code.
    pub fn classify(status: &ExitStatus, terminated_by_supervisor: bool) -> Self {
        if terminated_by_supervisor {
            Self::TerminatedBySupervisor
        } else if status.success() {
            Self::NormalExit
        } else {
            Self::AbnormalExit
        }
    }
}

impl std::fmt::Display for WorkerOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::TerminatedBySupervisor => "terminated_by_supervisor",
            Self::AbnormalExit => "abnormal_exit",
            Self::NormalExit => "normal_exit",
        };
        write!(f, "{s}")
    }
}

/// A running worker process for one task.
///
/// Owned by the launcher for the lifetime of the task.
#[derive(Debug)]
pub struct WorkerHandle {
    child: Child,
    task_id: TaskId,
    pid: Option<u32>,
    terminated_by_supervisor: bool,
}

impl WorkerHandle {
    /// Spawn `command` with `--inputs <inputs>` appended.
    ///
    /// stdout and stderr are inherited from the supervisor.
    pub fn spawn(command: &WorkerCommand, task_id: TaskId, inputs: &str) -> std::io::Result<Self> {
        let child = Command::new(&command.program)
            .args(&command.args)
            .arg("--inputs")
            .arg(inputs)
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()?;

        let pid = child.id();
        info!(task_id = %task_id, pid = ?pid, program = %command.program, "Worker process started");

        Ok(Self {
            child,
            task_id,
            pid,
            terminated_by_supervisor: false,
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn terminated_by_supervisor(&self) -> bool {
        self.terminated_by_supervisor
    }

    /// Wait for the process to exit. Cancel safe.
    pub async fn wait(&mut self) -> std::io::Result<ExitStatus> {
        self.child.wait().await
    }

    /// Ask the process to stop gracefully.
    ///
    /// Sets the terminated flag and sends `SIGTERM`. A process that has
    /// already exited is left alone.
    pub fn request_termination(&mut self) {
        match self.child.try_wait() {
            Ok(Some(status)) => {
                debug!(task_id = %self.task_id, status = %status, "Worker already exited, nothing to terminate");
                return;
            }
            Ok(None) => {}
            Err(e) => {
                warn!(task_id = %self.task_id, error = %e, "Could not query worker state before termination");
            }
        }

        self.terminated_by_supervisor = true;
        match self.send_terminate() {
            Ok(()) => info!(task_id = %self.task_id, pid = ?self.pid, "Sent termination signal to worker"),
            Err(e) => warn!(task_id = %self.task_id, pid = ?self.pid, error = %e, "Failed to signal worker"),
        }
    }

    #[cfg(unix)]
    fn send_terminate(&mut self) -> std::io::Result<()> {
        let Some(pid) = self.child.id() else {
            return Ok(());
        };
        let pid = libc::pid_t::try_from(pid)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
        // SAFETY: kill(2) only reads its arguments; pid refers to our own child.
        let rc = unsafe { libc::kill(pid, libc::SIGTERM) };
        if rc == 0 {
            Ok(())
        } else {
            Err(std::io::Error::last_os_error())
        }
    }

    #[cfg(not(unix))]
    fn send_terminate(&mut self) -> std::io::Result<()> {
        self.child.start_kill()
    }
}
