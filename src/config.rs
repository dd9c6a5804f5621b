//! Configuration types.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::ConfigError;

/// Command used to start a worker process.
///
/// The launcher appends `--inputs <json>` after `args`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerCommand {
    /// Executable to run.
    pub program: String,
    /// Leading arguments passed before `--inputs`.
    pub args: Vec<String>,
}

impl WorkerCommand {
    /// Command with no leading arguments.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    /// Builder: append leading arguments.
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }
}

impl Default for WorkerCommand {
    fn default() -> Self {
        Self::new("worker")
    }
}

/// Supervisor configuration.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Sleep between task fetches.
    pub poll_interval: Duration,
    /// Sleep between cancellation checks while a worker runs.
    pub cancel_check_interval: Duration,
    /// Worker process command.
    pub worker: WorkerCommand,
    /// Identity written into claimed rows.
    pub consumer_id: String,
    /// libSQL database file.
    pub db_path: PathBuf,
    /// Directory for daily-rolling log files. Console only when unset.
    pub log_dir: Option<PathBuf>,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(7),
            cancel_check_interval: Duration::from_secs(5),
            worker: WorkerCommand::default(),
            consumer_id: default_consumer_id(),
            db_path: PathBuf::from("./data/supervisor.db"),
            log_dir: None,
        }
    }
}

impl SupervisorConfig {
    /// Load from `SUPERVISOR_*` environment variables, falling back to
    /// defaults for anything unset.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load using an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let poll_interval = match get("SUPERVISOR_POLL_INTERVAL_SECS") {
            Some(raw) => parse_interval("SUPERVISOR_POLL_INTERVAL_SECS", &raw)?,
            None => defaults.poll_interval,
        };
        let cancel_check_interval = match get("SUPERVISOR_CANCEL_CHECK_INTERVAL_SECS") {
            Some(raw) => parse_interval("SUPERVISOR_CANCEL_CHECK_INTERVAL_SECS", &raw)?,
            None => defaults.cancel_check_interval,
        };

        let worker = WorkerCommand {
            program: get("SUPERVISOR_WORKER_PROGRAM").unwrap_or(defaults.worker.program),
            args: get("SUPERVISOR_WORKER_ARGS")
                .map(|s| s.split_whitespace().map(str::to_string).collect())
                .unwrap_or_default(),
        };

        Ok(Self {
            poll_interval,
            cancel_check_interval,
            worker,
            consumer_id: get("SUPERVISOR_CONSUMER_ID").unwrap_or(defaults.consumer_id),
            db_path: get("SUPERVISOR_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.db_path),
            log_dir: get("SUPERVISOR_LOG_DIR").map(PathBuf::from),
        })
    }
}

/// Parse a positive number of seconds.
fn parse_interval(key: &str, raw: &str) -> Result<Duration, ConfigError> {
    let secs: u64 = raw.parse().map_err(|e| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("'{raw}' is not a number of seconds: {e}"),
    })?;
    if secs == 0 {
        return Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: "interval must be at least 1 second".to_string(),
        });
    }
    Ok(Duration::from_secs(secs))
}

/// Host name, or a fixed fallback when it cannot be read.
fn default_consumer_id() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "worker-supervisor".to_string())
}
