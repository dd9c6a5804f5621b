//! Worker lifecycle — process handles, cancellation, and the supervisor loop.
//!
//! Core components:
//! - `handle` — Spawned worker process and exit classification
//! - `state` — Supervisor state (Idle → Assembling → Running) and the per-task guard
//! - `watcher` — Polls a running task's status for cancellation
//! - `launcher` — Runs one worker to completion and reconciles the task row
//! - `supervisor` — Poll loop, one task at a time

pub mod handle;
pub mod launcher;
pub mod state;
pub mod supervisor;
pub mod watcher;

pub use handle::{WorkerHandle, WorkerOutcome};
pub use launcher::{WorkerLauncher, WorkerResult};
pub use state::{ActiveTask, SupervisorState};
pub use supervisor::{Supervisor, spawn_supervisor};
