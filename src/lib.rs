//! Worker supervisor — polls a task queue and runs one worker process per task.

pub mod config;
pub mod error;
pub mod events;
pub mod logging;
pub mod store;
pub mod tasks;
pub mod worker;
