//! Persistence layer — the task queue, its lookups, and the event log.

pub mod libsql_backend;
pub mod migrations;
pub mod retry;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use retry::RetryPolicy;
pub use traits::{EventSink, TaskSource};
