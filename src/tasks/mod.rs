//! Tasks — queue rows and the payload handed to worker processes.

pub mod assembler;
pub mod model;

pub use assembler::{WorkerInput, assemble_input};
pub use model::{Task, TaskId, TaskStatus};
