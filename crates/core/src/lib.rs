//! Core domain: task model, handler contract, retry/outcome resolution.

pub mod handler;
pub mod outcome;
pub mod task;

pub use handler::{Handler, TaskRegistry, TaskRegistryBuilder};
pub use outcome::{resolve, Disposition, RetryStrategy, TaskResult, DEFAULT_RETRY_DELAY};
pub use task::{Task, TaskId, TaskStatus};
