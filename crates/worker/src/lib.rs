//! Worker runtime: bounded executor and the queue polling event loop.

pub mod executor;
mod run;
pub mod worker;

pub use executor::{Executor, ExecutorClosed, ExecutorConfig, ScheduledTask};
pub use worker::{Worker, WorkerConfig, WorkerHandle};
