//! Task storage: the store contract, the Postgres backend, and an in-memory
//! backend for tests and development.

pub mod error;
pub mod memory;
pub mod postgres;
pub mod store;

pub use error::{ErrorClass, StoreError};
pub use memory::InMemoryTaskStore;
pub use postgres::PostgresTaskStore;
pub use store::{BatchRunner, NewTask, PollOutcome, QueueStats, ScheduledFiring, TaskStore};

/// Schema migrations for the `task` and `scheduled_task` tables.
///
/// These must be applied before submitting tasks or starting workers.
pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!();
