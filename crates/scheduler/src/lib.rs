//! Cron scheduler: registers periodic entries in `scheduled_task` and arms
//! delayed firings against a single-thread timer. Each firing runs under a
//! row lock so that, across a cluster of nodes arming the same entry, at
//! most one node executes per firing window.

pub mod schedule;
pub mod scheduler;

pub use schedule::ScheduleEntry;
pub use scheduler::{ScheduleError, Scheduler, SchedulerHandle};
