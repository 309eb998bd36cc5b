//! Startup registration and the per-entry arming loops.

use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use cron::Schedule;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use drudge_core::{Handler, TaskRegistry, TaskResult};
use drudge_store::{ScheduledFiring, StoreError, TaskStore};
use drudge_worker::Executor;

use crate::schedule::{until_next, ScheduleEntry};

#[derive(Debug, Error)]
pub enum ScheduleError {
    /// The schedule references a handler nobody registered. Raised at
    /// startup; fatal.
    #[error("schedule entry '{id}' references unknown task '{task}'")]
    UnknownTask { id: String, task: String },

    #[error("invalid cron expression '{expr}': {message}")]
    InvalidCron { expr: String, message: String },

    #[error("timer executor is shut down")]
    TimerClosed,

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub struct Scheduler;

impl Scheduler {
    /// Validate the schedule, upsert every entry into `scheduled_task`,
    /// and arm the first firing of each on the timer.
    ///
    /// Fails fast on unknown handler names and unparsable cron
    /// expressions; nothing is armed unless the whole schedule is valid.
    pub async fn start(
        entries: Vec<ScheduleEntry>,
        tasks: TaskRegistry,
        store: Arc<dyn TaskStore>,
        timer: Arc<Executor>,
        executor: Arc<Executor>,
    ) -> Result<SchedulerHandle, ScheduleError> {
        let mut prepared = Vec::with_capacity(entries.len());
        for entry in entries {
            let handler = tasks.get(&entry.task).cloned().ok_or_else(|| {
                ScheduleError::UnknownTask {
                    id: entry.id.clone(),
                    task: entry.task.clone(),
                }
            })?;
            let schedule = Schedule::from_str(&entry.cron).map_err(|err| {
                ScheduleError::InvalidCron {
                    expr: entry.cron.clone(),
                    message: err.to_string(),
                }
            })?;
            prepared.push((entry, schedule, handler));
        }

        let shutdown = CancellationToken::new();
        let mut armed = Vec::with_capacity(prepared.len());
        for (entry, schedule, handler) in prepared {
            store.upsert_schedule(&entry.id, &entry.cron).await?;
            let join = timer
                .spawn(arming_loop(
                    entry,
                    schedule,
                    handler,
                    store.clone(),
                    timer.clone(),
                    executor.clone(),
                    shutdown.clone(),
                ))
                .map_err(|_| ScheduleError::TimerClosed)?;
            armed.push(join);
        }

        info!(entries = armed.len(), "scheduler started");
        Ok(SchedulerHandle { shutdown, armed })
    }
}

/// Handle to disarm the schedule and join its arming loops.
#[derive(Debug)]
pub struct SchedulerHandle {
    shutdown: CancellationToken,
    armed: Vec<JoinHandle<()>>,
}

impl SchedulerHandle {
    pub async fn shutdown(mut self) {
        self.shutdown.cancel();
        for join in self.armed.drain(..) {
            let _ = join.await;
        }
    }
}

async fn arming_loop(
    entry: ScheduleEntry,
    schedule: Schedule,
    handler: Handler,
    store: Arc<dyn TaskStore>,
    timer: Arc<Executor>,
    executor: Arc<Executor>,
    shutdown: CancellationToken,
) {
    debug!(schedule = %entry.id, cron = %entry.cron, "entry armed");

    loop {
        let Some(delay) = until_next(&schedule, Utc::now()) else {
            warn!(schedule = %entry.id, "cron expression yields no future firing; disarming");
            break;
        };

        // Arm exactly one firing on the timer. Shutdown cancels the armed
        // firing while it waits.
        let (fired_tx, fired_rx) = oneshot::channel();
        let Ok(armed) = timer.schedule(delay, move || {
            let _ = fired_tx.send(());
        }) else {
            debug!(schedule = %entry.id, "timer closed; disarming");
            break;
        };

        tokio::select! {
            biased;
            _ = shutdown.cancelled() => {
                armed.cancel();
                break;
            }
            fired = fired_rx => {
                if fired.is_err() {
                    debug!(schedule = %entry.id, "armed firing was dropped; disarming");
                    break;
                }
            }
        }

        let firing = Firing {
            entry: &entry,
            handler: handler.clone(),
            executor: executor.clone(),
        };
        // A failed firing must not stop the schedule; the loop re-arms the
        // next window no matter how this one went.
        match store.fire_scheduled(&entry.id, &firing).await {
            Ok(true) => debug!(schedule = %entry.id, "fired"),
            Ok(false) => {
                debug!(schedule = %entry.id, "lost the firing lock; skipping this window")
            }
            Err(err) => warn!(schedule = %entry.id, error = %err, "firing failed"),
        }
    }

    debug!(schedule = %entry.id, "entry disarmed");
}

/// One firing window: invokes the entry's handler with its task metadata
/// on the executor pool, under the `scheduled_task` row lock.
struct Firing<'a> {
    entry: &'a ScheduleEntry,
    handler: Handler,
    executor: Arc<Executor>,
}

#[async_trait]
impl ScheduledFiring for Firing<'_> {
    async fn fire(&self) {
        let task = self.entry.to_task();
        let handler = self.handler.clone();

        match self.executor.submit(move || handler(&task)) {
            Ok(join) => match join.await {
                Ok(TaskResult::Completed) => {}
                Ok(TaskResult::Retry { .. }) => {
                    warn!(
                        schedule = %self.entry.id,
                        "scheduled handler requested a retry; periodic firings are not retried"
                    )
                }
                Ok(TaskResult::Failed(error)) => {
                    warn!(schedule = %self.entry.id, error = %error, "scheduled handler failed")
                }
                Err(err) => {
                    warn!(schedule = %self.entry.id, error = %err, "scheduled handler did not finish")
                }
            },
            Err(_) => warn!(schedule = %self.entry.id, "executor closed; firing skipped"),
        }
    }
}
