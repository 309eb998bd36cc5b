//! In-memory task store for tests and development.
//!
//! Mirrors the observable behavior of the Postgres backend: claimed tasks
//! are invisible to concurrent polls until their outcomes are applied, and
//! a closed store fails every operation with `PoolClosed`.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use metrics::counter;

use drudge_core::{Disposition, Task, TaskId, TaskStatus};
use drudge_observability::metrics::TASKS_SUBMIT_TOTAL;

use crate::error::StoreError;
use crate::store::{
    BatchRunner, NewTask, PollOutcome, QueueStats, ScheduledFiring, TaskStore,
};

#[derive(Default)]
pub struct InMemoryTaskStore {
    inner: Mutex<Inner>,
    closed: AtomicBool,
}

#[derive(Default)]
struct Inner {
    tasks: HashMap<TaskId, Task>,
    /// Tasks claimed by a poll step whose outcome has not been applied yet.
    in_flight: HashSet<TaskId>,
    schedules: HashMap<String, String>,
    /// Entry ids currently inside a firing window.
    firing: HashSet<String>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate pool closure: every subsequent operation fails with
    /// `PoolClosed`.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    /// Make a runnable task due right now, skipping its remaining backoff.
    pub fn expedite(&self, id: TaskId) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(task) = inner.tasks.get_mut(&id) {
            if task.status.is_runnable() {
                task.scheduled_at = Utc::now();
            }
        }
    }

    fn guard(&self) -> Result<(), StoreError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(StoreError::PoolClosed)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn submit(&self, new_task: NewTask) -> Result<TaskId, StoreError> {
        self.guard()?;
        new_task.validate()?;

        let now = Utc::now();
        let scheduled_at =
            now + chrono::Duration::from_std(new_task.delay).unwrap_or_default();
        let task = Task {
            id: TaskId::new(),
            name: new_task.name,
            props: new_task.props,
            queue: new_task.queue,
            priority: new_task.priority,
            max_retries: new_task.max_retries,
            retry_num: 0,
            status: TaskStatus::New,
            error: None,
            scheduled_at,
            modified_at: now,
            completed_at: None,
        };

        counter!(TASKS_SUBMIT_TOTAL, "name" => task.name.clone()).increment(1);

        let id = task.id;
        self.inner.lock().unwrap().tasks.insert(id, task);
        Ok(id)
    }

    async fn fetch(&self, id: TaskId) -> Result<Option<Task>, StoreError> {
        self.guard()?;
        Ok(self.inner.lock().unwrap().tasks.get(&id).cloned())
    }

    async fn poll(
        &self,
        queue: &str,
        batch_size: i64,
        runner: &dyn BatchRunner,
    ) -> Result<PollOutcome, StoreError> {
        self.guard()?;
        let now = Utc::now();

        // Claim phase: pick due rows and mark them in flight. The lock is
        // released before the runner executes.
        let batch: Vec<Task> = {
            let mut inner = self.inner.lock().unwrap();
            let Inner {
                tasks, in_flight, ..
            } = &mut *inner;

            let mut due: Vec<TaskId> = tasks
                .values()
                .filter(|t| {
                    t.queue == queue && t.is_eligible(now) && !in_flight.contains(&t.id)
                })
                .map(|t| t.id)
                .collect();
            due.sort_by(|a, b| {
                let ta = &tasks[a];
                let tb = &tasks[b];
                tb.priority
                    .cmp(&ta.priority)
                    .then(ta.scheduled_at.cmp(&tb.scheduled_at))
            });
            due.truncate(batch_size.max(0) as usize);

            due.iter()
                .map(|id| {
                    in_flight.insert(*id);
                    tasks[id].clone()
                })
                .collect()
        };

        if batch.is_empty() {
            return Ok(PollOutcome::Empty);
        }

        let claimed: Vec<TaskId> = batch.iter().map(|t| t.id).collect();
        let outcomes = runner.run_batch(batch).await;

        let mut inner = self.inner.lock().unwrap();
        for id in &claimed {
            inner.in_flight.remove(id);
        }
        for (id, disposition) in outcomes {
            let Some(task) = inner.tasks.get_mut(&id) else {
                continue;
            };
            let now = Utc::now();
            task.modified_at = now;
            match disposition {
                Disposition::Completed => {
                    task.status = TaskStatus::Completed;
                    task.completed_at = Some(now);
                }
                Disposition::Retry {
                    delay,
                    increment,
                    error,
                } => {
                    task.status = TaskStatus::Retry;
                    task.scheduled_at =
                        now + chrono::Duration::from_std(delay).unwrap_or_default();
                    task.retry_num += increment;
                    task.error = Some(error);
                }
                Disposition::Failed { error } => {
                    task.status = TaskStatus::Failed;
                    task.error = Some(error);
                }
            }
        }

        Ok(PollOutcome::Handled(claimed.len()))
    }

    async fn upsert_schedule(&self, id: &str, cron_expr: &str) -> Result<(), StoreError> {
        self.guard()?;
        self.inner
            .lock()
            .unwrap()
            .schedules
            .insert(id.to_string(), cron_expr.to_string());
        Ok(())
    }

    async fn fire_scheduled(
        &self,
        id: &str,
        firing: &dyn ScheduledFiring,
    ) -> Result<bool, StoreError> {
        self.guard()?;

        {
            let mut inner = self.inner.lock().unwrap();
            if !inner.schedules.contains_key(id) {
                return Ok(false);
            }
            if !inner.firing.insert(id.to_string()) {
                // Another node holds this firing window.
                return Ok(false);
            }
        }

        firing.fire().await;

        self.inner.lock().unwrap().firing.remove(id);
        Ok(true)
    }

    async fn stats(&self, queue: &str) -> Result<QueueStats, StoreError> {
        self.guard()?;
        let inner = self.inner.lock().unwrap();
        let mut stats = QueueStats::default();
        for task in inner.tasks.values().filter(|t| t.queue == queue) {
            match task.status {
                TaskStatus::New => stats.new += 1,
                TaskStatus::Retry => stats.retry += 1,
                TaskStatus::Completed => stats.completed += 1,
                TaskStatus::Failed => stats.failed += 1,
            }
        }
        Ok(stats)
    }
}
