//! The store contract shared by the Postgres and in-memory backends.

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use drudge_core::{Disposition, Task, TaskId};

use crate::error::StoreError;

/// Request to enqueue one task.
///
/// Framework metadata is carried as typed fields; `props` is the opaque
/// handler payload and is never inspected by the framework.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub name: String,
    pub props: serde_json::Value,
    pub queue: String,
    pub priority: i32,
    pub max_retries: i32,
    /// Offset from submit time to the first eligibility.
    pub delay: Duration,
}

impl NewTask {
    pub fn new(name: impl Into<String>, props: serde_json::Value) -> Self {
        Self {
            name: name.into(),
            props,
            queue: "default".to_string(),
            priority: 100,
            max_retries: 3,
            delay: Duration::ZERO,
        }
    }

    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = queue.into();
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_retries(mut self, max_retries: i32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub(crate) fn validate(&self) -> Result<(), StoreError> {
        if self.name.trim().is_empty() {
            return Err(StoreError::Validation("task name is required".to_string()));
        }
        if self.max_retries < 0 {
            return Err(StoreError::Validation(
                "max_retries must not be negative".to_string(),
            ));
        }
        Ok(())
    }
}

/// Result of one poll step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// No eligible rows were found.
    Empty,
    /// The given number of rows were claimed and processed.
    Handled(usize),
}

/// Per-status row counts for one queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub new: u64,
    pub retry: u64,
    pub completed: u64,
    pub failed: u64,
}

/// Executes a claimed batch while the poll step holds the row locks.
#[async_trait]
pub trait BatchRunner: Send + Sync {
    /// Run every task in the batch and return one disposition per task, in
    /// claim order.
    async fn run_batch(&self, batch: Vec<Task>) -> Vec<(TaskId, Disposition)>;
}

/// Invoked when a node wins the row lock for a cron firing window.
#[async_trait]
pub trait ScheduledFiring: Send + Sync {
    async fn fire(&self);
}

/// Storage backend for tasks and cron entries.
///
/// The Postgres implementation is the production backend; the in-memory
/// implementation backs tests and development setups.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Insert a new task row and return its id.
    async fn submit(&self, new_task: NewTask) -> Result<TaskId, StoreError>;

    async fn fetch(&self, id: TaskId) -> Result<Option<Task>, StoreError>;

    /// One poll step: claim up to `batch_size` due tasks on `queue`, hand
    /// them to `runner`, and persist the dispositions atomically. Claimed
    /// rows stay invisible to competing workers until the step finishes.
    async fn poll(
        &self,
        queue: &str,
        batch_size: i64,
        runner: &dyn BatchRunner,
    ) -> Result<PollOutcome, StoreError>;

    /// Register or rewrite a cron entry. A rewrite changes future firings
    /// only.
    async fn upsert_schedule(&self, id: &str, cron_expr: &str) -> Result<(), StoreError>;

    /// Run one firing under the entry's row lock. Returns whether this node
    /// won the lock and fired; losers skip silently.
    async fn fire_scheduled(
        &self,
        id: &str,
        firing: &dyn ScheduledFiring,
    ) -> Result<bool, StoreError>;

    async fn stats(&self, queue: &str) -> Result<QueueStats, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_task_defaults_match_the_submit_contract() {
        let new_task = NewTask::new("send-email", serde_json::json!({"to": "a@b.c"}));
        assert_eq!(new_task.queue, "default");
        assert_eq!(new_task.priority, 100);
        assert_eq!(new_task.max_retries, 3);
        assert_eq!(new_task.delay, Duration::ZERO);
    }

    #[test]
    fn builder_methods_override_defaults() {
        let new_task = NewTask::new("send-email", serde_json::json!({}))
            .with_queue("mail")
            .with_priority(7)
            .with_max_retries(1)
            .with_delay(Duration::from_secs(30));
        assert_eq!(new_task.queue, "mail");
        assert_eq!(new_task.priority, 7);
        assert_eq!(new_task.max_retries, 1);
        assert_eq!(new_task.delay, Duration::from_secs(30));
    }

    #[test]
    fn blank_task_name_fails_validation() {
        let new_task = NewTask::new("  ", serde_json::json!({}));
        assert!(matches!(
            new_task.validate(),
            Err(StoreError::Validation(_))
        ));
    }

    #[test]
    fn negative_retry_budget_fails_validation() {
        let new_task = NewTask::new("job", serde_json::json!({})).with_max_retries(-1);
        assert!(matches!(
            new_task.validate(),
            Err(StoreError::Validation(_))
        ));
    }
}
