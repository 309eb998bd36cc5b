//! Task identity, status machine, and the persisted row model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique task identifier, assigned at submit time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Task execution status.
///
/// Transitions form a DAG: `new` and `retry` may move to any of `retry`,
/// `completed`, or `failed`. The terminal states never change again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Submitted, not yet picked up.
    New,
    /// Came back from a handler with a retry decision; waits for its
    /// rescheduled time.
    Retry,
    /// Handler finished normally.
    Completed,
    /// Retry budget exhausted by uncontrolled failures.
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::New => "new",
            TaskStatus::Retry => "retry",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }

    /// Whether a worker may still claim the task.
    pub fn is_runnable(&self) -> bool {
        matches!(self, TaskStatus::New | TaskStatus::Retry)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("unknown task status: {0}")]
pub struct ParseStatusError(pub String);

impl std::str::FromStr for TaskStatus {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "new" => Ok(TaskStatus::New),
            "retry" => Ok(TaskStatus::Retry),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            other => Err(ParseStatusError(other.to_string())),
        }
    }
}

/// One submitted task row.
///
/// `props` is an opaque payload owned by the handler; the framework never
/// inspects it beyond (de)serialization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    /// Handler key. Workers look this up in their [`crate::TaskRegistry`].
    pub name: String,
    pub props: serde_json::Value,
    pub queue: String,
    /// Higher runs first at equal scheduled time.
    pub priority: i32,
    pub max_retries: i32,
    pub retry_num: i32,
    pub status: TaskStatus,
    pub error: Option<String>,
    /// Wall clock at which the task becomes eligible.
    pub scheduled_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Whether the task is due for execution at `now`.
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        self.status.is_runnable() && self.scheduled_at <= now
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_task(status: TaskStatus) -> Task {
        let now = Utc::now();
        Task {
            id: TaskId::new(),
            name: "noop".to_string(),
            props: serde_json::json!({}),
            queue: "default".to_string(),
            priority: 100,
            max_retries: 3,
            retry_num: 0,
            status,
            error: None,
            scheduled_at: now,
            modified_at: now,
            completed_at: None,
        }
    }

    #[test]
    fn status_round_trips_through_strings() {
        for status in [
            TaskStatus::New,
            TaskStatus::Retry,
            TaskStatus::Completed,
            TaskStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<TaskStatus>().unwrap(), status);
        }
    }

    #[test]
    fn unknown_status_fails_to_parse() {
        assert!("running".parse::<TaskStatus>().is_err());
    }

    #[test]
    fn terminal_statuses_are_not_runnable() {
        assert!(TaskStatus::New.is_runnable());
        assert!(TaskStatus::Retry.is_runnable());
        assert!(!TaskStatus::Completed.is_runnable());
        assert!(!TaskStatus::Failed.is_runnable());
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(!TaskStatus::Retry.is_terminal());
    }

    #[test]
    fn due_new_task_is_eligible() {
        let task = sample_task(TaskStatus::New);
        assert!(task.is_eligible(Utc::now()));
    }

    #[test]
    fn future_task_is_not_eligible() {
        let mut task = sample_task(TaskStatus::Retry);
        task.scheduled_at = Utc::now() + chrono::Duration::minutes(5);
        assert!(!task.is_eligible(Utc::now()));
    }

    #[test]
    fn completed_task_is_not_eligible() {
        let task = sample_task(TaskStatus::Completed);
        assert!(!task.is_eligible(Utc::now()));
    }

    #[test]
    fn task_ids_are_time_ordered() {
        let a = TaskId::new();
        let b = TaskId::new();
        assert!(a.as_uuid() <= b.as_uuid());
    }
}
