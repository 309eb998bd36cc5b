//! Handler outcomes and the retry decision that turns them into row updates.

use std::time::Duration;

use crate::task::Task;

/// Retry delay applied when the handler gives no explicit delay.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(10);

/// How a controlled retry affects the attempt counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RetryStrategy {
    /// Count the retry against `max_retries`.
    #[default]
    Counted,
    /// Defer the task without consuming an attempt.
    Noop,
}

/// Tagged outcome returned by a task handler.
#[derive(Debug, Clone)]
pub enum TaskResult {
    /// Handler finished normally.
    Completed,
    /// Controlled retry signal from the handler.
    Retry {
        delay: Option<Duration>,
        strategy: RetryStrategy,
    },
    /// Uncontrolled failure; subject to the `max_retries` budget.
    Failed(String),
}

impl TaskResult {
    /// Controlled retry after [`DEFAULT_RETRY_DELAY`].
    pub fn retry() -> Self {
        TaskResult::Retry {
            delay: None,
            strategy: RetryStrategy::Counted,
        }
    }

    /// Controlled retry after the given delay.
    pub fn retry_after(delay: Duration) -> Self {
        TaskResult::Retry {
            delay: Some(delay),
            strategy: RetryStrategy::Counted,
        }
    }

    /// Deferral without cost: reschedules the task but leaves `retry_num`
    /// untouched.
    pub fn defer() -> Self {
        TaskResult::Retry {
            delay: None,
            strategy: RetryStrategy::Noop,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        TaskResult::Failed(error.into())
    }
}

/// Persisted effect of one execution, written back while the poll
/// transaction still holds the row lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    Completed,
    Retry {
        delay: Duration,
        increment: i32,
        error: String,
    },
    Failed {
        error: String,
    },
}

/// Maps a handler outcome onto the task's retry state.
///
/// A controlled retry always keeps the task in `retry`; its increment is
/// clamped so `retry_num` never exceeds `max_retries`. An uncontrolled
/// failure retries while attempts remain and otherwise settles as `failed`.
pub fn resolve(task: &Task, result: TaskResult) -> Disposition {
    match result {
        TaskResult::Completed => Disposition::Completed,
        TaskResult::Retry { delay, strategy } => {
            let increment = match strategy {
                RetryStrategy::Noop => 0,
                RetryStrategy::Counted if task.retry_num >= task.max_retries => 0,
                RetryStrategy::Counted => 1,
            };
            Disposition::Retry {
                delay: delay.unwrap_or(DEFAULT_RETRY_DELAY),
                increment,
                error: "retry requested by handler".to_string(),
            }
        }
        TaskResult::Failed(error) => {
            if task.retry_num < task.max_retries {
                Disposition::Retry {
                    delay: DEFAULT_RETRY_DELAY,
                    increment: 1,
                    error,
                }
            } else {
                Disposition::Failed { error }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{TaskId, TaskStatus};
    use chrono::Utc;

    fn task_with_retries(retry_num: i32, max_retries: i32) -> Task {
        let now = Utc::now();
        Task {
            id: TaskId::new(),
            name: "flaky".to_string(),
            props: serde_json::json!({}),
            queue: "default".to_string(),
            priority: 100,
            max_retries,
            retry_num,
            status: TaskStatus::New,
            error: None,
            scheduled_at: now,
            modified_at: now,
            completed_at: None,
        }
    }

    #[test]
    fn completed_result_completes() {
        let task = task_with_retries(0, 3);
        assert_eq!(resolve(&task, TaskResult::Completed), Disposition::Completed);
    }

    #[test]
    fn controlled_retry_carries_its_delay_and_increments() {
        let task = task_with_retries(0, 3);
        let disposition = resolve(&task, TaskResult::retry_after(Duration::from_secs(2)));
        assert_eq!(
            disposition,
            Disposition::Retry {
                delay: Duration::from_secs(2),
                increment: 1,
                error: "retry requested by handler".to_string(),
            }
        );
    }

    #[test]
    fn controlled_retry_without_delay_uses_the_default() {
        let task = task_with_retries(0, 3);
        match resolve(&task, TaskResult::retry()) {
            Disposition::Retry { delay, .. } => assert_eq!(delay, DEFAULT_RETRY_DELAY),
            other => panic!("expected retry, got {other:?}"),
        }
    }

    #[test]
    fn noop_retry_never_increments() {
        let task = task_with_retries(2, 3);
        match resolve(&task, TaskResult::defer()) {
            Disposition::Retry { increment, delay, .. } => {
                assert_eq!(increment, 0);
                assert_eq!(delay, DEFAULT_RETRY_DELAY);
            }
            other => panic!("expected retry, got {other:?}"),
        }
    }

    #[test]
    fn controlled_retry_increment_is_clamped_at_the_budget() {
        let task = task_with_retries(3, 3);
        match resolve(&task, TaskResult::retry()) {
            Disposition::Retry { increment, .. } => assert_eq!(increment, 0),
            other => panic!("expected retry, got {other:?}"),
        }
    }

    #[test]
    fn uncontrolled_failure_retries_while_budget_remains() {
        let task = task_with_retries(0, 1);
        match resolve(&task, TaskResult::failed("boom")) {
            Disposition::Retry { increment, error, .. } => {
                assert_eq!(increment, 1);
                assert_eq!(error, "boom");
            }
            other => panic!("expected retry, got {other:?}"),
        }
    }

    #[test]
    fn uncontrolled_failure_settles_as_failed_when_exhausted() {
        let task = task_with_retries(1, 1);
        assert_eq!(
            resolve(&task, TaskResult::failed("boom")),
            Disposition::Failed {
                error: "boom".to_string()
            }
        );
    }

    #[test]
    fn zero_max_retries_fails_on_first_uncontrolled_error() {
        let task = task_with_retries(0, 0);
        assert!(matches!(
            resolve(&task, TaskResult::failed("boom")),
            Disposition::Failed { .. }
        ));
    }
}
