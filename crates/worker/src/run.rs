//! Task execution: handler dispatch, outcome resolution, metrics.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use metrics::histogram;
use tracing::warn;

use drudge_core::{resolve, Disposition, Task, TaskId, TaskRegistry, TaskResult};
use drudge_observability::metrics::{TASKS_CHECKOUT_TIMING, TASKS_TIMING};
use drudge_store::BatchRunner;

use crate::executor::Executor;

/// Runs every task of a claimed batch through its registered handler on
/// the executor pool.
pub(crate) struct BatchExecution {
    tasks: TaskRegistry,
    executor: Arc<Executor>,
}

impl BatchExecution {
    pub(crate) fn new(tasks: TaskRegistry, executor: Arc<Executor>) -> Self {
        Self { tasks, executor }
    }

    fn dispatch(&self, task: Task) -> Dispatched {
        let lag = (Utc::now() - task.scheduled_at).num_milliseconds().max(0) as f64 / 1000.0;
        histogram!(TASKS_CHECKOUT_TIMING).record(lag);

        let Some(handler) = self.tasks.get(&task.name) else {
            // Completing unknown names keeps a poison row from being
            // reclaimed forever.
            warn!(task = %task.name, id = %task.id, "no handler registered; marking task completed");
            return Dispatched::Immediate(task.id, Disposition::Completed);
        };
        let handler = handler.clone();

        let job = task.clone();
        match self.executor.submit(move || {
            let started = Instant::now();
            let result = handler(&job);
            histogram!(TASKS_TIMING, "name" => job.name.clone())
                .record(started.elapsed().as_secs_f64());
            result
        }) {
            Ok(join) => Dispatched::Running { task, join },
            Err(_) => Dispatched::Immediate(
                task.id,
                // Shutdown beat us to the dispatch; leave the row claimable
                // without consuming an attempt.
                Disposition::Retry {
                    delay: Duration::ZERO,
                    increment: 0,
                    error: "executor shut down before dispatch".to_string(),
                },
            ),
        }
    }
}

#[async_trait]
impl BatchRunner for BatchExecution {
    async fn run_batch(&self, batch: Vec<Task>) -> Vec<(TaskId, Disposition)> {
        // Dispatch everything first so the batch runs concurrently on the
        // pool, then collect in claim order.
        let mut in_flight = Vec::with_capacity(batch.len());
        for task in batch {
            in_flight.push(self.dispatch(task));
        }

        let mut outcomes = Vec::with_capacity(in_flight.len());
        for entry in in_flight {
            outcomes.push(entry.finish().await);
        }
        outcomes
    }
}

enum Dispatched {
    /// Decided without running a handler.
    Immediate(TaskId, Disposition),
    Running {
        task: Task,
        join: tokio::task::JoinHandle<TaskResult>,
    },
}

impl Dispatched {
    async fn finish(self) -> (TaskId, Disposition) {
        match self {
            Dispatched::Immediate(id, disposition) => (id, disposition),
            Dispatched::Running { task, join } => {
                let result = match join.await {
                    Ok(result) => result,
                    Err(err) if err.is_panic() => {
                        TaskResult::Failed(format!("handler panicked: {err}"))
                    }
                    Err(_) => TaskResult::Failed("handler cancelled during shutdown".to_string()),
                };
                (task.id, resolve(&task, result))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use drudge_core::{RetryStrategy, TaskStatus, DEFAULT_RETRY_DELAY};

    fn sample_task(name: &str, retry_num: i32, max_retries: i32) -> Task {
        let now = Utc::now();
        Task {
            id: TaskId::new(),
            name: name.to_string(),
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

    fn execution(registry: TaskRegistry) -> (BatchExecution, Arc<Executor>) {
        let executor = Arc::new(Executor::new(
            crate::executor::ExecutorConfig::default().with_name("run-test"),
        ));
        (BatchExecution::new(registry, executor.clone()), executor)
    }

    #[tokio::test]
    async fn successful_handler_completes_the_task() {
        let registry = TaskRegistry::builder()
            .register("noop", |_task| TaskResult::Completed)
            .build();
        let (execution, executor) = execution(registry);

        let task = sample_task("noop", 0, 3);
        let id = task.id;
        let outcomes = execution.run_batch(vec![task]).await;
        assert_eq!(outcomes, vec![(id, Disposition::Completed)]);
        executor.shutdown();
    }

    #[tokio::test]
    async fn unknown_handler_is_completed_with_a_warning() {
        let (execution, executor) = execution(TaskRegistry::default());

        let task = sample_task("nobody-home", 0, 3);
        let id = task.id;
        let outcomes = execution.run_batch(vec![task]).await;
        assert_eq!(outcomes, vec![(id, Disposition::Completed)]);
        executor.shutdown();
    }

    #[tokio::test]
    async fn controlled_retry_signal_is_resolved() {
        let registry = TaskRegistry::builder()
            .register("flaky", |_task| TaskResult::Retry {
                delay: Some(Duration::from_secs(2)),
                strategy: RetryStrategy::Counted,
            })
            .build();
        let (execution, executor) = execution(registry);

        let task = sample_task("flaky", 0, 3);
        let outcomes = execution.run_batch(vec![task]).await;
        match &outcomes[0].1 {
            Disposition::Retry {
                delay, increment, ..
            } => {
                assert_eq!(*delay, Duration::from_secs(2));
                assert_eq!(*increment, 1);
            }
            other => panic!("expected retry, got {other:?}"),
        }
        executor.shutdown();
    }

    #[tokio::test]
    async fn panicking_handler_counts_as_uncontrolled_failure() {
        let registry = TaskRegistry::builder()
            .register("bomb", |_task| -> TaskResult { panic!("kaboom") })
            .build();
        let (execution, executor) = execution(registry);

        let exhausted = sample_task("bomb", 1, 1);
        let outcomes = execution.run_batch(vec![exhausted]).await;
        match &outcomes[0].1 {
            Disposition::Failed { error } => assert!(error.contains("panicked")),
            other => panic!("expected failed, got {other:?}"),
        }
        executor.shutdown();
    }

    #[tokio::test]
    async fn failure_before_exhaustion_retries_with_default_delay() {
        let registry = TaskRegistry::builder()
            .register("flaky", |_task| TaskResult::failed("boom"))
            .build();
        let (execution, executor) = execution(registry);

        let task = sample_task("flaky", 0, 3);
        let outcomes = execution.run_batch(vec![task]).await;
        match &outcomes[0].1 {
            Disposition::Retry {
                delay,
                increment,
                error,
            } => {
                assert_eq!(*delay, DEFAULT_RETRY_DELAY);
                assert_eq!(*increment, 1);
                assert_eq!(error, "boom");
            }
            other => panic!("expected retry, got {other:?}"),
        }
        executor.shutdown();
    }

    #[tokio::test]
    async fn batch_outcomes_preserve_claim_order() {
        let registry = TaskRegistry::builder()
            .register("a", |_task| TaskResult::Completed)
            .register("b", |_task| TaskResult::failed("boom"))
            .build();
        let (execution, executor) = execution(registry);

        let first = sample_task("a", 0, 3);
        let second = sample_task("b", 3, 3);
        let ids = vec![first.id, second.id];
        let outcomes = execution.run_batch(vec![first, second]).await;

        assert_eq!(
            outcomes.iter().map(|(id, _)| *id).collect::<Vec<_>>(),
            ids
        );
        assert!(matches!(outcomes[0].1, Disposition::Completed));
        assert!(matches!(outcomes[1].1, Disposition::Failed { .. }));
        executor.shutdown();
    }
}
