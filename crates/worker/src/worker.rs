//! Polling event loop: claims batches of due tasks and records outcomes.
//!
//! One loop per worker instance, bound to exactly one queue. Each
//! iteration submits a poll step to the executor and then selects between
//! the shutdown signal and the poll future, with shutdown winning ties.
//! Transient database failures back the loop off by one poll interval;
//! pool closure and executor teardown end it.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use drudge_core::TaskRegistry;
use drudge_store::{ErrorClass, PollOutcome, StoreError, TaskStore};

use crate::executor::Executor;
use crate::run::BatchExecution;

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub name: String,
    /// Queue this worker is bound to. Workers subscribe to exactly one.
    pub queue: String,
    /// Maximum rows claimed per poll step.
    pub batch_size: i64,
    /// Sleep between polls when the queue is empty or errored.
    pub poll_interval: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            name: "drudge-worker".to_string(),
            queue: "default".to_string(),
            batch_size: 2,
            poll_interval: Duration::from_secs(5),
        }
    }
}

impl WorkerConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = queue.into();
        self
    }

    pub fn with_batch_size(mut self, batch_size: i64) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }
}

/// Handle to control and join a running worker.
#[derive(Debug)]
pub struct WorkerHandle {
    shutdown: CancellationToken,
    join: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    /// Request graceful shutdown and wait for the loop to stop.
    ///
    /// The loop exits at its next selection point; an in-flight poll step
    /// keeps running on the executor and drains within the executor's
    /// shutdown grace period.
    pub async fn shutdown(mut self) {
        self.shutdown.cancel();
        if let Some(join) = self.join.take() {
            let _ = join.await;
        }
    }
}

pub struct Worker;

impl Worker {
    /// Spawn the polling loop onto the current tokio runtime.
    pub fn spawn(
        store: Arc<dyn TaskStore>,
        tasks: TaskRegistry,
        executor: Arc<Executor>,
        config: WorkerConfig,
    ) -> WorkerHandle {
        let shutdown = CancellationToken::new();
        let join = tokio::spawn(worker_loop(
            store,
            tasks,
            executor,
            config,
            shutdown.clone(),
        ));
        WorkerHandle {
            shutdown,
            join: Some(join),
        }
    }
}

/// What the loop does after one poll step.
enum LoopStep {
    /// Work was handled; poll again immediately.
    Resume,
    /// Nothing to do or a transient failure; sleep one poll interval.
    Backoff,
    /// The loop is done.
    Stop,
}

async fn worker_loop(
    store: Arc<dyn TaskStore>,
    tasks: TaskRegistry,
    executor: Arc<Executor>,
    config: WorkerConfig,
    shutdown: CancellationToken,
) {
    info!(worker = %config.name, queue = %config.queue, "worker started");
    let runner = Arc::new(BatchExecution::new(tasks, executor.clone()));

    loop {
        if shutdown.is_cancelled() {
            break;
        }

        let poll = {
            let store = store.clone();
            let runner = runner.clone();
            let queue = config.queue.clone();
            let batch_size = config.batch_size;
            let step =
                async move { store.poll(&queue, batch_size, runner.as_ref()).await };
            match executor.spawn(step) {
                Ok(handle) => handle,
                Err(_) => {
                    // Nothing can run without the executor.
                    info!(worker = %config.name, "executor closed; stopping");
                    break;
                }
            }
        };

        let step = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            step = poll => step,
        };

        let next = match step {
            Ok(outcome) => handle_poll_result(&config, &shutdown, outcome),
            Err(err) if err.is_panic() => {
                let correlation_id = Uuid::new_v4();
                error!(worker = %config.name, %correlation_id, error = %err, "poll step panicked");
                LoopStep::Backoff
            }
            Err(_) => {
                // Cancelled by executor teardown.
                info!(worker = %config.name, "executor closed; stopping");
                LoopStep::Stop
            }
        };

        match next {
            LoopStep::Resume => continue,
            LoopStep::Stop => break,
            LoopStep::Backoff => {
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(config.poll_interval) => {}
                }
            }
        }
    }

    info!(worker = %config.name, "worker stopped");
}

fn handle_poll_result(
    config: &WorkerConfig,
    shutdown: &CancellationToken,
    outcome: Result<PollOutcome, StoreError>,
) -> LoopStep {
    match outcome {
        Ok(PollOutcome::Handled(count)) => {
            debug!(worker = %config.name, count, "processed batch");
            LoopStep::Resume
        }
        Ok(PollOutcome::Empty) => LoopStep::Backoff,
        Err(err) => match err.class() {
            ErrorClass::ConnectionLost => {
                warn!(worker = %config.name, error = %err, "database connection lost; backing off");
                LoopStep::Backoff
            }
            ErrorClass::Serialization => {
                debug!(worker = %config.name, error = %err, "serialization conflict; backing off");
                LoopStep::Backoff
            }
            ErrorClass::PoolClosed => {
                info!(worker = %config.name, "connection pool closed; stopping");
                shutdown.cancel();
                LoopStep::Stop
            }
            ErrorClass::Other => {
                let correlation_id = Uuid::new_v4();
                error!(worker = %config.name, %correlation_id, error = %err, "poll step failed");
                LoopStep::Backoff
            }
        },
    }
}
