//! Bounded executor backing handler invocations and DB polls.
//!
//! Wraps a dedicated tokio runtime. Handler closures run on its blocking
//! pool, which grows on demand up to `max_threads` and reaps idle threads
//! after `idle_timeout`. The single-thread variant backs the scheduler
//! timer so firings of one node are armed in a deterministic order.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use tokio::runtime::{Builder, Handle, Runtime};
use tokio::task::JoinHandle;

/// Grace period for in-flight work during executor teardown.
const SHUTDOWN_GRACE: Duration = Duration::from_millis(500);

/// Executor configuration.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Async worker threads carrying poll futures and timers. Values below
    /// one are rounded up; handler threads are separate.
    pub min_threads: usize,
    /// Upper bound on concurrently running handler threads.
    pub max_threads: usize,
    /// Idle handler threads are reaped after this long.
    pub idle_timeout: Duration,
    /// Thread name, also used in log records.
    pub name: String,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            min_threads: 0,
            max_threads: 256,
            idle_timeout: Duration::from_secs(60),
            name: "drudge-executor".to_string(),
        }
    }
}

impl ExecutorConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_min_threads(mut self, min_threads: usize) -> Self {
        self.min_threads = min_threads;
        self
    }

    pub fn with_max_threads(mut self, max_threads: usize) -> Self {
        self.max_threads = max_threads;
        self
    }

    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }
}

/// The executor no longer accepts work.
#[derive(Debug, Clone, Copy, thiserror::Error)]
#[error("executor is shut down")]
pub struct ExecutorClosed;

/// Bounded pool for handler invocations, polls, and delayed firings.
pub struct Executor {
    handle: Handle,
    runtime: Mutex<Option<Runtime>>,
    closed: AtomicBool,
}

impl Executor {
    pub fn new(config: ExecutorConfig) -> Self {
        let runtime = Builder::new_multi_thread()
            .worker_threads(config.min_threads.max(1))
            .max_blocking_threads(config.max_threads.max(1))
            .thread_keep_alive(config.idle_timeout)
            .thread_name(config.name.clone())
            .enable_all()
            .build()
            .expect("failed to build executor runtime");

        Self {
            handle: runtime.handle().clone(),
            runtime: Mutex::new(Some(runtime)),
            closed: AtomicBool::new(false),
        }
    }

    /// Single-threaded variant for deterministic timer ordering.
    pub fn single_thread(name: impl Into<String>) -> Self {
        Self::new(
            ExecutorConfig::default()
                .with_name(name)
                .with_min_threads(1)
                .with_max_threads(1),
        )
    }

    /// Run a blocking closure on the pool.
    pub fn submit<F, T>(&self, f: F) -> Result<JoinHandle<T>, ExecutorClosed>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        if self.is_closed() {
            return Err(ExecutorClosed);
        }
        Ok(self.handle.spawn_blocking(f))
    }

    /// Run a future on the executor's async workers.
    pub fn spawn<F>(&self, future: F) -> Result<JoinHandle<F::Output>, ExecutorClosed>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        if self.is_closed() {
            return Err(ExecutorClosed);
        }
        Ok(self.handle.spawn(future))
    }

    /// Run `f` after `delay`. The returned handle cancels the firing as
    /// long as it has not started.
    pub fn schedule<F>(&self, delay: Duration, f: F) -> Result<ScheduledTask, ExecutorClosed>
    where
        F: FnOnce() + Send + 'static,
    {
        let handle = self.spawn(async move {
            tokio::time::sleep(delay).await;
            f();
        })?;
        Ok(ScheduledTask { handle })
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Stop accepting work, give in-flight tasks the 500 ms grace period,
    /// then tear the pool down. Blocks the calling thread for at most the
    /// grace period.
    pub fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let runtime = self.runtime.lock().unwrap().take();
        if let Some(runtime) = runtime {
            // A runtime must not be dropped from async context; hand the
            // teardown to a plain thread and wait for it.
            let joiner = std::thread::spawn(move || runtime.shutdown_timeout(SHUTDOWN_GRACE));
            let _ = joiner.join();
        }
    }
}

impl Drop for Executor {
    fn drop(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
        if let Some(runtime) = self.runtime.lock().unwrap().take() {
            std::thread::spawn(move || runtime.shutdown_timeout(SHUTDOWN_GRACE));
        }
    }
}

impl std::fmt::Debug for Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executor")
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Cancel handle for a delayed firing.
#[derive(Debug)]
pub struct ScheduledTask {
    handle: JoinHandle<()>,
}

impl ScheduledTask {
    pub fn cancel(&self) {
        self.handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn submitted_work_runs() {
        let executor = Executor::new(ExecutorConfig::default().with_name("test-exec"));
        let (tx, rx) = mpsc::channel();

        executor
            .submit(move || tx.send(41 + 1).unwrap())
            .expect("executor should accept work");

        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 42);
        executor.shutdown();
    }

    #[test]
    fn scheduled_work_fires_after_the_delay() {
        let executor = Executor::single_thread("test-timer");
        let (tx, rx) = mpsc::channel();

        executor
            .schedule(Duration::from_millis(10), move || tx.send(()).unwrap())
            .unwrap();

        assert!(rx.recv_timeout(Duration::from_secs(5)).is_ok());
        executor.shutdown();
    }

    #[test]
    fn cancelled_schedule_does_not_fire() {
        let executor = Executor::single_thread("test-timer");
        let (tx, rx) = mpsc::channel::<()>();

        let scheduled = executor
            .schedule(Duration::from_secs(30), move || tx.send(()).unwrap())
            .unwrap();
        scheduled.cancel();

        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
        executor.shutdown();
    }

    #[test]
    fn shutdown_rejects_new_work() {
        let executor = Executor::new(ExecutorConfig::default());
        executor.shutdown();

        assert!(executor.is_closed());
        assert!(executor.submit(|| ()).is_err());
        assert!(executor.spawn(async {}).is_err());
    }

    #[test]
    fn config_defaults() {
        let config = ExecutorConfig::default();
        assert_eq!(config.min_threads, 0);
        assert_eq!(config.max_threads, 256);
        assert_eq!(config.idle_timeout, Duration::from_secs(60));
    }
}
