//! The adaptive worker pool.
//!
//! The pool runs at most `max_worker_count` workers doing CPU work. A worker
//! that is about to wait on something other than the CPU (a lock, another
//! build, a file being produced) reports it through
//! [`BlockingCompensation`], and the pool may start another worker in its
//! place, up to `max_unconstrained_worker_count`.
//!
//! * [`WorkerThreadPoolHelper`]: the bookkeeping, no threads involved.
//! * [`ConditionalExecutionQueue`]: real threads on top of the helper.
//! * [`Synchronizer`]: a reentrant lock that reports its waits as blocking.

mod helper;
mod queue;
mod synchronizer;

use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{Receiver, channel};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ExecutionFailure, SharedError};

pub use crate::pool::helper::WorkerThreadPoolHelper;
pub use crate::pool::queue::ConditionalExecutionQueue;
pub use crate::pool::synchronizer::{SpanWaitDecorator, Synchronizer, WaitDecorator};

/// Receives the start and the end of blocking work on a worker thread.
pub trait BlockingCompensation: Send + Sync {
    fn notify_blocking_work_starting(&self);

    fn notify_blocking_work_finished(&self);
}

/// Reports blocking work for as long as it's alive, also on early return and
/// unwinding.
pub struct BlockingGuard<'a> {
    pool: &'a dyn BlockingCompensation,
}

impl<'a> BlockingGuard<'a> {
    pub fn new(pool: &'a dyn BlockingCompensation) -> Self {
        pool.notify_blocking_work_starting();
        Self { pool }
    }
}

impl Drop for BlockingGuard<'_> {
    fn drop(&mut self) {
        self.pool.notify_blocking_work_finished();
    }
}

/// How many workers the pool may run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "RawWorkerLimits")]
pub struct WorkerLimits {
    /// Workers doing CPU work.
    pub max_worker_count: usize,
    /// Hard ceiling, including workers started to replace blocked ones.
    pub max_unconstrained_worker_count: usize,
}

impl WorkerLimits {
    /// `max_worker_count` is at least one, and the ceiling is never below it.
    pub fn new(max_worker_count: usize, max_unconstrained_worker_count: usize) -> Self {
        let max_worker_count = max_worker_count.max(1);
        Self {
            max_worker_count,
            max_unconstrained_worker_count: max_unconstrained_worker_count.max(max_worker_count),
        }
    }
}

/// Limits as written in a config file, clamped by [`WorkerLimits::new`].
#[derive(Deserialize)]
struct RawWorkerLimits {
    max_worker_count: usize,
    max_unconstrained_worker_count: usize,
}

impl From<RawWorkerLimits> for WorkerLimits {
    fn from(raw: RawWorkerLimits) -> Self {
        Self::new(raw.max_worker_count, raw.max_unconstrained_worker_count)
    }
}

impl Default for WorkerLimits {
    fn default() -> Self {
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self::new(cpus, cpus * 4)
    }
}

/// Settings of a [`ConditionalExecutionQueue`].
///
/// ```rust
/// use workplan::ExecutionConfig;
///
/// let config = ExecutionConfig::default()
///     .with_max_workers(4)
///     .with_keep_alive_ms(0);
/// assert_eq!(config.worker_limits.max_worker_count, 4);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    pub worker_limits: WorkerLimits,
    /// How long an idle worker waits for more work before it exits.
    pub keep_alive_ms: u64,
    /// Prefix of the worker thread names.
    pub thread_name: String,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            worker_limits: WorkerLimits::default(),
            keep_alive_ms: 50,
            thread_name: String::from("workplan-worker"),
        }
    }
}

impl ExecutionConfig {
    pub fn with_worker_limits(mut self, limits: WorkerLimits) -> Self {
        self.worker_limits = limits;
        self
    }

    /// Sets the CPU worker count, keeping the ceiling at or above it.
    pub fn with_max_workers(mut self, max: usize) -> Self {
        self.worker_limits =
            WorkerLimits::new(max, self.worker_limits.max_unconstrained_worker_count);
        self
    }

    pub fn with_keep_alive_ms(mut self, keep_alive_ms: u64) -> Self {
        self.keep_alive_ms = keep_alive_ms;
        self
    }

    pub fn with_thread_name(mut self, name: impl Into<String>) -> Self {
        self.thread_name = name.into();
        self
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_millis(self.keep_alive_ms)
    }
}

pub type ExecutionResult<T> = Result<T, ExecutionFailure>;

type Action<T> = Box<dyn FnOnce() -> anyhow::Result<T> + Send>;
type Completion<T> = Box<dyn FnOnce(ExecutionResult<T>) + Send>;

/// A unit of work for the queue. The completion callback is called exactly
/// once: with the value, the error, the panic, or the cancellation.
pub struct Execution<T> {
    action: Action<T>,
    completion: Completion<T>,
}

impl<T: Send + 'static> Execution<T> {
    pub fn new<F>(action: F) -> Self
    where
        F: FnOnce() -> anyhow::Result<T> + Send + 'static,
    {
        Self {
            action: Box::new(action),
            completion: Box::new(|_| {}),
        }
    }

    pub fn on_complete<F>(mut self, completion: F) -> Self
    where
        F: FnOnce(ExecutionResult<T>) + Send + 'static,
    {
        self.completion = Box::new(completion);
        self
    }

    /// An execution whose result is delivered through a channel.
    pub fn with_channel<F>(action: F) -> (Self, Receiver<ExecutionResult<T>>)
    where
        F: FnOnce() -> anyhow::Result<T> + Send + 'static,
    {
        let (sender, receiver) = channel();
        let execution = Self::new(action).on_complete(move |result| {
            // the receiver may be gone, nobody is interested then
            let _ = sender.send(result);
        });
        (execution, receiver)
    }
}

impl<T> Execution<T> {
    pub(crate) fn run(self) {
        let Execution { action, completion } = self;

        let result = match panic::catch_unwind(AssertUnwindSafe(action)) {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => Err(ExecutionFailure::Failed(SharedError::from(err))),
            Err(panic) => Err(ExecutionFailure::Panicked(panic_message(panic.as_ref()))),
        };

        complete(completion, result);
    }

    pub(crate) fn cancel(self) {
        complete(self.completion, Err(ExecutionFailure::Cancelled));
    }
}

fn complete<T>(completion: Completion<T>, result: ExecutionResult<T>) {
    if let Err(panic) = panic::catch_unwind(AssertUnwindSafe(|| completion(result))) {
        tracing::error!("completion callback panicked: {}", panic_message(panic.as_ref()));
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        String::from("unknown payload")
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[test]
    fn test_worker_limits_are_clamped() {
        assert_eq!(WorkerLimits::new(0, 0), WorkerLimits::new(1, 1));
        assert_eq!(WorkerLimits::new(4, 2).max_unconstrained_worker_count, 4);
    }

    #[test]
    fn test_config_from_json() {
        let config: ExecutionConfig = serde_json::from_str(
            r#"{"worker_limits":{"max_worker_count":2,"max_unconstrained_worker_count":3}}"#,
        )
        .unwrap();

        assert_eq!(config.worker_limits, WorkerLimits::new(2, 3));
        assert_eq!(config.keep_alive_ms, 50);
        assert_eq!(config.thread_name, "workplan-worker");
    }

    #[test]
    fn test_limits_from_json_are_clamped() {
        let limits: WorkerLimits =
            serde_json::from_str(r#"{"max_worker_count":0,"max_unconstrained_worker_count":0}"#).unwrap();
        assert_eq!(limits, WorkerLimits::new(1, 1));

        let limits: WorkerLimits =
            serde_json::from_str(r#"{"max_worker_count":3,"max_unconstrained_worker_count":1}"#).unwrap();
        assert_eq!(limits.max_unconstrained_worker_count, 3);
    }

    #[test]
    fn test_completion_sees_value_error_and_panic() {
        let (ok, rx) = Execution::with_channel(|| Ok(1));
        ok.run();
        assert_eq!(rx.recv().unwrap().unwrap(), 1);

        let (failed, rx) = Execution::<i32>::with_channel(|| anyhow::bail!("boom"));
        failed.run();
        assert!(matches!(rx.recv().unwrap(), Err(ExecutionFailure::Failed(_))));

        let (panicked, rx) = Execution::<i32>::with_channel(|| panic!("oops"));
        panicked.run();
        assert!(matches!(rx.recv().unwrap(), Err(ExecutionFailure::Panicked(msg)) if msg == "oops"));

        let (cancelled, rx) = Execution::<i32>::with_channel(|| Ok(1));
        cancelled.cancel();
        assert!(matches!(rx.recv().unwrap(), Err(ExecutionFailure::Cancelled)));
    }

    #[test]
    fn test_panicking_completion_is_contained() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();

        Execution::new(|| Ok(()))
            .on_complete(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                panic!("callback");
            })
            .run();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
