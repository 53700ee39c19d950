use std::collections::HashSet;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::error::PoolError;
use crate::lease::WorkerLeaseService;
use crate::pool::{
    BlockingCompensation, Execution, ExecutionConfig, ExecutionResult, Synchronizer,
    WorkerThreadPoolHelper,
};

struct PoolState<T> {
    helper: WorkerThreadPoolHelper<Execution<T>>,
    stopped: bool,
    /// Threads currently running a worker loop.
    workers: HashSet<ThreadId>,
    handles: Vec<JoinHandle<()>>,
}

struct Shared<T> {
    state: Mutex<PoolState<T>>,
    work_available: Condvar,
    workers_done: Condvar,
    keep_alive: Duration,
    leases: Arc<WorkerLeaseService>,
    thread_name: String,
    spawned: AtomicUsize,
    this: Weak<Shared<T>>,
}

/// Runs submitted executions on a pool that grows while workers are blocked
/// and shrinks back to zero when there is nothing to do.
///
/// Every worker runs on an OS thread of its own. Lock ownership is tracked
/// per thread, so two executions must never share one.
pub struct ConditionalExecutionQueue<T: Send + 'static> {
    shared: Arc<Shared<T>>,
}

impl<T: Send + 'static> ConditionalExecutionQueue<T> {
    pub fn new(config: &ExecutionConfig, leases: Arc<WorkerLeaseService>) -> Self {
        let limits = config.worker_limits;

        tracing::debug!(
            "starting execution queue with {} workers, {} at most",
            limits.max_worker_count,
            limits.max_unconstrained_worker_count
        );

        Self {
            shared: Arc::new_cyclic(|this| Shared {
                state: Mutex::new(PoolState {
                    helper: WorkerThreadPoolHelper::new(limits),
                    stopped: false,
                    workers: HashSet::new(),
                    handles: Vec::new(),
                }),
                work_available: Condvar::new(),
                workers_done: Condvar::new(),
                keep_alive: config.keep_alive(),
                leases,
                thread_name: config.thread_name.clone(),
                spawned: AtomicUsize::new(0),
                this: this.clone(),
            }),
        }
    }

    /// Queues an execution, starting a worker when the pool has room for one.
    ///
    /// Fails with [`PoolError::Spawn`] only when no worker is left to pick
    /// the execution up. The execution is then dropped without running.
    pub fn submit(&self, execution: Execution<T>) -> Result<(), PoolError> {
        let mut state = self.shared.state.lock();
        if state.stopped {
            return Err(PoolError::Stopped);
        }

        if state.helper.submit(execution) {
            if let Err(err) = self.shared.start_worker(&mut state) {
                if state.helper.worker_count() == 0 {
                    drop(state.helper.withdraw_last());
                    return Err(PoolError::Spawn(err));
                }
                tracing::warn!("failed to start an extra worker: {err}");
            }
        }
        self.shared.work_available.notify_one();
        Ok(())
    }

    /// Queues `action` and returns the channel its result arrives on.
    pub fn submit_fn<F>(&self, action: F) -> Result<Receiver<ExecutionResult<T>>, PoolError>
    where
        F: FnOnce() -> anyhow::Result<T> + Send + 'static,
    {
        let (execution, receiver) = Execution::with_channel(action);
        self.submit(execution)?;
        Ok(receiver)
    }

    /// Cancels the queued executions and waits for the running ones. Called
    /// from one of the queue's own workers, it doesn't wait.
    pub fn stop(&self) {
        let mut state = self.shared.state.lock();
        let on_worker = state.workers.contains(&thread::current().id());
        let cancelled = if state.stopped {
            Vec::new()
        } else {
            state.stopped = true;
            state.helper.drain()
        };
        self.shared.work_available.notify_all();

        while !on_worker && state.helper.worker_count() > 0 {
            self.shared.workers_done.wait(&mut state);
        }
        let handles = if on_worker {
            Vec::new()
        } else {
            std::mem::take(&mut state.handles)
        };
        drop(state);

        for handle in handles {
            if handle.join().is_err() {
                tracing::error!("worker thread panicked");
            }
        }

        if !cancelled.is_empty() {
            tracing::debug!("cancelling {} queued executions", cancelled.len());
        }
        for execution in cancelled {
            execution.cancel();
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.shared.state.lock().stopped
    }

    pub fn worker_count(&self) -> usize {
        self.shared.state.lock().helper.worker_count()
    }

    pub fn queued(&self) -> usize {
        self.shared.state.lock().helper.queued()
    }

    pub fn leases(&self) -> &Arc<WorkerLeaseService> {
        &self.shared.leases
    }

    /// A lock whose waits are compensated by this queue.
    pub fn synchronizer(&self) -> Synchronizer {
        Synchronizer::new(self.shared.leases.clone(), self.shared.clone())
    }
}

impl<T: Send + 'static> BlockingCompensation for ConditionalExecutionQueue<T> {
    fn notify_blocking_work_starting(&self) {
        self.shared.notify_blocking_work_starting();
    }

    fn notify_blocking_work_finished(&self) {
        self.shared.notify_blocking_work_finished();
    }
}

impl<T: Send + 'static> Drop for ConditionalExecutionQueue<T> {
    fn drop(&mut self) {
        self.stop();
    }
}

impl<T: Send + 'static> Shared<T> {
    /// Starts a thread for a worker that was already counted by the helper.
    /// On failure the worker is uncounted again.
    fn start_worker(&self, state: &mut PoolState<T>) -> io::Result<()> {
        let Some(shared) = self.this.upgrade() else {
            state.helper.worker_terminated();
            return Ok(());
        };

        let index = self.spawned.fetch_add(1, Ordering::Relaxed);
        let spawned = thread::Builder::new()
            .name(format!("{}-{index}", self.thread_name))
            .spawn(move || shared.run_worker());

        match spawned {
            Ok(handle) => {
                state.handles.retain(|handle| !handle.is_finished());
                state.handles.push(handle);
                Ok(())
            }
            Err(err) => {
                state.helper.worker_terminated();
                Err(err)
            }
        }
    }

    fn run_worker(self: Arc<Self>) {
        let _registration = self.leases.register_worker();
        let span = tracing::debug_span!("worker");
        let _enter = span.enter();

        let current = thread::current().id();
        let mut state = self.state.lock();
        state.workers.insert(current);
        loop {
            if state.stopped {
                break;
            }

            if let Some(execution) = state.helper.next_unit() {
                MutexGuard::unlocked(&mut state, || execution.run());
                continue;
            }

            if state.helper.is_excess_worker() {
                tracing::trace!("worker in excess, exiting");
                break;
            }

            let idle = self.work_available.wait_for(&mut state, self.keep_alive);
            if idle.timed_out() && state.helper.queued() == 0 {
                break;
            }
        }

        state.workers.remove(&current);
        state.helper.worker_terminated();
        self.workers_done.notify_all();
    }
}

impl<T: Send + 'static> BlockingCompensation for Shared<T> {
    fn notify_blocking_work_starting(&self) {
        let mut state = self.state.lock();
        if state.helper.notify_blocking_work_starting() {
            tracing::trace!("compensating for a blocked worker");
            if let Err(err) = self.start_worker(&mut state) {
                tracing::warn!("failed to start a compensating worker: {err}");
            }
        }
    }

    fn notify_blocking_work_finished(&self) {
        self.state.lock().helper.notify_blocking_work_finished();
        self.work_available.notify_all();
    }
}
