use std::collections::VecDeque;

use crate::pool::WorkerLimits;

/// Queue and worker accounting of the pool.
///
/// Every method that may require a new worker returns `true` when the caller
/// has to start one; the worker is already counted at that point. Workers
/// call [`worker_terminated`] on their way out.
///
/// [`worker_terminated`]: WorkerThreadPoolHelper::worker_terminated
#[derive(Debug)]
pub struct WorkerThreadPoolHelper<U> {
    limits: WorkerLimits,
    blocked_worker_count: usize,
    worker_count: usize,
    queue: VecDeque<U>,
}

impl<U> WorkerThreadPoolHelper<U> {
    pub fn new(limits: WorkerLimits) -> Self {
        Self {
            limits,
            blocked_worker_count: 0,
            worker_count: 0,
            queue: VecDeque::new(),
        }
    }

    /// Blocked workers are compensated for, up to the hard ceiling.
    pub fn current_max_worker_count(&self) -> usize {
        (self.limits.max_worker_count + self.blocked_worker_count)
            .min(self.limits.max_unconstrained_worker_count)
    }

    pub fn submit(&mut self, unit: U) -> bool {
        self.queue.push_back(unit);
        self.try_start_worker()
    }

    pub fn notify_blocking_work_starting(&mut self) -> bool {
        self.blocked_worker_count += 1;
        !self.queue.is_empty() && self.try_start_worker()
    }

    pub fn notify_blocking_work_finished(&mut self) {
        debug_assert!(self.blocked_worker_count > 0, "unbalanced blocking notification");
        self.blocked_worker_count = self.blocked_worker_count.saturating_sub(1);
    }

    /// The next unit for a worker, or `None` when the queue is empty or the
    /// worker is in excess and should stop.
    pub fn next_unit(&mut self) -> Option<U> {
        if self.is_excess_worker() {
            return None;
        }
        self.queue.pop_front()
    }

    pub fn is_excess_worker(&self) -> bool {
        self.worker_count > self.current_max_worker_count()
    }

    pub fn worker_terminated(&mut self) {
        self.worker_count = self.worker_count.saturating_sub(1);
    }

    /// Takes back the unit submitted last.
    pub fn withdraw_last(&mut self) -> Option<U> {
        self.queue.pop_back()
    }

    /// Removes every queued unit.
    pub fn drain(&mut self) -> Vec<U> {
        self.queue.drain(..).collect()
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    pub fn blocked_worker_count(&self) -> usize {
        self.blocked_worker_count
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    pub fn limits(&self) -> WorkerLimits {
        self.limits
    }

    fn try_start_worker(&mut self) -> bool {
        if self.worker_count < self.current_max_worker_count() {
            self.worker_count += 1;
            true
        } else {
            false
        }
    }
}
