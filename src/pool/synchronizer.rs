use std::sync::Arc;
use std::thread::{self, ThreadId};

use parking_lot::{Condvar, Mutex};

use crate::error::SyncError;
use crate::lease::WorkerLeaseService;
use crate::pool::{BlockingCompensation, BlockingGuard};

/// Wraps the time a thread spends waiting for a [`Synchronizer`].
pub trait WaitDecorator: Send + Sync {
    fn around_wait(&self, wait: &mut dyn FnMut());
}

/// Waits inside a `tracing` span named after the lock.
#[derive(Debug, Clone)]
pub struct SpanWaitDecorator {
    name: String,
}

impl SpanWaitDecorator {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl WaitDecorator for SpanWaitDecorator {
    fn around_wait(&self, wait: &mut dyn FnMut()) {
        tracing::debug_span!("wait", lock = %self.name).in_scope(wait);
    }
}

/// Mutual exclusion between worker threads, reentrant on the owning thread.
/// A worker waiting for it is reported to the pool as blocked.
pub struct Synchronizer {
    owner: Mutex<Option<ThreadId>>,
    released: Condvar,
    leases: Arc<WorkerLeaseService>,
    pool: Arc<dyn BlockingCompensation>,
    decorator: Option<Box<dyn WaitDecorator>>,
}

impl Synchronizer {
    pub fn new(leases: Arc<WorkerLeaseService>, pool: Arc<dyn BlockingCompensation>) -> Self {
        Self {
            owner: Mutex::new(None),
            released: Condvar::new(),
            leases,
            pool,
            decorator: None,
        }
    }

    pub fn with_decorator(mut self, decorator: impl WaitDecorator + 'static) -> Self {
        self.decorator = Some(Box::new(decorator));
        self
    }

    pub fn is_held_by_current_thread(&self) -> bool {
        *self.owner.lock() == Some(thread::current().id())
    }

    /// Runs `action` while holding the lock.
    pub fn with_lock<R, F>(&self, action: F) -> Result<R, SyncError>
    where
        F: FnOnce() -> R,
    {
        if !self.leases.is_worker_thread() {
            return Err(SyncError::NotAWorkerThread);
        }

        let current = thread::current().id();
        let mut owner = self.owner.lock();
        let held_by = *owner;

        match held_by {
            Some(thread) if thread == current => {
                drop(owner);
                Ok(action())
            }
            None => {
                *owner = Some(current);
                drop(owner);
                let _release = Release {
                    sync: self,
                    previous: held_by,
                };
                Ok(action())
            }
            Some(_) => {
                // dropped after `_release`, so the lock is free again first
                let _blocked = BlockingGuard::new(self.pool.as_ref());

                let mut wait = || {
                    while owner.is_some() {
                        self.released.wait(&mut owner);
                    }
                };
                match &self.decorator {
                    Some(decorator) => decorator.around_wait(&mut wait),
                    None => wait(),
                }

                *owner = Some(current);
                drop(owner);
                let _release = Release {
                    sync: self,
                    previous: None,
                };
                Ok(action())
            }
        }
    }
}

struct Release<'a> {
    sync: &'a Synchronizer,
    previous: Option<ThreadId>,
}

impl Drop for Release<'_> {
    fn drop(&mut self) {
        *self.sync.owner.lock() = self.previous;
        self.sync.released.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;

    use super::*;

    #[derive(Default)]
    struct CountingPool {
        started: AtomicUsize,
        finished: AtomicUsize,
    }

    impl BlockingCompensation for CountingPool {
        fn notify_blocking_work_starting(&self) {
            self.started.fetch_add(1, Ordering::SeqCst);
        }

        fn notify_blocking_work_finished(&self) {
            self.finished.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn synchronizer() -> (Arc<Synchronizer>, Arc<CountingPool>, Arc<WorkerLeaseService>) {
        let leases = WorkerLeaseService::new();
        let pool = Arc::new(CountingPool::default());
        let sync = Synchronizer::new(leases.clone(), pool.clone())
            .with_decorator(SpanWaitDecorator::new("test"));
        (Arc::new(sync), pool, leases)
    }

    #[test]
    fn test_requires_worker_thread() {
        let (sync, _, _) = synchronizer();
        assert_eq!(sync.with_lock(|| ()), Err(SyncError::NotAWorkerThread));
    }

    #[test]
    fn test_reentrant() {
        let (sync, pool, leases) = synchronizer();

        let value = leases.run_as_worker(|| {
            sync.with_lock(|| {
                assert!(sync.is_held_by_current_thread());
                sync.with_lock(|| sync.with_lock(|| 42).unwrap()).unwrap()
            })
        });

        assert_eq!(value, Ok(42));
        assert!(!sync.is_held_by_current_thread());
        assert_eq!(pool.started.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_released_on_panic() {
        let (sync, _, leases) = synchronizer();

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            leases.run_as_worker(|| sync.with_lock::<(), _>(|| panic!("inside")))
        }));

        assert!(result.is_err());
        assert!(!sync.is_held_by_current_thread());
        assert_eq!(leases.run_as_worker(|| sync.with_lock(|| 1)), Ok(1));
    }

    #[test]
    fn test_contended_wait_is_compensated() {
        let (sync, pool, leases) = synchronizer();
        let (locked_tx, locked_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();

        let holder = {
            let sync = sync.clone();
            let leases = leases.clone();
            thread::spawn(move || {
                leases.run_as_worker(|| {
                    sync.with_lock(|| {
                        locked_tx.send(()).unwrap();
                        release_rx.recv().unwrap();
                    })
                })
            })
        };
        locked_rx.recv().unwrap();

        let waiter = {
            let sync = sync.clone();
            let leases = leases.clone();
            thread::spawn(move || leases.run_as_worker(|| sync.with_lock(|| 2)))
        };

        while pool.started.load(Ordering::SeqCst) == 0 {
            thread::yield_now();
        }
        assert_eq!(pool.finished.load(Ordering::SeqCst), 0);

        release_tx.send(()).unwrap();
        assert_eq!(holder.join().unwrap(), Ok(()));
        assert_eq!(waiter.join().unwrap(), Ok(2));
        assert_eq!(pool.finished.load(Ordering::SeqCst), 1);
    }
}
