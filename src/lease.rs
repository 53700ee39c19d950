//! Worker thread registration and per-project resource locks.

use std::collections::HashMap;
use std::sync::Arc;
use std::thread::{self, ThreadId};

use parking_lot::{Condvar, Mutex};

use crate::error::ResourceDeadlock;
use crate::pool::{BlockingCompensation, BlockingGuard};
use crate::task::{BuildId, ProjectId};

/// Tracks which threads are worker threads and hands out the resource lock
/// of each project.
///
/// There is no global instance: create one per build session and share it
/// through an `Arc`.
#[derive(Debug, Default)]
pub struct WorkerLeaseService {
    workers: Mutex<HashMap<ThreadId, usize>>,
    locks: Mutex<HashMap<(BuildId, ProjectId), Arc<ResourceLock>>>,
}

impl WorkerLeaseService {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Registers the current thread as a worker until the returned guard is
    /// dropped. Registrations nest.
    pub fn register_worker(self: &Arc<Self>) -> WorkerRegistration {
        let thread = thread::current().id();
        *self.workers.lock().entry(thread).or_default() += 1;

        WorkerRegistration {
            service: self.clone(),
            thread,
        }
    }

    /// Runs `action` with the current thread registered as a worker.
    pub fn run_as_worker<R>(self: &Arc<Self>, action: impl FnOnce() -> R) -> R {
        let _registration = self.register_worker();
        action()
    }

    pub fn is_worker_thread(&self) -> bool {
        self.workers.lock().contains_key(&thread::current().id())
    }

    /// The lock of a project, created on first request and shared afterwards.
    pub fn project_lock(&self, build: &BuildId, project: &ProjectId) -> Arc<ResourceLock> {
        self.locks
            .lock()
            .entry((build.clone(), project.clone()))
            .or_insert_with(|| {
                tracing::debug!("creating lock for project {} of build {}", project, build);
                Arc::new(ResourceLock::new(format!("state of project {project} in build {build}")))
            })
            .clone()
    }
}

/// Keeps a thread registered as a worker.
#[derive(Debug)]
pub struct WorkerRegistration {
    service: Arc<WorkerLeaseService>,
    thread: ThreadId,
}

impl Drop for WorkerRegistration {
    fn drop(&mut self) {
        let mut workers = self.service.workers.lock();
        if let Some(count) = workers.get_mut(&self.thread) {
            *count -= 1;
            if *count == 0 {
                workers.remove(&self.thread);
            }
        }
    }
}

/// Exclusive access to a shared resource, owned by at most one thread.
///
/// The lock is not reentrant: a thread asking for a lock it already holds
/// gets a [`ResourceDeadlock`] instead of blocking forever.
#[derive(Debug)]
pub struct ResourceLock {
    name: String,
    owner: Mutex<Option<ThreadId>>,
    released: Condvar,
}

impl ResourceLock {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            owner: Mutex::new(None),
            released: Condvar::new(),
        }
    }

    pub fn display_name(&self) -> &str {
        &self.name
    }

    pub fn is_locked(&self) -> bool {
        self.owner.lock().is_some()
    }

    pub fn is_locked_by_current_thread(&self) -> bool {
        *self.owner.lock() == Some(thread::current().id())
    }

    /// Takes the lock if it's free.
    pub fn try_lock(self: &Arc<Self>) -> Result<Option<ResourceLockGuard>, ResourceDeadlock> {
        let current = thread::current().id();
        let mut owner = self.owner.lock();
        let held_by = *owner;

        match held_by {
            Some(thread) if thread == current => Err(self.deadlock()),
            Some(_) => Ok(None),
            None => {
                *owner = Some(current);
                Ok(Some(ResourceLockGuard { lock: self.clone() }))
            }
        }
    }

    /// Waits for the lock. While waiting the current worker is reported as
    /// blocked, so the pool can start another one in its place.
    pub fn lock(
        self: &Arc<Self>,
        pool: &dyn BlockingCompensation,
    ) -> Result<ResourceLockGuard, ResourceDeadlock> {
        let current = thread::current().id();
        let mut owner = self.owner.lock();
        let held_by = *owner;

        match held_by {
            Some(thread) if thread == current => return Err(self.deadlock()),
            Some(_) => {
                let _blocked = BlockingGuard::new(pool);
                while owner.is_some() {
                    self.released.wait(&mut owner);
                }
            }
            None => {}
        }

        *owner = Some(current);
        Ok(ResourceLockGuard { lock: self.clone() })
    }

    fn deadlock(&self) -> ResourceDeadlock {
        ResourceDeadlock {
            lock: self.name.clone(),
        }
    }

    fn unlock(&self) {
        *self.owner.lock() = None;
        self.released.notify_all();
    }
}

/// Releases the lock when dropped.
#[derive(Debug)]
pub struct ResourceLockGuard {
    lock: Arc<ResourceLock>,
}

impl ResourceLockGuard {
    pub fn lock(&self) -> &Arc<ResourceLock> {
        &self.lock
    }
}

impl Drop for ResourceLockGuard {
    fn drop(&mut self) {
        self.lock.unlock();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[derive(Default)]
    struct CountingPool {
        blocked: AtomicUsize,
        finished: AtomicUsize,
    }

    impl BlockingCompensation for CountingPool {
        fn notify_blocking_work_starting(&self) {
            self.blocked.fetch_add(1, Ordering::SeqCst);
        }

        fn notify_blocking_work_finished(&self) {
            self.finished.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_project_lock_is_shared_per_project() {
        let service = WorkerLeaseService::new();
        let build = BuildId::root();

        let a = service.project_lock(&build, &ProjectId::new(":a"));
        let again = service.project_lock(&build, &ProjectId::new(":a"));
        let b = service.project_lock(&build, &ProjectId::new(":b"));

        assert!(Arc::ptr_eq(&a, &again));
        assert!(!Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_worker_registration_nests() {
        let service = WorkerLeaseService::new();
        assert!(!service.is_worker_thread());

        let outer = service.register_worker();
        let inner = service.register_worker();
        drop(inner);
        assert!(service.is_worker_thread());

        drop(outer);
        assert!(!service.is_worker_thread());

        assert!(service.run_as_worker(|| service.is_worker_thread()));
    }

    #[test]
    fn test_relocking_on_same_thread_is_a_deadlock() {
        let lock = Arc::new(ResourceLock::new("project :a"));
        let guard = lock.try_lock().unwrap().unwrap();

        assert!(lock.is_locked_by_current_thread());
        assert_eq!(
            lock.try_lock().unwrap_err(),
            ResourceDeadlock {
                lock: "project :a".into()
            }
        );
        assert!(lock.lock(&CountingPool::default()).is_err());

        drop(guard);
        assert!(!lock.is_locked());
    }

    #[test]
    fn test_lock_held_elsewhere() {
        let lock = Arc::new(ResourceLock::new("project :a"));
        let pool = Arc::new(CountingPool::default());

        let guard = lock.try_lock().unwrap().unwrap();

        let waiter = {
            let lock = lock.clone();
            let pool = pool.clone();
            std::thread::spawn(move || {
                assert!(lock.try_lock().unwrap().is_none());
                let guard = lock.lock(&*pool).unwrap();
                assert!(lock.is_locked_by_current_thread());
                drop(guard);
            })
        };

        while pool.blocked.load(Ordering::SeqCst) == 0 {
            std::thread::yield_now();
        }
        drop(guard);
        waiter.join().unwrap();

        assert_eq!(pool.finished.load(Ordering::SeqCst), 1);
        assert!(!lock.is_locked());
    }
}
