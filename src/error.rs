use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use crate::task::TaskId;

/// Error shared between every holder of a failed execution result.
#[derive(Debug, Clone)]
pub struct SharedError(Arc<anyhow::Error>);

impl SharedError {
    pub fn new(err: impl Into<anyhow::Error>) -> Self {
        Self(Arc::new(err.into()))
    }

    pub fn inner(&self) -> &anyhow::Error {
        &self.0
    }
}

impl From<anyhow::Error> for SharedError {
    fn from(e: anyhow::Error) -> Self {
        SharedError(Arc::new(e))
    }
}

impl fmt::Display for SharedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&*self.0, f)
    }
}

impl std::error::Error for SharedError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.0.source()
    }
}

#[derive(Debug, Error)]
pub enum GraphError {
    #[error("Circular dependency between the following tasks:\n{0}")]
    Cycle(String),

    #[error("Node {0} is not part of the graph")]
    UnknownNode(usize),
}

#[derive(Debug, Error)]
pub enum PlanError {
    #[error("Task '{task}' referenced by '{referenced_by}' could not be found")]
    UnknownTask { task: TaskId, referenced_by: TaskId },

    #[error("Requested task '{0}' could not be found")]
    UnknownRequestedTask(TaskId),

    #[error(transparent)]
    Graph(#[from] GraphError),
}

/// A thread tried to acquire a lock it already holds.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("Lock '{lock}' is already held by the current thread")]
pub struct ResourceDeadlock {
    pub lock: String,
}

/// Raised by a task while producing the files it declares.
#[derive(Debug, Error)]
pub enum FileResolveError {
    #[error(transparent)]
    Deadlock(#[from] ResourceDeadlock),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[derive(Debug, Error)]
pub enum MutationError {
    #[error("Task '{task}' {message}")]
    Configuration { task: TaskId, message: &'static str },

    #[error(
        "A deadlock was detected while resolving the {plural} for task '{task}'. \
         This can be caused, for instance, by {singular} property causing dependency resolution."
    )]
    Deadlock {
        task: TaskId,
        plural: &'static str,
        singular: &'static str,
        #[source]
        source: ResourceDeadlock,
    },

    #[error("Couldn't canonicalize the files of task '{task}'.\n{source}")]
    Io {
        task: TaskId,
        #[source]
        source: std::io::Error,
    },

    #[error("Couldn't resolve the files of task '{task}'.\n{source}")]
    Resolve {
        task: TaskId,
        #[source]
        source: anyhow::Error,
    },

    #[error(transparent)]
    Graph(#[from] GraphError),
}

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("The execution queue has been stopped")]
    Stopped,

    #[error("Failed to start a worker thread")]
    Spawn(#[from] std::io::Error),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SyncError {
    #[error("The current thread is not registered as a worker thread")]
    NotAWorkerThread,
}

/// Why an execution did not produce a value.
#[derive(Debug, Error, Clone)]
pub enum ExecutionFailure {
    #[error("Execution failed:\n{0}")]
    Failed(SharedError),

    #[error("Execution panicked: {0}")]
    Panicked(String),

    #[error("Execution was cancelled before it started")]
    Cancelled,
}
