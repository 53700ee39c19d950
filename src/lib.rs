#![forbid(unsafe_code)]
#![doc = include_str!("../README.md")]

mod builder;
mod coordinator;
mod error;
mod graph;
mod lease;
mod mutation;
pub mod paths;
mod pool;
mod task;
mod utils;

pub use crate::builder::{TaskCycleReporter, WorkGraph, WorkGraphBuilder};
pub use crate::coordinator::ConcurrentNodeExecutionCoordinator;
pub use crate::error::*;
pub use crate::graph::{
    ArrowCycleReporter, CycleReporter, Edge, EdgeType, Graph, Node, NodeId, NodeState,
};
pub use crate::lease::{ResourceLock, ResourceLockGuard, WorkerLeaseService, WorkerRegistration};
pub use crate::mutation::{MutationIndex, TaskMutation};
pub use crate::pool::{
    BlockingCompensation, BlockingGuard, ConditionalExecutionQueue, Execution, ExecutionConfig,
    ExecutionResult, SpanWaitDecorator, Synchronizer, WaitDecorator, WorkerLimits,
    WorkerThreadPoolHelper,
};
pub use crate::task::{
    BuildId, DeclaredTask, ProjectId, TaskContainer, TaskDefinition, TaskFiles, TaskHandle,
    TaskId, TaskRelations, TaskResolver,
};
pub use crate::utils::init_logging;
