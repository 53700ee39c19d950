//! Decides whether a ready node may start next to the ones already running.

use std::collections::HashMap;
use std::sync::Arc;

use crate::builder::WorkGraph;
use crate::error::MutationError;
use crate::graph::NodeId;
use crate::lease::{ResourceLock, WorkerLeaseService};
use crate::mutation::{MutationIndex, TaskMutation};
use crate::paths::{Canonicalizer, any_overlap};
use crate::task::{BuildId, ProjectId};

/// Hands out project locks and reports nodes whose file mutations clash.
///
/// The answers are advisory: the executor acts on them, and has to ask again
/// after anything it depends on has changed.
#[derive(Debug)]
pub struct ConcurrentNodeExecutionCoordinator {
    build: BuildId,
    leases: Arc<WorkerLeaseService>,
    project_locks: HashMap<ProjectId, Arc<ResourceLock>>,
    mutations: MutationIndex,
    /// Whether a consumer is ordered after a destroyer, per `(consumer, destroyer)`.
    reachable: HashMap<(NodeId, NodeId), bool>,
}

impl ConcurrentNodeExecutionCoordinator {
    pub fn new(build: BuildId, leases: Arc<WorkerLeaseService>, canonicalizer: Canonicalizer) -> Self {
        Self {
            build,
            leases,
            project_locks: HashMap::new(),
            mutations: MutationIndex::new(canonicalizer),
            reachable: HashMap::new(),
        }
    }

    pub fn mutations(&self) -> &MutationIndex {
        &self.mutations
    }

    /// The lock of the project `node` belongs to, if any.
    pub fn find_lock_for(&mut self, graph: &WorkGraph, node: NodeId) -> Option<Arc<ResourceLock>> {
        let project = graph.task(node)?.id().project()?;

        let lock = self
            .project_locks
            .entry(project.clone())
            .or_insert_with(|| self.leases.project_lock(&self.build, project));

        Some(lock.clone())
    }

    /// A running node `candidate` must not run alongside, or a completed
    /// node's consumer that has to run before `candidate` destroys its input.
    pub fn find_conflicting_node<I>(
        &mut self,
        graph: &WorkGraph,
        candidate: NodeId,
        running_nodes: I,
    ) -> Result<Option<NodeId>, MutationError>
    where
        I: IntoIterator<Item = NodeId>,
    {
        let mutation = self.mutations.resolve(graph, candidate)?;
        let destroyables: Vec<String> = mutation.destroyable_paths().iter().cloned().collect();
        let mutated: Vec<String> = if mutation.output_paths().is_empty() {
            destroyables.clone()
        } else {
            mutation.output_paths().iter().cloned().collect()
        };

        if !mutated.is_empty() {
            for running in running_nodes {
                if running == candidate {
                    continue;
                }
                let other = self.mutations.resolve(graph, running)?;
                if any_overlap(&mutated, other.mutated_paths()) {
                    tracing::debug!("{} overlaps with running node {:?}", name(graph, candidate), running);
                    return Ok(Some(running));
                }
            }
        }

        if destroyables.is_empty() {
            return Ok(None);
        }

        Ok(self.find_unfinished_consumer(graph, candidate, &destroyables))
    }

    /// Forgets what `node` produced once nothing needs it anymore.
    pub fn node_completed(&mut self, graph: &WorkGraph, node: NodeId) {
        self.mutations.node_completed(graph, node);
    }

    fn find_unfinished_consumer(
        &mut self,
        graph: &WorkGraph,
        destroyer: NodeId,
        destroyables: &[String],
    ) -> Option<NodeId> {
        let consumers: Vec<NodeId> = self
            .mutations
            .iter()
            .filter(|producer| producer.is_resolved() && graph.graph().is_complete(producer.node()))
            .filter(|producer| !producer.consumers().is_empty())
            .filter(|producer| any_overlap(destroyables, producer.output_paths()))
            .flat_map(TaskMutation::consumers)
            .copied()
            .collect();

        let conflict = consumers
            .into_iter()
            .find(|&consumer| !self.consumer_depends_on_destroyer(graph, consumer, destroyer));

        if let Some(consumer) = conflict {
            tracing::debug!(
                "{} would destroy outputs {} still needs",
                name(graph, destroyer),
                name(graph, consumer)
            );
        }
        conflict
    }

    /// Whether `consumer` is explicitly ordered after `destroyer`, looking
    /// only through nodes that haven't completed yet.
    fn consumer_depends_on_destroyer(&mut self, graph: &WorkGraph, consumer: NodeId, destroyer: NodeId) -> bool {
        if consumer == destroyer {
            return true;
        }
        if let Some(&reachable) = self.reachable.get(&(consumer, destroyer)) {
            return reachable;
        }

        let mut reachable = false;
        graph.graph().walk_incoming_edges_from(consumer, |edge| {
            if reachable || !edge.kind.is_hard() || graph.graph().is_complete(edge.source) {
                return false;
            }
            reachable = edge.source == destroyer;
            !reachable
        });

        self.reachable.insert((consumer, destroyer), reachable);
        reachable
    }
}

fn name(graph: &WorkGraph, node: NodeId) -> String {
    graph
        .task(node)
        .map(|task| task.id().to_string())
        .unwrap_or_else(|| format!("{node:?}"))
}
