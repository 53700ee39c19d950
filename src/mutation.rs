//! What each task writes and destroys, in canonical form.

use std::collections::{BTreeMap, BTreeSet};

use crate::builder::WorkGraph;
use crate::error::{FileResolveError, GraphError, MutationError};
use crate::graph::{EdgeType, NodeId};
use crate::paths::Canonicalizer;
use crate::task::TaskFiles;

/// The resolved file mutations of a single node.
#[derive(Debug, Clone)]
pub struct TaskMutation {
    node: NodeId,
    /// Outputs and local state.
    output_paths: BTreeSet<String>,
    destroyable_paths: BTreeSet<String>,
    has_file_inputs: bool,
    has_outputs: bool,
    has_local_state: bool,
    resolved: bool,
    /// Dependents that still need the outputs.
    consumers: BTreeSet<NodeId>,
}

impl TaskMutation {
    fn new(node: NodeId) -> Self {
        Self {
            node,
            output_paths: BTreeSet::new(),
            destroyable_paths: BTreeSet::new(),
            has_file_inputs: false,
            has_outputs: false,
            has_local_state: false,
            resolved: false,
            consumers: BTreeSet::new(),
        }
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    pub fn output_paths(&self) -> &BTreeSet<String> {
        &self.output_paths
    }

    pub fn destroyable_paths(&self) -> &BTreeSet<String> {
        &self.destroyable_paths
    }

    pub fn has_file_inputs(&self) -> bool {
        self.has_file_inputs
    }

    pub fn has_outputs(&self) -> bool {
        self.has_outputs
    }

    pub fn has_local_state(&self) -> bool {
        self.has_local_state
    }

    pub fn is_resolved(&self) -> bool {
        self.resolved
    }

    pub fn consumers(&self) -> &BTreeSet<NodeId> {
        &self.consumers
    }

    /// The paths other nodes may not touch while this one runs.
    pub fn mutated_paths(&self) -> impl Iterator<Item = &String> + Clone {
        self.output_paths.iter().chain(self.destroyable_paths.iter())
    }

    fn validate(&self) -> Result<(), &'static str> {
        if self.destroyable_paths.is_empty() {
            return Ok(());
        }
        if self.has_outputs {
            return Err("has both outputs and destroyables defined.  \
                A task can define either outputs or destroyables, but not both.");
        }
        if self.has_file_inputs {
            return Err("has both inputs and destroyables defined.  \
                A task can define either inputs or destroyables, but not both.");
        }
        if self.has_local_state {
            return Err("has both local state and destroyables defined.  \
                A task can define either local state or destroyables, but not both.");
        }
        Ok(())
    }
}

/// Lazily resolved [`TaskMutation`]s, one per node, kept until the node is
/// complete and nobody consumes its outputs anymore.
#[derive(Debug)]
pub struct MutationIndex {
    canonicalizer: Canonicalizer,
    mutations: BTreeMap<NodeId, TaskMutation>,
}

impl MutationIndex {
    pub fn new(canonicalizer: Canonicalizer) -> Self {
        Self {
            canonicalizer,
            mutations: BTreeMap::new(),
        }
    }

    pub fn get(&self, node: NodeId) -> Option<&TaskMutation> {
        self.mutations.get(&node)
    }

    pub fn iter(&self) -> impl Iterator<Item = &TaskMutation> {
        self.mutations.values()
    }

    pub fn len(&self) -> usize {
        self.mutations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mutations.is_empty()
    }

    /// Resolves the mutations of `node` on first use.
    pub fn resolve(&mut self, graph: &WorkGraph, node: NodeId) -> Result<&TaskMutation, MutationError> {
        if !self.mutations.get(&node).is_some_and(TaskMutation::is_resolved) {
            let mutation = self.compute(graph, node)?;
            self.mutations.insert(node, mutation);
        }

        self.mutations
            .get(&node)
            .ok_or(MutationError::Graph(GraphError::UnknownNode(node.index())))
    }

    fn compute(&mut self, graph: &WorkGraph, node: NodeId) -> Result<TaskMutation, MutationError> {
        let task = graph
            .task(node)
            .ok_or(GraphError::UnknownNode(node.index()))?;
        let id = task.id();

        let files = task.files().map_err(|err| match err {
            FileResolveError::Deadlock(source) => MutationError::Deadlock {
                task: id.clone(),
                plural: "declared files",
                singular: "an output, local state or destroyable",
                source,
            },
            FileResolveError::Other(source) => MutationError::Resolve {
                task: id.clone(),
                source,
            },
        })?;
        let TaskFiles {
            inputs,
            outputs,
            local_state,
            destroyables,
        } = files;

        let mut mutation = TaskMutation::new(node);
        mutation.has_file_inputs = !inputs.is_empty();
        mutation.has_outputs = !outputs.is_empty();
        mutation.has_local_state = !local_state.is_empty();

        for path in outputs.iter().chain(&local_state) {
            let path = self
                .canonicalizer
                .canonicalize(path)
                .map_err(|source| MutationError::Io { task: id.clone(), source })?;
            mutation.output_paths.insert(path);
        }
        for path in &destroyables {
            let path = self
                .canonicalizer
                .canonicalize(path)
                .map_err(|source| MutationError::Io { task: id.clone(), source })?;
            mutation.destroyable_paths.insert(path);
        }

        mutation.consumers = graph
            .graph()
            .outgoing_edges(node)
            .into_iter()
            .filter(|edge| edge.kind == EdgeType::DependencyOf)
            .map(|edge| edge.target)
            .filter(|&consumer| !graph.graph().is_complete(consumer))
            .collect();
        mutation.resolved = true;

        mutation.validate().map_err(|message| MutationError::Configuration {
            task: id.clone(),
            message,
        })?;

        tracing::debug!(
            "resolved mutations of {}: {} outputs, {} destroyables",
            id,
            mutation.output_paths.len(),
            mutation.destroyable_paths.len()
        );

        Ok(mutation)
    }

    /// Forgets `node` as a consumer, then drops the mutations of completed
    /// nodes whose outputs nobody needs anymore.
    pub fn node_completed(&mut self, graph: &WorkGraph, node: NodeId) {
        for mutation in self.mutations.values_mut() {
            mutation.consumers.remove(&node);
        }

        self.mutations.retain(|&id, mutation| {
            !(graph.graph().is_complete(id) && mutation.consumers.is_empty())
        });
    }
}
