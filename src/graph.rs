//! The work graph: nodes, typed edges, pruning and cycle breaking.
//!
//! Nodes live in an arena (a petgraph [`StableGraph`]) and are referred to by
//! stable [`NodeId`]s that survive removal of other nodes. Edges are plain
//! `(source, type, target)` triples with set semantics, stored in the per-node
//! adjacency lists of the arena.
//!
//! ## Edge direction
//!
//! Every edge points from the node that goes first to the node that goes
//! after it, except for liveness which depends on the edge type:
//!
//! * `DependencyOf`: `dependency -> dependent`
//! * `FinalizedBy`: `finalized -> finalizer`
//! * `MustCompleteBefore` / `ShouldCompleteBefore`: `earlier -> later`
//! * `AvoidStartingBeforeFinalized`: `finalized -> finalizer dependency`

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt::Display;

use petgraph::Direction;
use petgraph::stable_graph::{NodeIndex, StableDiGraph};
use petgraph::visit::{EdgeRef, IntoEdgeReferences};

use crate::error::GraphError;

/// Stable identity of a node in a [`Graph`].
pub type NodeId = NodeIndex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EdgeType {
    /// Hard ordering, and keeps the source alive while the target is.
    DependencyOf,
    /// The target runs after the source, and is kept alive by it.
    FinalizedBy,
    /// Hard ordering only.
    MustCompleteBefore,
    /// Advisory ordering, dropped when it would close a cycle.
    ShouldCompleteBefore,
    /// Derived: the target should not start before the source has started.
    AvoidStartingBeforeFinalized,
}

impl EdgeType {
    /// Hard edges are ordering constraints that may never be dropped.
    pub fn is_hard(self) -> bool {
        matches!(
            self,
            EdgeType::DependencyOf | EdgeType::FinalizedBy | EdgeType::MustCompleteBefore
        )
    }

    pub(crate) fn label(self) -> &'static str {
        match self {
            EdgeType::DependencyOf => "dependency of",
            EdgeType::FinalizedBy => "finalized by",
            EdgeType::MustCompleteBefore => "must complete before",
            EdgeType::ShouldCompleteBefore => "should complete before",
            EdgeType::AvoidStartingBeforeFinalized => "avoid starting before",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Edge {
    pub source: NodeId,
    pub kind: EdgeType,
    pub target: NodeId,
}

impl Edge {
    pub fn new(source: NodeId, kind: EdgeType, target: NodeId) -> Self {
        Self {
            source,
            kind,
            target,
        }
    }
}

/// Scheduling state of a node. The planner only ever sets `ShouldRun`, the
/// rest belongs to whoever executes the graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NodeState {
    #[default]
    NotScheduled,
    ShouldRun,
    Executing,
    Executed,
    Skipped,
}

impl NodeState {
    pub fn is_complete(self) -> bool {
        matches!(self, NodeState::Executed | NodeState::Skipped)
    }
}

#[derive(Debug, Clone)]
pub struct Node<T> {
    pub payload: T,
    pub state: NodeState,
}

/// Renders a cycle found by [`Graph::break_cycles`] for the error message.
pub trait CycleReporter<T> {
    /// `cycle` starts and ends with the same node.
    fn report(&self, cycle: &[&T]) -> String;
}

/// Renders a cycle as `a -> b -> c -> a`.
#[derive(Debug, Default, Clone, Copy)]
pub struct ArrowCycleReporter;

impl<T: Display> CycleReporter<T> for ArrowCycleReporter {
    fn report(&self, cycle: &[&T]) -> String {
        cycle
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(" -> ")
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Visiting,
    Done,
}

#[derive(Debug, Clone)]
pub struct Graph<T> {
    inner: StableDiGraph<Node<T>, EdgeType>,
}

impl<T> Default for Graph<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Graph<T> {
    pub fn new() -> Self {
        Self {
            inner: StableDiGraph::new(),
        }
    }

    pub fn add_node(&mut self, payload: T) -> NodeId {
        self.inner.add_node(Node {
            payload,
            state: NodeState::default(),
        })
    }

    /// Adds the edge unless the same triple is already present. Returns
    /// whether the edge was added.
    pub fn add_edge(
        &mut self,
        source: NodeId,
        kind: EdgeType,
        target: NodeId,
    ) -> Result<bool, GraphError> {
        self.check(source)?;
        self.check(target)?;

        if self.contains_edge(&Edge::new(source, kind, target)) {
            return Ok(false);
        }

        self.inner.add_edge(source, target, kind);
        Ok(true)
    }

    pub fn contains_edge(&self, edge: &Edge) -> bool {
        self.contains_node(edge.source)
            && self
                .inner
                .edges_directed(edge.source, Direction::Outgoing)
                .any(|e| e.target() == edge.target && *e.weight() == edge.kind)
    }

    pub fn remove_edge(&mut self, edge: &Edge) -> bool {
        if !self.contains_node(edge.source) {
            return false;
        }

        let found = self
            .inner
            .edges_directed(edge.source, Direction::Outgoing)
            .find(|e| e.target() == edge.target && *e.weight() == edge.kind)
            .map(|e| e.id());

        match found {
            Some(id) => self.inner.remove_edge(id).is_some(),
            None => false,
        }
    }

    pub fn contains_node(&self, node: NodeId) -> bool {
        self.inner.contains_node(node)
    }

    pub fn node(&self, node: NodeId) -> Option<&Node<T>> {
        self.inner.node_weight(node)
    }

    pub fn payload(&self, node: NodeId) -> Option<&T> {
        self.node(node).map(|node| &node.payload)
    }

    pub fn state(&self, node: NodeId) -> Option<NodeState> {
        self.node(node).map(|node| node.state)
    }

    pub fn set_state(&mut self, node: NodeId, state: NodeState) -> Result<(), GraphError> {
        let node = self
            .inner
            .node_weight_mut(node)
            .ok_or(GraphError::UnknownNode(node.index()))?;
        node.state = state;
        Ok(())
    }

    /// Whether the node has finished, either executed or skipped.
    pub fn is_complete(&self, node: NodeId) -> bool {
        self.state(node).is_some_and(NodeState::is_complete)
    }

    /// All node ids in ascending order.
    pub fn node_ids(&self) -> Vec<NodeId> {
        let mut ids: Vec<_> = self.inner.node_indices().collect();
        ids.sort();
        ids
    }

    pub fn node_count(&self) -> usize {
        self.inner.node_count()
    }

    pub fn edge_count(&self) -> usize {
        self.inner.edge_count()
    }

    pub fn incoming_edges(&self, node: NodeId) -> Vec<Edge> {
        self.edges(node, Direction::Incoming)
    }

    pub fn outgoing_edges(&self, node: NodeId) -> Vec<Edge> {
        self.edges(node, Direction::Outgoing)
    }

    pub fn all_edges(&self) -> Vec<Edge> {
        let mut edges: Vec<_> = self
            .inner
            .edge_references()
            .map(|e| Edge::new(e.source(), *e.weight(), e.target()))
            .collect();
        edges.sort();
        edges
    }

    fn edges(&self, node: NodeId, direction: Direction) -> Vec<Edge> {
        if !self.contains_node(node) {
            return Vec::new();
        }

        let mut edges: Vec<_> = self
            .inner
            .edges_directed(node, direction)
            .map(|e| Edge::new(e.source(), *e.weight(), e.target()))
            .collect();
        edges.sort();
        edges
    }

    fn check(&self, node: NodeId) -> Result<(), GraphError> {
        if self.contains_node(node) {
            Ok(())
        } else {
            Err(GraphError::UnknownNode(node.index()))
        }
    }

    /// Depth-first walk over the edges entering `start`, then the edges
    /// entering each source reached. `visit` decides whether the walk
    /// continues past an edge; every node is expanded once.
    pub fn walk_incoming_edges_from<F>(&self, start: NodeId, mut visit: F)
    where
        F: FnMut(&Edge) -> bool,
    {
        if !self.contains_node(start) {
            return;
        }

        let mut seen = HashSet::from([start]);
        let mut stack = vec![start];

        while let Some(node) = stack.pop() {
            for edge in self.incoming_edges(node).into_iter().rev() {
                if visit(&edge) && seen.insert(edge.source) {
                    stack.push(edge.source);
                }
            }
        }
    }

    /// Nodes from which `target` can be reached by walking incoming edges of
    /// the given kinds backwards from it. `target` itself is not included.
    pub fn ancestors(&self, target: NodeId, kinds: &[EdgeType]) -> HashSet<NodeId> {
        let mut found = HashSet::new();
        self.walk_incoming_edges_from(target, |edge| {
            if kinds.contains(&edge.kind) {
                found.insert(edge.source);
                true
            } else {
                false
            }
        });
        found.remove(&target);
        found
    }

    /// Keeps only the nodes reachable from `entry_nodes` through edges the
    /// detector marks live. The detector sees each edge together with the
    /// direction it would be followed in, relative to the node being
    /// expanded. Returns the payloads of the removed nodes.
    pub fn remove_dead_nodes<F>(&mut self, entry_nodes: &[NodeId], is_live: F) -> Vec<T>
    where
        F: Fn(&Edge, Direction) -> bool,
    {
        let mut alive: HashSet<NodeId> = HashSet::new();
        let mut queue: VecDeque<NodeId> = entry_nodes
            .iter()
            .copied()
            .filter(|node| self.contains_node(*node))
            .collect();

        while let Some(node) = queue.pop_front() {
            if !alive.insert(node) {
                continue;
            }

            for edge in self.incoming_edges(node) {
                if is_live(&edge, Direction::Incoming) && !alive.contains(&edge.source) {
                    queue.push_back(edge.source);
                }
            }
            for edge in self.outgoing_edges(node) {
                if is_live(&edge, Direction::Outgoing) && !alive.contains(&edge.target) {
                    queue.push_back(edge.target);
                }
            }
        }

        let dead: Vec<_> = self
            .node_ids()
            .into_iter()
            .filter(|node| !alive.contains(node))
            .collect();

        dead.into_iter()
            .filter_map(|node| self.inner.remove_node(node))
            .map(|node| node.payload)
            .collect()
    }

    /// Makes the graph acyclic.
    ///
    /// A cycle made of hard edges is fatal: it's rendered through `reporter`
    /// and returned as [`GraphError::Cycle`]. Soft edges that would close a
    /// cycle are removed, in edge order, and returned.
    pub fn break_cycles(&mut self, reporter: &dyn CycleReporter<T>) -> Result<Vec<Edge>, GraphError> {
        if let Some(cycle) = self.find_cycle(EdgeType::is_hard) {
            let payloads: Vec<&T> = cycle
                .iter()
                .filter_map(|node| self.payload(*node))
                .collect();
            return Err(GraphError::Cycle(reporter.report(&payloads)));
        }

        let soft: Vec<_> = self
            .all_edges()
            .into_iter()
            .filter(|edge| !edge.kind.is_hard())
            .collect();

        let mut removed = Vec::new();
        for edge in soft {
            let closes_cycle = edge.source == edge.target
                || petgraph::algo::has_path_connecting(&self.inner, edge.target, edge.source, None);

            if closes_cycle && self.remove_edge(&edge) {
                tracing::debug!(
                    "dropping {} edge {} -> {} to avoid a cycle",
                    edge.kind.label(),
                    edge.source.index(),
                    edge.target.index()
                );
                removed.push(edge);
            }
        }

        Ok(removed)
    }

    /// Explicit-stack DFS over the edges accepted by `follow`. Returns the
    /// first cycle found as a node path starting and ending at the same node.
    fn find_cycle<F>(&self, follow: F) -> Option<Vec<NodeId>>
    where
        F: Fn(EdgeType) -> bool,
    {
        let successors = |node: NodeId| -> Vec<NodeId> {
            // reversed so that popping yields ascending order
            let mut next: Vec<_> = self
                .outgoing_edges(node)
                .into_iter()
                .filter(|edge| follow(edge.kind))
                .map(|edge| edge.target)
                .collect();
            next.sort_unstable();
            next.dedup();
            next.reverse();
            next
        };

        let mut marks: HashMap<NodeId, Mark> = HashMap::new();

        for start in self.node_ids() {
            if marks.contains_key(&start) {
                continue;
            }

            marks.insert(start, Mark::Visiting);
            let mut stack = vec![(start, successors(start))];

            while let Some(frame) = stack.last_mut() {
                let node = frame.0;
                match frame.1.pop() {
                    Some(next) => match marks.get(&next) {
                        None => {
                            marks.insert(next, Mark::Visiting);
                            stack.push((next, successors(next)));
                        }
                        Some(Mark::Visiting) => {
                            let position = stack.iter().position(|(n, _)| *n == next)?;
                            let mut cycle: Vec<_> = stack[position..].iter().map(|(n, _)| *n).collect();
                            cycle.push(next);
                            return Some(cycle);
                        }
                        Some(Mark::Done) => {}
                    },
                    None => {
                        marks.insert(node, Mark::Done);
                        stack.pop();
                    }
                }
            }
        }

        None
    }

    /// A topological order of all nodes, over every edge type.
    pub fn topological_order(&self) -> Result<Vec<NodeId>, GraphError> {
        petgraph::algo::toposort(&self.inner, None)
            .map_err(|cycle| GraphError::Cycle(format!("node {}", cycle.node_id().index())))
    }
}
