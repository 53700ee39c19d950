use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};

use petgraph::Direction;

use crate::error::{GraphError, PlanError};
use crate::graph::{CycleReporter, Edge, EdgeType, Graph, NodeId, NodeState};
use crate::task::{TaskDefinition, TaskHandle, TaskId, TaskResolver};

const HARD_EDGES: [EdgeType; 3] = [
    EdgeType::DependencyOf,
    EdgeType::FinalizedBy,
    EdgeType::MustCompleteBefore,
];

/// The planned work for a build.
///
/// `WorkGraph` is produced by the [`WorkGraphBuilder`] and handed to whoever
/// executes the build. Its structure is fixed; only the scheduling state of
/// the nodes changes while the build runs.
pub struct WorkGraph {
    graph: Graph<TaskHandle>,
    task_node_index: BTreeMap<TaskId, NodeId>,
    requested_nodes: BTreeSet<NodeId>,
    filtered_tasks: BTreeSet<TaskId>,
}

impl WorkGraph {
    pub fn graph(&self) -> &Graph<TaskHandle> {
        &self.graph
    }

    pub fn node_for(&self, task: &TaskId) -> Option<NodeId> {
        self.task_node_index.get(task).copied()
    }

    pub fn task(&self, node: NodeId) -> Option<&TaskHandle> {
        self.graph.payload(node)
    }

    pub fn task_node_index(&self) -> &BTreeMap<TaskId, NodeId> {
        &self.task_node_index
    }

    pub fn requested_nodes(&self) -> &BTreeSet<NodeId> {
        &self.requested_nodes
    }

    /// Tasks excluded by the filter, requested or reached as dependencies.
    pub fn filtered_tasks(&self) -> &BTreeSet<TaskId> {
        &self.filtered_tasks
    }

    pub fn state(&self, node: NodeId) -> Option<NodeState> {
        self.graph.state(node)
    }

    pub fn set_state(&mut self, node: NodeId, state: NodeState) -> Result<(), GraphError> {
        self.graph.set_state(node, state)
    }

    pub fn should_run(&self) -> Vec<NodeId> {
        self.graph
            .node_ids()
            .into_iter()
            .filter(|node| self.graph.state(*node) == Some(NodeState::ShouldRun))
            .collect()
    }

    pub fn topological_order(&self) -> Result<Vec<NodeId>, GraphError> {
        self.graph.topological_order()
    }

    fn name(&self, node: NodeId) -> String {
        self.task(node)
            .map(|task| task.id().to_string())
            .unwrap_or_default()
    }
}

impl std::fmt::Debug for WorkGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkGraph")
            .field("tasks", &self.task_node_index.keys().collect::<Vec<_>>())
            .field("requested_nodes", &self.requested_nodes)
            .field("filtered_tasks", &self.filtered_tasks)
            .finish()
    }
}

/// Renders the graph as a Mermaid diagram.
impl std::fmt::Display for WorkGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "graph LR")?;

        for index in self.graph.node_ids() {
            let name = self.name(index).replace('"', "\\\""); // Simple escape
            writeln!(f, "    {}[\"{}\"]", index.index(), name)?;

            if self.requested_nodes.contains(&index) {
                writeln!(f, "    style {} stroke-width:3px", index.index())?;
            }
        }

        for edge in self.graph.all_edges() {
            writeln!(
                f,
                "    {} -- \"{}\" --> {}",
                edge.source.index(),
                edge.kind.label(),
                edge.target.index()
            )?;
        }

        Ok(())
    }
}

/// Renders a task cycle as a tree, one task per line:
///
/// ```text
/// :a
/// \--- :b
///      \--- :a (*)
/// ```
#[derive(Debug, Default, Clone, Copy)]
pub struct TaskCycleReporter;

impl CycleReporter<TaskHandle> for TaskCycleReporter {
    fn report(&self, cycle: &[&TaskHandle]) -> String {
        let mut out = String::new();
        let last = cycle.len().saturating_sub(1);

        for (i, task) in cycle.iter().enumerate() {
            if i > 0 {
                out.push('\n');
                out.push_str(&"     ".repeat(i - 1));
                out.push_str("\\--- ");
            }
            out.push_str(&task.id().to_string());
            if i == last && i > 0 {
                out.push_str(" (*)");
            }
        }

        out
    }
}

type TaskFilter<'a> = Box<dyn Fn(&dyn TaskDefinition) -> bool + 'a>;

/// Expands requested tasks into a [`WorkGraph`].
///
/// # Example
///
/// ```rust
/// use workplan::{DeclaredTask, TaskContainer, TaskId, WorkGraphBuilder};
///
/// let mut tasks = TaskContainer::new();
/// let compile = tasks.add(DeclaredTask::new(TaskId::new(":app", "compile")));
/// let test = tasks.add(DeclaredTask::new(TaskId::new(":app", "test")).depends_on(compile.clone()));
///
/// let plan = WorkGraphBuilder::new(&tasks).build([test]).unwrap();
/// assert!(plan.node_for(&compile).is_some());
/// ```
pub struct WorkGraphBuilder<'a, R: TaskResolver + ?Sized> {
    resolver: &'a R,
    filter: Option<TaskFilter<'a>>,
    reporter: Box<dyn CycleReporter<TaskHandle> + 'a>,
}

impl<'a, R: TaskResolver + ?Sized> WorkGraphBuilder<'a, R> {
    pub fn new(resolver: &'a R) -> Self {
        Self {
            resolver,
            filter: None,
            reporter: Box::new(TaskCycleReporter),
        }
    }

    /// Only tasks accepted by `filter` take part in the build.
    pub fn filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(&dyn TaskDefinition) -> bool + 'a,
    {
        self.filter = Some(Box::new(filter));
        self
    }

    pub fn cycle_reporter(mut self, reporter: impl CycleReporter<TaskHandle> + 'a) -> Self {
        self.reporter = Box::new(reporter);
        self
    }

    pub fn build(&self, requested: impl IntoIterator<Item = TaskId>) -> Result<WorkGraph, PlanError> {
        let mut requested: Vec<_> = requested.into_iter().collect();
        requested.sort();
        requested.dedup();

        let mut state = Expansion {
            builder: self,
            graph: Graph::new(),
            index: HashMap::new(),
            filtered: BTreeSet::new(),
        };

        let mut requested_nodes = BTreeSet::new();
        for id in &requested {
            let task = self
                .resolver
                .resolve(id)
                .ok_or_else(|| PlanError::UnknownRequestedTask(id.clone()))?;
            if let Some(node) = state.node_for(task) {
                requested_nodes.insert(node);
            }
        }

        state.expand(&requested_nodes)?;

        let Expansion {
            mut graph,
            mut index,
            filtered,
            ..
        } = state;

        let entry: Vec<_> = requested_nodes.iter().copied().collect();
        let removed = graph.remove_dead_nodes(&entry, is_live_edge);
        for task in &removed {
            index.remove(task.id());
        }
        tracing::debug!("removed {} unreachable tasks", removed.len());

        let connected = connect_finalizer_dependencies(&mut graph)?;
        tracing::debug!("connected {} finalizer dependencies", connected);

        let dropped = graph.break_cycles(self.reporter.as_ref())?;
        for edge in &dropped {
            tracing::debug!(
                "ignoring '{}' ordering between {} and {}",
                edge.kind.label(),
                name_of(&graph, edge.source),
                name_of(&graph, edge.target)
            );
        }

        mark_should_run(&mut graph, &requested_nodes)?;

        tracing::info!(
            "planned {} tasks ({} requested, {} filtered)",
            graph.node_count(),
            requested_nodes.len(),
            filtered.len()
        );

        Ok(WorkGraph {
            graph,
            task_node_index: index.into_iter().collect(),
            requested_nodes,
            filtered_tasks: filtered,
        })
    }
}

struct Expansion<'b, 'a, R: TaskResolver + ?Sized> {
    builder: &'b WorkGraphBuilder<'a, R>,
    graph: Graph<TaskHandle>,
    index: HashMap<TaskId, NodeId>,
    filtered: BTreeSet<TaskId>,
}

impl<R: TaskResolver + ?Sized> Expansion<'_, '_, R> {
    /// The node of a task, created on first sight. Tasks rejected by the
    /// filter get no node at all.
    fn node_for(&mut self, task: TaskHandle) -> Option<NodeId> {
        let id = task.id();

        if let Some(node) = self.index.get(id) {
            return Some(*node);
        }
        if self.filtered.contains(id) {
            return None;
        }
        if let Some(filter) = &self.builder.filter
            && !filter(task.as_ref())
        {
            self.filtered.insert(id.clone());
            return None;
        }

        let id = id.clone();
        let node = self.graph.add_node(task);
        self.index.insert(id, node);
        Some(node)
    }

    fn lookup(&mut self, id: &TaskId, referenced_by: &TaskId) -> Result<Option<NodeId>, PlanError> {
        let task = self
            .builder
            .resolver
            .resolve(id)
            .ok_or_else(|| PlanError::UnknownTask {
                task: id.clone(),
                referenced_by: referenced_by.clone(),
            })?;

        Ok(self.node_for(task))
    }

    fn expand(&mut self, requested: &BTreeSet<NodeId>) -> Result<(), PlanError> {
        let mut queue: VecDeque<NodeId> = requested.iter().copied().collect();
        let mut visited = HashSet::new();

        while let Some(node) = queue.pop_front() {
            if !visited.insert(node) {
                continue;
            }

            let Some(task) = self.graph.payload(node).cloned() else {
                continue;
            };
            let id = task.id();

            task.prepare_for_execution();
            let relations = task.relations();
            tracing::debug!("visiting {}", id);

            for dependency in &relations.depends_on {
                if let Some(other) = self.lookup(dependency, id)? {
                    self.graph.add_edge(other, EdgeType::DependencyOf, node)?;
                    queue.push_back(other);
                }
            }

            for finalizer in &relations.finalized_by {
                if let Some(other) = self.lookup(finalizer, id)? {
                    self.graph.add_edge(node, EdgeType::FinalizedBy, other)?;
                    queue.push_back(other);
                }
            }

            for earlier in &relations.must_run_after {
                if let Some(other) = self.lookup(earlier, id)? {
                    self.graph.add_edge(other, EdgeType::MustCompleteBefore, node)?;
                }
            }

            for earlier in &relations.should_run_after {
                if let Some(other) = self.lookup(earlier, id)? {
                    self.graph.add_edge(other, EdgeType::ShouldCompleteBefore, node)?;
                }
            }
        }

        Ok(())
    }
}

/// Dependencies of a live node and finalizers of a live node are live.
fn is_live_edge(edge: &Edge, direction: Direction) -> bool {
    match direction {
        Direction::Incoming => edge.kind == EdgeType::DependencyOf,
        Direction::Outgoing => edge.kind == EdgeType::FinalizedBy,
    }
}

/// For every `finalized -> finalizer` edge, the dependencies of the finalizer
/// should not start before the finalized node has started. Dependencies that
/// are already ordered before the finalized node are left alone. Returns the
/// number of edges added; running it twice adds nothing.
pub(crate) fn connect_finalizer_dependencies<T>(graph: &mut Graph<T>) -> Result<usize, GraphError> {
    let finalizer_edges: Vec<_> = graph
        .all_edges()
        .into_iter()
        .filter(|edge| edge.kind == EdgeType::FinalizedBy)
        .collect();

    let mut added = 0;
    for edge in finalizer_edges {
        let finalized = edge.source;
        let ordered_before = graph.ancestors(finalized, &HARD_EDGES);

        let mut dependencies = Vec::new();
        graph.walk_incoming_edges_from(edge.target, |incoming| {
            if incoming.kind != EdgeType::DependencyOf || incoming.source == finalized {
                return false;
            }
            dependencies.push(incoming.source);
            true
        });

        for dependency in dependencies {
            if ordered_before.contains(&dependency) {
                continue;
            }
            if graph.add_edge(finalized, EdgeType::AvoidStartingBeforeFinalized, dependency)? {
                added += 1;
            }
        }
    }

    Ok(added)
}

fn mark_should_run<T>(graph: &mut Graph<T>, requested: &BTreeSet<NodeId>) -> Result<(), GraphError> {
    let mut marked = BTreeSet::new();
    for node in requested {
        marked.insert(*node);
        marked.extend(graph.ancestors(*node, &[EdgeType::DependencyOf]));
    }

    for node in marked {
        graph.set_state(node, NodeState::ShouldRun)?;
    }

    Ok(())
}

fn name_of(graph: &Graph<TaskHandle>, node: NodeId) -> String {
    graph
        .payload(node)
        .map(|task| task.id().to_string())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::task::{DeclaredTask, TaskContainer};

    fn id(name: &str) -> TaskId {
        TaskId::new(":", name)
    }

    fn edge(plan: &WorkGraph, source: &str, kind: EdgeType, target: &str) -> Edge {
        Edge::new(
            plan.node_for(&id(source)).unwrap(),
            kind,
            plan.node_for(&id(target)).unwrap(),
        )
    }

    fn count_edges(plan: &WorkGraph, kind: EdgeType) -> usize {
        plan.graph()
            .all_edges()
            .iter()
            .filter(|edge| edge.kind == kind)
            .count()
    }

    #[test]
    fn test_compile_test_cleanup_scenario() {
        let mut tasks = TaskContainer::new();
        tasks.add(DeclaredTask::new(id("compile")));
        tasks.add(
            DeclaredTask::new(id("test"))
                .depends_on(id("compile"))
                .finalized_by(id("cleanup")),
        );
        tasks.add(DeclaredTask::new(id("cleanup")));

        let plan = WorkGraphBuilder::new(&tasks).build([id("test")]).unwrap();

        let test = plan.node_for(&id("test")).unwrap();
        let compile = plan.node_for(&id("compile")).unwrap();
        let cleanup = plan.node_for(&id("cleanup")).unwrap();

        assert_eq!(plan.requested_nodes(), &BTreeSet::from([test]));
        assert!(plan.filtered_tasks().is_empty());

        let edges = plan.graph().all_edges();
        assert!(edges.contains(&edge(&plan, "compile", EdgeType::DependencyOf, "test")));
        assert!(edges.contains(&edge(&plan, "test", EdgeType::FinalizedBy, "cleanup")));

        assert_eq!(plan.state(compile), Some(NodeState::ShouldRun));
        assert_eq!(plan.state(test), Some(NodeState::ShouldRun));
        assert_eq!(plan.state(cleanup), Some(NodeState::NotScheduled));
    }

    #[test]
    fn test_ordering_only_tasks_are_not_pulled_in() {
        let mut tasks = TaskContainer::new();
        tasks.add(DeclaredTask::new(id("clean")));
        tasks.add(DeclaredTask::new(id("lint")));
        tasks.add(
            DeclaredTask::new(id("build"))
                .must_run_after(id("clean"))
                .should_run_after(id("lint")),
        );

        let plan = WorkGraphBuilder::new(&tasks).build([id("build")]).unwrap();

        assert_eq!(plan.graph().node_count(), 1);
        assert!(plan.node_for(&id("clean")).is_none());
        assert!(plan.node_for(&id("lint")).is_none());
        assert_eq!(plan.graph().edge_count(), 0);
    }

    #[test]
    fn test_ordering_between_requested_tasks_is_kept() {
        let mut tasks = TaskContainer::new();
        tasks.add(DeclaredTask::new(id("clean")));
        tasks.add(DeclaredTask::new(id("build")).must_run_after(id("clean")));

        let plan = WorkGraphBuilder::new(&tasks)
            .build([id("build"), id("clean")])
            .unwrap();

        assert!(
            plan.graph()
                .all_edges()
                .contains(&edge(&plan, "clean", EdgeType::MustCompleteBefore, "build"))
        );

        let order = plan.topological_order().unwrap();
        let clean = plan.node_for(&id("clean")).unwrap();
        let build = plan.node_for(&id("build")).unwrap();
        let position = |node| order.iter().position(|n| *n == node).unwrap();
        assert!(position(clean) < position(build));
    }

    #[test]
    fn test_filtered_tasks_are_excluded_as_dependencies() {
        let mut tasks = TaskContainer::new();
        tasks.add(DeclaredTask::new(id("javadoc")));
        tasks.add(DeclaredTask::new(id("compile")));
        tasks.add(
            DeclaredTask::new(id("assemble"))
                .depends_on(id("compile"))
                .depends_on(id("javadoc")),
        );

        let plan = WorkGraphBuilder::new(&tasks)
            .filter(|task| task.id().name() != "javadoc")
            .build([id("assemble"), id("javadoc")])
            .unwrap();

        assert_eq!(plan.filtered_tasks(), &BTreeSet::from([id("javadoc")]));
        assert!(plan.node_for(&id("javadoc")).is_none());
        assert_eq!(plan.requested_nodes().len(), 1);
        assert_eq!(plan.graph().node_count(), 2);
    }

    #[test]
    fn test_prepare_is_called_once_per_task() {
        let compile = Arc::new(DeclaredTask::new(id("compile")));
        let mut tasks = TaskContainer::new();
        tasks.insert(compile.clone());
        tasks.add(DeclaredTask::new(id("a")).depends_on(id("compile")));
        tasks.add(DeclaredTask::new(id("b")).depends_on(id("compile")));

        WorkGraphBuilder::new(&tasks)
            .build([id("a"), id("b"), id("compile")])
            .unwrap();

        assert_eq!(compile.prepared_count(), 1);
    }

    #[test]
    fn test_unknown_dependency() {
        let mut tasks = TaskContainer::new();
        tasks.add(DeclaredTask::new(id("build")).depends_on(id("missing")));

        let err = WorkGraphBuilder::new(&tasks).build([id("build")]).unwrap_err();
        assert!(matches!(
            err,
            PlanError::UnknownTask { task, referenced_by } if task == id("missing") && referenced_by == id("build")
        ));

        let err = WorkGraphBuilder::new(&tasks).build([id("nope")]).unwrap_err();
        assert!(matches!(err, PlanError::UnknownRequestedTask(_)));
    }

    #[test]
    fn test_dependency_cycle_is_reported() {
        let mut tasks = TaskContainer::new();
        tasks.add(DeclaredTask::new(id("a")).depends_on(id("b")));
        tasks.add(DeclaredTask::new(id("b")).depends_on(id("a")));

        let err = WorkGraphBuilder::new(&tasks).build([id("a")]).unwrap_err();
        let PlanError::Graph(GraphError::Cycle(text)) = err else {
            panic!("expected a cycle");
        };
        assert_eq!(text, ":a\n\\--- :b\n     \\--- :a (*)");
    }

    #[test]
    fn test_should_run_after_cycle_is_ignored() {
        let mut tasks = TaskContainer::new();
        tasks.add(DeclaredTask::new(id("a")).should_run_after(id("b")));
        tasks.add(DeclaredTask::new(id("b")).depends_on(id("a")));

        let plan = WorkGraphBuilder::new(&tasks).build([id("b")]).unwrap();

        assert_eq!(count_edges(&plan, EdgeType::ShouldCompleteBefore), 0);
        assert_eq!(count_edges(&plan, EdgeType::DependencyOf), 1);
    }

    #[test]
    fn test_finalizer_dependencies_avoid_starting_early() {
        let mut tasks = TaskContainer::new();
        tasks.add(DeclaredTask::new(id("compile")));
        tasks.add(DeclaredTask::new(id("start_server")).depends_on(id("deploy")));
        tasks.add(DeclaredTask::new(id("deploy")));
        tasks.add(
            DeclaredTask::new(id("test"))
                .depends_on(id("compile"))
                .finalized_by(id("report")),
        );
        // report needs compile (already before test) and deploy (not ordered)
        tasks.add(
            DeclaredTask::new(id("report"))
                .depends_on(id("compile"))
                .depends_on(id("start_server")),
        );

        let mut plan = WorkGraphBuilder::new(&tasks).build([id("test")]).unwrap();
        let avoid = EdgeType::AvoidStartingBeforeFinalized;

        let edges = plan.graph().all_edges();
        assert!(edges.contains(&edge(&plan, "test", avoid, "start_server")));
        assert!(edges.contains(&edge(&plan, "test", avoid, "deploy")));
        assert!(!edges.contains(&edge(&plan, "test", avoid, "compile")));
        assert_eq!(count_edges(&plan, avoid), 2);

        assert_eq!(connect_finalizer_dependencies(&mut plan.graph).unwrap(), 0);
        assert_eq!(count_edges(&plan, avoid), 2);
        assert!(plan.topological_order().is_ok());
    }

    #[test]
    fn test_mermaid_rendering() {
        let mut tasks = TaskContainer::new();
        tasks.add(DeclaredTask::new(id("compile")));
        tasks.add(DeclaredTask::new(id("test")).depends_on(id("compile")));

        let plan = WorkGraphBuilder::new(&tasks).build([id("test")]).unwrap();
        let text = plan.to_string();

        assert!(text.starts_with("graph LR\n"));
        assert!(text.contains("[\":test\"]"));
        assert!(text.contains("-- \"dependency of\" -->"));
    }
}
