use std::collections::{BTreeSet, HashMap};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};

use workplan::paths::Canonicalizer;
use workplan::*;

fn id(name: &str) -> TaskId {
    TaskId::new(":app", name)
}

fn tasks() -> TaskContainer {
    let mut tasks = TaskContainer::new();
    let compile = tasks.add(DeclaredTask::new(id("compile")).input("src").output("build/classes"));
    let cleanup = tasks.add(DeclaredTask::new(id("cleanup")));
    let docs = tasks.add(
        DeclaredTask::new(id("docs"))
            .depends_on(compile.clone())
            .output("build/docs"),
    );
    tasks.add(
        DeclaredTask::new(id("test"))
            .depends_on(compile.clone())
            .finalized_by(cleanup)
            .should_run_after(docs),
    );
    // without an ordering the destroyer may just as well run first
    tasks.add(DeclaredTask::new(id("clean")).destroys("build").must_run_after(compile));
    tasks
}

/// Whether every hard predecessor of `node` has completed.
fn is_ready(plan: &WorkGraph, node: NodeId) -> bool {
    plan.graph()
        .incoming_edges(node)
        .iter()
        .filter(|edge| edge.kind.is_hard())
        .all(|edge| plan.graph().is_complete(edge.source))
}

/// A small executor: starts ready nodes without conflicts, one project lock
/// held by each running node.
fn execute(mut plan: WorkGraph) -> Vec<TaskId> {
    let config = ExecutionConfig::default()
        .with_worker_limits(WorkerLimits::new(2, 4))
        .with_keep_alive_ms(10);
    let leases = WorkerLeaseService::new();
    let queue = Arc::new(ConditionalExecutionQueue::<()>::new(&config, leases.clone()));
    let mut coordinator =
        ConcurrentNodeExecutionCoordinator::new(BuildId::root(), leases, Canonicalizer::new("/workplan-exec"));

    let order = Arc::new(Mutex::new(Vec::new()));
    let (done_tx, done_rx) = mpsc::channel();
    let mut pending: BTreeSet<NodeId> = plan.graph().node_ids().into_iter().collect();
    let mut running: BTreeSet<NodeId> = BTreeSet::new();

    while !pending.is_empty() || !running.is_empty() {
        let ready: Vec<NodeId> = pending.iter().copied().filter(|&node| is_ready(&plan, node)).collect();

        for node in ready {
            let conflict = coordinator
                .find_conflicting_node(&plan, node, running.iter().copied())
                .unwrap();
            if conflict.is_some() {
                continue;
            }

            pending.remove(&node);
            running.insert(node);
            plan.set_state(node, NodeState::Executing).unwrap();

            let task = plan.task(node).unwrap().id().clone();
            let lock = coordinator.find_lock_for(&plan, node);
            let order = order.clone();
            let pool = queue.clone();
            let done = done_tx.clone();

            let execution = Execution::new(move || {
                let _guard = match &lock {
                    Some(lock) => Some(lock.lock(&*pool)?),
                    None => None,
                };
                order.lock().unwrap().push(task);
                Ok(())
            })
            .on_complete(move |result| done.send((node, result.is_ok())).unwrap());

            queue.submit(execution).unwrap();
        }

        let (node, ok) = done_rx.recv().unwrap();
        assert!(ok);
        running.remove(&node);
        plan.set_state(node, NodeState::Executed).unwrap();
        coordinator.node_completed(&plan, node);
    }

    queue.stop();
    order.lock().unwrap().clone()
}

#[test]
fn test_runs_everything_in_order() {
    let tasks = tasks();
    let plan = WorkGraphBuilder::new(&tasks)
        .build([id("test"), id("docs")])
        .unwrap();

    let order = execute(plan);
    let position: HashMap<_, _> = order.iter().enumerate().map(|(i, id)| (id.clone(), i)).collect();

    assert_eq!(order.len(), 4);
    assert!(position[&id("compile")] < position[&id("test")]);
    assert!(position[&id("compile")] < position[&id("docs")]);
    assert!(position[&id("test")] < position[&id("cleanup")]);
}

#[test]
fn test_destroyer_runs_after_consumers() {
    let tasks = tasks();
    let plan = WorkGraphBuilder::new(&tasks)
        .build([id("test"), id("docs"), id("clean")])
        .unwrap();

    let order = execute(plan);
    let position: HashMap<_, _> = order.iter().enumerate().map(|(i, id)| (id.clone(), i)).collect();

    assert_eq!(order.len(), 5);
    assert!(position[&id("compile")] < position[&id("clean")]);
    assert!(position[&id("test")] < position[&id("clean")]);
    assert!(position[&id("docs")] < position[&id("clean")]);
}
