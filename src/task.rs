//! The task model consumed by the planner.
//!
//! The planner never looks inside a task. It needs an identity, the four
//! kinds of relations a task declares towards other tasks, and the files the
//! task reads, writes or destroys. Anything implementing [`TaskDefinition`]
//! can take part in a build.

use std::collections::BTreeMap;
use std::fmt::{Debug, Display};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use camino::Utf8PathBuf;

use crate::error::FileResolveError;

/// Atomic reference-counted string type used for identifiers.
pub(crate) type ArcStr = Arc<str>;

/// Identity path of a build, e.g. `:` for the root build.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BuildId(ArcStr);

impl BuildId {
    pub fn new(path: impl AsRef<str>) -> Self {
        Self(path.as_ref().into())
    }

    pub fn root() -> Self {
        Self::new(":")
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for BuildId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identity path of a project inside a build, e.g. `:app`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProjectId(ArcStr);

impl ProjectId {
    pub fn new(path: impl AsRef<str>) -> Self {
        Self(path.as_ref().into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for ProjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Unique identity of a task. Ordering is by project first, then by name,
/// which gives requested tasks a stable processing order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId {
    project: Option<ProjectId>,
    name: ArcStr,
}

impl TaskId {
    /// A task owned by a project; it shares the project's resource lock.
    pub fn new(project: impl AsRef<str>, name: impl AsRef<str>) -> Self {
        Self {
            project: Some(ProjectId::new(project)),
            name: name.as_ref().into(),
        }
    }

    /// Work that does not belong to any project and takes no project lock.
    pub fn detached(name: impl AsRef<str>) -> Self {
        Self {
            project: None,
            name: name.as_ref().into(),
        }
    }

    pub fn project(&self) -> Option<&ProjectId> {
        self.project.as_ref()
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.project {
            Some(project) if project.as_str() == ":" => write!(f, ":{}", self.name),
            Some(project) => write!(f, "{}:{}", project, self.name),
            None => f.write_str(&self.name),
        }
    }
}

/// Relations a task declares towards other tasks.
#[derive(Debug, Clone, Default)]
pub struct TaskRelations {
    /// Tasks that must complete before this one, and are pulled into the build.
    pub depends_on: Vec<TaskId>,
    /// Tasks that run after this one, and are pulled into the build.
    pub finalized_by: Vec<TaskId>,
    /// Tasks that must complete before this one if both are scheduled.
    pub must_run_after: Vec<TaskId>,
    /// Tasks that should complete before this one if it doesn't create a cycle.
    pub should_run_after: Vec<TaskId>,
}

/// Files declared by a task, as written by the user (not canonical).
#[derive(Debug, Clone, Default)]
pub struct TaskFiles {
    pub inputs: Vec<Utf8PathBuf>,
    pub outputs: Vec<Utf8PathBuf>,
    pub local_state: Vec<Utf8PathBuf>,
    pub destroyables: Vec<Utf8PathBuf>,
}

/// The view of a task that the planner works with.
pub trait TaskDefinition: Send + Sync {
    fn id(&self) -> &TaskId;

    fn relations(&self) -> TaskRelations;

    /// Produce the declared files. Implementations that need to resolve
    /// dependencies to compute their files may hit a [`ResourceDeadlock`]
    /// when the current thread already holds the lock they need.
    ///
    /// [`ResourceDeadlock`]: crate::error::ResourceDeadlock
    fn files(&self) -> Result<TaskFiles, FileResolveError>;

    /// Called exactly once when the task is first visited by the builder.
    fn prepare_for_execution(&self) {}
}

pub type TaskHandle = Arc<dyn TaskDefinition>;

/// Looks up task definitions by identity.
pub trait TaskResolver {
    fn resolve(&self, id: &TaskId) -> Option<TaskHandle>;
}

/// In-memory task registry.
#[derive(Default, Clone)]
pub struct TaskContainer {
    tasks: BTreeMap<TaskId, TaskHandle>,
}

impl TaskContainer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, task: impl TaskDefinition + 'static) -> TaskId {
        self.insert(Arc::new(task))
    }

    /// Register an already shared task handle.
    pub fn insert(&mut self, task: TaskHandle) -> TaskId {
        let id = task.id().clone();
        self.tasks.insert(id.clone(), task);
        id
    }

    pub fn get(&self, id: &TaskId) -> Option<&TaskHandle> {
        self.tasks.get(id)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

impl TaskResolver for TaskContainer {
    fn resolve(&self, id: &TaskId) -> Option<TaskHandle> {
        self.tasks.get(id).cloned()
    }
}

impl Debug for TaskContainer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.tasks.keys()).finish()
    }
}

/// A task whose relations and files are fixed at construction time.
///
/// ```rust
/// use workplan::{DeclaredTask, TaskContainer, TaskId};
///
/// let mut tasks = TaskContainer::new();
/// let compile = tasks.add(DeclaredTask::new(TaskId::new(":app", "compile")));
/// tasks.add(DeclaredTask::new(TaskId::new(":app", "test")).depends_on(compile));
/// ```
pub struct DeclaredTask {
    id: TaskId,
    relations: TaskRelations,
    files: TaskFiles,
    prepared: AtomicUsize,
}

impl DeclaredTask {
    pub fn new(id: TaskId) -> Self {
        Self {
            id,
            relations: TaskRelations::default(),
            files: TaskFiles::default(),
            prepared: AtomicUsize::new(0),
        }
    }

    pub fn depends_on(mut self, task: TaskId) -> Self {
        self.relations.depends_on.push(task);
        self
    }

    pub fn finalized_by(mut self, task: TaskId) -> Self {
        self.relations.finalized_by.push(task);
        self
    }

    pub fn must_run_after(mut self, task: TaskId) -> Self {
        self.relations.must_run_after.push(task);
        self
    }

    pub fn should_run_after(mut self, task: TaskId) -> Self {
        self.relations.should_run_after.push(task);
        self
    }

    pub fn input(mut self, path: impl Into<Utf8PathBuf>) -> Self {
        self.files.inputs.push(path.into());
        self
    }

    pub fn output(mut self, path: impl Into<Utf8PathBuf>) -> Self {
        self.files.outputs.push(path.into());
        self
    }

    pub fn local_state(mut self, path: impl Into<Utf8PathBuf>) -> Self {
        self.files.local_state.push(path.into());
        self
    }

    pub fn destroys(mut self, path: impl Into<Utf8PathBuf>) -> Self {
        self.files.destroyables.push(path.into());
        self
    }

    /// How many times the builder prepared this task.
    pub fn prepared_count(&self) -> usize {
        self.prepared.load(Ordering::Relaxed)
    }
}

impl TaskDefinition for DeclaredTask {
    fn id(&self) -> &TaskId {
        &self.id
    }

    fn relations(&self) -> TaskRelations {
        self.relations.clone()
    }

    fn files(&self) -> Result<TaskFiles, FileResolveError> {
        Ok(self.files.clone())
    }

    fn prepare_for_execution(&self) {
        self.prepared.fetch_add(1, Ordering::Relaxed);
    }
}

impl Debug for DeclaredTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "DeclaredTask({})", self.id)
    }
}
