//! Directed acyclic graph of tasks.
//!
//! A [`Graph`] is produced only by [`GraphBuilder::build`], which validates the
//! whole declaration at once: either every task and edge is accepted or an
//! error is returned and nothing is built.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

use thiserror::Error;

use super::task::Task;
use super::types::{DagId, TaskId};

/// Errors raised while building a graph.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DagError {
    /// The edges form a cycle. `tasks` lists every task that could not be
    /// ordered, which includes the cycle itself.
    #[error("cycle detected among tasks: {}", join(tasks))]
    Cycle { tasks: Vec<TaskId> },

    /// An edge names a task that was never declared.
    #[error("edge {upstream} -> {downstream} references unknown task '{missing}'")]
    UnknownTask {
        upstream: TaskId,
        downstream: TaskId,
        missing: TaskId,
    },

    /// Two tasks were declared with the same name.
    #[error("duplicate task: {0}")]
    DuplicateTask(TaskId),

    /// Lookup of a task that is not part of the graph.
    #[error("task not found: {0}")]
    TaskNotFound(TaskId),
}

fn join(ids: &[TaskId]) -> String {
    ids.iter().map(TaskId::as_str).collect::<Vec<_>>().join(", ")
}

/// A validated pipeline graph.
///
/// Tasks keep their declaration order; adjacency is held in ordered sets so two
/// graphs built from the same declarations are identical, including
/// iteration order.
#[derive(Debug, Clone)]
pub struct Graph {
    id: DagId,
    name: String,
    tasks: Vec<Task>,
    index: HashMap<TaskId, usize>,
    upstream: BTreeMap<TaskId, BTreeSet<TaskId>>,
    downstream: BTreeMap<TaskId, BTreeSet<TaskId>>,
    order: Vec<TaskId>,
}

impl Graph {
    pub fn id(&self) -> &DagId {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Tasks in declaration order.
    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    pub fn task(&self, id: &TaskId) -> Option<&Task> {
        self.index.get(id).map(|&i| &self.tasks[i])
    }

    pub fn contains(&self, id: &TaskId) -> bool {
        self.index.contains_key(id)
    }

    /// Task ids in declaration order.
    pub fn task_ids(&self) -> impl Iterator<Item = &TaskId> {
        self.tasks.iter().map(Task::id)
    }

    /// Direct upstreams of a task. Empty for unknown ids.
    pub fn upstream<'a>(&'a self, id: &TaskId) -> impl Iterator<Item = &'a TaskId> + use<'a> {
        self.upstream.get(id).into_iter().flatten()
    }

    /// Direct downstreams of a task. Empty for unknown ids.
    pub fn downstream<'a>(&'a self, id: &TaskId) -> impl Iterator<Item = &'a TaskId> + use<'a> {
        self.downstream.get(id).into_iter().flatten()
    }

    /// Every task reachable downstream of `id`, not including `id`.
    pub fn descendants(&self, id: &TaskId) -> BTreeSet<TaskId> {
        let mut seen = BTreeSet::new();
        let mut queue: VecDeque<&TaskId> = self.downstream(id).collect();
        while let Some(next) = queue.pop_front() {
            if seen.insert(next.clone()) {
                queue.extend(self.downstream(next));
            }
        }
        seen
    }

    /// All edges as `(upstream, downstream)` pairs, ordered.
    pub fn edges(&self) -> Vec<(TaskId, TaskId)> {
        self.downstream
            .iter()
            .flat_map(|(up, downs)| downs.iter().map(move |down| (up.clone(), down.clone())))
            .collect()
    }

    /// Tasks with no upstream.
    pub fn roots(&self) -> Vec<&TaskId> {
        self.task_ids()
            .filter(|id| self.upstream(id).next().is_none())
            .collect()
    }

    /// Tasks with no downstream.
    pub fn leaves(&self) -> Vec<&TaskId> {
        self.task_ids()
            .filter(|id| self.downstream(id).next().is_none())
            .collect()
    }

    /// A topological order computed at build time. Ties are broken by
    /// declaration order, so the result is stable.
    pub fn topological_order(&self) -> &[TaskId] {
        &self.order
    }

    /// Compare everything but the actions themselves: ids, declaration order,
    /// edges and retry policies.
    pub fn same_structure(&self, other: &Graph) -> bool {
        self.id == other.id
            && self.name == other.name
            && self.tasks.len() == other.tasks.len()
            && self
                .tasks
                .iter()
                .zip(&other.tasks)
                .all(|(a, b)| a.id() == b.id() && a.retry_policy() == b.retry_policy())
            && self.upstream == other.upstream
            && self.order == other.order
    }
}

/// Collects tasks and edges, then validates them in one step.
///
/// ```
/// use dagrun::{GraphBuilder, Task};
/// # use dagrun::testing::ScriptedAction;
/// # use std::sync::Arc;
/// # let noop = || Arc::new(ScriptedAction::succeeding());
/// let graph = GraphBuilder::new("etl", "ETL")
///     .task(Task::new("extract", noop()))
///     .task(Task::new("load", noop()))
///     .edge("extract", "load")
///     .build()
///     .unwrap();
/// assert_eq!(graph.len(), 2);
/// ```
pub struct GraphBuilder {
    id: DagId,
    name: String,
    tasks: Vec<Task>,
    edges: Vec<(TaskId, TaskId)>,
}

impl GraphBuilder {
    pub fn new(id: impl Into<DagId>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            tasks: Vec::new(),
            edges: Vec::new(),
        }
    }

    /// Declare a task.
    pub fn task(mut self, task: Task) -> Self {
        self.tasks.push(task);
        self
    }

    /// Declare several tasks in order.
    pub fn tasks(mut self, tasks: impl IntoIterator<Item = Task>) -> Self {
        self.tasks.extend(tasks);
        self
    }

    /// `upstream` must succeed before `downstream` may start.
    pub fn edge(mut self, upstream: impl Into<TaskId>, downstream: impl Into<TaskId>) -> Self {
        self.edges.push((upstream.into(), downstream.into()));
        self
    }

    /// Declare several edges at once.
    pub fn edges<I, U, D>(mut self, edges: I) -> Self
    where
        I: IntoIterator<Item = (U, D)>,
        U: Into<TaskId>,
        D: Into<TaskId>,
    {
        self.edges
            .extend(edges.into_iter().map(|(u, d)| (u.into(), d.into())));
        self
    }

    /// Link consecutive tasks: `[a, b, c]` adds `a -> b` and `b -> c`.
    pub fn chain<S: AsRef<str>>(mut self, ids: &[S]) -> Self {
        for pair in ids.windows(2) {
            self.edges.push((
                TaskId::new(pair[0].as_ref()),
                TaskId::new(pair[1].as_ref()),
            ));
        }
        self
    }

    /// Make `downstream` depend on each of `upstreams`.
    pub fn depends_on<S: AsRef<str>>(mut self, downstream: &str, upstreams: &[S]) -> Self {
        for up in upstreams {
            self.edges
                .push((TaskId::new(up.as_ref()), TaskId::new(downstream)));
        }
        self
    }

    /// Validate and build the graph.
    ///
    /// Checks, in order: duplicate task names, edges to unknown tasks, cycles
    /// (a self-edge is a cycle). Repeated identical edges collapse into one.
    pub fn build(self) -> Result<Graph, DagError> {
        let mut index = HashMap::with_capacity(self.tasks.len());
        for (i, task) in self.tasks.iter().enumerate() {
            if index.insert(task.id().clone(), i).is_some() {
                return Err(DagError::DuplicateTask(task.id().clone()));
            }
        }

        let mut upstream: BTreeMap<TaskId, BTreeSet<TaskId>> = BTreeMap::new();
        let mut downstream: BTreeMap<TaskId, BTreeSet<TaskId>> = BTreeMap::new();
        for task in &self.tasks {
            upstream.insert(task.id().clone(), BTreeSet::new());
            downstream.insert(task.id().clone(), BTreeSet::new());
        }

        for (up, down) in self.edges {
            for end in [&up, &down] {
                if !index.contains_key(end) {
                    return Err(DagError::UnknownTask {
                        missing: end.clone(),
                        upstream: up.clone(),
                        downstream: down.clone(),
                    });
                }
            }
            if up == down {
                return Err(DagError::Cycle { tasks: vec![up] });
            }
            if let Some(set) = upstream.get_mut(&down) {
                set.insert(up.clone());
            }
            if let Some(set) = downstream.get_mut(&up) {
                set.insert(down);
            }
        }

        let order = kahn_order(&self.tasks, &index, &upstream, &downstream)?;

        Ok(Graph {
            id: self.id,
            name: self.name,
            tasks: self.tasks,
            index,
            upstream,
            downstream,
            order,
        })
    }
}

/// Kahn's algorithm. The ready queue is seeded and refilled in declaration
/// order so the result does not depend on hashing.
fn kahn_order(
    tasks: &[Task],
    index: &HashMap<TaskId, usize>,
    upstream: &BTreeMap<TaskId, BTreeSet<TaskId>>,
    downstream: &BTreeMap<TaskId, BTreeSet<TaskId>>,
) -> Result<Vec<TaskId>, DagError> {
    let mut in_degree: HashMap<&TaskId, usize> = upstream
        .iter()
        .map(|(id, ups)| (id, ups.len()))
        .collect();

    let mut queue: VecDeque<&TaskId> = tasks
        .iter()
        .map(Task::id)
        .filter(|id| in_degree.get(id) == Some(&0))
        .collect();

    let mut order = Vec::with_capacity(tasks.len());
    while let Some(id) = queue.pop_front() {
        order.push(id.clone());

        let mut released: Vec<&TaskId> = Vec::new();
        for next in downstream.get(id).into_iter().flatten() {
            if let Some(degree) = in_degree.get_mut(next) {
                *degree -= 1;
                if *degree == 0 {
                    released.push(next);
                }
            }
        }
        released.sort_by_key(|id| index.get(*id).copied().unwrap_or(usize::MAX));
        queue.extend(released);
    }

    if order.len() != tasks.len() {
        let tasks = tasks
            .iter()
            .map(Task::id)
            .filter(|id| in_degree.get(id).is_some_and(|d| *d > 0))
            .cloned()
            .collect();
        return Err(DagError::Cycle { tasks });
    }

    Ok(order)
}
