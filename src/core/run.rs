//! Runs of a graph and their outcome.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::dag::Graph;
use super::state::{TaskState, TaskStateMap};
use super::types::{DagId, RunId, TaskId};

/// Overall status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Succeeded,
    /// At least one task ended `failed` or `upstream_failed`.
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        self != RunStatus::Running
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RunStatus::Running => "running",
            RunStatus::Succeeded => "succeeded",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        })
    }
}

/// One execution of a graph at a logical schedule time.
///
/// The graph is shared between runs; the state map belongs to this run only.
#[derive(Debug)]
pub struct Run {
    id: RunId,
    graph: Arc<Graph>,
    logical_date: DateTime<Utc>,
    created_at: DateTime<Utc>,
    states: TaskStateMap,
}

impl Run {
    /// A new run with every task pending.
    pub fn new(graph: Arc<Graph>, logical_date: DateTime<Utc>) -> Self {
        let states = TaskStateMap::new(graph.task_ids());
        Self {
            id: RunId::new(),
            graph,
            logical_date,
            created_at: Utc::now(),
            states,
        }
    }

    pub fn id(&self) -> RunId {
        self.id
    }

    pub fn dag_id(&self) -> &DagId {
        self.graph.id()
    }

    pub fn graph(&self) -> &Arc<Graph> {
        &self.graph
    }

    pub fn logical_date(&self) -> DateTime<Utc> {
        self.logical_date
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn states(&self) -> &TaskStateMap {
        &self.states
    }
}

/// Why a task did not succeed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskFailure {
    pub task_id: TaskId,
    pub state: TaskState,
    /// The action's error message for `failed` tasks; for `upstream_failed`
    /// tasks, which upstream blocked it.
    pub reason: String,
}

/// Final outcome of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: RunId,
    pub dag_id: DagId,
    pub logical_date: DateTime<Utc>,
    pub status: RunStatus,
    /// Final state of every task, in declaration order.
    pub states: Vec<(TaskId, TaskState)>,
    /// Attempts made per task. Tasks that never started are absent.
    pub attempts: HashMap<TaskId, u32>,
    /// Tasks that ended failed or upstream_failed, in declaration order.
    pub failures: Vec<TaskFailure>,
    #[serde(with = "duration_millis")]
    pub duration: Duration,
}

impl RunReport {
    pub fn succeeded(&self) -> bool {
        self.status == RunStatus::Succeeded
    }

    pub fn state(&self, task: &str) -> Option<TaskState> {
        self.states
            .iter()
            .find(|(id, _)| id.as_str() == task)
            .map(|(_, s)| *s)
    }

    pub fn attempts(&self, task: &str) -> u32 {
        self.attempts.get(&TaskId::new(task)).copied().unwrap_or(0)
    }

    pub fn failure(&self, task: &str) -> Option<&TaskFailure> {
        self.failures.iter().find(|f| f.task_id.as_str() == task)
    }

    pub fn count(&self, state: TaskState) -> usize {
        self.states.iter().filter(|(_, s)| *s == state).count()
    }
}

/// Status implied by final task states.
///
/// A failed or upstream-failed task makes the run failed even when the run
/// was cancelled afterwards.
pub(crate) fn status_from_states<'a>(
    states: impl IntoIterator<Item = &'a TaskState>,
    cancelled: bool,
) -> RunStatus {
    let mut any_cancelled = cancelled;
    let mut all_done = true;
    for state in states {
        match state {
            TaskState::Failed | TaskState::UpstreamFailed => return RunStatus::Failed,
            TaskState::Cancelled => any_cancelled = true,
            TaskState::Succeeded => {}
            _ => all_done = false,
        }
    }
    if any_cancelled {
        RunStatus::Cancelled
    } else if all_done {
        RunStatus::Succeeded
    } else {
        RunStatus::Failed
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        (d.as_millis() as u64).serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}
