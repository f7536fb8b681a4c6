//! Per-run task states and their transitions.
//!
//! Every change goes through [`TaskStateMap::compare_and_set`], which only
//! applies a transition when the task is still in the state the caller saw
//! and the move is legal. Completions racing each other cannot overwrite a
//! newer state.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;

use super::types::TaskId;

/// Lifecycle state of one task within one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Waiting for upstreams, or waiting to be dispatched again after a retry delay.
    Pending,
    /// Dispatched to the executor, waiting for a concurrency slot.
    Queued,
    /// Action is executing.
    Running,
    /// Last attempt failed; waiting out the retry delay.
    Retrying,
    Succeeded,
    Failed,
    /// Never executed because an upstream did not succeed.
    UpstreamFailed,
    /// The run was cancelled before this task finished.
    Cancelled,
}

impl TaskState {
    /// Terminal states never change again within a run.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Succeeded
                | TaskState::Failed
                | TaskState::UpstreamFailed
                | TaskState::Cancelled
        )
    }

    /// Terminal states that block downstream tasks.
    pub fn blocks_downstream(self) -> bool {
        self.is_terminal() && self != TaskState::Succeeded
    }

    /// Whether `self -> next` is a legal move.
    pub fn can_transition_to(self, next: TaskState) -> bool {
        use TaskState::*;
        match (self, next) {
            (_, Cancelled) => !self.is_terminal(),
            (Pending, Queued | UpstreamFailed) => true,
            (Queued, Running) => true,
            (Running, Succeeded | Failed | Retrying) => true,
            (Retrying, Pending) => true,
            _ => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskState::Pending => "pending",
            TaskState::Queued => "queued",
            TaskState::Running => "running",
            TaskState::Retrying => "retrying",
            TaskState::Succeeded => "succeeded",
            TaskState::Failed => "failed",
            TaskState::UpstreamFailed => "upstream_failed",
            TaskState::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A rejected state change.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StateError {
    #[error("task not in run: {0}")]
    UnknownTask(TaskId),

    #[error("illegal transition for {task}: {from} -> {to}")]
    IllegalTransition {
        task: TaskId,
        from: TaskState,
        to: TaskState,
    },

    /// Another writer moved the task first.
    #[error("stale transition for {task}: expected {expected}, found {actual}")]
    Stale {
        task: TaskId,
        expected: TaskState,
        actual: TaskState,
    },
}

/// An applied transition, returned so the caller can report it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub task_id: TaskId,
    pub from: TaskState,
    pub to: TaskState,
}

/// Task states for one run.
#[derive(Debug)]
pub struct TaskStateMap {
    states: RwLock<HashMap<TaskId, TaskState>>,
}

impl TaskStateMap {
    /// Start every task in `pending`.
    pub fn new<'a>(tasks: impl IntoIterator<Item = &'a TaskId>) -> Self {
        Self {
            states: RwLock::new(
                tasks
                    .into_iter()
                    .map(|id| (id.clone(), TaskState::Pending))
                    .collect(),
            ),
        }
    }

    pub async fn get(&self, task: &TaskId) -> Option<TaskState> {
        self.states.read().await.get(task).copied()
    }

    /// Copy of every task's current state.
    pub async fn snapshot(&self) -> HashMap<TaskId, TaskState> {
        self.states.read().await.clone()
    }

    pub async fn all_terminal(&self) -> bool {
        self.states.read().await.values().all(|s| s.is_terminal())
    }

    /// Move `task` from `expected` to `next`, atomically.
    pub async fn compare_and_set(
        &self,
        task: &TaskId,
        expected: TaskState,
        next: TaskState,
    ) -> Result<Transition, StateError> {
        let mut states = self.states.write().await;
        let current = states
            .get_mut(task)
            .ok_or_else(|| StateError::UnknownTask(task.clone()))?;

        if *current != expected {
            return Err(StateError::Stale {
                task: task.clone(),
                expected,
                actual: *current,
            });
        }
        if !expected.can_transition_to(next) {
            return Err(StateError::IllegalTransition {
                task: task.clone(),
                from: expected,
                to: next,
            });
        }

        *current = next;
        Ok(Transition {
            task_id: task.clone(),
            from: expected,
            to: next,
        })
    }
}
