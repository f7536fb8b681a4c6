//! Tasks and the action interface.
//!
//! A [`Task`] is a named node of a graph: an [`Action`] to invoke plus the
//! retry policy that governs it. The graph never looks inside the action.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use super::retry::RetryPolicy;
use super::types::{DagId, RunId, TaskId};

/// Ways a single attempt of an action can fail.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ActionError {
    /// The action ran and reported failure. Retried while the policy allows.
    #[error("{0}")]
    Failed(String),

    /// An external command exited with a non-zero status.
    #[error("command exited with code {code}: {stderr}")]
    CommandFailed { code: i32, stderr: String },

    /// A sensor's condition did not hold before its timeout elapsed.
    #[error("sensor timed out after {waited:?} ({polls} polls)")]
    Timeout { waited: Duration, polls: u32 },

    /// The action cannot run as configured, e.g. a missing credential.
    #[error("misconfigured: {0}")]
    Misconfigured(String),

    /// The run was cancelled while the action was in flight.
    #[error("cancelled")]
    Cancelled,
}

impl ActionError {
    /// Whether the executor may schedule another attempt after this error.
    ///
    /// Sensor timeouts are terminal: retrying would only wait again for a
    /// condition that already failed to appear.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ActionError::Failed(_) | ActionError::CommandFailed { .. }
        )
    }
}

/// What an action gets to know about the attempt it is running in.
#[derive(Debug, Clone)]
pub struct ActionContext {
    pub dag_id: DagId,
    pub run_id: RunId,
    pub task_id: TaskId,
    /// Logical schedule time of the run, not the wall clock.
    pub logical_date: DateTime<Utc>,
    /// 1-based attempt number.
    pub attempt: u32,
    cancel: CancellationToken,
}

impl ActionContext {
    pub fn new(
        dag_id: DagId,
        run_id: RunId,
        task_id: TaskId,
        logical_date: DateTime<Utc>,
    ) -> Self {
        Self {
            dag_id,
            run_id,
            task_id,
            logical_date,
            attempt: 1,
            cancel: CancellationToken::new(),
        }
    }

    /// A context for running one action outside of any graph.
    pub fn standalone(task_id: impl Into<TaskId>) -> Self {
        Self::new(
            DagId::new("standalone"),
            RunId::new(),
            task_id.into(),
            Utc::now(),
        )
    }

    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt;
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// A unit of work a task invokes.
///
/// Implementations should watch [`ActionContext::cancellation`] if they wait
/// on anything long-running; the executor also drops the future on
/// cancellation.
#[async_trait]
pub trait Action: Send + Sync {
    /// Run one attempt.
    async fn execute(&self, ctx: &ActionContext) -> Result<(), ActionError>;

    /// Short operator name used in logs and listings.
    fn kind(&self) -> &'static str {
        "custom"
    }
}

/// A named node in a graph. Immutable once the graph is built.
#[derive(Clone)]
pub struct Task {
    id: TaskId,
    action: Arc<dyn Action>,
    retry: RetryPolicy,
    description: Option<String>,
}

impl Task {
    pub fn new(id: impl Into<TaskId>, action: Arc<dyn Action>) -> Self {
        Self {
            id: id.into(),
            action,
            retry: RetryPolicy::default(),
            description: None,
        }
    }

    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn id(&self) -> &TaskId {
        &self.id
    }

    pub fn action(&self) -> &Arc<dyn Action> {
        &self.action
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("kind", &self.action.kind())
            .field("retry", &self.retry)
            .finish()
    }
}
