//! Scheduler type definitions.
//!
//! Error types, state enum and the commands a [`SchedulerHandle`] sends to the
//! scheduler loop.
//!
//! [`SchedulerHandle`]: super::SchedulerHandle

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::oneshot;

use crate::core::types::{DagId, RunId};

/// Errors that can occur in the scheduler.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("pipeline not found: {0}")]
    PipelineNotFound(String),

    /// The run is unknown or already finished.
    #[error("run not found or already finished: {0}")]
    RunNotFound(RunId),

    #[error("channel error: {0}")]
    ChannelError(String),

    #[error("max active runs reached for pipeline: {0}")]
    MaxActiveRunsExceeded(String),

    #[error("pipeline is disabled: {0}")]
    PipelineDisabled(String),
}

/// State of the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Stopped,
    Running,
    /// Schedule ticks are ignored; manual triggers still start runs.
    Paused,
}

/// A run the scheduler is currently driving.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveRun {
    pub run_id: RunId,
    pub dag_id: DagId,
    pub logical_date: DateTime<Utc>,
}

/// Commands that can be sent to the scheduler.
pub(crate) enum SchedulerCommand {
    /// Start a run now, for `logical_date` or the current time.
    Trigger {
        dag_id: DagId,
        logical_date: Option<DateTime<Utc>>,
        response: oneshot::Sender<Result<RunId, SchedulerError>>,
    },
    /// Cancel an active run.
    Cancel {
        run_id: RunId,
        response: oneshot::Sender<Result<(), SchedulerError>>,
    },
    ActiveRuns {
        response: oneshot::Sender<Vec<ActiveRun>>,
    },
    Pause {
        response: oneshot::Sender<()>,
    },
    Resume {
        response: oneshot::Sender<()>,
    },
    /// Stop ticking, wait for active runs, then exit the loop.
    Shutdown {
        response: oneshot::Sender<()>,
    },
}
