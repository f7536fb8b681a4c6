//! Scheduler handle for controlling a running scheduler.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{RwLock, mpsc, oneshot};

use crate::core::types::{DagId, RunId};

use super::types::{ActiveRun, SchedulerCommand, SchedulerError, SchedulerState};

/// Buffer size for the command channel between SchedulerHandle and Scheduler.
pub(crate) const COMMAND_CHANNEL_BUFFER: usize = 32;

/// Handle for controlling the scheduler.
#[derive(Clone)]
pub struct SchedulerHandle {
    pub(crate) command_tx: mpsc::Sender<SchedulerCommand>,
    pub(crate) state: Arc<RwLock<SchedulerState>>,
}

impl SchedulerHandle {
    /// Send a command whose response is a value and wait for it.
    async fn send_command<T>(
        &self,
        build_command: impl FnOnce(oneshot::Sender<T>) -> SchedulerCommand,
        operation: &str,
    ) -> Result<T, SchedulerError>
    where
        T: Send + 'static,
    {
        let (response_tx, response_rx) = oneshot::channel();
        self.command_tx
            .send(build_command(response_tx))
            .await
            .map_err(|_| {
                SchedulerError::ChannelError(format!("failed to send {} command", operation))
            })?;

        response_rx.await.map_err(|_| {
            SchedulerError::ChannelError(format!("failed to receive {} response", operation))
        })
    }

    /// Trigger a run of `dag_id` with the current time as logical date.
    pub async fn trigger(&self, dag_id: impl Into<DagId>) -> Result<RunId, SchedulerError> {
        self.trigger_for(dag_id, None).await
    }

    /// Trigger a run for a specific logical date.
    pub async fn trigger_at(
        &self,
        dag_id: impl Into<DagId>,
        logical_date: DateTime<Utc>,
    ) -> Result<RunId, SchedulerError> {
        self.trigger_for(dag_id, Some(logical_date)).await
    }

    async fn trigger_for(
        &self,
        dag_id: impl Into<DagId>,
        logical_date: Option<DateTime<Utc>>,
    ) -> Result<RunId, SchedulerError> {
        let dag_id = dag_id.into();
        self.send_command(
            |response| SchedulerCommand::Trigger {
                dag_id,
                logical_date,
                response,
            },
            "trigger",
        )
        .await?
    }

    /// Cancel an active run. Its unfinished tasks end `cancelled`.
    pub async fn cancel(&self, run_id: RunId) -> Result<(), SchedulerError> {
        self.send_command(
            |response| SchedulerCommand::Cancel { run_id, response },
            "cancel",
        )
        .await?
    }

    /// Runs that have not finished yet, oldest logical date first.
    pub async fn active_runs(&self) -> Result<Vec<ActiveRun>, SchedulerError> {
        self.send_command(
            |response| SchedulerCommand::ActiveRuns { response },
            "active runs",
        )
        .await
    }

    /// Pause the scheduler.
    ///
    /// While paused, schedule ticks are ignored, but manual triggers still work.
    pub async fn pause(&self) -> Result<(), SchedulerError> {
        self.send_command(|response| SchedulerCommand::Pause { response }, "pause")
            .await
    }

    pub async fn resume(&self) -> Result<(), SchedulerError> {
        self.send_command(|response| SchedulerCommand::Resume { response }, "resume")
            .await
    }

    /// Shut the scheduler down, waiting for active runs up to the configured
    /// timeout before cancelling them.
    pub async fn shutdown(&self) -> Result<(), SchedulerError> {
        self.send_command(
            |response| SchedulerCommand::Shutdown { response },
            "shutdown",
        )
        .await
    }

    pub async fn state(&self) -> SchedulerState {
        *self.state.read().await
    }

    pub async fn is_running(&self) -> bool {
        *self.state.read().await == SchedulerState::Running
    }

    pub async fn is_paused(&self) -> bool {
        *self.state.read().await == SchedulerState::Paused
    }
}
