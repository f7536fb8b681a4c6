//! Sensors: actions that wait for a condition.
//!
//! A [`SensorAction`] polls its [`Condition`] every `poke_interval` until it
//! holds or `timeout` has elapsed since the first poll. With a 5s interval
//! and a 20s timeout the condition is checked at 0s, 5s, 10s and 15s, and the
//! attempt fails with [`ActionError::Timeout`] at 20s.

use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use crate::core::task::{Action, ActionContext, ActionError};

/// Something a sensor waits for.
#[async_trait]
pub trait Condition: Send + Sync {
    /// Whether the condition holds right now. An error ends the attempt.
    async fn check(&self, ctx: &ActionContext) -> Result<bool, ActionError>;

    /// Human-readable description for logs.
    fn describe(&self) -> String;
}

/// Holds once a file or directory exists at `path`.
#[derive(Debug, Clone)]
pub struct FileExists {
    path: PathBuf,
}

impl FileExists {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }
}

#[async_trait]
impl Condition for FileExists {
    async fn check(&self, _ctx: &ActionContext) -> Result<bool, ActionError> {
        Ok(tokio::fs::metadata(&self.path).await.is_ok())
    }

    fn describe(&self) -> String {
        format!("file {} exists", self.path.display())
    }
}

/// Polls a condition until it holds or the timeout elapses.
#[derive(Clone)]
pub struct SensorAction {
    condition: Arc<dyn Condition>,
    poke_interval: Duration,
    timeout: Duration,
}

impl SensorAction {
    pub fn new(condition: Arc<dyn Condition>, poke_interval: Duration, timeout: Duration) -> Self {
        Self {
            condition,
            poke_interval,
            timeout,
        }
    }

    /// A sensor waiting for a file.
    pub fn file(path: impl Into<PathBuf>, poke_interval: Duration, timeout: Duration) -> Self {
        Self::new(Arc::new(FileExists::new(path)), poke_interval, timeout)
    }

    pub fn poke_interval(&self) -> Duration {
        self.poke_interval
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn condition(&self) -> &Arc<dyn Condition> {
        &self.condition
    }
}

#[async_trait]
impl Action for SensorAction {
    async fn execute(&self, ctx: &ActionContext) -> Result<(), ActionError> {
        let start = Instant::now();
        let mut polls = 0u32;

        loop {
            let elapsed = start.elapsed();
            if elapsed >= self.timeout {
                return Err(ActionError::Timeout {
                    waited: elapsed,
                    polls,
                });
            }

            polls += 1;
            if self.condition.check(ctx).await? {
                debug!(condition = %self.condition.describe(), polls, "sensor condition met");
                return Ok(());
            }
            debug!(condition = %self.condition.describe(), polls, "sensor condition not met");

            let remaining = self.timeout.saturating_sub(start.elapsed());
            let wait = self.poke_interval.min(remaining);
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = ctx.cancellation().cancelled() => return Err(ActionError::Cancelled),
            }
        }
    }

    fn kind(&self) -> &'static str {
        "sensor"
    }
}

impl std::fmt::Debug for SensorAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SensorAction")
            .field("condition", &self.condition.describe())
            .field("poke_interval", &self.poke_interval)
            .field("timeout", &self.timeout)
            .finish()
    }
}
