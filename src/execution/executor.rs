//! Task execution engine.
//!
//! The `TaskExecutor` runs single attempts of a task's action with:
//! - Concurrency limiting via semaphore
//! - Cancellation of the in-flight action
//! - A retry decision based on the task's retry policy
//!
//! Waiting out the retry delay is left to the caller so the task can sit in
//! `retrying` without holding a concurrency slot.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::core::task::{ActionContext, ActionError, Task};
use crate::core::types::TaskId;

/// Default number of actions allowed to run at once.
pub const DEFAULT_CONCURRENCY: usize = 4;

/// What should happen after an attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    Succeeded,
    /// The attempt failed and the policy allows another one after `delay`.
    Retry { error: ActionError, delay: Duration },
    /// The attempt failed and no retry is allowed.
    Failed { error: ActionError },
    /// The run was cancelled while the attempt was in flight.
    Cancelled,
}

/// Result of a single attempt of a task.
#[derive(Debug, Clone)]
pub struct AttemptResult {
    pub task_id: TaskId,
    /// 1-based attempt number.
    pub attempt: u32,
    pub duration: Duration,
    pub outcome: AttemptOutcome,
}

/// Executor for running task attempts with concurrency control.
pub struct TaskExecutor {
    max_concurrency: usize,
    semaphore: Arc<Semaphore>,
}

impl TaskExecutor {
    /// Create a new executor with the given concurrency limit (at least 1).
    pub fn new(max_concurrency: usize) -> Self {
        let max_concurrency = max_concurrency.max(1);
        Self {
            max_concurrency,
            semaphore: Arc::new(Semaphore::new(max_concurrency)),
        }
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }

    /// Get the number of free execution slots.
    pub fn available_permits(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Wait for an execution slot. Returns `None` if `cancel` fires first.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Option<OwnedSemaphorePermit> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            permit = Arc::clone(&self.semaphore).acquire_owned() => permit.ok(),
        }
    }

    /// Run one attempt of `task` in the caller's slot.
    ///
    /// The action runs on its own tokio task so a panic is reported as a
    /// failure. If the context's cancellation fires the action is aborted.
    pub async fn attempt(&self, task: &Task, ctx: ActionContext) -> AttemptResult {
        let task_id = task.id().clone();
        let attempt = ctx.attempt;
        let cancel = ctx.cancellation().clone();
        let start = Instant::now();

        let action = Arc::clone(task.action());
        let mut handle = AbortOnDrop(tokio::spawn(async move { action.execute(&ctx).await }));

        let result = tokio::select! {
            _ = cancel.cancelled() => Err(ActionError::Cancelled),
            joined = &mut handle.0 => match joined {
                Ok(result) => result,
                Err(e) if e.is_panic() => {
                    warn!(task = %task_id, attempt, "action panicked");
                    Err(ActionError::Failed("action panicked".to_string()))
                }
                Err(_) => Err(ActionError::Cancelled),
            },
        };
        drop(handle);

        let outcome = match result {
            Ok(()) => AttemptOutcome::Succeeded,
            Err(ActionError::Cancelled) => AttemptOutcome::Cancelled,
            Err(error) => {
                let policy = task.retry_policy();
                if error.is_retryable() && policy.allows_retry(attempt) {
                    AttemptOutcome::Retry {
                        error,
                        delay: policy.delay,
                    }
                } else {
                    AttemptOutcome::Failed { error }
                }
            }
        };

        let duration = start.elapsed();
        debug!(task = %task_id, attempt, ?duration, ?outcome, "attempt finished");

        AttemptResult {
            task_id,
            attempt,
            duration,
            outcome,
        }
    }

    /// Acquire a slot, then run one attempt.
    pub async fn execute(&self, task: &Task, ctx: ActionContext) -> AttemptResult {
        let Some(_permit) = self.acquire(ctx.cancellation()).await else {
            return AttemptResult {
                task_id: task.id().clone(),
                attempt: ctx.attempt,
                duration: Duration::ZERO,
                outcome: AttemptOutcome::Cancelled,
            };
        };
        self.attempt(task, ctx).await
    }
}

impl Default for TaskExecutor {
    fn default() -> Self {
        Self::new(DEFAULT_CONCURRENCY)
    }
}

/// Aborts the wrapped task when dropped.
struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::retry::RetryPolicy;
    use crate::core::task::Action;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    // Fails a fixed number of times, then succeeds.
    struct Flaky {
        failures: AtomicU32,
    }

    #[async_trait]
    impl Action for Flaky {
        async fn execute(&self, _ctx: &ActionContext) -> Result<(), ActionError> {
            let remaining = self.failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures.fetch_sub(1, Ordering::SeqCst);
                Err(ActionError::Failed(format!("{remaining} failures left")))
            } else {
                Ok(())
            }
        }
    }

    struct Panics;

    #[async_trait]
    impl Action for Panics {
        async fn execute(&self, _ctx: &ActionContext) -> Result<(), ActionError> {
            panic!("bad action");
        }
    }

    struct Sleeps(Duration);

    #[async_trait]
    impl Action for Sleeps {
        async fn execute(&self, _ctx: &ActionContext) -> Result<(), ActionError> {
            tokio::time::sleep(self.0).await;
            Ok(())
        }
    }

    struct TimesOut;

    #[async_trait]
    impl Action for TimesOut {
        async fn execute(&self, _ctx: &ActionContext) -> Result<(), ActionError> {
            Err(ActionError::Timeout {
                waited: Duration::from_secs(20),
                polls: 4,
            })
        }
    }

    fn flaky(name: &str, failures: u32, policy: RetryPolicy) -> Task {
        Task::new(
            name,
            Arc::new(Flaky {
                failures: AtomicU32::new(failures),
            }),
        )
        .with_retry(policy)
    }

    #[tokio::test]
    async fn test_success_on_first_attempt() {
        let executor = TaskExecutor::default();
        let task = flaky("a", 0, RetryPolicy::none());
        let result = executor.execute(&task, ActionContext::standalone("a")).await;
        assert_eq!(result.outcome, AttemptOutcome::Succeeded);
        assert_eq!(result.attempt, 1);
    }

    #[tokio::test]
    async fn test_failure_with_retries_left_asks_for_retry() {
        let executor = TaskExecutor::default();
        let task = flaky("a", 5, RetryPolicy::fixed(2, Duration::from_secs(120)));

        let first = executor.execute(&task, ActionContext::standalone("a")).await;
        assert!(matches!(
            first.outcome,
            AttemptOutcome::Retry { delay, .. } if delay == Duration::from_secs(120)
        ));

        let third = executor
            .execute(&task, ActionContext::standalone("a").with_attempt(3))
            .await;
        assert!(matches!(third.outcome, AttemptOutcome::Failed { .. }));
    }

    #[tokio::test]
    async fn test_no_retry_policy_fails_immediately() {
        let executor = TaskExecutor::default();
        let task = flaky("a", 1, RetryPolicy::none());
        let result = executor.execute(&task, ActionContext::standalone("a")).await;
        match result.outcome {
            AttemptOutcome::Failed { error } => assert_eq!(error.to_string(), "1 failures left"),
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_sensor_timeout_is_not_retried() {
        let executor = TaskExecutor::default();
        let task = Task::new("check_customer_file", Arc::new(TimesOut))
            .with_retry(RetryPolicy::fixed(3, Duration::from_secs(1)));
        let result = executor
            .execute(&task, ActionContext::standalone("check_customer_file"))
            .await;
        assert!(matches!(
            result.outcome,
            AttemptOutcome::Failed {
                error: ActionError::Timeout { polls: 4, .. }
            }
        ));
    }

    #[tokio::test]
    async fn test_panic_becomes_failure() {
        let executor = TaskExecutor::default();
        let task = Task::new("boom", Arc::new(Panics));
        let result = executor.execute(&task, ActionContext::standalone("boom")).await;
        assert_eq!(
            result.outcome,
            AttemptOutcome::Failed {
                error: ActionError::Failed("action panicked".into())
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_interrupts_action() {
        let executor = TaskExecutor::default();
        let task = Task::new("slow", Arc::new(Sleeps(Duration::from_secs(3600))));
        let token = CancellationToken::new();
        let ctx = ActionContext::standalone("slow").with_cancellation(token.clone());

        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            token.cancel();
        });

        let result = executor.execute(&task, ctx).await;
        canceller.await.unwrap();
        assert_eq!(result.outcome, AttemptOutcome::Cancelled);
        assert!(result.duration < Duration::from_secs(3600));
    }

    #[tokio::test]
    async fn test_cancelled_before_slot_is_free() {
        let executor = TaskExecutor::new(1);
        let token = CancellationToken::new();
        let held = executor.acquire(&token).await;
        assert!(held.is_some());
        assert_eq!(executor.available_permits(), 0);

        token.cancel();
        assert!(executor.acquire(&token).await.is_none());

        let task = flaky("a", 0, RetryPolicy::none());
        let ctx = ActionContext::standalone("a").with_cancellation(token);
        let result = executor.execute(&task, ctx).await;
        assert_eq!(result.outcome, AttemptOutcome::Cancelled);
    }

    #[tokio::test]
    async fn test_permit_released_after_attempt() {
        let executor = TaskExecutor::new(2);
        let task = flaky("a", 0, RetryPolicy::none());
        executor.execute(&task, ActionContext::standalone("a")).await;
        assert_eq!(executor.available_permits(), 2);
    }

    #[test]
    fn test_zero_concurrency_is_raised() {
        assert_eq!(TaskExecutor::new(0).max_concurrency(), 1);
    }
}
