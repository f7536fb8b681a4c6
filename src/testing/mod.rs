//! Testing utilities for users of the dagrun library.
//!
//! This module provides helpers for testing pipelines without touching
//! external systems:
//!
//! - [`ScriptedAction`]: an action that succeeds or fails on cue and records
//!   when it was called
//! - [`ScriptedCondition`]: a sensor condition that turns true after N polls
//! - [`RecordingHandler`]: an event handler that keeps every event
//! - [`TestHarness`]: runs graphs and asserts on the outcome
//! - [`with_actions`]: rebuilds a graph's topology around substitute actions

use async_trait::async_trait;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

use chrono::Utc;

use crate::core::dag::{DagError, Graph, GraphBuilder};
use crate::core::run::RunReport;
use crate::core::state::TaskState;
use crate::core::task::{Action, ActionContext, ActionError, Task};
use crate::core::types::{RunId, TaskId};
use crate::events::{Event, EventBus, EventHandler};
use crate::execution::RunScheduler;
use crate::execution::actions::Condition;

/// An action with a scripted outcome.
///
/// Safe to share between concurrent attempts; the call counter decides the
/// outcome of each call.
///
/// # Example
///
/// ```
/// use dagrun::testing::ScriptedAction;
///
/// // Fails twice, then succeeds on the 3rd attempt.
/// let action = ScriptedAction::failing_times(2, "connection refused");
/// assert_eq!(action.calls(), 0);
/// ```
pub struct ScriptedAction {
    /// Calls that fail before the first success; `None` fails forever.
    failures: Option<u32>,
    message: String,
    delay: Duration,
    calls: AtomicU32,
    call_times: Mutex<Vec<Instant>>,
}

impl ScriptedAction {
    fn scripted(failures: Option<u32>, message: impl Into<String>) -> Self {
        Self {
            failures,
            message: message.into(),
            delay: Duration::ZERO,
            calls: AtomicU32::new(0),
            call_times: Mutex::new(Vec::new()),
        }
    }

    pub fn succeeding() -> Self {
        Self::scripted(Some(0), "")
    }

    /// Fails every call with `message`.
    pub fn failing(message: impl Into<String>) -> Self {
        Self::scripted(None, message)
    }

    /// Fails the first `times` calls with `message`, then succeeds.
    pub fn failing_times(times: u32, message: impl Into<String>) -> Self {
        Self::scripted(Some(times), message)
    }

    /// Sleep for `delay` before reporting the outcome.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    /// When each call started, on the tokio clock.
    pub fn call_times(&self) -> Vec<Instant> {
        self.call_times
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl Action for ScriptedAction {
    async fn execute(&self, _ctx: &ActionContext) -> Result<(), ActionError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.call_times
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Instant::now());

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        match self.failures {
            Some(failures) if call > failures => Ok(()),
            _ => Err(ActionError::Failed(self.message.clone())),
        }
    }

    fn kind(&self) -> &'static str {
        "scripted"
    }
}

/// A sensor condition that holds from the N-th poll on, or never.
pub struct ScriptedCondition {
    holds_at: Option<u32>,
    polls: AtomicU32,
}

impl ScriptedCondition {
    pub fn never() -> Self {
        Self {
            holds_at: None,
            polls: AtomicU32::new(0),
        }
    }

    /// Holds on poll number `poll` (1-based) and every poll after it.
    pub fn after(poll: u32) -> Self {
        Self {
            holds_at: Some(poll),
            polls: AtomicU32::new(0),
        }
    }

    pub fn polls(&self) -> u32 {
        self.polls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Condition for ScriptedCondition {
    async fn check(&self, _ctx: &ActionContext) -> Result<bool, ActionError> {
        let poll = self.polls.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(self.holds_at.is_some_and(|at| poll >= at))
    }

    fn describe(&self) -> String {
        "scripted condition".to_string()
    }
}

/// Keeps every event it receives, in order.
#[derive(Default)]
pub struct RecordingHandler {
    events: tokio::sync::Mutex<Vec<Event>>,
}

impl RecordingHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn events(&self) -> Vec<Event> {
        self.events.lock().await.clone()
    }

    /// Every task transition as `(task, from, to)`.
    pub async fn transitions(&self) -> Vec<(TaskId, TaskState, TaskState)> {
        self.events
            .lock()
            .await
            .iter()
            .filter_map(|event| match event {
                Event::TaskStateChanged {
                    task_id, from, to, ..
                } => Some((task_id.clone(), *from, *to)),
                _ => None,
            })
            .collect()
    }

    /// States `task` passed through, starting with the first target state.
    pub async fn path_of(&self, task: &str) -> Vec<TaskState> {
        self.transitions()
            .await
            .into_iter()
            .filter(|(id, _, _)| id.as_str() == task)
            .map(|(_, _, to)| to)
            .collect()
    }

    /// Runs that completed, as reported by `RunCompleted`.
    pub async fn completed_runs(&self) -> Vec<RunId> {
        self.events
            .lock()
            .await
            .iter()
            .filter_map(|event| match event {
                Event::RunCompleted { run_id, .. } => Some(*run_id),
                _ => None,
            })
            .collect()
    }

    pub async fn clear(&self) {
        self.events.lock().await.clear();
    }
}

#[async_trait]
impl EventHandler for RecordingHandler {
    async fn handle(&self, event: &Event) {
        self.events.lock().await.push(event.clone());
    }
}

/// Rebuild `graph` with the same tasks, edges and retry policies, but with
/// each action replaced by `action_for(task)`.
pub fn with_actions<F>(graph: &Graph, mut action_for: F) -> Result<Graph, DagError>
where
    F: FnMut(&Task) -> Arc<dyn Action>,
{
    let tasks: Vec<Task> = graph
        .tasks()
        .iter()
        .map(|task| {
            Task::new(task.id().clone(), action_for(task)).with_retry(task.retry_policy().clone())
        })
        .collect();
    GraphBuilder::new(graph.id().clone(), graph.name())
        .tasks(tasks)
        .edges(graph.edges())
        .build()
}

/// Runs graphs with a recording event bus.
///
/// # Example
///
/// ```
/// use dagrun::testing::{ScriptedAction, TestHarness};
/// use dagrun::{GraphBuilder, Task};
/// use std::sync::Arc;
///
/// # tokio_test_block_on(async {
/// let graph = GraphBuilder::new("demo", "Demo")
///     .task(Task::new("a", Arc::new(ScriptedAction::succeeding())))
///     .build()
///     .unwrap();
/// let harness = TestHarness::new().await;
/// let report = harness.execute_and_assert_success(graph).await;
/// assert_eq!(report.attempts("a"), 1);
/// # });
/// # fn tokio_test_block_on<F: std::future::Future>(f: F) -> F::Output {
/// #     tokio::runtime::Runtime::new().unwrap().block_on(f)
/// # }
/// ```
pub struct TestHarness {
    scheduler: RunScheduler,
    recorder: Arc<RecordingHandler>,
}

impl TestHarness {
    pub async fn new() -> Self {
        Self::with_concurrency(crate::execution::DEFAULT_CONCURRENCY).await
    }

    pub async fn with_concurrency(max_concurrency: usize) -> Self {
        let recorder = Arc::new(RecordingHandler::new());
        let bus = Arc::new(EventBus::new());
        bus.register(recorder.clone()).await;
        Self {
            scheduler: RunScheduler::with_concurrency(max_concurrency).with_event_bus(bus),
            recorder,
        }
    }

    pub fn scheduler(&self) -> &RunScheduler {
        &self.scheduler
    }

    pub fn recorder(&self) -> &Arc<RecordingHandler> {
        &self.recorder
    }

    pub async fn execute(&self, graph: Graph) -> RunReport {
        self.scheduler.execute(Arc::new(graph), Utc::now()).await
    }

    /// Execute and assert success.
    pub async fn execute_and_assert_success(&self, graph: Graph) -> RunReport {
        let report = self.execute(graph).await;
        assert!(
            report.succeeded(),
            "expected run to succeed, got {}; failures: {:?}",
            report.status,
            report.failures
        );
        report
    }

    /// Execute and assert the run did not succeed.
    pub async fn execute_and_assert_failure(&self, graph: Graph) -> RunReport {
        let report = self.execute(graph).await;
        assert!(!report.succeeded(), "expected run to fail, but it succeeded");
        report
    }
}
