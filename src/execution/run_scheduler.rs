//! Run execution.
//!
//! The `RunScheduler` drives one run of a graph to completion. A task is
//! dispatched as soon as every upstream has succeeded, so independent
//! branches proceed concurrently up to the executor's limit. When a task
//! fails for good its descendants are marked `upstream_failed` and never
//! execute; sibling branches carry on.
//!
//! All state changes go through compare-and-set on the run's state map and
//! each applied transition is published on the event bus.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::core::dag::Graph;
use crate::core::run::{Run, RunReport, TaskFailure, status_from_states};
use crate::core::state::{StateError, TaskState, Transition};
use crate::core::task::{ActionContext, ActionError};
use crate::core::types::TaskId;
use crate::events::{Event, EventBus};

use super::executor::{AttemptOutcome, AttemptResult, TaskExecutor};

/// What an in-flight future reports back to the run loop.
enum Completion {
    /// An attempt ran to an outcome.
    Attempt(AttemptResult),
    /// The task never started because the run was cancelled first.
    NotStarted(TaskId),
    /// A retry delay elapsed.
    RetryReady(TaskId),
}

/// Executes runs of a graph.
pub struct RunScheduler {
    executor: Arc<TaskExecutor>,
    event_bus: Arc<EventBus>,
}

impl RunScheduler {
    pub fn new(executor: TaskExecutor) -> Self {
        Self {
            executor: Arc::new(executor),
            event_bus: Arc::new(EventBus::new()),
        }
    }

    /// At most `max_concurrency` actions of a run execute at once.
    pub fn with_concurrency(max_concurrency: usize) -> Self {
        Self::new(TaskExecutor::new(max_concurrency))
    }

    /// Publish events on a shared bus instead of a private one.
    pub fn with_event_bus(mut self, event_bus: Arc<EventBus>) -> Self {
        self.event_bus = event_bus;
        self
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.event_bus
    }

    pub fn executor(&self) -> &TaskExecutor {
        &self.executor
    }

    /// Create a run of `graph` for `logical_date` and drive it to completion.
    pub async fn execute(&self, graph: Arc<Graph>, logical_date: DateTime<Utc>) -> RunReport {
        let run = Arc::new(Run::new(graph, logical_date));
        self.execute_run(run, CancellationToken::new()).await
    }

    /// Drive an existing run to completion.
    ///
    /// When `cancel` fires, in-flight actions are aborted and every task not
    /// yet terminal ends `cancelled`.
    pub async fn execute_run(&self, run: Arc<Run>, cancel: CancellationToken) -> RunReport {
        let span = info_span!(
            "dag_run",
            dag = %run.dag_id(),
            run = %run.id(),
            logical_date = %run.logical_date(),
        );
        self.drive(run, cancel).instrument(span).await
    }

    async fn drive(&self, run: Arc<Run>, cancel: CancellationToken) -> RunReport {
        let graph = Arc::clone(run.graph());
        let start_time = Instant::now();

        info!(task_count = graph.len(), "starting run");
        self.event_bus
            .emit(Event::run_started(
                run.id(),
                run.dag_id().clone(),
                run.logical_date(),
            ))
            .await;

        let mut attempts: HashMap<TaskId, u32> = HashMap::new();
        let mut reasons: HashMap<TaskId, String> = HashMap::new();
        let mut in_flight: JoinSet<Completion> = JoinSet::new();
        let mut cancelled = false;

        loop {
            if cancel.is_cancelled() {
                cancelled = true;
                break;
            }

            self.propagate_failures(&run, &mut reasons).await;
            self.dispatch_ready(&run, &cancel, &attempts, &mut in_flight)
                .await;

            if in_flight.is_empty() {
                if !run.states().all_terminal().await {
                    error!("run stalled with no task in flight");
                }
                break;
            }

            tokio::select! {
                _ = cancel.cancelled() => {
                    cancelled = true;
                    break;
                }
                joined = in_flight.join_next() => match joined {
                    Some(Ok(completion)) => {
                        self.complete(&run, &cancel, completion, &mut attempts, &mut reasons, &mut in_flight)
                            .await;
                    }
                    Some(Err(e)) => error!(error = %e, "in-flight task aborted unexpectedly"),
                    None => {}
                },
            }
        }

        if cancelled {
            info!("run cancelled");
            in_flight.shutdown().await;
            self.cancel_remaining(&run).await;
        }

        let report = self.report(&run, cancelled, attempts, reasons, start_time).await;
        self.event_bus.emit(Event::run_completed(report.clone())).await;
        report
    }

    /// Mark pending tasks behind a failed upstream as `upstream_failed`.
    ///
    /// Walks in topological order so the mark reaches every descendant in
    /// one pass.
    async fn propagate_failures(&self, run: &Run, reasons: &mut HashMap<TaskId, String>) {
        let graph = run.graph();
        let mut states = run.states().snapshot().await;

        for task_id in graph.topological_order() {
            if states.get(task_id) != Some(&TaskState::Pending) {
                continue;
            }
            let blocker = graph.upstream(task_id).find(|up| {
                states
                    .get(*up)
                    .is_some_and(|state| state.blocks_downstream())
            });
            let Some(blocker) = blocker.cloned() else {
                continue;
            };

            if transition(
                run,
                &self.event_bus,
                task_id,
                TaskState::Pending,
                TaskState::UpstreamFailed,
            )
            .await
            .is_ok()
            {
                reasons.insert(task_id.clone(), format!("upstream task '{blocker}' failed"));
                states.insert(task_id.clone(), TaskState::UpstreamFailed);
            }
        }
    }

    /// Queue every pending task whose upstreams have all succeeded.
    async fn dispatch_ready(
        &self,
        run: &Arc<Run>,
        cancel: &CancellationToken,
        attempts: &HashMap<TaskId, u32>,
        in_flight: &mut JoinSet<Completion>,
    ) {
        let graph = run.graph();
        let states = run.states().snapshot().await;

        for task in graph.tasks() {
            let task_id = task.id();
            if states.get(task_id) != Some(&TaskState::Pending) {
                continue;
            }
            let ready = graph
                .upstream(task_id)
                .all(|up| states.get(up) == Some(&TaskState::Succeeded));
            if !ready {
                continue;
            }

            if transition(
                run,
                &self.event_bus,
                task_id,
                TaskState::Pending,
                TaskState::Queued,
            )
            .await
            .is_err()
            {
                continue;
            }

            let attempt = attempts.get(task_id).copied().unwrap_or(0) + 1;
            let ctx = ActionContext::new(
                run.dag_id().clone(),
                run.id(),
                task_id.clone(),
                run.logical_date(),
            )
            .with_attempt(attempt)
            .with_cancellation(cancel.clone());

            let task = task.clone();
            let run = Arc::clone(run);
            let executor = Arc::clone(&self.executor);
            let event_bus = Arc::clone(&self.event_bus);
            let cancel = cancel.clone();

            let task_span = info_span!("dag_task_dispatch", task = %task_id, attempt);

            in_flight.spawn(
                async move {
                    let task_id = task.id().clone();
                    let Some(_permit) = executor.acquire(&cancel).await else {
                        return Completion::NotStarted(task_id);
                    };
                    if transition(
                        &run,
                        &event_bus,
                        &task_id,
                        TaskState::Queued,
                        TaskState::Running,
                    )
                    .await
                    .is_err()
                    {
                        return Completion::NotStarted(task_id);
                    }
                    Completion::Attempt(executor.attempt(&task, ctx).await)
                }
                .instrument(task_span),
            );
        }
    }

    async fn complete(
        &self,
        run: &Run,
        cancel: &CancellationToken,
        completion: Completion,
        attempts: &mut HashMap<TaskId, u32>,
        reasons: &mut HashMap<TaskId, String>,
        in_flight: &mut JoinSet<Completion>,
    ) {
        let bus = &self.event_bus;
        match completion {
            Completion::NotStarted(task_id) => {
                debug!(task = %task_id, "task not started");
            }
            Completion::RetryReady(task_id) => {
                let _ = transition(run, bus, &task_id, TaskState::Retrying, TaskState::Pending).await;
            }
            Completion::Attempt(result) => {
                let task_id = result.task_id;
                attempts.insert(task_id.clone(), result.attempt);

                match result.outcome {
                    AttemptOutcome::Succeeded => {
                        let _ = transition(run, bus, &task_id, TaskState::Running, TaskState::Succeeded)
                            .await;
                    }
                    AttemptOutcome::Retry { error, delay } => {
                        warn!(
                            task = %task_id,
                            attempt = result.attempt,
                            error = %error,
                            delay_secs = delay.as_secs_f64(),
                            "attempt failed, retrying after delay"
                        );
                        if transition(run, bus, &task_id, TaskState::Running, TaskState::Retrying)
                            .await
                            .is_ok()
                        {
                            let cancel = cancel.clone();
                            in_flight.spawn(async move {
                                tokio::select! {
                                    _ = tokio::time::sleep(delay) => {}
                                    _ = cancel.cancelled() => {}
                                }
                                Completion::RetryReady(task_id)
                            });
                        }
                    }
                    AttemptOutcome::Failed { error } => {
                        self.fail(run, &task_id, error, result.attempt, reasons).await;
                    }
                    AttemptOutcome::Cancelled => {
                        // The action gave up on its own while the run goes on.
                        if !cancel.is_cancelled() {
                            self.fail(run, &task_id, ActionError::Cancelled, result.attempt, reasons)
                                .await;
                        }
                    }
                }
            }
        }
    }

    async fn fail(
        &self,
        run: &Run,
        task_id: &TaskId,
        error: ActionError,
        attempt: u32,
        reasons: &mut HashMap<TaskId, String>,
    ) {
        warn!(task = %task_id, attempt, error = %error, "task failed");
        if transition(run, &self.event_bus, task_id, TaskState::Running, TaskState::Failed)
            .await
            .is_ok()
        {
            reasons.insert(task_id.clone(), error.to_string());
        }
    }

    /// Move every non-terminal task to `cancelled`.
    async fn cancel_remaining(&self, run: &Run) {
        let states = run.states().snapshot().await;
        for task in run.graph().tasks() {
            let Some(state) = states.get(task.id()).copied() else {
                continue;
            };
            if state.is_terminal() {
                continue;
            }
            let _ = transition(run, &self.event_bus, task.id(), state, TaskState::Cancelled).await;
        }
    }

    async fn report(
        &self,
        run: &Run,
        cancelled: bool,
        attempts: HashMap<TaskId, u32>,
        mut reasons: HashMap<TaskId, String>,
        start_time: Instant,
    ) -> RunReport {
        let snapshot = run.states().snapshot().await;
        let states: Vec<(TaskId, TaskState)> = run
            .graph()
            .tasks()
            .iter()
            .map(|task| {
                let state = snapshot
                    .get(task.id())
                    .copied()
                    .unwrap_or(TaskState::Pending);
                (task.id().clone(), state)
            })
            .collect();

        let status = status_from_states(states.iter().map(|(_, state)| state), cancelled);

        let failures = states
            .iter()
            .filter(|(_, state)| matches!(state, TaskState::Failed | TaskState::UpstreamFailed))
            .map(|(task_id, state)| TaskFailure {
                task_id: task_id.clone(),
                state: *state,
                reason: reasons
                    .remove(task_id)
                    .unwrap_or_else(|| "unknown error".to_string()),
            })
            .collect();

        let duration = start_time.elapsed();
        debug!(
            status = %status,
            duration_ms = %duration.as_millis(),
            attempted = attempts.len(),
            "run finished"
        );

        RunReport {
            run_id: run.id(),
            dag_id: run.dag_id().clone(),
            logical_date: run.logical_date(),
            status,
            states,
            attempts,
            failures,
            duration,
        }
    }
}

impl Default for RunScheduler {
    fn default() -> Self {
        Self::new(TaskExecutor::default())
    }
}

/// Apply a transition and publish it. A rejected transition is logged and
/// nothing is published.
async fn transition(
    run: &Run,
    bus: &EventBus,
    task_id: &TaskId,
    from: TaskState,
    to: TaskState,
) -> Result<Transition, StateError> {
    match run.states().compare_and_set(task_id, from, to).await {
        Ok(applied) => {
            bus.emit(Event::task_state_changed(
                run.id(),
                run.dag_id().clone(),
                applied.clone(),
            ))
            .await;
            Ok(applied)
        }
        Err(e) => {
            debug!(error = %e, "transition rejected");
            Err(e)
        }
    }
}
