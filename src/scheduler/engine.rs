//! Scheduler engine implementation.
//!
//! The scheduler is responsible for:
//! - Starting a run for every due schedule tick, with the tick as logical date
//! - Honouring `start_date`, `catchup` and `max_active_runs` per pipeline
//! - Manual triggers and cancellation of active runs
//! - Pause and resume
//! - Graceful shutdown with a timeout

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{RwLock, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::core::pipeline::Pipeline;
use crate::core::run::{Run, RunReport};
use crate::core::types::{DagId, RunId};
use crate::events::EventBus;
use crate::execution::RunScheduler;

use super::handle::{COMMAND_CHANNEL_BUFFER, SchedulerHandle};
use super::types::{ActiveRun, SchedulerCommand, SchedulerError, SchedulerState};

/// Most runs a catchup pipeline starts in one tick.
pub const DEFAULT_CATCHUP_LIMIT: usize = 32;

struct RunningRun {
    info: ActiveRun,
    cancel: CancellationToken,
    handle: JoinHandle<RunReport>,
}

/// Periodic scheduler for pipelines.
pub struct Scheduler {
    pipelines: HashMap<DagId, Pipeline>,
    event_bus: Arc<EventBus>,
    tick_interval: Duration,
    shutdown_timeout: Duration,
    catchup_limit: usize,
    /// One run scheduler per pipeline, sized by its `max_active_tasks`.
    runners: HashMap<DagId, Arc<RunScheduler>>,
    /// Schedule ticks at or before the cursor have been handled.
    cursors: HashMap<DagId, DateTime<Utc>>,
    active: HashMap<RunId, RunningRun>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            pipelines: HashMap::new(),
            event_bus: Arc::new(EventBus::new()),
            tick_interval: Duration::from_secs(1),
            shutdown_timeout: Duration::from_secs(30),
            catchup_limit: DEFAULT_CATCHUP_LIMIT,
            runners: HashMap::new(),
            cursors: HashMap::new(),
            active: HashMap::new(),
        }
    }

    pub fn with_event_bus(mut self, event_bus: Arc<EventBus>) -> Self {
        self.event_bus = event_bus;
        self
    }

    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    /// How long shutdown waits for active runs before cancelling them.
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn with_catchup_limit(mut self, limit: usize) -> Self {
        self.catchup_limit = limit.max(1);
        self
    }

    /// Register a pipeline, replacing any with the same id.
    pub fn register(&mut self, pipeline: Pipeline) {
        self.pipelines.insert(pipeline.id().clone(), pipeline);
    }

    pub fn pipeline(&self, id: &DagId) -> Option<&Pipeline> {
        self.pipelines.get(id)
    }

    pub fn pipelines(&self) -> impl Iterator<Item = &Pipeline> {
        self.pipelines.values()
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.event_bus
    }

    /// Start the scheduler and return a handle for controlling it.
    pub fn start(mut self) -> (SchedulerHandle, JoinHandle<()>) {
        let now = Utc::now();
        for pipeline in self.pipelines.values() {
            let runner = RunScheduler::with_concurrency(pipeline.max_active_tasks())
                .with_event_bus(Arc::clone(&self.event_bus));
            self.runners
                .insert(pipeline.id().clone(), Arc::new(runner));

            // Catchup pipelines replay from their start date; others begin
            // with the latest tick already past.
            let cursor = match pipeline.start_date() {
                Some(start) => start - chrono::Duration::seconds(1),
                None => now,
            };
            self.cursors.insert(pipeline.id().clone(), cursor);
        }

        let (command_tx, command_rx) = mpsc::channel(COMMAND_CHANNEL_BUFFER);
        let state = Arc::new(RwLock::new(SchedulerState::Running));

        let handle = SchedulerHandle {
            command_tx,
            state: Arc::clone(&state),
        };

        let scheduler_task = tokio::spawn(async move {
            self.run(command_rx, state).await;
        });

        (handle, scheduler_task)
    }

    /// Main scheduler loop.
    async fn run(
        mut self,
        mut command_rx: mpsc::Receiver<SchedulerCommand>,
        state: Arc<RwLock<SchedulerState>>,
    ) {
        info!(
            pipelines = self.pipelines.len(),
            tick_interval = ?self.tick_interval,
            "scheduler started"
        );
        let mut interval = tokio::time::interval(self.tick_interval);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.cleanup_finished_runs().await;
                    if *state.read().await == SchedulerState::Running {
                        self.check_schedules(Utc::now());
                    }
                }

                command = command_rx.recv() => {
                    let Some(command) = command else {
                        // Every handle dropped.
                        *state.write().await = SchedulerState::Stopped;
                        self.await_active_runs().await;
                        break;
                    };
                    match command {
                        SchedulerCommand::Trigger { dag_id, logical_date, response } => {
                            let result = self.start_run(&dag_id, logical_date.unwrap_or_else(Utc::now));
                            let _ = response.send(result);
                        }
                        SchedulerCommand::Cancel { run_id, response } => {
                            let _ = response.send(self.cancel_run(run_id));
                        }
                        SchedulerCommand::ActiveRuns { response } => {
                            self.cleanup_finished_runs().await;
                            let _ = response.send(self.active_runs());
                        }
                        SchedulerCommand::Pause { response } => {
                            *state.write().await = SchedulerState::Paused;
                            info!("scheduler paused");
                            let _ = response.send(());
                        }
                        SchedulerCommand::Resume { response } => {
                            *state.write().await = SchedulerState::Running;
                            self.skip_paused_ticks(Utc::now());
                            info!("scheduler resumed");
                            let _ = response.send(());
                        }
                        SchedulerCommand::Shutdown { response } => {
                            *state.write().await = SchedulerState::Stopped;
                            self.await_active_runs().await;
                            let _ = response.send(());
                            break;
                        }
                    }
                }
            }
        }
        info!("scheduler stopped");
    }

    /// Start runs for every enabled pipeline with ticks in `(cursor, now]`.
    fn check_schedules(&mut self, now: DateTime<Utc>) {
        let due: Vec<(DagId, bool, Vec<DateTime<Utc>>)> = self
            .pipelines
            .values()
            .filter(|p| p.is_enabled() && p.is_scheduled())
            .map(|p| {
                let after = self.cursors.get(p.id()).copied().unwrap_or(now);
                (
                    p.id().clone(),
                    p.catchup(),
                    p.due_runs(after, now, self.catchup_limit),
                )
            })
            .collect();

        for (dag_id, catchup, ticks) in due {
            if ticks.is_empty() {
                self.cursors.insert(dag_id, now);
                continue;
            }

            // A full catchup batch resumes from its last tick next time.
            let mut cursor = match ticks.last() {
                Some(last) if catchup && ticks.len() >= self.catchup_limit => *last,
                _ => now,
            };

            for logical_date in ticks {
                match self.start_run(&dag_id, logical_date) {
                    Ok(run_id) => {
                        info!(dag = %dag_id, run = %run_id, %logical_date, "scheduled run started");
                    }
                    Err(SchedulerError::MaxActiveRunsExceeded(_)) if catchup => {
                        debug!(dag = %dag_id, %logical_date, "max active runs reached, deferring tick");
                        cursor = logical_date - chrono::Duration::seconds(1);
                        break;
                    }
                    Err(e) => {
                        warn!(dag = %dag_id, %logical_date, error = %e, "skipping scheduled run");
                    }
                }
            }
            self.cursors.insert(dag_id, cursor);
        }
    }

    /// Move the cursors of pipelines without catchup past ticks missed while
    /// paused.
    fn skip_paused_ticks(&mut self, now: DateTime<Utc>) {
        for pipeline in self.pipelines.values() {
            if !pipeline.catchup() {
                self.cursors.insert(pipeline.id().clone(), now);
            }
        }
    }

    fn start_run(
        &mut self,
        dag_id: &DagId,
        logical_date: DateTime<Utc>,
    ) -> Result<RunId, SchedulerError> {
        let pipeline = self
            .pipelines
            .get(dag_id)
            .ok_or_else(|| SchedulerError::PipelineNotFound(dag_id.to_string()))?;
        if !pipeline.is_enabled() {
            return Err(SchedulerError::PipelineDisabled(dag_id.to_string()));
        }

        if let Some(max) = pipeline.max_active_runs() {
            let running = self
                .active
                .values()
                .filter(|r| &r.info.dag_id == dag_id && !r.handle.is_finished())
                .count();
            if running >= max {
                return Err(SchedulerError::MaxActiveRunsExceeded(dag_id.to_string()));
            }
        }

        let runner = match self.runners.get(dag_id) {
            Some(runner) => Arc::clone(runner),
            None => {
                let runner = Arc::new(
                    RunScheduler::with_concurrency(pipeline.max_active_tasks())
                        .with_event_bus(Arc::clone(&self.event_bus)),
                );
                self.runners.insert(dag_id.clone(), Arc::clone(&runner));
                runner
            }
        };

        let run = Arc::new(Run::new(Arc::clone(pipeline.graph()), logical_date));
        let run_id = run.id();
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let handle = tokio::spawn(async move { runner.execute_run(run, token).await });

        self.active.insert(
            run_id,
            RunningRun {
                info: ActiveRun {
                    run_id,
                    dag_id: dag_id.clone(),
                    logical_date,
                },
                cancel,
                handle,
            },
        );
        Ok(run_id)
    }

    fn cancel_run(&mut self, run_id: RunId) -> Result<(), SchedulerError> {
        match self.active.get(&run_id) {
            Some(run) if !run.handle.is_finished() => {
                info!(dag = %run.info.dag_id, run = %run_id, "cancelling run");
                run.cancel.cancel();
                Ok(())
            }
            _ => Err(SchedulerError::RunNotFound(run_id)),
        }
    }

    fn active_runs(&self) -> Vec<ActiveRun> {
        let mut runs: Vec<ActiveRun> = self
            .active
            .values()
            .filter(|r| !r.handle.is_finished())
            .map(|r| r.info.clone())
            .collect();
        runs.sort_by_key(|r| r.logical_date);
        runs
    }

    /// Reap runs whose tasks have all finished.
    async fn cleanup_finished_runs(&mut self) {
        let finished: Vec<RunId> = self
            .active
            .iter()
            .filter(|(_, run)| run.handle.is_finished())
            .map(|(id, _)| *id)
            .collect();

        for run_id in finished {
            if let Some(run) = self.active.remove(&run_id) {
                match run.handle.await {
                    Ok(report) => {
                        debug!(dag = %run.info.dag_id, run = %run_id, status = %report.status, "run reaped");
                    }
                    Err(e) => error!(run = %run_id, error = %e, "run task panicked"),
                }
            }
        }
    }

    /// Wait for active runs up to the shutdown timeout, then cancel the rest.
    async fn await_active_runs(&mut self) {
        if self.active.is_empty() {
            return;
        }
        info!(
            count = self.active.len(),
            timeout = ?self.shutdown_timeout,
            "waiting for active runs to finish"
        );

        let deadline = tokio::time::Instant::now() + self.shutdown_timeout;
        for (run_id, mut run) in self.active.drain() {
            let report = match tokio::time::timeout_at(deadline, &mut run.handle).await {
                Ok(joined) => joined,
                Err(_) => {
                    warn!(dag = %run.info.dag_id, run = %run_id, "shutdown timeout reached, cancelling run");
                    run.cancel.cancel();
                    run.handle.await
                }
            };
            match report {
                Ok(report) => {
                    info!(dag = %run.info.dag_id, run = %run_id, status = %report.status, "run finished during shutdown");
                }
                Err(e) => error!(run = %run_id, error = %e, "run task panicked"),
            }
        }
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}
