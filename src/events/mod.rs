//! Observability events.
//!
//! Every task state transition is published on an [`EventBus`], along with
//! run start and completion. Handlers are called in registration order.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{error, info, warn};

use crate::core::run::{RunReport, RunStatus};
use crate::core::state::{TaskState, Transition};
use crate::core::types::{DagId, RunId, TaskId};

/// Something that happened during a run.
#[derive(Debug, Clone)]
pub enum Event {
    /// A task moved from one state to another.
    TaskStateChanged {
        run_id: RunId,
        dag_id: DagId,
        task_id: TaskId,
        from: TaskState,
        to: TaskState,
        timestamp: DateTime<Utc>,
    },

    /// A run was created and is about to dispatch its first tasks.
    RunStarted {
        run_id: RunId,
        dag_id: DagId,
        logical_date: DateTime<Utc>,
        timestamp: DateTime<Utc>,
    },

    /// A run reached a terminal status.
    RunCompleted {
        run_id: RunId,
        dag_id: DagId,
        status: RunStatus,
        duration: Duration,
        report: Arc<RunReport>,
        timestamp: DateTime<Utc>,
    },
}

impl Event {
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Event::TaskStateChanged { timestamp, .. }
            | Event::RunStarted { timestamp, .. }
            | Event::RunCompleted { timestamp, .. } => *timestamp,
        }
    }

    pub fn run_id(&self) -> RunId {
        match self {
            Event::TaskStateChanged { run_id, .. }
            | Event::RunStarted { run_id, .. }
            | Event::RunCompleted { run_id, .. } => *run_id,
        }
    }

    pub fn task_state_changed(run_id: RunId, dag_id: DagId, transition: Transition) -> Self {
        Event::TaskStateChanged {
            run_id,
            dag_id,
            task_id: transition.task_id,
            from: transition.from,
            to: transition.to,
            timestamp: Utc::now(),
        }
    }

    pub fn run_started(run_id: RunId, dag_id: DagId, logical_date: DateTime<Utc>) -> Self {
        Event::RunStarted {
            run_id,
            dag_id,
            logical_date,
            timestamp: Utc::now(),
        }
    }

    pub fn run_completed(report: RunReport) -> Self {
        Event::RunCompleted {
            run_id: report.run_id,
            dag_id: report.dag_id.clone(),
            status: report.status,
            duration: report.duration,
            report: Arc::new(report),
            timestamp: Utc::now(),
        }
    }
}

/// Receives events from an [`EventBus`].
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &Event);
}

/// Fan-out of events to registered handlers.
pub struct EventBus {
    handlers: RwLock<Vec<Arc<dyn EventHandler>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(Vec::new()),
        }
    }

    pub async fn register(&self, handler: Arc<dyn EventHandler>) {
        self.handlers.write().await.push(handler);
    }

    pub async fn emit(&self, event: Event) {
        let handlers = self.handlers.read().await;
        for handler in handlers.iter() {
            handler.handle(&event).await;
        }
    }

    pub async fn handler_count(&self) -> usize {
        self.handlers.read().await.len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Writes events to the `tracing` subscriber.
pub struct LoggingHandler;

#[async_trait]
impl EventHandler for LoggingHandler {
    async fn handle(&self, event: &Event) {
        match event {
            Event::RunStarted {
                run_id,
                dag_id,
                logical_date,
                ..
            } => {
                info!(dag = %dag_id, run = %run_id, logical_date = %logical_date, "run started");
            }
            Event::TaskStateChanged {
                run_id,
                task_id,
                from,
                to,
                ..
            } => match to {
                TaskState::Failed => {
                    warn!(run = %run_id, task = %task_id, from = %from, "task failed")
                }
                TaskState::UpstreamFailed | TaskState::Retrying => {
                    warn!(run = %run_id, task = %task_id, from = %from, to = %to, "task state changed")
                }
                _ => info!(run = %run_id, task = %task_id, from = %from, to = %to, "task state changed"),
            },
            Event::RunCompleted {
                run_id,
                dag_id,
                status,
                duration,
                report,
                ..
            } => {
                if *status == RunStatus::Succeeded {
                    info!(dag = %dag_id, run = %run_id, duration_ms = duration.as_millis() as u64, "run succeeded");
                } else {
                    error!(dag = %dag_id, run = %run_id, status = %status, duration_ms = duration.as_millis() as u64, "run did not succeed");
                    for failure in &report.failures {
                        error!(task = %failure.task_id, state = %failure.state, reason = %failure.reason, "  task did not succeed");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::sync::Mutex;

    struct RecordingHandler {
        events: Mutex<Vec<Event>>,
    }

    #[async_trait]
    impl EventHandler for RecordingHandler {
        async fn handle(&self, event: &Event) {
            self.events.lock().await.push(event.clone());
        }
    }

    struct CountingHandler {
        count: AtomicU32,
    }

    #[async_trait]
    impl EventHandler for CountingHandler {
        async fn handle(&self, _event: &Event) {
            self.count.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn transition(task: &str, from: TaskState, to: TaskState) -> Transition {
        Transition {
            task_id: TaskId::new(task),
            from,
            to,
        }
    }

    #[tokio::test]
    async fn test_state_change_carries_both_states() {
        let recorder = Arc::new(RecordingHandler {
            events: Mutex::new(Vec::new()),
        });
        let bus = EventBus::new();
        bus.register(recorder.clone()).await;

        let run_id = RunId::new();
        bus.emit(Event::task_state_changed(
            run_id,
            DagId::new("adventure_works"),
            transition("check_product_file", TaskState::Running, TaskState::Failed),
        ))
        .await;

        let events = recorder.events.lock().await;
        assert_eq!(events.len(), 1);
        match &events[0] {
            Event::TaskStateChanged {
                run_id: r,
                task_id,
                from,
                to,
                ..
            } => {
                assert_eq!(*r, run_id);
                assert_eq!(task_id.as_str(), "check_product_file");
                assert_eq!(*from, TaskState::Running);
                assert_eq!(*to, TaskState::Failed);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_every_handler_receives_every_event() {
        let first = Arc::new(CountingHandler {
            count: AtomicU32::new(0),
        });
        let second = Arc::new(CountingHandler {
            count: AtomicU32::new(0),
        });
        let bus = EventBus::new();
        bus.register(first.clone()).await;
        bus.register(second.clone()).await;
        assert_eq!(bus.handler_count().await, 2);

        for _ in 0..3 {
            bus.emit(Event::run_started(
                RunId::new(),
                DagId::new("dag"),
                Utc::now(),
            ))
            .await;
        }

        assert_eq!(first.count.load(Ordering::SeqCst), 3);
        assert_eq!(second.count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_run_completed_copies_report_fields() {
        let report = RunReport {
            run_id: RunId::new(),
            dag_id: DagId::new("dag"),
            logical_date: Utc::now(),
            status: RunStatus::Failed,
            states: Vec::new(),
            attempts: HashMap::new(),
            failures: Vec::new(),
            duration: Duration::from_millis(40),
        };
        let run_id = report.run_id;

        let event = Event::run_completed(report);
        assert_eq!(event.run_id(), run_id);
        match event {
            Event::RunCompleted {
                status, duration, ..
            } => {
                assert_eq!(status, RunStatus::Failed);
                assert_eq!(duration, Duration::from_millis(40));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_logging_handler_accepts_all_events() {
        let bus = EventBus::new();
        bus.register(Arc::new(LoggingHandler)).await;
        bus.emit(Event::task_state_changed(
            RunId::new(),
            DagId::new("dag"),
            transition("a", TaskState::Pending, TaskState::UpstreamFailed),
        ))
        .await;
    }
}
