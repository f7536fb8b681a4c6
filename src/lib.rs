//! dagrun - a small DAG execution engine.
//!
//! Graphs of tasks are declared with [`GraphBuilder`] (or loaded from YAML
//! with [`load_pipeline`]), executed once with [`RunScheduler`], or run on a
//! schedule by [`Scheduler`].

pub mod config;
pub mod core;
pub mod events;
pub mod execution;
pub mod scheduler;
pub mod testing;

pub use config::{ConfigError, PipelineConfig, load_pipeline, load_pipelines_from_directory};
pub use core::dag::{DagError, Graph, GraphBuilder};
pub use core::pipeline::Pipeline;
pub use core::retry::RetryPolicy;
pub use core::run::{Run, RunReport, RunStatus, TaskFailure};
pub use core::schedule::{Schedule, ScheduleError};
pub use core::state::{StateError, TaskState, TaskStateMap, Transition};
pub use core::task::{Action, ActionContext, ActionError, Task};
pub use core::types::{DagId, RunId, TaskId};
pub use events::{Event, EventBus, EventHandler, LoggingHandler};
pub use execution::actions::{
    CommandAction, Condition, DdlAction, EmailAction, FileExists, SensorAction, SlackAction,
    SparkSubmitAction,
};
pub use execution::{AttemptOutcome, RunScheduler, TaskExecutor};
pub use scheduler::{Scheduler, SchedulerError, SchedulerHandle, SchedulerState};
