//! Periodic scheduling of pipelines.
//!
//! The [`Scheduler`] owns a set of pipelines and starts a run for every due
//! schedule tick. Once started it is controlled through a cloneable
//! [`SchedulerHandle`].

mod engine;
mod handle;
mod types;

pub use engine::{DEFAULT_CATCHUP_LIMIT, Scheduler};
pub use handle::SchedulerHandle;
pub use types::{ActiveRun, SchedulerError, SchedulerState};
