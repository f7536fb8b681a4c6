//! Task and run execution.
//!
//! This module provides the executor for single task attempts, the run
//! scheduler that drives a whole graph, and the built-in actions.

pub mod actions;
mod executor;
mod run_scheduler;

pub use executor::{AttemptOutcome, AttemptResult, DEFAULT_CONCURRENCY, TaskExecutor};
pub use run_scheduler::RunScheduler;
