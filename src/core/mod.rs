//! Core data model: identifiers, tasks, graphs, runs and schedules.

pub mod dag;
pub mod pipeline;
pub mod retry;
pub mod run;
pub mod schedule;
pub mod state;
pub mod task;
pub mod types;
