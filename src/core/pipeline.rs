//! A named, schedulable graph.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use super::dag::Graph;
use super::schedule::Schedule;
use super::types::DagId;

/// A graph plus the metadata needed to schedule it.
#[derive(Clone)]
pub struct Pipeline {
    graph: Arc<Graph>,
    owner: Option<String>,
    description: Option<String>,
    schedule: Option<Schedule>,
    start_date: Option<DateTime<Utc>>,
    catchup: bool,
    max_active_tasks: usize,
    max_active_runs: Option<usize>,
    enabled: bool,
}

/// Default number of tasks of one run allowed to execute at once.
pub const DEFAULT_MAX_ACTIVE_TASKS: usize = 16;

impl Pipeline {
    pub fn new(graph: Graph) -> Self {
        Self {
            graph: Arc::new(graph),
            owner: None,
            description: None,
            schedule: None,
            start_date: None,
            catchup: false,
            max_active_tasks: DEFAULT_MAX_ACTIVE_TASKS,
            max_active_runs: None,
            enabled: true,
        }
    }

    /// Interval schedules are anchored at the start date, if one is set.
    pub fn with_schedule(mut self, schedule: Schedule) -> Self {
        self.schedule = Some(match self.start_date {
            Some(start) => schedule.with_anchor(start),
            None => schedule,
        });
        self
    }

    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// No tick earlier than `start_date` produces a run.
    pub fn with_start_date(mut self, start_date: DateTime<Utc>) -> Self {
        self.start_date = Some(start_date);
        self.schedule = self.schedule.take().map(|s| s.with_anchor(start_date));
        self
    }

    /// With catchup, every missed tick gets its own run; without it only the
    /// latest missed tick does.
    pub fn with_catchup(mut self, catchup: bool) -> Self {
        self.catchup = catchup;
        self
    }

    /// Values below 1 are raised to 1.
    pub fn with_max_active_tasks(mut self, max: usize) -> Self {
        self.max_active_tasks = max.max(1);
        self
    }

    pub fn with_max_active_runs(mut self, max: usize) -> Self {
        self.max_active_runs = Some(max.max(1));
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn id(&self) -> &DagId {
        self.graph.id()
    }

    pub fn name(&self) -> &str {
        self.graph.name()
    }

    pub fn graph(&self) -> &Arc<Graph> {
        &self.graph
    }

    pub fn owner(&self) -> Option<&str> {
        self.owner.as_deref()
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn schedule(&self) -> Option<&Schedule> {
        self.schedule.as_ref()
    }

    pub fn start_date(&self) -> Option<DateTime<Utc>> {
        self.start_date
    }

    pub fn catchup(&self) -> bool {
        self.catchup
    }

    pub fn max_active_tasks(&self) -> usize {
        self.max_active_tasks
    }

    pub fn max_active_runs(&self) -> Option<usize> {
        self.max_active_runs
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn is_scheduled(&self) -> bool {
        self.schedule.is_some()
    }

    /// Logical dates of the runs due for ticks in `(after, now]`.
    ///
    /// Ticks before `start_date` are ignored. Without catchup the result holds
    /// at most the latest tick.
    pub fn due_runs(
        &self,
        after: DateTime<Utc>,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Vec<DateTime<Utc>> {
        let Some(schedule) = &self.schedule else {
            return Vec::new();
        };
        let mut ticks: Vec<DateTime<Utc>> = if self.catchup {
            schedule.ticks_between(after, now, limit)
        } else {
            schedule
                .ticks_between(after, now, usize::MAX)
                .pop()
                .into_iter()
                .collect()
        };
        if let Some(start) = self.start_date {
            ticks.retain(|t| *t >= start);
        }
        ticks
    }
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("id", self.id())
            .field("tasks", &self.graph.len())
            .field("schedule", &self.schedule.as_ref().map(Schedule::expression))
            .field("catchup", &self.catchup)
            .field("enabled", &self.enabled)
            .finish()
    }
}
