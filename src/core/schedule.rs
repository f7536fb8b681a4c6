//! Schedules that produce logical run times.
//!
//! Accepts 5-field cron, 6-field cron (leading seconds), the usual shortcuts
//! (`@daily`, `@hourly`, ...) and fixed intervals (`@every 30m`). Cron
//! expressions are evaluated in the schedule's timezone; every tick is
//! reported in UTC.
//!
//! Interval ticks fall on whole multiples of the step from an anchor, the
//! Unix epoch unless [`Schedule::with_anchor`] sets another, so they do not
//! depend on where a caller starts looking.

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use cron::Schedule as CronSchedule;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScheduleError {
    #[error("invalid cron expression '{expression}': {reason}")]
    InvalidCron { expression: String, reason: String },

    #[error("invalid interval: {0}")]
    InvalidInterval(String),

    #[error("invalid timezone: {0}")]
    InvalidTimezone(String),
}

#[derive(Debug, Clone)]
enum Kind {
    Cron(Box<CronSchedule>),
    Every(chrono::Duration),
}

/// A parsed, timezone-aware schedule.
#[derive(Debug, Clone)]
pub struct Schedule {
    expression: String,
    timezone: Tz,
    kind: Kind,
    anchor: DateTime<Utc>,
}

impl Schedule {
    /// Parse a schedule evaluated in UTC.
    pub fn new(expression: impl Into<String>) -> Result<Self, ScheduleError> {
        Self::with_timezone(expression, "UTC")
    }

    pub fn with_timezone(
        expression: impl Into<String>,
        timezone: &str,
    ) -> Result<Self, ScheduleError> {
        let expression = expression.into();
        let timezone: Tz = timezone
            .parse()
            .map_err(|_| ScheduleError::InvalidTimezone(timezone.to_string()))?;
        let kind = parse(expression.trim())?;
        Ok(Self {
            expression,
            timezone,
            kind,
            anchor: DateTime::<Utc>::UNIX_EPOCH,
        })
    }

    /// Align interval ticks to `anchor`. Cron schedules ignore it.
    pub fn with_anchor(mut self, anchor: DateTime<Utc>) -> Self {
        self.anchor = anchor;
        self
    }

    pub fn anchor(&self) -> DateTime<Utc> {
        self.anchor
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    pub fn timezone(&self) -> &str {
        self.timezone.name()
    }

    /// First tick strictly after `after`.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match &self.kind {
            Kind::Cron(cron) => cron
                .after(&after.with_timezone(&self.timezone))
                .next()
                .map(|t| t.with_timezone(&Utc)),
            Kind::Every(step) => next_interval_tick(self.anchor, *step, after),
        }
    }

    /// Ticks in `(after, until]`, oldest first, at most `limit` of them.
    pub fn ticks_between(
        &self,
        after: DateTime<Utc>,
        until: DateTime<Utc>,
        limit: usize,
    ) -> Vec<DateTime<Utc>> {
        let mut ticks = Vec::new();
        let mut cursor = after;
        while ticks.len() < limit {
            match self.next_after(cursor) {
                Some(next) if next <= until => {
                    ticks.push(next);
                    cursor = next;
                }
                _ => break,
            }
        }
        ticks
    }
}

/// Smallest `anchor + k * step` (k >= 0) strictly after `after`.
fn next_interval_tick(
    anchor: DateTime<Utc>,
    step: chrono::Duration,
    after: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    if after < anchor {
        return Some(anchor);
    }
    let step_secs = step.num_seconds();
    let steps = (after - anchor).num_seconds() / step_secs + 1;
    let offset = chrono::Duration::try_seconds(step_secs.checked_mul(steps)?)?;
    anchor.checked_add_signed(offset)
}

fn parse(expression: &str) -> Result<Kind, ScheduleError> {
    if let Some(rest) = expression.strip_prefix("@every ") {
        return parse_every(rest.trim()).map(Kind::Every);
    }
    let cron = match expression.to_ascii_lowercase().as_str() {
        "@yearly" | "@annually" => "0 0 1 1 *",
        "@monthly" => "0 0 1 * *",
        "@weekly" => "0 0 * * SUN",
        "@daily" | "@midnight" => "0 0 * * *",
        "@hourly" => "0 * * * *",
        s if s.starts_with('@') => {
            return Err(ScheduleError::InvalidCron {
                expression: expression.to_string(),
                reason: "unknown shortcut".into(),
            });
        }
        _ => expression,
    };
    parse_cron(cron).map(|c| Kind::Cron(Box::new(c)))
}

fn parse_cron(expression: &str) -> Result<CronSchedule, ScheduleError> {
    let fields = expression.split_whitespace().count();
    let with_seconds = match fields {
        5 => format!("0 {expression}"),
        6 => expression.to_string(),
        n => {
            return Err(ScheduleError::InvalidCron {
                expression: expression.to_string(),
                reason: format!("expected 5 or 6 fields, got {n}"),
            });
        }
    };
    CronSchedule::from_str(&with_seconds).map_err(|e| ScheduleError::InvalidCron {
        expression: expression.to_string(),
        reason: e.to_string(),
    })
}

/// `"1h30m"`, `"45s"`, `"2d"`.
fn parse_every(text: &str) -> Result<chrono::Duration, ScheduleError> {
    let invalid = || ScheduleError::InvalidInterval(text.to_string());
    let mut total: u64 = 0;
    let mut digits = String::new();

    for c in text.chars() {
        if c.is_ascii_digit() {
            digits.push(c);
            continue;
        }
        let n: u64 = digits.parse().map_err(|_| invalid())?;
        digits.clear();
        let unit = match c {
            's' => 1,
            'm' => 60,
            'h' => 3_600,
            'd' => 86_400,
            _ => return Err(invalid()),
        };
        total = n
            .checked_mul(unit)
            .and_then(|secs| total.checked_add(secs))
            .ok_or_else(invalid)?;
    }

    if !digits.is_empty() || total == 0 {
        return Err(invalid());
    }
    chrono::Duration::from_std(Duration::from_secs(total)).map_err(|_| invalid())
}
