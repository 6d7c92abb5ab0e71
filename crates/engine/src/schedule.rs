//! Recurring schedules.
//!
//! A schedule pairs a cron expression with a job template. Each time an
//! occurrence comes due, a fresh job built from the template is submitted
//! through the orchestrator like any other job.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use taskforge_core::{DomainError, JobDefinition, JobId, StrategyKind};

use crate::orchestrator::{Orchestrator, SubmitError};
use crate::repository::JobRepository;

#[derive(Debug, thiserror::Error)]
pub enum ScheduleError {
    #[error("invalid cron expression {expression:?}: {reason}")]
    InvalidExpression { expression: String, reason: String },
    #[error("cron expression {0:?} has no future occurrence")]
    NeverFires(String),
    #[error("schedule name already in use: {0}")]
    DuplicateName(String),
    #[error("invalid job template: {0}")]
    Template(#[from] DomainError),
    #[error("orchestrator is stopped")]
    Stopped,
}

/// A parsed cron expression.
///
/// Accepted forms:
/// - five fields `minute hour day-of-month month day-of-week`, with Sunday as 0
/// - six or seven fields with a leading seconds column (and optional year),
///   passed to the `cron` crate as is, where Sunday is 1
/// - `*/N`, short for every N minutes
/// - `@hourly`, `@daily`, `@weekly`, `@monthly`, `@yearly` and the named
///   presets `every_minute`, `every_5_minutes` ... `every_30_minutes`,
///   `hourly`, `daily`, `weekly`, `monthly`
#[derive(Debug, Clone)]
pub struct CronExpression {
    source: String,
    schedule: cron::Schedule,
}

impl CronExpression {
    pub fn parse(expression: &str) -> Result<Self, ScheduleError> {
        let invalid = |reason: String| ScheduleError::InvalidExpression {
            expression: expression.to_string(),
            reason,
        };
        let normalized = normalize(expression).map_err(invalid)?;
        let schedule = cron::Schedule::from_str(&normalized).map_err(|e| invalid(e.to_string()))?;
        Ok(Self {
            source: expression.trim().to_string(),
            schedule,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// First occurrence strictly after `after`.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(&after).next()
    }
}

impl FromStr for CronExpression {
    type Err = ScheduleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for CronExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

fn preset(name: &str) -> Option<&'static str> {
    let expression = match name {
        "every_minute" => "0 * * * * *",
        "every_5_minutes" => "0 */5 * * * *",
        "every_10_minutes" => "0 */10 * * * *",
        "every_15_minutes" => "0 */15 * * * *",
        "every_30_minutes" => "0 */30 * * * *",
        "hourly" | "@hourly" => "0 0 * * * *",
        "daily" | "@daily" | "@midnight" => "0 0 0 * * *",
        "weekly" | "@weekly" => "0 0 0 * * SUN",
        "monthly" | "@monthly" => "0 0 0 1 * *",
        "@yearly" | "@annually" => "0 0 0 1 1 *",
        _ => return None,
    };
    Some(expression)
}

/// Rewrite the accepted forms into the seconds-first syntax of the `cron` crate.
fn normalize(expression: &str) -> Result<String, String> {
    let trimmed = expression.trim();
    if trimmed.is_empty() {
        return Err("expression is empty".to_string());
    }
    if let Some(expanded) = preset(&trimmed.to_ascii_lowercase()) {
        return Ok(expanded.to_string());
    }
    if trimmed.starts_with('@') {
        return Err(format!("unknown shorthand {trimmed}"));
    }

    let fields: Vec<&str> = trimmed.split_whitespace().collect();
    match fields.as_slice() {
        [every] if every.starts_with("*/") => Ok(format!("0 {every} * * * *")),
        [minute, hour, day, month, weekday] => Ok(format!(
            "0 {minute} {hour} {day} {month} {}",
            weekday_from_zero(weekday)?
        )),
        [_, _, _, _, _, _] | [_, _, _, _, _, _, _] => Ok(fields.join(" ")),
        _ => Err(format!("expected 5 to 7 fields, found {}", fields.len())),
    }
}

/// Shift numeric day-of-week values from 0 = Sunday to 1 = Sunday.
/// Step values after `/` are left alone; names pass through.
fn weekday_from_zero(field: &str) -> Result<String, String> {
    let shift = |value: &str, range_end: bool| -> Result<String, String> {
        if !value.chars().all(|c| c.is_ascii_digit()) {
            return Ok(value.to_string());
        }
        match value.parse::<u8>() {
            Ok(day @ 0..=6) => Ok((day + 1).to_string()),
            Ok(7) if !range_end => Ok("1".to_string()),
            _ => Err(format!("day of week {value} is out of range 0-6")),
        }
    };

    let mut parts = Vec::new();
    for part in field.split(',') {
        let (base, step) = match part.split_once('/') {
            Some((base, step)) => (base, Some(step)),
            None => (part, None),
        };
        let base = match base.split_once('-') {
            Some((start, end)) => format!("{}-{}", shift(start, false)?, shift(end, true)?),
            None => shift(base, false)?,
        };
        parts.push(match step {
            Some(step) => format!("{base}/{step}"),
            None => base,
        });
    }
    Ok(parts.join(","))
}

/// A schedule as reported to callers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScheduleInfo {
    pub name: String,
    pub expression: String,
    pub task: String,
    pub strategy: StrategyKind,
    pub next_fire: Option<DateTime<Utc>>,
    pub last_fire: Option<DateTime<Utc>>,
    pub last_job: Option<JobId>,
    pub fired: u64,
}

#[derive(Debug)]
struct Entry {
    expression: CronExpression,
    template: JobDefinition,
    next_fire: Option<DateTime<Utc>>,
    last_fire: Option<DateTime<Utc>>,
    last_job: Option<JobId>,
    fired: u64,
}

impl Entry {
    fn info(&self, name: &str) -> ScheduleInfo {
        ScheduleInfo {
            name: name.to_string(),
            expression: self.expression.to_string(),
            task: self.template.task.as_str().to_string(),
            strategy: self.template.strategy,
            next_fire: self.next_fire,
            last_fire: self.last_fire,
            last_job: self.last_job,
            fired: self.fired,
        }
    }
}

/// One due occurrence, ready to submit.
#[derive(Debug, Clone, PartialEq)]
pub struct DueJob {
    pub schedule: String,
    pub fire_at: DateTime<Utc>,
    pub definition: JobDefinition,
}

/// Active schedules, keyed by name.
#[derive(Debug, Default)]
pub struct ScheduleRegistry {
    entries: BTreeMap<String, Entry>,
}

impl ScheduleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Register a schedule whose first occurrence is the next one after `now`.
    pub fn add(
        &mut self,
        name: impl Into<String>,
        expression: CronExpression,
        template: JobDefinition,
        now: DateTime<Utc>,
    ) -> Result<ScheduleInfo, ScheduleError> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(DomainError::validation("schedule name must not be empty").into());
        }
        template.validate()?;
        if self.entries.contains_key(&name) {
            return Err(ScheduleError::DuplicateName(name));
        }
        let next_fire = expression
            .next_after(now)
            .ok_or_else(|| ScheduleError::NeverFires(expression.to_string()))?;

        let entry = Entry {
            expression,
            template,
            next_fire: Some(next_fire),
            last_fire: None,
            last_job: None,
            fired: 0,
        };
        let info = entry.info(&name);
        info!(schedule = %name, expression = %info.expression, next_fire = %next_fire, "schedule added");
        self.entries.insert(name, entry);
        Ok(info)
    }

    /// Returns whether a schedule by that name existed.
    pub fn remove(&mut self, name: &str) -> bool {
        let removed = self.entries.remove(name).is_some();
        if removed {
            info!(schedule = name, "schedule removed");
        }
        removed
    }

    pub fn get(&self, name: &str) -> Option<ScheduleInfo> {
        self.entries.get(name).map(|entry| entry.info(name))
    }

    pub fn list(&self) -> Vec<ScheduleInfo> {
        self.entries.iter().map(|(name, entry)| entry.info(name)).collect()
    }

    /// Time until the earliest occurrence; zero when one is already due.
    pub fn next_wake(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.entries
            .values()
            .filter_map(|entry| entry.next_fire)
            .min()
            .map(|at| (at - now).to_std().unwrap_or(Duration::ZERO))
    }

    /// Collect every due occurrence and advance each schedule past `now`.
    ///
    /// Occurrences missed while the loop was busy collapse into one job.
    pub fn take_due(&mut self, now: DateTime<Utc>) -> Vec<DueJob> {
        let mut due = Vec::new();
        for (name, entry) in &mut self.entries {
            let Some(fire_at) = entry.next_fire.filter(|at| *at <= now) else {
                continue;
            };
            let mut definition = entry.template.clone();
            definition.name = format!("{name}-{}", fire_at.format("%Y%m%dT%H%M%SZ"));
            definition.idempotency_key = Some(format!("schedule:{name}:{}", fire_at.timestamp()));

            entry.next_fire = entry.expression.next_after(now);
            entry.last_fire = Some(fire_at);
            entry.fired += 1;
            if entry.next_fire.is_none() {
                warn!(schedule = %name, "schedule has no further occurrences");
            }
            due.push(DueJob {
                schedule: name.clone(),
                fire_at,
                definition,
            });
        }
        due
    }

    fn record_job(&mut self, schedule: &str, job_id: JobId) {
        if let Some(entry) = self.entries.get_mut(schedule) {
            entry.last_job = Some(job_id);
        }
    }
}

impl<R: JobRepository> Orchestrator<R> {
    /// Submit one job for every schedule that has come due.
    ///
    /// A rejected submission is logged and the occurrence is skipped.
    pub fn fire_due_schedules(&mut self, schedules: &mut ScheduleRegistry, now: DateTime<Utc>) -> usize {
        let mut submitted = 0;
        for due in schedules.take_due(now) {
            match self.submit(due.definition) {
                Ok(job) => {
                    debug!(schedule = %due.schedule, job_id = %job.id(), fire_at = %due.fire_at, "scheduled job submitted");
                    schedules.record_job(&due.schedule, job.id());
                    submitted += 1;
                }
                Err(SubmitError::DuplicateName(name)) => {
                    warn!(schedule = %due.schedule, name, "previous occurrence still active, skipping");
                }
                Err(e) => {
                    warn!(schedule = %due.schedule, error = %e, "scheduled submission failed, skipping");
                }
            }
        }
        submitted
    }
}
