//! Counters over lifecycle events.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use taskforge_core::{Execution, Job, Outcome, StrategyKind};

use crate::observer::{JobObserver, ObserverError};

#[derive(Debug, Default)]
struct StrategyCounters {
    executions: AtomicU64,
    duration_ms: AtomicU64,
}

/// Observer that counts lifecycle events.
#[derive(Debug, Default)]
pub struct MetricsObserver {
    started: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    timeouts: AtomicU64,
    retried: AtomicU64,
    exhausted: AtomicU64,
    cancelled: AtomicU64,
    cooperative: StrategyCounters,
    thread: StrategyCounters,
    process: StrategyCounters,
}

/// Per-strategy totals.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StrategyMetrics {
    pub executions: u64,
    pub total_duration_ms: u64,
}

/// Point-in-time copy of [`MetricsObserver`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub started: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub timeouts: u64,
    pub retried: u64,
    pub exhausted: u64,
    pub cancelled: u64,
    pub cooperative: StrategyMetrics,
    pub thread: StrategyMetrics,
    pub process: StrategyMetrics,
}

impl MetricsObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        let strategy = |c: &StrategyCounters| StrategyMetrics {
            executions: load(&c.executions),
            total_duration_ms: load(&c.duration_ms),
        };
        MetricsSnapshot {
            started: load(&self.started),
            succeeded: load(&self.succeeded),
            failed: load(&self.failed),
            timeouts: load(&self.timeouts),
            retried: load(&self.retried),
            exhausted: load(&self.exhausted),
            cancelled: load(&self.cancelled),
            cooperative: strategy(&self.cooperative),
            thread: strategy(&self.thread),
            process: strategy(&self.process),
        }
    }

    fn record_execution(&self, execution: &Execution) {
        let counters = match execution.strategy() {
            StrategyKind::Cooperative => &self.cooperative,
            StrategyKind::Thread => &self.thread,
            StrategyKind::Process => &self.process,
        };
        counters.executions.fetch_add(1, Ordering::Relaxed);
        counters
            .duration_ms
            .fetch_add(execution.duration_ms().unwrap_or(0), Ordering::Relaxed);
    }
}

impl JobObserver for MetricsObserver {
    fn on_started(&self, _job: &Job) -> Result<(), ObserverError> {
        self.started.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn on_completed(&self, _job: &Job, execution: &Execution) -> Result<(), ObserverError> {
        self.succeeded.fetch_add(1, Ordering::Relaxed);
        self.record_execution(execution);
        Ok(())
    }

    fn on_failed(&self, _job: &Job, execution: &Execution) -> Result<(), ObserverError> {
        self.failed.fetch_add(1, Ordering::Relaxed);
        if execution.outcome() == Outcome::Timeout {
            self.timeouts.fetch_add(1, Ordering::Relaxed);
        }
        self.record_execution(execution);
        Ok(())
    }

    fn on_retried(&self, _job: &Job, _attempt: u32) -> Result<(), ObserverError> {
        self.retried.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn on_exhausted(&self, _job: &Job) -> Result<(), ObserverError> {
        self.exhausted.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn on_cancelled(&self, _job: &Job) -> Result<(), ObserverError> {
        self.cancelled.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use taskforge_core::{FailureCode, FailureReason, JobDefinition};

    #[test]
    fn counts_events_per_strategy() {
        let metrics = MetricsObserver::new();
        let mut job =
            Job::create(JobDefinition::new("m", "task", StrategyKind::Process), None).unwrap();
        let attempt = job.begin_attempt().unwrap();

        let mut timed_out = Execution::start(job.id(), attempt, StrategyKind::Process);
        timed_out
            .fail(FailureReason::new(FailureCode::Timeout, "slow"))
            .unwrap();
        let mut ok = Execution::start(job.id(), attempt + 1, StrategyKind::Process);
        ok.succeed(serde_json::Value::Null).unwrap();

        metrics.on_started(&job).unwrap();
        metrics.on_failed(&job, &timed_out).unwrap();
        metrics.on_retried(&job, 2).unwrap();
        metrics.on_completed(&job, &ok).unwrap();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.started, 1);
        assert_eq!(snapshot.failed, 1);
        assert_eq!(snapshot.timeouts, 1);
        assert_eq!(snapshot.retried, 1);
        assert_eq!(snapshot.succeeded, 1);
        assert_eq!(snapshot.process.executions, 2);
        assert_eq!(snapshot.thread, StrategyMetrics::default());
    }
}
