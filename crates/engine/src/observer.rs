//! Lifecycle observers.
//!
//! Notifications are best-effort: an observer that errors or panics is
//! logged and skipped, and never affects job state.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use tracing::{error, info, warn};

use taskforge_core::{Execution, Job};

/// Error returned by an observer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ObserverError {
    #[error("observer failed: {0}")]
    Failed(String),
    #[error("observer registry is torn down")]
    RegistryClosed,
}

/// Listener for job lifecycle events. Every method defaults to a no-op.
pub trait JobObserver: Send + Sync {
    fn on_started(&self, _job: &Job) -> Result<(), ObserverError> {
        Ok(())
    }

    fn on_completed(&self, _job: &Job, _execution: &Execution) -> Result<(), ObserverError> {
        Ok(())
    }

    fn on_failed(&self, _job: &Job, _execution: &Execution) -> Result<(), ObserverError> {
        Ok(())
    }

    /// `attempt` is the number of the attempt about to be made.
    fn on_retried(&self, _job: &Job, _attempt: u32) -> Result<(), ObserverError> {
        Ok(())
    }

    /// The job's `last_failure` carries the final classification and message.
    fn on_exhausted(&self, _job: &Job) -> Result<(), ObserverError> {
        Ok(())
    }

    fn on_cancelled(&self, _job: &Job) -> Result<(), ObserverError> {
        Ok(())
    }
}

/// Identifies an attached observer.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObserverId(u64);

/// Lifecycle event, as dispatched to observers.
#[derive(Debug, Clone, Copy)]
pub enum LifecycleEvent<'a> {
    Started(&'a Job),
    Completed(&'a Job, &'a Execution),
    Failed(&'a Job, &'a Execution),
    Retried(&'a Job, u32),
    Exhausted(&'a Job),
    Cancelled(&'a Job),
}

impl LifecycleEvent<'_> {
    pub fn name(&self) -> &'static str {
        match self {
            LifecycleEvent::Started(_) => "started",
            LifecycleEvent::Completed(..) => "completed",
            LifecycleEvent::Failed(..) => "failed",
            LifecycleEvent::Retried(..) => "retried",
            LifecycleEvent::Exhausted(_) => "exhausted",
            LifecycleEvent::Cancelled(_) => "cancelled",
        }
    }

    pub fn job(&self) -> &Job {
        match self {
            LifecycleEvent::Started(job)
            | LifecycleEvent::Completed(job, _)
            | LifecycleEvent::Failed(job, _)
            | LifecycleEvent::Retried(job, _)
            | LifecycleEvent::Exhausted(job)
            | LifecycleEvent::Cancelled(job) => job,
        }
    }

    fn deliver(&self, observer: &dyn JobObserver) -> Result<(), ObserverError> {
        match *self {
            LifecycleEvent::Started(job) => observer.on_started(job),
            LifecycleEvent::Completed(job, execution) => observer.on_completed(job, execution),
            LifecycleEvent::Failed(job, execution) => observer.on_failed(job, execution),
            LifecycleEvent::Retried(job, attempt) => observer.on_retried(job, attempt),
            LifecycleEvent::Exhausted(job) => observer.on_exhausted(job),
            LifecycleEvent::Cancelled(job) => observer.on_cancelled(job),
        }
    }
}

/// Process-wide observer list.
///
/// Created explicitly and handed to the orchestrator; `teardown` detaches
/// everything and refuses further attachments.
#[derive(Default)]
pub struct ObserverRegistry {
    observers: RwLock<Vec<(ObserverId, Arc<dyn JobObserver>)>>,
    next_id: AtomicU64,
    closed: AtomicBool,
}

impl ObserverRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn attach(&self, observer: Arc<dyn JobObserver>) -> Result<ObserverId, ObserverError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ObserverError::RegistryClosed);
        }
        let id = ObserverId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.observers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push((id, observer));
        Ok(id)
    }

    /// Returns whether `id` was attached.
    pub fn detach(&self, id: ObserverId) -> bool {
        let mut observers = self
            .observers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let before = observers.len();
        observers.retain(|(attached, _)| *attached != id);
        observers.len() != before
    }

    pub fn teardown(&self) {
        self.closed.store(true, Ordering::Release);
        self.observers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clear();
    }

    pub fn len(&self) -> usize {
        self.observers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deliver `event` to every observer, swallowing failures.
    pub fn notify(&self, event: LifecycleEvent<'_>) {
        // Snapshot so observers may attach/detach from inside a callback.
        let observers: Vec<_> = self
            .observers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();

        for (id, observer) in observers {
            let delivered = panic::catch_unwind(AssertUnwindSafe(|| event.deliver(observer.as_ref())));
            match delivered {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(
                    observer = id.0,
                    event = event.name(),
                    job_id = %event.job().id(),
                    error = %e,
                    "observer failed"
                ),
                Err(_) => error!(
                    observer = id.0,
                    event = event.name(),
                    job_id = %event.job().id(),
                    "observer panicked"
                ),
            }
        }
    }
}

impl std::fmt::Debug for ObserverRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObserverRegistry")
            .field("observers", &self.len())
            .field("closed", &self.closed.load(Ordering::Acquire))
            .finish()
    }
}

/// Logs every lifecycle event.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl JobObserver for TracingObserver {
    fn on_started(&self, job: &Job) -> Result<(), ObserverError> {
        info!(job_id = %job.id(), name = job.name(), strategy = %job.strategy(), attempt = job.attempts(), "job started");
        Ok(())
    }

    fn on_completed(&self, job: &Job, execution: &Execution) -> Result<(), ObserverError> {
        info!(
            job_id = %job.id(),
            name = job.name(),
            attempt = execution.attempt(),
            duration_ms = execution.duration_ms(),
            "job succeeded"
        );
        Ok(())
    }

    fn on_failed(&self, job: &Job, execution: &Execution) -> Result<(), ObserverError> {
        let error = execution.error().map(ToString::to_string).unwrap_or_default();
        warn!(
            job_id = %job.id(),
            name = job.name(),
            attempt = execution.attempt(),
            outcome = %execution.outcome(),
            error = %error,
            "job attempt failed"
        );
        Ok(())
    }

    fn on_retried(&self, job: &Job, attempt: u32) -> Result<(), ObserverError> {
        info!(job_id = %job.id(), name = job.name(), attempt, "job retry scheduled");
        Ok(())
    }

    fn on_exhausted(&self, job: &Job) -> Result<(), ObserverError> {
        let reason = job.last_failure().map(ToString::to_string).unwrap_or_default();
        error!(
            job_id = %job.id(),
            name = job.name(),
            attempts = job.attempts(),
            reason = %reason,
            "job exhausted"
        );
        Ok(())
    }

    fn on_cancelled(&self, job: &Job) -> Result<(), ObserverError> {
        info!(job_id = %job.id(), name = job.name(), "job cancelled");
        Ok(())
    }
}
