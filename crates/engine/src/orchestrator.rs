//! The coordination loop.
//!
//! The orchestrator is the only writer of job and execution state. Every
//! transition is persisted before observers hear about it and before the
//! next attempt can be scheduled. A transition that cannot be persisted is
//! held back and blocks all further progress until the repository accepts it.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::runtime::Handle;
use tokio::task::{self, JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use taskforge_core::{
    DomainError, Execution, FailureCode, FailureReason, Job, JobDefinition, JobId, JobState, Outcome,
    RetryDecision, StrategyKind, TransitionError,
};

use crate::config::OrchestratorConfig;
use crate::executor::{ExecutionRequest, finish};
use crate::observer::{LifecycleEvent, ObserverRegistry};
use crate::pool::{ExecutorPool, LaneStats, PoolError};
use crate::registry::TaskRegistry;
use crate::repository::{JobRepository, RepositoryError};

/// Submission rejected before the job entered the state machine.
#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error("job name already in use: {0}")]
    DuplicateName(String),
    #[error("invalid job definition: {0}")]
    Invalid(#[from] DomainError),
    #[error("repository error: {0}")]
    Repository(#[source] RepositoryError),
    #[error("orchestrator is stopped")]
    Stopped,
}

/// Orchestrator-level failure, surfaced to whoever drives the loop.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("failed to persist transition of job {job_id}: {source}")]
    Persistence {
        job_id: JobId,
        #[source]
        source: RepositoryError,
    },
    #[error("repository error: {0}")]
    Repository(#[from] RepositoryError),
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error(transparent)]
    Transition(#[from] TransitionError),
    #[error("executor pool error: {0}")]
    Pool(#[from] PoolError),
    #[error("orchestrator is stopped")]
    Stopped,
}

/// Result of a cancellation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The job had not started; it is now cancelled.
    Cancelled,
    /// The job is running; it becomes cancelled once the executor stops it.
    Requested,
    /// Nothing to cancel.
    AlreadyTerminal(JobState),
}

/// What one cycle did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    pub completed: usize,
    pub dispatched: usize,
    /// Ready jobs held back by retry delay or a saturated lane.
    pub deferred: usize,
    pub in_flight: usize,
    /// Time until the earliest deferred job becomes eligible.
    #[serde(skip)]
    pub next_wake: Option<Duration>,
}

impl CycleReport {
    /// Nothing running, nothing waiting.
    pub fn is_idle(&self) -> bool {
        self.in_flight == 0 && self.deferred == 0 && self.dispatched == 0
    }
}

/// Jobs touched by crash recovery.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    pub retried: usize,
    pub exhausted: usize,
}

/// Orchestrator runtime statistics.
#[derive(Debug, Clone, Serialize)]
pub struct OrchestratorStats {
    pub in_flight: usize,
    pub awaiting_persistence: usize,
    pub waiting_retry: usize,
    pub jobs_dispatched: u64,
    pub jobs_succeeded: u64,
    pub jobs_exhausted: u64,
    pub jobs_cancelled: u64,
    pub retries_scheduled: u64,
    pub lanes: Vec<LaneStats>,
}

#[derive(Debug, Default, Clone, Copy)]
struct Counters {
    dispatched: u64,
    succeeded: u64,
    exhausted: u64,
    cancelled: u64,
    retries: u64,
}

struct InFlight {
    job: Job,
    opened: Execution,
    cancel: CancellationToken,
    cancel_requested: bool,
}

/// Lifecycle event waiting for its transition to be persisted.
#[derive(Debug, Clone)]
enum Event {
    Started,
    Completed,
    Failed,
    Retried(u32),
    Exhausted,
    Cancelled,
}

struct Transition {
    job: Job,
    execution: Option<Execution>,
    events: Vec<Event>,
}

/// Drives jobs from submission to a terminal state.
pub struct Orchestrator<R: JobRepository> {
    repository: R,
    pool: ExecutorPool,
    observers: Arc<ObserverRegistry>,
    config: OrchestratorConfig,
    runtime: Handle,
    in_flight: HashMap<JobId, InFlight>,
    completions: JoinSet<Execution>,
    task_jobs: HashMap<task::Id, JobId>,
    finished: VecDeque<Result<(task::Id, Execution), JoinError>>,
    unpersisted: VecDeque<Transition>,
    eligible_at: HashMap<JobId, DateTime<Utc>>,
    lane_backoff: HashMap<StrategyKind, Instant>,
    counters: Counters,
}

impl<R: JobRepository> Orchestrator<R> {
    /// Build an orchestrator on the current tokio runtime.
    pub fn new(
        repository: R,
        registry: Arc<TaskRegistry>,
        observers: Arc<ObserverRegistry>,
        config: OrchestratorConfig,
    ) -> Result<Self, OrchestratorError> {
        let runtime = Handle::try_current().map_err(|e| PoolError::Startup(e.to_string()))?;
        let pool = ExecutorPool::new(&config, registry)?;
        Ok(Self {
            repository,
            pool,
            observers,
            config,
            runtime,
            in_flight: HashMap::new(),
            completions: JoinSet::new(),
            task_jobs: HashMap::new(),
            finished: VecDeque::new(),
            unpersisted: VecDeque::new(),
            eligible_at: HashMap::new(),
            lane_backoff: HashMap::new(),
            counters: Counters::default(),
        })
    }

    pub fn repository(&self) -> &R {
        &self.repository
    }

    pub fn observers(&self) -> &Arc<ObserverRegistry> {
        &self.observers
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Accept a job definition.
    ///
    /// A definition whose idempotency key is already known returns the
    /// existing job.
    pub fn submit(&mut self, definition: JobDefinition) -> Result<Job, SubmitError> {
        let job = Job::create(definition, self.config.default_timeout())?;

        if let Some(key) = job.idempotency_key() {
            if let Some(existing) = self
                .repository
                .find_by_idempotency_key(key)
                .map_err(SubmitError::Repository)?
            {
                debug!(job_id = %existing.id(), key, "idempotent resubmission");
                return Ok(existing);
            }
        }

        if self
            .repository
            .find_active_by_name(job.name())
            .map_err(SubmitError::Repository)?
            .is_some()
        {
            return Err(SubmitError::DuplicateName(job.name().to_string()));
        }

        self.repository.insert_job(&job).map_err(|e| match e {
            RepositoryError::NameTaken(name) => SubmitError::DuplicateName(name),
            other => SubmitError::Repository(other),
        })?;

        info!(
            job_id = %job.id(),
            name = job.name(),
            strategy = %job.strategy(),
            max_retries = job.max_retries(),
            "job submitted"
        );
        Ok(job)
    }

    /// Cancel a job. Pending and retrying jobs are cancelled at once; a
    /// running job is asked to stop and is cancelled when its attempt ends.
    pub fn cancel(&mut self, job_id: JobId) -> Result<CancelOutcome, OrchestratorError> {
        if let Some(in_flight) = self.in_flight.get_mut(&job_id) {
            in_flight.cancel_requested = true;
            in_flight.cancel.cancel();
            info!(job_id = %job_id, attempt = in_flight.opened.attempt(), "cancellation requested");
            return Ok(CancelOutcome::Requested);
        }

        // A held-back transition is newer than anything the repository has.
        let held = self
            .unpersisted
            .iter()
            .rev()
            .find(|t| t.job.id() == job_id)
            .map(|t| t.job.clone());
        let mut job = match held {
            Some(job) => job,
            None => self
                .repository
                .get_job(job_id)?
                .ok_or(OrchestratorError::NotFound(job_id))?,
        };
        if job.is_terminal() {
            return Ok(CancelOutcome::AlreadyTerminal(job.state()));
        }

        job.transition(JobState::Cancelled)?;
        self.eligible_at.remove(&job_id);
        self.counters.cancelled += 1;
        info!(job_id = %job_id, name = job.name(), "job cancelled before running");
        self.persist(job, None, vec![Event::Cancelled])?;
        Ok(CancelOutcome::Cancelled)
    }

    /// Run one coordination cycle without blocking: persist held-back
    /// transitions, process finished attempts, dispatch eligible jobs.
    pub fn run_cycle(&mut self) -> Result<CycleReport, OrchestratorError> {
        self.flush()?;

        let mut report = CycleReport::default();
        while let Some(result) = self.completions.try_join_next_with_id() {
            self.finished.push_back(result);
        }
        while let Some(result) = self.finished.pop_front() {
            let Some(execution) = self.resolve_completion(result) else {
                continue;
            };
            self.complete(execution)?;
            report.completed += 1;
        }

        let ready = match self.repository.load_ready_jobs() {
            Ok(ready) => ready,
            Err(e) => {
                warn!(error = %e, "failed to load ready jobs; skipping dispatch");
                report.in_flight = self.in_flight.len();
                report.deferred = 1;
                report.next_wake = Some(self.config.poll_interval());
                return Ok(report);
            }
        };

        let now = Instant::now();
        let mut saturated: Vec<StrategyKind> = Vec::new();
        for job in ready {
            if self.in_flight.contains_key(&job.id()) {
                continue;
            }
            let strategy = job.strategy();
            let backed_off = self.lane_backoff.get(&strategy).is_some_and(|until| *until > now);
            if backed_off || saturated.contains(&strategy) {
                report.deferred += 1;
                let wait = self
                    .lane_backoff
                    .get(&strategy)
                    .map_or(self.config.submit_backoff(), |until| until.saturating_duration_since(now));
                report.next_wake = earliest(report.next_wake, wait);
                continue;
            }

            if let Some(wait) = self.retry_wait(&job) {
                report.deferred += 1;
                report.next_wake = earliest(report.next_wake, wait);
                continue;
            }

            match self.dispatch(job)? {
                true => report.dispatched += 1,
                false => {
                    saturated.push(strategy);
                    report.deferred += 1;
                    report.next_wake = earliest(report.next_wake, self.config.submit_backoff());
                }
            }
        }

        report.in_flight = self.in_flight.len();
        Ok(report)
    }

    /// Drive cycles until nothing is running or waiting.
    pub async fn run_until_idle(&mut self) -> Result<(), OrchestratorError> {
        loop {
            let report = self.run_cycle()?;
            if report.is_idle() && self.unpersisted.is_empty() {
                return Ok(());
            }
            self.wait_for_progress(report.next_wake).await;
        }
    }

    /// Sleep until an attempt finishes or `wake` (capped at the poll interval) passes.
    pub(crate) async fn wait_for_progress(&mut self, wake: Option<Duration>) {
        let pause = wake
            .unwrap_or(self.config.poll_interval())
            .min(self.config.poll_interval());
        if self.completions.is_empty() {
            tokio::time::sleep(pause).await;
            return;
        }
        tokio::select! {
            Some(result) = self.completions.join_next_with_id() => self.finished.push_back(result),
            _ = tokio::time::sleep(pause) => {}
        }
    }

    /// Finalize attempts left `running` by a previous process and apply the
    /// retry policy to them. Call before the first cycle.
    pub fn recover(&mut self) -> Result<RecoveryReport, OrchestratorError> {
        let mut report = RecoveryReport::default();
        for mut job in self.repository.load_running_jobs()? {
            if self.in_flight.contains_key(&job.id()) {
                continue;
            }
            let attempt = job.attempts().max(1);
            let mut execution = self
                .repository
                .load_execution_history(job.id())?
                .into_iter()
                .rev()
                .find(|e| e.attempt() == attempt && !e.is_finished())
                .unwrap_or_else(|| Execution::start(job.id(), attempt, job.strategy()));
            let execution = {
                let reason = FailureReason::new(
                    FailureCode::Interrupted,
                    "orchestrator stopped while the attempt was running",
                );
                if let Err(e) = execution.fail(reason) {
                    warn!(job_id = %job.id(), error = %e, "dangling execution already finalized");
                }
                execution
            };

            warn!(job_id = %job.id(), name = job.name(), attempt, "recovering interrupted job");
            let events = self.apply_failure(&mut job, &execution)?;
            if job.state() == JobState::Exhausted {
                report.exhausted += 1;
            } else {
                report.retried += 1;
            }
            self.persist(job, Some(execution), events)?;
        }
        Ok(report)
    }

    pub fn stats(&self) -> OrchestratorStats {
        OrchestratorStats {
            in_flight: self.in_flight.len(),
            awaiting_persistence: self.unpersisted.len(),
            waiting_retry: self.eligible_at.len(),
            jobs_dispatched: self.counters.dispatched,
            jobs_succeeded: self.counters.succeeded,
            jobs_exhausted: self.counters.exhausted,
            jobs_cancelled: self.counters.cancelled,
            retries_scheduled: self.counters.retries,
            lanes: self.pool.stats(),
        }
    }

    pub fn lane_stats(&self, strategy: StrategyKind) -> LaneStats {
        self.pool.lane_stats(strategy)
    }

    /// Stop accepting work. Attempts still running stay `running` in the
    /// repository and are picked up by [`Orchestrator::recover`] next time.
    pub fn shutdown(&mut self) {
        if !self.in_flight.is_empty() {
            warn!(in_flight = self.in_flight.len(), "shutting down with attempts in flight");
        }
        self.pool.close();
        self.completions.detach_all();
        info!("orchestrator stopped");
    }

    fn dispatch(&mut self, job: Job) -> Result<bool, OrchestratorError> {
        let mut running = job.clone();
        let attempt = running.begin_attempt()?;
        let request = ExecutionRequest::new(
            running.id(),
            attempt,
            running.strategy(),
            running.task().clone(),
            running.input().clone(),
        )
        .with_timeout(running.timeout());

        let handle = match self.pool.submit(request) {
            Ok(handle) => handle,
            Err(PoolError::Saturated { strategy, queued }) => {
                debug!(job_id = %job.id(), strategy = %strategy, queued, "lane saturated; deferring");
                self.lane_backoff
                    .insert(strategy, Instant::now() + self.config.submit_backoff());
                return Ok(false);
            }
            Err(e) => return Err(e.into()),
        };

        self.eligible_at.remove(&job.id());
        self.counters.dispatched += 1;
        let opened = handle.execution().clone();
        let cancel = handle.cancel_token();
        let abort = self.completions.spawn_on(handle.wait(), &self.runtime);
        self.task_jobs.insert(abort.id(), job.id());
        self.in_flight.insert(
            job.id(),
            InFlight {
                job: running.clone(),
                opened: opened.clone(),
                cancel,
                cancel_requested: false,
            },
        );

        debug!(job_id = %job.id(), attempt, strategy = %job.strategy(), "job dispatched");
        self.persist(running, Some(opened), vec![Event::Started])?;
        Ok(true)
    }

    fn resolve_completion(&mut self, result: Result<(task::Id, Execution), JoinError>) -> Option<Execution> {
        match result {
            Ok((id, execution)) => {
                self.task_jobs.remove(&id);
                Some(execution)
            }
            Err(e) => {
                let job_id = self.task_jobs.remove(&e.id())?;
                let opened = self.in_flight.get(&job_id)?.opened.clone();
                error!(job_id = %job_id, error = %e, "completion task failed");
                Some(finish(
                    opened,
                    Err(FailureReason::new(FailureCode::Interrupted, e.to_string())),
                ))
            }
        }
    }

    fn complete(&mut self, execution: Execution) -> Result<(), OrchestratorError> {
        let Some(InFlight {
            mut job,
            cancel_requested,
            ..
        }) = self.in_flight.remove(&execution.job_id())
        else {
            warn!(job_id = %execution.job_id(), attempt = execution.attempt(), "completion for unknown job");
            return Ok(());
        };

        let events = if execution.outcome() == Outcome::Success {
            job.transition(JobState::Succeeded)?;
            self.counters.succeeded += 1;
            info!(
                job_id = %job.id(),
                attempt = execution.attempt(),
                duration_ms = execution.duration_ms(),
                "job succeeded"
            );
            vec![Event::Completed]
        } else if cancel_requested {
            job.transition(JobState::Cancelled)?;
            self.counters.cancelled += 1;
            info!(job_id = %job.id(), attempt = execution.attempt(), "job cancelled");
            vec![Event::Cancelled]
        } else {
            self.apply_failure(&mut job, &execution)?
        };

        self.persist(job, Some(execution), events)
    }

    /// running → failed → retrying | exhausted.
    fn apply_failure(&mut self, job: &mut Job, execution: &Execution) -> Result<Vec<Event>, OrchestratorError> {
        let reason = execution.error().cloned().unwrap_or_else(|| {
            FailureReason::new(FailureCode::Application, format!("attempt ended as {}", execution.outcome()))
        });
        job.record_failure(reason.clone())?;

        let attempt = execution.attempt();
        let mut rng = self.config.jitter_seed().rng_for(job.id(), attempt);
        let decision = self
            .config
            .retry()
            .decide(attempt, job.max_retries(), &reason, &mut rng);

        match decision {
            RetryDecision::GiveUp => {
                job.transition(JobState::Exhausted)?;
                self.eligible_at.remove(&job.id());
                self.counters.exhausted += 1;
                warn!(
                    job_id = %job.id(),
                    attempt,
                    max_retries = job.max_retries(),
                    code = %reason.code,
                    retriable = reason.is_retriable(),
                    "job exhausted"
                );
                Ok(vec![Event::Failed, Event::Exhausted])
            }
            RetryDecision::RetryImmediately | RetryDecision::RetryAfter(_) => {
                job.transition(JobState::Retrying)?;
                let delay = decision.delay().unwrap_or_default();
                let finished_at = execution.finished_at().unwrap_or_else(Utc::now);
                self.eligible_at.insert(job.id(), eligible_after(finished_at, delay));
                self.counters.retries += 1;
                info!(
                    job_id = %job.id(),
                    attempt,
                    code = %reason.code,
                    delay_ms = delay.as_millis() as u64,
                    "retry scheduled"
                );
                Ok(vec![Event::Failed, Event::Retried(attempt + 1)])
            }
        }
    }

    /// Remaining wait before a retrying job may run again, if any.
    fn retry_wait(&mut self, job: &Job) -> Option<Duration> {
        if job.state() != JobState::Retrying {
            return None;
        }
        let eligible = match self.eligible_at.get(&job.id()) {
            Some(at) => *at,
            None => {
                let at = self.recompute_eligibility(job)?;
                self.eligible_at.insert(job.id(), at);
                at
            }
        };
        (eligible - Utc::now()).to_std().ok().filter(|d| !d.is_zero())
    }

    /// Eligibility from stored history; the seeded jitter reproduces the
    /// delay chosen when the retry was first scheduled.
    fn recompute_eligibility(&self, job: &Job) -> Option<DateTime<Utc>> {
        let history = match self.repository.load_execution_history(job.id()) {
            Ok(history) => history,
            Err(e) => {
                warn!(job_id = %job.id(), error = %e, "failed to load execution history");
                return None;
            }
        };
        let last = history.iter().rev().find(|e| e.is_finished())?;
        let reason = last.error()?;
        let mut rng = self.config.jitter_seed().rng_for(job.id(), last.attempt());
        let delay = self
            .config
            .retry()
            .decide(last.attempt(), job.max_retries(), reason, &mut rng)
            .delay()
            .unwrap_or_default();
        Some(eligible_after(last.finished_at()?, delay))
    }

    fn persist(&mut self, job: Job, execution: Option<Execution>, events: Vec<Event>) -> Result<(), OrchestratorError> {
        self.unpersisted.push_back(Transition { job, execution, events });
        self.flush()
    }

    pub(crate) fn flush_pending(&mut self) -> Result<(), OrchestratorError> {
        self.flush()
    }

    /// Persist held-back transitions in order; notify observers for each.
    fn flush(&mut self) -> Result<(), OrchestratorError> {
        while let Some(transition) = self.unpersisted.front() {
            if let Err(source) = self
                .repository
                .save_job_transition(&transition.job, transition.execution.as_ref())
            {
                error!(
                    job_id = %transition.job.id(),
                    state = %transition.job.state(),
                    held_back = self.unpersisted.len(),
                    error = %source,
                    "failed to persist job transition"
                );
                return Err(OrchestratorError::Persistence {
                    job_id: transition.job.id(),
                    source,
                });
            }
            if let Some(transition) = self.unpersisted.pop_front() {
                self.notify(&transition);
            }
        }
        Ok(())
    }

    fn notify(&self, transition: &Transition) {
        let job = &transition.job;
        for event in &transition.events {
            let lifecycle = match (event, transition.execution.as_ref()) {
                (Event::Started, _) => LifecycleEvent::Started(job),
                (Event::Completed, Some(execution)) => LifecycleEvent::Completed(job, execution),
                (Event::Failed, Some(execution)) => LifecycleEvent::Failed(job, execution),
                (Event::Retried(attempt), _) => LifecycleEvent::Retried(job, *attempt),
                (Event::Exhausted, _) => LifecycleEvent::Exhausted(job),
                (Event::Cancelled, _) => LifecycleEvent::Cancelled(job),
                (Event::Completed | Event::Failed, None) => continue,
            };
            self.observers.notify(lifecycle);
        }
    }
}

fn eligible_after(finished_at: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    finished_at + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero())
}

fn earliest(current: Option<Duration>, candidate: Duration) -> Option<Duration> {
    Some(current.map_or(candidate, |c| c.min(candidate)))
}

impl<R: JobRepository> Drop for Orchestrator<R> {
    fn drop(&mut self) {
        self.pool.close();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use serde_json::{Value, json};

    use super::*;
    use crate::config::ConfigOptions;
    use crate::registry::TaskError;
    use crate::repository::InMemoryJobRepository;

    fn fast_config() -> OrchestratorConfig {
        OrchestratorConfig::from_options(ConfigOptions {
            base_delay_ms: 5,
            backoff_cap_ms: 50,
            jitter: 0.0,
            poll_interval_ms: 5,
            ..ConfigOptions::default()
        })
        .unwrap()
    }

    fn orchestrator(registry: TaskRegistry) -> Orchestrator<Arc<InMemoryJobRepository>> {
        Orchestrator::new(
            InMemoryJobRepository::arc(),
            Arc::new(registry),
            ObserverRegistry::new(),
            fast_config(),
        )
        .unwrap()
    }

    fn echo_registry() -> TaskRegistry {
        let mut registry = TaskRegistry::new();
        registry.register_blocking("echo", |input, _| Ok(input));
        registry
    }

    #[tokio::test]
    async fn duplicate_active_name_is_rejected() {
        let mut orch = orchestrator(echo_registry());
        orch.submit(JobDefinition::new("nightly", "echo", StrategyKind::Thread))
            .unwrap();
        let err = orch
            .submit(JobDefinition::new("nightly", "echo", StrategyKind::Thread))
            .unwrap_err();
        assert!(matches!(err, SubmitError::DuplicateName(name) if name == "nightly"));
    }

    #[tokio::test]
    async fn invalid_definition_never_enters_state_machine() {
        let mut orch = orchestrator(echo_registry());
        let err = orch
            .submit(JobDefinition::new("", "echo", StrategyKind::Thread))
            .unwrap_err();
        assert!(matches!(err, SubmitError::Invalid(_)));
        assert_eq!(orch.repository().stats().unwrap().pending, 0);
    }

    #[tokio::test]
    async fn idempotency_key_returns_existing_job() {
        let mut orch = orchestrator(echo_registry());
        let def = JobDefinition::new("keyed", "echo", StrategyKind::Thread).with_idempotency_key("abc");
        let first = orch.submit(def.clone()).unwrap();
        let second = orch.submit(def).unwrap();
        assert_eq!(first.id(), second.id());
    }

    #[tokio::test]
    async fn successful_job_records_one_execution() {
        let mut orch = orchestrator(echo_registry());
        let job = orch
            .submit(JobDefinition::new("one", "echo", StrategyKind::Thread).with_input(json!({"x": 1})))
            .unwrap();

        orch.run_until_idle().await.unwrap();

        let stored = orch.repository().get_job(job.id()).unwrap().unwrap();
        assert_eq!(stored.state(), JobState::Succeeded);
        let history = orch.repository().load_execution_history(job.id()).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].payload(), Some(&json!({"x": 1})));
    }

    #[tokio::test]
    async fn retries_until_success_with_gapless_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let seen = calls.clone();
        let mut registry = TaskRegistry::new();
        registry.register_blocking("flaky", move |_, _| {
            if seen.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(TaskError::retriable("not yet"))
            } else {
                Ok(Value::Bool(true))
            }
        });
        let mut orch = orchestrator(registry);
        let job = orch
            .submit(JobDefinition::new("flaky", "flaky", StrategyKind::Thread).with_max_retries(2))
            .unwrap();

        orch.run_until_idle().await.unwrap();

        let history = orch.repository().load_execution_history(job.id()).unwrap();
        let attempts: Vec<_> = history.iter().map(Execution::attempt).collect();
        assert_eq!(attempts, vec![1, 2, 3]);
        assert_eq!(history[2].outcome(), Outcome::Success);
        assert_eq!(
            orch.repository().get_job(job.id()).unwrap().unwrap().state(),
            JobState::Succeeded
        );
        assert_eq!(orch.stats().retries_scheduled, 2);
    }

    #[tokio::test]
    async fn non_retriable_failure_exhausts_immediately() {
        let mut registry = TaskRegistry::new();
        registry.register_blocking("bad", |_, _| Err(TaskError::permanent("malformed input")));
        let mut orch = orchestrator(registry);
        let job = orch
            .submit(JobDefinition::new("bad", "bad", StrategyKind::Thread).with_max_retries(5))
            .unwrap();

        orch.run_until_idle().await.unwrap();

        let stored = orch.repository().get_job(job.id()).unwrap().unwrap();
        assert_eq!(stored.state(), JobState::Exhausted);
        assert_eq!(stored.attempts(), 1);
        assert!(!stored.last_failure().unwrap().is_retriable());
    }

    #[tokio::test]
    async fn cancel_pending_job_creates_no_execution() {
        let mut orch = orchestrator(echo_registry());
        let job = orch
            .submit(JobDefinition::new("later", "echo", StrategyKind::Thread))
            .unwrap();

        assert_eq!(orch.cancel(job.id()).unwrap(), CancelOutcome::Cancelled);
        orch.run_until_idle().await.unwrap();

        assert_eq!(
            orch.repository().get_job(job.id()).unwrap().unwrap().state(),
            JobState::Cancelled
        );
        assert!(orch.repository().load_execution_history(job.id()).unwrap().is_empty());
        assert_eq!(
            orch.cancel(job.id()).unwrap(),
            CancelOutcome::AlreadyTerminal(JobState::Cancelled)
        );
    }

    #[tokio::test]
    async fn cancel_running_job_stops_retries() {
        let mut registry = TaskRegistry::new();
        registry.register_cooperative("wait", |_, ctx| async move {
            ctx.sleep(Duration::from_secs(30)).await?;
            Ok(Value::Null)
        });
        let mut orch = orchestrator(registry);
        let job = orch
            .submit(JobDefinition::new("wait", "wait", StrategyKind::Cooperative).with_max_retries(3))
            .unwrap();

        let report = orch.run_cycle().unwrap();
        assert_eq!(report.dispatched, 1);
        assert_eq!(orch.cancel(job.id()).unwrap(), CancelOutcome::Requested);
        orch.run_until_idle().await.unwrap();

        let stored = orch.repository().get_job(job.id()).unwrap().unwrap();
        assert_eq!(stored.state(), JobState::Cancelled);
        assert_eq!(stored.attempts(), 1);
        let history = orch.repository().load_execution_history(job.id()).unwrap();
        assert_eq!(history[0].outcome(), Outcome::Cancelled);
    }

    #[tokio::test]
    async fn unknown_job_cannot_be_cancelled() {
        let mut orch = orchestrator(echo_registry());
        assert!(matches!(orch.cancel(JobId::new()), Err(OrchestratorError::NotFound(_))));
    }

    #[tokio::test]
    async fn recover_retries_interrupted_attempt() {
        let repository = InMemoryJobRepository::arc();
        let mut crashed = Job::create(
            JobDefinition::new("crashed", "echo", StrategyKind::Thread).with_max_retries(1),
            None,
        )
        .unwrap();
        repository.insert_job(&crashed).unwrap();
        let attempt = crashed.begin_attempt().unwrap();
        let dangling = Execution::start(crashed.id(), attempt, StrategyKind::Thread);
        repository.save_job_transition(&crashed, Some(&dangling)).unwrap();

        let mut orch = Orchestrator::new(
            repository.clone(),
            Arc::new(echo_registry()),
            ObserverRegistry::new(),
            fast_config(),
        )
        .unwrap();
        let report = orch.recover().unwrap();
        assert_eq!(report, RecoveryReport { retried: 1, exhausted: 0 });

        orch.run_until_idle().await.unwrap();

        let history = repository.load_execution_history(crashed.id()).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].error().unwrap().code, FailureCode::Interrupted);
        assert_eq!(history[1].outcome(), Outcome::Success);
    }

    #[test]
    fn eligibility_adds_delay_to_finish_time() {
        let finished = Utc::now();
        let at = eligible_after(finished, Duration::from_millis(1500));
        assert_eq!((at - finished).num_milliseconds(), 1500);
    }
}
