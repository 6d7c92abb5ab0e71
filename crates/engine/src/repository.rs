//! Repository contract and an in-memory implementation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::Serialize;

use taskforge_core::{Entity, Execution, Job, JobId, JobState};

/// Persistence the engine relies on.
///
/// `save_job_transition` must be durable before it returns `Ok`: the
/// orchestrator schedules the next attempt only after that.
pub trait JobRepository: Send + Sync {
    /// Persist a newly submitted job.
    fn insert_job(&self, job: &Job) -> Result<(), RepositoryError>;

    /// Get a job by ID.
    fn get_job(&self, job_id: JobId) -> Result<Option<Job>, RepositoryError>;

    /// Find the job created with `key`, if any.
    fn find_by_idempotency_key(&self, key: &str) -> Result<Option<Job>, RepositoryError>;

    /// Find the non-terminal job holding `name`, if any.
    fn find_active_by_name(&self, name: &str) -> Result<Option<Job>, RepositoryError>;

    /// Pending and retrying jobs, oldest first.
    fn load_ready_jobs(&self) -> Result<Vec<Job>, RepositoryError>;

    /// Jobs left in `running`, i.e. interrupted by a crash.
    fn load_running_jobs(&self) -> Result<Vec<Job>, RepositoryError>;

    /// Persist a job's new state together with the execution that caused it.
    /// A job already stored in a terminal state must not be moved out of it.
    fn save_job_transition(&self, job: &Job, execution: Option<&Execution>) -> Result<(), RepositoryError>;

    /// Executions of a job ordered by attempt number.
    fn load_execution_history(&self, job_id: JobId) -> Result<Vec<Execution>, RepositoryError>;

    /// List jobs, optionally filtered by state, oldest first.
    fn list_jobs(&self, state: Option<JobState>, limit: usize) -> Result<Vec<Job>, RepositoryError>;

    /// Job counts per state.
    fn stats(&self) -> Result<JobStats, RepositoryError>;
}

/// Repository error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RepositoryError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("job already exists: {0}")]
    AlreadyExists(JobId),
    #[error("job name already in use: {0}")]
    NameTaken(String),
    #[error("job {job_id} is already {state}")]
    TerminalState { job_id: JobId, state: JobState },
    #[error("storage error: {0}")]
    Storage(String),
}

/// Job statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct JobStats {
    pub pending: usize,
    pub running: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub retrying: usize,
    pub cancelled: usize,
    pub exhausted: usize,
}

impl JobStats {
    fn count(&mut self, state: JobState) {
        match state {
            JobState::Pending => self.pending += 1,
            JobState::Running => self.running += 1,
            JobState::Succeeded => self.succeeded += 1,
            JobState::Failed => self.failed += 1,
            JobState::Retrying => self.retrying += 1,
            JobState::Cancelled => self.cancelled += 1,
            JobState::Exhausted => self.exhausted += 1,
        }
    }
}

/// In-memory repository for tests/dev.
///
/// `set_unavailable(true)` makes every call fail with a storage error, to
/// exercise the engine's handling of an unreachable store.
#[derive(Debug, Default)]
pub struct InMemoryJobRepository {
    jobs: RwLock<HashMap<JobId, Job>>,
    executions: RwLock<HashMap<JobId, Vec<Execution>>>,
    unavailable: AtomicBool,
}

impl InMemoryJobRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), RepositoryError> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(RepositoryError::Storage("repository unavailable".to_string()))
        } else {
            Ok(())
        }
    }

    fn jobs(&self) -> Result<RwLockReadGuard<'_, HashMap<JobId, Job>>, RepositoryError> {
        self.check_available()?;
        self.jobs.read().map_err(|e| RepositoryError::Storage(e.to_string()))
    }

    fn jobs_mut(&self) -> Result<RwLockWriteGuard<'_, HashMap<JobId, Job>>, RepositoryError> {
        self.check_available()?;
        self.jobs.write().map_err(|e| RepositoryError::Storage(e.to_string()))
    }

    fn executions_mut(
        &self,
    ) -> Result<RwLockWriteGuard<'_, HashMap<JobId, Vec<Execution>>>, RepositoryError> {
        self.executions.write().map_err(|e| RepositoryError::Storage(e.to_string()))
    }

    fn filtered(&self, keep: impl Fn(&Job) -> bool) -> Result<Vec<Job>, RepositoryError> {
        let jobs = self.jobs()?;
        let mut result: Vec<_> = jobs.values().filter(|j| keep(j)).cloned().collect();
        result.sort_by_key(|j| (j.created_at(), j.id()));
        Ok(result)
    }
}

impl JobRepository for InMemoryJobRepository {
    fn insert_job(&self, job: &Job) -> Result<(), RepositoryError> {
        let mut jobs = self.jobs_mut()?;
        if jobs.contains_key(&job.id()) {
            return Err(RepositoryError::AlreadyExists(job.id()));
        }
        if jobs.values().any(|j| !j.is_terminal() && j.name() == job.name()) {
            return Err(RepositoryError::NameTaken(job.name().to_string()));
        }
        jobs.insert(job.id(), job.clone());
        Ok(())
    }

    fn get_job(&self, job_id: JobId) -> Result<Option<Job>, RepositoryError> {
        Ok(self.jobs()?.get(&job_id).cloned())
    }

    fn find_by_idempotency_key(&self, key: &str) -> Result<Option<Job>, RepositoryError> {
        Ok(self.filtered(|j| j.idempotency_key() == Some(key))?.into_iter().next())
    }

    fn find_active_by_name(&self, name: &str) -> Result<Option<Job>, RepositoryError> {
        Ok(self
            .filtered(|j| !j.is_terminal() && j.name() == name)?
            .into_iter()
            .next())
    }

    fn load_ready_jobs(&self) -> Result<Vec<Job>, RepositoryError> {
        self.filtered(|j| j.state().is_ready())
    }

    fn load_running_jobs(&self) -> Result<Vec<Job>, RepositoryError> {
        self.filtered(|j| j.state() == JobState::Running)
    }

    fn save_job_transition(&self, job: &Job, execution: Option<&Execution>) -> Result<(), RepositoryError> {
        let mut jobs = self.jobs_mut()?;
        let stored = jobs.get(&job.id()).ok_or(RepositoryError::NotFound(job.id()))?;
        if stored.is_terminal() && stored.state() != job.state() {
            return Err(RepositoryError::TerminalState {
                job_id: job.id(),
                state: stored.state(),
            });
        }
        if let Some(execution) = execution {
            let mut executions = self.executions_mut()?;
            let history = executions.entry(job.id()).or_default();
            match history.iter_mut().find(|e| e.id() == execution.id()) {
                Some(existing) => *existing = execution.clone(),
                None => {
                    history.push(execution.clone());
                    history.sort_by_key(|e| e.attempt());
                }
            }
        }
        jobs.insert(job.id(), job.clone());
        Ok(())
    }

    fn load_execution_history(&self, job_id: JobId) -> Result<Vec<Execution>, RepositoryError> {
        self.check_available()?;
        let executions = self
            .executions
            .read()
            .map_err(|e| RepositoryError::Storage(e.to_string()))?;
        Ok(executions.get(&job_id).cloned().unwrap_or_default())
    }

    fn list_jobs(&self, state: Option<JobState>, limit: usize) -> Result<Vec<Job>, RepositoryError> {
        let mut result = self.filtered(|j| state.is_none_or(|s| j.state() == s))?;
        result.truncate(limit);
        Ok(result)
    }

    fn stats(&self) -> Result<JobStats, RepositoryError> {
        let jobs = self.jobs()?;
        let mut stats = JobStats::default();
        for job in jobs.values() {
            stats.count(job.state());
        }
        Ok(stats)
    }
}

impl<R: JobRepository + ?Sized> JobRepository for Arc<R> {
    fn insert_job(&self, job: &Job) -> Result<(), RepositoryError> {
        (**self).insert_job(job)
    }

    fn get_job(&self, job_id: JobId) -> Result<Option<Job>, RepositoryError> {
        (**self).get_job(job_id)
    }

    fn find_by_idempotency_key(&self, key: &str) -> Result<Option<Job>, RepositoryError> {
        (**self).find_by_idempotency_key(key)
    }

    fn find_active_by_name(&self, name: &str) -> Result<Option<Job>, RepositoryError> {
        (**self).find_active_by_name(name)
    }

    fn load_ready_jobs(&self) -> Result<Vec<Job>, RepositoryError> {
        (**self).load_ready_jobs()
    }

    fn load_running_jobs(&self) -> Result<Vec<Job>, RepositoryError> {
        (**self).load_running_jobs()
    }

    fn save_job_transition(&self, job: &Job, execution: Option<&Execution>) -> Result<(), RepositoryError> {
        (**self).save_job_transition(job, execution)
    }

    fn load_execution_history(&self, job_id: JobId) -> Result<Vec<Execution>, RepositoryError> {
        (**self).load_execution_history(job_id)
    }

    fn list_jobs(&self, state: Option<JobState>, limit: usize) -> Result<Vec<Job>, RepositoryError> {
        (**self).list_jobs(state, limit)
    }

    fn stats(&self) -> Result<JobStats, RepositoryError> {
        (**self).stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use taskforge_core::{FailureCode, FailureReason, JobDefinition, StrategyKind};

    fn job(name: &str) -> Job {
        Job::create(JobDefinition::new(name, "task", StrategyKind::Thread), None).unwrap()
    }

    #[test]
    fn insert_and_load_ready_in_creation_order() {
        let repo = InMemoryJobRepository::new();
        let first = job("first");
        let second = job("second");
        repo.insert_job(&second).unwrap();
        repo.insert_job(&first).unwrap();

        let ready: Vec<_> = repo.load_ready_jobs().unwrap().iter().map(Job::id).collect();
        assert_eq!(ready, vec![first.id(), second.id()]);
    }

    #[test]
    fn active_name_must_be_unique() {
        let repo = InMemoryJobRepository::new();
        repo.insert_job(&job("nightly")).unwrap();
        assert_eq!(
            repo.insert_job(&job("nightly")).unwrap_err(),
            RepositoryError::NameTaken("nightly".to_string())
        );
    }

    #[test]
    fn terminal_job_frees_its_name() {
        let repo = InMemoryJobRepository::new();
        let mut done = job("nightly");
        repo.insert_job(&done).unwrap();
        done.transition(JobState::Cancelled).unwrap();
        repo.save_job_transition(&done, None).unwrap();

        repo.insert_job(&job("nightly")).unwrap();
        assert!(repo.find_active_by_name("nightly").unwrap().is_some());
    }

    #[test]
    fn terminal_job_cannot_be_overwritten() {
        let repo = InMemoryJobRepository::new();
        let mut job = job("finished");
        repo.insert_job(&job).unwrap();
        let stale = job.clone();
        job.transition(JobState::Cancelled).unwrap();
        repo.save_job_transition(&job, None).unwrap();
        repo.save_job_transition(&job, None).unwrap();

        let mut racing = stale;
        racing.begin_attempt().unwrap();
        assert_eq!(
            repo.save_job_transition(&racing, None).unwrap_err(),
            RepositoryError::TerminalState {
                job_id: job.id(),
                state: JobState::Cancelled
            }
        );
        assert_eq!(repo.get_job(job.id()).unwrap().unwrap().state(), JobState::Cancelled);
    }

    #[test]
    fn transition_upserts_execution_by_attempt() {
        let repo = InMemoryJobRepository::new();
        let mut job = job("retrying");
        repo.insert_job(&job).unwrap();

        let attempt = job.begin_attempt().unwrap();
        let mut execution = Execution::start(job.id(), attempt, job.strategy());
        repo.save_job_transition(&job, Some(&execution)).unwrap();

        execution
            .fail(FailureReason::new(FailureCode::Application, "boom"))
            .unwrap();
        job.record_failure(execution.error().cloned().unwrap()).unwrap();
        repo.save_job_transition(&job, Some(&execution)).unwrap();

        let history = repo.load_execution_history(job.id()).unwrap();
        assert_eq!(history.len(), 1);
        assert!(history[0].is_finished());
        assert_eq!(repo.get_job(job.id()).unwrap().unwrap().state(), JobState::Failed);
    }

    #[test]
    fn unavailable_repository_fails_every_call() {
        let repo = InMemoryJobRepository::new();
        let job = job("a");
        repo.insert_job(&job).unwrap();
        repo.set_unavailable(true);

        assert!(matches!(repo.load_ready_jobs(), Err(RepositoryError::Storage(_))));
        assert!(matches!(
            repo.save_job_transition(&job, None),
            Err(RepositoryError::Storage(_))
        ));

        repo.set_unavailable(false);
        assert_eq!(repo.load_ready_jobs().unwrap().len(), 1);
    }

    #[test]
    fn stats_and_listing_by_state() {
        let repo = InMemoryJobRepository::new();
        for i in 0..4 {
            repo.insert_job(&job(&format!("job-{i}"))).unwrap();
        }
        let mut running = repo.load_ready_jobs().unwrap().remove(0);
        running.begin_attempt().unwrap();
        repo.save_job_transition(&running, None).unwrap();

        let stats = repo.stats().unwrap();
        assert_eq!((stats.pending, stats.running), (3, 1));
        assert_eq!(repo.list_jobs(Some(JobState::Pending), 2).unwrap().len(), 2);
        assert_eq!(repo.load_running_jobs().unwrap()[0].id(), running.id());
    }

    #[test]
    fn idempotency_key_lookup() {
        let repo = InMemoryJobRepository::new();
        let keyed = Job::create(
            JobDefinition::new("keyed", "task", StrategyKind::Process).with_idempotency_key("k-1"),
            None,
        )
        .unwrap();
        repo.insert_job(&keyed).unwrap();

        assert_eq!(repo.find_by_idempotency_key("k-1").unwrap().unwrap().id(), keyed.id());
        assert!(repo.find_by_idempotency_key("k-2").unwrap().is_none());
    }
}
