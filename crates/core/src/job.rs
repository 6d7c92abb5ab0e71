//! Job definitions and the persisted job record.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult, TransitionError};
use crate::execution::FailureReason;
use crate::id::JobId;
use crate::state::JobState;

/// Concurrency model a job runs under. The set is closed.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    /// Suspension-aware unit of work multiplexed on one logical worker.
    Cooperative,
    /// Blocking unit of work on a dedicated OS thread.
    Thread,
    /// Child process with serialized input/output.
    Process,
}

impl StrategyKind {
    pub const ALL: [StrategyKind; 3] = [
        StrategyKind::Cooperative,
        StrategyKind::Thread,
        StrategyKind::Process,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            StrategyKind::Cooperative => "cooperative",
            StrategyKind::Thread => "thread",
            StrategyKind::Process => "process",
        }
    }
}

impl core::fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for StrategyKind {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cooperative" | "async" => Ok(StrategyKind::Cooperative),
            "thread" => Ok(StrategyKind::Thread),
            "process" => Ok(StrategyKind::Process),
            other => Err(DomainError::validation(format!("invalid strategy: {other}"))),
        }
    }
}

/// Reference to an executable unit of work.
///
/// Opaque to the domain; resolved to a callable by the engine's task registry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskRef(String);

impl TaskRef {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for TaskRef {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TaskRef {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// What a caller submits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDefinition {
    pub name: String,
    pub task: TaskRef,
    /// JSON input handed to the unit of work on every attempt.
    #[serde(default)]
    pub input: serde_json::Value,
    pub strategy: StrategyKind,
    #[serde(default)]
    pub max_retries: u32,
    #[serde(default)]
    pub timeout: Option<Duration>,
    /// Submissions sharing a key resolve to the same job.
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

impl JobDefinition {
    pub fn new(name: impl Into<String>, task: impl Into<TaskRef>, strategy: StrategyKind) -> Self {
        Self {
            name: name.into(),
            task: task.into(),
            input: serde_json::Value::Null,
            strategy,
            max_retries: 0,
            timeout: None,
            idempotency_key: None,
        }
    }

    pub fn with_input(mut self, input: serde_json::Value) -> Self {
        self.input = input;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    /// Reject definitions that can never run.
    pub fn validate(&self) -> DomainResult<()> {
        if self.name.trim().is_empty() {
            return Err(DomainError::validation("job name must not be empty"));
        }
        if self.task.as_str().trim().is_empty() {
            return Err(DomainError::validation("task reference must not be empty"));
        }
        if self.timeout == Some(Duration::ZERO) {
            return Err(DomainError::validation("timeout must be greater than zero"));
        }
        if matches!(&self.idempotency_key, Some(k) if k.trim().is_empty()) {
            return Err(DomainError::validation("idempotency key must not be blank"));
        }
        Ok(())
    }
}

/// A schedulable unit of work and its lifecycle state.
///
/// Only the orchestrator mutates a job once it has been created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    id: JobId,
    #[serde(flatten)]
    definition: JobDefinition,
    state: JobState,
    /// Number of executions started so far (the last attempt number).
    attempts: u32,
    last_failure: Option<FailureReason>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl Job {
    /// Create a pending job from a validated definition.
    ///
    /// `default_timeout` applies when the definition carries none.
    pub fn create(mut definition: JobDefinition, default_timeout: Option<Duration>) -> DomainResult<Self> {
        definition.validate()?;
        if definition.timeout.is_none() {
            definition.timeout = default_timeout;
        }
        let now = Utc::now();
        Ok(Self {
            id: JobId::new(),
            definition,
            state: JobState::Pending,
            attempts: 0,
            last_failure: None,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.definition.name
    }

    pub fn task(&self) -> &TaskRef {
        &self.definition.task
    }

    pub fn input(&self) -> &serde_json::Value {
        &self.definition.input
    }

    pub fn strategy(&self) -> StrategyKind {
        self.definition.strategy
    }

    pub fn max_retries(&self) -> u32 {
        self.definition.max_retries
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.definition.timeout
    }

    pub fn idempotency_key(&self) -> Option<&str> {
        self.definition.idempotency_key.as_deref()
    }

    pub fn definition(&self) -> &JobDefinition {
        &self.definition
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn last_failure(&self) -> Option<&FailureReason> {
        self.last_failure.as_ref()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Move to `next`, enforcing the state machine.
    pub fn transition(&mut self, next: JobState) -> Result<(), TransitionError> {
        self.state = self.state.transition(next)?;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Enter `running` for a new attempt and return its 1-based number.
    pub fn begin_attempt(&mut self) -> Result<u32, TransitionError> {
        self.transition(JobState::Running)?;
        self.attempts += 1;
        Ok(self.attempts)
    }

    /// Enter `failed`, remembering why.
    pub fn record_failure(&mut self, reason: FailureReason) -> Result<(), TransitionError> {
        self.transition(JobState::Failed)?;
        self.last_failure = Some(reason);
        Ok(())
    }
}

impl crate::entity::Entity for Job {
    type Id = JobId;

    fn id(&self) -> JobId {
        self.id
    }
}
