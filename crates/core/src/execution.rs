//! Execution records: one attempt to run a job.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};
use crate::id::JobId;
use crate::job::StrategyKind;

/// How an execution ended (or `Running` while in flight).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Running,
    Success,
    Failure,
    Timeout,
    Cancelled,
}

impl Outcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Outcome::Running => "running",
            Outcome::Success => "success",
            Outcome::Failure => "failure",
            Outcome::Timeout => "timeout",
            Outcome::Cancelled => "cancelled",
        }
    }

    /// Outcomes that feed the retry policy.
    pub fn is_failure(self) -> bool {
        matches!(self, Outcome::Failure | Outcome::Timeout)
    }
}

impl core::fmt::Display for Outcome {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether retrying can help.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    /// Transient: timeouts, resource exhaustion, flaky dependencies.
    Retriable,
    /// Definitional: bad input, unknown task, malformed output.
    NonRetriable,
}

/// Machine-readable failure reason.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCode {
    /// The unit of work reported an error.
    Application,
    Timeout,
    Cancelled,
    /// No capacity to start the work (thread spawn, worker unavailable).
    ResourceExhausted,
    /// The child process could not be started.
    Spawn,
    /// Output crossing the process boundary could not be decoded.
    Deserialization,
    Panic,
    /// The task reference does not resolve for the job's strategy.
    UnknownTask,
    /// The orchestrator stopped while the attempt was running.
    Interrupted,
    /// The child process wrote more output than the executor accepts.
    OutputLimit,
}

impl FailureCode {
    pub fn default_class(self) -> FailureClass {
        match self {
            FailureCode::Application
            | FailureCode::Timeout
            | FailureCode::Cancelled
            | FailureCode::ResourceExhausted
            | FailureCode::Panic
            | FailureCode::Interrupted => FailureClass::Retriable,
            FailureCode::Spawn
            | FailureCode::Deserialization
            | FailureCode::UnknownTask
            | FailureCode::OutputLimit => FailureClass::NonRetriable,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FailureCode::Application => "application",
            FailureCode::Timeout => "timeout",
            FailureCode::Cancelled => "cancelled",
            FailureCode::ResourceExhausted => "resource_exhausted",
            FailureCode::Spawn => "spawn",
            FailureCode::Deserialization => "deserialization",
            FailureCode::Panic => "panic",
            FailureCode::UnknownTask => "unknown_task",
            FailureCode::Interrupted => "interrupted",
            FailureCode::OutputLimit => "output_limit",
        }
    }
}

impl core::fmt::Display for FailureCode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classified failure carried on an execution and on its job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureReason {
    pub code: FailureCode,
    pub class: FailureClass,
    pub message: String,
}

impl FailureReason {
    /// Failure with the code's default classification.
    pub fn new(code: FailureCode, message: impl Into<String>) -> Self {
        Self {
            code,
            class: code.default_class(),
            message: message.into(),
        }
    }

    pub fn with_class(mut self, class: FailureClass) -> Self {
        self.class = class;
        self
    }

    pub fn is_retriable(&self) -> bool {
        self.class == FailureClass::Retriable
    }
}

impl core::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

/// One attempt to run a job.
///
/// Created when the attempt is admitted and finalized exactly once by the
/// executor invocation that created it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Execution {
    job_id: JobId,
    attempt: u32,
    strategy: StrategyKind,
    started_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
    outcome: Outcome,
    payload: Option<serde_json::Value>,
    error: Option<FailureReason>,
    duration_ms: Option<u64>,
}

impl Execution {
    /// Open a running execution.
    pub fn start(job_id: JobId, attempt: u32, strategy: StrategyKind) -> Self {
        Self {
            job_id,
            attempt,
            strategy,
            started_at: Utc::now(),
            finished_at: None,
            outcome: Outcome::Running,
            payload: None,
            error: None,
            duration_ms: None,
        }
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    /// 1-based, strictly increasing per job.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn strategy(&self) -> StrategyKind {
        self.strategy
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.finished_at
    }

    pub fn outcome(&self) -> Outcome {
        self.outcome
    }

    pub fn payload(&self) -> Option<&serde_json::Value> {
        self.payload.as_ref()
    }

    pub fn error(&self) -> Option<&FailureReason> {
        self.error.as_ref()
    }

    pub fn duration_ms(&self) -> Option<u64> {
        self.duration_ms
    }

    pub fn is_finished(&self) -> bool {
        self.outcome != Outcome::Running
    }

    pub fn succeed(&mut self, payload: serde_json::Value) -> DomainResult<()> {
        self.finalize(Outcome::Success, Some(payload), None)
    }

    /// Record a failure. Timeout and cancellation codes map to their own outcomes.
    pub fn fail(&mut self, reason: FailureReason) -> DomainResult<()> {
        let outcome = match reason.code {
            FailureCode::Timeout => Outcome::Timeout,
            FailureCode::Cancelled => Outcome::Cancelled,
            _ => Outcome::Failure,
        };
        self.finalize(outcome, None, Some(reason))
    }

    fn finalize(
        &mut self,
        outcome: Outcome,
        payload: Option<serde_json::Value>,
        error: Option<FailureReason>,
    ) -> DomainResult<()> {
        if self.is_finished() {
            return Err(DomainError::invariant(format!(
                "execution {}#{} already finalized as {}",
                self.job_id, self.attempt, self.outcome
            )));
        }
        let now = Utc::now();
        self.outcome = outcome;
        self.payload = payload;
        self.error = error;
        self.finished_at = Some(now);
        self.duration_ms = Some((now - self.started_at).num_milliseconds().max(0) as u64);
        Ok(())
    }
}

impl crate::entity::Entity for Execution {
    type Id = (JobId, u32);

    fn id(&self) -> (JobId, u32) {
        (self.job_id, self.attempt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finalizes_exactly_once() {
        let mut exec = Execution::start(JobId::new(), 1, StrategyKind::Cooperative);
        assert!(!exec.is_finished());
        exec.succeed(serde_json::json!({"rows": 3})).unwrap();
        assert_eq!(exec.outcome(), Outcome::Success);
        assert!(exec.finished_at().is_some());
        assert!(exec.duration_ms().is_some());

        let err = exec
            .fail(FailureReason::new(FailureCode::Application, "late"))
            .unwrap_err();
        assert!(matches!(err, DomainError::InvariantViolation(_)));
        assert_eq!(exec.outcome(), Outcome::Success);
    }

    #[test]
    fn failure_codes_pick_outcomes() {
        let mut exec = Execution::start(JobId::new(), 2, StrategyKind::Process);
        exec.fail(FailureReason::new(FailureCode::Timeout, "exceeded 100ms"))
            .unwrap();
        assert_eq!(exec.outcome(), Outcome::Timeout);
        assert!(exec.outcome().is_failure());

        let mut exec = Execution::start(JobId::new(), 1, StrategyKind::Thread);
        exec.fail(FailureReason::new(FailureCode::Cancelled, "requested"))
            .unwrap();
        assert_eq!(exec.outcome(), Outcome::Cancelled);
        assert!(!exec.outcome().is_failure());
    }

    #[test]
    fn classification_defaults_and_overrides() {
        assert!(FailureReason::new(FailureCode::Timeout, "").is_retriable());
        assert!(!FailureReason::new(FailureCode::Deserialization, "").is_retriable());
        let permanent = FailureReason::new(FailureCode::Application, "bad input")
            .with_class(FailureClass::NonRetriable);
        assert!(!permanent.is_retriable());
        assert_eq!(permanent.to_string(), "application: bad input");
    }
}
