//! `taskforge-core`: domain building blocks of the task orchestrator.
//!
//! This crate contains **pure domain** types (no IO, no async): job and
//! execution records, the job state machine and the retry policy.

pub mod entity;
pub mod error;
pub mod execution;
pub mod id;
pub mod job;
pub mod retry;
pub mod state;

pub use entity::Entity;
pub use error::{DomainError, DomainResult, TransitionError};
pub use execution::{Execution, FailureClass, FailureCode, FailureReason, Outcome};
pub use id::JobId;
pub use job::{Job, JobDefinition, StrategyKind, TaskRef};
pub use retry::{JitterSeed, RetryDecision, RetryPolicy};
pub use state::JobState;
