//! Job lifecycle state machine.
//!
//! ```text
//! pending ──► running ──► succeeded
//!    │          │  └────► cancelled
//!    │          ▼
//!    │        failed ──► exhausted
//!    │          │
//!    │          ▼
//!    │       retrying ──► running (next attempt)
//!    │          │
//!    └──────────┴───────► cancelled
//! ```
//!
//! `failed` is transient: the orchestrator re-evaluates it through the retry
//! policy in the same step that records the failure.

use serde::{Deserialize, Serialize};

use crate::error::TransitionError;

/// Lifecycle state of a job.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Running,
    Succeeded,
    Failed,
    Retrying,
    Cancelled,
    Exhausted,
}

impl JobState {
    pub const ALL: [JobState; 7] = [
        JobState::Pending,
        JobState::Running,
        JobState::Succeeded,
        JobState::Failed,
        JobState::Retrying,
        JobState::Cancelled,
        JobState::Exhausted,
    ];

    /// Terminal states are final: no transition leaves them.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobState::Succeeded | JobState::Exhausted | JobState::Cancelled
        )
    }

    /// Eligible for dispatch (subject to retry delay for `retrying`).
    pub fn is_ready(self) -> bool {
        matches!(self, JobState::Pending | JobState::Retrying)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Running => "running",
            JobState::Succeeded => "succeeded",
            JobState::Failed => "failed",
            JobState::Retrying => "retrying",
            JobState::Cancelled => "cancelled",
            JobState::Exhausted => "exhausted",
        }
    }

    /// Whether `self -> next` is an edge of the state machine.
    pub fn can_transition_to(self, next: JobState) -> bool {
        use JobState::*;

        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Cancelled)
                | (Running, Succeeded | Failed | Cancelled)
                | (Failed, Retrying | Exhausted)
                | (Retrying, Running | Cancelled)
        )
    }

    /// Validate and perform a transition.
    pub fn transition(self, next: JobState) -> Result<JobState, TransitionError> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(TransitionError {
                from: self,
                to: next,
            })
        }
    }
}

impl core::fmt::Display for JobState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}
