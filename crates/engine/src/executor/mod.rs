//! Executor strategies.
//!
//! The set is closed: [`Executor`] has exactly one variant per
//! [`StrategyKind`] and each variant has its own cancellation semantics.
//! `execute` never fails; every fault ends up as a finalized [`Execution`].

mod cooperative;
mod process;
mod thread;

use std::future::Future;
use std::time::Duration;

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use taskforge_core::{Execution, FailureCode, FailureReason, JobId, StrategyKind, TaskRef};

use crate::registry::{TaskRegistry, WorkUnit};

pub use cooperative::CooperativeExecutor;
pub use process::ProcessExecutor;
pub use thread::ThreadExecutor;

/// Everything an executor needs to run one attempt.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub job_id: JobId,
    pub attempt: u32,
    pub strategy: StrategyKind,
    pub task: TaskRef,
    pub input: Value,
    pub timeout: Option<Duration>,
    pub cancel: CancellationToken,
}

impl ExecutionRequest {
    pub fn new(job_id: JobId, attempt: u32, strategy: StrategyKind, task: TaskRef, input: Value) -> Self {
        Self {
            job_id,
            attempt,
            strategy,
            task,
            input,
            timeout: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }
}

/// One executor per strategy.
#[derive(Debug)]
pub enum Executor {
    Cooperative(CooperativeExecutor),
    Thread(ThreadExecutor),
    Process(ProcessExecutor),
}

impl Executor {
    pub fn kind(&self) -> StrategyKind {
        match self {
            Executor::Cooperative(_) => StrategyKind::Cooperative,
            Executor::Thread(_) => StrategyKind::Thread,
            Executor::Process(_) => StrategyKind::Process,
        }
    }

    /// Open the execution record for an admitted attempt.
    pub fn open(&self, request: &ExecutionRequest) -> Execution {
        Execution::start(request.job_id, request.attempt, self.kind())
    }

    /// Run one attempt to completion and finalize `execution`.
    pub async fn execute(
        &self,
        registry: &TaskRegistry,
        request: ExecutionRequest,
        execution: Execution,
    ) -> Execution {
        if request.cancel.is_cancelled() {
            return finish(execution, Err(Interrupt::Cancelled.reason()));
        }

        let unit = match registry.resolve(&request.task, self.kind()) {
            Ok(unit) => unit,
            Err(reason) => return finish(execution, Err(reason)),
        };

        let result = match (self, unit) {
            (Executor::Cooperative(executor), WorkUnit::Cooperative(task)) => {
                executor.run(task, &request).await
            }
            (Executor::Thread(executor), WorkUnit::Thread(task)) => executor.run(task, &request).await,
            (Executor::Process(executor), WorkUnit::Process(command)) => {
                executor.run(&command, &request).await
            }
            (executor, unit) => Err(FailureReason::new(
                FailureCode::UnknownTask,
                format!(
                    "{} executor cannot run a {} unit of work",
                    executor.kind(),
                    unit.strategy()
                ),
            )),
        };

        finish(execution, result)
    }

    /// Stop background workers owned by the executor.
    pub fn shutdown(&self) {
        if let Executor::Cooperative(executor) = self {
            executor.shutdown();
        }
    }

    /// Threads left running after a timeout or cancellation.
    pub fn detached(&self) -> usize {
        match self {
            Executor::Thread(executor) => executor.detached(),
            Executor::Cooperative(_) | Executor::Process(_) => 0,
        }
    }
}

/// Why an attempt was stopped from outside.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Interrupt {
    Timeout(Duration),
    Cancelled,
}

impl Interrupt {
    pub(crate) fn reason(self) -> FailureReason {
        match self {
            Interrupt::Timeout(limit) => FailureReason::new(
                FailureCode::Timeout,
                format!("exceeded timeout of {}ms", limit.as_millis()),
            ),
            Interrupt::Cancelled => FailureReason::new(FailureCode::Cancelled, "cancellation requested"),
        }
    }
}

pub(crate) enum Watched<T> {
    Completed(T),
    Interrupted(Interrupt),
}

/// Wait for `work`, a timeout or cancellation, whichever comes first.
/// `work` is borrowed so the caller can keep driving it afterwards.
pub(crate) async fn watch<F>(
    work: &mut F,
    timeout: Option<Duration>,
    cancel: &CancellationToken,
) -> Watched<F::Output>
where
    F: Future + Unpin,
{
    let deadline = async {
        match timeout {
            Some(limit) => {
                tokio::time::sleep(limit).await;
                limit
            }
            None => std::future::pending().await,
        }
    };

    tokio::select! {
        biased;
        _ = cancel.cancelled() => Watched::Interrupted(Interrupt::Cancelled),
        output = work => Watched::Completed(output),
        limit = deadline => Watched::Interrupted(Interrupt::Timeout(limit)),
    }
}

pub(crate) fn finish(mut execution: Execution, result: Result<Value, FailureReason>) -> Execution {
    let finalized = match result {
        Ok(payload) => execution.succeed(payload),
        Err(reason) => execution.fail(reason),
    };
    if let Err(e) = finalized {
        warn!(
            job_id = %execution.job_id(),
            attempt = execution.attempt(),
            error = %e,
            "execution finalized twice"
        );
    }
    execution
}

/// Best-effort message from a panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
