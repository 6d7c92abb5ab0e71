use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use serde_json::Value;
use tokio::runtime::{Builder, Handle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use taskforge_core::{FailureCode, FailureReason};

use super::{ExecutionRequest, Watched, panic_message, watch};
use crate::registry::{CooperativeTask, YieldContext};

/// Runs suspension-aware tasks on a single dedicated scheduler thread.
///
/// Tasks interleave only at their own yield points. A timeout or
/// cancellation trips the task's [`YieldContext`]; the task gets
/// `cancel_grace` to reach a yield point and is detached if it doesn't.
pub struct CooperativeExecutor {
    handle: Handle,
    stop: CancellationToken,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
    cancel_grace: Duration,
}

impl CooperativeExecutor {
    /// Start the scheduler thread.
    pub fn start(cancel_grace: Duration) -> std::io::Result<Self> {
        let runtime = Builder::new_current_thread().enable_all().build()?;
        let handle = runtime.handle().clone();
        let stop = CancellationToken::new();
        let stopped = stop.clone();

        let worker = thread::Builder::new()
            .name("taskforge-cooperative".to_string())
            .spawn(move || {
                debug!("cooperative scheduler started");
                runtime.block_on(stopped.cancelled());
                debug!("cooperative scheduler stopped");
            })?;

        Ok(Self {
            handle,
            stop,
            worker: Mutex::new(Some(worker)),
            cancel_grace,
        })
    }

    pub(super) async fn run(
        &self,
        task: CooperativeTask,
        request: &ExecutionRequest,
    ) -> Result<Value, FailureReason> {
        if self.stop.is_cancelled() {
            return Err(FailureReason::new(
                FailureCode::ResourceExhausted,
                "cooperative scheduler is stopped",
            ));
        }

        let token = request.cancel.child_token();
        let future = task(request.input.clone(), YieldContext::new(token.clone()));
        let mut join = self.handle.spawn(future);

        match watch(&mut join, request.timeout, &request.cancel).await {
            Watched::Completed(Ok(Ok(payload))) => Ok(payload),
            Watched::Completed(Ok(Err(error))) => Err(error.into_reason()),
            Watched::Completed(Err(e)) if e.is_panic() => Err(FailureReason::new(
                FailureCode::Panic,
                panic_message(e.into_panic().as_ref()),
            )),
            Watched::Completed(Err(_)) => Err(FailureReason::new(
                FailureCode::ResourceExhausted,
                "cooperative scheduler dropped the task",
            )),
            Watched::Interrupted(interrupt) => {
                token.cancel();
                match tokio::time::timeout(self.cancel_grace, &mut join).await {
                    Ok(_) => debug!(
                        job_id = %request.job_id,
                        attempt = request.attempt,
                        "cooperative task stopped at a yield point"
                    ),
                    Err(_) => warn!(
                        job_id = %request.job_id,
                        attempt = request.attempt,
                        grace_ms = self.cancel_grace.as_millis() as u64,
                        "cooperative task did not reach a yield point; detached"
                    ),
                }
                Err(interrupt.reason())
            }
        }
    }

    /// Stop the scheduler thread. Tasks still suspended are dropped.
    ///
    /// Inside a tokio runtime the thread is joined on the blocking pool, so
    /// the caller's worker is never parked behind a task that won't yield.
    pub fn shutdown(&self) {
        self.stop.cancel();
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        let Some(worker) = worker else {
            return;
        };
        match Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn_blocking(move || join_scheduler(worker));
            }
            Err(_) => join_scheduler(worker),
        }
    }
}

fn join_scheduler(worker: thread::JoinHandle<()>) {
    if worker.join().is_err() {
        warn!("cooperative scheduler thread panicked");
    } else {
        info!("cooperative scheduler joined");
    }
}

impl Drop for CooperativeExecutor {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

impl std::fmt::Debug for CooperativeExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CooperativeExecutor")
            .field("stopped", &self.stop.is_cancelled())
            .field("cancel_grace", &self.cancel_grace)
            .finish()
    }
}
