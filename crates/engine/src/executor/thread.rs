use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::thread;

use serde_json::Value;
use tokio::sync::oneshot;
use tracing::warn;

use taskforge_core::{FailureCode, FailureReason};

use super::{ExecutionRequest, Watched, panic_message, watch};
use crate::registry::{BlockingTask, CancelFlag};

/// Runs blocking tasks on a dedicated worker thread per attempt.
///
/// Threads cannot be preempted safely. On timeout or cancellation the
/// task's [`CancelFlag`] is raised and the thread is detached: it keeps
/// running until the task returns. [`ThreadExecutor::detached`] reports how
/// many such threads are still alive.
#[derive(Debug, Default)]
pub struct ThreadExecutor {
    detached: Arc<AtomicUsize>,
    spawned: AtomicU64,
}

impl ThreadExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn detached(&self) -> usize {
        self.detached.load(Ordering::Acquire)
    }

    pub(super) async fn run(
        &self,
        task: BlockingTask,
        request: &ExecutionRequest,
    ) -> Result<Value, FailureReason> {
        let (tx, mut rx) = oneshot::channel();
        let flag = CancelFlag::new();
        let worker_flag = flag.clone();
        let input = request.input.clone();
        let n = self.spawned.fetch_add(1, Ordering::Relaxed);

        let spawned = thread::Builder::new()
            .name(format!("taskforge-worker-{n}"))
            .spawn(move || {
                let result = panic::catch_unwind(AssertUnwindSafe(|| task(input, &worker_flag)));
                // Receiver is gone once the attempt was detached.
                let _ = tx.send(result);
            });
        if let Err(e) = spawned {
            return Err(FailureReason::new(
                FailureCode::ResourceExhausted,
                format!("failed to spawn worker thread: {e}"),
            ));
        }

        match watch(&mut rx, request.timeout, &request.cancel).await {
            Watched::Completed(Ok(Ok(Ok(payload)))) => Ok(payload),
            Watched::Completed(Ok(Ok(Err(error)))) => Err(error.into_reason()),
            Watched::Completed(Ok(Err(payload))) => Err(FailureReason::new(
                FailureCode::Panic,
                panic_message(payload.as_ref()),
            )),
            Watched::Completed(Err(_)) => Err(FailureReason::new(
                FailureCode::Panic,
                "worker thread exited without reporting",
            )),
            Watched::Interrupted(interrupt) => {
                flag.cancel();
                let alive = self.detached.fetch_add(1, Ordering::AcqRel) + 1;
                warn!(
                    job_id = %request.job_id,
                    attempt = request.attempt,
                    detached = alive,
                    "worker thread detached; it runs until the task returns"
                );
                let detached = self.detached.clone();
                tokio::spawn(async move {
                    let _ = rx.await;
                    detached.fetch_sub(1, Ordering::AcqRel);
                });
                Err(interrupt.reason())
            }
        }
    }
}
