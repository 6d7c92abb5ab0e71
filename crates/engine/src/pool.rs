//! Executor pool: per-strategy concurrency budgets with FIFO admission.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use serde::Serialize;
use tokio::runtime::Handle;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use taskforge_core::{Execution, FailureCode, FailureReason, JobId, StrategyKind};

use crate::config::{LaneOptions, OrchestratorConfig};
use crate::executor::{
    CooperativeExecutor, ExecutionRequest, Executor, ProcessExecutor, ThreadExecutor, finish,
};
use crate::registry::TaskRegistry;

/// Pool admission error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PoolError {
    #[error("{strategy} lane saturated ({queued} queued)")]
    Saturated { strategy: StrategyKind, queued: usize },
    #[error("executor pool is closed")]
    Closed,
    #[error("executor pool failed to start: {0}")]
    Startup(String),
}

/// Point-in-time view of one strategy's lane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LaneStats {
    pub strategy: StrategyKind,
    pub max_concurrent: usize,
    pub queue_bound: usize,
    pub running: usize,
    pub queued: usize,
    /// Threads still running after their attempt was abandoned.
    pub detached: usize,
}

/// An admitted attempt. Resolves to its finalized [`Execution`].
#[derive(Debug)]
pub struct ExecutionHandle {
    execution: Execution,
    cancel: CancellationToken,
    done: oneshot::Receiver<Execution>,
}

impl ExecutionHandle {
    pub fn job_id(&self) -> JobId {
        self.execution.job_id()
    }

    pub fn attempt(&self) -> u32 {
        self.execution.attempt()
    }

    /// The execution as recorded at admission (outcome `running`). The
    /// finalized record is restamped when the attempt gets its slot.
    pub fn execution(&self) -> &Execution {
        &self.execution
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Wait for the attempt to finish.
    pub async fn wait(self) -> Execution {
        match self.done.await {
            Ok(execution) => execution,
            Err(_) => finish(
                self.execution,
                Err(FailureReason::new(
                    FailureCode::Interrupted,
                    "executor dropped the attempt",
                )),
            ),
        }
    }
}

struct Pending {
    request: ExecutionRequest,
    done: oneshot::Sender<Execution>,
}

struct Lane {
    executor: Executor,
    limits: LaneOptions,
    slots: Arc<Semaphore>,
    /// Attempts accepted and not yet finished, running or waiting.
    admitted: AtomicUsize,
    running: AtomicUsize,
    registry: Arc<TaskRegistry>,
    runtime: Handle,
}

impl Lane {
    fn strategy(&self) -> StrategyKind {
        self.executor.kind()
    }

    /// Count an attempt against the lane: `max_concurrent` running plus
    /// `queue_bound` waiting.
    fn reserve(&self) -> Result<(), PoolError> {
        let capacity = self.limits.max_concurrent + self.limits.queue_bound;
        self.admitted
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |admitted| {
                (admitted < capacity).then_some(admitted + 1)
            })
            .map(|_| ())
            .map_err(|admitted| {
                let queued = admitted.saturating_sub(self.running.load(Ordering::Acquire));
                warn!(strategy = %self.strategy(), queued, "executor lane saturated");
                PoolError::Saturated {
                    strategy: self.strategy(),
                    queued,
                }
            })
    }

    fn release(&self) {
        self.admitted.fetch_sub(1, Ordering::AcqRel);
    }

    fn queued(&self) -> usize {
        self.admitted
            .load(Ordering::Acquire)
            .saturating_sub(self.running.load(Ordering::Acquire))
    }
}

/// A held lane slot. Dropping it frees the permit for the next waiter.
struct Slot {
    _permit: OwnedSemaphorePermit,
    lane: Arc<Lane>,
}

impl Slot {
    fn new(permit: OwnedSemaphorePermit, lane: Arc<Lane>) -> Self {
        lane.running.fetch_add(1, Ordering::AcqRel);
        Self { _permit: permit, lane }
    }
}

impl Drop for Slot {
    fn drop(&mut self) {
        self.lane.running.fetch_sub(1, Ordering::AcqRel);
        self.lane.release();
    }
}

/// Hands slots to admitted attempts in submission order.
///
/// Waiters are served one at a time from the lane's queue; the semaphore
/// itself is fair, so a released permit goes to this loop before any later
/// acquirer.
async fn admit(lane: Arc<Lane>, mut queue: mpsc::UnboundedReceiver<Pending>) {
    while let Some(pending) = queue.recv().await {
        let permit = tokio::select! {
            biased;
            _ = pending.request.cancel.cancelled() => Err("cancelled while queued"),
            permit = lane.slots.clone().acquire_owned() => permit.map_err(|_| "executor pool closed"),
        };
        match permit {
            Ok(permit) => start(Slot::new(permit, lane.clone()), pending),
            Err(why) => {
                debug!(job_id = %pending.request.job_id, attempt = pending.request.attempt, why, "attempt never started");
                let execution = finish(
                    lane.executor.open(&pending.request),
                    Err(FailureReason::new(FailureCode::Cancelled, why)),
                );
                lane.release();
                let _ = pending.done.send(execution);
            }
        }
    }
}

fn start(slot: Slot, pending: Pending) {
    let lane = slot.lane.clone();
    lane.runtime.clone().spawn(async move {
        let Pending { request, done } = pending;
        // Opened on slot grant so timings exclude queue wait.
        let execution = lane.executor.open(&request);
        debug!(
            job_id = %request.job_id,
            attempt = request.attempt,
            strategy = %request.strategy,
            "execution started"
        );
        let execution = lane.executor.execute(&lane.registry, request, execution).await;
        drop(slot);
        // The handle may have been dropped; the result is then discarded.
        let _ = done.send(execution);
    });
}

struct LaneEntry {
    lane: Arc<Lane>,
    queue: mpsc::UnboundedSender<Pending>,
}

/// Bounded concurrency per strategy.
///
/// At most `max_concurrent` attempts of a strategy run at once; up to
/// `queue_bound` more wait in FIFO order. Beyond that, `submit` fails fast.
pub struct ExecutorPool {
    cooperative: LaneEntry,
    thread: LaneEntry,
    process: LaneEntry,
    closed: AtomicBool,
}

impl ExecutorPool {
    /// Build the pool on the current tokio runtime.
    pub fn new(config: &OrchestratorConfig, registry: Arc<TaskRegistry>) -> Result<Self, PoolError> {
        let runtime = Handle::try_current().map_err(|e| PoolError::Startup(e.to_string()))?;
        let cooperative = CooperativeExecutor::start(config.cancel_grace())
            .map_err(|e| PoolError::Startup(e.to_string()))?;

        let lane = |executor: Executor| {
            let limits = config.lane(executor.kind());
            let lane = Arc::new(Lane {
                limits,
                executor,
                slots: Arc::new(Semaphore::new(limits.max_concurrent)),
                admitted: AtomicUsize::new(0),
                running: AtomicUsize::new(0),
                registry: registry.clone(),
                runtime: runtime.clone(),
            });
            let (queue, rx) = mpsc::unbounded_channel();
            runtime.spawn(admit(lane.clone(), rx));
            LaneEntry { lane, queue }
        };

        Ok(Self {
            cooperative: lane(Executor::Cooperative(cooperative)),
            thread: lane(Executor::Thread(ThreadExecutor::new())),
            process: lane(Executor::Process(ProcessExecutor::new())),
            closed: AtomicBool::new(false),
        })
    }

    fn lane(&self, strategy: StrategyKind) -> &LaneEntry {
        match strategy {
            StrategyKind::Cooperative => &self.cooperative,
            StrategyKind::Thread => &self.thread,
            StrategyKind::Process => &self.process,
        }
    }

    /// Admit an attempt: it starts as soon as a slot is free, in FIFO order.
    pub fn submit(&self, request: ExecutionRequest) -> Result<ExecutionHandle, PoolError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(PoolError::Closed);
        }

        let entry = self.lane(request.strategy);
        entry.lane.reserve()?;

        let (tx, rx) = oneshot::channel();
        let handle = ExecutionHandle {
            execution: entry.lane.executor.open(&request),
            cancel: request.cancel.clone(),
            done: rx,
        };
        if entry.queue.send(Pending { request, done: tx }).is_err() {
            entry.lane.release();
            return Err(PoolError::Closed);
        }
        debug!(
            job_id = %handle.job_id(),
            strategy = %entry.lane.strategy(),
            queued = entry.lane.queued(),
            "execution admitted"
        );
        Ok(handle)
    }

    pub fn lane_stats(&self, strategy: StrategyKind) -> LaneStats {
        let lane = &self.lane(strategy).lane;
        LaneStats {
            strategy,
            max_concurrent: lane.limits.max_concurrent,
            queue_bound: lane.limits.queue_bound,
            running: lane.running.load(Ordering::Acquire),
            queued: lane.queued(),
            detached: lane.executor.detached(),
        }
    }

    pub fn stats(&self) -> Vec<LaneStats> {
        StrategyKind::ALL.iter().map(|s| self.lane_stats(*s)).collect()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Refuse new submissions and stop the cooperative scheduler.
    /// Queued attempts end as cancelled; running ones finish on their own.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        for strategy in StrategyKind::ALL {
            self.lane(strategy).lane.slots.close();
        }
        self.cooperative.lane.executor.shutdown();
    }
}

impl std::fmt::Debug for ExecutorPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutorPool")
            .field("lanes", &self.stats())
            .field("closed", &self.is_closed())
            .finish()
    }
}
