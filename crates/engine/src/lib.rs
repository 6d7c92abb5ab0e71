//! Execution engine: executors, pool, orchestrator, observers.
//!
//! Jobs are submitted to an [`Orchestrator`], which dispatches them to the
//! [`ExecutorPool`] under their strategy, applies the retry policy to failed
//! attempts, persists every transition through a [`JobRepository`] and
//! notifies the [`ObserverRegistry`]. A [`ScheduleRegistry`] turns cron
//! expressions into recurring submissions.

pub mod config;
pub mod driver;
pub mod executor;
pub mod metrics;
pub mod observer;
pub mod orchestrator;
pub mod pool;
pub mod registry;
pub mod repository;
pub mod schedule;

pub use config::{ConfigError, ConfigOptions, LaneOptions, OrchestratorConfig};
pub use driver::{CycleError, OrchestratorHandle};
pub use executor::{ExecutionRequest, Executor};
pub use metrics::{MetricsObserver, MetricsSnapshot, StrategyMetrics};
pub use observer::{JobObserver, LifecycleEvent, ObserverError, ObserverId, ObserverRegistry, TracingObserver};
pub use orchestrator::{
    CancelOutcome, CycleReport, Orchestrator, OrchestratorError, OrchestratorStats, RecoveryReport,
    SubmitError,
};
pub use pool::{ExecutionHandle, ExecutorPool, LaneStats, PoolError};
pub use registry::{
    CancelFlag, ProcessCommand, TaskError, TaskRegistry, TaskResult, WorkUnit, YieldContext,
};
pub use repository::{InMemoryJobRepository, JobRepository, JobStats, RepositoryError};
pub use schedule::{CronExpression, DueJob, ScheduleError, ScheduleInfo, ScheduleRegistry};
