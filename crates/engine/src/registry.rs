//! Task registry: resolves a job's [`TaskRef`] to the unit of work its
//! strategy knows how to run.

use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use taskforge_core::{FailureClass, FailureCode, FailureReason, StrategyKind, TaskRef};

/// Result of a unit of work.
pub type TaskResult = Result<Value, TaskError>;

/// Boxed future returned by cooperative tasks.
pub type TaskFuture = Pin<Box<dyn Future<Output = TaskResult> + Send + 'static>>;

/// Cooperative unit of work.
pub type CooperativeTask = Arc<dyn Fn(Value, YieldContext) -> TaskFuture + Send + Sync>;

/// Blocking unit of work run on its own thread.
pub type BlockingTask = Arc<dyn Fn(Value, &CancelFlag) -> TaskResult + Send + Sync>;

/// Error reported by a unit of work.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{message}")]
pub struct TaskError {
    code: FailureCode,
    class: FailureClass,
    message: String,
}

impl TaskError {
    /// A failure worth retrying.
    pub fn retriable(message: impl Into<String>) -> Self {
        Self {
            code: FailureCode::Application,
            class: FailureClass::Retriable,
            message: message.into(),
        }
    }

    /// A failure no retry can fix (bad input, missing data).
    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            code: FailureCode::Application,
            class: FailureClass::NonRetriable,
            message: message.into(),
        }
    }

    /// The task stopped because cancellation was requested.
    pub fn cancelled() -> Self {
        Self {
            code: FailureCode::Cancelled,
            class: FailureClass::Retriable,
            message: "cancellation observed".to_string(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.code == FailureCode::Cancelled
    }

    pub fn into_reason(self) -> FailureReason {
        FailureReason::new(self.code, self.message).with_class(self.class)
    }
}

/// Handle given to cooperative tasks. Cancellation is observed only at the
/// yield points it exposes.
#[derive(Debug, Clone)]
pub struct YieldContext {
    token: CancellationToken,
}

impl YieldContext {
    pub(crate) fn new(token: CancellationToken) -> Self {
        Self { token }
    }

    /// Detached context that is never cancelled.
    pub fn detached() -> Self {
        Self::new(CancellationToken::new())
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Fail with [`TaskError::cancelled`] if cancellation was requested.
    pub fn checkpoint(&self) -> Result<(), TaskError> {
        if self.is_cancelled() {
            Err(TaskError::cancelled())
        } else {
            Ok(())
        }
    }

    /// Give other cooperative tasks a turn.
    pub async fn yield_now(&self) -> Result<(), TaskError> {
        tokio::task::yield_now().await;
        self.checkpoint()
    }

    /// Suspend for `duration`, waking early on cancellation.
    pub async fn sleep(&self, duration: Duration) -> Result<(), TaskError> {
        tokio::select! {
            _ = self.token.cancelled() => Err(TaskError::cancelled()),
            _ = tokio::time::sleep(duration) => self.checkpoint(),
        }
    }

    /// Await an I/O future as a yield point.
    pub async fn wait<F: Future>(&self, future: F) -> Result<F::Output, TaskError> {
        tokio::select! {
            _ = self.token.cancelled() => Err(TaskError::cancelled()),
            output = future => Ok(output),
        }
    }
}

/// Cancellation flag polled by blocking tasks. Nothing forces the thread to
/// stop; the task must check it.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    pub fn checkpoint(&self) -> Result<(), TaskError> {
        if self.is_cancelled() {
            Err(TaskError::cancelled())
        } else {
            Ok(())
        }
    }

    pub(crate) fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }
}

/// External program run by the process strategy.
///
/// The job input is written to the child's stdin as JSON; a zero exit status
/// means stdout holds the JSON result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessCommand {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: Vec<(String, String)>,
    #[serde(default)]
    pub current_dir: Option<PathBuf>,
}

impl ProcessCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            current_dir: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    /// `/bin/sh -c <script>`.
    pub fn shell(script: impl Into<String>) -> Self {
        Self::new("/bin/sh").arg("-c").arg(script)
    }
}

/// A resolved unit of work, shaped for exactly one strategy.
#[derive(Clone)]
pub enum WorkUnit {
    Cooperative(CooperativeTask),
    Thread(BlockingTask),
    Process(ProcessCommand),
}

impl WorkUnit {
    pub fn strategy(&self) -> StrategyKind {
        match self {
            WorkUnit::Cooperative(_) => StrategyKind::Cooperative,
            WorkUnit::Thread(_) => StrategyKind::Thread,
            WorkUnit::Process(_) => StrategyKind::Process,
        }
    }
}

impl std::fmt::Debug for WorkUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkUnit::Cooperative(_) => f.write_str("WorkUnit::Cooperative(..)"),
            WorkUnit::Thread(_) => f.write_str("WorkUnit::Thread(..)"),
            WorkUnit::Process(cmd) => f.debug_tuple("WorkUnit::Process").field(cmd).finish(),
        }
    }
}

/// Name → unit of work.
///
/// Names are matched exactly first, then by category pattern (`"reports.*"`
/// matches `"reports.daily"`), then by the `"*"` fallback.
#[derive(Default)]
pub struct TaskRegistry {
    tasks: HashMap<String, WorkUnit>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an async task for the cooperative strategy.
    pub fn register_cooperative<F, Fut>(&mut self, pattern: impl Into<String>, task: F) -> &mut Self
    where
        F: Fn(Value, YieldContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = TaskResult> + Send + 'static,
    {
        let task: CooperativeTask =
            Arc::new(move |input: Value, ctx: YieldContext| -> TaskFuture { Box::pin(task(input, ctx)) });
        self.register(pattern, WorkUnit::Cooperative(task))
    }

    /// Register a blocking task for the thread strategy.
    pub fn register_blocking<F>(&mut self, pattern: impl Into<String>, task: F) -> &mut Self
    where
        F: Fn(Value, &CancelFlag) -> TaskResult + Send + Sync + 'static,
    {
        self.register(pattern, WorkUnit::Thread(Arc::new(task)))
    }

    /// Register an external program for the process strategy.
    pub fn register_process(&mut self, pattern: impl Into<String>, command: ProcessCommand) -> &mut Self {
        self.register(pattern, WorkUnit::Process(command))
    }

    pub fn register(&mut self, pattern: impl Into<String>, unit: WorkUnit) -> &mut Self {
        self.tasks.insert(pattern.into(), unit);
        self
    }

    pub fn contains(&self, task: &TaskRef) -> bool {
        self.lookup(task.as_str()).is_some()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Resolve `task` for `strategy`, or explain why it cannot run.
    pub fn resolve(&self, task: &TaskRef, strategy: StrategyKind) -> Result<WorkUnit, FailureReason> {
        let unit = self.lookup(task.as_str()).ok_or_else(|| {
            FailureReason::new(FailureCode::UnknownTask, format!("no task registered for `{task}`"))
        })?;
        if unit.strategy() != strategy {
            return Err(FailureReason::new(
                FailureCode::UnknownTask,
                format!(
                    "task `{task}` is registered for the {} strategy, job requested {strategy}",
                    unit.strategy()
                ),
            ));
        }
        Ok(unit.clone())
    }

    fn lookup(&self, name: &str) -> Option<&WorkUnit> {
        if let Some(unit) = self.tasks.get(name) {
            return Some(unit);
        }

        // Longest matching category wins.
        let category = self
            .tasks
            .iter()
            .filter_map(|(pattern, unit)| {
                let prefix = pattern.strip_suffix(".*")?;
                let rest = name.strip_prefix(prefix)?;
                rest.starts_with('.').then_some((prefix.len(), unit))
            })
            .max_by_key(|(len, _)| *len)
            .map(|(_, unit)| unit);

        category.or_else(|| self.tasks.get("*"))
    }
}

impl std::fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<_> = self.tasks.keys().collect();
        names.sort();
        f.debug_struct("TaskRegistry").field("tasks", &names).finish()
    }
}
