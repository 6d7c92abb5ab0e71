//! Background driver: runs the coordination loop on a tokio task.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use taskforge_core::{Job, JobDefinition, JobId};

use crate::orchestrator::{CancelOutcome, Orchestrator, OrchestratorError, OrchestratorStats, SubmitError};
use crate::repository::JobRepository;
use crate::schedule::{CronExpression, ScheduleError, ScheduleInfo, ScheduleRegistry};

const COMMAND_BUFFER: usize = 256;

/// Latest cycle failure; `None` once a cycle succeeds again.
pub type CycleError = Option<Arc<OrchestratorError>>;

enum Command {
    Submit(JobDefinition, oneshot::Sender<Result<Job, SubmitError>>),
    Cancel(JobId, oneshot::Sender<Result<CancelOutcome, OrchestratorError>>),
    Stats(oneshot::Sender<OrchestratorStats>),
    Schedule {
        name: String,
        expression: CronExpression,
        template: JobDefinition,
        reply: oneshot::Sender<Result<ScheduleInfo, ScheduleError>>,
    },
    Unschedule(String, oneshot::Sender<bool>),
    ListSchedules(oneshot::Sender<Vec<ScheduleInfo>>),
}

/// Handle to a running orchestrator.
///
/// Commands are processed inside the loop, between cycles, so the
/// orchestrator stays the only writer.
#[derive(Debug)]
pub struct OrchestratorHandle {
    commands: mpsc::Sender<Command>,
    shutdown: CancellationToken,
    errors: watch::Receiver<CycleError>,
    join: Option<JoinHandle<Result<(), OrchestratorError>>>,
}

impl OrchestratorHandle {
    pub async fn submit(&self, definition: JobDefinition) -> Result<Job, SubmitError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Submit(definition, tx))
            .await
            .map_err(|_| SubmitError::Stopped)?;
        rx.await.map_err(|_| SubmitError::Stopped)?
    }

    pub async fn cancel(&self, job_id: JobId) -> Result<CancelOutcome, OrchestratorError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Cancel(job_id, tx))
            .await
            .map_err(|_| OrchestratorError::Stopped)?;
        rx.await.map_err(|_| OrchestratorError::Stopped)?
    }

    pub async fn stats(&self) -> Result<OrchestratorStats, OrchestratorError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Stats(tx))
            .await
            .map_err(|_| OrchestratorError::Stopped)?;
        rx.await.map_err(|_| OrchestratorError::Stopped)
    }

    /// Submit a fresh job from `template` at every occurrence of `expression`.
    pub async fn schedule(
        &self,
        name: impl Into<String>,
        expression: &str,
        template: JobDefinition,
    ) -> Result<ScheduleInfo, ScheduleError> {
        let expression = CronExpression::parse(expression)?;
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Schedule {
                name: name.into(),
                expression,
                template,
                reply,
            })
            .await
            .map_err(|_| ScheduleError::Stopped)?;
        rx.await.map_err(|_| ScheduleError::Stopped)?
    }

    /// Returns whether the schedule existed. Jobs it already submitted keep running.
    pub async fn unschedule(&self, name: impl Into<String>) -> Result<bool, ScheduleError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Unschedule(name.into(), tx))
            .await
            .map_err(|_| ScheduleError::Stopped)?;
        rx.await.map_err(|_| ScheduleError::Stopped)
    }

    pub async fn schedules(&self) -> Result<Vec<ScheduleInfo>, ScheduleError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::ListSchedules(tx))
            .await
            .map_err(|_| ScheduleError::Stopped)?;
        rx.await.map_err(|_| ScheduleError::Stopped)
    }

    /// Failure of the most recent coordination cycle, if it failed.
    pub fn last_error(&self) -> CycleError {
        self.errors.borrow().clone()
    }

    /// Follow cycle failures as they happen.
    pub fn errors(&self) -> watch::Receiver<CycleError> {
        self.errors.clone()
    }

    pub fn is_running(&self) -> bool {
        self.join.as_ref().is_some_and(|j| !j.is_finished())
    }

    /// Ask the loop to stop without waiting for it.
    pub fn request_shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Request graceful shutdown and wait for the loop to exit.
    ///
    /// Fails when transitions were still held back at exit and the final
    /// flush could not persist them.
    pub async fn shutdown(mut self) -> Result<(), OrchestratorError> {
        self.shutdown.cancel();
        let Some(join) = self.join.take() else {
            return Ok(());
        };
        match join.await {
            Ok(result) => result,
            Err(e) => {
                error!(error = %e, "orchestrator loop panicked");
                Err(OrchestratorError::Stopped)
            }
        }
    }
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Command::Submit(def, _) => f.debug_tuple("Submit").field(&def.name).finish(),
            Command::Cancel(id, _) => f.debug_tuple("Cancel").field(id).finish(),
            Command::Stats(_) => f.write_str("Stats"),
            Command::Schedule { name, expression, .. } => f
                .debug_struct("Schedule")
                .field("name", name)
                .field("expression", &expression.as_str())
                .finish(),
            Command::Unschedule(name, _) => f.debug_tuple("Unschedule").field(name).finish(),
            Command::ListSchedules(_) => f.write_str("ListSchedules"),
        }
    }
}

impl<R: JobRepository + 'static> Orchestrator<R> {
    /// Move the orchestrator onto a background task.
    pub fn spawn(self) -> OrchestratorHandle {
        let (commands, rx) = mpsc::channel(COMMAND_BUFFER);
        let (errors_tx, errors) = watch::channel(None);
        let shutdown = CancellationToken::new();
        let join = tokio::spawn(drive(self, rx, errors_tx, shutdown.clone()));
        OrchestratorHandle {
            commands,
            shutdown,
            errors,
            join: Some(join),
        }
    }

    fn handle_command(&mut self, schedules: &mut ScheduleRegistry, command: Command) {
        match command {
            Command::Submit(definition, reply) => {
                let _ = reply.send(self.submit(definition));
            }
            Command::Cancel(job_id, reply) => {
                let _ = reply.send(self.cancel(job_id));
            }
            Command::Stats(reply) => {
                let _ = reply.send(self.stats());
            }
            Command::Schedule {
                name,
                expression,
                template,
                reply,
            } => {
                let _ = reply.send(schedules.add(name, expression, template, Utc::now()));
            }
            Command::Unschedule(name, reply) => {
                let _ = reply.send(schedules.remove(&name));
            }
            Command::ListSchedules(reply) => {
                let _ = reply.send(schedules.list());
            }
        }
    }
}

fn earliest(a: Option<std::time::Duration>, b: Option<std::time::Duration>) -> Option<std::time::Duration> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

async fn drive<R: JobRepository + 'static>(
    mut orchestrator: Orchestrator<R>,
    mut commands: mpsc::Receiver<Command>,
    errors: watch::Sender<CycleError>,
    shutdown: CancellationToken,
) -> Result<(), OrchestratorError> {
    info!("orchestrator loop started");
    let mut schedules = ScheduleRegistry::new();

    loop {
        orchestrator.fire_due_schedules(&mut schedules, Utc::now());

        let wake = match orchestrator.run_cycle() {
            Ok(report) => {
                errors.send_if_modified(|last| last.take().is_some());
                report.next_wake
            }
            Err(e) => {
                // Held-back transitions are retried on the next cycle.
                error!(error = %e, "coordination cycle failed");
                errors.send_replace(Some(Arc::new(e)));
                None
            }
        };
        let wake = earliest(wake, schedules.next_wake(Utc::now()));

        tokio::select! {
            _ = shutdown.cancelled() => break,
            command = commands.recv() => match command {
                Some(command) => orchestrator.handle_command(&mut schedules, command),
                None => break,
            },
            _ = orchestrator.wait_for_progress(wake) => {}
        }
    }

    let result = orchestrator.flush_pending();
    if let Err(e) = &result {
        warn!(error = %e, "transitions still held back at shutdown");
    }
    orchestrator.shutdown();
    info!("orchestrator loop stopped");
    result
}
