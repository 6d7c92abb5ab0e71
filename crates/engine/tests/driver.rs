use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde_json::{Value, json};

use taskforge_core::{JobDefinition, JobId, JobState, StrategyKind};
use taskforge_engine::{
    CancelOutcome, ConfigOptions, InMemoryJobRepository, JobRepository, ObserverRegistry,
    Orchestrator, OrchestratorConfig, OrchestratorError, OrchestratorHandle, ScheduleError,
    SubmitError, TaskRegistry, TracingObserver,
};

fn registry() -> TaskRegistry {
    let mut registry = TaskRegistry::new();
    registry
        .register_blocking("square", |input, _| {
            let n = input["n"].as_i64().unwrap_or(0);
            Ok(json!(n * n))
        })
        .register_cooperative("park", |_, ctx| async move {
            ctx.sleep(Duration::from_secs(60)).await?;
            Ok(Value::Null)
        });
    registry
}

fn spawn(repository: &Arc<InMemoryJobRepository>, registry: TaskRegistry) -> OrchestratorHandle {
    let config = OrchestratorConfig::from_options(ConfigOptions {
        poll_interval_ms: 5,
        ..ConfigOptions::default()
    })
    .unwrap();
    Orchestrator::new(repository.clone(), Arc::new(registry), ObserverRegistry::new(), config)
        .unwrap()
        .spawn()
}

/// A thread task that finishes once `release` is set.
fn gated(release: &Arc<AtomicBool>) -> TaskRegistry {
    let release = release.clone();
    let mut registry = TaskRegistry::new();
    registry.register_blocking("gated", move |_, _| {
        while !release.load(Ordering::SeqCst) {
            std::thread::sleep(Duration::from_millis(2));
        }
        Ok(json!("done"))
    });
    registry
}

async fn wait_for_state(repository: &InMemoryJobRepository, id: JobId, state: JobState) {
    for _ in 0..400 {
        if repository.get_job(id).unwrap().map(|j| j.state()) == Some(state) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("job {id} never reached {state}");
}

#[tokio::test]
async fn background_loop_runs_submitted_jobs() {
    taskforge_observability::init_with(taskforge_observability::LogFormat::Text);

    let repository = InMemoryJobRepository::arc();
    let observers = ObserverRegistry::new();
    observers.attach(Arc::new(TracingObserver)).unwrap();
    let config = OrchestratorConfig::from_options(ConfigOptions {
        poll_interval_ms: 5,
        ..ConfigOptions::default()
    })
    .unwrap();
    let handle = Orchestrator::new(repository.clone(), Arc::new(registry()), observers, config)
        .unwrap()
        .spawn();
    assert!(handle.is_running());

    let squared = handle
        .submit(JobDefinition::new("square", "square", StrategyKind::Thread).with_input(json!({"n": 9})))
        .await
        .unwrap();
    wait_for_state(&repository, squared.id(), JobState::Succeeded).await;
    let history = repository.load_execution_history(squared.id()).unwrap();
    assert_eq!(history[0].payload(), Some(&json!(81)));

    let duplicate = handle
        .submit(JobDefinition::new("park", "park", StrategyKind::Cooperative))
        .await
        .unwrap();
    let err = handle
        .submit(JobDefinition::new("park", "park", StrategyKind::Cooperative))
        .await
        .unwrap_err();
    assert!(matches!(err, SubmitError::DuplicateName(_)));

    wait_for_state(&repository, duplicate.id(), JobState::Running).await;
    assert_eq!(handle.cancel(duplicate.id()).await.unwrap(), CancelOutcome::Requested);
    wait_for_state(&repository, duplicate.id(), JobState::Cancelled).await;

    let stats = handle.stats().await.unwrap();
    assert_eq!(stats.in_flight, 0);
    assert_eq!(stats.jobs_succeeded, 1);
    assert_eq!(stats.jobs_cancelled, 1);
    assert_eq!(stats.lanes.len(), 3);

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn stopped_loop_rejects_commands() {
    let orchestrator = Orchestrator::new(
        InMemoryJobRepository::arc(),
        Arc::new(registry()),
        ObserverRegistry::new(),
        OrchestratorConfig::default(),
    )
    .unwrap();
    let handle = orchestrator.spawn();
    assert_eq!(handle.stats().await.unwrap().in_flight, 0);

    handle.request_shutdown();
    for _ in 0..200 {
        if !handle.is_running() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(!handle.is_running());

    let err = handle
        .submit(JobDefinition::new("late", "square", StrategyKind::Thread))
        .await
        .unwrap_err();
    assert!(matches!(err, SubmitError::Stopped));
    assert!(matches!(
        handle.cancel(JobId::new()).await,
        Err(OrchestratorError::Stopped)
    ));
    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn cycle_failures_are_visible_on_the_handle() {
    let repository = InMemoryJobRepository::arc();
    let release = Arc::new(AtomicBool::new(false));
    let handle = spawn(&repository, gated(&release));
    assert!(handle.last_error().is_none());

    let job = handle
        .submit(JobDefinition::new("gated", "gated", StrategyKind::Thread))
        .await
        .unwrap();
    wait_for_state(&repository, job.id(), JobState::Running).await;

    let mut errors = handle.errors();
    repository.set_unavailable(true);
    release.store(true, Ordering::SeqCst);
    tokio::time::timeout(Duration::from_secs(2), errors.wait_for(|e| e.is_some()))
        .await
        .expect("cycle failure was never reported")
        .unwrap();
    let failure = handle.last_error().unwrap();
    assert!(matches!(&*failure, OrchestratorError::Persistence { job_id, .. } if *job_id == job.id()));

    repository.set_unavailable(false);
    tokio::time::timeout(Duration::from_secs(2), errors.wait_for(|e| e.is_none()))
        .await
        .expect("recovery was never reported")
        .unwrap();
    wait_for_state(&repository, job.id(), JobState::Succeeded).await;
    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn shutdown_reports_transitions_left_unpersisted() {
    let repository = InMemoryJobRepository::arc();
    let release = Arc::new(AtomicBool::new(false));
    let handle = spawn(&repository, gated(&release));

    let job = handle
        .submit(JobDefinition::new("gated", "gated", StrategyKind::Thread))
        .await
        .unwrap();
    wait_for_state(&repository, job.id(), JobState::Running).await;

    let mut errors = handle.errors();
    repository.set_unavailable(true);
    release.store(true, Ordering::SeqCst);
    tokio::time::timeout(Duration::from_secs(2), errors.wait_for(|e| e.is_some()))
        .await
        .expect("cycle failure was never reported")
        .unwrap();

    let err = handle.shutdown().await.unwrap_err();
    assert!(matches!(err, OrchestratorError::Persistence { job_id, .. } if job_id == job.id()));

    repository.set_unavailable(false);
    assert_eq!(repository.get_job(job.id()).unwrap().unwrap().state(), JobState::Running);
}

#[tokio::test]
async fn cron_schedule_submits_a_job_per_occurrence() {
    let repository = InMemoryJobRepository::arc();
    let handle = spawn(&repository, registry());

    let template = JobDefinition::new("square", "square", StrategyKind::Thread).with_input(json!({"n": 4}));
    let info = handle.schedule("squares", "* * * * * *", template.clone()).await.unwrap();
    assert_eq!(info.name, "squares");
    assert!(info.next_fire.is_some());

    let err = handle.schedule("squares", "* * * * * *", template.clone()).await.unwrap_err();
    assert!(matches!(err, ScheduleError::DuplicateName(_)));
    let err = handle.schedule("broken", "99 * * * *", template).await.unwrap_err();
    assert!(matches!(err, ScheduleError::InvalidExpression { .. }));

    let mut fired = None;
    for _ in 0..600 {
        let listed = handle.schedules().await.unwrap();
        if let Some(job_id) = listed.first().and_then(|s| s.last_job) {
            fired = Some(job_id);
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    let job_id = fired.expect("schedule never fired");
    wait_for_state(&repository, job_id, JobState::Succeeded).await;
    let job = repository.get_job(job_id).unwrap().unwrap();
    assert!(job.name().starts_with("squares-"));
    assert_eq!(
        repository.load_execution_history(job_id).unwrap()[0].payload(),
        Some(&json!(16))
    );

    assert!(handle.unschedule("squares").await.unwrap());
    assert!(!handle.unschedule("squares").await.unwrap());
    assert!(handle.schedules().await.unwrap().is_empty());
    handle.shutdown().await.unwrap();
}
