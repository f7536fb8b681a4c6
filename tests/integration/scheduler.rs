//! Scheduler tests against the shipped pipeline and small inline ones.

use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use dagrun::testing::{RecordingHandler, ScriptedAction, with_actions};
use dagrun::{
    Event, EventBus, GraphBuilder, Pipeline, RunStatus, Schedule, Scheduler, SchedulerError,
    SchedulerState, Task, load_pipeline,
};

use crate::common::{pipelines_dir, wait_for_completed_runs};

async fn recording_bus() -> (Arc<EventBus>, Arc<RecordingHandler>) {
    let bus = Arc::new(EventBus::new());
    let recorder = Arc::new(RecordingHandler::new());
    bus.register(recorder.clone()).await;
    (bus, recorder)
}

/// The shipped pipeline with every action replaced by a scripted success.
fn scripted_adventure_works() -> Pipeline {
    let pipeline = load_pipeline(pipelines_dir().join("adventure_works.yaml")).unwrap();
    let graph = with_actions(pipeline.graph(), |_| Arc::new(ScriptedAction::succeeding())).unwrap();
    Pipeline::new(graph)
        .with_max_active_tasks(pipeline.max_active_tasks())
        .with_max_active_runs(1)
}

fn single_task(id: &str, action: ScriptedAction) -> Pipeline {
    let graph = GraphBuilder::new(id, id)
        .task(Task::new("work", Arc::new(action)))
        .build()
        .unwrap();
    Pipeline::new(graph)
}

#[tokio::test]
async fn test_trigger_adventure_works_for_logical_date() {
    let (bus, recorder) = recording_bus().await;
    let mut scheduler = Scheduler::new().with_event_bus(bus);
    scheduler.register(scripted_adventure_works());

    let (handle, task) = scheduler.start();
    let logical_date = Utc.with_ymd_and_hms(2024, 9, 21, 0, 0, 0).unwrap();
    let run_id = handle
        .trigger_at("adventure_works", logical_date)
        .await
        .unwrap();
    wait_for_completed_runs(&recorder, 1, Duration::from_secs(5)).await;

    let events = recorder.events().await;
    let started = events.iter().find_map(|e| match e {
        Event::RunStarted {
            run_id: id,
            logical_date,
            ..
        } if *id == run_id => Some(*logical_date),
        _ => None,
    });
    assert_eq!(started, Some(logical_date));

    let report = events.iter().find_map(|e| match e {
        Event::RunCompleted { report, .. } => Some(Arc::clone(report)),
        _ => None,
    });
    let report = report.unwrap();
    assert_eq!(report.status, RunStatus::Succeeded);
    assert_eq!(report.states.len(), 23);

    handle.shutdown().await.unwrap();
    task.await.unwrap();
}

#[tokio::test]
async fn test_cancel_through_handle() {
    let (bus, recorder) = recording_bus().await;
    let mut scheduler = Scheduler::new().with_event_bus(bus);
    scheduler.register(single_task(
        "slow",
        ScriptedAction::succeeding().with_delay(Duration::from_secs(60)),
    ));

    let (handle, task) = scheduler.start();
    let run_id = handle.trigger("slow").await.unwrap();
    let active = handle.active_runs().await.unwrap();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].run_id, run_id);

    handle.cancel(run_id).await.unwrap();
    wait_for_completed_runs(&recorder, 1, Duration::from_secs(5)).await;

    let status = recorder.events().await.iter().find_map(|e| match e {
        Event::RunCompleted { status, .. } => Some(*status),
        _ => None,
    });
    assert_eq!(status, Some(RunStatus::Cancelled));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(handle.active_runs().await.unwrap().is_empty());

    handle.shutdown().await.unwrap();
    task.await.unwrap();
}

#[tokio::test]
async fn test_paused_scheduler_skips_ticks_but_allows_triggers() {
    let (bus, recorder) = recording_bus().await;
    let mut scheduler = Scheduler::new()
        .with_event_bus(bus)
        .with_tick_interval(Duration::from_millis(50));
    scheduler.register(
        single_task("ticking", ScriptedAction::succeeding())
            .with_schedule(Schedule::new("* * * * * *").unwrap()),
    );

    let (handle, task) = scheduler.start();
    handle.pause().await.unwrap();
    assert_eq!(handle.state().await, SchedulerState::Paused);
    tokio::time::sleep(Duration::from_millis(100)).await;
    recorder.clear().await;

    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert!(recorder.completed_runs().await.is_empty());

    // Manual triggers still run while paused.
    handle.trigger("ticking").await.unwrap();
    wait_for_completed_runs(&recorder, 1, Duration::from_secs(5)).await;

    handle.resume().await.unwrap();
    wait_for_completed_runs(&recorder, 2, Duration::from_secs(5)).await;

    handle.shutdown().await.unwrap();
    task.await.unwrap();
}

#[tokio::test]
async fn test_max_active_runs_through_handle() {
    let mut scheduler = Scheduler::new();
    scheduler.register(
        single_task(
            "exclusive",
            ScriptedAction::succeeding().with_delay(Duration::from_millis(500)),
        )
        .with_max_active_runs(1),
    );

    let (handle, task) = scheduler.start();
    handle.trigger("exclusive").await.unwrap();
    let err = handle.trigger("exclusive").await.unwrap_err();
    assert!(matches!(err, SchedulerError::MaxActiveRunsExceeded(id) if id == "exclusive"));

    handle.shutdown().await.unwrap();
    task.await.unwrap();
}

#[tokio::test]
async fn test_shutdown_waits_for_active_runs() {
    let (bus, recorder) = recording_bus().await;
    let mut scheduler = Scheduler::new()
        .with_event_bus(bus)
        .with_shutdown_timeout(Duration::from_secs(10));
    scheduler.register(single_task(
        "short",
        ScriptedAction::succeeding().with_delay(Duration::from_millis(200)),
    ));

    let (handle, task) = scheduler.start();
    handle.trigger("short").await.unwrap();
    handle.shutdown().await.unwrap();
    task.await.unwrap();

    let status = recorder.events().await.iter().find_map(|e| match e {
        Event::RunCompleted { status, .. } => Some(*status),
        _ => None,
    });
    assert_eq!(status, Some(RunStatus::Succeeded));
}

#[tokio::test]
async fn test_handle_fails_after_shutdown() {
    let (handle, task) = Scheduler::new().start();
    handle.shutdown().await.unwrap();
    task.await.unwrap();

    let err = handle.trigger("anything").await.unwrap_err();
    assert!(matches!(err, SchedulerError::ChannelError(_)));
}
