//! Failure propagation, retries, sensors and cancellation.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dagrun::testing::{RecordingHandler, ScriptedAction, ScriptedCondition, TestHarness};
use dagrun::{
    ActionError, EventBus, GraphBuilder, RetryPolicy, Run, RunScheduler, RunStatus, SensorAction,
    Task, TaskState,
};
use tokio_util::sync::CancellationToken;

use crate::common::{failing, flaky, ok};

#[tokio::test]
async fn test_failure_marks_descendants_upstream_failed() {
    let graph = GraphBuilder::new("abcd", "ABCD")
        .tasks([ok("a"), ok("b"), failing("c"), ok("d")])
        .chain(&["a", "b", "c", "d"])
        .build()
        .unwrap();

    let harness = TestHarness::new().await;
    let report = harness.execute_and_assert_failure(graph).await;

    assert_eq!(report.status, RunStatus::Failed);
    assert_eq!(report.state("a"), Some(TaskState::Succeeded));
    assert_eq!(report.state("b"), Some(TaskState::Succeeded));
    assert_eq!(report.state("c"), Some(TaskState::Failed));
    assert_eq!(report.state("d"), Some(TaskState::UpstreamFailed));
    assert_eq!(report.attempts("d"), 0);

    assert_eq!(report.failure("c").unwrap().reason, "boom");
    assert_eq!(
        report.failure("d").unwrap().reason,
        "upstream task 'c' failed"
    );
    assert_eq!(
        harness.recorder().path_of("d").await,
        vec![TaskState::UpstreamFailed]
    );
}

#[tokio::test]
async fn test_fan_in_with_failed_branch_never_runs() {
    let converge = Arc::new(ScriptedAction::succeeding());
    let graph = GraphBuilder::new("fan_in", "Fan in")
        .tasks([ok("a"), ok("b"), failing("c")])
        .task(Task::new("d", converge.clone()))
        .depends_on("d", &["a", "b", "c"])
        .build()
        .unwrap();

    let report = TestHarness::new()
        .await
        .execute_and_assert_failure(graph)
        .await;

    assert_eq!(report.state("a"), Some(TaskState::Succeeded));
    assert_eq!(report.state("b"), Some(TaskState::Succeeded));
    assert_eq!(report.state("c"), Some(TaskState::Failed));
    assert_eq!(report.state("d"), Some(TaskState::UpstreamFailed));
    assert_eq!(converge.calls(), 0);
}

#[tokio::test]
async fn test_failure_propagates_through_every_descendant() {
    let graph = GraphBuilder::new("deep", "Deep")
        .tasks([failing("root"), ok("x"), ok("y"), ok("z")])
        .chain(&["root", "x", "y", "z"])
        .build()
        .unwrap();

    let report = TestHarness::new()
        .await
        .execute_and_assert_failure(graph)
        .await;

    assert_eq!(report.count(TaskState::UpstreamFailed), 3);
    assert_eq!(report.failures.len(), 4);
}

#[tokio::test]
async fn test_sibling_branch_is_unaffected_by_failure() {
    let graph = GraphBuilder::new("siblings", "Siblings")
        .tasks([ok("start"), failing("left"), ok("left_next"), ok("right"), ok("right_next")])
        .chain(&["start", "left", "left_next"])
        .chain(&["start", "right", "right_next"])
        .build()
        .unwrap();

    let report = TestHarness::new()
        .await
        .execute_and_assert_failure(graph)
        .await;

    assert_eq!(report.state("left"), Some(TaskState::Failed));
    assert_eq!(report.state("left_next"), Some(TaskState::UpstreamFailed));
    assert_eq!(report.state("right"), Some(TaskState::Succeeded));
    assert_eq!(report.state("right_next"), Some(TaskState::Succeeded));
}

#[tokio::test(start_paused = true)]
async fn test_retry_succeeds_after_transient_failures() {
    let delay = Duration::from_secs(120);
    let (task, action) = flaky("load", 2, 2, delay);
    let graph = GraphBuilder::new("retry", "Retry")
        .task(task)
        .task(ok("after"))
        .edge("load", "after")
        .build()
        .unwrap();

    let harness = TestHarness::new().await;
    let report = harness.execute_and_assert_success(graph).await;

    assert_eq!(report.attempts("load"), 3);
    assert_eq!(action.calls(), 3);

    let times = action.call_times();
    assert_eq!(times[1] - times[0], delay);
    assert_eq!(times[2] - times[1], delay);

    assert_eq!(
        harness.recorder().path_of("load").await,
        vec![
            TaskState::Queued,
            TaskState::Running,
            TaskState::Retrying,
            TaskState::Pending,
            TaskState::Queued,
            TaskState::Running,
            TaskState::Retrying,
            TaskState::Pending,
            TaskState::Queued,
            TaskState::Running,
            TaskState::Succeeded,
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_retries_exhausted_fails_task() {
    let (task, action) = flaky("load", u32::MAX, 3, Duration::from_secs(10));
    let graph = GraphBuilder::new("exhaust", "Exhaust")
        .task(task)
        .build()
        .unwrap();

    let report = TestHarness::new()
        .await
        .execute_and_assert_failure(graph)
        .await;

    assert_eq!(report.attempts("load"), 4);
    assert_eq!(action.calls(), 4);
    assert_eq!(report.failure("load").unwrap().reason, "transient");
}

#[tokio::test(start_paused = true)]
async fn test_sensor_timeout_fails_without_retry() {
    let condition = Arc::new(ScriptedCondition::never());
    let sensor = SensorAction::new(
        condition.clone(),
        Duration::from_secs(5),
        Duration::from_secs(20),
    );
    let graph = GraphBuilder::new("sensor", "Sensor")
        .task(
            Task::new("check_file", Arc::new(sensor))
                .with_retry(RetryPolicy::fixed(3, Duration::from_secs(1))),
        )
        .task(ok("save"))
        .edge("check_file", "save")
        .build()
        .unwrap();

    let started = tokio::time::Instant::now();
    let report = TestHarness::new()
        .await
        .execute_and_assert_failure(graph)
        .await;

    assert_eq!(condition.polls(), 4);
    assert_eq!(report.attempts("check_file"), 1);
    assert_eq!(started.elapsed(), Duration::from_secs(20));
    assert_eq!(
        report.failure("check_file").unwrap().reason,
        ActionError::Timeout {
            waited: Duration::from_secs(20),
            polls: 4
        }
        .to_string()
    );
    assert_eq!(report.state("save"), Some(TaskState::UpstreamFailed));
}

#[tokio::test(start_paused = true)]
async fn test_sensor_releases_downstream_when_condition_holds() {
    let condition = Arc::new(ScriptedCondition::after(2));
    let sensor = SensorAction::new(
        condition.clone(),
        Duration::from_secs(5),
        Duration::from_secs(20),
    );
    let graph = GraphBuilder::new("sensor_ok", "Sensor ok")
        .task(Task::new("check_file", Arc::new(sensor)))
        .task(ok("save"))
        .edge("check_file", "save")
        .build()
        .unwrap();

    let report = TestHarness::new()
        .await
        .execute_and_assert_success(graph)
        .await;
    assert_eq!(condition.polls(), 2);
    assert_eq!(report.state("save"), Some(TaskState::Succeeded));
}

#[tokio::test(start_paused = true)]
async fn test_cancel_stops_in_flight_and_pending_tasks() {
    let slow = Arc::new(ScriptedAction::succeeding().with_delay(Duration::from_secs(60)));
    let graph = GraphBuilder::new("cancel", "Cancel")
        .task(ok("first"))
        .task(Task::new("slow", slow.clone()))
        .task(ok("never"))
        .chain(&["first", "slow", "never"])
        .build()
        .unwrap();

    let recorder = Arc::new(RecordingHandler::new());
    let bus = Arc::new(EventBus::new());
    bus.register(recorder.clone()).await;
    let scheduler = RunScheduler::with_concurrency(2).with_event_bus(bus);

    let run = Arc::new(Run::new(Arc::new(graph), Utc::now()));
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(5)).await;
        trigger.cancel();
    });

    let started = tokio::time::Instant::now();
    let report = scheduler.execute_run(Arc::clone(&run), cancel).await;

    assert!(started.elapsed() < Duration::from_secs(60));
    assert_eq!(report.status, RunStatus::Cancelled);
    assert_eq!(report.state("first"), Some(TaskState::Succeeded));
    assert_eq!(report.state("slow"), Some(TaskState::Cancelled));
    assert_eq!(report.state("never"), Some(TaskState::Cancelled));
    assert_eq!(slow.calls(), 1);
    assert!(run.states().all_terminal().await);
    assert_eq!(recorder.completed_runs().await, vec![run.id()]);
}

#[tokio::test(start_paused = true)]
async fn test_cancelled_run_with_failed_task_reports_failed() {
    let slow = Arc::new(ScriptedAction::succeeding().with_delay(Duration::from_secs(60)));
    let graph = GraphBuilder::new("mixed", "Mixed")
        .task(Task::new("slow", slow))
        .task(failing("bad"))
        .build()
        .unwrap();

    let run = Arc::new(Run::new(Arc::new(graph), Utc::now()));
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(5)).await;
        trigger.cancel();
    });

    let report = RunScheduler::with_concurrency(2)
        .execute_run(Arc::clone(&run), cancel)
        .await;

    assert_eq!(report.state("bad"), Some(TaskState::Failed));
    assert_eq!(report.state("slow"), Some(TaskState::Cancelled));
    assert_eq!(report.status, RunStatus::Failed);
}
