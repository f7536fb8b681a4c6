//! End-to-end runs of graphs and YAML pipelines.

use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use dagrun::testing::{ScriptedAction, TestHarness, with_actions};
use dagrun::{
    ConfigError, DagError, GraphBuilder, RunStatus, Task, TaskId, TaskState, load_pipeline,
    load_pipelines_from_directory,
};

use crate::common::{ok, pipelines_dir};

fn adventure_works() -> dagrun::Pipeline {
    load_pipeline(pipelines_dir().join("adventure_works.yaml")).unwrap()
}

#[tokio::test]
async fn test_linear_chain_runs_in_dependency_order() {
    let first = Arc::new(ScriptedAction::succeeding().with_delay(Duration::from_millis(20)));
    let second = Arc::new(ScriptedAction::succeeding());
    let graph = GraphBuilder::new("linear", "Linear")
        .task(Task::new("extract", first.clone()))
        .task(Task::new("load", second.clone()))
        .task(ok("report"))
        .chain(&["extract", "load", "report"])
        .build()
        .unwrap();

    let harness = TestHarness::new().await;
    let report = harness.execute_and_assert_success(graph).await;

    assert_eq!(report.count(TaskState::Succeeded), 3);
    assert!(first.call_times()[0] < second.call_times()[0]);

    let transitions = harness.recorder().transitions().await;
    let position = |task: &str, to: TaskState| {
        transitions
            .iter()
            .position(|(id, _, state)| id.as_str() == task && *state == to)
            .unwrap()
    };
    assert!(position("extract", TaskState::Succeeded) < position("load", TaskState::Queued));
    assert!(position("load", TaskState::Succeeded) < position("report", TaskState::Queued));
}

#[tokio::test(start_paused = true)]
async fn test_fan_out_branches_run_concurrently() {
    let branches: Vec<Arc<ScriptedAction>> = (0..3)
        .map(|_| Arc::new(ScriptedAction::succeeding().with_delay(Duration::from_secs(10))))
        .collect();
    let graph = GraphBuilder::new("fan", "Fan")
        .task(ok("start"))
        .tasks(
            branches
                .iter()
                .enumerate()
                .map(|(i, action)| Task::new(format!("branch_{i}"), action.clone())),
        )
        .task(ok("join"))
        .depends_on("branch_0", &["start"])
        .depends_on("branch_1", &["start"])
        .depends_on("branch_2", &["start"])
        .depends_on("join", &["branch_0", "branch_1", "branch_2"])
        .build()
        .unwrap();

    let harness = TestHarness::with_concurrency(3).await;
    let started = tokio::time::Instant::now();
    harness.execute_and_assert_success(graph).await;

    // Three 10s branches side by side take 10s, not 30s.
    assert_eq!(started.elapsed(), Duration::from_secs(10));
    let first_starts: Vec<_> = branches.iter().map(|a| a.call_times()[0]).collect();
    assert!(first_starts.iter().all(|t| *t == first_starts[0]));
}

#[tokio::test(start_paused = true)]
async fn test_concurrency_limit_serialises_branches() {
    let graph = GraphBuilder::new("narrow", "Narrow")
        .tasks((0..4).map(|i| {
            Task::new(
                format!("t{i}"),
                Arc::new(ScriptedAction::succeeding().with_delay(Duration::from_secs(5))),
            )
        }))
        .build()
        .unwrap();

    let harness = TestHarness::with_concurrency(2).await;
    let started = tokio::time::Instant::now();
    harness.execute_and_assert_success(graph).await;

    assert_eq!(started.elapsed(), Duration::from_secs(10));
}

#[test]
fn test_adventure_works_structure() {
    let pipeline = adventure_works();
    let graph = pipeline.graph();

    assert_eq!(pipeline.id().as_str(), "adventure_works");
    assert_eq!(graph.len(), 23);
    assert_eq!(pipeline.owner(), Some("airflow"));
    assert!(!pipeline.catchup());
    assert_eq!(
        pipeline.schedule().map(|s| s.expression()),
        Some("@daily")
    );
    assert_eq!(
        pipeline.start_date(),
        Some(Utc.with_ymd_and_hms(2024, 9, 20, 0, 0, 0).unwrap())
    );

    let schema = TaskId::new("create_adventure_works_schema");
    let upstream: Vec<&str> = graph.upstream(&schema).map(|t| t.as_str()).collect();
    assert_eq!(
        upstream,
        vec![
            "save_customer_to_hdfs",
            "save_date_to_hdfs",
            "save_internet_sale_to_hdfs",
            "save_product_to_hdfs",
        ]
    );
    assert_eq!(graph.downstream(&schema).count(), 4);

    let sales = TaskId::new("process_internet_sale");
    let upstream: Vec<&str> = graph.upstream(&sales).map(|t| t.as_str()).collect();
    assert_eq!(
        upstream,
        vec![
            "create_internet_sale_table",
            "process_customer",
            "process_date",
            "process_product",
        ]
    );

    let roots: Vec<&str> = graph.roots().into_iter().map(|t| t.as_str()).collect();
    assert_eq!(roots.len(), 4);
    assert!(roots.iter().all(|r| r.starts_with("download_")));
    let leaves: Vec<&str> = graph.leaves().into_iter().map(|t| t.as_str()).collect();
    assert_eq!(leaves, vec!["sending_slack"]);

    let order = graph.topological_order();
    let at = |id: &str| order.iter().position(|t| t.as_str() == id).unwrap();
    assert!(at("process_internet_sale") < at("sending_email"));
    assert!(at("sending_email") < at("sending_slack"));
}

#[test]
fn test_adventure_works_task_kinds_and_retries() {
    let pipeline = adventure_works();
    let graph = pipeline.graph();
    let kind = |id: &str| graph.task(&TaskId::new(id)).unwrap().action().kind();

    assert_eq!(kind("download_customer_data"), "command");
    assert_eq!(kind("check_customer_file"), "sensor");
    assert_eq!(kind("create_date_table"), "ddl");
    assert_eq!(kind("process_date"), "spark_submit");
    assert_eq!(kind("sending_email"), "email");
    assert_eq!(kind("sending_slack"), "slack");

    let retry = |id: &str| graph.task(&TaskId::new(id)).unwrap().retry_policy().clone();
    assert_eq!(retry("process_customer").retries, 1);
    assert_eq!(retry("process_customer").delay, Duration::from_secs(120));
    assert_eq!(retry("check_customer_file").retries, 0);
}

#[tokio::test]
async fn test_adventure_works_runs_to_success() {
    let pipeline = adventure_works();
    let graph = with_actions(pipeline.graph(), |_| Arc::new(ScriptedAction::succeeding())).unwrap();

    let harness = TestHarness::with_concurrency(pipeline.max_active_tasks()).await;
    let report = harness.execute_and_assert_success(graph).await;

    assert_eq!(report.count(TaskState::Succeeded), 23);
    assert!(report.failures.is_empty());

    // The shared schema task waits for every upload.
    let transitions = harness.recorder().transitions().await;
    let position = |task: &str, to: TaskState| {
        transitions
            .iter()
            .position(|(id, _, state)| id.as_str() == task && *state == to)
            .unwrap()
    };
    let schema_start = position("create_adventure_works_schema", TaskState::Running);
    for save in [
        "save_customer_to_hdfs",
        "save_product_to_hdfs",
        "save_date_to_hdfs",
        "save_internet_sale_to_hdfs",
    ] {
        assert!(position(save, TaskState::Succeeded) < schema_start);
    }
    assert!(
        position("sending_email", TaskState::Succeeded)
            < position("sending_slack", TaskState::Running)
    );
}

#[tokio::test(start_paused = true)]
async fn test_adventure_works_failed_table_blocks_only_its_descendants() {
    let pipeline = adventure_works();
    let graph = with_actions(pipeline.graph(), |task| {
        if task.id().as_str() == "create_product_table" {
            Arc::new(ScriptedAction::failing("hive unavailable"))
        } else {
            Arc::new(ScriptedAction::succeeding())
        }
    })
    .unwrap();

    let harness = TestHarness::new().await;
    let report = harness.execute_and_assert_failure(graph).await;

    assert_eq!(report.status, RunStatus::Failed);
    // One retry from the default args.
    assert_eq!(report.attempts("create_product_table"), 2);
    assert_eq!(report.state("create_product_table"), Some(TaskState::Failed));

    for blocked in [
        "process_product",
        "process_internet_sale",
        "sending_email",
        "sending_slack",
    ] {
        assert_eq!(report.state(blocked), Some(TaskState::UpstreamFailed), "{blocked}");
        assert_eq!(report.attempts(blocked), 0);
    }
    for unaffected in [
        "process_customer",
        "process_date",
        "create_internet_sale_table",
    ] {
        assert_eq!(report.state(unaffected), Some(TaskState::Succeeded), "{unaffected}");
    }

    let failure = report.failure("sending_slack").unwrap();
    assert_eq!(failure.reason, "upstream task 'sending_email' failed");
}

#[test]
fn test_pipelines_directory_is_valid() {
    let pipelines = load_pipelines_from_directory(pipelines_dir()).unwrap();
    assert!(pipelines.iter().any(|p| p.id().as_str() == "adventure_works"));
}

#[test]
fn test_directory_with_cyclic_pipeline_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("cyclic.yaml"),
        r#"
id: cyclic
name: Cyclic
tasks:
  - id: a
    type: shell
    script: "true"
    depends_on: [b]
  - id: b
    type: shell
    script: "true"
    depends_on: [a]
"#,
    )
    .unwrap();

    let err = load_pipelines_from_directory(dir.path()).unwrap_err();
    assert!(matches!(err, ConfigError::Graph(DagError::Cycle { .. })));
}
