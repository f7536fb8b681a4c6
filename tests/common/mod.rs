//! Common test utilities shared across integration tests.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use dagrun::testing::{RecordingHandler, ScriptedAction};
use dagrun::{RetryPolicy, Task};

/// Directory holding the pipelines shipped with the crate.
pub fn pipelines_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("pipelines")
}

pub fn ok(id: &str) -> Task {
    Task::new(id, Arc::new(ScriptedAction::succeeding()))
}

pub fn failing(id: &str) -> Task {
    Task::new(id, Arc::new(ScriptedAction::failing("boom")))
}

/// A task that fails `failures` times and is allowed `retries` retries.
pub fn flaky(id: &str, failures: u32, retries: u32, delay: Duration) -> (Task, Arc<ScriptedAction>) {
    let action = Arc::new(ScriptedAction::failing_times(failures, "transient"));
    let task = Task::new(id, action.clone()).with_retry(RetryPolicy::fixed(retries, delay));
    (task, action)
}

/// Wait until `count` runs have completed.
///
/// Polls every 10ms.
///
/// # Panics
///
/// Panics if the timeout is reached first.
pub async fn wait_for_completed_runs(recorder: &RecordingHandler, count: usize, timeout: Duration) {
    let start = tokio::time::Instant::now();
    loop {
        let completed = recorder.completed_runs().await.len();
        if completed >= count {
            return;
        }
        if start.elapsed() > timeout {
            panic!("Timeout waiting for {count} completed runs, saw {completed}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
