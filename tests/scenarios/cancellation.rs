//! Test: Cancellation - waiting tasks cancel at once, running tasks are asked to stop

use crate::helpers::*;
use std::time::Duration;
use taskline::{EngineConfig, PipelineError, RunStatus, TaskState};
use tokio_util::sync::CancellationToken;

const TESTS_THEN_LINT: &str = r#"
name: ci
tasks:
  - name: tests
    taskRef: step
  - name: lint
    taskRef: step
    runAfter: [tests]
"#;

#[tokio::test]
async fn test_cancel_while_tests_running_and_lint_pending() {
    let runner = FakeRunner::new().with("tests", Behavior::Hang);
    let harness = Harness::new(runner.clone(), EngineConfig::default());
    let mut run = harness.instantiate(TESTS_THEN_LINT, &[]);
    let cancel = CancellationToken::new();

    let (status, ()) = tokio::join!(harness.engine.execute(&mut run, cancel.clone()), async {
        runner.wait_started("tests").await;
        cancel.cancel();
    });

    assert_eq!(status.unwrap(), RunStatus::Cancelled);
    assert_eq!(run.status, RunStatus::Cancelled);

    match &run.task("lint").unwrap().state {
        TaskState::Cancelled { started_at, .. } => assert!(started_at.is_none()),
        other => panic!("unexpected lint state {:?}", other),
    }
    match &run.task("tests").unwrap().state {
        TaskState::Cancelled { started_at, .. } => assert!(started_at.is_some()),
        other => panic!("unexpected tests state {:?}", other),
    }
    assert_eq!(run.task("tests").unwrap().logs, "tests interrupted\n");

    // lint is cancelled synchronously, before tests reports back
    assert_eq!(harness.transitions_to("CANCELLED"), vec!["lint", "tests"]);
    assert_eq!(runner.started(), vec!["tests"]);
    assert!(matches!(run.outcome(), Err(PipelineError::CancelledByUser)));
}

#[tokio::test]
async fn test_cancel_before_start() {
    let harness = Harness::new(FakeRunner::new(), EngineConfig::default());
    let mut run = harness.instantiate(TESTS_THEN_LINT, &[]);
    let cancel = CancellationToken::new();
    cancel.cancel();

    let status = harness.engine.execute(&mut run, cancel).await.unwrap();

    assert_eq!(status, RunStatus::Cancelled);
    assert!(harness.runner.started().is_empty());
    assert!(run
        .tasks
        .iter()
        .all(|t| matches!(t.state, TaskState::Cancelled { .. })));
}

#[tokio::test]
async fn test_cancelled_run_still_cleans_up() {
    let runner = FakeRunner::new().with("tests", Behavior::Sleep(Duration::from_secs(30)));
    let harness = Harness::new(runner.clone(), EngineConfig::default());
    let mut run = harness.instantiate(TESTS_THEN_LINT, &[]);
    let cancel = CancellationToken::new();

    let (status, ()) = tokio::join!(harness.engine.execute(&mut run, cancel.clone()), async {
        runner.wait_started("tests").await;
        assert!(run_dir_exists(&harness));
        cancel.cancel();
    });

    assert_eq!(status.unwrap(), RunStatus::Cancelled);
    assert!(!run.workspace_plan.run_dir().exists());
}

fn run_dir_exists(harness: &Harness) -> bool {
    std::fs::read_dir(harness.root.path())
        .map(|mut entries| entries.next().is_some())
        .unwrap_or(false)
}
