//! Test: Failure Handling - drain, fail-fast and the first failure

use crate::helpers::*;
use crate::success_chain::CI_PIPELINE;
use std::time::Duration;
use taskline::{EngineConfig, FailurePolicy, PipelineError, RunStatus, TaskState};
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn test_lint_failure_drains_running_tests() {
    let runner = FakeRunner::new()
        .with("lint", Behavior::Fail(1))
        .with("tests", Behavior::Sleep(Duration::from_millis(300)));
    let harness = Harness::new(runner, EngineConfig::default());
    let mut run = harness.instantiate(CI_PIPELINE, &[]);

    let status = harness
        .engine
        .execute(&mut run, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(status, RunStatus::Failed);
    assert_eq!(state_of(&run, "clone"), "SUCCEEDED");
    assert_eq!(state_of(&run, "lint"), "FAILED");
    // Already running when lint failed, so allowed to finish
    assert_eq!(state_of(&run, "tests"), "SUCCEEDED");
    assert_eq!(state_of(&run, "build"), "SKIPPED");
    assert_eq!(state_of(&run, "deploy"), "SKIPPED");

    let started = harness.runner.started();
    assert!(!started.contains(&"build".to_string()));
    assert!(!started.contains(&"deploy".to_string()));

    let failure = run.first_failure().unwrap();
    assert_eq!(failure.task, "lint");
    assert_eq!(failure.exit_code, Some(1));
    assert_eq!(failure.error, "exited with code 1");
    assert!(failure.logs.contains("lint broke"));

    assert!(matches!(
        run.outcome(),
        Err(PipelineError::TaskExecutionFailed { ref task, .. }) if task == "lint"
    ));
}

#[tokio::test]
async fn test_fail_fast_cancels_running_tasks() {
    let runner = FakeRunner::new()
        .with("lint", Behavior::Fail(2))
        .with("tests", Behavior::Hang);
    let harness = Harness::new(
        runner,
        EngineConfig {
            failure_policy: FailurePolicy::FailFast,
            ..EngineConfig::default()
        },
    );
    let mut run = harness.instantiate(CI_PIPELINE, &[]);

    let status = tokio::time::timeout(
        Duration::from_secs(5),
        harness.engine.execute(&mut run, CancellationToken::new()),
    )
    .await
    .expect("fail-fast run did not finish")
    .unwrap();

    assert_eq!(status, RunStatus::Failed);
    assert_eq!(state_of(&run, "lint"), "FAILED");
    assert_eq!(state_of(&run, "tests"), "CANCELLED");
    assert_eq!(state_of(&run, "build"), "SKIPPED");
    assert_eq!(run.first_failure().unwrap().task, "lint");
}

#[tokio::test]
async fn test_first_failure_is_earliest() {
    let yaml = r#"
name: fan-out
tasks:
  - name: slow
    taskRef: step
  - name: fast
    taskRef: step
"#;
    let runner = FakeRunner::new()
        .with("fast", Behavior::Fail(3))
        .with("slow", Behavior::Sleep(Duration::from_millis(200)));
    let harness = Harness::new(runner, EngineConfig::default());
    let mut run = harness.instantiate(yaml, &[]);

    harness
        .engine
        .execute(&mut run, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(run.first_failure().unwrap().task, "fast");
    assert_eq!(state_of(&run, "slow"), "SUCCEEDED");
    assert_eq!(run.status, RunStatus::Failed);
}

#[tokio::test]
async fn test_missing_result_fails_consumer() {
    let yaml = r#"
name: results
tasks:
  - name: make
    taskRef: step
  - name: use
    taskRef: step
    params:
      - name: message
        value: $(tasks.make.results.out)
"#;
    // make succeeds without writing its result
    let harness = Harness::new(FakeRunner::new(), EngineConfig::default());
    let mut run = harness.instantiate(yaml, &[]);

    let status = harness
        .engine
        .execute(&mut run, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(status, RunStatus::Failed);
    assert_eq!(state_of(&run, "make"), "SUCCEEDED");
    match &run.task("use").unwrap().state {
        TaskState::Failed {
            started_at, error, ..
        } => {
            assert!(started_at.is_none());
            assert!(error.contains("tasks.make.results.out"), "{}", error);
        }
        other => panic!("unexpected state {:?}", other),
    }
    assert!(harness.runner.invocation("use").is_none());
}

#[tokio::test]
async fn test_failed_task_timeout() {
    let yaml = r#"
name: slow
tasks:
  - name: wait
    taskRef: step
    timeoutSecs: 1
"#;
    let runner = FakeRunner::new().with("wait", Behavior::Hang);
    let harness = Harness::new(runner, EngineConfig::default());
    let mut run = harness.instantiate(yaml, &[]);

    let status = harness
        .engine
        .execute(&mut run, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(status, RunStatus::Failed);
    let failure = run.first_failure().unwrap();
    assert_eq!(failure.task, "wait");
    assert_eq!(failure.error, "timeout after 1 seconds");
    // Output printed before the deadline still reaches the failure summary
    assert_eq!(failure.logs, "wait interrupted\n");
    assert!(harness.runner.trace().contains(&Trace::Finished("wait".to_string())));
}

#[tokio::test]
async fn test_provisioning_failure_runs_nothing() {
    let yaml = r#"
name: checkout
workspaces:
  - name: shared
tasks:
  - name: fetch
    taskRef: checkout
    params:
      - name: url
        value: https://example.com/repo.git
    workspaces:
      - name: source
        workspace: shared
"#;
    let missing = std::env::temp_dir().join(format!("taskline-missing-{}", uuid::Uuid::new_v4()));
    let harness = Harness::new(FakeRunner::new(), EngineConfig::default());
    let mut run = harness.instantiate_with_workspaces(yaml, &[("shared", missing)]);

    let err = harness
        .engine
        .execute(&mut run, CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, PipelineError::WorkspaceProvisionFailed(_)));
    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(state_of(&run, "fetch"), "SKIPPED");
    assert!(harness.runner.started().is_empty());
}
