//! Test: Success Chain - clone/lint/test/build/deploy runs to completion

use crate::helpers::*;
use taskline::{EngineConfig, RunStatus, SchedulingStrategy};
use tokio_util::sync::CancellationToken;

pub const CI_PIPELINE: &str = r#"
name: ci
params:
  - name: branch
    default: main
tasks:
  - name: clone
    taskRef: step
    params:
      - name: message
        value: clone $(params.branch)
  - name: lint
    taskRef: step
    runAfter: [clone]
  - name: tests
    taskRef: step
    runAfter: [clone]
  - name: build
    taskRef: step
    runAfter: [lint, tests]
    params:
      - name: message
        value: build $(tasks.clone.results.out)
  - name: deploy
    taskRef: step
    runAfter: [build]
"#;

#[tokio::test]
async fn test_full_chain_succeeds() {
    let runner = FakeRunner::new().with_result("clone", "out", "abc123");
    let harness = Harness::new(runner, EngineConfig::default());
    let mut run = harness.instantiate(CI_PIPELINE, &[]);

    let status = harness
        .engine
        .execute(&mut run, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(status, RunStatus::Succeeded);
    assert_eq!(run.status, RunStatus::Succeeded);
    assert!(run.completed_at.is_some());
    for name in ["clone", "lint", "tests", "build", "deploy"] {
        assert_eq!(state_of(&run, name), "SUCCEEDED", "{}", name);
    }
    assert!(run.first_failure().is_none());

    let trace = harness.runner.trace();
    assert_ordering(&run, &trace);
    assert_eq!(harness.runner.started().len(), 5);
}

#[tokio::test]
async fn test_result_passed_to_consumer() {
    let runner = FakeRunner::new().with_result("clone", "out", "abc123");
    let harness = Harness::new(runner, EngineConfig::default());
    let mut run = harness.instantiate(CI_PIPELINE, &[("branch", "release")]);

    harness
        .engine
        .execute(&mut run, CancellationToken::new())
        .await
        .unwrap();

    let clone = harness.runner.invocation("clone").unwrap();
    assert_eq!(clone.program, "step");
    assert_eq!(clone.args, vec!["clone release"]);

    let build = harness.runner.invocation("build").unwrap();
    assert_eq!(build.args, vec!["build abc123"]);
    assert_eq!(
        run.task("clone").unwrap().results.get("out").map(String::as_str),
        Some("abc123")
    );
}

#[tokio::test]
async fn test_sequential_strategy_runs_one_at_a_time() {
    let harness = Harness::new(
        FakeRunner::new(),
        EngineConfig {
            strategy: SchedulingStrategy::Sequential,
            ..EngineConfig::default()
        },
    );
    let mut run = harness.instantiate(CI_PIPELINE, &[]);
    harness
        .engine
        .execute(&mut run, CancellationToken::new())
        .await
        .unwrap();

    // Starts and finishes strictly alternate
    let trace = harness.runner.trace();
    for pair in trace.chunks(2) {
        match pair {
            [Trace::Started(a), Trace::Finished(b)] => assert_eq!(a, b),
            other => panic!("overlapping tasks: {:?}", other),
        }
    }
}

#[tokio::test]
async fn test_independent_tasks_overlap_in_parallel() {
    let runner = FakeRunner::new()
        .with("lint", Behavior::Sleep(std::time::Duration::from_millis(200)))
        .with("tests", Behavior::Sleep(std::time::Duration::from_millis(200)));
    let harness = Harness::new(runner, EngineConfig::default());
    let mut run = harness.instantiate(CI_PIPELINE, &[]);
    harness
        .engine
        .execute(&mut run, CancellationToken::new())
        .await
        .unwrap();

    let trace = harness.runner.trace();
    let lint_start = position(&trace, &Trace::Started("lint".to_string()));
    let tests_start = position(&trace, &Trace::Started("tests".to_string()));
    let lint_end = position(&trace, &Trace::Finished("lint".to_string()));
    let tests_end = position(&trace, &Trace::Finished("tests".to_string()));
    assert!(lint_start < tests_end && tests_start < lint_end, "{:?}", trace);
}

#[tokio::test]
async fn test_workspace_shared_and_cleaned_up() {
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
  - name: again
    taskRef: checkout
    runAfter: [fetch]
    params:
      - name: url
        value: https://example.com/other.git
    workspaces:
      - name: source
        workspace: shared
"#;
    let harness = Harness::new(FakeRunner::new(), EngineConfig::default());
    let mut run = harness.instantiate(yaml, &[]);
    let shared = run.workspace_plan.workspace_path("shared").unwrap().to_path_buf();

    let status = harness
        .engine
        .execute(&mut run, CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(status, RunStatus::Succeeded);

    let fetch = harness.runner.invocation("fetch").unwrap();
    let again = harness.runner.invocation("again").unwrap();
    assert_eq!(fetch.args[1], shared.display().to_string());
    assert_eq!(again.args[1], fetch.args[1]);

    assert!(!run.workspace_plan.run_dir().exists());
}

#[tokio::test]
async fn test_host_workspace_is_left_alone() {
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
    let host = tempfile::tempdir().unwrap();
    let harness = Harness::new(FakeRunner::new(), EngineConfig::default());
    let mut run = harness.instantiate_with_workspaces(yaml, &[("shared", host.path().to_path_buf())]);

    harness
        .engine
        .execute(&mut run, CancellationToken::new())
        .await
        .unwrap();

    let fetch = harness.runner.invocation("fetch").unwrap();
    assert_eq!(fetch.args[1], host.path().display().to_string());
    assert!(host.path().exists());
}
