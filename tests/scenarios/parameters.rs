//! Test: Parameters - defaults, overrides and expansion into task commands

use crate::helpers::*;
use taskline::core::params::ParamValue;
use taskline::EngineConfig;
use tokio_util::sync::CancellationToken;

const PARAMS_PIPELINE: &str = r#"
name: params
params:
  - name: branch
    default: main
  - name: flags
    type: array
    default: ["-v", "--cover"]
tasks:
  - name: show
    taskRef: step
    params:
      - name: message
        value: "$(params.branch) in $(context.pipeline.name)/$(context.pipelineTask.name)"
      - name: args
        value: $(params.flags[*])
"#;

#[tokio::test]
async fn test_default_applies_when_not_overridden() {
    let harness = Harness::new(FakeRunner::new(), EngineConfig::default());
    let run = harness.instantiate(PARAMS_PIPELINE, &[]);

    assert_eq!(run.params.get("branch"), Some(&ParamValue::from("main")));
    assert_eq!(
        run.params.get("flags"),
        Some(&ParamValue::Array(vec!["-v".to_string(), "--cover".to_string()]))
    );
}

#[tokio::test]
async fn test_override_wins_and_unknown_is_ignored() {
    let harness = Harness::new(FakeRunner::new(), EngineConfig::default());
    let run = harness.instantiate(PARAMS_PIPELINE, &[("branch", "dev"), ("unused", "x")]);

    assert_eq!(run.params.get("branch"), Some(&ParamValue::from("dev")));
    assert!(!run.params.contains_key("unused"));
}

#[tokio::test]
async fn test_array_expands_to_separate_arguments() {
    let harness = Harness::new(FakeRunner::new(), EngineConfig::default());
    let mut run = harness.instantiate(PARAMS_PIPELINE, &[("flags", "-x, --fast")]);

    harness
        .engine
        .execute(&mut run, CancellationToken::new())
        .await
        .unwrap();

    let show = harness.runner.invocation("show").unwrap();
    assert_eq!(show.args, vec!["main in params/show", "-x", "--fast"]);
}

#[tokio::test]
async fn test_substitution_is_single_pass() {
    let harness = Harness::new(FakeRunner::new(), EngineConfig::default());
    let mut run = harness.instantiate(PARAMS_PIPELINE, &[("branch", "$(params.flags)")]);

    harness
        .engine
        .execute(&mut run, CancellationToken::new())
        .await
        .unwrap();

    let show = harness.runner.invocation("show").unwrap();
    assert_eq!(show.args[0], "$(params.flags) in params/show");
}

#[tokio::test]
async fn test_run_id_context_reference() {
    let yaml = r#"
name: ids
tasks:
  - name: tag
    taskRef: step
    params:
      - name: message
        value: build-$(context.pipelineRun.name)
"#;
    let harness = Harness::new(FakeRunner::new(), EngineConfig::default());
    let mut run = harness.instantiate(yaml, &[]);
    harness
        .engine
        .execute(&mut run, CancellationToken::new())
        .await
        .unwrap();

    let tag = harness.runner.invocation("tag").unwrap();
    assert_eq!(tag.args, vec![format!("build-{}", run.id)]);
    assert_eq!(tag.run_id, run.id);
}
