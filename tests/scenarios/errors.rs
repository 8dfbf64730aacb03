//! Test: Validation errors are raised before anything executes

use crate::helpers::*;
use std::collections::BTreeMap;
use taskline::core::config::PipelineConfig;
use taskline::core::params::ParamValue;
use taskline::{PipelineDefinition, PipelineError, WorkspaceManager};

fn to_definition(yaml: &str) -> Result<PipelineDefinition, PipelineError> {
    PipelineConfig::from_yaml(yaml)?.to_definition()
}

fn instantiate(yaml: &str, params: &[(&str, &str)]) -> Result<taskline::Run, PipelineError> {
    let overrides: BTreeMap<String, ParamValue> = params
        .iter()
        .map(|(k, v)| (k.to_string(), ParamValue::from(*v)))
        .collect();
    taskline::Run::instantiate(
        std::sync::Arc::new(to_definition(yaml)?),
        &registry(),
        &WorkspaceManager::new(std::env::temp_dir().join("taskline-errors")),
        &overrides,
        &BTreeMap::new(),
    )
}

#[test]
fn test_cycle_is_rejected() {
    let yaml = r#"
name: loop
tasks:
  - name: a
    taskRef: step
    runAfter: [c]
  - name: b
    taskRef: step
    runAfter: [a]
  - name: c
    taskRef: step
    runAfter: [b]
  - name: free
    taskRef: step
"#;
    match to_definition(yaml) {
        Err(PipelineError::CycleDetected { mut tasks }) => {
            tasks.sort();
            assert_eq!(tasks, vec!["a", "b", "c"]);
        }
        other => panic!("expected cycle, got {:?}", other.map(|d| d.name)),
    }
}

#[test]
fn test_cycle_through_result_reference() {
    let yaml = r#"
name: loop
tasks:
  - name: a
    taskRef: step
    params:
      - name: message
        value: $(tasks.b.results.out)
  - name: b
    taskRef: step
    runAfter: [a]
"#;
    assert!(matches!(
        to_definition(yaml),
        Err(PipelineError::CycleDetected { .. })
    ));
}

#[test]
fn test_unknown_predecessor() {
    let yaml = r#"
name: bad
tasks:
  - name: a
    taskRef: step
    runAfter: [ghost]
"#;
    assert!(matches!(
        to_definition(yaml),
        Err(PipelineError::UnknownPredecessor { ref predecessor, .. }) if predecessor == "ghost"
    ));
}

#[test]
fn test_duplicate_task() {
    let yaml = r#"
name: bad
tasks:
  - name: a
    taskRef: step
  - name: a
    taskRef: step
"#;
    assert!(matches!(
        to_definition(yaml),
        Err(PipelineError::DuplicateTask(ref name)) if name == "a"
    ));
}

#[test]
fn test_missing_required_pipeline_parameter() {
    let yaml = r#"
name: needs-url
params:
  - name: url
tasks:
  - name: a
    taskRef: step
"#;
    assert!(matches!(
        instantiate(yaml, &[]),
        Err(PipelineError::MissingRequiredParameter(ref name)) if name == "url"
    ));
    assert!(instantiate(yaml, &[("url", "https://example.com")]).is_ok());
}

#[test]
fn test_missing_required_task_parameter() {
    let yaml = r#"
name: checkout
workspaces:
  - name: shared
tasks:
  - name: fetch
    taskRef: checkout
    workspaces:
      - name: source
        workspace: shared
"#;
    assert!(matches!(
        instantiate(yaml, &[]),
        Err(PipelineError::MissingRequiredParameter(ref name)) if name == "fetch.url"
    ));
}

#[test]
fn test_unknown_kind() {
    let yaml = r#"
name: bad
tasks:
  - name: a
    taskRef: kaniko
"#;
    assert!(matches!(
        instantiate(yaml, &[]),
        Err(PipelineError::UnknownTaskKind(ref kind)) if kind == "kaniko"
    ));
}

#[test]
fn test_unbound_and_unknown_workspaces() {
    let unbound = r#"
name: checkout
tasks:
  - name: fetch
    taskRef: checkout
    params:
      - name: url
        value: https://example.com/repo.git
"#;
    assert!(matches!(
        instantiate(unbound, &[]),
        Err(PipelineError::UnboundWorkspace { ref workspace, .. }) if workspace == "source"
    ));

    let unknown = r#"
name: checkout
tasks:
  - name: fetch
    taskRef: checkout
    params:
      - name: url
        value: https://example.com/repo.git
    workspaces:
      - name: source
        workspace: nowhere
"#;
    assert!(matches!(
        instantiate(unknown, &[]),
        Err(PipelineError::UnknownWorkspace { ref workspace, .. }) if workspace == "nowhere"
    ));
}

#[test]
fn test_string_parameter_given_array() {
    let yaml = r#"
name: types
params:
  - name: flags
    type: array
    default: ["-v"]
tasks:
  - name: a
    taskRef: step
    params:
      - name: message
        value: ["-v"]
"#;
    assert!(matches!(
        instantiate(yaml, &[]),
        Err(PipelineError::ParameterTypeMismatch { .. })
    ));
}

#[test]
fn test_unresolved_references() {
    let undeclared = r#"
name: refs
tasks:
  - name: a
    taskRef: step
    params:
      - name: message
        value: $(params.nope)
"#;
    assert!(matches!(
        instantiate(undeclared, &[]),
        Err(PipelineError::UnresolvedReference(_))
    ));

    let unknown_result = r#"
name: refs
tasks:
  - name: a
    taskRef: step
  - name: b
    taskRef: step
    params:
      - name: message
        value: $(tasks.a.results.missing)
"#;
    assert!(matches!(
        instantiate(unknown_result, &[]),
        Err(PipelineError::UnresolvedReference(_))
    ));
}

#[test]
fn test_names_that_leave_the_run_directory_are_rejected() {
    let escaping_workspace = r#"
name: escape
workspaces:
  - name: ../../../escaped-ws
tasks:
  - name: fetch
    taskRef: step
"#;
    let absolute_task = r#"
name: escape
tasks:
  - name: /tmp/abs-task-results
    taskRef: step
"#;
    let upper_case_task = r#"
name: escape
tasks:
  - name: Build
    taskRef: step
"#;

    for yaml in [escaping_workspace, absolute_task, upper_case_task] {
        let err = match to_definition(yaml) {
            Err(err) => err,
            Ok(definition) => panic!("accepted {:?}", definition.tasks[0].name),
        };
        assert!(matches!(err, PipelineError::InvalidDefinition(_)), "{:?}", err);
        assert!(err.is_validation());
    }
}

#[test]
fn test_errors_are_validation_errors() {
    let err = instantiate("name: x\ntasks:\n  - name: a\n    taskRef: kaniko\n", &[]).unwrap_err();
    assert!(err.is_validation());
}

#[test]
fn test_demo_pipeline_is_valid() {
    let definition = PipelineConfig::from_yaml(include_str!("../../demos/ci-cd.yaml"))
        .unwrap()
        .to_definition()
        .unwrap();
    assert_eq!(definition.name, "cd-pipeline");

    let mut deploy_deps = definition.graph().predecessors("deploy");
    deploy_deps.sort();
    assert_eq!(deploy_deps, vec!["build", "clone"]);

    let run = taskline::Run::instantiate(
        std::sync::Arc::new(definition),
        &taskline::TaskRegistry::with_builtins(),
        &WorkspaceManager::new(std::env::temp_dir().join("taskline-demo")),
        &[
            ("repo-url".to_string(), ParamValue::from("https://example.com/accounts.git")),
            ("build-image".to_string(), ParamValue::from("registry.local/accounts:1")),
        ]
        .into_iter()
        .collect(),
        &BTreeMap::new(),
    )
    .unwrap();
    assert_eq!(run.tasks.len(), 6);
    assert_eq!(run.params.get("branch"), Some(&ParamValue::from("main")));
}
