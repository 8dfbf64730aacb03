//! Shared fixtures for scenario tests

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use taskline::core::config::PipelineConfig;
use taskline::core::params::ParamValue;
use taskline::registry::{Invocation, TaskError, TaskOutput};
use taskline::{
    EngineConfig, ExecutionEngine, PipelineDefinition, Run, RunEvent, TaskRegistry, TaskRunner,
    WorkspaceManager,
};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

/// Task kinds used by the scenarios
pub const CATALOG: &str = r#"
tasks:
  - kind: step
    params:
      - name: message
        default: ""
      - name: args
        type: array
        default: []
    results: [out]
    command: ["step", "$(params.message)", "$(params.args[*])"]
  - kind: checkout
    params:
      - name: url
    workspaces: [source]
    results: [commit]
    command: ["checkout", "$(params.url)", "$(workspaces.source.path)"]
"#;

/// What the fake does when a task starts
#[derive(Debug, Clone)]
pub enum Behavior {
    Succeed,
    /// Succeed after a delay, unless cancelled first
    Sleep(Duration),
    Fail(i32),
    /// Run until cancelled
    Hang,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Trace {
    Started(String),
    Finished(String),
}

/// A runner that never spawns processes
///
/// Every start and finish is appended to a shared trace, so ordering can be
/// asserted without relying on wall-clock timestamps.
#[derive(Clone, Default)]
pub struct FakeRunner {
    behaviors: HashMap<String, Behavior>,
    results: HashMap<String, Vec<(String, String)>>,
    trace: Arc<Mutex<Vec<Trace>>>,
    invocations: Arc<Mutex<Vec<Invocation>>>,
}

impl FakeRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, task: &str, behavior: Behavior) -> Self {
        self.behaviors.insert(task.to_string(), behavior);
        self
    }

    /// Write `value` as result `name` when `task` succeeds
    pub fn with_result(mut self, task: &str, name: &str, value: &str) -> Self {
        self.results
            .entry(task.to_string())
            .or_default()
            .push((name.to_string(), value.to_string()));
        self
    }

    pub fn trace(&self) -> Vec<Trace> {
        self.trace.lock().unwrap().clone()
    }

    pub fn started(&self) -> Vec<String> {
        self.trace()
            .into_iter()
            .filter_map(|t| match t {
                Trace::Started(name) => Some(name),
                Trace::Finished(_) => None,
            })
            .collect()
    }

    pub fn invocation(&self, task: &str) -> Option<Invocation> {
        self.invocations
            .lock()
            .unwrap()
            .iter()
            .find(|i| i.task == task)
            .cloned()
    }

    /// Wait until `task` has started
    pub async fn wait_started(&self, task: &str) {
        for _ in 0..500 {
            if self.started().iter().any(|t| t == task) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("task {} never started", task);
    }

    fn push(&self, entry: Trace) {
        self.trace.lock().unwrap().push(entry);
    }
}

#[async_trait]
impl TaskRunner for FakeRunner {
    async fn run(
        &self,
        invocation: &Invocation,
        cancel: CancellationToken,
    ) -> Result<TaskOutput, TaskError> {
        let task = invocation.task.clone();
        self.invocations.lock().unwrap().push(invocation.clone());
        self.push(Trace::Started(task.clone()));

        let behavior = self
            .behaviors
            .get(&task)
            .cloned()
            .unwrap_or(Behavior::Succeed);

        let outcome = match behavior {
            Behavior::Succeed => Ok(()),
            Behavior::Fail(code) => Err(TaskError::Exit {
                code,
                logs: format!("{} broke\n", task),
            }),
            Behavior::Sleep(delay) => tokio::select! {
                _ = tokio::time::sleep(delay) => Ok(()),
                _ = cancel.cancelled() => Err(TaskError::Cancelled { logs: String::new() }),
            },
            Behavior::Hang => {
                cancel.cancelled().await;
                Err(TaskError::Cancelled {
                    logs: format!("{} interrupted\n", task),
                })
            }
        };

        if outcome.is_ok() {
            for (name, value) in self.results.get(&task).into_iter().flatten() {
                tokio::fs::write(invocation.results_dir.join(name), value)
                    .await
                    .unwrap();
            }
        }

        self.push(Trace::Finished(task.clone()));
        outcome.map(|()| TaskOutput {
            exit_code: 0,
            logs: format!("{} ok\n", task),
        })
    }
}

pub fn registry() -> TaskRegistry {
    let mut registry = TaskRegistry::new();
    registry.load_catalog_yaml(CATALOG).unwrap();
    registry
}

pub fn definition(yaml: &str) -> Arc<PipelineDefinition> {
    Arc::new(PipelineConfig::from_yaml(yaml).unwrap().to_definition().unwrap())
}

/// An engine over a fresh temporary workspace root
pub struct Harness {
    pub engine: ExecutionEngine<FakeRunner>,
    pub runner: FakeRunner,
    pub events: Arc<Mutex<Vec<RunEvent>>>,
    pub root: TempDir,
}

impl Harness {
    pub fn new(runner: FakeRunner, config: EngineConfig) -> Self {
        let root = tempfile::tempdir().unwrap();
        let mut engine = ExecutionEngine::new(
            runner.clone(),
            registry(),
            WorkspaceManager::new(root.path()),
            config,
        );

        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        engine.add_event_handler(move |event| sink.lock().unwrap().push(event));

        Self {
            engine,
            runner,
            events,
            root,
        }
    }

    pub fn instantiate(&self, yaml: &str, params: &[(&str, &str)]) -> Run {
        let overrides: BTreeMap<String, ParamValue> = params
            .iter()
            .map(|(k, v)| (k.to_string(), ParamValue::from(*v)))
            .collect();
        self.engine
            .instantiate(definition(yaml), &overrides, &BTreeMap::new())
            .unwrap()
    }

    pub fn instantiate_with_workspaces(&self, yaml: &str, bindings: &[(&str, PathBuf)]) -> Run {
        let bindings: BTreeMap<String, PathBuf> = bindings
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect();
        self.engine
            .instantiate(definition(yaml), &BTreeMap::new(), &bindings)
            .unwrap()
    }

    /// Task names in the order they reached `label`
    pub fn transitions_to(&self, label: &str) -> Vec<String> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter_map(|e| match e {
                RunEvent::TaskStateChanged { task, state } if state.label() == label => {
                    Some(task.clone())
                }
                _ => None,
            })
            .collect()
    }
}

/// Index of `entry` in `trace`
pub fn position(trace: &[Trace], entry: &Trace) -> usize {
    trace
        .iter()
        .position(|t| t == entry)
        .unwrap_or_else(|| panic!("{:?} not in trace {:?}", entry, trace))
}

/// Every predecessor finished before its successor started
pub fn assert_ordering(run: &Run, trace: &[Trace]) {
    for task in &run.definition.tasks {
        if !trace.contains(&Trace::Started(task.name.clone())) {
            continue;
        }
        let start = position(trace, &Trace::Started(task.name.clone()));
        for pred in run.definition.graph().predecessors(&task.name) {
            let finish = position(trace, &Trace::Finished(pred.to_string()));
            assert!(
                finish < start,
                "{} started before {} finished: {:?}",
                task.name,
                pred,
                trace
            );
        }
    }
}

/// Label of a task's final state
pub fn state_of(run: &Run, task: &str) -> &'static str {
    run.task(task).unwrap().state.label()
}
