//! Main execution engine - orchestrates an entire pipeline run

use crate::{
    core::{
        error::Result,
        params::ParamValue,
        PipelineDefinition, Run, RunEvent, RunStatus, TaskState,
    },
    execution::{ExecutionResult, ExecutionScheduler, SchedulingStrategy, TaskExecutor},
    persistence::RunRecorder,
    registry::{TaskRegistry, TaskRunner},
    workspace::WorkspaceManager,
};
use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::{Id as TaskId, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// What happens to the rest of a run after a task fails
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailurePolicy {
    /// Stop promoting; let running tasks finish
    #[default]
    Drain,
    /// Stop promoting and ask running tasks to terminate
    FailFast,
}

/// Engine settings
#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    pub strategy: SchedulingStrategy,
    pub failure_policy: FailurePolicy,
    /// Applied to tasks without their own `timeoutSecs`
    pub default_timeout: Option<Duration>,
}

/// Type for event handlers
pub type EventHandler = Arc<dyn Fn(RunEvent) + Send + Sync>;

/// Main pipeline execution engine
pub struct ExecutionEngine<R> {
    registry: Arc<TaskRegistry>,
    executor: Arc<TaskExecutor<R>>,
    workspaces: WorkspaceManager,
    recorder: Arc<RunRecorder>,
    config: EngineConfig,
    event_handlers: Vec<EventHandler>,
}

/// Bookkeeping for tasks currently in the join set
#[derive(Default)]
struct InFlight {
    names: HashMap<TaskId, String>,
    tokens: HashMap<String, CancellationToken>,
}

impl InFlight {
    fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    fn len(&self) -> usize {
        self.tokens.len()
    }

    fn cancel_all(&self) {
        for token in self.tokens.values() {
            token.cancel();
        }
    }

    fn finish(&mut self, id: TaskId) -> Option<String> {
        let name = self.names.remove(&id)?;
        self.tokens.remove(&name);
        Some(name)
    }
}

impl<R: TaskRunner + 'static> ExecutionEngine<R> {
    pub fn new(
        runner: R,
        registry: TaskRegistry,
        workspaces: WorkspaceManager,
        config: EngineConfig,
    ) -> Self {
        Self {
            registry: Arc::new(registry),
            executor: Arc::new(TaskExecutor::new(runner, config.default_timeout)),
            workspaces,
            recorder: Arc::new(RunRecorder::in_memory()),
            config,
            event_handlers: Vec::new(),
        }
    }

    /// Record runs through `recorder` instead of the in-memory default
    pub fn with_recorder(mut self, recorder: Arc<RunRecorder>) -> Self {
        self.recorder = recorder;
        self
    }

    /// Add an event handler
    pub fn add_event_handler<F>(&mut self, handler: F)
    where
        F: Fn(RunEvent) + Send + Sync + 'static,
    {
        self.event_handlers.push(Arc::new(handler));
    }

    pub fn registry(&self) -> &TaskRegistry {
        &self.registry
    }

    pub fn recorder(&self) -> &Arc<RunRecorder> {
        &self.recorder
    }

    /// Validate and instantiate a run. Nothing is provisioned yet.
    pub fn instantiate(
        &self,
        definition: Arc<PipelineDefinition>,
        overrides: &BTreeMap<String, ParamValue>,
        host_bindings: &BTreeMap<String, PathBuf>,
    ) -> Result<Run> {
        Run::instantiate(
            definition,
            &self.registry,
            &self.workspaces,
            overrides,
            host_bindings,
        )
    }

    /// Record an event and pass it to every handler
    async fn emit(&self, run: &Run, event: RunEvent) {
        self.recorder.record(run, event.clone()).await;
        for handler in &self.event_handlers {
            handler(event.clone());
        }
    }

    async fn set_state(&self, run: &mut Run, name: &str, state: TaskState) {
        if let Some(task) = run.task_mut(name) {
            task.state = state.clone();
        }
        self.emit(
            run,
            RunEvent::TaskStateChanged {
                task: name.to_string(),
                state,
            },
        )
        .await;
    }

    /// Execute a run to completion.
    ///
    /// Returns the final status. Task failures and cancellation are reported
    /// through the status; only a provisioning failure is an `Err`.
    pub async fn execute(&self, run: &mut Run, cancel: CancellationToken) -> Result<RunStatus> {
        info!(
            "Starting run {} of pipeline '{}'",
            run.id, run.definition.name
        );
        run.status = RunStatus::Running;
        run.started_at = Some(Utc::now());
        self.emit(
            run,
            RunEvent::RunStarted {
                pipeline_name: run.definition.name.clone(),
                params: run.params.clone(),
            },
        )
        .await;

        let guard = match self.workspaces.provision(&run.workspace_plan).await {
            Ok(guard) => guard,
            Err(e) => {
                error!("Run {} aborted: {}", run.id, e);
                let names: Vec<String> = run.tasks.iter().map(|t| t.name.clone()).collect();
                for name in names {
                    let reason = "workspace provisioning failed".to_string();
                    self.set_state(run, &name, TaskState::Skipped { reason }).await;
                }
                self.finish(run, RunStatus::Failed).await;
                return Err(e);
            }
        };

        let mut scheduler = ExecutionScheduler::new(self.config.strategy);
        let mut join_set: JoinSet<ExecutionResult> = JoinSet::new();
        let mut in_flight = InFlight::default();
        let mut cancelled = false;

        loop {
            if !cancelled && cancel.is_cancelled() {
                cancelled = true;
                self.cancel_waiting(run, &mut scheduler).await;
                in_flight.cancel_all();
            }

            if !cancelled {
                for name in scheduler.promote(run) {
                    let since = Utc::now();
                    self.set_state(run, &name, TaskState::Ready { since }).await;
                }
                for name in scheduler.next_batch(in_flight.len()) {
                    // Anything left in the batch stays Ready and is skipped later
                    if scheduler.is_halted() {
                        break;
                    }
                    if !self
                        .launch(run, &name, &cancel, &mut join_set, &mut in_flight)
                        .await
                    {
                        self.on_failure(&mut scheduler, &in_flight);
                    }
                }
            }

            if in_flight.is_empty() {
                if scheduler.has_ready() && !scheduler.is_halted() {
                    continue;
                }
                break;
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled(), if !cancelled => {
                    info!("Cancellation requested for run {}", run.id);
                }
                Some(joined) = join_set.join_next_with_id() => {
                    let (name, result) = match joined {
                        Ok((id, result)) => (in_flight.finish(id), result),
                        Err(e) => (
                            in_flight.finish(e.id()),
                            ExecutionResult::Failed {
                                error: format!("task panicked: {}", e),
                                exit_code: None,
                                logs: String::new(),
                            },
                        ),
                    };
                    let Some(name) = name else {
                        warn!("Completion for an untracked task in run {}", run.id);
                        continue;
                    };
                    if self.complete(run, &name, result).await {
                        self.on_failure(&mut scheduler, &in_flight);
                    }
                }
                else => break,
            }
        }

        // Whatever never started
        let waiting: Vec<String> = run
            .tasks
            .iter()
            .filter(|t| t.state.is_waiting())
            .map(|t| t.name.clone())
            .collect();
        for name in waiting {
            let state = if cancelled {
                TaskState::Cancelled {
                    started_at: None,
                    cancelled_at: Utc::now(),
                }
            } else {
                TaskState::Skipped {
                    reason: "an upstream task did not succeed".to_string(),
                }
            };
            self.set_state(run, &name, state).await;
        }

        let status = if run.tasks.iter().all(|t| t.state.is_succeeded()) {
            RunStatus::Succeeded
        } else if cancelled {
            RunStatus::Cancelled
        } else {
            RunStatus::Failed
        };

        guard.release();
        self.finish(run, status).await;
        Ok(status)
    }

    async fn finish(&self, run: &mut Run, status: RunStatus) {
        run.status = status;
        run.completed_at = Some(Utc::now());
        info!(
            "Run {} of pipeline '{}' finished: {}",
            run.id, run.definition.name, status
        );
        self.emit(run, RunEvent::RunCompleted { status }).await;
        self.recorder.finish(run.id);
    }

    fn on_failure(&self, scheduler: &mut ExecutionScheduler, in_flight: &InFlight) {
        scheduler.halt();
        let dropped = scheduler.drain_queue();
        if !dropped.is_empty() {
            debug!("Not starting queued tasks: {}", dropped.join(", "));
        }
        if self.config.failure_policy == FailurePolicy::FailFast {
            in_flight.cancel_all();
        }
    }

    /// Move Pending and Ready tasks to Cancelled
    async fn cancel_waiting(&self, run: &mut Run, scheduler: &mut ExecutionScheduler) {
        scheduler.halt();
        scheduler.drain_queue();
        let waiting: Vec<String> = run
            .tasks
            .iter()
            .filter(|t| t.state.is_waiting())
            .map(|t| t.name.clone())
            .collect();
        for name in waiting {
            let state = TaskState::Cancelled {
                started_at: None,
                cancelled_at: Utc::now(),
            };
            self.set_state(run, &name, state).await;
        }
    }

    /// Render and spawn a task; false if it failed before starting
    async fn launch(
        &self,
        run: &mut Run,
        name: &str,
        cancel: &CancellationToken,
        join_set: &mut JoinSet<ExecutionResult>,
        in_flight: &mut InFlight,
    ) -> bool {
        let rendered = match run.task(name) {
            Some(task) => task.prepared.render(run.id, |producer, result| {
                run.task(producer)
                    .and_then(|t| t.results.get(result).cloned())
            }),
            None => return true,
        };

        let invocation = match rendered {
            Ok(invocation) => invocation,
            Err(e) => {
                error!("Task {} could not be started: {}", name, e);
                let state = TaskState::Failed {
                    started_at: None,
                    failed_at: Utc::now(),
                    error: e.to_string(),
                    exit_code: None,
                };
                self.set_state(run, name, state).await;
                return false;
            }
        };

        let started_at = Utc::now();
        self.set_state(run, name, TaskState::Running { started_at })
            .await;

        let token = cancel.child_token();
        let executor = self.executor.clone();
        let task_token = token.clone();
        let handle = join_set.spawn(async move { executor.execute(&invocation, task_token).await });

        in_flight.names.insert(handle.id(), name.to_string());
        in_flight.tokens.insert(name.to_string(), token);
        true
    }

    /// Record a finished task; true if it failed
    async fn complete(&self, run: &mut Run, name: &str, result: ExecutionResult) -> bool {
        let now = Utc::now();
        let started_at = run.task(name).and_then(|t| t.state.started_at());

        let (state, logs, failed) = match result {
            ExecutionResult::Succeeded {
                exit_code,
                logs,
                results,
            } => {
                if let Some(task) = run.task_mut(name) {
                    task.results = results;
                }
                let state = TaskState::Succeeded {
                    started_at: started_at.unwrap_or(now),
                    completed_at: now,
                    exit_code,
                };
                (state, logs, false)
            }
            ExecutionResult::Failed {
                error,
                exit_code,
                logs,
            } => {
                let state = TaskState::Failed {
                    started_at,
                    failed_at: now,
                    error,
                    exit_code,
                };
                (state, logs, true)
            }
            ExecutionResult::Cancelled { logs } => {
                let state = TaskState::Cancelled {
                    started_at,
                    cancelled_at: now,
                };
                (state, logs, false)
            }
        };

        if let Some(task) = run.task_mut(name) {
            task.logs = logs.clone();
        }
        if !logs.is_empty() {
            self.emit(
                run,
                RunEvent::TaskOutput {
                    task: name.to_string(),
                    output: logs,
                },
            )
            .await;
        }
        self.set_state(run, name, state).await;
        failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::PipelineConfig;
    use crate::registry::ProcessRunner;

    fn registry() -> TaskRegistry {
        let mut registry = TaskRegistry::new();
        registry
            .load_catalog_yaml(
                r#"
tasks:
  - kind: produce
    results: [value]
    command: ["sh", "-c", "printf abc > $(results.value.path)"]
  - kind: expect
    params:
      - name: value
    command: ["sh", "-c", "test \"$(params.value)\" = abc"]
"#,
            )
            .unwrap();
        registry
    }

    #[tokio::test]
    async fn test_result_flows_between_real_processes() {
        let root = tempfile::tempdir().unwrap();
        let engine = ExecutionEngine::new(
            ProcessRunner::new(),
            registry(),
            WorkspaceManager::new(root.path()),
            EngineConfig::default(),
        );
        let definition = PipelineConfig::from_yaml(
            r#"
name: results
tasks:
  - name: check
    taskRef: expect
    params:
      - name: value
        value: $(tasks.make.results.value)
  - name: make
    taskRef: produce
"#,
        )
        .unwrap()
        .to_definition()
        .unwrap();

        let mut run = engine
            .instantiate(Arc::new(definition), &BTreeMap::new(), &BTreeMap::new())
            .unwrap();
        let status = engine.execute(&mut run, CancellationToken::new()).await.unwrap();

        assert_eq!(status, RunStatus::Succeeded, "{:?}", run.first_failure());
        assert_eq!(
            run.task("make").unwrap().results.get("value").map(String::as_str),
            Some("abc")
        );
        assert!(!run.workspace_plan.run_dir().exists());
    }

    #[tokio::test]
    async fn test_events_are_recorded_in_order() {
        let root = tempfile::tempdir().unwrap();
        let engine = ExecutionEngine::new(
            ProcessRunner::new(),
            registry(),
            WorkspaceManager::new(root.path()),
            EngineConfig::default(),
        );
        let definition = PipelineConfig::from_yaml("name: one\ntasks:\n  - name: make\n    taskRef: produce\n")
            .unwrap()
            .to_definition()
            .unwrap();
        let mut run = engine
            .instantiate(Arc::new(definition), &BTreeMap::new(), &BTreeMap::new())
            .unwrap();
        engine.execute(&mut run, CancellationToken::new()).await.unwrap();

        let events = engine.recorder().backend().load_events(run.id).await.unwrap();
        let sequences: Vec<u64> = events.iter().map(|e| e.sequence).collect();
        assert_eq!(sequences, (1..=events.len() as u64).collect::<Vec<_>>());
        assert!(matches!(events.first().map(|e| &e.event), Some(RunEvent::RunStarted { .. })));
        assert!(matches!(
            events.last().map(|e| &e.event),
            Some(RunEvent::RunCompleted {
                status: RunStatus::Succeeded
            })
        ));

        let snapshot = engine.recorder().backend().load_snapshot(run.id).await.unwrap().unwrap();
        assert_eq!(snapshot.status, RunStatus::Succeeded);
        assert!(snapshot.task("make").unwrap().state.is_succeeded());
    }
}
