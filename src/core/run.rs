//! A pipeline instantiated with concrete values

use crate::core::error::{PipelineError, Result};
use crate::core::params::{ParamValue, ParameterResolver, ResolvedParams};
use crate::core::pipeline::PipelineDefinition;
use crate::core::state::{RunStatus, TaskState};
use crate::registry::invocation::PrepareContext;
use crate::registry::{PreparedTask, TaskKind, TaskRegistry};
use crate::workspace::{WorkspaceManager, WorkspacePlan};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// One execution of a pipeline
#[derive(Debug, Clone)]
pub struct Run {
    pub id: Uuid,
    pub definition: Arc<PipelineDefinition>,
    pub params: ResolvedParams,
    pub status: RunStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub workspace_plan: WorkspacePlan,
    /// One execution per task, in topological order
    pub tasks: Vec<TaskExecution>,
}

/// Runtime state of one task within a run
#[derive(Debug, Clone)]
pub struct TaskExecution {
    pub name: String,
    pub kind: TaskKind,
    pub state: TaskState,
    pub logs: String,
    pub results: BTreeMap<String, String>,
    pub prepared: PreparedTask,
}

/// The first task that failed, with what it printed
#[derive(Debug, Clone, PartialEq)]
pub struct FirstFailure<'a> {
    pub task: &'a str,
    pub error: &'a str,
    pub exit_code: Option<i32>,
    pub logs: &'a str,
}

impl Run {
    /// Resolve parameters, plan workspaces and prepare every task.
    ///
    /// All validation happens here; nothing is created on disk.
    pub fn instantiate(
        definition: Arc<PipelineDefinition>,
        registry: &TaskRegistry,
        workspaces: &WorkspaceManager,
        overrides: &BTreeMap<String, ParamValue>,
        host_bindings: &BTreeMap<String, PathBuf>,
    ) -> Result<Self> {
        let id = Uuid::new_v4();
        let params = ParameterResolver::resolve(&definition.params, overrides)?;
        let workspace_plan = workspaces.plan(id, &definition, host_bindings)?;

        let ctx = PrepareContext {
            run_id: id,
            definition: &definition,
            registry,
            params: &params,
            plan: &workspace_plan,
        };

        let mut tasks = Vec::with_capacity(definition.tasks.len());
        for name in definition.execution_order() {
            let spec = definition
                .task(name)
                .ok_or_else(|| PipelineError::InvalidDefinition(format!("task '{}' missing", name)))?;
            let prepared = PreparedTask::prepare(spec, &ctx)?;
            tasks.push(TaskExecution {
                name: spec.name.clone(),
                kind: spec.kind.clone(),
                state: TaskState::Pending,
                logs: String::new(),
                results: BTreeMap::new(),
                prepared,
            });
        }

        debug!(
            "Instantiated run {} of '{}' with {} task(s)",
            id,
            definition.name,
            tasks.len()
        );

        Ok(Run {
            id,
            definition,
            params,
            status: RunStatus::Pending,
            started_at: None,
            completed_at: None,
            workspace_plan,
            tasks,
        })
    }

    pub fn task(&self, name: &str) -> Option<&TaskExecution> {
        self.tasks.iter().find(|t| t.name == name)
    }

    pub fn task_mut(&mut self, name: &str) -> Option<&mut TaskExecution> {
        self.tasks.iter_mut().find(|t| t.name == name)
    }

    /// Whether every predecessor of `name` has Succeeded
    pub fn predecessors_succeeded(&self, name: &str) -> bool {
        self.definition
            .graph()
            .predecessors(name)
            .into_iter()
            .all(|p| self.task(p).is_some_and(|t| t.state.is_succeeded()))
    }

    pub fn is_complete(&self) -> bool {
        self.tasks.iter().all(|t| t.state.is_terminal())
    }

    /// The earliest failure by completion time
    pub fn first_failure(&self) -> Option<FirstFailure<'_>> {
        self.tasks
            .iter()
            .filter_map(|t| match &t.state {
                TaskState::Failed {
                    failed_at,
                    error,
                    exit_code,
                    ..
                } => Some((
                    *failed_at,
                    FirstFailure {
                        task: &t.name,
                        error,
                        exit_code: *exit_code,
                        logs: &t.logs,
                    },
                )),
                _ => None,
            })
            .min_by_key(|(at, _)| *at)
            .map(|(_, failure)| failure)
    }

    /// The run's outcome as a `Result`
    pub fn outcome(&self) -> Result<()> {
        match self.status {
            RunStatus::Cancelled => Err(PipelineError::CancelledByUser),
            RunStatus::Failed => match self.first_failure() {
                Some(failure) => Err(PipelineError::TaskExecutionFailed {
                    task: failure.task.to_string(),
                    reason: failure.error.to_string(),
                }),
                None => Err(PipelineError::WorkspaceProvisionFailed(
                    "run failed before any task started".to_string(),
                )),
            },
            _ => Ok(()),
        }
    }

    /// Count of tasks per display label
    pub fn state_counts(&self) -> BTreeMap<&'static str, usize> {
        let mut counts = BTreeMap::new();
        for task in &self.tasks {
            *counts.entry(task.state.label()).or_insert(0) += 1;
        }
        counts
    }
}
