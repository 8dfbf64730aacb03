//! Pipeline domain model

use crate::core::{
    config::PipelineConfig,
    error::Result,
    graph::DependencyGraph,
    params::{ParamValue, ParameterSchema},
    template,
};
use crate::registry::TaskKind;
use serde::{Deserialize, Serialize};

/// A validated pipeline definition
///
/// Immutable once loaded; the dependency graph is computed here once and
/// shared by every run instantiated from this definition.
#[derive(Debug, Clone)]
pub struct PipelineDefinition {
    /// Pipeline name
    pub name: String,

    pub description: Option<String>,

    /// Parameter schema
    pub params: ParameterSchema,

    /// Declared workspaces
    pub workspaces: Vec<WorkspaceDeclaration>,

    /// Tasks in declaration order
    pub tasks: Vec<TaskSpec>,

    graph: DependencyGraph,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkspaceDeclaration {
    pub name: String,
    pub description: Option<String>,
}

/// One task of a pipeline
#[derive(Debug, Clone)]
pub struct TaskSpec {
    /// Unique task name
    pub name: String,

    /// Task kind that executes this task
    pub kind: TaskKind,

    /// Names of tasks that must succeed first
    pub run_after: Vec<String>,

    pub params: Vec<ParameterBinding>,

    pub workspaces: Vec<WorkspaceBinding>,

    pub timeout_secs: Option<u64>,
}

/// Value given to one of a task kind's inputs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParameterBinding {
    pub name: String,
    pub value: BindingValue,
}

/// Raw binding text; may contain `$(params.X)` and `$(tasks.T.results.R)`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindingValue {
    String(String),
    Array(Vec<String>),
}

impl BindingValue {
    fn texts(&self) -> Box<dyn Iterator<Item = &str> + '_> {
        match self {
            BindingValue::String(s) => Box::new(std::iter::once(s.as_str())),
            BindingValue::Array(items) => Box::new(items.iter().map(String::as_str)),
        }
    }
}

impl From<ParamValue> for BindingValue {
    fn from(value: ParamValue) -> Self {
        match value {
            ParamValue::String(s) => BindingValue::String(s),
            ParamValue::Array(items) => BindingValue::Array(items),
        }
    }
}

/// Maps a task kind's workspace name to a pipeline workspace
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkspaceBinding {
    pub name: String,
    pub workspace: String,
}

impl TaskSpec {
    /// `(task, result)` pairs this task consumes through its bindings
    pub fn result_dependencies(&self) -> Vec<(String, String)> {
        self.params
            .iter()
            .flat_map(|binding| binding.value.texts())
            .flat_map(template::task_result_refs)
            .collect()
    }

    pub fn binding(&self, name: &str) -> Option<&ParameterBinding> {
        self.params.iter().find(|b| b.name == name)
    }
}

impl PipelineDefinition {
    /// Create a pipeline definition from configuration
    pub fn from_config(config: &PipelineConfig) -> Result<Self> {
        config.validate()?;

        let tasks: Vec<TaskSpec> = config
            .tasks
            .iter()
            .map(|task| TaskSpec {
                name: task.name.clone(),
                kind: TaskKind::from(task.task_ref.name()),
                run_after: task.run_after.clone(),
                params: task
                    .params
                    .iter()
                    .map(|p| ParameterBinding {
                        name: p.name.clone(),
                        value: p.value.clone().into(),
                    })
                    .collect(),
                workspaces: task
                    .workspaces
                    .iter()
                    .map(|w| WorkspaceBinding {
                        name: w.name.clone(),
                        workspace: w.workspace.clone(),
                    })
                    .collect(),
                timeout_secs: task.timeout_secs,
            })
            .collect();

        let graph = DependencyGraph::build(&tasks)?;

        Ok(PipelineDefinition {
            name: config.name.clone(),
            description: config.description.clone(),
            params: ParameterSchema::new(config.params.clone()),
            workspaces: config
                .workspaces
                .iter()
                .map(|w| WorkspaceDeclaration {
                    name: w.name.clone(),
                    description: w.description.clone(),
                })
                .collect(),
            tasks,
            graph,
        })
    }

    /// Get a task by name
    pub fn task(&self, name: &str) -> Option<&TaskSpec> {
        self.tasks.iter().find(|t| t.name == name)
    }

    /// The cached dependency graph
    pub fn graph(&self) -> &DependencyGraph {
        &self.graph
    }

    /// Tasks in execution order
    pub fn execution_order(&self) -> &[String] {
        self.graph.order()
    }
}
