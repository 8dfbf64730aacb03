//! Engine error types

use thiserror::Error;

/// Errors raised while loading, instantiating or running a pipeline
///
/// Everything up to `UnboundWorkspace` is a validation error: it is raised
/// while a run is being instantiated, before any workspace is provisioned or
/// any task is started.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Cycle detected in dependency graph involving tasks: {}", .tasks.join(", "))]
    CycleDetected { tasks: Vec<String> },

    #[error("Task '{task}' depends on non-existent task '{predecessor}'")]
    UnknownPredecessor { task: String, predecessor: String },

    #[error("Duplicate task name: {0}")]
    DuplicateTask(String),

    #[error("Missing required parameter '{0}'")]
    MissingRequiredParameter(String),

    #[error("Unresolved reference '$({0})'")]
    UnresolvedReference(String),

    #[error("Parameter '{name}' expects a {expected} value")]
    ParameterTypeMismatch { name: String, expected: String },

    #[error("Unknown task kind '{0}'")]
    UnknownTaskKind(String),

    #[error("Task '{task}' binds parameter '{param}' which its task kind does not declare")]
    UnknownTaskParameter { task: String, param: String },

    #[error("Task '{task}' binds undeclared pipeline workspace '{workspace}'")]
    UnknownWorkspace { task: String, workspace: String },

    #[error("Task '{task}' does not bind required workspace '{workspace}'")]
    UnboundWorkspace { task: String, workspace: String },

    #[error("Invalid pipeline definition: {0}")]
    InvalidDefinition(String),

    #[error("Task '{task}' failed: {reason}")]
    TaskExecutionFailed { task: String, reason: String },

    #[error("Failed to provision workspace: {0}")]
    WorkspaceProvisionFailed(String),

    #[error("Run cancelled by user")]
    CancelledByUser,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl PipelineError {
    /// Whether this error is raised before any task executes
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            PipelineError::CycleDetected { .. }
                | PipelineError::UnknownPredecessor { .. }
                | PipelineError::DuplicateTask(_)
                | PipelineError::MissingRequiredParameter(_)
                | PipelineError::UnresolvedReference(_)
                | PipelineError::ParameterTypeMismatch { .. }
                | PipelineError::UnknownTaskKind(_)
                | PipelineError::UnknownTaskParameter { .. }
                | PipelineError::UnknownWorkspace { .. }
                | PipelineError::UnboundWorkspace { .. }
                | PipelineError::InvalidDefinition(_)
        )
    }
}

pub type Result<T, E = PipelineError> = std::result::Result<T, E>;
