//! taskline - a pipeline orchestration engine for clone/lint/test/build/deploy workflows

pub mod cli;
pub mod core;
pub mod execution;
pub mod persistence;
pub mod registry;
pub mod workspace;

// Re-export commonly used types
pub use core::{PipelineDefinition, PipelineError, Run, RunEvent, RunStatus, TaskState};
pub use execution::{EngineConfig, ExecutionEngine, FailurePolicy, SchedulingStrategy};
pub use registry::{ProcessRunner, TaskKind, TaskRegistry, TaskRunner};
pub use workspace::WorkspaceManager;
