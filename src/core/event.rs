//! Events emitted while a run executes

use crate::core::params::ResolvedParams;
use crate::core::state::{RunStatus, TaskState};
use serde::{Deserialize, Serialize};

/// Something that happened during a run, in the order it happened
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEvent {
    RunStarted {
        pipeline_name: String,
        params: ResolvedParams,
    },
    TaskStateChanged {
        task: String,
        state: TaskState,
    },
    /// Captured stdout/stderr of a finished task
    TaskOutput {
        task: String,
        output: String,
    },
    RunCompleted {
        status: RunStatus,
    },
}

impl RunEvent {
    /// Task the event concerns, if any
    pub fn task(&self) -> Option<&str> {
        match self {
            RunEvent::TaskStateChanged { task, .. } | RunEvent::TaskOutput { task, .. } => {
                Some(task)
            }
            _ => None,
        }
    }
}
