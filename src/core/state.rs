//! Execution state models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Overall run status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunStatus {
    /// Run has been instantiated but not started
    Pending,
    /// Run is currently executing
    Running,
    /// Every task succeeded
    Succeeded,
    /// At least one task failed, or provisioning failed
    Failed,
    /// Run was cancelled
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Succeeded | RunStatus::Failed | RunStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "Pending",
            RunStatus::Running => "Running",
            RunStatus::Succeeded => "Succeeded",
            RunStatus::Failed => "Failed",
            RunStatus::Cancelled => "Cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Pending" => Some(RunStatus::Pending),
            "Running" => Some(RunStatus::Running),
            "Succeeded" => Some(RunStatus::Succeeded),
            "Failed" => Some(RunStatus::Failed),
            "Cancelled" => Some(RunStatus::Cancelled),
            _ => None,
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// State of a single task execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TaskState {
    /// Waiting for predecessors
    Pending,
    /// All predecessors succeeded; queued for a free slot
    Ready { since: DateTime<Utc> },
    /// Currently executing
    Running { started_at: DateTime<Utc> },
    Succeeded {
        started_at: DateTime<Utc>,
        completed_at: DateTime<Utc>,
        exit_code: i32,
    },
    Failed {
        started_at: Option<DateTime<Utc>>,
        failed_at: DateTime<Utc>,
        error: String,
        exit_code: Option<i32>,
    },
    Cancelled {
        started_at: Option<DateTime<Utc>>,
        cancelled_at: DateTime<Utc>,
    },
    /// Never started because the run stopped scheduling after a failure
    Skipped { reason: String },
}

impl TaskState {
    /// Check if task is in a terminal state
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Succeeded { .. }
                | TaskState::Failed { .. }
                | TaskState::Cancelled { .. }
                | TaskState::Skipped { .. }
        )
    }

    pub fn is_succeeded(&self) -> bool {
        matches!(self, TaskState::Succeeded { .. })
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, TaskState::Failed { .. })
    }

    pub fn is_running(&self) -> bool {
        matches!(self, TaskState::Running { .. })
    }

    /// Whether the task has not started and can still be cancelled synchronously
    pub fn is_waiting(&self) -> bool {
        matches!(self, TaskState::Pending | TaskState::Ready { .. })
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        match self {
            TaskState::Running { started_at } | TaskState::Succeeded { started_at, .. } => {
                Some(*started_at)
            }
            TaskState::Failed { started_at, .. } | TaskState::Cancelled { started_at, .. } => {
                *started_at
            }
            _ => None,
        }
    }

    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        match self {
            TaskState::Succeeded { completed_at, .. } => Some(*completed_at),
            TaskState::Failed { failed_at, .. } => Some(*failed_at),
            TaskState::Cancelled { cancelled_at, .. } => Some(*cancelled_at),
            _ => None,
        }
    }

    /// Short upper-case label for display
    pub fn label(&self) -> &'static str {
        match self {
            TaskState::Pending => "PENDING",
            TaskState::Ready { .. } => "READY",
            TaskState::Running { .. } => "RUNNING",
            TaskState::Succeeded { .. } => "SUCCEEDED",
            TaskState::Failed { .. } => "FAILED",
            TaskState::Cancelled { .. } => "CANCELLED",
            TaskState::Skipped { .. } => "SKIPPED",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_state_is_terminal() {
        assert!(!TaskState::Pending.is_terminal());
        assert!(!TaskState::Ready { since: Utc::now() }.is_terminal());
        assert!(!TaskState::Running {
            started_at: Utc::now()
        }
        .is_terminal());
        assert!(TaskState::Succeeded {
            started_at: Utc::now(),
            completed_at: Utc::now(),
            exit_code: 0
        }
        .is_terminal());
        assert!(TaskState::Failed {
            started_at: None,
            failed_at: Utc::now(),
            error: "boom".to_string(),
            exit_code: Some(1)
        }
        .is_terminal());
        assert!(TaskState::Cancelled {
            started_at: None,
            cancelled_at: Utc::now()
        }
        .is_terminal());
        assert!(TaskState::Skipped {
            reason: "upstream failure".to_string()
        }
        .is_terminal());
    }

    #[test]
    fn test_run_status_round_trips_through_str() {
        for status in [
            RunStatus::Pending,
            RunStatus::Running,
            RunStatus::Succeeded,
            RunStatus::Failed,
            RunStatus::Cancelled,
        ] {
            assert_eq!(RunStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(RunStatus::parse("Paused"), None);
    }
}
