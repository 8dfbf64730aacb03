//! Task executor - runs individual tasks with the task runner

use crate::registry::{Invocation, TaskError, TaskRunner};
use std::collections::BTreeMap;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Result of executing a task
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionResult {
    /// Task exited successfully and its results were collected
    Succeeded {
        exit_code: i32,
        logs: String,
        results: BTreeMap<String, String>,
    },
    /// Task failed: non-zero exit, spawn error or timeout
    Failed {
        error: String,
        exit_code: Option<i32>,
        logs: String,
    },
    /// Task stopped because it was asked to
    Cancelled { logs: String },
}

/// Executes a single task
pub struct TaskExecutor<R> {
    runner: R,
    default_timeout: Option<Duration>,
}

impl<R: TaskRunner> TaskExecutor<R> {
    pub fn new(runner: R, default_timeout: Option<Duration>) -> Self {
        Self {
            runner,
            default_timeout,
        }
    }

    /// Execute a task and collect its results
    pub async fn execute(&self, invocation: &Invocation, cancel: CancellationToken) -> ExecutionResult {
        info!("Executing task: {} ({})", invocation.task, invocation.kind);
        debug!(
            "Command for task {}: {} {:?}",
            invocation.task, invocation.program, invocation.args
        );

        let limit = invocation.timeout.or(self.default_timeout);
        // A timeout stops the task the same way a cancel does, so its output is kept
        let stop = cancel.child_token();
        let run = self.runner.run(invocation, stop.clone());
        tokio::pin!(run);
        let outcome = match limit {
            Some(limit) => tokio::select! {
                outcome = &mut run => outcome,
                _ = tokio::time::sleep(limit) => {
                    warn!(
                        "Task {} exceeded its {}s timeout, stopping it",
                        invocation.task,
                        limit.as_secs()
                    );
                    stop.cancel();
                    match run.await {
                        Err(TaskError::Cancelled { logs }) => Err(TaskError::Timeout {
                            secs: limit.as_secs(),
                            logs,
                        }),
                        finished => finished,
                    }
                }
            },
            None => run.await,
        };

        match outcome {
            Ok(output) => {
                let results = collect_results(invocation).await;
                info!("Task {} completed successfully", invocation.task);
                ExecutionResult::Succeeded {
                    exit_code: output.exit_code,
                    logs: output.logs,
                    results,
                }
            }
            Err(TaskError::Cancelled { logs }) => {
                info!("Task {} cancelled", invocation.task);
                ExecutionResult::Cancelled { logs }
            }
            Err(e) => {
                error!("Task {} failed: {}", invocation.task, e);
                ExecutionResult::Failed {
                    error: e.to_string(),
                    exit_code: e.exit_code(),
                    logs: e.logs().to_string(),
                }
            }
        }
    }
}

/// Read `<results_dir>/<name>` for each declared result.
///
/// A result the task did not write is simply absent; consumers fail when
/// they try to use it.
async fn collect_results(invocation: &Invocation) -> BTreeMap<String, String> {
    let mut results = BTreeMap::new();
    for name in &invocation.results {
        let path = invocation.results_dir.join(name);
        match tokio::fs::read_to_string(&path).await {
            Ok(value) => {
                results.insert(name.clone(), value.trim_end().to_string());
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("Task {} did not write result '{}'", invocation.task, name);
            }
            Err(e) => warn!(
                "Failed to read result '{}' of task {}: {}",
                name, invocation.task, e
            ),
        }
    }
    results
}
