//! Task runners - the opaque call-out that executes one task

use crate::registry::Invocation;
use async_trait::async_trait;
use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinSet;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// How long a task may take to exit after SIGTERM before it is killed
const TERMINATE_GRACE: Duration = Duration::from_secs(5);

/// How long output is still read once the task's processes are gone
const OUTPUT_DRAIN: Duration = Duration::from_secs(1);

/// Output of a task that exited successfully
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskOutput {
    pub exit_code: i32,
    /// Captured stdout followed by stderr
    pub logs: String,
}

/// Error types for task execution
///
/// Every variant that ends a started task carries what it printed so far.
#[derive(Debug, Error)]
pub enum TaskError {
    #[error("exited with code {code}")]
    Exit { code: i32, logs: String },

    #[error("failed to start: {0}")]
    Spawn(String),

    #[error("timeout after {secs} seconds")]
    Timeout { secs: u64, logs: String },

    #[error("cancelled")]
    Cancelled { logs: String },
}

impl TaskError {
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            TaskError::Exit { code, .. } => Some(*code),
            _ => None,
        }
    }

    pub fn logs(&self) -> &str {
        match self {
            TaskError::Exit { logs, .. }
            | TaskError::Timeout { logs, .. }
            | TaskError::Cancelled { logs } => logs,
            TaskError::Spawn(_) => "",
        }
    }
}

/// Executes a rendered task invocation
///
/// Cancellation is cooperative: implementations should watch `cancel`, stop
/// everything the task started and return [`TaskError::Cancelled`] with the
/// output captured up to that point. Timeouts are enforced by cancelling.
#[async_trait]
pub trait TaskRunner: Send + Sync {
    async fn run(
        &self,
        invocation: &Invocation,
        cancel: CancellationToken,
    ) -> Result<TaskOutput, TaskError>;
}

/// Runs each task as a local subprocess
///
/// The subprocess leads its own process group, so stopping a task also stops
/// whatever it spawned.
#[derive(Debug, Clone, Default)]
pub struct ProcessRunner;

impl ProcessRunner {
    pub fn new() -> Self {
        Self
    }

    fn combine(stdout: &[u8], stderr: &[u8]) -> String {
        let mut logs = String::from_utf8_lossy(stdout).into_owned();
        let stderr = String::from_utf8_lossy(stderr);
        if !stderr.trim().is_empty() {
            if !logs.is_empty() && !logs.ends_with('\n') {
                logs.push('\n');
            }
            logs.push_str(&stderr);
        }
        logs
    }
}

type SharedBuffer = Arc<Mutex<Vec<u8>>>;

/// Output of a running task, filled as it is produced
#[derive(Default)]
struct Capture {
    stdout: SharedBuffer,
    stderr: SharedBuffer,
    readers: JoinSet<()>,
}

impl Capture {
    fn attach(child: &mut Child) -> Self {
        let mut capture = Capture::default();
        if let Some(stdout) = child.stdout.take() {
            capture.readers.spawn(read_into(stdout, capture.stdout.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            capture.readers.spawn(read_into(stderr, capture.stderr.clone()));
        }
        capture
    }

    /// Wait for the pipes to close, then return everything read
    async fn finish(mut self) -> String {
        let readers = &mut self.readers;
        let drained = timeout(OUTPUT_DRAIN, async {
            while readers.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            debug!("Output pipes still open after the task exited");
        }

        let stdout = self.stdout.lock().unwrap_or_else(PoisonError::into_inner);
        let stderr = self.stderr.lock().unwrap_or_else(PoisonError::into_inner);
        ProcessRunner::combine(&stdout, &stderr)
    }
}

async fn read_into<R: AsyncRead + Unpin>(mut reader: R, buffer: SharedBuffer) {
    let mut chunk = [0u8; 8192];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => buffer
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .extend_from_slice(&chunk[..n]),
        }
    }
}

/// The process group a task's subprocess leads.
///
/// Anything still in the group is killed on drop.
struct ProcessGroup {
    #[cfg_attr(not(unix), allow(dead_code))]
    id: Option<u32>,
}

impl ProcessGroup {
    fn of(child: &Child) -> Self {
        Self { id: child.id() }
    }

    #[cfg(unix)]
    fn signal(&self, signal: libc::c_int) {
        let Some(pgid) = self.id.and_then(|id| libc::pid_t::try_from(id).ok()) else {
            return;
        };
        // SAFETY: killpg takes no pointers and only sends a signal
        if unsafe { libc::killpg(pgid, signal) } != 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::ESRCH) {
                warn!("Failed to signal process group {}: {}", pgid, err);
            }
        }
    }

    /// Ask every process in the group to exit
    fn terminate(&self) {
        #[cfg(unix)]
        self.signal(libc::SIGTERM);
    }

    /// Kill every process left in the group. Only the first call signals.
    fn kill(&mut self) {
        #[cfg(unix)]
        self.signal(libc::SIGKILL);
        self.id = None;
    }

    /// Terminate the group and reap the leader
    async fn stop(&mut self, child: &mut Child) {
        self.terminate();
        #[cfg(not(unix))]
        let _ = child.start_kill();

        if timeout(TERMINATE_GRACE, child.wait()).await.is_err() {
            warn!(
                "Subprocess still running {}s after SIGTERM, killing it",
                TERMINATE_GRACE.as_secs()
            );
            let _ = child.start_kill();
            let _ = child.wait().await;
        }
        self.kill();
    }
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        self.kill();
    }
}

#[async_trait]
impl TaskRunner for ProcessRunner {
    async fn run(
        &self,
        invocation: &Invocation,
        cancel: CancellationToken,
    ) -> Result<TaskOutput, TaskError> {
        debug!(
            "Spawning {} for task {} with {} argument(s)",
            invocation.program,
            invocation.task,
            invocation.args.len()
        );

        let mut command = Command::new(&invocation.program);
        command
            .args(&invocation.args)
            .envs(invocation.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);
        if let Some(dir) = &invocation.working_dir {
            command.current_dir(dir);
        }

        let mut child = command
            .spawn()
            .map_err(|e| TaskError::Spawn(format!("{}: {}", invocation.program, e)))?;
        let mut group = ProcessGroup::of(&child);
        let capture = Capture::attach(&mut child);

        let status = tokio::select! {
            status = child.wait() => status,
            _ = cancel.cancelled() => {
                debug!("Task {} cancelled, stopping its processes", invocation.task);
                group.stop(&mut child).await;
                return Err(TaskError::Cancelled { logs: capture.finish().await });
            }
        };

        // Background processes do not outlive the task
        group.kill();
        let logs = capture.finish().await;
        let status =
            status.map_err(|e| TaskError::Spawn(format!("{}: {}", invocation.program, e)))?;

        if !status.success() {
            let code = status.code().unwrap_or(-1);
            warn!("Task {} exited with code {}", invocation.task, code);
            return Err(TaskError::Exit { code, logs });
        }

        debug!(
            "Task {} produced {} bytes of output",
            invocation.task,
            logs.len()
        );

        Ok(TaskOutput { exit_code: 0, logs })
    }
}
