//! Persistence layer for run history

pub mod recorder;
#[cfg(feature = "sqlite")]
pub mod store;

pub use recorder::RunRecorder;
#[cfg(feature = "sqlite")]
pub use store::SqliteRunStore;

use crate::core::params::ResolvedParams;
use crate::core::{Run, RunEvent, RunStatus, TaskState};
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Duration;
use tokio::sync::RwLock;
use uuid::Uuid;

/// How often the process executing a run reports that it is alive
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

/// An unfinished run nobody has reported on for this long is abandoned
pub const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(30);

/// Latest known state of a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSnapshot {
    pub run_id: Uuid,
    pub pipeline_name: String,
    pub status: RunStatus,
    pub params: ResolvedParams,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Tasks in topological order
    pub tasks: Vec<TaskSnapshot>,
    pub first_failure: Option<FailureSummary>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSnapshot {
    pub name: String,
    pub kind: String,
    pub state: TaskState,
    #[serde(default)]
    pub logs: String,
    #[serde(default)]
    pub results: BTreeMap<String, String>,
}

/// The first failing task and what it printed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureSummary {
    pub task: String,
    pub error: String,
    pub exit_code: Option<i32>,
    pub logs: String,
}

impl RunSnapshot {
    pub fn task(&self, name: &str) -> Option<&TaskSnapshot> {
        self.tasks.iter().find(|t| t.name == name)
    }

    /// Whether the run is unfinished but its process stopped reporting,
    /// e.g. because it was killed.
    pub fn is_abandoned(&self, last_heartbeat: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        let last_seen = last_heartbeat.map_or(self.updated_at, |beat| beat.max(self.updated_at));
        (now - last_seen)
            .to_std()
            .is_ok_and(|silent| silent > HEARTBEAT_TIMEOUT)
    }

    /// Close out an abandoned run; unfinished tasks end Cancelled
    pub fn mark_abandoned(&mut self, at: DateTime<Utc>) {
        for task in &mut self.tasks {
            if !task.state.is_terminal() {
                task.state = TaskState::Cancelled {
                    started_at: task.state.started_at(),
                    cancelled_at: at,
                };
            }
        }
        self.status = RunStatus::Cancelled;
        self.completed_at = Some(at);
        self.updated_at = at;
    }
}

/// One entry of a run's append-only event log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordedEvent {
    pub run_id: Uuid,
    /// Starts at 1 and increases by one per event of the run
    pub sequence: u64,
    pub recorded_at: DateTime<Utc>,
    pub event: RunEvent,
}

/// Trait for persistence backends
#[async_trait::async_trait]
pub trait PersistenceBackend: Send + Sync {
    /// Insert or replace the snapshot of a run
    async fn save_snapshot(&self, snapshot: &RunSnapshot) -> Result<()>;

    async fn load_snapshot(&self, run_id: Uuid) -> Result<Option<RunSnapshot>>;

    /// Append to a run's event log
    async fn append_event(&self, event: &RecordedEvent) -> Result<()>;

    /// A run's events in sequence order
    async fn load_events(&self, run_id: Uuid) -> Result<Vec<RecordedEvent>>;

    /// Most recent runs first, optionally for a single pipeline
    async fn list_runs(&self, pipeline_name: Option<&str>, limit: usize)
        -> Result<Vec<RunSnapshot>>;

    /// All pipeline names with recorded runs
    async fn list_pipelines(&self) -> Result<Vec<String>>;

    /// Ask the process executing `run_id` to cancel it; false if the run is unknown
    async fn request_cancel(&self, run_id: Uuid) -> Result<bool>;

    async fn cancel_requested(&self, run_id: Uuid) -> Result<bool>;

    /// Note that the process executing `run_id` is still alive
    async fn heartbeat(&self, run_id: Uuid, at: DateTime<Utc>) -> Result<()>;

    async fn last_heartbeat(&self, run_id: Uuid) -> Result<Option<DateTime<Utc>>>;
}

/// In-memory persistence (for testing or ephemeral use)
#[derive(Default)]
pub struct InMemoryPersistence {
    snapshots: RwLock<HashMap<Uuid, RunSnapshot>>,
    events: RwLock<HashMap<Uuid, Vec<RecordedEvent>>>,
    cancel_requests: RwLock<HashSet<Uuid>>,
    heartbeats: RwLock<HashMap<Uuid, DateTime<Utc>>>,
}

impl InMemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl PersistenceBackend for InMemoryPersistence {
    async fn save_snapshot(&self, snapshot: &RunSnapshot) -> Result<()> {
        let mut snapshots = self.snapshots.write().await;
        snapshots.insert(snapshot.run_id, snapshot.clone());
        Ok(())
    }

    async fn load_snapshot(&self, run_id: Uuid) -> Result<Option<RunSnapshot>> {
        let snapshots = self.snapshots.read().await;
        Ok(snapshots.get(&run_id).cloned())
    }

    async fn append_event(&self, event: &RecordedEvent) -> Result<()> {
        let mut events = self.events.write().await;
        events.entry(event.run_id).or_default().push(event.clone());
        Ok(())
    }

    async fn load_events(&self, run_id: Uuid) -> Result<Vec<RecordedEvent>> {
        let events = self.events.read().await;
        let mut log = events.get(&run_id).cloned().unwrap_or_default();
        log.sort_by_key(|e| e.sequence);
        Ok(log)
    }

    async fn list_runs(
        &self,
        pipeline_name: Option<&str>,
        limit: usize,
    ) -> Result<Vec<RunSnapshot>> {
        let snapshots = self.snapshots.read().await;
        let mut runs: Vec<RunSnapshot> = snapshots
            .values()
            .filter(|s| pipeline_name.map_or(true, |name| s.pipeline_name == name))
            .cloned()
            .collect();
        runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        runs.truncate(limit);
        Ok(runs)
    }

    async fn list_pipelines(&self) -> Result<Vec<String>> {
        let snapshots = self.snapshots.read().await;
        let mut names: Vec<String> = snapshots.values().map(|s| s.pipeline_name.clone()).collect();
        names.sort();
        names.dedup();
        Ok(names)
    }

    async fn request_cancel(&self, run_id: Uuid) -> Result<bool> {
        if !self.snapshots.read().await.contains_key(&run_id) {
            return Ok(false);
        }
        self.cancel_requests.write().await.insert(run_id);
        Ok(true)
    }

    async fn cancel_requested(&self, run_id: Uuid) -> Result<bool> {
        Ok(self.cancel_requests.read().await.contains(&run_id))
    }

    async fn heartbeat(&self, run_id: Uuid, at: DateTime<Utc>) -> Result<()> {
        self.heartbeats.write().await.insert(run_id, at);
        Ok(())
    }

    async fn last_heartbeat(&self, run_id: Uuid) -> Result<Option<DateTime<Utc>>> {
        Ok(self.heartbeats.read().await.get(&run_id).copied())
    }
}

/// Create a snapshot from a run
pub fn create_snapshot(run: &Run) -> RunSnapshot {
    RunSnapshot {
        run_id: run.id,
        pipeline_name: run.definition.name.clone(),
        status: run.status,
        params: run.params.clone(),
        started_at: run.started_at,
        completed_at: run.completed_at,
        tasks: run
            .tasks
            .iter()
            .map(|t| TaskSnapshot {
                name: t.name.clone(),
                kind: t.kind.to_string(),
                state: t.state.clone(),
                logs: t.logs.clone(),
                results: t.results.clone(),
            })
            .collect(),
        first_failure: run.first_failure().map(|f| FailureSummary {
            task: f.task.to_string(),
            error: f.error.to_string(),
            exit_code: f.exit_code,
            logs: f.logs.to_string(),
        }),
        updated_at: Utc::now(),
    }
}
