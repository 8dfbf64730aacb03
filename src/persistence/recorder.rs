//! Run recorder - ordered event log plus latest snapshot

use crate::core::{Run, RunEvent};
use crate::persistence::{create_snapshot, InMemoryPersistence, PersistenceBackend, RecordedEvent};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::warn;
use uuid::Uuid;

/// Records every event of a run to a persistence backend
///
/// Recording never fails a run: backend errors are logged and dropped.
pub struct RunRecorder {
    backend: Arc<dyn PersistenceBackend>,
    sequences: Mutex<HashMap<Uuid, u64>>,
}

impl RunRecorder {
    pub fn new(backend: Arc<dyn PersistenceBackend>) -> Self {
        Self {
            backend,
            sequences: Mutex::new(HashMap::new()),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemoryPersistence::new()))
    }

    pub fn backend(&self) -> &Arc<dyn PersistenceBackend> {
        &self.backend
    }

    fn next_sequence(&self, run_id: Uuid) -> u64 {
        let mut sequences = self
            .sequences
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let seq = sequences.entry(run_id).or_insert(0);
        *seq += 1;
        *seq
    }

    /// Append `event` to the run's log and store a fresh snapshot
    pub async fn record(&self, run: &Run, event: RunEvent) -> RecordedEvent {
        let recorded = RecordedEvent {
            run_id: run.id,
            sequence: self.next_sequence(run.id),
            recorded_at: Utc::now(),
            event,
        };

        if let Err(e) = self.backend.append_event(&recorded).await {
            warn!("Failed to record event {} of run {}: {:#}", recorded.sequence, run.id, e);
        }
        if let Err(e) = self.backend.save_snapshot(&create_snapshot(run)).await {
            warn!("Failed to save snapshot of run {}: {:#}", run.id, e);
        }

        recorded
    }

    /// Whether another process asked for this run to be cancelled
    pub async fn cancel_requested(&self, run_id: Uuid) -> bool {
        match self.backend.cancel_requested(run_id).await {
            Ok(requested) => requested,
            Err(e) => {
                warn!("Failed to check cancel request for run {}: {:#}", run_id, e);
                false
            }
        }
    }

    /// Report that this process is still executing the run
    pub async fn heartbeat(&self, run_id: Uuid) {
        if let Err(e) = self.backend.heartbeat(run_id, Utc::now()).await {
            warn!("Failed to record heartbeat for run {}: {:#}", run_id, e);
        }
    }

    /// Stop tracking a finished run's sequence counter
    pub fn finish(&self, run_id: Uuid) {
        let mut sequences = self
            .sequences
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        sequences.remove(&run_id);
    }
}
