//! SQLite-based persistence store

use crate::persistence::{PersistenceBackend, RecordedEvent, RunSnapshot};
use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use uuid::Uuid;

/// SQLite run store
///
/// Snapshots and events are stored as JSON; the indexed columns exist for
/// listing and filtering.
pub struct SqliteRunStore {
    pool: SqlitePool,
}

impl SqliteRunStore {
    /// Open (creating if needed) the database at `db_path`
    pub async fn new(db_path: &Path) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", db_path.display()))
            .context("Invalid database path")?
            .create_if_missing(true);
        let pool = SqlitePool::connect_with(options)
            .await
            .context("Failed to connect to database")?;

        let store = Self { pool };
        store.init().await?;

        Ok(store)
    }

    /// A private in-memory database
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        // Every connection to :memory: is a separate database
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .context("Failed to open in-memory database")?;

        let store = Self { pool };
        store.init().await?;

        Ok(store)
    }

    /// `<local data dir>/taskline/runs.db`
    pub fn default_path() -> PathBuf {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("taskline")
            .join("runs.db")
    }

    /// Create store with default path
    pub async fn with_default_path() -> Result<Self> {
        let db_path = Self::default_path();
        if let Some(dir) = db_path.parent() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create {}", dir.display()))?;
        }
        Self::new(&db_path).await
    }

    /// Initialize database schema
    async fn init(&self) -> Result<()> {
        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS runs (
                id TEXT PRIMARY KEY,
                pipeline_name TEXT NOT NULL,
                status TEXT NOT NULL,
                started_at TEXT,
                snapshot TEXT NOT NULL,
                cancel_requested INTEGER NOT NULL DEFAULT 0,
                heartbeat_at TEXT
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_runs_pipeline_name ON runs(pipeline_name)",
            "CREATE INDEX IF NOT EXISTS idx_runs_started_at ON runs(started_at)",
            r#"
            CREATE TABLE IF NOT EXISTS run_events (
                run_id TEXT NOT NULL,
                sequence INTEGER NOT NULL,
                recorded_at TEXT NOT NULL,
                event TEXT NOT NULL,
                PRIMARY KEY (run_id, sequence)
            )
            "#,
        ];

        for statement in statements {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .context("Failed to initialize schema")?;
        }

        Ok(())
    }

    fn parse_snapshot(json: &str) -> Result<RunSnapshot> {
        serde_json::from_str(json).context("Corrupt run snapshot")
    }
}

/// Fixed-width RFC 3339 so the text column sorts chronologically
fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

#[async_trait::async_trait]
impl PersistenceBackend for SqliteRunStore {
    async fn save_snapshot(&self, snapshot: &RunSnapshot) -> Result<()> {
        let json = serde_json::to_string(snapshot)?;
        sqlx::query(
            r#"
            INSERT INTO runs (id, pipeline_name, status, started_at, snapshot)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(id) DO UPDATE SET
                status = excluded.status,
                started_at = excluded.started_at,
                snapshot = excluded.snapshot
            "#,
        )
        .bind(snapshot.run_id.to_string())
        .bind(&snapshot.pipeline_name)
        .bind(snapshot.status.as_str())
        .bind(snapshot.started_at.map(timestamp))
        .bind(json)
        .execute(&self.pool)
        .await
        .context("Failed to save snapshot")?;

        Ok(())
    }

    async fn load_snapshot(&self, run_id: Uuid) -> Result<Option<RunSnapshot>> {
        let row = sqlx::query("SELECT snapshot FROM runs WHERE id = ?1")
            .bind(run_id.to_string())
            .fetch_optional(&self.pool)
            .await
            .context("Failed to load snapshot")?;

        row.map(|row| Self::parse_snapshot(&row.get::<String, _>("snapshot")))
            .transpose()
    }

    async fn append_event(&self, event: &RecordedEvent) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO run_events (run_id, sequence, recorded_at, event)
            VALUES (?1, ?2, ?3, ?4)
            "#,
        )
        .bind(event.run_id.to_string())
        .bind(event.sequence as i64)
        .bind(timestamp(event.recorded_at))
        .bind(serde_json::to_string(&event.event)?)
        .execute(&self.pool)
        .await
        .context("Failed to append event")?;

        Ok(())
    }

    async fn load_events(&self, run_id: Uuid) -> Result<Vec<RecordedEvent>> {
        let rows = sqlx::query(
            r#"
            SELECT sequence, recorded_at, event
            FROM run_events
            WHERE run_id = ?1
            ORDER BY sequence ASC
            "#,
        )
        .bind(run_id.to_string())
        .fetch_all(&self.pool)
        .await
        .context("Failed to load events")?;

        rows.iter()
            .map(|row| {
                let recorded_at: String = row.get("recorded_at");
                Ok(RecordedEvent {
                    run_id,
                    sequence: row.get::<i64, _>("sequence") as u64,
                    recorded_at: DateTime::parse_from_rfc3339(&recorded_at)?.with_timezone(&Utc),
                    event: serde_json::from_str(&row.get::<String, _>("event"))
                        .context("Corrupt run event")?,
                })
            })
            .collect()
    }

    async fn list_runs(
        &self,
        pipeline_name: Option<&str>,
        limit: usize,
    ) -> Result<Vec<RunSnapshot>> {
        let rows = sqlx::query(
            r#"
            SELECT snapshot
            FROM runs
            WHERE ?1 IS NULL OR pipeline_name = ?1
            ORDER BY started_at DESC
            LIMIT ?2
            "#,
        )
        .bind(pipeline_name)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list runs")?;

        rows.iter()
            .map(|row| Self::parse_snapshot(&row.get::<String, _>("snapshot")))
            .collect()
    }

    async fn list_pipelines(&self) -> Result<Vec<String>> {
        let rows = sqlx::query(
            r#"
            SELECT DISTINCT pipeline_name
            FROM runs
            ORDER BY pipeline_name ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("Failed to list pipelines")?;

        Ok(rows.iter().map(|row| row.get("pipeline_name")).collect())
    }

    async fn request_cancel(&self, run_id: Uuid) -> Result<bool> {
        let result = sqlx::query("UPDATE runs SET cancel_requested = 1 WHERE id = ?1")
            .bind(run_id.to_string())
            .execute(&self.pool)
            .await
            .context("Failed to request cancellation")?;

        Ok(result.rows_affected() > 0)
    }

    async fn cancel_requested(&self, run_id: Uuid) -> Result<bool> {
        let row = sqlx::query("SELECT cancel_requested FROM runs WHERE id = ?1")
            .bind(run_id.to_string())
            .fetch_optional(&self.pool)
            .await
            .context("Failed to check cancellation")?;

        Ok(row.is_some_and(|row| row.get::<i64, _>("cancel_requested") != 0))
    }

    async fn heartbeat(&self, run_id: Uuid, at: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE runs SET heartbeat_at = ?2 WHERE id = ?1")
            .bind(run_id.to_string())
            .bind(timestamp(at))
            .execute(&self.pool)
            .await
            .context("Failed to record heartbeat")?;

        Ok(())
    }

    async fn last_heartbeat(&self, run_id: Uuid) -> Result<Option<DateTime<Utc>>> {
        let row = sqlx::query("SELECT heartbeat_at FROM runs WHERE id = ?1")
            .bind(run_id.to_string())
            .fetch_optional(&self.pool)
            .await
            .context("Failed to load heartbeat")?;

        row.and_then(|row| row.get::<Option<String>, _>("heartbeat_at"))
            .map(|at| -> Result<DateTime<Utc>> {
                Ok(DateTime::parse_from_rfc3339(&at)?.with_timezone(&Utc))
            })
            .transpose()
    }
}
