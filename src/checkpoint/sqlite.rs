//! SQLite-backed checkpoint storage.
//!
//! One table, keyed by `(session_id, version)`; the project state and settled
//! set are stored as JSON text via [`PersistedCheckpoint`]. The schema is
//! created on connect, so a fresh database file works without external
//! migration tooling.

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;
use tracing::instrument;

use super::persistence::PersistedCheckpoint;
use super::{Checkpoint, CheckpointError, Checkpointer};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS checkpoints (
    session_id  TEXT    NOT NULL,
    version     INTEGER NOT NULL,
    state_json  TEXT    NOT NULL,
    settled_json TEXT   NOT NULL,
    fingerprints_json TEXT NOT NULL,
    created_at  TEXT    NOT NULL,
    PRIMARY KEY (session_id, version)
);
";

fn backend(e: impl std::fmt::Display) -> CheckpointError {
    CheckpointError::Backend {
        message: e.to_string(),
    }
}

/// Durable checkpointer on a SQLite database.
pub struct SqliteCheckpointer {
    pool: SqlitePool,
}

impl std::fmt::Debug for SqliteCheckpointer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteCheckpointer").finish()
    }
}

impl SqliteCheckpointer {
    /// Connect to `database_url` (e.g. `sqlite://runs.db`), creating the
    /// file and schema if needed.
    pub async fn connect(database_url: &str) -> Result<Self, CheckpointError> {
        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(backend)?
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(backend)?;
        sqlx::query(SCHEMA).execute(&pool).await.map_err(backend)?;
        Ok(Self { pool })
    }
}

#[async_trait]
impl Checkpointer for SqliteCheckpointer {
    #[instrument(skip(self, checkpoint), fields(session = %checkpoint.session_id, version = checkpoint.version()))]
    async fn save(&self, checkpoint: Checkpoint) -> Result<(), CheckpointError> {
        let persisted = PersistedCheckpoint::try_from(&checkpoint)?;
        let state_json = serde_json::to_string(&persisted.state)?;
        let settled_json = serde_json::to_string(&persisted.settled)?;
        let fingerprints_json = serde_json::to_string(&persisted.fingerprints)?;

        sqlx::query(
            "INSERT OR REPLACE INTO checkpoints
             (session_id, version, state_json, settled_json, fingerprints_json, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )
        .bind(&persisted.session_id)
        .bind(persisted.version as i64)
        .bind(state_json)
        .bind(settled_json)
        .bind(fingerprints_json)
        .bind(&persisted.created_at)
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        Ok(())
    }

    async fn load_latest(&self, session_id: &str) -> Result<Option<Checkpoint>, CheckpointError> {
        let row = sqlx::query(
            "SELECT session_id, version, state_json, settled_json, fingerprints_json, created_at
             FROM checkpoints WHERE session_id = ?1
             ORDER BY version DESC LIMIT 1",
        )
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;

        let Some(row) = row else {
            return Ok(None);
        };

        let state_json: String = row.try_get("state_json").map_err(backend)?;
        let settled_json: String = row.try_get("settled_json").map_err(backend)?;
        let fingerprints_json: String = row.try_get("fingerprints_json").map_err(backend)?;
        let persisted = PersistedCheckpoint {
            session_id: row.try_get("session_id").map_err(backend)?,
            version: row.try_get::<i64, _>("version").map_err(backend)? as u64,
            state: serde_json::from_str(&state_json)?,
            settled: serde_json::from_str(&settled_json)?,
            fingerprints: serde_json::from_str(&fingerprints_json)?,
            created_at: row.try_get("created_at").map_err(backend)?,
        };
        Checkpoint::try_from(persisted).map(Some)
    }

    async fn list_sessions(&self) -> Result<Vec<String>, CheckpointError> {
        let rows = sqlx::query(
            "SELECT DISTINCT session_id FROM checkpoints ORDER BY session_id",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;
        rows.into_iter()
            .map(|row| row.try_get::<String, _>("session_id").map_err(backend))
            .collect()
    }
}
