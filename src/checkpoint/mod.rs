//! Durable run checkpoints.
//!
//! After every settled dispatch round the orchestrator saves a [`Checkpoint`]
//! through the configured [`Checkpointer`]. A checkpoint captures the project
//! state plus the set of settled stages, which together are sufficient to
//! resume the run from the last consistent point.
//!
//! Backends: [`InMemoryCheckpointer`] for tests and ephemeral runs, and a
//! SQLite backend behind the `sqlite` feature.

mod persistence;
#[cfg(feature = "sqlite")]
mod sqlite;

pub use persistence::PersistedCheckpoint;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteCheckpointer;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use miette::Diagnostic;
use rustc_hash::FxHashMap;
use std::sync::Mutex;
use thiserror::Error;

use crate::stage::StageId;
use crate::state::ProjectState;

/// One saved run position.
#[derive(Clone, Debug)]
pub struct Checkpoint {
    /// Identifies the run; one session accumulates many checkpoints.
    pub session_id: String,
    pub state: ProjectState,
    /// Stages that have settled (completed or permanently failed) so far.
    pub settled: Vec<StageId>,
    /// Hex digests of the responses cached when the checkpoint was taken.
    /// Audit data; the in-process cache is not rebuilt from them on resume.
    pub fingerprints: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl Checkpoint {
    #[must_use]
    pub fn new(session_id: impl Into<String>, state: ProjectState, settled: Vec<StageId>) -> Self {
        Self {
            session_id: session_id.into(),
            state,
            settled,
            fingerprints: Vec::new(),
            created_at: Utc::now(),
        }
    }

    #[must_use]
    pub fn with_fingerprints(mut self, fingerprints: Vec<String>) -> Self {
        self.fingerprints = fingerprints;
        self
    }

    /// State version this checkpoint was taken at; the per-session ordering
    /// key.
    #[must_use]
    pub fn version(&self) -> u64 {
        self.state.version
    }
}

#[derive(Debug, Error, Diagnostic)]
pub enum CheckpointError {
    #[error("checkpoint backend error: {message}")]
    #[diagnostic(code(stageloom::checkpoint::backend))]
    Backend { message: String },

    #[error("checkpoint serialization error: {0}")]
    #[diagnostic(code(stageloom::checkpoint::serde))]
    Serde(#[from] serde_json::Error),
}

/// Persistence backend for checkpoints.
#[async_trait]
pub trait Checkpointer: Send + Sync {
    /// Persist one checkpoint. Saving the same session/version twice
    /// replaces the earlier copy.
    async fn save(&self, checkpoint: Checkpoint) -> Result<(), CheckpointError>;

    /// Highest-version checkpoint for the session, if any.
    async fn load_latest(&self, session_id: &str) -> Result<Option<Checkpoint>, CheckpointError>;

    /// Known session ids, sorted.
    async fn list_sessions(&self) -> Result<Vec<String>, CheckpointError>;
}

/// Keeps checkpoints in process memory. The default backend; suitable for
/// tests and runs that do not need durability.
#[derive(Default)]
pub struct InMemoryCheckpointer {
    sessions: Mutex<FxHashMap<String, Vec<Checkpoint>>>,
}

impl InMemoryCheckpointer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Checkpointer for InMemoryCheckpointer {
    async fn save(&self, checkpoint: Checkpoint) -> Result<(), CheckpointError> {
        let mut sessions = match self.sessions.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let entries = sessions.entry(checkpoint.session_id.clone()).or_default();
        entries.retain(|c| c.version() != checkpoint.version());
        entries.push(checkpoint);
        entries.sort_by_key(Checkpoint::version);
        Ok(())
    }

    async fn load_latest(&self, session_id: &str) -> Result<Option<Checkpoint>, CheckpointError> {
        let sessions = match self.sessions.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        Ok(sessions
            .get(session_id)
            .and_then(|entries| entries.last().cloned()))
    }

    async fn list_sessions(&self) -> Result<Vec<String>, CheckpointError> {
        let sessions = match self.sessions.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut ids: Vec<String> = sessions.keys().cloned().collect();
        ids.sort_unstable();
        Ok(ids)
    }
}
