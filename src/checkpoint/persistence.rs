//! Serde shapes for persisted checkpoints.
//!
//! Explicit persistence structs decoupled from the in-memory types, so the
//! storage backends stay lean and the wire format is stable. No I/O here;
//! pure data transformation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{Checkpoint, CheckpointError};
use crate::stage::StageId;
use crate::state::ProjectState;

/// Stable serialized form of a [`Checkpoint`].
///
/// Stage ids use the string encoding (`Stage:<name>` / `Completed` /
/// `Failed`); unknown encodings round-trip as named stages. Timestamps are
/// RFC 3339 strings to keep chrono types out of the serialized shape.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PersistedCheckpoint {
    pub session_id: String,
    pub version: u64,
    pub state: Value,
    pub settled: Vec<String>,
    #[serde(default)]
    pub fingerprints: Vec<String>,
    pub created_at: String,
}

impl TryFrom<&Checkpoint> for PersistedCheckpoint {
    type Error = CheckpointError;

    fn try_from(checkpoint: &Checkpoint) -> Result<Self, Self::Error> {
        Ok(Self {
            session_id: checkpoint.session_id.clone(),
            version: checkpoint.version(),
            state: serde_json::to_value(&checkpoint.state)?,
            settled: checkpoint.settled.iter().map(StageId::encode).collect(),
            fingerprints: checkpoint.fingerprints.clone(),
            created_at: checkpoint.created_at.to_rfc3339(),
        })
    }
}

impl TryFrom<PersistedCheckpoint> for Checkpoint {
    type Error = CheckpointError;

    fn try_from(persisted: PersistedCheckpoint) -> Result<Self, Self::Error> {
        let state: ProjectState = serde_json::from_value(persisted.state)?;
        let created_at = DateTime::parse_from_rfc3339(&persisted.created_at)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| CheckpointError::Backend {
                message: format!("bad created_at timestamp: {e}"),
            })?;
        Ok(Self {
            session_id: persisted.session_id,
            state,
            settled: persisted.settled.iter().map(|s| StageId::decode(s)).collect(),
            fingerprints: persisted.fingerprints,
            created_at,
        })
    }
}
