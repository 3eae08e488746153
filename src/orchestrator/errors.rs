//! Failure taxonomy for orchestration.
//!
//! [`StageError`] describes why one stage permanently failed; it is carried
//! in outcomes and reports rather than aborting the run. [`PipelineError`]
//! covers faults of the engine itself, which do abort.

use miette::Diagnostic;
use thiserror::Error;

use crate::agent::AgentError;
use crate::checkpoint::CheckpointError;
use crate::stage::StageId;
use crate::state::StateError;

/// Permanent failure of a single stage, after retries were exhausted or the
/// failure was classified permanent.
#[derive(Debug, Error, Diagnostic)]
pub enum StageError {
    #[error("agent failed after {attempts} attempt(s)")]
    #[diagnostic(code(stageloom::orchestrator::agent_failed))]
    Agent {
        attempts: u32,
        #[source]
        #[diagnostic_source]
        source: AgentError,
    },

    /// The agent returned, but without every expected artifact.
    #[error("stage {stage} output is missing artifacts: {}", missing.join(", "))]
    #[diagnostic(
        code(stageloom::orchestrator::missing_artifacts),
        help("The agent must return every artifact the stage declares.")
    )]
    MissingArtifacts {
        stage: StageId,
        missing: Vec<String>,
    },

    #[error("no agent bound for stage {stage}")]
    #[diagnostic(code(stageloom::orchestrator::no_agent))]
    NoAgent { stage: StageId },
}

/// Engine-level fault; aborts the run rather than failing one stage.
#[derive(Debug, Error, Diagnostic)]
pub enum PipelineError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Checkpoint(#[from] CheckpointError),

    /// A spawned stage task panicked or was aborted.
    #[error("stage task join failure: {0}")]
    #[diagnostic(code(stageloom::orchestrator::join))]
    Join(#[from] tokio::task::JoinError),

    #[error("stage {stage} is not part of the pipeline")]
    #[diagnostic(code(stageloom::orchestrator::unknown_stage))]
    UnknownStage { stage: StageId },

    #[error("no checkpoint recorded for session {session_id}")]
    #[diagnostic(
        code(stageloom::orchestrator::no_checkpoint),
        help("Resume requires at least one saved checkpoint for the session.")
    )]
    NoCheckpoint { session_id: String },

    /// A revision was requested from a stage with no declared revision edge
    /// to the target.
    #[error("no revision edge from {from} to {to}")]
    #[diagnostic(
        code(stageloom::orchestrator::no_revision_edge),
        help("Declare the edge with PipelineBuilder::add_revision_edge.")
    )]
    NoRevisionEdge { from: StageId, to: StageId },
}
