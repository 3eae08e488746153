//! The agent contract: the external collaborator that produces a stage's
//! artifacts.
//!
//! The engine never talks to a model provider directly. Each stage is mapped
//! to an [`Agent`] implementation at pipeline construction time; the
//! orchestrator builds a read-only [`StageContext`], calls
//! [`Agent::execute`], and classifies any failure as transient (retried with
//! backoff) or permanent (fails the stage).

use async_trait::async_trait;
use miette::Diagnostic;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

use crate::artifact::ArtifactSet;
use crate::stage::StageId;

/// External collaborator that produces a stage's artifacts.
///
/// # Error classification
///
/// Implementations distinguish transient failures (timeouts, provider rate
/// limits) from permanent ones via the [`AgentError`] variants; the
/// orchestrator retries only the former. Anything an implementation cannot
/// classify should be returned as [`AgentError::Fatal`].
///
/// Implementations must be stateless with respect to the pipeline: the
/// context is a read-only snapshot, and all output flows back through the
/// returned [`ArtifactSet`].
#[async_trait]
pub trait Agent: Send + Sync {
    /// Produce the stage's artifacts from the given context.
    async fn execute(&self, ctx: StageContext) -> Result<ArtifactSet, AgentError>;
}

/// Minimal project identity carried into every stage context.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProjectHeader {
    pub project_id: String,
    pub name: String,
    pub description: String,
    /// Version counter of the project state the snapshot was taken from.
    pub version: u64,
}

/// Read-only execution context handed to an agent.
///
/// Built by the orchestrator from the project state plus the artifact sets of
/// every upstream dependency. Concurrently executing stages each receive
/// their own context and never mutate shared state; results are applied by
/// the orchestrator one at a time after the join barrier.
#[derive(Clone, Debug)]
pub struct StageContext {
    pub stage: StageId,
    pub agent_role: String,
    /// 1-based attempt number; increments across retries of the same stage.
    pub attempt: u32,
    pub project: ProjectHeader,
    /// Artifacts of settled upstream stages, keyed by encoded stage id.
    pub upstream: FxHashMap<String, ArtifactSet>,
    /// Review feedback recorded about this stage, oldest first. Populated
    /// after a revision so the agent can act on the reviewer's notes; part
    /// of the cache fingerprint so a revised re-run never replays the
    /// pre-revision response.
    pub feedback: Vec<String>,
    /// Model configuration for the agent (provider, model name, sampling
    /// parameters). Folded into the cache fingerprint.
    pub model_config: Value,
}

impl StageContext {
    /// Deterministic JSON payload used for cache fingerprinting.
    ///
    /// Excludes the attempt counter and artifact timestamps so that retries
    /// and re-runs of an unchanged pipeline hash identically.
    #[must_use]
    pub fn fingerprint_payload(&self) -> Value {
        let mut upstream: Vec<Value> = self
            .upstream
            .iter()
            .map(|(stage, set)| {
                let mut artifacts: Vec<Value> = set
                    .iter()
                    .map(|a| json!({"name": a.name, "kind": a.kind, "payload": a.payload}))
                    .collect();
                artifacts.sort_by(|a, b| a["name"].as_str().cmp(&b["name"].as_str()));
                json!({"stage": stage, "artifacts": artifacts})
            })
            .collect();
        upstream.sort_by(|a, b| a["stage"].as_str().cmp(&b["stage"].as_str()));

        json!({
            "project": {
                "name": self.project.name,
                "description": self.project.description,
            },
            "upstream": upstream,
            "feedback": self.feedback,
        })
    }
}

/// Errors an agent call can produce, classified for retry policy.
///
/// Transient variants are retried with exponential backoff; everything else
/// permanently fails the stage once surfaced.
#[derive(Debug, Error, Diagnostic)]
pub enum AgentError {
    /// The call exceeded the stage's timeout. Transient.
    #[error("agent call timed out after {elapsed_ms}ms")]
    #[diagnostic(
        code(stageloom::agent::timeout),
        help("Raise the stage timeout or check provider latency.")
    )]
    Timeout { elapsed_ms: u64 },

    /// The provider signalled rate limiting. Transient.
    #[error("provider rate limited the request")]
    #[diagnostic(code(stageloom::agent::rate_limited))]
    RateLimited,

    /// Provider or service error with explicit classification.
    #[error("provider error ({provider}): {message}")]
    #[diagnostic(code(stageloom::agent::provider))]
    Provider {
        provider: &'static str,
        message: String,
        transient: bool,
    },

    /// Cooperative cancellation observed mid-call.
    #[error("agent call cancelled")]
    #[diagnostic(code(stageloom::agent::cancelled))]
    Cancelled,

    /// JSON handling error while assembling or parsing agent output.
    #[error(transparent)]
    #[diagnostic(code(stageloom::agent::serde_json))]
    Serde(#[from] serde_json::Error),

    /// Unclassified failure; treated as permanent.
    #[error("agent failure: {0}")]
    #[diagnostic(code(stageloom::agent::fatal))]
    Fatal(String),
}

impl AgentError {
    /// Whether the orchestrator should retry this failure with backoff.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            AgentError::Timeout { .. } | AgentError::RateLimited => true,
            AgentError::Provider { transient, .. } => *transient,
            AgentError::Cancelled | AgentError::Serde(_) | AgentError::Fatal(_) => false,
        }
    }
}
