//! Core stage types for the stageloom pipeline engine.
//!
//! This module defines the fundamental types used to identify pipeline stages
//! and to describe their execution policy. These are the core domain concepts
//! that define what a pipeline *is*; runtime concerns (scheduling, caching,
//! checkpointing) live in their own modules.
//!
//! # Key Types
//!
//! - [`StageId`]: Identifies a stage in the pipeline graph
//! - [`StageDef`]: A stage's dependencies, policy, and expected outputs
//! - [`StagePolicy`]: Per-stage timeout and retry parameters
//!
//! # Examples
//!
//! ```rust
//! use stageloom::stage::StageId;
//!
//! let requirements = StageId::requirements();
//! let custom = StageId::named("copy-editing");
//!
//! // Encode for persistence
//! assert_eq!(custom.encode(), "Stage:copy-editing");
//! assert_eq!(StageId::decode("Stage:copy-editing"), custom);
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::orchestrator::retry::RetryPolicy;

/// Identifies a stage within a pipeline.
///
/// Working stages are `Named`; two terminal markers close out every run.
/// `Completed` is reachable only from the configured final stage, `Failed`
/// from any non-terminal stage. Terminal markers are virtual: they carry no
/// agent and are never dispatched.
///
/// # Persistence
///
/// `StageId` supports serialization through serde and through the
/// [`encode`](Self::encode)/[`decode`](Self::decode) string form used by
/// checkpoint backends.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StageId {
    /// A working stage identified by its catalog name.
    Named(String),
    /// Terminal marker: the pipeline finished successfully.
    Completed,
    /// Terminal marker: the pipeline failed permanently.
    Failed,
}

impl StageId {
    /// Create a named working stage.
    #[must_use]
    pub fn named(name: impl Into<String>) -> Self {
        StageId::Named(name.into())
    }

    // Default content-production catalog. Pipelines are free to define any
    // catalog; these constructors exist so the common one reads well.
    pub fn requirements() -> Self {
        Self::named("requirements-gathering")
    }
    pub fn architecture() -> Self {
        Self::named("architecture-design")
    }
    pub fn ui_design() -> Self {
        Self::named("ui-design")
    }
    pub fn implementation() -> Self {
        Self::named("implementation")
    }
    pub fn testing() -> Self {
        Self::named("testing")
    }
    pub fn quality_review() -> Self {
        Self::named("quality-review")
    }
    pub fn completion() -> Self {
        Self::named("completion")
    }

    /// Encode a StageId into its persisted string form.
    ///
    /// - `Named("x")` → `"Stage:x"`
    /// - `Completed` → `"Completed"`
    /// - `Failed` → `"Failed"`
    #[must_use]
    pub fn encode(&self) -> String {
        match self {
            StageId::Named(s) => format!("Stage:{s}"),
            StageId::Completed => "Completed".to_string(),
            StageId::Failed => "Failed".to_string(),
        }
    }

    /// Decode a persisted string form back into a StageId.
    ///
    /// Unrecognized formats fall back to `Named(s)` for forward
    /// compatibility.
    pub fn decode(s: &str) -> Self {
        if s == "Completed" {
            StageId::Completed
        } else if s == "Failed" {
            StageId::Failed
        } else if let Some(rest) = s.strip_prefix("Stage:") {
            StageId::Named(rest.to_string())
        } else {
            StageId::Named(s.to_string())
        }
    }

    /// Returns `true` for the two terminal markers.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, StageId::Completed | StageId::Failed)
    }

    /// Returns the catalog name of a named stage, if any.
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        match self {
            StageId::Named(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StageId::Named(name) => write!(f, "{name}"),
            StageId::Completed => write!(f, "Completed"),
            StageId::Failed => write!(f, "Failed"),
        }
    }
}

// Developer experience: allow string literals where a StageId is expected.
impl From<&str> for StageId {
    fn from(s: &str) -> Self {
        match s {
            "Completed" => StageId::Completed,
            "Failed" => StageId::Failed,
            other => StageId::Named(other.to_string()),
        }
    }
}

/// Per-stage execution policy: agent-call timeout plus retry parameters.
#[derive(Clone, Debug, PartialEq)]
pub struct StagePolicy {
    /// Upper bound on a single agent call. Exceeding it converts the call
    /// into a transient, retryable error.
    pub timeout: Duration,
    /// Retry behaviour for transient failures.
    pub retry: RetryPolicy,
}

impl Default for StagePolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(120),
            retry: RetryPolicy::default(),
        }
    }
}

/// Full definition of one working stage: identity, dependencies, policy,
/// expected artifacts, and the agent role that produces them.
#[derive(Clone, Debug)]
pub struct StageDef {
    pub id: StageId,
    /// Stages whose artifacts this stage consumes. All must settle
    /// successfully before this stage becomes dispatchable.
    pub depends_on: Vec<StageId>,
    pub policy: StagePolicy,
    /// Artifact names the agent must return; validated after every call.
    pub expected_artifacts: Vec<String>,
    /// Role tag handed to the agent and folded into the cache fingerprint.
    pub agent_role: String,
}

impl StageDef {
    /// Create a stage definition with default policy and no dependencies.
    pub fn new(id: impl Into<StageId>) -> Self {
        Self::with_id(id.into())
    }

    fn with_id(id: StageId) -> Self {
        let agent_role = id
            .name()
            .map(|n| n.to_string())
            .unwrap_or_else(|| id.encode());
        Self {
            id,
            depends_on: Vec::new(),
            policy: StagePolicy::default(),
            expected_artifacts: Vec::new(),
            agent_role,
        }
    }

    /// Declare a dependency on another stage.
    #[must_use]
    pub fn depends_on(mut self, dep: impl Into<StageId>) -> Self {
        self.depends_on.push(dep.into());
        self
    }

    /// Override the default execution policy.
    #[must_use]
    pub fn with_policy(mut self, policy: StagePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Require a named artifact in the agent's output.
    #[must_use]
    pub fn expects_artifact(mut self, name: impl Into<String>) -> Self {
        self.expected_artifacts.push(name.into());
        self
    }

    /// Set the agent role (defaults to the stage name).
    #[must_use]
    pub fn with_agent_role(mut self, role: impl Into<String>) -> Self {
        self.agent_role = role.into();
        self
    }
}

/// Policy for "revision" backward transitions out of review-type stages.
///
/// Whether stages between the revision target and the current position must
/// re-execute is a product decision, so it is configuration rather than a
/// hard-coded assumption.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum RevisionPolicy {
    /// Un-settle only the revision target; downstream results stay cached.
    TargetOnly,
    /// Un-settle the target and everything downstream of it, forcing a full
    /// replay on the way back up.
    #[default]
    ReplayIntermediates,
}
