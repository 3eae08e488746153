//! Fluent construction and validation of a [`Pipeline`].
//!
//! [`PipelineBuilder`] accumulates stage definitions, revision edges, agent
//! bindings, and runtime configuration, then [`compile`](PipelineBuilder::compile)s
//! them into an immutable [`Pipeline`] after structural validation.

use miette::Diagnostic;
use rustc_hash::FxHashMap;
use serde_json::Value;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::agent::Agent;
use crate::pipeline::graph::{GraphError, StageGraph};
use crate::stage::{RevisionPolicy, StageDef, StageId};

/// Errors raised when compiling a pipeline.
#[derive(Debug, Error, Diagnostic)]
pub enum BuildError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Graph(#[from] GraphError),

    #[error("no agent registered for role {role} (required by stage {stage})")]
    #[diagnostic(
        code(stageloom::pipeline::missing_agent),
        help("Register the agent with PipelineBuilder::register_agent before compiling.")
    )]
    MissingAgent { role: String, stage: StageId },

    #[error("concurrency limit must be at least 1")]
    #[diagnostic(code(stageloom::pipeline::zero_concurrency))]
    ZeroConcurrency,
}

/// Response-cache sizing; `None` on the pipeline disables caching entirely.
#[derive(Clone, Debug)]
pub struct CacheConfig {
    pub capacity: NonZeroUsize,
    /// Entries older than this are treated as absent on lookup.
    pub ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            // Safety: 256 is non-zero.
            capacity: NonZeroUsize::new(256).unwrap_or(NonZeroUsize::MIN),
            ttl: Duration::from_secs(3600),
        }
    }
}

/// An immutable, validated pipeline: the stage DAG plus everything the
/// orchestrator needs to run it.
pub struct Pipeline {
    pub graph: StageGraph,
    /// Agent bindings keyed by role.
    pub agents: FxHashMap<String, Arc<dyn Agent>>,
    /// Maximum number of stages executing concurrently in one dispatch round.
    pub concurrency_limit: usize,
    pub cache: Option<CacheConfig>,
    pub revision_policy: RevisionPolicy,
    /// When set, completing a task with incomplete dependency tasks is an
    /// error rather than a warning.
    pub strict_tasks: bool,
    /// Model configuration handed to every agent and folded into cache
    /// fingerprints.
    pub model_config: Value,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("stages", &self.graph.len())
            .field("agents", &self.agents.keys().collect::<Vec<_>>())
            .field("concurrency_limit", &self.concurrency_limit)
            .field("revision_policy", &self.revision_policy)
            .finish_non_exhaustive()
    }
}

impl Pipeline {
    #[must_use]
    pub fn builder() -> PipelineBuilder {
        PipelineBuilder::new()
    }

    /// The agent bound to a stage, via the stage's role tag.
    #[must_use]
    pub fn agent_for(&self, stage: &StageId) -> Option<Arc<dyn Agent>> {
        let def = self.graph.def(stage)?;
        self.agents.get(&def.agent_role).cloned()
    }
}

/// Accumulates pipeline configuration before validation.
#[derive(Default)]
pub struct PipelineBuilder {
    stages: Vec<StageDef>,
    revision_edges: Vec<(StageId, StageId)>,
    agents: FxHashMap<String, Arc<dyn Agent>>,
    concurrency_limit: Option<usize>,
    cache: Option<CacheConfig>,
    cache_disabled: bool,
    revision_policy: RevisionPolicy,
    strict_tasks: bool,
    model_config: Option<Value>,
}

impl PipelineBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn add_stage(mut self, def: StageDef) -> Self {
        self.stages.push(def);
        self
    }

    /// Declare a backward edge a review-type stage may route along.
    #[must_use]
    pub fn add_revision_edge(
        mut self,
        from: impl Into<StageId>,
        to: impl Into<StageId>,
    ) -> Self {
        self.revision_edges.push((from.into(), to.into()));
        self
    }

    #[must_use]
    pub fn register_agent(mut self, role: impl Into<String>, agent: Arc<dyn Agent>) -> Self {
        self.agents.insert(role.into(), agent);
        self
    }

    /// Cap on concurrently executing stages. Defaults to 4.
    #[must_use]
    pub fn with_concurrency(mut self, limit: usize) -> Self {
        self.concurrency_limit = Some(limit);
        self
    }

    #[must_use]
    pub fn with_cache(mut self, config: CacheConfig) -> Self {
        self.cache = Some(config);
        self
    }

    /// Disable the response cache entirely.
    #[must_use]
    pub fn without_cache(mut self) -> Self {
        self.cache_disabled = true;
        self
    }

    #[must_use]
    pub fn with_revision_policy(mut self, policy: RevisionPolicy) -> Self {
        self.revision_policy = policy;
        self
    }

    #[must_use]
    pub fn strict_tasks(mut self, strict: bool) -> Self {
        self.strict_tasks = strict;
        self
    }

    #[must_use]
    pub fn with_model_config(mut self, config: Value) -> Self {
        self.model_config = Some(config);
        self
    }

    /// Validate and produce the immutable [`Pipeline`].
    pub fn compile(self) -> Result<Pipeline, BuildError> {
        let concurrency_limit = match self.concurrency_limit {
            Some(0) => return Err(BuildError::ZeroConcurrency),
            Some(n) => n,
            None => 4,
        };

        let graph = StageGraph::build(self.stages, self.revision_edges)?;

        for def in graph.defs() {
            if !self.agents.contains_key(&def.agent_role) {
                return Err(BuildError::MissingAgent {
                    role: def.agent_role.clone(),
                    stage: def.id.clone(),
                });
            }
        }

        let cache = if self.cache_disabled {
            None
        } else {
            Some(self.cache.unwrap_or_default())
        };

        Ok(Pipeline {
            graph,
            agents: self.agents,
            concurrency_limit,
            cache,
            revision_policy: self.revision_policy,
            strict_tasks: self.strict_tasks,
            model_config: self.model_config.unwrap_or(Value::Null),
        })
    }
}
