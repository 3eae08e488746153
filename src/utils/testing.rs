//! Reusable agents for tests and examples.
//!
//! These are real [`Agent`] implementations with scripted behaviour:
//! deterministic outputs, controlled failures, call counting. Integration
//! tests build whole pipelines out of them.

use async_trait::async_trait;
use rustc_hash::FxHashMap;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::agent::{Agent, AgentError, StageContext};
use crate::artifact::{Artifact, ArtifactSet};

/// Returns a fixed artifact set for every call, tagging each artifact with
/// the executing stage.
pub struct ScriptedAgent {
    outputs: Vec<(String, Value)>,
    calls: AtomicU32,
}

impl ScriptedAgent {
    /// Agent producing a single artifact named `name`.
    #[must_use]
    pub fn producing(name: impl Into<String>, payload: Value) -> Self {
        Self {
            outputs: vec![(name.into(), payload)],
            calls: AtomicU32::new(0),
        }
    }

    #[must_use]
    pub fn with_output(mut self, name: impl Into<String>, payload: Value) -> Self {
        self.outputs.push((name.into(), payload));
        self
    }

    #[must_use]
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Agent for ScriptedAgent {
    async fn execute(&self, ctx: StageContext) -> Result<ArtifactSet, AgentError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(ArtifactSet::from_artifacts(self.outputs.iter().map(
            |(name, payload)| {
                Artifact::new(
                    name.clone(),
                    json!({"stage": ctx.stage.encode(), "data": payload}),
                )
            },
        )))
    }
}

/// Fails transiently a configured number of times, then succeeds.
pub struct FlakyAgent {
    failures: AtomicU32,
    artifact: String,
    calls: AtomicU32,
}

impl FlakyAgent {
    #[must_use]
    pub fn failing_times(failures: u32, artifact: impl Into<String>) -> Self {
        Self {
            failures: AtomicU32::new(failures),
            artifact: artifact.into(),
            calls: AtomicU32::new(0),
        }
    }

    #[must_use]
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Agent for FlakyAgent {
    async fn execute(&self, _ctx: StageContext) -> Result<ArtifactSet, AgentError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.store(remaining - 1, Ordering::SeqCst);
            return Err(AgentError::RateLimited);
        }
        Ok(ArtifactSet::new().with(Artifact::new(self.artifact.clone(), json!("ok"))))
    }
}

/// Always fails with a permanent error.
pub struct BrokenAgent;

#[async_trait]
impl Agent for BrokenAgent {
    async fn execute(&self, _ctx: StageContext) -> Result<ArtifactSet, AgentError> {
        Err(AgentError::Fatal("scripted permanent failure".into()))
    }
}

/// Sleeps for the configured duration before succeeding; used to exercise
/// timeouts and cancellation.
pub struct SlowAgent {
    delay: Duration,
    artifact: String,
}

impl SlowAgent {
    #[must_use]
    pub fn new(delay: Duration, artifact: impl Into<String>) -> Self {
        Self {
            delay,
            artifact: artifact.into(),
        }
    }
}

#[async_trait]
impl Agent for SlowAgent {
    async fn execute(&self, _ctx: StageContext) -> Result<ArtifactSet, AgentError> {
        tokio::time::sleep(self.delay).await;
        Ok(ArtifactSet::new().with(Artifact::new(self.artifact.clone(), json!("slow"))))
    }
}

/// Records every context it sees; useful for asserting upstream wiring.
#[derive(Default)]
pub struct RecordingAgent {
    seen: Mutex<Vec<StageContext>>,
    outputs: FxHashMap<String, Value>,
}

impl RecordingAgent {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    #[must_use]
    pub fn producing(name: impl Into<String>, payload: Value) -> Arc<Self> {
        let mut outputs = FxHashMap::default();
        outputs.insert(name.into(), payload);
        Arc::new(Self {
            seen: Mutex::new(Vec::new()),
            outputs,
        })
    }

    /// Contexts observed so far, in call order.
    #[must_use]
    pub fn contexts(&self) -> Vec<StageContext> {
        match self.seen.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

#[async_trait]
impl Agent for RecordingAgent {
    async fn execute(&self, ctx: StageContext) -> Result<ArtifactSet, AgentError> {
        if let Ok(mut seen) = self.seen.lock() {
            seen.push(ctx);
        }
        Ok(ArtifactSet::from_artifacts(
            self.outputs
                .iter()
                .map(|(name, payload)| Artifact::new(name.clone(), payload.clone())),
        ))
    }
}
