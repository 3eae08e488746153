//! Shared fixtures for integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use stageloom::orchestrator::RetryPolicy;
use stageloom::stage::{StageDef, StagePolicy};
use stageloom::utils::testing::ScriptedAgent;

/// Tight timings so retry tests stay fast.
pub fn fast_policy(max_retries: u32) -> StagePolicy {
    StagePolicy {
        timeout: Duration::from_millis(500),
        retry: RetryPolicy {
            max_retries,
            base_delay: Duration::from_millis(1),
            multiplier: 1.0,
            max_delay: Duration::from_millis(5),
            jitter: 0.0,
        },
    }
}

/// Diamond topology: requirements fans out to architecture and ui-design,
/// which join at implementation; completion closes the graph.
pub fn diamond_defs() -> Vec<StageDef> {
    vec![
        StageDef::new("requirements-gathering").expects_artifact("requirements"),
        StageDef::new("architecture-design")
            .depends_on("requirements-gathering")
            .with_agent_role("architect"),
        StageDef::new("ui-design").depends_on("requirements-gathering"),
        StageDef::new("implementation")
            .depends_on("architecture-design")
            .depends_on("ui-design"),
        StageDef::new("completion").depends_on("implementation"),
    ]
}

pub fn scripted(artifact: &str) -> Arc<ScriptedAgent> {
    Arc::new(ScriptedAgent::producing(artifact, json!({"fixture": true})))
}
