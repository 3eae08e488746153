//! # Stageloom: Staged Content-Production Pipeline Engine
//!
//! Stageloom drives multi-stage content production through external agents:
//! a validated stage DAG, a single-writer project state store, bounded
//! concurrent dispatch with response caching, and durable checkpoints for
//! pause and resume.
//!
//! ## Core Concepts
//!
//! - **Stages**: Units of the pipeline DAG, each bound to an agent role
//! - **Agents**: External collaborators that turn a context into artifacts
//! - **State**: Versioned project record owned by a single writer
//! - **Bus**: In-process topics with bounded history, exactly-once delivery
//! - **Scheduler**: Bounded fan-out with a fingerprint response cache
//! - **Orchestrator**: The drive loop with retries, revisions, checkpoints
//!
//! ## Quick Start
//!
//! ### Defining a Pipeline
//!
//! ```
//! use std::sync::Arc;
//! use stageloom::pipeline::Pipeline;
//! use stageloom::stage::StageDef;
//! use stageloom::utils::testing::ScriptedAgent;
//! use serde_json::json;
//!
//! let pipeline = Pipeline::builder()
//!     .add_stage(
//!         StageDef::new("requirements-gathering")
//!             .expects_artifact("requirements"),
//!     )
//!     .add_stage(
//!         StageDef::new("architecture-design")
//!             .depends_on("requirements-gathering")
//!             .with_agent_role("architect"),
//!     )
//!     .register_agent(
//!         "requirements-gathering",
//!         Arc::new(ScriptedAgent::producing("requirements", json!(["r1"]))),
//!     )
//!     .register_agent(
//!         "architect",
//!         Arc::new(ScriptedAgent::producing("system-design", json!({}))),
//!     )
//!     .with_concurrency(2)
//!     .compile()
//!     .expect("valid pipeline");
//!
//! assert_eq!(pipeline.graph.len(), 2);
//! ```
//!
//! ### Running It
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use stageloom::pipeline::Pipeline;
//! # use stageloom::stage::StageDef;
//! # use stageloom::utils::testing::ScriptedAgent;
//! # use serde_json::json;
//! use stageloom::orchestrator::{Orchestrator, PipelineStatus};
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! # let pipeline = Pipeline::builder()
//! #     .add_stage(StageDef::new("solo"))
//! #     .register_agent("solo", Arc::new(ScriptedAgent::producing("out", json!(1))))
//! #     .compile()?;
//! let orchestrator = Orchestrator::new(pipeline);
//! let report = orchestrator.run("my-project", "a short brief").await?;
//! assert_eq!(report.status, PipelineStatus::Completed);
//! # Ok(())
//! # }
//! ```
//!
//! ### Observing Progress
//!
//! Subscribe to the message bus for pipeline messages, or attach a progress
//! sink for engine telemetry:
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use stageloom::pipeline::Pipeline;
//! # use stageloom::stage::StageDef;
//! # use stageloom::utils::testing::ScriptedAgent;
//! # use serde_json::json;
//! use stageloom::bus::{topics, types};
//! use stageloom::orchestrator::Orchestrator;
//!
//! # let pipeline = Pipeline::builder()
//! #     .add_stage(StageDef::new("solo"))
//! #     .register_agent("solo", Arc::new(ScriptedAgent::producing("out", json!(1))))
//! #     .compile().unwrap();
//! let orchestrator = Orchestrator::new(pipeline);
//! let bus = orchestrator.message_bus();
//! bus.subscribe(topics::message_type(types::STAGE_COMPLETE), |message| {
//!     println!("completed: {}", message.payload["stage"]);
//!     Ok(())
//! });
//! ```
//!
//! ## Module Guide
//!
//! - [`stage`] - Stage identity, definitions, and execution policy
//! - [`artifact`] - Named stage outputs and output-schema validation
//! - [`agent`] - The agent contract and execution context
//! - [`state`] - Versioned project state and the single-writer store
//! - [`bus`] - In-process topic messaging
//! - [`pipeline`] - DAG validation and the pipeline builder
//! - [`scheduler`] - Concurrent dispatch and the response cache
//! - [`orchestrator`] - The drive loop, retries, revisions, progress
//! - [`checkpoint`] - Durable run checkpoints and resume
//! - [`telemetry`] - Tracing subscriber bootstrap

pub mod agent;
pub mod artifact;
pub mod bus;
pub mod checkpoint;
pub mod orchestrator;
pub mod pipeline;
pub mod scheduler;
pub mod stage;
pub mod state;
pub mod telemetry;
pub mod utils;
