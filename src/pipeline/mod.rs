//! Pipeline definition: the stage DAG, its validation, and the fluent
//! builder that binds agents and runtime configuration to it.

pub mod builder;
pub mod graph;

pub use builder::{BuildError, CacheConfig, Pipeline, PipelineBuilder};
pub use graph::{GraphError, StageGraph};
