//! Project state: the versioned record of everything a pipeline run has
//! produced, owned by a single-writer [`StateStore`].

pub mod errors;
pub mod project;
pub mod task;

pub use errors::StateError;
pub use project::{Decision, Feedback, ProjectSnapshot, ProjectState, StageTransition, StateStore};
pub use task::{Task, TaskId, TaskStatus};
