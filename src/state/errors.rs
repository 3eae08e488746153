//! Error taxonomy for project state mutation.

use miette::Diagnostic;
use thiserror::Error;

use crate::stage::StageId;
use crate::state::task::TaskId;

/// Errors returned by [`StateStore`](crate::state::StateStore) operations.
#[derive(Debug, Error, Diagnostic)]
pub enum StateError {
    /// The requested stage transition is not an edge of the configured
    /// graph and not a declared revision edge. Configuration or programmer
    /// error; never retried.
    #[error("invalid transition: {from} -> {to}")]
    #[diagnostic(
        code(stageloom::state::invalid_transition),
        help("Check the pipeline's dependency edges and revision edges.")
    )]
    InvalidTransition { from: StageId, to: StageId },

    /// The project has already reached a terminal stage and is immutable.
    #[error("project is terminal at {stage}; no further mutation allowed")]
    #[diagnostic(code(stageloom::state::terminal))]
    Terminal { stage: StageId },

    /// The referenced task id is not present in the project.
    #[error("unknown task: {id}")]
    #[diagnostic(code(stageloom::state::unknown_task))]
    UnknownTask { id: TaskId },

    /// A task cannot complete while a dependency task is incomplete
    /// (strict dependency checking).
    #[error("task {id} has unsatisfied dependency {dependency}")]
    #[diagnostic(
        code(stageloom::state::unsatisfied_dependency),
        help("Complete the dependency first, or relax dependency checking.")
    )]
    UnsatisfiedDependency { id: TaskId, dependency: TaskId },

    /// A task with this id already exists.
    #[error("duplicate task id: {id}")]
    #[diagnostic(code(stageloom::state::duplicate_task))]
    DuplicateTask { id: TaskId },

    /// The snapshot being restored is older than the live state.
    #[error("stale snapshot: snapshot version {snapshot} < live version {live}")]
    #[diagnostic(
        code(stageloom::state::stale_snapshot),
        help("Reload the latest snapshot before restoring.")
    )]
    StaleSnapshot { snapshot: u64, live: u64 },

    /// Serialization failure while snapshotting or restoring.
    #[error(transparent)]
    #[diagnostic(code(stageloom::state::serde_json))]
    Serde(#[from] serde_json::Error),
}
