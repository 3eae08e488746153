//! Workflow orchestration: the drive loop, retry/backoff, cancellation,
//! progress reporting, and the failure taxonomy.

pub mod cancel;
pub mod engine;
pub mod errors;
pub mod progress;
pub mod retry;

pub use cancel::{CancelHandle, CancelToken};
pub use engine::{
    Orchestrator, PipelineStatus, RunReport, REVISION_REQUEST_ARTIFACT,
};
pub use errors::{PipelineError, StageError};
pub use progress::{
    ChannelSink, MemorySink, ProgressBus, ProgressEvent, ProgressKind, ProgressSink,
    ProgressTracker, TracingSink,
};
pub use retry::RetryPolicy;
