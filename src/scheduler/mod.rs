//! Concurrent stage dispatch: bounded fan-out, response caching, and the
//! join barrier that keeps results deterministic.

mod cache;
#[allow(clippy::module_inception)]
mod scheduler;

pub use cache::{CacheStats, Fingerprint, ResponseCache};
pub use scheduler::{RoundResult, Scheduler, StageExecutor, StageOutcome};
