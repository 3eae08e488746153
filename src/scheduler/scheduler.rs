//! Concurrent dispatch of independent stages.
//!
//! Each round, the orchestrator hands the scheduler every dispatchable stage
//! together with its execution context. The scheduler consults the response
//! cache, spawns the misses bounded by the concurrency limit, and joins them
//! all before returning. The join is a barrier with failure isolation: one
//! stage failing or panicking never cancels its siblings, and every outcome
//! is reported in dispatch order so results are deterministic to consume.

use async_trait::async_trait;
use rustc_hash::FxHashMap;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{instrument, warn};

use super::cache::{CacheStats, Fingerprint, ResponseCache};
use crate::agent::StageContext;
use crate::artifact::ArtifactSet;
use crate::orchestrator::cancel::CancelToken;
use crate::orchestrator::errors::{PipelineError, StageError};
use crate::pipeline::CacheConfig;
use crate::stage::StageId;

/// Result of executing one stage to settlement.
#[derive(Debug)]
pub enum StageOutcome {
    Completed {
        artifacts: ArtifactSet,
        /// Agent attempts spent; 0 for a cache hit.
        attempts: u32,
        from_cache: bool,
    },
    Failed {
        error: StageError,
    },
    /// Cancellation was observed before or during execution; the stage is
    /// unsettled and will re-run on resume.
    Cancelled,
}

impl StageOutcome {
    #[must_use]
    pub fn is_completed(&self) -> bool {
        matches!(self, StageOutcome::Completed { .. })
    }
}

/// Executes one stage to settlement: agent call, timeout, retries.
///
/// The orchestrator provides the implementation; the scheduler stays
/// agnostic of retry policy and agent wiring.
#[async_trait]
pub trait StageExecutor: Send + Sync {
    async fn run_stage(&self, ctx: StageContext) -> StageOutcome;
}

/// Result of one dispatch round.
#[derive(Debug)]
pub struct RoundResult {
    /// Stages that were dispatched (or served from cache), dispatch order.
    pub ran_stages: Vec<StageId>,
    /// Stages skipped because cancellation was observed before dispatch.
    pub skipped_stages: Vec<StageId>,
    /// One outcome per ran stage, in dispatch order.
    pub outcomes: Vec<(StageId, StageOutcome)>,
}

/// Bounded-concurrency stage dispatcher with a response cache.
pub struct Scheduler {
    concurrency_limit: usize,
    cache: Arc<ResponseCache>,
}

impl Scheduler {
    /// Scheduler without caching.
    #[must_use]
    pub fn new(concurrency_limit: usize) -> Self {
        Self {
            concurrency_limit: concurrency_limit.max(1),
            cache: Arc::new(ResponseCache::disabled()),
        }
    }

    #[must_use]
    pub fn with_cache(concurrency_limit: usize, config: &CacheConfig) -> Self {
        Self {
            concurrency_limit: concurrency_limit.max(1),
            cache: Arc::new(ResponseCache::new(config)),
        }
    }

    #[must_use]
    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// Fingerprints of the currently cached responses, most recent first.
    #[must_use]
    pub fn cache_fingerprints(&self) -> Vec<Fingerprint> {
        self.cache.fingerprints()
    }

    /// Dispatch one round of stages and join them all.
    ///
    /// `batch` order is the dispatch order; outcomes come back in the same
    /// order regardless of completion order. Panicked stage tasks are
    /// reported as an error only after every sibling has been joined.
    #[instrument(skip_all, fields(stages = batch.len()))]
    pub async fn run_round(
        &self,
        batch: Vec<(StageId, StageContext)>,
        executor: Arc<dyn StageExecutor>,
        cancel: &CancelToken,
    ) -> Result<RoundResult, PipelineError> {
        let mut ran_stages = Vec::new();
        let mut skipped_stages = Vec::new();
        let mut settled: FxHashMap<usize, (StageId, StageOutcome)> = FxHashMap::default();

        let semaphore = Arc::new(Semaphore::new(self.concurrency_limit));
        let mut join_set: JoinSet<(usize, StageId, StageOutcome)> = JoinSet::new();
        let mut dispatch_index = 0usize;

        for (stage, ctx) in batch {
            if cancel.is_cancelled() {
                skipped_stages.push(stage);
                continue;
            }

            let fingerprint = Fingerprint::of(&ctx);
            if let Some(artifacts) = self.cache.get(&fingerprint) {
                ran_stages.push(stage.clone());
                settled.insert(
                    dispatch_index,
                    (
                        stage,
                        StageOutcome::Completed {
                            artifacts,
                            attempts: 0,
                            from_cache: true,
                        },
                    ),
                );
                dispatch_index += 1;
                continue;
            }

            ran_stages.push(stage.clone());
            let index = dispatch_index;
            dispatch_index += 1;

            let permits = Arc::clone(&semaphore);
            let executor = Arc::clone(&executor);
            let cache = Arc::clone(&self.cache);
            join_set.spawn(async move {
                // Closed semaphore is unreachable; treat it as cancellation.
                let Ok(_permit) = permits.acquire_owned().await else {
                    return (index, stage, StageOutcome::Cancelled);
                };
                let outcome = executor.run_stage(ctx).await;
                if let StageOutcome::Completed {
                    artifacts,
                    from_cache: false,
                    ..
                } = &outcome
                {
                    cache.put(fingerprint, artifacts.clone());
                }
                (index, stage, outcome)
            });
        }

        // Join barrier: drain every task before surfacing any panic, so one
        // bad stage cannot strand its siblings mid-flight.
        let mut join_failure: Option<tokio::task::JoinError> = None;
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((index, stage, outcome)) => {
                    settled.insert(index, (stage, outcome));
                }
                Err(error) => {
                    warn!(%error, "stage task join failure");
                    join_failure.get_or_insert(error);
                }
            }
        }
        if let Some(error) = join_failure {
            return Err(PipelineError::Join(error));
        }

        let mut outcomes: Vec<(StageId, StageOutcome)> = Vec::with_capacity(settled.len());
        for index in 0..dispatch_index {
            if let Some(entry) = settled.remove(&index) {
                outcomes.push(entry);
            }
        }

        Ok(RoundResult {
            ran_stages,
            skipped_stages,
            outcomes,
        })
    }
}
