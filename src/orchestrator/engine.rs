//! The workflow orchestrator: drives a pipeline run to a terminal state.
//!
//! One orchestrator owns one run session. Each iteration of the drive loop
//! computes the dispatchable frontier, hands it to the scheduler, applies the
//! outcomes to the single-writer state store, saves a checkpoint, and repeats
//! until every stage has settled or the run fails, pauses, or exhausts its
//! revision budget.
//!
//! Revisions are artifact-driven: a review-type stage requests one by
//! including an artifact named [`REVISION_REQUEST_ARTIFACT`] whose payload
//! carries `target` and `reason` fields. The request is honored only along a
//! declared revision edge.

use rustc_hash::{FxHashMap, FxHashSet};
use serde_json::json;
use std::sync::Arc;
use std::time::Instant;
use tokio::time::timeout;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::agent::{AgentError, StageContext};
use crate::bus::{types as message_types, Message, MessageBus};
use crate::checkpoint::{Checkpoint, Checkpointer, InMemoryCheckpointer};
use crate::pipeline::Pipeline;
use crate::scheduler::{CacheStats, RoundResult, Scheduler, StageExecutor, StageOutcome};
use crate::stage::{RevisionPolicy, StageDef, StageId};
use crate::state::{Feedback, ProjectState, StateStore};

use super::cancel::{CancelHandle, CancelToken};
use super::errors::{PipelineError, StageError};
use super::progress::{ProgressBus, ProgressKind, ProgressTracker};

/// Artifact name a review stage uses to request a revision.
///
/// Payload shape: `{"target": "<stage name>", "reason": "<text>"}`.
pub const REVISION_REQUEST_ARTIFACT: &str = "revision-request";

/// How a run ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PipelineStatus {
    /// Every stage settled successfully.
    Completed,
    /// At least one stage failed permanently, or the revision budget ran out.
    Failed,
    /// Cancellation was observed; the run is resumable from its last
    /// checkpoint.
    Paused,
}

impl PipelineStatus {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineStatus::Completed => "completed",
            PipelineStatus::Failed => "failed",
            PipelineStatus::Paused => "paused",
        }
    }
}

/// Final report of one drive, whatever way it ended.
#[derive(Debug)]
pub struct RunReport {
    pub session_id: String,
    pub status: PipelineStatus,
    pub state: ProjectState,
    /// Settled stages in no particular order.
    pub settled: Vec<StageId>,
    /// Permanent stage failures, dispatch order.
    pub failures: Vec<(StageId, StageError)>,
    pub cache: CacheStats,
}

/// Drives one pipeline run session.
pub struct Orchestrator {
    pipeline: Arc<Pipeline>,
    scheduler: Scheduler,
    checkpointer: Arc<dyn Checkpointer>,
    bus: Arc<MessageBus>,
    progress: Arc<ProgressBus>,
    cancel: CancelToken,
    session_id: String,
    /// Upper bound on revision transitions per run.
    max_revisions: u32,
}

impl Orchestrator {
    #[must_use]
    pub fn new(pipeline: Pipeline) -> Self {
        let scheduler = match &pipeline.cache {
            Some(config) => Scheduler::with_cache(pipeline.concurrency_limit, config),
            None => Scheduler::new(pipeline.concurrency_limit),
        };
        Self {
            pipeline: Arc::new(pipeline),
            scheduler,
            checkpointer: Arc::new(InMemoryCheckpointer::new()),
            bus: Arc::new(MessageBus::default()),
            progress: Arc::new(ProgressBus::default()),
            cancel: CancelToken::new(),
            session_id: Uuid::new_v4().to_string(),
            max_revisions: 5,
        }
    }

    #[must_use]
    pub fn with_checkpointer(mut self, checkpointer: Arc<dyn Checkpointer>) -> Self {
        self.checkpointer = checkpointer;
        self
    }

    #[must_use]
    pub fn with_message_bus(mut self, bus: Arc<MessageBus>) -> Self {
        self.bus = bus;
        self
    }

    #[must_use]
    pub fn with_progress_bus(mut self, progress: Arc<ProgressBus>) -> Self {
        self.progress = progress;
        self
    }

    /// Pin the session id; used to resume a run saved by an earlier
    /// orchestrator against the same checkpointer.
    #[must_use]
    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = session_id.into();
        self
    }

    #[must_use]
    pub fn with_max_revisions(mut self, max_revisions: u32) -> Self {
        self.max_revisions = max_revisions;
        self
    }

    #[must_use]
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    #[must_use]
    pub fn message_bus(&self) -> Arc<MessageBus> {
        Arc::clone(&self.bus)
    }

    /// Handle for cancelling the run from another task or thread.
    #[must_use]
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.handle()
    }

    /// Run a fresh project through the pipeline.
    #[instrument(skip(self, description), fields(session = %self.session_id))]
    pub async fn run(
        &self,
        name: &str,
        description: &str,
    ) -> Result<RunReport, PipelineError> {
        let initial = self
            .pipeline
            .graph
            .dispatchable(&FxHashSet::default())
            .into_iter()
            .next()
            .unwrap_or_else(|| self.pipeline.graph.final_stage().clone());
        let store = StateStore::new(name, description, initial)
            .strict_tasks(self.pipeline.strict_tasks);
        self.drive(store, FxHashSet::default()).await
    }

    /// Resume the session from its latest checkpoint.
    #[instrument(skip(self), fields(session = %self.session_id))]
    pub async fn resume(&self) -> Result<RunReport, PipelineError> {
        let checkpoint = self
            .checkpointer
            .load_latest(&self.session_id)
            .await?
            .ok_or_else(|| PipelineError::NoCheckpoint {
                session_id: self.session_id.clone(),
            })?;
        info!(version = checkpoint.version(), "resuming from checkpoint");
        let store = StateStore::from_state(checkpoint.state)
            .strict_tasks(self.pipeline.strict_tasks);
        let settled: FxHashSet<StageId> = checkpoint.settled.into_iter().collect();
        self.drive(store, settled).await
    }

    /// Resume the session, first forcing a revision back to `target`.
    ///
    /// This is the manual counterpart of an artifact-driven revision: the
    /// current stage must have a declared revision edge to `target`.
    pub async fn resume_with_revision(
        &self,
        target: StageId,
        reason: impl Into<String>,
    ) -> Result<RunReport, PipelineError> {
        if !self.pipeline.graph.contains(&target) {
            return Err(PipelineError::UnknownStage { stage: target });
        }
        let checkpoint = self
            .checkpointer
            .load_latest(&self.session_id)
            .await?
            .ok_or_else(|| PipelineError::NoCheckpoint {
                session_id: self.session_id.clone(),
            })?;
        let mut store = StateStore::from_state(checkpoint.state)
            .strict_tasks(self.pipeline.strict_tasks);
        let mut settled: FxHashSet<StageId> = checkpoint.settled.into_iter().collect();
        let from = store.current_stage().clone();
        let tracker = self.tracker();
        tracker.set_settled(settled.len());
        self.apply_revision(&mut store, &mut settled, &from, &target, &reason.into(), &tracker)?;
        self.drive(store, settled).await
    }

    fn tracker(&self) -> ProgressTracker {
        ProgressTracker::new(self.progress.sender(), self.pipeline.graph.len())
    }

    async fn drive(
        &self,
        mut store: StateStore,
        mut settled: FxHashSet<StageId>,
    ) -> Result<RunReport, PipelineError> {
        self.progress.listen();
        let graph = &self.pipeline.graph;
        let tracker = self.tracker();
        tracker.set_settled(settled.len());
        let executor: Arc<dyn StageExecutor> = Arc::new(PipelineExecutor {
            pipeline: Arc::clone(&self.pipeline),
            cancel: self.cancel.clone(),
            progress: tracker.clone(),
        });

        // Resuming a finished run is a no-op report, not an error.
        if store.current_stage().is_terminal() {
            let status = match store.current_stage() {
                StageId::Completed => PipelineStatus::Completed,
                _ => PipelineStatus::Failed,
            };
            return Ok(self.report(status, store, settled, Vec::new()));
        }

        loop {
            if self.cancel.is_cancelled() {
                return self.pause(store, settled, &tracker).await;
            }

            let frontier = graph.dispatchable(&settled);
            if frontier.is_empty() {
                // A target-only revision can leave the position on an early
                // stage even though everything has settled; move to the
                // final stage before closing out.
                if store.current_stage() != graph.final_stage() {
                    store.advance_stage(graph, graph.final_stage().clone(), None)?;
                }
                store.advance_stage(graph, StageId::Completed, None)?;
                self.save_checkpoint(&store, &settled, &tracker).await;
                self.finish(PipelineStatus::Completed, &tracker);
                return Ok(self.report(PipelineStatus::Completed, store, settled, Vec::new()));
            }
            debug!(frontier = frontier.len(), "dispatch round");

            let batch: Vec<(StageId, StageContext)> = frontier
                .iter()
                .filter_map(|stage| graph.def(stage))
                .map(|def| (def.id.clone(), self.context_for(&store, def)))
                .collect();

            let round = self
                .scheduler
                .run_round(batch, Arc::clone(&executor), &self.cancel)
                .await?;

            let applied = self.apply_round(&mut store, &mut settled, round, &tracker)?;
            tracker.set_settled(settled.len());

            if !applied.failures.is_empty() {
                let (stage, error) = &applied.failures[0];
                store.advance_stage(
                    graph,
                    StageId::Failed,
                    Some(format!("stage {stage} failed: {error}")),
                )?;
                self.save_checkpoint(&store, &settled, &tracker).await;
                self.finish(PipelineStatus::Failed, &tracker);
                return Ok(self.report(
                    PipelineStatus::Failed,
                    store,
                    settled,
                    applied.failures,
                ));
            }

            if let Some((from, target, reason)) = applied.revision {
                let used = self.revisions_used(&store);
                if used >= self.max_revisions {
                    warn!(used, "revision budget exhausted");
                    store.advance_stage(
                        graph,
                        StageId::Failed,
                        Some(format!("revision limit ({}) exceeded", self.max_revisions)),
                    )?;
                    self.save_checkpoint(&store, &settled, &tracker).await;
                    self.finish(PipelineStatus::Failed, &tracker);
                    return Ok(self.report(PipelineStatus::Failed, store, settled, Vec::new()));
                }
                self.apply_revision(&mut store, &mut settled, &from, &target, &reason, &tracker)?;
                tracker.set_settled(settled.len());
            }

            self.save_checkpoint(&store, &settled, &tracker).await;

            if applied.cancelled || self.cancel.is_cancelled() {
                return self.pause(store, settled, &tracker).await;
            }
        }
    }

    /// Apply a round's outcomes to the store, one at a time. Completions are
    /// applied before failures are acted on, so siblings of a failed stage
    /// keep their results.
    fn apply_round(
        &self,
        store: &mut StateStore,
        settled: &mut FxHashSet<StageId>,
        round: RoundResult,
        tracker: &ProgressTracker,
    ) -> Result<AppliedRound, PipelineError> {
        let graph = &self.pipeline.graph;
        let mut applied = AppliedRound {
            cancelled: !round.skipped_stages.is_empty(),
            ..AppliedRound::default()
        };

        for (stage, outcome) in round.outcomes {
            // Stage messages are published under the producing agent's role,
            // so sender-topic subscribers can follow one collaborator.
            let sender = graph
                .def(&stage)
                .map(|def| def.agent_role.clone())
                .unwrap_or_else(|| "orchestrator".to_string());
            match outcome {
                StageOutcome::Completed {
                    artifacts,
                    attempts,
                    from_cache,
                } => {
                    if store.current_stage() != &stage {
                        store.advance_stage(graph, stage.clone(), None)?;
                    }
                    settled.insert(stage.clone());

                    let request = artifacts
                        .get(REVISION_REQUEST_ARTIFACT)
                        .map(|a| a.payload.clone());
                    let names: Vec<String> =
                        artifacts.names().iter().map(|s| s.to_string()).collect();
                    store.record_artifacts(&stage, artifacts);

                    self.bus.publish(Message::new(
                        message_types::STAGE_COMPLETE,
                        sender,
                        json!({
                            "stage": stage.encode(),
                            "attempts": attempts,
                            "from_cache": from_cache,
                            "artifacts": names,
                        }),
                    ));
                    tracker.set_settled(settled.len());
                    tracker.send(ProgressKind::StageCompleted {
                        stage: stage.clone(),
                        attempts,
                        from_cache,
                    });

                    if let Some(payload) = request {
                        match payload.get("target").and_then(|t| t.as_str()) {
                            Some(target) => {
                                let reason = payload
                                    .get("reason")
                                    .and_then(|r| r.as_str())
                                    .unwrap_or("")
                                    .to_string();
                                if applied.revision.is_none() {
                                    applied.revision =
                                        Some((stage.clone(), StageId::named(target), reason));
                                } else {
                                    warn!(stage = %stage, "ignoring second revision request in round");
                                }
                            }
                            None => {
                                warn!(stage = %stage, "revision request without target; ignored");
                            }
                        }
                    }
                }
                StageOutcome::Failed { error } => {
                    self.bus.publish(Message::new(
                        message_types::STAGE_FAILED,
                        sender,
                        json!({"stage": stage.encode(), "reason": error.to_string()}),
                    ));
                    tracker.send(ProgressKind::StageFailed {
                        stage: stage.clone(),
                        attempts: match &error {
                            StageError::Agent { attempts, .. } => *attempts,
                            _ => 1,
                        },
                        reason: error.to_string(),
                    });
                    applied.failures.push((stage, error));
                }
                StageOutcome::Cancelled => {
                    applied.cancelled = true;
                }
            }
        }
        Ok(applied)
    }

    /// Route the run backward along a revision edge and un-settle work per
    /// the configured policy.
    fn apply_revision(
        &self,
        store: &mut StateStore,
        settled: &mut FxHashSet<StageId>,
        from: &StageId,
        target: &StageId,
        reason: &str,
        tracker: &ProgressTracker,
    ) -> Result<(), PipelineError> {
        let graph = &self.pipeline.graph;
        if !graph.is_revision_edge(from, target) {
            return Err(PipelineError::NoRevisionEdge {
                from: from.clone(),
                to: target.clone(),
            });
        }

        let unsettle = match self.pipeline.revision_policy {
            RevisionPolicy::TargetOnly => vec![target.clone()],
            RevisionPolicy::ReplayIntermediates => graph.downstream_closure(target),
        };
        for stage in &unsettle {
            settled.remove(stage);
        }
        store.clear_artifacts(&unsettle);
        if !reason.is_empty() {
            store.record_feedback(Feedback::new(from.clone(), target.clone(), reason))?;
        }
        store.advance_stage(graph, target.clone(), Some(reason.to_string()))?;

        self.bus.publish(Message::new(
            message_types::REVISION_REQUESTED,
            "orchestrator",
            json!({
                "from": from.encode(),
                "to": target.encode(),
                "reason": reason,
                "replayed": unsettle.iter().map(StageId::encode).collect::<Vec<_>>(),
            }),
        ));
        tracker.set_settled(settled.len());
        tracker.send(ProgressKind::RevisionRequested {
            from: from.clone(),
            to: target.clone(),
            reason: reason.to_string(),
        });
        info!(from = %from, to = %target, "revision applied");
        Ok(())
    }

    fn context_for(&self, store: &StateStore, def: &StageDef) -> StageContext {
        let mut upstream = FxHashMap::default();
        for dep in &def.depends_on {
            if let Some(set) = store.state().artifacts_for(dep) {
                upstream.insert(dep.encode(), set.clone());
            }
        }
        let feedback: Vec<String> = store
            .state()
            .feedback
            .iter()
            .filter(|f| f.about_stage == def.id)
            .map(|f| f.content.clone())
            .collect();
        StageContext {
            stage: def.id.clone(),
            agent_role: def.agent_role.clone(),
            attempt: 1,
            project: store.state().header(),
            upstream,
            feedback,
            model_config: self.pipeline.model_config.clone(),
        }
    }

    /// Checkpoint failures degrade to warnings; the run goes on without
    /// durability rather than aborting.
    async fn save_checkpoint(
        &self,
        store: &StateStore,
        settled: &FxHashSet<StageId>,
        tracker: &ProgressTracker,
    ) {
        let fingerprints = self
            .scheduler
            .cache_fingerprints()
            .iter()
            .map(|f| f.as_hex().to_string())
            .collect();
        let checkpoint = Checkpoint::new(
            self.session_id.clone(),
            store.state().clone(),
            settled.iter().cloned().collect(),
        )
        .with_fingerprints(fingerprints);
        let version = checkpoint.version();
        match self.checkpointer.save(checkpoint).await {
            Ok(()) => tracker.send(ProgressKind::CheckpointSaved { version }),
            Err(error) => {
                warn!(%error, version, "checkpoint save failed; continuing without durability");
            }
        }
    }

    async fn pause(
        &self,
        store: StateStore,
        settled: FxHashSet<StageId>,
        tracker: &ProgressTracker,
    ) -> Result<RunReport, PipelineError> {
        self.save_checkpoint(&store, &settled, tracker).await;
        self.finish(PipelineStatus::Paused, tracker);
        Ok(self.report(PipelineStatus::Paused, store, settled, Vec::new()))
    }

    fn finish(&self, status: PipelineStatus, tracker: &ProgressTracker) {
        self.bus.publish(Message::new(
            message_types::PIPELINE_FINISHED,
            "orchestrator",
            json!({"status": status.as_str(), "session": self.session_id}),
        ));
        tracker.send(ProgressKind::PipelineFinished {
            status: status.as_str().to_string(),
        });
    }

    fn report(
        &self,
        status: PipelineStatus,
        store: StateStore,
        settled: FxHashSet<StageId>,
        failures: Vec<(StageId, StageError)>,
    ) -> RunReport {
        RunReport {
            session_id: self.session_id.clone(),
            status,
            state: store.state().clone(),
            settled: settled.into_iter().collect(),
            failures,
            cache: self.scheduler.cache_stats(),
        }
    }

    fn revisions_used(&self, store: &StateStore) -> u32 {
        let graph = &self.pipeline.graph;
        store
            .state()
            .history
            .iter()
            .filter(|t| graph.is_revision_edge(&t.from, &t.to))
            .count() as u32
    }
}

#[derive(Default)]
struct AppliedRound {
    failures: Vec<(StageId, StageError)>,
    revision: Option<(StageId, StageId, String)>,
    cancelled: bool,
}

/// Per-stage execution: timeout, retry with backoff, cancellation checks.
struct PipelineExecutor {
    pipeline: Arc<Pipeline>,
    cancel: CancelToken,
    progress: ProgressTracker,
}

#[async_trait::async_trait]
impl StageExecutor for PipelineExecutor {
    async fn run_stage(&self, ctx: StageContext) -> StageOutcome {
        let Some(def) = self.pipeline.graph.def(&ctx.stage) else {
            return StageOutcome::Failed {
                error: StageError::NoAgent { stage: ctx.stage },
            };
        };
        let Some(agent) = self.pipeline.agent_for(&ctx.stage) else {
            return StageOutcome::Failed {
                error: StageError::NoAgent {
                    stage: ctx.stage.clone(),
                },
            };
        };
        let policy = &def.policy;
        let mut attempt: u32 = 1;

        loop {
            if self.cancel.is_cancelled() {
                return StageOutcome::Cancelled;
            }
            self.progress.send(ProgressKind::StageStarted {
                stage: ctx.stage.clone(),
                attempt,
            });

            let mut call_ctx = ctx.clone();
            call_ctx.attempt = attempt;
            let started = Instant::now();
            let result = match timeout(policy.timeout, agent.execute(call_ctx)).await {
                Ok(result) => result,
                Err(_) => Err(AgentError::Timeout {
                    elapsed_ms: started.elapsed().as_millis() as u64,
                }),
            };

            match result {
                Ok(artifacts) => {
                    let missing = artifacts.missing_from(&def.expected_artifacts);
                    if missing.is_empty() {
                        return StageOutcome::Completed {
                            artifacts,
                            attempts: attempt,
                            from_cache: false,
                        };
                    }
                    if attempt >= policy.retry.max_attempts() {
                        return StageOutcome::Failed {
                            error: StageError::MissingArtifacts {
                                stage: ctx.stage.clone(),
                                missing,
                            },
                        };
                    }
                    let delay = policy.retry.jittered_delay(attempt);
                    self.progress.send(ProgressKind::StageRetrying {
                        stage: ctx.stage.clone(),
                        attempt,
                        delay_ms: delay.as_millis() as u64,
                        reason: format!("missing artifacts: {}", missing.join(", ")),
                    });
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(AgentError::Cancelled) => return StageOutcome::Cancelled,
                Err(error) if error.is_transient() && attempt < policy.retry.max_attempts() => {
                    let delay = policy.retry.jittered_delay(attempt);
                    self.progress.send(ProgressKind::StageRetrying {
                        stage: ctx.stage.clone(),
                        attempt,
                        delay_ms: delay.as_millis() as u64,
                        reason: error.to_string(),
                    });
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(error) => {
                    return StageOutcome::Failed {
                        error: StageError::Agent {
                            attempts: attempt,
                            source: error,
                        },
                    };
                }
            }
        }
    }
}
