mod common;

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use stageloom::agent::{Agent, AgentError, StageContext};
use stageloom::artifact::{Artifact, ArtifactSet};
use stageloom::bus::{topics, types as message_types, MessageFilter};
use stageloom::checkpoint::{Checkpointer, InMemoryCheckpointer};
use stageloom::orchestrator::{
    MemorySink, Orchestrator, PipelineError, PipelineStatus, ProgressBus, ProgressKind,
    REVISION_REQUEST_ARTIFACT,
};
use stageloom::pipeline::Pipeline;
use stageloom::stage::{StageDef, StageId};
use stageloom::utils::testing::{BrokenAgent, FlakyAgent, RecordingAgent, ScriptedAgent, SlowAgent};

fn diamond_pipeline() -> Pipeline {
    let mut builder = Pipeline::builder();
    for def in common::diamond_defs() {
        let role = def.agent_role.clone();
        let artifact = match role.as_str() {
            "requirements-gathering" => "requirements",
            "architect" => "system-design",
            "ui-design" => "wireframes",
            "implementation" => "build",
            _ => "summary",
        };
        builder = builder
            .add_stage(def)
            .register_agent(role, common::scripted(artifact));
    }
    builder.compile().expect("diamond pipeline")
}

#[tokio::test]
async fn diamond_run_completes_with_all_artifacts() {
    stageloom::telemetry::init();
    let orchestrator = Orchestrator::new(diamond_pipeline());
    let bus = orchestrator.message_bus();
    let completions = Arc::new(AtomicUsize::new(0));
    let c = Arc::clone(&completions);
    bus.subscribe(topics::message_type(message_types::STAGE_COMPLETE), move |_| {
        c.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });

    let report = orchestrator.run("site", "marketing site").await.unwrap();

    assert_eq!(report.status, PipelineStatus::Completed);
    assert_eq!(report.state.current_stage, StageId::Completed);
    assert_eq!(report.settled.len(), 5);
    assert!(report.failures.is_empty());
    assert!(report.state.version > 0);
    for stage in [
        StageId::requirements(),
        StageId::architecture(),
        StageId::ui_design(),
        StageId::implementation(),
        StageId::completion(),
    ] {
        assert!(
            report.state.artifacts_for(&stage).is_some(),
            "missing artifacts for {stage}"
        );
    }
    assert_eq!(completions.load(Ordering::SeqCst), 5);
    assert_eq!(
        bus.history(&MessageFilter::new().kind(message_types::PIPELINE_FINISHED))
            .len(),
        1
    );
}

#[tokio::test]
async fn join_stage_sees_both_upstream_artifact_sets() {
    let recorder = RecordingAgent::producing("build", json!({}));
    let mut builder = Pipeline::builder();
    for def in common::diamond_defs() {
        let role = def.agent_role.clone();
        builder = builder.add_stage(def);
        builder = if role == "implementation" {
            builder.register_agent(role, recorder.clone())
        } else if role == "requirements-gathering" {
            builder.register_agent(role, common::scripted("requirements"))
        } else {
            builder.register_agent(role, common::scripted("out"))
        };
    }
    let orchestrator = Orchestrator::new(builder.compile().unwrap());

    orchestrator.run("p", "d").await.unwrap();

    let contexts = recorder.contexts();
    assert_eq!(contexts.len(), 1);
    let upstream = &contexts[0].upstream;
    assert!(upstream.contains_key(&StageId::architecture().encode()));
    assert!(upstream.contains_key(&StageId::ui_design().encode()));
    // Only direct dependencies are included.
    assert!(!upstream.contains_key(&StageId::requirements().encode()));
}

#[tokio::test]
async fn transient_failures_are_retried_to_success() {
    let flaky = Arc::new(FlakyAgent::failing_times(2, "requirements"));
    let pipeline = Pipeline::builder()
        .add_stage(
            StageDef::new("requirements-gathering")
                .with_policy(common::fast_policy(3))
                .expects_artifact("requirements"),
        )
        .register_agent("requirements-gathering", flaky.clone())
        .compile()
        .unwrap();

    let progress = Arc::new(ProgressBus::with_sink(MemorySink::new()));
    let orchestrator = Orchestrator::new(pipeline).with_progress_bus(progress);
    let report = orchestrator.run("p", "d").await.unwrap();

    assert_eq!(report.status, PipelineStatus::Completed);
    assert_eq!(flaky.calls(), 3);
}

#[tokio::test]
async fn exhausted_retries_fail_the_stage() {
    let flaky = Arc::new(FlakyAgent::failing_times(10, "requirements"));
    let pipeline = Pipeline::builder()
        .add_stage(StageDef::new("requirements-gathering").with_policy(common::fast_policy(2)))
        .register_agent("requirements-gathering", flaky.clone())
        .compile()
        .unwrap();

    let report = Orchestrator::new(pipeline).run("p", "d").await.unwrap();

    assert_eq!(report.status, PipelineStatus::Failed);
    assert_eq!(flaky.calls(), 3);
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.state.current_stage, StageId::Failed);
}

#[tokio::test]
async fn failed_stage_does_not_discard_sibling_results() {
    let mut builder = Pipeline::builder();
    for def in common::diamond_defs() {
        let role = def.agent_role.clone();
        builder = builder.add_stage(def);
        builder = if role == "architect" {
            builder.register_agent(role, Arc::new(BrokenAgent))
        } else if role == "requirements-gathering" {
            builder.register_agent(role, common::scripted("requirements"))
        } else {
            builder.register_agent(role, common::scripted("out"))
        };
    }
    let report = Orchestrator::new(builder.compile().unwrap())
        .run("p", "d")
        .await
        .unwrap();

    assert_eq!(report.status, PipelineStatus::Failed);
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].0, StageId::architecture());
    // The concurrent sibling settled and kept its artifacts.
    assert!(report.state.artifacts_for(&StageId::ui_design()).is_some());
    assert!(report.settled.contains(&StageId::ui_design()));
    assert_eq!(report.state.current_stage, StageId::Failed);
}

#[tokio::test]
async fn missing_expected_artifact_fails_after_retries() {
    let agent = common::scripted("requirements");
    let pipeline = Pipeline::builder()
        .add_stage(
            StageDef::new("requirements-gathering")
                .with_policy(common::fast_policy(2))
                .expects_artifact("requirements")
                .expects_artifact("stakeholder-list"),
        )
        .register_agent("requirements-gathering", agent.clone())
        .compile()
        .unwrap();

    let report = Orchestrator::new(pipeline).run("p", "d").await.unwrap();
    assert_eq!(report.status, PipelineStatus::Failed);
    // The wrong shape was retried like any other failure before turning
    // permanent.
    assert_eq!(agent.calls(), 3);
    let reason = report.failures[0].1.to_string();
    assert!(reason.contains("stakeholder-list"), "got: {reason}");
}

/// Misnames its artifact on the first call, then returns the right shape.
struct WrongShapeOnce {
    calls: AtomicU32,
}

#[async_trait]
impl Agent for WrongShapeOnce {
    async fn execute(&self, _ctx: StageContext) -> Result<ArtifactSet, AgentError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        let name = if n == 0 { "draft" } else { "requirements" };
        Ok(ArtifactSet::new().with(Artifact::new(name, json!([]))))
    }
}

#[tokio::test]
async fn wrong_shaped_output_is_retried_to_success() {
    let agent = Arc::new(WrongShapeOnce {
        calls: AtomicU32::new(0),
    });
    let pipeline = Pipeline::builder()
        .add_stage(
            StageDef::new("requirements-gathering")
                .with_policy(common::fast_policy(3))
                .expects_artifact("requirements"),
        )
        .register_agent("requirements-gathering", agent.clone())
        .compile()
        .unwrap();

    let report = Orchestrator::new(pipeline).run("p", "d").await.unwrap();

    assert_eq!(report.status, PipelineStatus::Completed);
    assert_eq!(agent.calls.load(Ordering::SeqCst), 2);
    assert!(report
        .state
        .artifacts_for(&StageId::requirements())
        .and_then(|set| set.get("requirements"))
        .is_some());
}

/// Requests one revision of implementation, then approves.
struct ReviewerAgent {
    calls: AtomicU32,
}

#[async_trait]
impl Agent for ReviewerAgent {
    async fn execute(&self, _ctx: StageContext) -> Result<ArtifactSet, AgentError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        let mut set =
            ArtifactSet::new().with(Artifact::new("review", json!({"approved": n > 0})));
        if n == 0 {
            set.insert(Artifact::new(
                REVISION_REQUEST_ARTIFACT,
                json!({"target": "implementation", "reason": "tests are missing"}),
            ));
        }
        Ok(set)
    }
}

#[tokio::test]
async fn review_revision_replays_downstream_and_converges() {
    let implementer = Arc::new(ScriptedAgent::producing("build", json!({})));
    let reviewer = Arc::new(ReviewerAgent {
        calls: AtomicU32::new(0),
    });
    let pipeline = Pipeline::builder()
        .add_stage(StageDef::new("implementation"))
        .add_stage(StageDef::new("quality-review").depends_on("implementation"))
        .add_stage(StageDef::new("completion").depends_on("quality-review"))
        .add_revision_edge(StageId::quality_review(), StageId::implementation())
        .register_agent("implementation", implementer.clone())
        .register_agent("quality-review", reviewer.clone())
        .register_agent("completion", common::scripted("summary"))
        .without_cache()
        .compile()
        .unwrap();

    let orchestrator = Orchestrator::new(pipeline);
    let bus = orchestrator.message_bus();
    let report = orchestrator.run("p", "d").await.unwrap();

    assert_eq!(report.status, PipelineStatus::Completed);
    // Implementation ran, was revised, ran again; reviewer saw both.
    assert_eq!(implementer.calls(), 2);
    assert_eq!(reviewer.calls.load(Ordering::SeqCst), 2);

    // The revision left a trail: feedback, a reasoned transition, a message.
    assert_eq!(report.state.feedback.len(), 1);
    assert_eq!(report.state.feedback[0].content, "tests are missing");
    assert!(report
        .state
        .history
        .iter()
        .any(|t| t.reason.as_deref() == Some("tests are missing")));
    assert_eq!(
        bus.history(&MessageFilter::new().kind(message_types::REVISION_REQUESTED))
            .len(),
        1
    );
}

#[tokio::test]
async fn undeclared_revision_edge_is_an_error() {
    let reviewer = Arc::new(ReviewerAgent {
        calls: AtomicU32::new(0),
    });
    let pipeline = Pipeline::builder()
        .add_stage(StageDef::new("implementation"))
        .add_stage(StageDef::new("quality-review").depends_on("implementation"))
        .register_agent("implementation", common::scripted("build"))
        .register_agent("quality-review", reviewer)
        .without_cache()
        .compile()
        .unwrap();

    let result = Orchestrator::new(pipeline).run("p", "d").await;
    assert!(matches!(result, Err(PipelineError::NoRevisionEdge { .. })));
}

#[tokio::test]
async fn cancellation_pauses_then_resume_completes() {
    let checkpointer: Arc<dyn Checkpointer> = Arc::new(InMemoryCheckpointer::new());

    let build = |slow_ms: u64| {
        Pipeline::builder()
            .add_stage(StageDef::new("a"))
            .add_stage(StageDef::new("b").depends_on("a"))
            .add_stage(StageDef::new("c").depends_on("b"))
            .register_agent("a", common::scripted("a-out"))
            .register_agent(
                "b",
                Arc::new(SlowAgent::new(Duration::from_millis(slow_ms), "b-out")),
            )
            .register_agent("c", common::scripted("c-out"))
            .without_cache()
            .compile()
            .unwrap()
    };

    let orchestrator = Orchestrator::new(build(80)).with_checkpointer(Arc::clone(&checkpointer));
    let session = orchestrator.session_id().to_string();
    let handle = orchestrator.cancel_handle();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        handle.cancel();
    });

    let paused = orchestrator.run("p", "d").await.unwrap();
    assert_eq!(paused.status, PipelineStatus::Paused);
    // In-flight work was awaited, not aborted.
    assert!(paused.settled.contains(&StageId::named("b")));
    assert!(!paused.settled.contains(&StageId::named("c")));

    let resumed = Orchestrator::new(build(1))
        .with_checkpointer(checkpointer)
        .with_session_id(session)
        .resume()
        .await
        .unwrap();
    assert_eq!(resumed.status, PipelineStatus::Completed);
    assert!(resumed.state.artifacts_for(&StageId::named("c")).is_some());
    // Settled work was not re-executed; its artifacts carried over.
    assert!(resumed.state.artifacts_for(&StageId::named("b")).is_some());
}

#[tokio::test]
async fn resume_without_checkpoint_is_an_error() {
    let result = Orchestrator::new(diamond_pipeline()).resume().await;
    assert!(matches!(result, Err(PipelineError::NoCheckpoint { .. })));
}

#[tokio::test]
async fn identical_rerun_is_served_from_cache() {
    let agent = Arc::new(ScriptedAgent::producing("requirements", json!([])));
    let pipeline = Pipeline::builder()
        .add_stage(StageDef::new("requirements-gathering"))
        .add_stage(StageDef::new("completion").depends_on("requirements-gathering"))
        .register_agent("requirements-gathering", agent.clone())
        .register_agent("completion", common::scripted("summary"))
        .compile()
        .unwrap();

    let orchestrator = Orchestrator::new(pipeline);
    let first = orchestrator.run("p", "same brief").await.unwrap();
    assert_eq!(first.status, PipelineStatus::Completed);
    assert_eq!(first.cache.hits, 0);

    let second = orchestrator.run("p", "same brief").await.unwrap();
    assert_eq!(second.status, PipelineStatus::Completed);
    assert_eq!(second.cache.hits, 2);
    assert_eq!(agent.calls(), 1);
}

#[tokio::test]
async fn progress_events_trace_the_run() {
    let sink = MemorySink::new();
    let progress = Arc::new(ProgressBus::with_sink(sink.clone()));
    let orchestrator =
        Orchestrator::new(diamond_pipeline()).with_progress_bus(Arc::clone(&progress));

    orchestrator.run("p", "d").await.unwrap();
    // Let the listener drain before inspecting.
    tokio::time::sleep(Duration::from_millis(50)).await;
    progress.stop().await;

    let events = sink.snapshot();
    let started = events
        .iter()
        .filter(|e| matches!(e.kind, ProgressKind::StageStarted { .. }))
        .count();
    let completed = events
        .iter()
        .filter(|e| matches!(e.kind, ProgressKind::StageCompleted { .. }))
        .count();
    assert_eq!(started, 5);
    assert_eq!(completed, 5);
    assert!(events
        .iter()
        .any(|e| matches!(e.kind, ProgressKind::CheckpointSaved { .. })));

    let last = events.last().expect("events were emitted");
    assert!(matches!(last.kind, ProgressKind::PipelineFinished { .. }));
    // Completion percentage climbs to 100 and timestamps never go backward.
    assert_eq!(last.percent, 100);
    assert_eq!(events[0].percent, 0);
    assert!(events.windows(2).all(|w| w[0].at <= w[1].at));
    assert!(events.windows(2).all(|w| w[0].percent <= w[1].percent));
}
