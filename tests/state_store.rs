mod common;

use stageloom::artifact::{Artifact, ArtifactSet};
use stageloom::pipeline::StageGraph;
use stageloom::stage::StageId;
use stageloom::state::{Decision, Feedback, StateError, StateStore, Task, TaskId, TaskStatus};

use serde_json::json;

fn graph() -> StageGraph {
    StageGraph::build(
        common::diamond_defs(),
        vec![(StageId::implementation(), StageId::architecture())],
    )
    .expect("fixture graph")
}

#[test]
fn full_lifecycle_bumps_version_monotonically() {
    let graph = graph();
    let mut store = StateStore::new("site", "marketing site", StageId::requirements());
    let mut last = store.version();

    store
        .record_artifacts(
            &StageId::requirements(),
            ArtifactSet::new().with(Artifact::new("requirements", json!(["r1", "r2"]))),
        );
    assert!(store.version() > last);
    last = store.version();

    store
        .advance_stage(&graph, StageId::architecture(), None)
        .unwrap();
    assert!(store.version() > last);
    last = store.version();

    store
        .add_task(Task::new("t1", StageId::architecture(), "draft the design"))
        .unwrap();
    store
        .update_task_status(&TaskId::new("t1"), TaskStatus::InProgress)
        .unwrap();
    store
        .record_decision(Decision::new(
            StageId::architecture(),
            "static site",
            "no dynamic content needed",
        ))
        .unwrap();
    store
        .record_feedback(Feedback::new(
            StageId::architecture(),
            StageId::requirements(),
            "requirement r2 is ambiguous",
        ))
        .unwrap();
    assert!(store.version() > last);

    let state = store.state();
    assert_eq!(state.decisions.len(), 1);
    assert_eq!(state.feedback.len(), 1);
    assert_eq!(state.history.len(), 1);
}

#[test]
fn transition_rules_follow_the_graph() {
    let graph = graph();
    let mut store = StateStore::new("p", "d", StageId::requirements());

    // Jumping forward past dependencies is fine positionally; the scheduler
    // is what gates execution, not the store.
    store
        .advance_stage(&graph, StageId::implementation(), None)
        .unwrap();

    // Backward along the declared revision edge works.
    store
        .advance_stage(&graph, StageId::architecture(), Some("gap".into()))
        .unwrap();

    // Backward without an edge does not.
    assert!(matches!(
        store.advance_stage(&graph, StageId::requirements(), None),
        Err(StateError::InvalidTransition { .. })
    ));

    // Unknown stage is rejected.
    assert!(matches!(
        store.advance_stage(&graph, StageId::named("ghost"), None),
        Err(StateError::InvalidTransition { .. })
    ));
}

#[test]
fn snapshot_and_restore_round_trip() {
    let graph = graph();
    let mut store = StateStore::new("p", "d", StageId::requirements());
    store
        .record_artifacts(
            &StageId::requirements(),
            ArtifactSet::new().with(Artifact::new("requirements", json!([]))),
        );
    let snapshot = store.snapshot();

    store
        .advance_stage(&graph, StageId::architecture(), None)
        .unwrap();

    // Stale snapshot refused; same-or-newer accepted.
    assert!(matches!(
        store.restore(snapshot),
        Err(StateError::StaleSnapshot { .. })
    ));
    let fresh = store.snapshot();
    store.restore(fresh).unwrap();
    assert_eq!(store.current_stage(), &StageId::architecture());
    assert!(store
        .state()
        .artifacts_for(&StageId::requirements())
        .is_some());
}

#[test]
fn serde_round_trip_of_project_state() {
    let mut store = StateStore::new("p", "d", StageId::requirements());
    store
        .add_task(Task::new("t1", StageId::requirements(), "collect").assigned_to("analyst"))
        .unwrap();
    store
        .record_artifacts(
            &StageId::requirements(),
            ArtifactSet::new().with(Artifact::new("requirements", json!({"n": 2}))),
        );

    let encoded = serde_json::to_string(store.state()).unwrap();
    let decoded: stageloom::state::ProjectState = serde_json::from_str(&encoded).unwrap();
    assert_eq!(decoded.version, store.version());
    assert_eq!(decoded.tasks.len(), 1);
    assert_eq!(
        decoded
            .artifacts_for(&StageId::requirements())
            .and_then(|set| set.get("requirements"))
            .map(|a| a.payload.clone()),
        Some(json!({"n": 2}))
    );
}
