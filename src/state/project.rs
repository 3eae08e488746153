//! Versioned project state and its single-writer store.
//!
//! All mutation of a project's state funnels through [`StateStore`]. The
//! orchestrator owns the store exclusively; concurrently executing stages
//! receive read-only context snapshots and their results are applied here one
//! at a time after the join barrier. Every successful mutation increments the
//! version counter, which snapshots and checkpoints carry for staleness
//! detection.

use chrono::{DateTime, Utc};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::agent::ProjectHeader;
use crate::artifact::ArtifactSet;
use crate::pipeline::StageGraph;
use crate::stage::StageId;
use crate::state::errors::StateError;
use crate::state::task::{Task, TaskId, TaskStatus};

/// One entry in the stage transition history.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StageTransition {
    pub from: StageId,
    pub to: StageId,
    pub at: DateTime<Utc>,
    /// Set for revision transitions; carries the reviewer's reason.
    pub reason: Option<String>,
}

/// A recorded design decision.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub id: Uuid,
    pub stage: StageId,
    pub summary: String,
    pub rationale: String,
    pub decided_at: DateTime<Utc>,
}

impl Decision {
    #[must_use]
    pub fn new(stage: impl Into<StageId>, summary: impl Into<String>, rationale: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            stage: stage.into(),
            summary: summary.into(),
            rationale: rationale.into(),
            decided_at: Utc::now(),
        }
    }
}

/// Review feedback about one stage's output, recorded by another stage.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Feedback {
    pub id: Uuid,
    pub from_stage: StageId,
    pub about_stage: StageId,
    pub content: String,
    pub recorded_at: DateTime<Utc>,
}

impl Feedback {
    #[must_use]
    pub fn new(
        from_stage: impl Into<StageId>,
        about_stage: impl Into<StageId>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            from_stage: from_stage.into(),
            about_stage: about_stage.into(),
            content: content.into(),
            recorded_at: Utc::now(),
        }
    }
}

/// The full, serializable state of one project.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProjectState {
    pub project_id: String,
    pub name: String,
    pub description: String,
    /// Monotonic mutation counter. Bumped by every successful store
    /// operation; carried by snapshots and checkpoints.
    pub version: u64,
    pub current_stage: StageId,
    pub history: Vec<StageTransition>,
    /// Artifact sets keyed by encoded producing stage id.
    pub artifacts: FxHashMap<String, ArtifactSet>,
    pub tasks: FxHashMap<TaskId, Task>,
    pub decisions: Vec<Decision>,
    pub feedback: Vec<Feedback>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ProjectState {
    #[must_use]
    pub fn header(&self) -> ProjectHeader {
        ProjectHeader {
            project_id: self.project_id.clone(),
            name: self.name.clone(),
            description: self.description.clone(),
            version: self.version,
        }
    }

    #[must_use]
    pub fn artifacts_for(&self, stage: &StageId) -> Option<&ArtifactSet> {
        self.artifacts.get(&stage.encode())
    }
}

/// Point-in-time copy of project state, restorable later.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProjectSnapshot {
    pub taken_at: DateTime<Utc>,
    pub state: ProjectState,
}

impl ProjectSnapshot {
    #[must_use]
    pub fn version(&self) -> u64 {
        self.state.version
    }
}

/// Single-writer owner of a [`ProjectState`].
///
/// Not `Clone` and not internally synchronized: exclusivity is enforced by
/// ownership. The orchestrator holds the store `&mut` and is the only writer.
#[derive(Debug)]
pub struct StateStore {
    state: ProjectState,
    /// When set, completing a task whose dependency tasks are incomplete is
    /// an error instead of a warning.
    strict_tasks: bool,
}

impl StateStore {
    /// Create a store for a new project positioned at `initial_stage`.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        initial_stage: StageId,
    ) -> Self {
        let now = Utc::now();
        Self {
            state: ProjectState {
                project_id: Uuid::new_v4().to_string(),
                name: name.into(),
                description: description.into(),
                version: 0,
                current_stage: initial_stage,
                history: Vec::new(),
                artifacts: FxHashMap::default(),
                tasks: FxHashMap::default(),
                decisions: Vec::new(),
                feedback: Vec::new(),
                created_at: now,
                updated_at: now,
            },
            strict_tasks: false,
        }
    }

    /// Rebuild a store around previously persisted state.
    #[must_use]
    pub fn from_state(state: ProjectState) -> Self {
        Self {
            state,
            strict_tasks: false,
        }
    }

    #[must_use]
    pub fn strict_tasks(mut self, strict: bool) -> Self {
        self.strict_tasks = strict;
        self
    }

    #[must_use]
    pub fn state(&self) -> &ProjectState {
        &self.state
    }

    #[must_use]
    pub fn version(&self) -> u64 {
        self.state.version
    }

    #[must_use]
    pub fn current_stage(&self) -> &StageId {
        &self.state.current_stage
    }

    fn touch(&mut self) {
        self.state.version += 1;
        self.state.updated_at = Utc::now();
    }

    fn reject_if_terminal(&self) -> Result<(), StateError> {
        if self.state.current_stage.is_terminal() {
            return Err(StateError::Terminal {
                stage: self.state.current_stage.clone(),
            });
        }
        Ok(())
    }

    /// Move the project to another stage, validating the transition against
    /// the graph.
    ///
    /// Allowed transitions from a non-terminal stage:
    /// - `Failed`, always;
    /// - `Completed`, only from the graph's final stage;
    /// - any non-backward named stage (forward path or unordered sibling);
    /// - a backward move only along a declared revision edge, in which case
    ///   `reason` records the reviewer's justification.
    #[instrument(skip(self, graph), fields(from = %self.state.current_stage, to = %to))]
    pub fn advance_stage(
        &mut self,
        graph: &StageGraph,
        to: StageId,
        reason: Option<String>,
    ) -> Result<(), StateError> {
        self.reject_if_terminal()?;
        let from = self.state.current_stage.clone();

        let allowed = match &to {
            StageId::Failed => true,
            StageId::Completed => from == *graph.final_stage(),
            StageId::Named(_) if !graph.contains(&to) => false,
            StageId::Named(_) => {
                let backward = graph.forward_reachable(&to, &from);
                !backward || graph.is_revision_edge(&from, &to)
            }
        };
        if !allowed {
            return Err(StateError::InvalidTransition { from, to });
        }

        debug!("stage transition");
        self.state.history.push(StageTransition {
            from,
            to: to.clone(),
            at: Utc::now(),
            reason,
        });
        self.state.current_stage = to;
        self.touch();
        Ok(())
    }

    /// Replace the artifact set recorded for a stage.
    pub fn record_artifacts(&mut self, stage: &StageId, artifacts: ArtifactSet) {
        self.state.artifacts.insert(stage.encode(), artifacts);
        self.touch();
    }

    /// Drop recorded artifacts for the given stages. Used when a revision
    /// forces downstream stages to re-execute.
    pub fn clear_artifacts(&mut self, stages: &[StageId]) {
        let mut cleared = false;
        for stage in stages {
            cleared |= self.state.artifacts.remove(&stage.encode()).is_some();
        }
        if cleared {
            self.touch();
        }
    }

    pub fn add_task(&mut self, task: Task) -> Result<(), StateError> {
        self.reject_if_terminal()?;
        if self.state.tasks.contains_key(&task.id) {
            return Err(StateError::DuplicateTask { id: task.id });
        }
        self.state.tasks.insert(task.id.clone(), task);
        self.touch();
        Ok(())
    }

    /// Update a task's status.
    ///
    /// Completing a task with incomplete dependency tasks is rejected under
    /// strict checking and logged otherwise.
    pub fn update_task_status(
        &mut self,
        id: &TaskId,
        status: TaskStatus,
    ) -> Result<(), StateError> {
        self.reject_if_terminal()?;
        let Some(task) = self.state.tasks.get(id) else {
            return Err(StateError::UnknownTask { id: id.clone() });
        };

        if status == TaskStatus::Completed {
            let unsatisfied = task
                .depends_on
                .iter()
                .find(|dep| {
                    self.state
                        .tasks
                        .get(dep)
                        .map_or(true, |t| t.status != TaskStatus::Completed)
                })
                .cloned();
            if let Some(dependency) = unsatisfied {
                if self.strict_tasks {
                    return Err(StateError::UnsatisfiedDependency {
                        id: id.clone(),
                        dependency,
                    });
                }
                warn!(task = %id, dependency = %dependency, "completing task with incomplete dependency");
            }
        }

        // Unwrap-free re-borrow: presence was checked above.
        if let Some(task) = self.state.tasks.get_mut(id) {
            task.status = status;
            task.updated_at = Utc::now();
        }
        self.touch();
        Ok(())
    }

    pub fn record_decision(&mut self, decision: Decision) -> Result<(), StateError> {
        self.reject_if_terminal()?;
        self.state.decisions.push(decision);
        self.touch();
        Ok(())
    }

    pub fn record_feedback(&mut self, feedback: Feedback) -> Result<(), StateError> {
        self.reject_if_terminal()?;
        self.state.feedback.push(feedback);
        self.touch();
        Ok(())
    }

    /// Take a deep, restorable copy of the current state.
    #[must_use]
    pub fn snapshot(&self) -> ProjectSnapshot {
        ProjectSnapshot {
            taken_at: Utc::now(),
            state: self.state.clone(),
        }
    }

    /// Replace the live state with a snapshot.
    ///
    /// Rejected when the snapshot is older than the live state; restoring
    /// from a terminal state is allowed, as this is the recovery path.
    pub fn restore(&mut self, snapshot: ProjectSnapshot) -> Result<(), StateError> {
        if snapshot.version() < self.state.version {
            return Err(StateError::StaleSnapshot {
                snapshot: snapshot.version(),
                live: self.state.version,
            });
        }
        self.state = snapshot.state;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stage::StageDef;

    fn linear_graph() -> StageGraph {
        StageGraph::build(
            vec![
                StageDef::new("requirements-gathering"),
                StageDef::new("architecture-design").depends_on("requirements-gathering"),
                StageDef::new("quality-review").depends_on("architecture-design"),
            ],
            vec![(StageId::quality_review(), StageId::architecture())],
        )
        .unwrap_or_else(|e| panic!("graph: {e}"))
    }

    fn store() -> StateStore {
        StateStore::new("demo", "demo project", StageId::requirements())
    }

    #[test]
    fn every_mutation_bumps_version() {
        let graph = linear_graph();
        let mut store = store();
        assert_eq!(store.version(), 0);

        store
            .advance_stage(&graph, StageId::architecture(), None)
            .unwrap();
        assert_eq!(store.version(), 1);

        store.record_artifacts(
            &StageId::architecture(),
            ArtifactSet::new(),
        );
        assert_eq!(store.version(), 2);

        store
            .record_decision(Decision::new(
                StageId::architecture(),
                "use a layered design",
                "keeps modules replaceable",
            ))
            .unwrap();
        assert_eq!(store.version(), 3);
    }

    #[test]
    fn backward_move_needs_revision_edge() {
        let graph = linear_graph();
        let mut store = store();
        store
            .advance_stage(&graph, StageId::architecture(), None)
            .unwrap();
        store
            .advance_stage(&graph, StageId::quality_review(), None)
            .unwrap();

        // Declared revision edge: allowed.
        store
            .advance_stage(&graph, StageId::architecture(), Some("design gap".into()))
            .unwrap();

        // Backward without an edge: rejected.
        let err = store.advance_stage(&graph, StageId::requirements(), None);
        assert!(matches!(err, Err(StateError::InvalidTransition { .. })));
    }

    #[test]
    fn completed_only_from_final_stage() {
        let graph = linear_graph();
        let mut store = store();
        let err = store.advance_stage(&graph, StageId::Completed, None);
        assert!(matches!(err, Err(StateError::InvalidTransition { .. })));

        store
            .advance_stage(&graph, StageId::architecture(), None)
            .unwrap();
        store
            .advance_stage(&graph, StageId::quality_review(), None)
            .unwrap();
        store.advance_stage(&graph, StageId::Completed, None).unwrap();
        assert!(store.current_stage().is_terminal());
    }

    #[test]
    fn terminal_state_is_immutable() {
        let graph = linear_graph();
        let mut store = store();
        store.advance_stage(&graph, StageId::Failed, None).unwrap();

        assert!(matches!(
            store.advance_stage(&graph, StageId::architecture(), None),
            Err(StateError::Terminal { .. })
        ));
        assert!(matches!(
            store.add_task(Task::new("t1", StageId::requirements(), "write brief")),
            Err(StateError::Terminal { .. })
        ));
    }

    #[test]
    fn strict_task_dependencies() {
        let mut store = store().strict_tasks(true);
        store
            .add_task(Task::new("t1", StageId::requirements(), "collect inputs"))
            .unwrap();
        store
            .add_task(
                Task::new("t2", StageId::requirements(), "summarize inputs").depends_on("t1"),
            )
            .unwrap();

        let err = store.update_task_status(&TaskId::new("t2"), TaskStatus::Completed);
        assert!(matches!(err, Err(StateError::UnsatisfiedDependency { .. })));

        store
            .update_task_status(&TaskId::new("t1"), TaskStatus::Completed)
            .unwrap();
        store
            .update_task_status(&TaskId::new("t2"), TaskStatus::Completed)
            .unwrap();
    }

    #[test]
    fn duplicate_and_unknown_tasks() {
        let mut store = store();
        store
            .add_task(Task::new("t1", StageId::requirements(), "a"))
            .unwrap();
        assert!(matches!(
            store.add_task(Task::new("t1", StageId::requirements(), "b")),
            Err(StateError::DuplicateTask { .. })
        ));
        assert!(matches!(
            store.update_task_status(&TaskId::new("ghost"), TaskStatus::InProgress),
            Err(StateError::UnknownTask { .. })
        ));
    }

    #[test]
    fn snapshot_restore_rejects_stale() {
        let graph = linear_graph();
        let mut store = store();
        let old = store.snapshot();

        store
            .advance_stage(&graph, StageId::architecture(), None)
            .unwrap();
        let fresh = store.snapshot();

        assert!(matches!(
            store.restore(old),
            Err(StateError::StaleSnapshot { snapshot: 0, live: 1 })
        ));
        store.restore(fresh).unwrap();
        assert_eq!(store.current_stage(), &StageId::architecture());
    }
}
