//! The stage dependency graph.
//!
//! Stages live in an indexable arena with edges stored as index pairs, which
//! keeps the structure free of reference cycles and makes dispatch
//! computation a cheap scan. Built once by
//! [`PipelineBuilder`](crate::pipeline::PipelineBuilder) and shared
//! immutably afterwards.

use miette::Diagnostic;
use rustc_hash::{FxHashMap, FxHashSet};
use thiserror::Error;

use crate::stage::{StageDef, StageId};

/// Structural validation errors raised when compiling a pipeline graph.
#[derive(Debug, Error, Diagnostic)]
pub enum GraphError {
    #[error("duplicate stage: {id}")]
    #[diagnostic(code(stageloom::graph::duplicate_stage))]
    DuplicateStage { id: StageId },

    #[error("stage {id} depends on unknown stage {dependency}")]
    #[diagnostic(
        code(stageloom::graph::unknown_dependency),
        help("Add the dependency stage before compiling.")
    )]
    UnknownDependency { id: StageId, dependency: StageId },

    #[error("dependency cycle involving stage {id}")]
    #[diagnostic(
        code(stageloom::graph::cycle),
        help("Stage dependencies must form a DAG; use a revision edge for backward routing.")
    )]
    Cycle { id: StageId },

    #[error("pipeline must have exactly one final stage, found {found}")]
    #[diagnostic(
        code(stageloom::graph::ambiguous_final),
        help("Exactly one stage may have no dependents; it is the completion stage.")
    )]
    AmbiguousFinal { found: usize },

    #[error("revision edge references unknown stage {id}")]
    #[diagnostic(code(stageloom::graph::unknown_revision_stage))]
    UnknownRevisionStage { id: StageId },

    #[error("revision edge {from} -> {to} is not backward (target must be an ancestor)")]
    #[diagnostic(code(stageloom::graph::revision_not_backward))]
    RevisionNotBackward { from: StageId, to: StageId },

    #[error("pipeline has no stages")]
    #[diagnostic(code(stageloom::graph::empty))]
    Empty,
}

/// Immutable stage DAG with arena storage and index-pair edges.
#[derive(Debug)]
pub struct StageGraph {
    stages: Vec<StageDef>,
    index: FxHashMap<StageId, usize>,
    /// deps[i] = indices of stages that stage i depends on.
    deps: Vec<Vec<usize>>,
    /// dependents[i] = indices of stages that depend on stage i.
    dependents: Vec<Vec<usize>>,
    /// Declared backward edges (from review-type stages), as index pairs.
    revision_edges: Vec<(usize, usize)>,
    /// Index of the unique stage with no dependents.
    final_stage: usize,
}

impl StageGraph {
    /// Build and validate a graph from stage definitions and revision edges.
    pub fn build(
        defs: Vec<StageDef>,
        revision_edges: Vec<(StageId, StageId)>,
    ) -> Result<Self, GraphError> {
        if defs.is_empty() {
            return Err(GraphError::Empty);
        }

        let mut index: FxHashMap<StageId, usize> = FxHashMap::default();
        for (i, def) in defs.iter().enumerate() {
            if index.insert(def.id.clone(), i).is_some() {
                return Err(GraphError::DuplicateStage { id: def.id.clone() });
            }
        }

        let mut deps: Vec<Vec<usize>> = vec![Vec::new(); defs.len()];
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); defs.len()];
        for (i, def) in defs.iter().enumerate() {
            for dep in &def.depends_on {
                let Some(&d) = index.get(dep) else {
                    return Err(GraphError::UnknownDependency {
                        id: def.id.clone(),
                        dependency: dep.clone(),
                    });
                };
                if !deps[i].contains(&d) {
                    deps[i].push(d);
                    dependents[d].push(i);
                }
            }
        }

        // Kahn's algorithm both detects cycles and fixes a topological order.
        let mut in_degree: Vec<usize> = deps.iter().map(Vec::len).collect();
        let mut queue: Vec<usize> = (0..defs.len()).filter(|&i| in_degree[i] == 0).collect();
        let mut visited = 0usize;
        while let Some(i) = queue.pop() {
            visited += 1;
            for &j in &dependents[i] {
                in_degree[j] -= 1;
                if in_degree[j] == 0 {
                    queue.push(j);
                }
            }
        }
        if visited != defs.len() {
            let culprit = in_degree
                .iter()
                .position(|&d| d > 0)
                .unwrap_or_default();
            return Err(GraphError::Cycle {
                id: defs[culprit].id.clone(),
            });
        }

        let finals: Vec<usize> = (0..defs.len())
            .filter(|&i| dependents[i].is_empty())
            .collect();
        let final_stage = match finals.as_slice() {
            [only] => *only,
            other => {
                return Err(GraphError::AmbiguousFinal { found: other.len() });
            }
        };

        let mut graph = Self {
            stages: defs,
            index,
            deps,
            dependents,
            revision_edges: Vec::new(),
            final_stage,
        };

        for (from, to) in revision_edges {
            let Some(&f) = graph.index.get(&from) else {
                return Err(GraphError::UnknownRevisionStage { id: from });
            };
            let Some(&t) = graph.index.get(&to) else {
                return Err(GraphError::UnknownRevisionStage { id: to });
            };
            if !graph.is_ancestor(t, f) {
                return Err(GraphError::RevisionNotBackward { from, to });
            }
            graph.revision_edges.push((f, t));
        }

        Ok(graph)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    #[must_use]
    pub fn contains(&self, id: &StageId) -> bool {
        self.index.contains_key(id)
    }

    #[must_use]
    pub fn def(&self, id: &StageId) -> Option<&StageDef> {
        self.index.get(id).map(|&i| &self.stages[i])
    }

    pub fn defs(&self) -> impl Iterator<Item = &StageDef> {
        self.stages.iter()
    }

    /// The unique stage with no dependents; `Completed` is reachable only
    /// from here.
    #[must_use]
    pub fn final_stage(&self) -> &StageId {
        &self.stages[self.final_stage].id
    }

    /// Stages whose full dependency set is contained in `settled`, excluding
    /// stages already settled. Returned in arena (declaration) order, which
    /// is also a valid dispatch order.
    #[must_use]
    pub fn dispatchable(&self, settled: &FxHashSet<StageId>) -> Vec<StageId> {
        (0..self.stages.len())
            .filter(|&i| !settled.contains(&self.stages[i].id))
            .filter(|&i| {
                self.deps[i]
                    .iter()
                    .all(|&d| settled.contains(&self.stages[d].id))
            })
            .map(|i| self.stages[i].id.clone())
            .collect()
    }

    /// Dependency stage ids of `id`, in declaration order.
    #[must_use]
    pub fn dependencies_of(&self, id: &StageId) -> Vec<StageId> {
        self.index
            .get(id)
            .map(|&i| {
                self.deps[i]
                    .iter()
                    .map(|&d| self.stages[d].id.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// True if a forward dependency path leads from `from` to `to`.
    #[must_use]
    pub fn forward_reachable(&self, from: &StageId, to: &StageId) -> bool {
        match (self.index.get(from), self.index.get(to)) {
            (Some(&f), Some(&t)) => self.is_ancestor(f, t),
            _ => false,
        }
    }

    /// True if `from -> to` was declared as a revision edge.
    #[must_use]
    pub fn is_revision_edge(&self, from: &StageId, to: &StageId) -> bool {
        match (self.index.get(from), self.index.get(to)) {
            (Some(&f), Some(&t)) => self.revision_edges.contains(&(f, t)),
            _ => false,
        }
    }

    /// All stages downstream of `id` (its transitive dependents), plus `id`
    /// itself. Used by the replay revision policy to un-settle work.
    #[must_use]
    pub fn downstream_closure(&self, id: &StageId) -> Vec<StageId> {
        let Some(&start) = self.index.get(id) else {
            return Vec::new();
        };
        let mut seen = vec![false; self.stages.len()];
        let mut stack = vec![start];
        let mut out = Vec::new();
        while let Some(i) = stack.pop() {
            if seen[i] {
                continue;
            }
            seen[i] = true;
            out.push(self.stages[i].id.clone());
            stack.extend(self.dependents[i].iter().copied());
        }
        out
    }

    /// BFS over dependents: is `descendant` reachable from `ancestor`?
    fn is_ancestor(&self, ancestor: usize, descendant: usize) -> bool {
        if ancestor == descendant {
            return false;
        }
        let mut seen = vec![false; self.stages.len()];
        let mut stack = vec![ancestor];
        while let Some(i) = stack.pop() {
            if seen[i] {
                continue;
            }
            seen[i] = true;
            if i == descendant {
                return true;
            }
            stack.extend(self.dependents[i].iter().copied());
        }
        false
    }
}
