//! Artifacts: the named outputs a stage produces.
//!
//! Agents return an [`ArtifactSet`] from each stage execution. The
//! orchestrator validates the set against the stage's expected artifact
//! names before applying it to project state.

use chrono::{DateTime, Utc};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single named output produced by a stage.
///
/// The payload is arbitrary JSON: a design document, a reference to an
/// external resource, structured review findings, and so on.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    /// Name unique within the producing stage (e.g. "system-design").
    pub name: String,
    /// Free-form kind tag (e.g. "document", "reference").
    pub kind: String,
    pub payload: Value,
    pub produced_at: DateTime<Utc>,
}

impl Artifact {
    #[must_use]
    pub fn new(name: impl Into<String>, payload: Value) -> Self {
        Self {
            name: name.into(),
            kind: "document".to_string(),
            payload,
            produced_at: Utc::now(),
        }
    }

    #[must_use]
    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = kind.into();
        self
    }
}

/// The full output of one stage execution, keyed by artifact name.
///
/// Insertion order is not significant; lookups go through [`get`](Self::get).
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ArtifactSet {
    artifacts: FxHashMap<String, Artifact>,
}

impl ArtifactSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a set from an iterator of artifacts. Later duplicates replace
    /// earlier ones.
    pub fn from_artifacts(artifacts: impl IntoIterator<Item = Artifact>) -> Self {
        let mut set = Self::new();
        for artifact in artifacts {
            set.insert(artifact);
        }
        set
    }

    pub fn insert(&mut self, artifact: Artifact) {
        self.artifacts.insert(artifact.name.clone(), artifact);
    }

    /// Fluent variant of [`insert`](Self::insert).
    #[must_use]
    pub fn with(mut self, artifact: Artifact) -> Self {
        self.insert(artifact);
        self
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Artifact> {
        self.artifacts.get(name)
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.artifacts.contains_key(name)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.artifacts.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.artifacts.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Artifact> {
        self.artifacts.values()
    }

    /// Names sorted for deterministic reporting.
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.artifacts.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Return the expected names missing from this set, sorted.
    ///
    /// An empty result means the set satisfies the stage's output schema.
    #[must_use]
    pub fn missing_from(&self, expected: &[String]) -> Vec<String> {
        let mut missing: Vec<String> = expected
            .iter()
            .filter(|name| !self.contains(name))
            .cloned()
            .collect();
        missing.sort_unstable();
        missing
    }
}

impl IntoIterator for ArtifactSet {
    type Item = Artifact;
    type IntoIter = std::collections::hash_map::IntoValues<String, Artifact>;

    fn into_iter(self) -> Self::IntoIter {
        self.artifacts.into_values()
    }
}
