//! Tasks: fine-grained work items tracked inside a project.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::stage::StageId;

/// Identifier unique within one project.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskId(pub String);

impl TaskId {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        TaskId(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        TaskId(s.to_string())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::InProgress => "in-progress",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

/// A work item owned by a stage and assigned to an agent role.
///
/// A task cannot be marked completed while any dependency task is
/// incomplete, unless strict dependency checking is relaxed on the store.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub description: String,
    pub stage: StageId,
    pub agent_role: String,
    pub status: TaskStatus,
    pub depends_on: Vec<TaskId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    #[must_use]
    pub fn new(id: impl Into<TaskId>, stage: impl Into<StageId>, description: impl Into<String>) -> Self {
        let now = Utc::now();
        let stage = stage.into();
        let agent_role = stage
            .name()
            .map(|n| n.to_string())
            .unwrap_or_else(|| stage.encode());
        Self {
            id: id.into(),
            description: description.into(),
            stage,
            agent_role,
            status: TaskStatus::Pending,
            depends_on: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    #[must_use]
    pub fn depends_on(mut self, dep: impl Into<TaskId>) -> Self {
        self.depends_on.push(dep.into());
        self
    }

    #[must_use]
    pub fn assigned_to(mut self, role: impl Into<String>) -> Self {
        self.agent_role = role.into();
        self
    }
}
