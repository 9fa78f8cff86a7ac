//! Data types shared across the engine.
//!
//! 1. **Work items** - dotted numeric identifiers for units of product work
//! 2. **Stages** - groups of work items produced by the workflow parser
//! 3. **Tasks** - role-specific units of execution with explicit dependencies
//! 4. **Results** - task outcomes and role sign-offs

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::OrchError;

// ============================================================================
// Work Items
// ============================================================================

/// Shortest and longest accepted id (`epic.feature` .. `epic.feature.story.task.subtask.micro`).
pub const MIN_WORK_ITEM_SEGMENTS: usize = 2;
pub const MAX_WORK_ITEM_SEGMENTS: usize = 6;

/// Dotted numeric work item identifier, e.g. `1.1.2.3`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct WorkItemId(String);

impl WorkItemId {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Number of dotted segments
    pub fn depth(&self) -> usize {
        self.0.split('.').count()
    }

    /// Id safe to embed in task ids and file names
    pub fn slug(&self) -> String {
        self.0.replace('.', "-")
    }
}

impl FromStr for WorkItemId {
    type Err = OrchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let segments: Vec<&str> = trimmed.split('.').collect();

        if segments.len() < MIN_WORK_ITEM_SEGMENTS || segments.len() > MAX_WORK_ITEM_SEGMENTS {
            return Err(OrchError::Validation(format!(
                "Invalid work item id '{}': expected {} to {} dotted numeric segments",
                trimmed, MIN_WORK_ITEM_SEGMENTS, MAX_WORK_ITEM_SEGMENTS
            )));
        }

        if segments
            .iter()
            .any(|seg| seg.is_empty() || !seg.chars().all(|c| c.is_ascii_digit()))
        {
            return Err(OrchError::Validation(format!(
                "Invalid work item id '{}': segments must be numeric",
                trimmed
            )));
        }

        Ok(Self(trimmed.to_string()))
    }
}

impl TryFrom<String> for WorkItemId {
    type Error = OrchError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<WorkItemId> for String {
    fn from(id: WorkItemId) -> Self {
        id.0
    }
}

impl fmt::Display for WorkItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ============================================================================
// Stages
// ============================================================================

/// A group of work items sharing sequential/parallel semantics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Stage {
    /// Stage identifier (`stage-1`, `stage-2`, ...)
    pub id: String,

    /// Display name
    pub name: String,

    /// Work items in order of appearance
    pub work_items: Vec<WorkItemId>,

    /// No ordering constraint among this stage's own work items
    pub parallel: bool,

    /// Stages that must finish first
    #[serde(default)]
    pub depends_on: Vec<String>,

    /// Source text the stage was cut from
    #[serde(default)]
    pub description: String,
}

// ============================================================================
// Tasks
// ============================================================================

/// Role-specific unit of execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    /// Unique task id
    pub id: String,

    /// Role responsible for executing the task
    pub owner_role: String,

    /// What the task is about
    pub description: String,

    /// Tasks that must complete before this task
    #[serde(default)]
    pub dependencies: Vec<String>,

    /// Expected outputs
    #[serde(default)]
    pub deliverables: Vec<String>,

    /// Conditions for the task to count as done
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,

    /// Work item this task was derived from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub work_item: Option<WorkItemId>,
}

impl Task {
    pub fn new(id: impl Into<String>, owner_role: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            owner_role: owner_role.into(),
            description: description.into(),
            dependencies: Vec::new(),
            deliverables: Vec::new(),
            acceptance_criteria: Vec::new(),
            work_item: None,
        }
    }

    pub fn with_dependencies<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies = deps.into_iter().map(Into::into).collect();
        self
    }
}

/// A dependency-closed batch of tasks safe to run concurrently
pub type Phase = Vec<Task>;

// ============================================================================
// Results
// ============================================================================

/// How a task ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Completed,
    /// No executor was reachable; a conservative placeholder result was recorded
    Deferred,
    Failed,
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            TaskStatus::Completed => "completed",
            TaskStatus::Deferred => "deferred",
            TaskStatus::Failed => "failed",
        };
        f.write_str(label)
    }
}

/// Outcome of one task execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskResult {
    pub task_id: String,
    pub role: String,
    /// 1-based phase the task ran in
    pub phase: usize,
    pub status: TaskStatus,
    pub output: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
}

/// A role's terminal verdict on completed work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignOff {
    pub agent: String,
    pub approved: bool,
    #[serde(default)]
    pub feedback: String,
    #[serde(default)]
    pub issues: Vec<String>,
    #[serde(default)]
    pub recommendations: Vec<String>,
}
