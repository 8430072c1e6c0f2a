//! Task data model for the task tree.
//!
//! Tasks are the atomic units of work handed to workers. Each task tracks
//! its status, hierarchy position, dependencies, retry budget, branch
//! assignment and the artifacts it produced.

use crate::core::ids::WorkerId;
use crate::core::merge::ConflictInfo;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::PathBuf;
use uuid::Uuid;

/// Caller-chosen identifier, unique within a tree.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub String);

impl TaskId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate an identifier for callers that don't name their tasks.
    pub fn generate() -> Self {
        Self(format!("task-{}", &Uuid::new_v4().simple().to_string()[..8]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for TaskId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for TaskId {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(s.to_string()))
    }
}

/// Why a task is blocked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum BlockReason {
    /// A dependency (or child) failed permanently.
    DependencyFailed { dependency: TaskId },
    /// The task's branch could not be merged; the branch is preserved.
    MergeConflict { conflict: ConflictInfo },
    /// Held by an operator.
    Override { note: String },
}

impl std::fmt::Display for BlockReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BlockReason::DependencyFailed { dependency } => {
                write!(f, "dependency {} failed", dependency)
            }
            BlockReason::MergeConflict { conflict } => write!(f, "{}", conflict.summary()),
            BlockReason::Override { note } => write!(f, "held: {}", note),
        }
    }
}

/// Task status in its lifecycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum TaskStatus {
    #[default]
    Pending,
    Running,
    Passed,
    Failed {
        error: String,
    },
    Blocked {
        reason: BlockReason,
    },
    Skipped,
}

impl TaskStatus {
    pub fn kind(&self) -> StatusKind {
        match self {
            TaskStatus::Pending => StatusKind::Pending,
            TaskStatus::Running => StatusKind::Running,
            TaskStatus::Passed => StatusKind::Passed,
            TaskStatus::Failed { .. } => StatusKind::Failed,
            TaskStatus::Blocked { .. } => StatusKind::Blocked,
            TaskStatus::Skipped => StatusKind::Skipped,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        TaskStatus::Failed {
            error: error.into(),
        }
    }

    pub fn blocked(reason: BlockReason) -> Self {
        TaskStatus::Blocked { reason }
    }

    /// Passed or skipped: satisfies dependents.
    pub fn is_satisfied(&self) -> bool {
        matches!(self, TaskStatus::Passed | TaskStatus::Skipped)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Failed { error } => write!(f, "failed: {}", error),
            TaskStatus::Blocked { reason } => write!(f, "blocked: {}", reason),
            other => write!(f, "{}", other.kind()),
        }
    }
}

/// Status without its payload, used for counting and transition checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusKind {
    Pending,
    Running,
    Passed,
    Failed,
    Blocked,
    Skipped,
}

impl std::fmt::Display for StatusKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StatusKind::Pending => "pending",
            StatusKind::Running => "running",
            StatusKind::Passed => "passed",
            StatusKind::Failed => "failed",
            StatusKind::Blocked => "blocked",
            StatusKind::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

/// Kind of work a task represents. Drives completion validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskCategory {
    #[default]
    Code,
    Refactor,
    Test,
    Config,
    Integration,
    Docs,
}

impl std::fmt::Display for TaskCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskCategory::Code => "code",
            TaskCategory::Refactor => "refactor",
            TaskCategory::Test => "test",
            TaskCategory::Config => "config",
            TaskCategory::Integration => "integration",
            TaskCategory::Docs => "docs",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Complexity {
    Trivial,
    #[default]
    Simple,
    Moderate,
    Complex,
}

/// A file produced or touched by a task, pinned to the commit that holds it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub path: PathBuf,
    pub commit: Option<String>,
}

/// A single node in the task tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskNode {
    pub id: TaskId,
    pub parent_id: Option<TaskId>,
    pub name: String,
    pub description: String,
    pub status: TaskStatus,
    /// Higher runs first.
    pub priority: u32,
    /// Root is 0; set by the graph from the parent.
    pub depth: u32,
    pub dependencies: BTreeSet<TaskId>,
    pub category: TaskCategory,
    pub complexity: Complexity,
    pub retry_count: u32,
    pub max_retries: u32,
    pub worker_id: Option<WorkerId>,
    pub branch_name: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Insertion order within the tree; final ordering tie-break.
    pub seq: u64,
    #[serde(default)]
    pub artifacts: Vec<Artifact>,
    #[serde(default)]
    pub acceptance_tests: Vec<String>,
    /// Most recent failure, passed back to the worker as a hint on retry.
    pub last_error: Option<String>,
}

impl TaskNode {
    /// Create a pending task with default category, complexity and retry budget.
    pub fn new(id: impl Into<TaskId>, name: &str) -> Self {
        Self {
            id: id.into(),
            parent_id: None,
            name: name.to_string(),
            description: String::new(),
            status: TaskStatus::Pending,
            priority: 0,
            depth: 0,
            dependencies: BTreeSet::new(),
            category: TaskCategory::default(),
            complexity: Complexity::default(),
            retry_count: 0,
            max_retries: 2,
            worker_id: None,
            branch_name: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            seq: 0,
            artifacts: Vec::new(),
            acceptance_tests: Vec::new(),
            last_error: None,
        }
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }

    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_category(mut self, category: TaskCategory) -> Self {
        self.category = category;
        self
    }

    pub fn with_complexity(mut self, complexity: Complexity) -> Self {
        self.complexity = complexity;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn depends_on(mut self, dependency: impl Into<TaskId>) -> Self {
        self.dependencies.insert(dependency.into());
        self
    }

    pub fn with_acceptance_test(mut self, test: &str) -> Self {
        self.acceptance_tests.push(test.to_string());
        self
    }

    pub fn is_terminal(&self) -> bool {
        match &self.status {
            TaskStatus::Passed | TaskStatus::Skipped => true,
            TaskStatus::Failed { .. } => !self.can_retry(),
            _ => false,
        }
    }

    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }

    /// Human-readable reason for a blocked task.
    pub fn blocking_reason(&self) -> Option<String> {
        match &self.status {
            TaskStatus::Blocked { reason } => Some(reason.to_string()),
            _ => None,
        }
    }

    pub fn conflict(&self) -> Option<&ConflictInfo> {
        match &self.status {
            TaskStatus::Blocked {
                reason: BlockReason::MergeConflict { conflict },
            } => Some(conflict),
            _ => None,
        }
    }

    pub fn duration(&self) -> Option<chrono::Duration> {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => Some(end - start),
            _ => None,
        }
    }
}
