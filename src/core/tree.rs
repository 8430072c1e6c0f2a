//! Serializable task tree: the persisted and checkpointed form of the graph.

use crate::core::ids::{CheckpointId, TreeId};
use crate::core::task::{StatusKind, TaskId, TaskNode};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Aggregate status of a tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TreeStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Blocked,
    Failed,
}

impl TreeStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TreeStatus::Completed | TreeStatus::Failed)
    }
}

impl std::fmt::Display for TreeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TreeStatus::Pending => "pending",
            TreeStatus::Running => "running",
            TreeStatus::Completed => "completed",
            TreeStatus::Blocked => "blocked",
            TreeStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Counts by status plus size information.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct TreeStats {
    pub total: usize,
    pub pending: usize,
    pub running: usize,
    pub passed: usize,
    pub failed: usize,
    pub blocked: usize,
    pub skipped: usize,
    pub max_depth: u32,
}

impl TreeStats {
    pub fn count(&self, kind: StatusKind) -> usize {
        match kind {
            StatusKind::Pending => self.pending,
            StatusKind::Running => self.running,
            StatusKind::Passed => self.passed,
            StatusKind::Failed => self.failed,
            StatusKind::Blocked => self.blocked,
            StatusKind::Skipped => self.skipped,
        }
    }

    pub(crate) fn record(&mut self, node: &TaskNode) {
        self.total += 1;
        self.max_depth = self.max_depth.max(node.depth);
        match node.status.kind() {
            StatusKind::Pending => self.pending += 1,
            StatusKind::Running => self.running += 1,
            StatusKind::Passed => self.passed += 1,
            StatusKind::Failed => self.failed += 1,
            StatusKind::Blocked => self.blocked += 1,
            StatusKind::Skipped => self.skipped += 1,
        }
    }

    /// Fraction of tasks that are passed or skipped.
    pub fn progress(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        (self.passed + self.skipped) as f64 / self.total as f64
    }
}

/// A whole decomposition of one intent into tasks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskTree {
    pub id: TreeId,
    pub blueprint_id: String,
    pub root_id: Option<TaskId>,
    /// Branch the tree's work is merged into.
    pub main_branch: String,
    /// Nodes in insertion order.
    pub nodes: Vec<TaskNode>,
    pub stats: TreeStats,
    pub status: TreeStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub checkpoint_ids: Vec<CheckpointId>,
    /// Checkpoint the current state descends from.
    #[serde(default)]
    pub head_checkpoint: Option<CheckpointId>,
    pub archived_at: Option<DateTime<Utc>>,
}

impl TaskTree {
    pub fn node(&self, id: &TaskId) -> Option<&TaskNode> {
        self.nodes.iter().find(|n| &n.id == id)
    }

    pub fn is_archived(&self) -> bool {
        self.archived_at.is_some()
    }
}
