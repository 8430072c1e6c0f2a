//! Status and telemetry events.
//!
//! Delivery is at-most-once: the sink never blocks the scheduler, and an
//! event that doesn't fit in the channel is dropped. Consumers that miss
//! events recover by polling `get_status`.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::trace;

use crate::core::{CheckpointId, ConflictInfo, StatusKind, TaskId, TreeId, TreeStatus};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "event")]
pub enum SchedulerEvent {
    TaskStatusChanged {
        tree_id: TreeId,
        task_id: TaskId,
        from: StatusKind,
        to: StatusKind,
    },
    MergeConflict {
        tree_id: TreeId,
        task_id: TaskId,
        conflict: ConflictInfo,
    },
    CheckpointCreated {
        tree_id: TreeId,
        checkpoint_id: CheckpointId,
        description: String,
    },
    /// Nothing is running and nothing can start.
    TreeSettled { tree_id: TreeId, status: TreeStatus },
}

/// Best-effort event publisher. Cloning shares the channel.
#[derive(Debug, Clone, Default)]
pub struct EventSink {
    tx: Option<mpsc::Sender<SchedulerEvent>>,
}

impl EventSink {
    /// Create a sink and its receiving end.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<SchedulerEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx: Some(tx) }, rx)
    }

    /// A sink that drops everything.
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub fn emit(&self, event: SchedulerEvent) {
        if let Some(tx) = &self.tx {
            if let Err(e) = tx.try_send(event) {
                trace!(error = %e, "event dropped");
            }
        }
    }
}
