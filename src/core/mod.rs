pub mod graph;
pub mod ids;
pub mod merge;
pub mod task;
pub mod tree;

pub use graph::{StatusMeta, TaskGraph};
pub use ids::{CheckpointId, TreeId, WorkerId};
pub use merge::{ConflictFile, ConflictInfo, MergeResult};
pub use task::{
    Artifact, BlockReason, Complexity, StatusKind, TaskCategory, TaskId, TaskNode, TaskStatus,
};
pub use tree::{TaskTree, TreeStats, TreeStatus};
