//! Checkpoints and time travel.
//!
//! A checkpoint is an immutable record of a tree's graph together with the
//! main line commit at the same instant. Rewinding restores both; branching
//! starts a new tree from one without touching the original.

mod manager;

pub use manager::{
    status_changes, BranchPin, Checkpoint, CheckpointDiff, CheckpointManager, StatusChange,
};
