use thiserror::Error;

use crate::core::task::TaskId;

/// Errors raised by the task graph when a mutation would break its shape.
///
/// A structural error never leaves the graph partially modified.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StructuralError {
    #[error("Task already exists: {0}")]
    DuplicateId(TaskId),

    #[error("Task not found: {0}")]
    UnknownTask(TaskId),

    #[error("Parent task not found: {0}")]
    UnknownParent(TaskId),

    #[error("Task {task} depends on unknown task {dependency}")]
    UnknownDependency { task: TaskId, dependency: TaskId },

    #[error("Dependency {dependency} -> {task} would create a cycle")]
    Cycle { task: TaskId, dependency: TaskId },

    #[error("Task {task} still has dependents: {dependents:?}")]
    HasDependents {
        task: TaskId,
        dependents: Vec<TaskId>,
    },

    #[error("Task {task} still has children: {children:?}")]
    HasChildren { task: TaskId, children: Vec<TaskId> },

    #[error("Invalid transition for {task}: {from} -> {to}")]
    InvalidTransition {
        task: TaskId,
        from: String,
        to: String,
    },
    #[error("Task {0} cannot start running without a worker")]
    MissingWorker(TaskId),
}

/// Errors from branch allocation, commits and merges.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConcurrencyError {
    #[error("Task {task} already owns branch {branch}")]
    Allocation { task: TaskId, branch: String },

    #[error("No changes to commit for task {0}")]
    NoChanges(TaskId),

    #[error("Task {0} has no branch to merge")]
    NoBranch(TaskId),

    #[error("Main line branch not found: {0}")]
    MainLineMissing(String),
}

/// Rejection of a reported success by the completion policy.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Worker reported success without recording any actions")]
    NoActivity,

    #[error("{category} task reported success without file changes")]
    NoFileChanges { category: String },

    #[error("Test task did not change any test files")]
    NoTestChanges,

    #[error("Test task did not run the tests")]
    TestsNotRun,

    #[error("Integration task did not inspect or edit anything")]
    NoInspection,

    #[error("Report for {reported} does not match task category {expected}")]
    CategoryMismatch { expected: String, reported: String },
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Git error: {0}")]
    Git(#[from] git2::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("Structural error: {0}")]
    Structural(#[from] StructuralError),

    #[error("Concurrency error: {0}")]
    Concurrency(#[from] ConcurrencyError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Worker contract violation: {0}")]
    Contract(String),

    #[error("Task cancelled")]
    Cancelled,

    #[error("Worker pool is full (max: {max})")]
    PoolFull { max: usize },

    #[error("Background task failed: {0}")]
    TaskJoin(String),

    #[error("Scheduler is not running")]
    SchedulerStopped,

    #[error("Task tree not found: {0}")]
    TreeNotFound(String),

    #[error("Checkpoint not found: {0}")]
    CheckpointNotFound(String),

    #[error("Checkpoint {checkpoint} belongs to tree {tree}")]
    ForeignCheckpoint { checkpoint: String, tree: String },

    #[error("Invalid plan: {0}")]
    Plan(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("No home directory")]
    NoHomeDir,
}

impl Error {
    pub fn is_structural(&self) -> bool {
        matches!(self, Error::Structural(_))
    }

    pub fn is_concurrency(&self) -> bool {
        matches!(self, Error::Concurrency(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
