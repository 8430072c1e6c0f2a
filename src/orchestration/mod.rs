//! Orchestration layer: running a task tree with many workers.
//!
//! The scheduler pulls ready tasks from the graph, gets each one a branch
//! from the concurrency controller and hands it to a worker through the
//! execution contract. Results are validated, then merged or retried.

pub mod command;
pub mod controller;
pub mod events;
pub mod executor;
pub mod pool;
pub mod resolver;
pub mod scheduler;
pub mod validation;

pub use command::CommandExecutor;
pub use controller::{BranchLease, ConcurrencyController, ControllerConfig, MergeRecord};
pub use events::{EventSink, SchedulerEvent};
pub use executor::{
    run_with_timeout, CategoryReport, DependencyOutput, FileExcerpt, Resolution,
    ResolutionRequest, ResolvedFile, TaskContext, TaskResult, WorkerAction, WorkerExecutor,
};
pub use pool::{SessionInfo, SessionState, WorkerEvent, WorkerPool, WorkerSession};
pub use resolver::{ConflictResolver, MergeOutcome};
pub use scheduler::{Scheduler, SchedulerConfig, SchedulerHandle, StatusReport, TaskSnapshot};
pub use validation::validate;
