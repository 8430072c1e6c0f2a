//! Worker execution contract.
//!
//! The reasoning agent is opaque to braid. Anything that can take a task
//! plus context and produce a [`TaskResult`] implements [`WorkerExecutor`].
//! Ordinary failure is reported inside the result (`success: false`);
//! an `Err` means the executor itself broke the contract.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::core::{Artifact, ConflictInfo, TaskCategory, TaskId, TaskNode};
use crate::git::FileChange;
use crate::{Error, Result};

/// Something the worker did while working on a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "action")]
pub enum WorkerAction {
    Read { path: PathBuf },
    Edit { path: PathBuf },
    /// Looked at something outside a single file: a service, a schema, an API.
    Inspect { target: String },
    RunTests { command: String, passed: bool },
    Command { command: String, exit_code: Option<i32> },
}

/// Category-specific part of a result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "category")]
pub enum CategoryReport {
    Code,
    Refactor,
    Config,
    Docs,
    Test {
        tests_ran: bool,
        tests_passed: Option<bool>,
    },
    Integration {
        #[serde(default)]
        inspected: Vec<String>,
    },
}

impl CategoryReport {
    pub fn category(&self) -> TaskCategory {
        match self {
            CategoryReport::Code => TaskCategory::Code,
            CategoryReport::Refactor => TaskCategory::Refactor,
            CategoryReport::Config => TaskCategory::Config,
            CategoryReport::Docs => TaskCategory::Docs,
            CategoryReport::Test { .. } => TaskCategory::Test,
            CategoryReport::Integration { .. } => TaskCategory::Integration,
        }
    }

    pub fn empty_for(category: TaskCategory) -> Self {
        match category {
            TaskCategory::Code => CategoryReport::Code,
            TaskCategory::Refactor => CategoryReport::Refactor,
            TaskCategory::Config => CategoryReport::Config,
            TaskCategory::Docs => CategoryReport::Docs,
            TaskCategory::Test => CategoryReport::Test {
                tests_ran: false,
                tests_passed: None,
            },
            TaskCategory::Integration => CategoryReport::Integration {
                inspected: Vec::new(),
            },
        }
    }
}

/// What a worker hands back for one attempt.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskResult {
    pub success: bool,
    #[serde(default)]
    pub file_changes: Vec<FileChange>,
    #[serde(default)]
    pub actions: Vec<WorkerAction>,
    pub error: Option<String>,
    pub notes: Option<String>,
    pub report: Option<CategoryReport>,
}

impl TaskResult {
    pub fn success() -> Self {
        Self {
            success: true,
            ..Self::default()
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Self::default()
        }
    }

    pub fn with_change(mut self, change: FileChange) -> Self {
        self.file_changes.push(change);
        self
    }

    pub fn with_action(mut self, action: WorkerAction) -> Self {
        self.actions.push(action);
        self
    }

    pub fn with_report(mut self, report: CategoryReport) -> Self {
        self.report = Some(report);
        self
    }

    pub fn with_notes(mut self, notes: &str) -> Self {
        self.notes = Some(notes.to_string());
        self
    }

    /// Write a file and record the edit in one step.
    pub fn writes(self, path: &str, content: &str) -> Self {
        self.with_change(FileChange::Write {
            path: PathBuf::from(path),
            content: content.to_string(),
        })
        .with_action(WorkerAction::Edit {
            path: PathBuf::from(path),
        })
    }

    pub fn error_message(&self) -> String {
        self.error
            .clone()
            .unwrap_or_else(|| "worker reported failure without an error".to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileExcerpt {
    pub path: PathBuf,
    pub content: String,
}

/// Output of a passed dependency, made available to its dependents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyOutput {
    pub task_id: TaskId,
    pub name: String,
    pub artifacts: Vec<Artifact>,
}

/// Everything a worker gets besides the task itself.
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub working_dir: PathBuf,
    pub branch_name: String,
    pub excerpts: Vec<FileExcerpt>,
    pub dependency_outputs: Vec<DependencyOutput>,
    pub constraints: Vec<String>,
    /// Error from the previous attempt.
    pub hint: Option<String>,
    pub cancel: CancellationToken,
}

impl TaskContext {
    pub fn new(working_dir: PathBuf, branch_name: &str) -> Self {
        Self {
            working_dir,
            branch_name: branch_name.to_string(),
            excerpts: Vec::new(),
            dependency_outputs: Vec::new(),
            constraints: Vec::new(),
            hint: None,
            cancel: CancellationToken::new(),
        }
    }
}

/// A request to resolve merge conflicts on a worker branch.
#[derive(Debug, Clone)]
pub struct ResolutionRequest {
    pub task_id: TaskId,
    pub branch_name: String,
    pub conflict: ConflictInfo,
    pub hint: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedFile {
    pub path: PathBuf,
    /// `None` resolves the conflict by deleting the file.
    pub content: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Resolved { files: Vec<ResolvedFile> },
    Declined { reason: String },
}

#[async_trait]
pub trait WorkerExecutor: Send + Sync {
    async fn execute(&self, task: &TaskNode, ctx: TaskContext) -> Result<TaskResult>;

    /// Produce resolved contents for every conflicted path.
    async fn resolve_conflict(&self, request: &ResolutionRequest) -> Result<Resolution> {
        Ok(Resolution::Declined {
            reason: format!(
                "no conflict resolution available for {}",
                request.branch_name
            ),
        })
    }
}

/// Run `execute` under a deadline and the context's cancellation token.
///
/// On timeout the token is cancelled so the executor can stop its work.
pub async fn run_with_timeout(
    executor: &dyn WorkerExecutor,
    task: &TaskNode,
    ctx: TaskContext,
    limit: Duration,
) -> Result<TaskResult> {
    let cancel = ctx.cancel.clone();
    let token = cancel.clone();
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(Error::Cancelled),
        outcome = tokio::time::timeout(limit, executor.execute(task, ctx)) => match outcome {
            Ok(result) => result,
            Err(_) => {
                cancel.cancel();
                Err(Error::Timeout(limit))
            }
        },
    }
}
