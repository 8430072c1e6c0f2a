//! Shell command worker.
//!
//! `CommandExecutor` runs a configured command through `sh -c` inside the
//! task's worktree. The command sees the task through environment variables
//! and may print a JSON [`TaskResult`] on stdout. When it doesn't, the result
//! is derived from the exit code and the worktree's git status.
//!
//! An optional resolve command handles merge conflicts: it reads the
//! conflict as JSON on stdin and prints the resolved files as JSON.

use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::Config;
use crate::core::{TaskCategory, TaskNode};
use crate::git::{FileChange, GitOps};
use crate::orchestration::executor::{
    CategoryReport, Resolution, ResolutionRequest, ResolvedFile, TaskContext, TaskResult,
    WorkerAction, WorkerExecutor,
};
use crate::util::blocking;
use crate::{Error, Result};

pub const ENV_TASK_ID: &str = "BRAID_TASK_ID";
pub const ENV_TASK_NAME: &str = "BRAID_TASK_NAME";
pub const ENV_TASK_DESCRIPTION: &str = "BRAID_TASK_DESCRIPTION";
pub const ENV_TASK_CATEGORY: &str = "BRAID_TASK_CATEGORY";
pub const ENV_BRANCH: &str = "BRAID_BRANCH";
pub const ENV_HINT: &str = "BRAID_HINT";
pub const ENV_DEPENDENCIES: &str = "BRAID_DEPENDENCIES";
pub const ENV_CONSTRAINTS: &str = "BRAID_CONSTRAINTS";

#[derive(Debug, Clone)]
pub struct CommandExecutor {
    shell: PathBuf,
    command: String,
    test_command: Option<String>,
    resolve_command: Option<String>,
}

impl CommandExecutor {
    /// Create an executor for `command`, locating `sh` with `which`.
    pub fn new(command: &str) -> Result<Self> {
        let shell =
            which::which("sh").map_err(|_| Error::Config("sh not found on PATH".to_string()))?;
        Ok(Self::with_shell(shell, command))
    }

    pub fn with_shell(shell: PathBuf, command: &str) -> Self {
        Self {
            shell,
            command: command.to_string(),
            test_command: None,
            resolve_command: None,
        }
    }

    /// Run `test_command` after every successful attempt.
    pub fn with_test_command(mut self, test_command: Option<String>) -> Self {
        self.test_command = test_command;
        self
    }

    pub fn with_resolve_command(mut self, resolve_command: Option<String>) -> Self {
        self.resolve_command = resolve_command;
        self
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        let command = config
            .worker_command
            .as_deref()
            .ok_or_else(|| Error::Config("worker_command is not set".to_string()))?;
        Ok(Self::new(command)?
            .with_test_command(config.test_command.clone())
            .with_resolve_command(config.resolve_command.clone()))
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    fn env(task: &TaskNode, ctx: &TaskContext) -> Vec<(&'static str, String)> {
        let dependencies: Vec<&str> = ctx
            .dependency_outputs
            .iter()
            .map(|d| d.task_id.as_str())
            .collect();
        let mut env = vec![
            (ENV_TASK_ID, task.id.to_string()),
            (ENV_TASK_NAME, task.name.clone()),
            (ENV_TASK_DESCRIPTION, task.description.clone()),
            (ENV_TASK_CATEGORY, task.category.to_string()),
            (ENV_BRANCH, ctx.branch_name.clone()),
            (ENV_DEPENDENCIES, dependencies.join(",")),
            (ENV_CONSTRAINTS, ctx.constraints.join("\n")),
        ];
        if let Some(hint) = &ctx.hint {
            env.push((ENV_HINT, hint.clone()));
        }
        env
    }

    /// Run `command` under `sh -c`, killing the child if `cancel` fires.
    async fn run_shell(
        &self,
        command: &str,
        cwd: &Path,
        env: &[(&'static str, String)],
        input: Option<&[u8]>,
        cancel: &CancellationToken,
    ) -> Result<Output> {
        let mut child = Command::new(&self.shell)
            .arg("-c")
            .arg(command)
            .current_dir(cwd)
            .envs(env.iter().map(|(k, v)| (*k, v.as_str())))
            .stdin(if input.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        if let (Some(input), Some(mut stdin)) = (input, child.stdin.take()) {
            // A command that exits without reading its input is not an error.
            if let Err(e) = stdin.write_all(input).await {
                debug!(error = %e, "command closed stdin early");
            }
        }

        // Dropping the output future drops the child, which kills it.
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!(command, "worker command cancelled");
                Err(Error::Cancelled)
            }
            output = child.wait_with_output() => Ok(output?),
        }
    }

    /// Parse a `TaskResult` printed by the command.
    ///
    /// Accepts the whole of stdout as JSON, or else the last line that is.
    pub fn parse_result(stdout: &str) -> Option<TaskResult> {
        let trimmed = stdout.trim();
        if trimmed.is_empty() {
            return None;
        }
        if let Ok(result) = serde_json::from_str(trimmed) {
            return Some(result);
        }
        trimmed
            .lines()
            .rev()
            .map(str::trim)
            .filter(|line| line.starts_with('{'))
            .find_map(|line| serde_json::from_str(line).ok())
    }

    async fn derive_result(&self, ctx: &TaskContext, output: &Output) -> Result<TaskResult> {
        let exit_code = output.status.code();
        let mut result = if output.status.success() {
            TaskResult::success()
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let message = if stderr.trim().is_empty() {
                format!(
                    "worker command failed with exit code {}",
                    exit_code.unwrap_or(-1)
                )
            } else {
                stderr.trim().to_string()
            };
            TaskResult::failure(message)
        };
        result = result.with_action(WorkerAction::Command {
            command: self.command.clone(),
            exit_code,
        });

        let dir = ctx.working_dir.clone();
        for path in blocking(move || GitOps::changed_files(&dir)).await? {
            result = result
                .with_change(FileChange::Touched { path: path.clone() })
                .with_action(WorkerAction::Edit { path });
        }
        Ok(result)
    }

    async fn run_tests(
        &self,
        task: &TaskNode,
        ctx: &TaskContext,
        test_command: &str,
        mut result: TaskResult,
    ) -> Result<TaskResult> {
        let output = self
            .run_shell(test_command, &ctx.working_dir, &Self::env(task, ctx), None, &ctx.cancel)
            .await?;
        let passed = output.status.success();
        result.actions.push(WorkerAction::RunTests {
            command: test_command.to_string(),
            passed,
        });
        if task.category == TaskCategory::Test {
            result.report = Some(CategoryReport::Test {
                tests_ran: true,
                tests_passed: Some(passed),
            });
        }
        if !passed {
            warn!(task = %task.id, test_command, "tests failed");
            result.success = false;
            result.error = Some(format!(
                "tests failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }
        Ok(result)
    }
}

#[async_trait]
impl WorkerExecutor for CommandExecutor {
    async fn execute(&self, task: &TaskNode, ctx: TaskContext) -> Result<TaskResult> {
        debug!(task = %task.id, dir = %ctx.working_dir.display(), "running worker command");
        let output = self
            .run_shell(&self.command, &ctx.working_dir, &Self::env(task, &ctx), None, &ctx.cancel)
            .await?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let result = match Self::parse_result(&stdout) {
            Some(result) => result,
            None => self.derive_result(&ctx, &output).await?,
        };

        match &self.test_command {
            Some(test_command) if result.success => {
                self.run_tests(task, &ctx, test_command, result).await
            }
            _ => Ok(result),
        }
    }

    async fn resolve_conflict(&self, request: &ResolutionRequest) -> Result<Resolution> {
        let Some(resolve_command) = &self.resolve_command else {
            return Ok(Resolution::Declined {
                reason: "no resolve_command configured".to_string(),
            });
        };
        let env = vec![
            (ENV_TASK_ID, request.task_id.to_string()),
            (ENV_BRANCH, request.branch_name.clone()),
            (ENV_HINT, request.hint.clone()),
        ];
        let input = serde_json::to_vec(&request.conflict)?;
        let output = self
            .run_shell(
                resolve_command,
                &std::env::temp_dir(),
                &env,
                Some(&input),
                &CancellationToken::new(),
            )
            .await?;
        if !output.status.success() {
            return Ok(Resolution::Declined {
                reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        match serde_json::from_slice::<Vec<ResolvedFile>>(&output.stdout) {
            Ok(files) => Ok(Resolution::Resolved { files }),
            Err(e) => Ok(Resolution::Declined {
                reason: format!("unreadable resolution: {}", e),
            }),
        }
    }
}
