//! Concurrency controller: branch-per-task isolation and serialized merges.
//!
//! Every running task works on its own branch, checked out in its own
//! worktree. The main line is written only here, and only while holding
//! the merge queue. The queue is a tokio `Mutex`, which hands the lock out
//! in request order, so merges land in the order they were requested.
//!
//! Git work runs on the blocking pool through [`blocking`]; async locks are
//! held across it, never across a synchronous git call.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, MutexGuard, RwLock};
use tracing::{debug, info, warn};

use crate::core::{MergeResult, StatusKind, TaskGraph, TaskId, TreeId};
use crate::error::ConcurrencyError;
use crate::git::{CommitDiff, FileChange, GitOps};
use crate::orchestration::executor::{Resolution, ResolutionRequest, WorkerExecutor};
use crate::orchestration::resolver::{check_resolution, ConflictResolver, MergeOutcome};
use crate::util::blocking;
use crate::Result;

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub tree_id: TreeId,
    pub main_branch: String,
    pub branch_prefix: String,
    pub worktree_dir: PathBuf,
}

/// A task's claim on its branch and worktree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchLease {
    pub task_id: TaskId,
    pub branch_name: String,
    pub worktree_path: PathBuf,
    /// Main line commit the branch started from.
    pub base_commit: String,
    pub allocated_at: DateTime<Utc>,
}

/// One successful merge into the main line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeRecord {
    pub seq: u64,
    pub task_id: TaskId,
    pub branch_name: String,
    /// Main line tip right after the merge.
    pub commit: String,
    pub merged_at: DateTime<Utc>,
}

/// State guarded by the merge queue.
#[derive(Debug, Default)]
pub struct MergeLog {
    next_seq: u64,
    records: Vec<MergeRecord>,
}

impl MergeLog {
    fn record(&mut self, task_id: &TaskId, branch_name: &str, commit: &str) {
        self.next_seq += 1;
        self.records.push(MergeRecord {
            seq: self.next_seq,
            task_id: task_id.clone(),
            branch_name: branch_name.to_string(),
            commit: commit.to_string(),
            merged_at: Utc::now(),
        });
    }

    pub fn records(&self) -> &[MergeRecord] {
        &self.records
    }
}

/// Exclusive hold on the main line. Merges wait until it is dropped.
pub struct MainLineLock<'a> {
    _guard: MutexGuard<'a, MergeLog>,
}

pub struct ConcurrencyController {
    config: ControllerConfig,
    resolver: ConflictResolver,
    leases: RwLock<HashMap<TaskId, BranchLease>>,
    merge_queue: Mutex<MergeLog>,
    delegate: Option<Arc<dyn WorkerExecutor>>,
    resolve_timeout: Duration,
}

impl ConcurrencyController {
    /// Create a controller for `repo_path`. The main line branch must exist.
    pub fn new(repo_path: &Path, config: ControllerConfig) -> Result<Self> {
        let git_ops = GitOps::new(repo_path)?;
        if !git_ops.branch_exists(&config.main_branch)? {
            return Err(ConcurrencyError::MainLineMissing(config.main_branch.clone()).into());
        }
        debug!(
            main = %config.main_branch,
            worktrees = %config.worktree_dir.display(),
            "ConcurrencyController::new"
        );
        Ok(Self {
            config,
            resolver: ConflictResolver::new(git_ops),
            leases: RwLock::new(HashMap::new()),
            merge_queue: Mutex::new(MergeLog::default()),
            delegate: None,
            resolve_timeout: DEFAULT_RESOLVE_TIMEOUT,
        })
    }

    /// Executor asked to resolve conflicts when a merge comes with a hint.
    ///
    /// A resolution that takes longer than `timeout` is treated as declined.
    pub fn with_conflict_delegate(mut self, delegate: Arc<dyn WorkerExecutor>, timeout: Duration) -> Self {
        self.delegate = Some(delegate);
        self.resolve_timeout = timeout;
        self
    }

    pub fn main_branch(&self) -> &str {
        &self.config.main_branch
    }

    pub fn tree_id(&self) -> TreeId {
        self.config.tree_id
    }

    pub fn git_ops(&self) -> &GitOps {
        self.resolver.git_ops()
    }

    /// `<prefix>/<tree-short>/<task>`
    pub fn branch_name(&self, task_id: &TaskId) -> String {
        format!(
            "{}/{}/{}",
            self.config.branch_prefix,
            self.config.tree_id.short(),
            sanitize(task_id.as_str())
        )
    }

    pub fn worktree_path(&self, task_id: &TaskId) -> PathBuf {
        self.config.worktree_dir.join(format!(
            "{}-{}",
            self.config.tree_id.short(),
            sanitize(task_id.as_str())
        ))
    }

    // ========== Branches ==========

    /// Create a branch and worktree for `task_id` off the current main line.
    pub async fn allocate_branch(&self, task_id: &TaskId) -> Result<BranchLease> {
        let mut leases = self.leases.write().await;
        if let Some(existing) = leases.get(task_id) {
            return Err(ConcurrencyError::Allocation {
                task: task_id.clone(),
                branch: existing.branch_name.clone(),
            }
            .into());
        }

        let branch_name = self.branch_name(task_id);
        let worktree_path = self.worktree_path(task_id);
        let git = self.git_ops().clone();
        let main_branch = self.config.main_branch.clone();
        let (branch, path) = (branch_name.clone(), worktree_path.clone());
        let base_commit = blocking(move || {
            // Leftovers from an interrupted run.
            if path.exists() {
                warn!(path = %path.display(), "removing stale worktree");
                git.remove_worktree(&path)?;
            }
            if git.branch_exists(&branch)? {
                warn!(branch = %branch, "removing stale branch");
                git.delete_branch(&branch)?;
            }
            let base_commit = main_tip(&git, &main_branch)?;
            git.create_worktree(&branch, &base_commit, &path)?;
            Ok(base_commit)
        })
        .await?;
        let lease = BranchLease {
            task_id: task_id.clone(),
            branch_name,
            worktree_path,
            base_commit,
            allocated_at: Utc::now(),
        };
        info!(task = %task_id, branch = %lease.branch_name, "branch allocated");
        leases.insert(task_id.clone(), lease.clone());
        Ok(lease)
    }

    pub async fn lease(&self, task_id: &TaskId) -> Option<BranchLease> {
        self.leases.read().await.get(task_id).cloned()
    }

    pub async fn leases(&self) -> Vec<BranchLease> {
        let mut leases: Vec<BranchLease> = self.leases.read().await.values().cloned().collect();
        leases.sort_by(|a, b| a.allocated_at.cmp(&b.allocated_at));
        leases
    }

    /// Apply `changes` in the task's worktree and commit them on its branch.
    pub async fn commit_changes(
        &self,
        task_id: &TaskId,
        changes: &[FileChange],
        message: &str,
    ) -> Result<String> {
        let lease = self
            .lease(task_id)
            .await
            .ok_or_else(|| ConcurrencyError::NoBranch(task_id.clone()))?;
        if changes.is_empty() {
            return Err(ConcurrencyError::NoChanges(task_id.clone()).into());
        }
        let git = self.git_ops().clone();
        let changes = changes.to_vec();
        let message = message.to_string();
        let committed = blocking(move || {
            GitOps::apply_changes(&lease.worktree_path, &changes)?;
            git.commit_all(&lease.worktree_path, &message)
        })
        .await?;
        match committed {
            Some(commit) => {
                debug!(task = %task_id, commit = %commit, "changes committed");
                Ok(commit)
            }
            None => Err(ConcurrencyError::NoChanges(task_id.clone()).into()),
        }
    }

    /// Merge the task's branch into the main line.
    ///
    /// Waits for its turn in the merge queue. A conflict is handed to the
    /// conflict delegate once when `hint` is given; if that doesn't produce
    /// a clean resolution the result carries the conflict, the main line is
    /// unchanged and the branch is kept for review.
    pub async fn merge_worker_branch(&self, task_id: &TaskId, hint: Option<&str>) -> Result<MergeResult> {
        let mut log = self.merge_queue.lock().await;
        let lease = self
            .lease(task_id)
            .await
            .ok_or_else(|| ConcurrencyError::NoBranch(task_id.clone()))?;
        let message = format!("braid: merge {} ({})", task_id, lease.branch_name);

        let resolver = self.resolver.clone();
        let (main_branch, branch, text) = (
            self.config.main_branch.clone(),
            lease.branch_name.clone(),
            message.clone(),
        );
        let outcome = blocking(move || resolver.merge(&main_branch, &branch, &text)).await?;
        let commit = match outcome {
            MergeOutcome::Conflicted(conflict) => {
                let resolved = match hint {
                    Some(hint) => self.try_resolve(task_id, &lease, &conflict, hint, &message).await?,
                    None => None,
                };
                match resolved {
                    Some(commit) => commit,
                    None => return Ok(MergeResult::conflicted(conflict)),
                }
            }
            outcome => outcome.commit().map(str::to_string).unwrap_or_default(),
        };

        log.record(task_id, &lease.branch_name, &commit);
        drop(log);
        self.release(task_id).await?;
        Ok(MergeResult::merged(&lease.branch_name, commit))
    }

    async fn try_resolve(
        &self,
        task_id: &TaskId,
        lease: &BranchLease,
        conflict: &crate::core::ConflictInfo,
        hint: &str,
        message: &str,
    ) -> Result<Option<String>> {
        let Some(delegate) = &self.delegate else {
            return Ok(None);
        };
        let request = ResolutionRequest {
            task_id: task_id.clone(),
            branch_name: lease.branch_name.clone(),
            conflict: conflict.clone(),
            hint: hint.to_string(),
        };
        let attempt = tokio::time::timeout(self.resolve_timeout, delegate.resolve_conflict(&request));
        let files = match attempt.await {
            Ok(Ok(Resolution::Resolved { files })) => files,
            Ok(Ok(Resolution::Declined { reason })) => {
                info!(task = %task_id, reason, "conflict resolution declined");
                return Ok(None);
            }
            Ok(Err(e)) => {
                warn!(task = %task_id, error = %e, "conflict resolution failed");
                return Ok(None);
            }
            Err(_) => {
                warn!(task = %task_id, timeout = ?self.resolve_timeout, "conflict resolution timed out");
                return Ok(None);
            }
        };
        if let Err(reason) = check_resolution(conflict, &files) {
            warn!(task = %task_id, reason, "conflict resolution rejected");
            return Ok(None);
        }
        let resolver = self.resolver.clone();
        let main_branch = self.config.main_branch.clone();
        let (conflict, message) = (conflict.clone(), message.to_string());
        blocking(move || resolver.merge_resolved(&main_branch, &conflict, &files, &message)).await
    }

    /// Drop the task's branch and worktree without merging.
    ///
    /// Returns whether there was anything to abandon.
    pub async fn abandon_branch(&self, task_id: &TaskId) -> Result<bool> {
        let had_lease = self.leases.read().await.contains_key(task_id);
        if had_lease {
            info!(task = %task_id, "abandoning branch");
            self.release(task_id).await?;
        }
        Ok(had_lease)
    }

    /// Abandon every lease whose task is not in `keep`.
    pub async fn abandon_all_except(&self, keep: &HashSet<TaskId>) -> Result<Vec<TaskId>> {
        let doomed: Vec<TaskId> = self
            .leases
            .read()
            .await
            .keys()
            .filter(|id| !keep.contains(*id))
            .cloned()
            .collect();
        for task_id in &doomed {
            self.release(task_id).await?;
        }
        Ok(doomed)
    }

    async fn release(&self, task_id: &TaskId) -> Result<()> {
        let Some(lease) = self.leases.write().await.remove(task_id) else {
            return Ok(());
        };
        let git = self.git_ops().clone();
        blocking(move || {
            git.remove_worktree(&lease.worktree_path)?;
            git.delete_branch(&lease.branch_name)
        })
        .await
    }

    /// Re-adopt branches recorded on the graph after a restart.
    ///
    /// Running tasks and tasks blocked on a merge conflict keep their
    /// branches; missing worktrees are recreated from the branch.
    pub async fn restore_leases(&self, graph: &TaskGraph) -> Result<usize> {
        let mut leases = self.leases.write().await;
        let candidates: Vec<(TaskId, String, PathBuf)> = graph
            .tasks()
            .into_iter()
            .filter(|node| node.status.kind() == StatusKind::Running || node.conflict().is_some())
            .filter(|node| !leases.contains_key(&node.id))
            .filter_map(|node| {
                let branch = node.branch_name.clone()?;
                Some((node.id.clone(), branch, self.worktree_path(&node.id)))
            })
            .collect();
        if candidates.is_empty() {
            return Ok(0);
        }

        let git = self.git_ops().clone();
        let main_branch = self.config.main_branch.clone();
        let (base_commit, adopted) = blocking(move || {
            let base_commit = main_tip(&git, &main_branch)?;
            let mut adopted = Vec::new();
            for (task_id, branch, path) in candidates {
                if !git.branch_exists(&branch)? {
                    debug!(task = %task_id, branch = %branch, "recorded branch is gone");
                    continue;
                }
                if !path.exists() {
                    git.attach_worktree(&branch, &path)?;
                }
                adopted.push((task_id, branch, path));
            }
            Ok((base_commit, adopted))
        })
        .await?;

        let restored = adopted.len();
        for (task_id, branch_name, worktree_path) in adopted {
            leases.insert(
                task_id.clone(),
                BranchLease {
                    task_id,
                    branch_name,
                    worktree_path,
                    base_commit: base_commit.clone(),
                    allocated_at: Utc::now(),
                },
            );
        }
        if restored > 0 {
            info!(restored, "leases restored");
        }
        Ok(restored)
    }

    // ========== Main line ==========

    pub fn main_position(&self) -> Result<String> {
        main_tip(self.git_ops(), &self.config.main_branch)
    }

    /// Wait for the merge queue and hold the main line.
    pub async fn lock_main(&self) -> MainLineLock<'_> {
        MainLineLock {
            _guard: self.merge_queue.lock().await,
        }
    }

    /// Move the main line to `commit`. Callers hold [`lock_main`](Self::lock_main).
    pub async fn reset_main(&self, _lock: &MainLineLock<'_>, commit: &str) -> Result<()> {
        info!(main = %self.config.main_branch, commit, "resetting main line");
        let git = self.git_ops().clone();
        let (main_branch, commit) = (self.config.main_branch.clone(), commit.to_string());
        blocking(move || git.set_branch_tip(&main_branch, &commit, "braid: rewind")).await
    }

    /// Create another main line branch at `commit`.
    pub async fn create_main_line(&self, name: &str, commit: &str) -> Result<()> {
        let git = self.git_ops().clone();
        let (name, commit) = (name.to_string(), commit.to_string());
        blocking(move || git.create_branch(&name, &commit)).await
    }

    /// Point `branch` at `commit`, creating it if needed.
    ///
    /// Returns whether the branch had to move.
    pub async fn restore_branch(&self, branch: &str, commit: &str) -> Result<bool> {
        let git = self.git_ops().clone();
        let (branch, commit) = (branch.to_string(), commit.to_string());
        blocking(move || {
            if git.branch_tip(&branch)?.as_deref() == Some(commit.as_str()) {
                return Ok(false);
            }
            git.set_branch_tip(&branch, &commit, "braid: restore branch")?;
            Ok(true)
        })
        .await
    }

    pub fn diff_positions(&self, from: &str, to: &str) -> Result<CommitDiff> {
        self.git_ops().diff_commits(from, to)
    }

    /// Successful merges in the order they landed.
    pub async fn merge_history(&self) -> Vec<MergeRecord> {
        self.merge_queue.lock().await.records().to_vec()
    }
}

const DEFAULT_RESOLVE_TIMEOUT: Duration = Duration::from_secs(600);

fn main_tip(git: &GitOps, main_branch: &str) -> Result<String> {
    git.branch_tip(main_branch)?
        .ok_or_else(|| ConcurrencyError::MainLineMissing(main_branch.to_string()).into())
}

/// Make a task id safe to use as a ref component and a directory name.
fn sanitize(raw: &str) -> String {
    let mut out: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_') {
                c
            } else {
                '-'
            }
        })
        .collect();
    while out.contains("--") {
        out = out.replace("--", "-");
    }
    let trimmed = out.trim_matches('-');
    if trimmed.is_empty() {
        "task".to_string()
    } else {
        trimmed.to_string()
    }
}
