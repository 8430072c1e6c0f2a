//! Scheduler for parallel task execution.
//!
//! The Scheduler drives a task tree to completion: it dispatches ready
//! tasks to workers while respecting dependencies and the parallelism
//! budget, validates what comes back, merges successful work through the
//! concurrency controller and applies the retry and failure propagation
//! policy. Composite tasks run without a worker and settle from their
//! children.
//!
//! Workers run on their own tokio tasks and report a [`WorkerEvent`] over an
//! mpsc channel. The scheduler is the only writer of the task graph; it
//! never holds the graph lock while waiting on the merge queue.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, RwLock};
use tracing::{debug, error, info, warn};

use crate::checkpoint::{Checkpoint, CheckpointManager};
use crate::config::Config;
use crate::core::{
    Artifact, BlockReason, CheckpointId, Complexity, MergeResult, StatusKind, StatusMeta,
    TaskGraph, TaskId, TaskNode, TaskStatus, TreeId, TreeStats, TreeStatus, WorkerId,
};
use crate::error::{ConcurrencyError, StructuralError};
use crate::orchestration::controller::{BranchLease, ConcurrencyController};
use crate::orchestration::events::{EventSink, SchedulerEvent};
use crate::orchestration::executor::{
    run_with_timeout, DependencyOutput, TaskContext, TaskResult, WorkerExecutor,
};
use crate::orchestration::pool::{SessionInfo, SessionState, WorkerEvent, WorkerPool, WorkerSession};
use crate::orchestration::validation;
use crate::state::StateStore;
use crate::{Error, Result};

const WORKER_EVENT_CAPACITY: usize = 64;
const CONTROL_CAPACITY: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    pub max_parallel: usize,
    pub task_timeout: Duration,
    /// Checkpoint after this many passed tasks. Zero disables.
    pub checkpoint_every: usize,
    pub checkpoint_before_complex: bool,
    pub checkpoint_retention: Option<usize>,
    /// Offer merge conflicts to the executor before blocking the task.
    pub auto_resolve: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

impl From<&Config> for SchedulerConfig {
    fn from(config: &Config) -> Self {
        Self {
            max_parallel: config.max_parallel,
            task_timeout: config.task_timeout(),
            checkpoint_every: config.checkpoint_every,
            checkpoint_before_complex: config.checkpoint_before_complex,
            checkpoint_retention: config.checkpoint_retention,
            auto_resolve: config.auto_resolve,
        }
    }
}

/// One task as seen by `get_status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSnapshot {
    pub id: TaskId,
    pub name: String,
    pub status: StatusKind,
    pub blocking_reason: Option<String>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub branch_name: Option<String>,
    pub last_error: Option<String>,
}

impl From<&TaskNode> for TaskSnapshot {
    fn from(node: &TaskNode) -> Self {
        Self {
            id: node.id.clone(),
            name: node.name.clone(),
            status: node.status.kind(),
            blocking_reason: node.blocking_reason(),
            retry_count: node.retry_count,
            max_retries: node.max_retries,
            branch_name: node.branch_name.clone(),
            last_error: node.last_error.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    pub tree_id: TreeId,
    pub tree_status: TreeStatus,
    pub tasks: Vec<TaskSnapshot>,
    pub stats: TreeStats,
    pub sessions: Vec<SessionInfo>,
    pub paused: bool,
}

impl StatusReport {
    pub fn task(&self, id: &TaskId) -> Option<&TaskSnapshot> {
        self.tasks.iter().find(|t| &t.id == id)
    }
}

enum Control {
    Pause,
    Resume,
    Cancel(TaskId, oneshot::Sender<Result<()>>),
    Status(oneshot::Sender<StatusReport>),
    Stop,
}

/// Clone-able remote control for a running scheduler.
#[derive(Clone)]
pub struct SchedulerHandle {
    tx: mpsc::Sender<Control>,
}

impl SchedulerHandle {
    async fn send(&self, control: Control) -> Result<()> {
        self.tx
            .send(control)
            .await
            .map_err(|_| Error::SchedulerStopped)
    }

    pub async fn pause(&self) -> Result<()> {
        self.send(Control::Pause).await
    }

    pub async fn resume(&self) -> Result<()> {
        self.send(Control::Resume).await
    }

    pub async fn cancel(&self, task_id: &TaskId) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Control::Cancel(task_id.clone(), reply)).await?;
        rx.await.map_err(|_| Error::SchedulerStopped)?
    }

    pub async fn status(&self) -> Result<StatusReport> {
        let (reply, rx) = oneshot::channel();
        self.send(Control::Status(reply)).await?;
        rx.await.map_err(|_| Error::SchedulerStopped)
    }

    /// Cancel every worker and make `run` return. Interrupted tasks go back
    /// to pending.
    pub async fn stop(&self) -> Result<()> {
        self.send(Control::Stop).await
    }
}

pub struct Scheduler {
    config: SchedulerConfig,
    graph: Arc<RwLock<TaskGraph>>,
    controller: Arc<ConcurrencyController>,
    executor: Arc<dyn WorkerExecutor>,
    pool: WorkerPool,
    events: EventSink,
    checkpoints: Option<Arc<CheckpointManager>>,
    store: Option<StateStore>,
    worker_tx: mpsc::Sender<WorkerEvent>,
    worker_rx: mpsc::Receiver<WorkerEvent>,
    control_tx: Option<mpsc::WeakSender<Control>>,
    control_rx: Option<mpsc::Receiver<Control>>,
    paused: bool,
    stopping: bool,
    passed_since_checkpoint: usize,
}

impl Scheduler {
    pub fn new(
        graph: Arc<RwLock<TaskGraph>>,
        controller: Arc<ConcurrencyController>,
        executor: Arc<dyn WorkerExecutor>,
        config: SchedulerConfig,
    ) -> Self {
        let (worker_tx, worker_rx) = mpsc::channel(WORKER_EVENT_CAPACITY);
        Self {
            pool: WorkerPool::new(config.max_parallel),
            config,
            graph,
            controller,
            executor,
            events: EventSink::disabled(),
            checkpoints: None,
            store: None,
            worker_tx,
            worker_rx,
            control_tx: None,
            control_rx: None,
            paused: false,
            stopping: false,
            passed_since_checkpoint: 0,
        }
    }

    pub fn with_events(mut self, events: EventSink) -> Self {
        self.events = events;
        self
    }

    pub fn with_checkpoints(mut self, manager: Arc<CheckpointManager>) -> Self {
        self.checkpoints = Some(manager);
        self
    }

    /// Persist the tree after every mutation.
    pub fn with_store(mut self, store: StateStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn graph(&self) -> Arc<RwLock<TaskGraph>> {
        self.graph.clone()
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn active_count(&self) -> usize {
        self.pool.active_count()
    }

    /// A control handle. `run` keeps waiting while paused only as long as
    /// some handle is alive to resume it.
    pub fn handle(&mut self) -> SchedulerHandle {
        if let Some(tx) = self.control_tx.as_ref().and_then(|weak| weak.upgrade()) {
            return SchedulerHandle { tx };
        }
        let (tx, rx) = mpsc::channel(CONTROL_CAPACITY);
        self.control_tx = Some(tx.downgrade());
        self.control_rx = Some(rx);
        SchedulerHandle { tx }
    }

    // ========== Main loop ==========

    /// Run until nothing is running and nothing more can start.
    ///
    /// Per-task failures are absorbed into the graph; only structural and
    /// infrastructure errors are returned.
    pub async fn run(&mut self) -> Result<StatusReport> {
        self.stopping = false;
        self.recover_interrupted().await?;
        let tree = self.graph.read().await.tree_id();
        info!(
            tree = %tree.short(),
            max_parallel = self.config.max_parallel,
            "scheduler started"
        );

        loop {
            self.settle_composites().await?;
            self.dispatch_ready().await?;

            if self.pool.active_count() == 0
                && (self.stopping || !self.paused || self.control_rx.is_none())
            {
                break;
            }

            tokio::select! {
                Some(event) = self.worker_rx.recv() => {
                    self.handle_worker_event(event).await?;
                }
                control = recv_control(&mut self.control_rx) => match control {
                    Some(control) => self.handle_control(control).await?,
                    None => self.control_rx = None,
                },
            }
        }

        self.settle_composites().await?;
        let report = self.get_status().await;
        info!(status = %report.tree_status, passed = report.stats.passed, "scheduler idle");
        self.events.emit(SchedulerEvent::TreeSettled {
            tree_id: report.tree_id,
            status: report.tree_status,
        });
        self.persist().await?;
        Ok(report)
    }

    async fn handle_control(&mut self, control: Control) -> Result<()> {
        match control {
            Control::Pause => self.pause(),
            Control::Resume => self.resume(),
            Control::Cancel(task_id, reply) => {
                let _ = reply.send(self.cancel(&task_id).await);
            }
            Control::Status(reply) => {
                let _ = reply.send(self.get_status().await);
            }
            Control::Stop => self.stop().await?,
        }
        Ok(())
    }

    // ========== Dispatch ==========

    /// Start ready tasks until the pool is full. Returns how many leaf tasks
    /// were handed to workers.
    pub async fn dispatch_ready(&mut self) -> Result<usize> {
        if self.paused || self.stopping {
            return Ok(0);
        }
        let mut dispatched = 0;
        loop {
            let has_capacity = self.pool.has_capacity();
            let next = {
                let graph = self.graph.read().await;
                graph
                    .ready_tasks()
                    .into_iter()
                    .map(|node| (node.clone(), graph.is_composite(&node.id)))
                    .find(|(_, composite)| *composite || has_capacity)
            };
            match next {
                Some((node, true)) => self.start_composite(&node.id).await?,
                Some((node, false)) => {
                    self.dispatch(node).await?;
                    dispatched += 1;
                }
                None => break,
            }
        }
        Ok(dispatched)
    }

    async fn start_composite(&mut self, id: &TaskId) -> Result<()> {
        {
            let mut graph = self.graph.write().await;
            transition(&mut graph, &self.events, id, TaskStatus::Running, StatusMeta::default())?;
        }
        debug!(task = %id, "composite task started");
        self.persist().await
    }

    async fn dispatch(&mut self, task: TaskNode) -> Result<()> {
        if task.complexity == Complexity::Complex
            && task.retry_count == 0
            && self.config.checkpoint_before_complex
            && self.checkpoints.is_some()
        {
            self.checkpoint(&format!("before {}", task.id)).await?;
        }

        let lease = self.controller.allocate_branch(&task.id).await?;
        let (session, ctx) = match self.start_session(&task, &lease).await {
            Ok(started) => started,
            Err(e) => {
                warn!(task = %task.id, error = %e, "dispatch failed; releasing branch");
                if let Some(worker_id) = self.pool.for_task(&task.id).map(|s| s.worker_id) {
                    self.pool.finish(&worker_id);
                }
                self.controller.abandon_branch(&task.id).await?;
                return Err(e);
            }
        };
        self.persist().await?;

        info!(
            task = %task.id,
            worker = %session.worker_id.short(),
            branch = %lease.branch_name,
            attempt = task.retry_count + 1,
            "task dispatched"
        );

        let executor = self.executor.clone();
        let tx = self.worker_tx.clone();
        let limit = self.config.task_timeout;
        let worker_id = session.worker_id;
        tokio::spawn(async move {
            let outcome = run_with_timeout(executor.as_ref(), &task, ctx, limit).await;
            let event = WorkerEvent {
                worker_id,
                task_id: task.id,
                outcome,
            };
            if tx.send(event).await.is_err() {
                debug!("scheduler gone; worker result dropped");
            }
        });
        Ok(())
    }

    /// Open a worker session on `lease` and mark the task running.
    async fn start_session(&mut self, task: &TaskNode, lease: &BranchLease) -> Result<(WorkerSession, TaskContext)> {
        let session = self
            .pool
            .start(&task.id, &lease.branch_name, lease.worktree_path.clone())?;

        let ctx = {
            let mut graph = self.graph.write().await;
            transition(
                &mut graph,
                &self.events,
                &task.id,
                TaskStatus::Running,
                StatusMeta::worker(session.worker_id),
            )?;
            graph.set_branch(&task.id, Some(lease.branch_name.clone()))?;

            let mut ctx = TaskContext::new(lease.worktree_path.clone(), &lease.branch_name);
            ctx.dependency_outputs = graph
                .dependencies(&task.id)
                .into_iter()
                .map(|dep| DependencyOutput {
                    task_id: dep.id.clone(),
                    name: dep.name.clone(),
                    artifacts: dep.artifacts.clone(),
                })
                .collect();
            ctx.constraints = task
                .acceptance_tests
                .iter()
                .map(|t| format!("acceptance test: {}", t))
                .collect();
            ctx.hint = task.last_error.clone();
            ctx.cancel = session.cancel.clone();
            ctx
        };
        Ok((session, ctx))
    }

    // ========== Results ==========

    /// Apply one worker's outcome. Results from sessions that were cancelled
    /// or replaced are discarded.
    pub async fn handle_worker_event(&mut self, event: WorkerEvent) -> Result<()> {
        if !self.pool.is_current(&event.worker_id, &event.task_id) {
            debug!(task = %event.task_id, worker = %event.worker_id.short(), "discarding late result");
            return Ok(());
        }
        let task = self.graph.read().await.get(&event.task_id).cloned();
        let Some(task) = task.filter(|t| t.status.kind() == StatusKind::Running) else {
            self.pool.finish(&event.worker_id);
            return Ok(());
        };

        let outcome = match event.outcome {
            Ok(result) if result.success => match validation::validate(&task, &result) {
                Ok(()) => Ok(result),
                Err(rejection) => Err(Error::from(rejection).to_string()),
            },
            Ok(result) => Err(result.error_message()),
            Err(e) => Err(e.to_string()),
        };

        match outcome {
            Ok(result) => self.complete(&task, result, event.worker_id).await,
            Err(error) => self.fail_attempt(&task.id, event.worker_id, error).await,
        }
    }

    async fn complete(
        &mut self,
        task: &TaskNode,
        result: TaskResult,
        worker_id: WorkerId,
    ) -> Result<()> {
        let message = format!("braid: {} ({})", task.name, task.id);
        match self
            .controller
            .commit_changes(&task.id, &result.file_changes, &message)
            .await
        {
            Ok(commit) => debug!(task = %task.id, commit = %commit, "work committed"),
            Err(Error::Concurrency(ConcurrencyError::NoChanges(_))) => {
                debug!(task = %task.id, "nothing to commit")
            }
            Err(e) => return self.fail_attempt(&task.id, worker_id, e.to_string()).await,
        }

        self.pool.set_state(&worker_id, SessionState::Merging);
        let hint = self.config.auto_resolve.then(|| {
            result
                .notes
                .clone()
                .unwrap_or_else(|| format!("{}: {}", task.name, task.description))
        });
        let merge = match self
            .controller
            .merge_worker_branch(&task.id, hint.as_deref())
            .await
        {
            Ok(merge) => merge,
            Err(e) => return self.fail_attempt(&task.id, worker_id, e.to_string()).await,
        };
        self.pool.finish(&worker_id);

        if merge.success {
            let artifacts = result
                .file_changes
                .iter()
                .map(|change| Artifact {
                    path: change.path().to_path_buf(),
                    commit: merge.commit.clone(),
                })
                .collect();
            {
                let mut graph = self.graph.write().await;
                graph.record_artifacts(&task.id, artifacts)?;
                graph.set_branch(&task.id, None)?;
                graph.set_last_error(&task.id, None)?;
                transition(&mut graph, &self.events, &task.id, TaskStatus::Passed, StatusMeta::default())?;
            }
            info!(task = %task.id, commit = ?merge.commit, "task passed");
            self.passed_since_checkpoint += 1;
            self.persist().await?;
            return self.checkpoint_if_due().await;
        }

        let Some(conflict) = merge.conflict else {
            let error = format!("merge of {} failed without conflict details", merge.branch_name);
            return self.fail_attempt(&task.id, worker_id, error).await;
        };
        warn!(
            task = %task.id,
            branch = %conflict.branch_name,
            files = conflict.files.len(),
            "merge conflict; task blocked"
        );
        {
            let mut graph = self.graph.write().await;
            transition(
                &mut graph,
                &self.events,
                &task.id,
                TaskStatus::blocked(BlockReason::MergeConflict {
                    conflict: conflict.clone(),
                }),
                StatusMeta::default(),
            )?;
            self.events.emit(SchedulerEvent::MergeConflict {
                tree_id: graph.tree_id(),
                task_id: task.id.clone(),
                conflict,
            });
        }
        self.persist().await
    }

    /// Record a failed attempt: abandon the branch, then retry or fail for
    /// good and block everything downstream.
    async fn fail_attempt(
        &mut self,
        task_id: &TaskId,
        worker_id: WorkerId,
        error: String,
    ) -> Result<()> {
        self.pool.record_error(&worker_id);
        self.pool.finish(&worker_id);
        self.controller.abandon_branch(task_id).await?;

        {
            let mut graph = self.graph.write().await;
            graph.set_branch(task_id, None)?;
            transition(
                &mut graph,
                &self.events,
                task_id,
                TaskStatus::failed(error.clone()),
                StatusMeta::default(),
            )?;
            let can_retry = graph.get(task_id).is_some_and(TaskNode::can_retry);
            if can_retry {
                transition(&mut graph, &self.events, task_id, TaskStatus::Pending, StatusMeta::default())?;
                let attempt = graph.get(task_id).map_or(0, |n| n.retry_count);
                warn!(task = %task_id, attempt, error = %error, "attempt failed; retrying");
            } else {
                error!(task = %task_id, error = %error, "task failed");
                block_dependents(&mut graph, &self.events, task_id)?;
            }
        }
        self.persist().await
    }

    /// Settle composite tasks whose children are all done.
    ///
    /// All children passed or skipped: the composite passes. Otherwise it
    /// is blocked on its first unsuccessful child; when that child failed
    /// for good, the composite's dependents are blocked too.
    async fn settle_composites(&mut self) -> Result<()> {
        let mut settled_any = false;
        {
            let mut graph = self.graph.write().await;
            loop {
                let mut outcomes = Vec::new();
                for node in graph.tasks_with_status(StatusKind::Running) {
                    let children = graph.children(&node.id);
                    if children.is_empty() || !children.iter().all(|c| is_settled(c)) {
                        continue;
                    }
                    let failing = children
                        .iter()
                        .filter(|c| !c.status.is_satisfied())
                        .min_by_key(|c| c.seq)
                        .map(|c| (c.id.clone(), propagates_failure(c)));
                    outcomes.push((node.id.clone(), failing));
                }
                if outcomes.is_empty() {
                    break;
                }
                for (id, failing) in outcomes {
                    match failing {
                        None => {
                            transition(&mut graph, &self.events, &id, TaskStatus::Passed, StatusMeta::default())?;
                            info!(task = %id, "composite task passed");
                        }
                        Some((child, propagate)) => {
                            let reason = BlockReason::DependencyFailed { dependency: child };
                            transition(&mut graph, &self.events, &id, TaskStatus::blocked(reason), StatusMeta::default())?;
                            warn!(task = %id, "composite task blocked");
                            if propagate {
                                block_dependents(&mut graph, &self.events, &id)?;
                            }
                        }
                    }
                }
                settled_any = true;
            }
        }
        if settled_any {
            self.persist().await?;
        }
        Ok(())
    }

    // ========== Control ==========

    /// Stop dispatching new work. Running workers finish normally.
    pub fn pause(&mut self) {
        if !self.paused {
            info!("scheduler paused");
        }
        self.paused = true;
        self.pool.set_paused(true);
    }

    pub fn resume(&mut self) {
        if self.paused {
            info!("scheduler resumed");
        }
        self.paused = false;
        self.pool.set_paused(false);
    }

    pub async fn get_status(&self) -> StatusReport {
        let graph = self.graph.read().await;
        StatusReport {
            tree_id: graph.tree_id(),
            tree_status: graph.status(),
            tasks: graph.tasks().into_iter().map(TaskSnapshot::from).collect(),
            stats: graph.stats(),
            sessions: self.pool.sessions(),
            paused: self.paused,
        }
    }

    /// Cancel a task and skip it together with its unfinished subtree.
    ///
    /// Running workers in the subtree are told to stop and their branches
    /// are abandoned. Results they still send are discarded.
    pub async fn cancel(&mut self, task_id: &TaskId) -> Result<()> {
        let subtree = {
            let graph = self.graph.read().await;
            if !graph.contains(task_id) {
                return Err(StructuralError::UnknownTask(task_id.clone()).into());
            }
            subtree(&graph, task_id)
        };

        for id in &subtree {
            if let Some(session) = self.pool.cancel_task(id) {
                info!(task = %id, worker = %session.worker_id.short(), "worker cancelled");
            }
            self.controller.abandon_branch(id).await?;
        }

        {
            let mut graph = self.graph.write().await;
            for id in &subtree {
                let skippable = graph.get(id).is_some_and(|n| {
                    matches!(
                        n.status.kind(),
                        StatusKind::Pending | StatusKind::Running | StatusKind::Blocked
                    )
                });
                if skippable {
                    graph.set_branch(id, None)?;
                    transition(&mut graph, &self.events, id, TaskStatus::Skipped, StatusMeta::default())?;
                }
            }
        }
        info!(task = %task_id, "task cancelled");
        self.persist().await
    }

    /// Cancel every worker and return their tasks to pending.
    pub async fn stop(&mut self) -> Result<()> {
        self.stopping = true;
        for session in self.pool.cancel_all() {
            debug!(task = %session.task_id, "worker stopped");
        }
        self.recover_interrupted().await?;
        Ok(())
    }

    /// Explicitly release a blocked task back to pending.
    ///
    /// A branch preserved for a merge conflict is abandoned; the task starts
    /// over from the current main line.
    pub async fn override_blocked(&mut self, task_id: &TaskId) -> Result<()> {
        self.controller.abandon_branch(task_id).await?;
        {
            let mut graph = self.graph.write().await;
            transition(
                &mut graph,
                &self.events,
                task_id,
                TaskStatus::Pending,
                StatusMeta::with_override(),
            )?;
            graph.set_branch(task_id, None)?;
            reopen_ancestors(&mut graph, &self.events, task_id)?;
        }
        info!(task = %task_id, "blocked task overridden");
        self.persist().await
    }

    /// Try again to merge the preserved branch of a conflict-blocked task.
    pub async fn retry_merge(&mut self, task_id: &TaskId, hint: Option<&str>) -> Result<MergeResult> {
        {
            let graph = self.graph.read().await;
            let node = graph
                .get(task_id)
                .ok_or_else(|| StructuralError::UnknownTask(task_id.clone()))?;
            if node.conflict().is_none() {
                return Err(StructuralError::InvalidTransition {
                    task: task_id.clone(),
                    from: node.status.kind().to_string(),
                    to: StatusKind::Passed.to_string(),
                }
                .into());
            }
            // After a restart the preserved branch has no lease yet.
            self.controller.restore_leases(&graph).await?;
        }

        let merge = self.controller.merge_worker_branch(task_id, hint).await?;
        if merge.success || merge.conflict.is_some() {
            let mut graph = self.graph.write().await;
            transition(&mut graph, &self.events, task_id, TaskStatus::Running, StatusMeta::with_override())?;
            if merge.success {
                graph.set_branch(task_id, None)?;
                transition(&mut graph, &self.events, task_id, TaskStatus::Passed, StatusMeta::default())?;
                reopen_ancestors(&mut graph, &self.events, task_id)?;
                info!(task = %task_id, commit = ?merge.commit, "conflict resolved; task passed");
            } else if let Some(conflict) = merge.conflict.clone() {
                transition(
                    &mut graph,
                    &self.events,
                    task_id,
                    TaskStatus::blocked(BlockReason::MergeConflict { conflict }),
                    StatusMeta::default(),
                )?;
                warn!(task = %task_id, "merge still conflicts");
            }
        }
        if merge.success {
            self.passed_since_checkpoint += 1;
        }
        self.persist().await?;
        Ok(merge)
    }

    /// Requeue running leaf tasks that have no live session, without
    /// charging a retry. Used after a restart or a rewind.
    pub async fn recover_interrupted(&mut self) -> Result<usize> {
        {
            let graph = self.graph.read().await;
            self.controller.restore_leases(&graph).await?;
        }
        let orphaned: Vec<TaskId> = {
            let graph = self.graph.read().await;
            graph
                .tasks_with_status(StatusKind::Running)
                .into_iter()
                .filter(|n| !graph.is_composite(&n.id) && self.pool.for_task(&n.id).is_none())
                .map(|n| n.id.clone())
                .collect()
        };
        if orphaned.is_empty() {
            return Ok(0);
        }
        for id in &orphaned {
            self.controller.abandon_branch(id).await?;
        }
        {
            let mut graph = self.graph.write().await;
            for id in &orphaned {
                graph.set_branch(id, None)?;
                transition(&mut graph, &self.events, id, TaskStatus::Pending, StatusMeta::default())?;
            }
        }
        info!(count = orphaned.len(), "interrupted tasks requeued");
        self.persist().await?;
        Ok(orphaned.len())
    }

    // ========== Checkpoints ==========

    pub async fn checkpoint(&mut self, description: &str) -> Result<Checkpoint> {
        let manager = self.checkpoint_manager()?;
        let checkpoint = manager.create_checkpoint(description).await?;
        self.passed_since_checkpoint = 0;
        if let Some(retain) = self.config.checkpoint_retention {
            let pruned = manager.prune(retain).await?;
            if !pruned.is_empty() {
                debug!(pruned = pruned.len(), "old checkpoints pruned");
            }
        }
        Ok(checkpoint)
    }

    /// Stop all workers, rewind to `id` and requeue what was running.
    pub async fn rewind_to(&mut self, id: &CheckpointId) -> Result<Checkpoint> {
        let manager = self.checkpoint_manager()?;
        for session in self.pool.cancel_all() {
            debug!(task = %session.task_id, "worker cancelled for rewind");
        }
        let checkpoint = manager.rewind_to(id).await?;
        self.passed_since_checkpoint = 0;
        self.recover_interrupted().await?;
        Ok(checkpoint)
    }

    async fn checkpoint_if_due(&mut self) -> Result<()> {
        let every = self.config.checkpoint_every;
        if every == 0 || self.checkpoints.is_none() || self.passed_since_checkpoint < every {
            return Ok(());
        }
        self.checkpoint(&format!("after {} passed tasks", self.passed_since_checkpoint))
            .await
            .map(|_| ())
    }

    fn checkpoint_manager(&self) -> Result<Arc<CheckpointManager>> {
        self.checkpoints
            .clone()
            .ok_or_else(|| Error::Config("no checkpoint manager attached".to_string()))
    }

    async fn persist(&self) -> Result<()> {
        if let Some(store) = &self.store {
            let tree = self.graph.read().await.snapshot();
            store.save_tree(&tree)?;
        }
        Ok(())
    }
}

async fn recv_control(rx: &mut Option<mpsc::Receiver<Control>>) -> Option<Control> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Update a status and announce it.
fn transition(
    graph: &mut TaskGraph,
    events: &EventSink,
    id: &TaskId,
    status: TaskStatus,
    meta: StatusMeta,
) -> Result<()> {
    let from = graph
        .get(id)
        .map(|n| n.status.kind())
        .ok_or_else(|| StructuralError::UnknownTask(id.clone()))?;
    let to = status.kind();
    graph.update_status(id, status, meta)?;
    events.emit(SchedulerEvent::TaskStatusChanged {
        tree_id: graph.tree_id(),
        task_id: id.clone(),
        from,
        to,
    });
    Ok(())
}

/// Block every pending task downstream of `id`.
fn block_dependents(graph: &mut TaskGraph, events: &EventSink, id: &TaskId) -> Result<()> {
    for dependent in graph.transitive_dependents(id) {
        let pending = graph
            .get(&dependent)
            .is_some_and(|n| n.status.kind() == StatusKind::Pending);
        if pending {
            let reason = BlockReason::DependencyFailed {
                dependency: id.clone(),
            };
            transition(graph, events, &dependent, TaskStatus::blocked(reason), StatusMeta::default())?;
            debug!(task = %dependent, dependency = %id, "blocked by failed dependency");
        }
    }
    Ok(())
}

/// Put blocked ancestors back to running so they settle again.
fn reopen_ancestors(graph: &mut TaskGraph, events: &EventSink, id: &TaskId) -> Result<()> {
    let mut current = graph.get(id).and_then(|n| n.parent_id.clone());
    while let Some(parent) = current {
        let blocked = graph
            .get(&parent)
            .is_some_and(|n| n.status.kind() == StatusKind::Blocked);
        if blocked {
            transition(graph, events, &parent, TaskStatus::Running, StatusMeta::with_override())?;
        }
        current = graph.get(&parent).and_then(|n| n.parent_id.clone());
    }
    Ok(())
}

/// `id` and all of its descendants, parents first.
fn subtree(graph: &TaskGraph, id: &TaskId) -> Vec<TaskId> {
    let mut out = Vec::new();
    let mut queue = VecDeque::from([id.clone()]);
    while let Some(current) = queue.pop_front() {
        for child in graph.children(&current) {
            queue.push_back(child.id.clone());
        }
        out.push(current);
    }
    out
}

/// A child no longer moving on its own.
fn is_settled(node: &TaskNode) -> bool {
    node.is_terminal() || node.status.kind() == StatusKind::Blocked
}

/// Whether an unsuccessful child should block the parent's dependents.
fn propagates_failure(node: &TaskNode) -> bool {
    match &node.status {
        TaskStatus::Failed { .. } => true,
        TaskStatus::Blocked { reason } => matches!(reason, BlockReason::DependencyFailed { .. }),
        _ => false,
    }
}
