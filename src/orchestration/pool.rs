//! Worker session pool.
//!
//! The `WorkerPool` tracks one session per running leaf task and enforces
//! the parallelism budget. Each session carries the cancellation token
//! handed to its executor. Sessions are discarded as soon as their task's
//! branch is merged or abandoned.

use std::collections::HashMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::core::{TaskId, WorkerId};
use crate::error::{Error, Result};
use crate::orchestration::executor::TaskResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Running,
    /// Work is committed and waiting in the merge queue.
    Merging,
    Paused,
    Error,
}

/// A worker bound to one task and one branch.
#[derive(Debug, Clone)]
pub struct WorkerSession {
    pub worker_id: WorkerId,
    pub task_id: TaskId,
    pub branch_name: String,
    pub working_dir: PathBuf,
    pub state: SessionState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub error_count: u32,
    pub cancel: CancellationToken,
}

impl WorkerSession {
    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            worker_id: self.worker_id,
            task_id: self.task_id.clone(),
            branch_name: self.branch_name.clone(),
            state: self.state,
            created_at: self.created_at,
            error_count: self.error_count,
        }
    }
}

/// Serializable view of a session for status reports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub worker_id: WorkerId,
    pub task_id: TaskId,
    pub branch_name: String,
    pub state: SessionState,
    pub created_at: DateTime<Utc>,
    pub error_count: u32,
}

/// Sent by a dispatched worker when its attempt ends.
#[derive(Debug)]
pub struct WorkerEvent {
    pub worker_id: WorkerId,
    pub task_id: TaskId,
    pub outcome: Result<TaskResult>,
}

pub struct WorkerPool {
    sessions: HashMap<WorkerId, WorkerSession>,
    by_task: HashMap<TaskId, WorkerId>,
    max_concurrent: usize,
}

impl WorkerPool {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            sessions: HashMap::new(),
            by_task: HashMap::new(),
            max_concurrent,
        }
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    pub fn active_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn has_capacity(&self) -> bool {
        self.sessions.len() < self.max_concurrent
    }

    /// Open a running session for `task_id`.
    ///
    /// A task never has two sessions; starting one for a task that already
    /// has a session is a contract error.
    pub fn start(&mut self, task_id: &TaskId, branch_name: &str, working_dir: PathBuf) -> Result<WorkerSession> {
        if !self.has_capacity() {
            return Err(Error::PoolFull {
                max: self.max_concurrent,
            });
        }
        if self.by_task.contains_key(task_id) {
            return Err(Error::Contract(format!("task {} already has a worker", task_id)));
        }
        let now = Utc::now();
        let session = WorkerSession {
            worker_id: WorkerId::new(),
            task_id: task_id.clone(),
            branch_name: branch_name.to_string(),
            working_dir,
            state: SessionState::Running,
            created_at: now,
            updated_at: now,
            error_count: 0,
            cancel: CancellationToken::new(),
        };
        self.by_task.insert(task_id.clone(), session.worker_id);
        self.sessions.insert(session.worker_id, session.clone());
        Ok(session)
    }

    pub fn get(&self, worker_id: &WorkerId) -> Option<&WorkerSession> {
        self.sessions.get(worker_id)
    }

    pub fn for_task(&self, task_id: &TaskId) -> Option<&WorkerSession> {
        self.by_task.get(task_id).and_then(|w| self.sessions.get(w))
    }

    /// Whether `worker_id` is still the live session of `task_id`.
    pub fn is_current(&self, worker_id: &WorkerId, task_id: &TaskId) -> bool {
        self.by_task.get(task_id) == Some(worker_id)
    }

    pub fn set_state(&mut self, worker_id: &WorkerId, state: SessionState) {
        if let Some(session) = self.sessions.get_mut(worker_id) {
            session.state = state;
            session.updated_at = Utc::now();
        }
    }

    pub fn record_error(&mut self, worker_id: &WorkerId) {
        if let Some(session) = self.sessions.get_mut(worker_id) {
            session.error_count += 1;
            session.state = SessionState::Error;
            session.updated_at = Utc::now();
        }
    }

    /// Remove a session once its branch is merged or abandoned.
    pub fn finish(&mut self, worker_id: &WorkerId) -> Option<WorkerSession> {
        let session = self.sessions.remove(worker_id)?;
        self.by_task.remove(&session.task_id);
        Some(session)
    }

    /// Cancel and remove the session working on `task_id`.
    pub fn cancel_task(&mut self, task_id: &TaskId) -> Option<WorkerSession> {
        let worker_id = self.by_task.get(task_id).copied()?;
        let session = self.finish(&worker_id)?;
        session.cancel.cancel();
        Some(session)
    }

    pub fn cancel_all(&mut self) -> Vec<WorkerSession> {
        let tasks: Vec<TaskId> = self.by_task.keys().cloned().collect();
        tasks.iter().filter_map(|t| self.cancel_task(t)).collect()
    }

    /// Mark every running session paused (or back to running).
    pub fn set_paused(&mut self, paused: bool) {
        let (from, to) = if paused {
            (SessionState::Running, SessionState::Paused)
        } else {
            (SessionState::Paused, SessionState::Running)
        };
        for session in self.sessions.values_mut().filter(|s| s.state == from) {
            session.state = to;
            session.updated_at = Utc::now();
        }
    }

    pub fn sessions(&self) -> Vec<SessionInfo> {
        let mut infos: Vec<SessionInfo> = self.sessions.values().map(WorkerSession::info).collect();
        infos.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        infos
    }
}
