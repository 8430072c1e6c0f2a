//! Test fixtures for integration tests.
//!
//! Provides helpers for:
//! - Creating temporary git repositories
//! - Scripted workers
//! - Wiring a scheduler with its controller, store and checkpoints

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use git2::Repository;
use tempfile::TempDir;
use tokio::sync::RwLock;

use braid::checkpoint::CheckpointManager;
use braid::core::{TaskGraph, TaskId, TaskNode};
use braid::git::GitOps;
use braid::orchestration::{
    ConcurrencyController, ControllerConfig, Resolution, ResolutionRequest, Scheduler,
    SchedulerConfig, TaskContext, TaskResult, WorkerExecutor,
};
use braid::state::StateStore;
use braid::Result;

/// A test repository with a temporary directory and an initial commit.
pub struct TestRepo {
    pub temp_dir: TempDir,
    pub path: PathBuf,
}

impl TestRepo {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let path = temp_dir.path().to_path_buf();

        let repo = Repository::init(&path).expect("Failed to init git");
        let mut config = repo.config().unwrap();
        config.set_str("user.name", "Test User").unwrap();
        config.set_str("user.email", "test@test.com").unwrap();

        fs::write(path.join("README.md"), "# Test Repository\n").unwrap();
        let mut index = repo.index().unwrap();
        index.add_path(Path::new("README.md")).unwrap();
        index.write().unwrap();
        let tree = repo.find_tree(index.write_tree().unwrap()).unwrap();
        let sig = repo.signature().unwrap();
        repo.commit(Some("HEAD"), &sig, &sig, "Initial commit", &tree, &[])
            .unwrap();

        Self { temp_dir, path }
    }

    pub fn git_ops(&self) -> GitOps {
        GitOps::new(&self.path).unwrap()
    }

    pub fn main_branch(&self) -> String {
        self.git_ops().current_branch().unwrap()
    }

    pub fn tip(&self, branch: &str) -> String {
        self.git_ops().branch_tip(branch).unwrap().unwrap()
    }

    /// Content of `path` at the tip of `branch`.
    pub fn read_on(&self, branch: &str, path: &str) -> Option<String> {
        let git = self.git_ops();
        git.file_at(&self.tip(branch), Path::new(path)).unwrap()
    }
}

type Behavior = dyn Fn(&TaskNode, u32) -> TaskResult + Send + Sync;
type Resolver = dyn Fn(&ResolutionRequest) -> Resolution + Send + Sync;

/// In-process worker driven by a closure of (task, attempt number).
pub struct ScriptedWorker {
    behavior: Box<Behavior>,
    resolver: Option<Box<Resolver>>,
    delay: Duration,
    attempt_delays: HashMap<u32, Duration>,
    attempts: Mutex<HashMap<String, u32>>,
    calls: Mutex<Vec<String>>,
    hints: Mutex<Vec<(String, Option<String>)>>,
}

impl ScriptedWorker {
    pub fn new(behavior: impl Fn(&TaskNode, u32) -> TaskResult + Send + Sync + 'static) -> Self {
        Self {
            behavior: Box::new(behavior),
            resolver: None,
            delay: Duration::ZERO,
            attempt_delays: HashMap::new(),
            attempts: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            hints: Mutex::new(Vec::new()),
        }
    }

    /// Every task writes `<id>.txt` and succeeds.
    pub fn writes_own_file() -> Self {
        Self::new(|task, _| TaskResult::success().writes(&format!("{}.txt", task.id), "done\n"))
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Sleep `delay` on the given attempt only (attempts count from 1).
    pub fn with_delay_on_attempt(mut self, attempt: u32, delay: Duration) -> Self {
        self.attempt_delays.insert(attempt, delay);
        self
    }

    /// Answer conflict resolution requests with `resolver`.
    pub fn with_resolver(
        mut self,
        resolver: impl Fn(&ResolutionRequest) -> Resolution + Send + Sync + 'static,
    ) -> Self {
        self.resolver = Some(Box::new(resolver));
        self
    }

    /// Task ids in the order attempts started.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn attempts(&self, task: &str) -> u32 {
        self.attempts.lock().unwrap().get(task).copied().unwrap_or(0)
    }

    pub fn hints_for(&self, task: &str) -> Vec<Option<String>> {
        self.hints
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _)| id == task)
            .map(|(_, hint)| hint.clone())
            .collect()
    }
}

#[async_trait]
impl WorkerExecutor for ScriptedWorker {
    async fn execute(&self, task: &TaskNode, ctx: TaskContext) -> Result<TaskResult> {
        let attempt = {
            let mut attempts = self.attempts.lock().unwrap();
            let count = attempts.entry(task.id.to_string()).or_insert(0);
            *count += 1;
            *count
        };
        self.calls.lock().unwrap().push(task.id.to_string());
        self.hints
            .lock()
            .unwrap()
            .push((task.id.to_string(), ctx.hint.clone()));
        let delay = self.attempt_delays.get(&attempt).copied().unwrap_or(self.delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        Ok((self.behavior)(task, attempt))
    }

    async fn resolve_conflict(&self, request: &ResolutionRequest) -> Result<Resolution> {
        Ok(match &self.resolver {
            Some(resolver) => resolver(request),
            None => Resolution::Declined {
                reason: "no resolver scripted".to_string(),
            },
        })
    }
}

/// A repository plus everything a scheduler needs for one tree.
pub struct Harness {
    pub repo: TestRepo,
    pub worktrees: TempDir,
    pub state: TempDir,
    pub graph: Arc<RwLock<TaskGraph>>,
    pub controller: Arc<ConcurrencyController>,
    pub store: StateStore,
    pub checkpoints: Arc<CheckpointManager>,
}

impl Harness {
    /// Build a tree from `(task, parent)` pairs on the repository's main line.
    pub fn new(tasks: Vec<(TaskNode, Option<&str>)>) -> Self {
        Self::build(tasks, None)
    }

    /// Like [`Harness::new`], with `resolver` answering merge conflicts.
    pub fn with_resolver(tasks: Vec<(TaskNode, Option<&str>)>, resolver: Arc<ScriptedWorker>) -> Self {
        Self::build(tasks, Some(resolver))
    }

    fn build(tasks: Vec<(TaskNode, Option<&str>)>, resolver: Option<Arc<ScriptedWorker>>) -> Self {
        let repo = TestRepo::new();
        let mut graph = TaskGraph::new("integration", &repo.main_branch());
        for (node, parent) in tasks {
            graph.add_task(node, parent.map(TaskId::from)).unwrap();
        }

        let worktrees = TempDir::new().unwrap();
        let state = TempDir::new().unwrap();
        let mut controller = ConcurrencyController::new(
            &repo.path,
            ControllerConfig {
                tree_id: graph.tree_id(),
                main_branch: graph.main_branch().to_string(),
                branch_prefix: "braid".to_string(),
                worktree_dir: worktrees.path().to_path_buf(),
            },
        )
        .unwrap();
        if let Some(resolver) = resolver {
            controller = controller.with_conflict_delegate(resolver, Duration::from_secs(30));
        }
        let controller = Arc::new(controller);
        let store = StateStore::new(state.path());
        let graph = Arc::new(RwLock::new(graph));
        let checkpoints = Arc::new(
            CheckpointManager::new(graph.clone(), controller.clone(), store.clone(), "braid")
                .unwrap(),
        );

        Self {
            repo,
            worktrees,
            state,
            graph,
            controller,
            store,
            checkpoints,
        }
    }

    pub fn main_branch(&self) -> String {
        self.controller.main_branch().to_string()
    }

    pub fn scheduler(&self, worker: Arc<ScriptedWorker>, max_parallel: usize) -> Scheduler {
        self.scheduler_with(
            worker,
            SchedulerConfig {
                max_parallel,
                task_timeout: Duration::from_secs(30),
                checkpoint_every: 0,
                checkpoint_before_complex: false,
                ..SchedulerConfig::default()
            },
        )
    }

    pub fn scheduler_with(&self, worker: Arc<ScriptedWorker>, config: SchedulerConfig) -> Scheduler {
        Scheduler::new(self.graph.clone(), self.controller.clone(), worker, config)
            .with_store(self.store.clone())
            .with_checkpoints(self.checkpoints.clone())
    }
}
