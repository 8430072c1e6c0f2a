use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::sync::RwLock;
use tracing::{info, warn};

use braid::checkpoint::{Checkpoint, CheckpointManager};
use braid::config::Config;
use braid::core::{TaskGraph, TaskId, TaskTree};
use braid::git::GitOps;
use braid::orchestration::{
    CommandExecutor, ConcurrencyController, ControllerConfig, Scheduler, SchedulerConfig,
    StatusReport, WorkerExecutor,
};
use braid::plan::Plan;
use braid::state::StateStore;
use braid::{Error, Result};

/// braid - run a dependency graph of coding tasks on parallel git branches
#[derive(Parser, Debug)]
#[command(name = "braid")]
#[command(version, about, long_about = None)]
#[command(after_help = "ENVIRONMENT:\n    BRAID_DEBUG=1   Enable debug logging (alternative to --debug)\n    BRAID_LOG       Log filter directive, e.g. braid::orchestration=trace")]
pub struct Cli {
    /// Enable debug logging (writes to ~/.braid/braid.log)
    #[arg(short = 'd', long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Build a task tree from a plan file and run it
    Run {
        /// Path to the TOML plan
        plan: PathBuf,

        /// Print the final status as JSON
        #[arg(long)]
        json: bool,
    },

    /// Continue running a saved tree
    Resume {
        /// Tree ID or unique prefix
        tree: String,

        #[arg(long)]
        json: bool,
    },

    /// Show the status of a tree
    Status {
        tree: String,

        #[arg(long)]
        json: bool,
    },

    /// List saved trees
    Trees,

    /// Take a checkpoint of a tree
    Checkpoint {
        tree: String,

        /// Checkpoint description
        #[arg(short = 'm', long = "message", default_value = "manual checkpoint")]
        message: String,
    },

    /// List a tree's checkpoints, oldest first
    Checkpoints { tree: String },

    /// Compare two checkpoints
    Diff {
        from: String,
        to: String,

        /// Include the main line patch
        #[arg(long)]
        patch: bool,
    },

    /// Restore a tree and its main line to a checkpoint
    Rewind { checkpoint: String },

    /// Start a new tree from a checkpoint on its own main line
    Branch { checkpoint: String },

    /// Delete all but the newest checkpoints of a tree
    Prune {
        tree: String,

        /// Checkpoints to keep
        #[arg(long, default_value_t = 5)]
        keep: usize,
    },

    /// Release a blocked task back to pending
    Override { tree: String, task: String },

    /// Merge a conflict-blocked task's branch again
    Retry {
        tree: String,
        task: String,

        /// Guidance for automatic conflict resolution
        #[arg(long)]
        hint: Option<String>,
    },

    /// Cancel a task and skip its unfinished subtree
    Cancel { tree: String, task: String },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    braid::log::init_with_debug(cli.debug);
    if cli.debug {
        if let Some(path) = braid::log::log_path() {
            eprintln!("Logging to {}", path.display());
        }
    }

    let workspace = Workspace::open()?;
    let rt = tokio::runtime::Runtime::new()?;

    match cli.command {
        Command::Run { plan, json } => rt.block_on(run_plan(&workspace, &plan, json)),
        Command::Resume { tree, json } => {
            let tree = workspace.store.find_tree(&tree)?;
            rt.block_on(execute(&workspace, tree, json))
        }
        Command::Status { tree, json } => show_status(&workspace.store.find_tree(&tree)?, json),
        Command::Trees => list_trees(&workspace),
        Command::Checkpoint { tree, message } => {
            let tree = workspace.store.find_tree(&tree)?;
            rt.block_on(async {
                let checkpoint = workspace.engine(tree, None)?.checkpoints.create_checkpoint(&message).await?;
                print_checkpoint(&checkpoint);
                Ok::<(), Error>(())
            })
        }
        Command::Checkpoints { tree } => {
            let tree = workspace.store.find_tree(&tree)?;
            for checkpoint in workspace.store.list_checkpoints(&tree.id)? {
                print_checkpoint(&checkpoint);
            }
            Ok(())
        }
        Command::Diff { from, to, patch } => show_diff(&workspace, &from, &to, patch),
        Command::Rewind { checkpoint } => rt.block_on(rewind(&workspace, &checkpoint)),
        Command::Branch { checkpoint } => rt.block_on(branch(&workspace, &checkpoint)),
        Command::Prune { tree, keep } => {
            let tree = workspace.store.find_tree(&tree)?;
            rt.block_on(async {
                let removed = workspace.engine(tree, None)?.checkpoints.prune(keep).await?;
                println!("Removed {} checkpoint(s)", removed.len());
                Ok::<(), Error>(())
            })
        }
        Command::Override { tree, task } => rt.block_on(async {
            let mut scheduler = workspace.scheduler(workspace.store.find_tree(&tree)?)?;
            scheduler.override_blocked(&TaskId::from(task.as_str())).await?;
            println!("Task {} released", task);
            Ok::<(), Error>(())
        }),
        Command::Retry { tree, task, hint } => rt.block_on(async {
            let mut scheduler = workspace.scheduler(workspace.store.find_tree(&tree)?)?;
            let merge = scheduler
                .retry_merge(&TaskId::from(task.as_str()), hint.as_deref())
                .await?;
            match (&merge.commit, &merge.conflict) {
                (Some(commit), _) => println!("Task {} merged at {}", task, commit),
                (None, Some(conflict)) => println!("Still conflicting: {}", conflict.summary()),
                (None, None) => println!("Merge of {} did not complete", task),
            }
            Ok::<(), Error>(())
        }),
        Command::Cancel { tree, task } => rt.block_on(async {
            let mut scheduler = workspace.scheduler(workspace.store.find_tree(&tree)?)?;
            scheduler.cancel(&TaskId::from(task.as_str())).await?;
            println!("Task {} cancelled", task);
            Ok::<(), Error>(())
        }),
    }
}

/// The repository, its effective config and the state store.
struct Workspace {
    repo: PathBuf,
    config: Config,
    store: StateStore,
}

/// Shared handles for one tree.
struct Engine {
    graph: Arc<RwLock<TaskGraph>>,
    controller: Arc<ConcurrencyController>,
    checkpoints: Arc<CheckpointManager>,
}

impl Workspace {
    fn open() -> Result<Self> {
        let repo = std::env::current_dir()?;
        GitOps::new(&repo)?;
        let config = Config::load_for_repo(&repo)?;
        config.ensure_dirs()?;
        let store = StateStore::new(&config.state_dir()?);
        Ok(Self {
            repo,
            config,
            store,
        })
    }

    fn main_branch(&self) -> Result<String> {
        match &self.config.main_branch {
            Some(branch) => Ok(branch.clone()),
            None => GitOps::new(&self.repo)?.current_branch(),
        }
    }

    fn executor(&self) -> Result<Arc<CommandExecutor>> {
        Ok(Arc::new(CommandExecutor::from_config(&self.config)?))
    }

    fn engine(&self, tree: TaskTree, executor: Option<Arc<CommandExecutor>>) -> Result<Engine> {
        let graph = TaskGraph::from_tree(tree)?;
        let mut controller = ConcurrencyController::new(
            &self.repo,
            ControllerConfig {
                tree_id: graph.tree_id(),
                main_branch: graph.main_branch().to_string(),
                branch_prefix: self.config.branch_prefix.clone(),
                worktree_dir: self.config.worktrees_dir()?,
            },
        )?;
        if let Some(executor) = executor.filter(|_| self.config.auto_resolve) {
            controller = controller.with_conflict_delegate(executor, self.config.task_timeout());
        }

        let graph = Arc::new(RwLock::new(graph));
        let controller = Arc::new(controller);
        let checkpoints = Arc::new(CheckpointManager::new(
            graph.clone(),
            controller.clone(),
            self.store.clone(),
            &self.config.branch_prefix,
        )?);
        Ok(Engine {
            graph,
            controller,
            checkpoints,
        })
    }

    fn scheduler(&self, tree: TaskTree) -> Result<Scheduler> {
        let executor = self.executor()?;
        let engine = self.engine(tree, Some(executor.clone()))?;
        let worker: Arc<dyn WorkerExecutor> = executor;
        Ok(Scheduler::new(
            engine.graph,
            engine.controller,
            worker,
            SchedulerConfig::from(&self.config),
        )
        .with_store(self.store.clone())
        .with_checkpoints(engine.checkpoints))
    }
}

async fn run_plan(workspace: &Workspace, path: &Path, json: bool) -> Result<()> {
    let plan = Plan::load(path)?;
    let graph = plan.build(&workspace.main_branch()?, workspace.config.max_retries)?;
    let tree = graph.snapshot();
    workspace.store.save_tree(&tree)?;
    info!(tree = %tree.id.short(), blueprint = %tree.blueprint_id, tasks = tree.nodes.len(), "tree planned");
    if !json {
        println!("Tree {} ({} tasks) on {}", tree.id.short(), tree.nodes.len(), tree.main_branch);
    }
    execute(workspace, tree, json).await
}

async fn execute(workspace: &Workspace, tree: TaskTree, json: bool) -> Result<()> {
    let mut scheduler = workspace.scheduler(tree)?;
    let handle = scheduler.handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; stopping workers");
            let _ = handle.stop().await;
        }
    });

    let report = scheduler.run().await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }
    Ok(())
}

async fn rewind(workspace: &Workspace, prefix: &str) -> Result<()> {
    let checkpoint = workspace.store.find_checkpoint(prefix)?;
    let tree = workspace.store.load_tree(&checkpoint.tree_id)?;
    let engine = workspace.engine(tree, None)?;
    engine.checkpoints.rewind_to(&checkpoint.id).await?;
    let graph = engine.graph.read().await;
    println!(
        "Tree {} rewound to {} ({})",
        graph.tree_id().short(),
        checkpoint.id.short(),
        graph.status()
    );
    Ok(())
}

async fn branch(workspace: &Workspace, prefix: &str) -> Result<()> {
    let source = workspace.store.find_checkpoint(prefix)?;
    let tree = workspace.store.load_tree(&source.tree_id)?;
    let engine = workspace.engine(tree, None)?;
    let (graph, initial) = engine.checkpoints.branch_from(&source.id).await?;
    println!(
        "Tree {} on {} (initial checkpoint {})",
        graph.tree_id().short(),
        graph.main_branch(),
        initial.id.short()
    );
    Ok(())
}

fn show_diff(workspace: &Workspace, from: &str, to: &str, patch: bool) -> Result<()> {
    let a = workspace.store.find_checkpoint(from)?;
    let b = workspace.store.find_checkpoint(to)?;
    let tree = workspace.store.load_tree(&a.tree_id)?;
    let engine = workspace.engine(tree, None)?;
    let diff = engine.checkpoints.diff(&a.id, &b.id)?;
    if diff.is_empty() {
        println!("No differences");
        return Ok(());
    }
    for change in &diff.status_changes {
        println!("  {}", change);
    }
    for file in &diff.mainline.files {
        println!("  {:?} {} (+{} -{})", file.kind, file.path.display(), file.insertions, file.deletions);
    }
    if patch {
        println!("{}", diff.mainline.patch);
    }
    Ok(())
}

fn show_status(tree: &TaskTree, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(tree)?);
        return Ok(());
    }
    println!("Tree {} [{}] {}", tree.id.short(), tree.blueprint_id, tree.status);
    println!("  Main line: {}", tree.main_branch);
    println!(
        "  Progress:  {}/{} ({:.0}%)",
        tree.stats.passed + tree.stats.skipped,
        tree.stats.total,
        tree.stats.progress() * 100.0
    );
    for node in &tree.nodes {
        let indent = "  ".repeat(node.depth as usize);
        print!("  {}{} {} ({})", indent, node.status.kind(), node.id, node.name);
        if node.retry_count > 0 {
            print!(" retries {}/{}", node.retry_count, node.max_retries);
        }
        match node.blocking_reason() {
            Some(reason) => println!(" - {}", reason),
            None => println!(),
        }
    }
    Ok(())
}

fn list_trees(workspace: &Workspace) -> Result<()> {
    let trees = workspace.store.list_trees()?;
    if trees.is_empty() {
        println!("No trees");
        return Ok(());
    }
    for tree in trees {
        println!(
            "{}  {:<10} {:<20} {}  {}",
            tree.id.short(),
            tree.status.to_string(),
            tree.blueprint_id,
            tree.main_branch,
            tree.created_at.format("%Y-%m-%d %H:%M:%S UTC")
        );
    }
    Ok(())
}

fn print_checkpoint(checkpoint: &Checkpoint) {
    println!(
        "{}  {}  {}  {} change(s)  {}",
        checkpoint.id.short(),
        checkpoint.created_at.format("%Y-%m-%d %H:%M:%S UTC"),
        &checkpoint.main_commit[..checkpoint.main_commit.len().min(8)],
        checkpoint.status_changes.len(),
        checkpoint.description
    );
}

fn print_report(report: &StatusReport) {
    println!();
    println!("Tree {} {}", report.tree_id.short(), report.tree_status);
    println!(
        "  passed {}  failed {}  blocked {}  skipped {}  pending {}",
        report.stats.passed,
        report.stats.failed,
        report.stats.blocked,
        report.stats.skipped,
        report.stats.pending
    );
    for task in report.tasks.iter().filter(|t| t.blocking_reason.is_some() || t.last_error.is_some()) {
        let detail = task
            .blocking_reason
            .as_deref()
            .or(task.last_error.as_deref())
            .unwrap_or_default();
        println!("  {} {}: {}", task.status, task.id, detail);
    }
}
