use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::core::{CheckpointId, StatusKind, TaskGraph, TaskId, TaskNode, TaskTree, TreeId};
use crate::git::CommitDiff;
use crate::git_refs::GitRefs;
use crate::orchestration::controller::ConcurrencyController;
use crate::orchestration::events::{EventSink, SchedulerEvent};
use crate::state::StateStore;
use crate::util::blocking;
use crate::{Error, Result};

/// A task whose status differs between two points in time.
///
/// `None` means the task did not exist on that side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusChange {
    pub task_id: TaskId,
    pub from: Option<StatusKind>,
    pub to: Option<StatusKind>,
}

impl std::fmt::Display for StatusChange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let side = |s: Option<StatusKind>| s.map_or_else(|| "-".to_string(), |k| k.to_string());
        write!(f, "{}: {} -> {}", self.task_id, side(self.from), side(self.to))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: CheckpointId,
    pub tree_id: TreeId,
    pub created_at: DateTime<Utc>,
    pub description: String,
    pub tree: TaskTree,
    pub main_branch: String,
    pub main_commit: String,
    /// Changes since the checkpoint the tree descended from.
    pub status_changes: Vec<StatusChange>,
    /// Branches of conflict-blocked tasks, pinned with the checkpoint.
    #[serde(default)]
    pub branch_pins: Vec<BranchPin>,
}

/// A conflict branch as it stood when a checkpoint was taken.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchPin {
    pub task_id: TaskId,
    pub branch_name: String,
    pub commit: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointDiff {
    pub from: CheckpointId,
    pub to: CheckpointId,
    pub status_changes: Vec<StatusChange>,
    pub mainline: CommitDiff,
}

impl CheckpointDiff {
    pub fn is_empty(&self) -> bool {
        self.status_changes.is_empty() && self.mainline.is_empty()
    }
}

/// Per-task status differences between two node sets, ordered by task id.
pub fn status_changes(before: &[TaskNode], after: &[TaskNode]) -> Vec<StatusChange> {
    let mut sides: BTreeMap<&TaskId, (Option<StatusKind>, Option<StatusKind>)> = BTreeMap::new();
    for node in before {
        sides.entry(&node.id).or_default().0 = Some(node.status.kind());
    }
    for node in after {
        sides.entry(&node.id).or_default().1 = Some(node.status.kind());
    }
    sides
        .into_iter()
        .filter(|(_, (from, to))| from != to)
        .map(|(id, (from, to))| StatusChange {
            task_id: id.clone(),
            from,
            to,
        })
        .collect()
}

/// Creates, compares and restores checkpoints of one task tree.
///
/// Creation and rewind hold the controller's main line lock, so neither can
/// interleave with a merge.
pub struct CheckpointManager {
    graph: Arc<RwLock<TaskGraph>>,
    controller: Arc<ConcurrencyController>,
    store: StateStore,
    refs: GitRefs,
    events: EventSink,
    branch_prefix: String,
}

impl CheckpointManager {
    pub fn new(
        graph: Arc<RwLock<TaskGraph>>,
        controller: Arc<ConcurrencyController>,
        store: StateStore,
        branch_prefix: &str,
    ) -> Result<Self> {
        let refs = GitRefs::new(controller.git_ops().repo_path())?;
        Ok(Self {
            graph,
            controller,
            store,
            refs,
            events: EventSink::disabled(),
            branch_prefix: branch_prefix.to_string(),
        })
    }

    pub fn with_events(mut self, events: EventSink) -> Self {
        self.events = events;
        self
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub async fn create_checkpoint(&self, description: &str) -> Result<Checkpoint> {
        let _lock = self.controller.lock_main().await;
        let main_commit = self.controller.main_position()?;
        let mut graph = self.graph.write().await;
        let tree = graph.snapshot();

        let previous = match graph.head_checkpoint() {
            Some(id) => match self.store.load_checkpoint(&id) {
                Ok(checkpoint) => Some(checkpoint),
                Err(Error::CheckpointNotFound(_)) => None,
                Err(e) => return Err(e),
            },
            None => None,
        };
        let changes = match &previous {
            Some(previous) => status_changes(&previous.tree.nodes, &tree.nodes),
            None => status_changes(&pending_baseline(&tree.nodes), &tree.nodes),
        };

        let branch_pins: Vec<BranchPin> = tree
            .nodes
            .iter()
            .filter_map(|node| {
                node.conflict().map(|conflict| BranchPin {
                    task_id: node.id.clone(),
                    branch_name: conflict.branch_name.clone(),
                    commit: conflict.branch_commit.clone(),
                })
            })
            .collect();

        let checkpoint = Checkpoint {
            id: CheckpointId::new(),
            tree_id: tree.id,
            created_at: Utc::now(),
            description: description.to_string(),
            main_branch: tree.main_branch.clone(),
            main_commit,
            status_changes: changes,
            branch_pins,
            tree,
        };
        self.pin(&checkpoint).await?;
        self.store.save_checkpoint(&checkpoint)?;
        graph.record_checkpoint(checkpoint.id);
        self.store.save_tree(&graph.snapshot())?;
        drop(graph);

        info!(
            checkpoint = %checkpoint.id.short(),
            commit = %checkpoint.main_commit,
            changes = checkpoint.status_changes.len(),
            "checkpoint created"
        );
        self.events.emit(SchedulerEvent::CheckpointCreated {
            tree_id: checkpoint.tree_id,
            checkpoint_id: checkpoint.id,
            description: checkpoint.description.clone(),
        });
        Ok(checkpoint)
    }

    pub fn list_checkpoints(&self, tree_id: &TreeId) -> Result<Vec<Checkpoint>> {
        self.store.list_checkpoints(tree_id)
    }

    pub fn diff(&self, from: &CheckpointId, to: &CheckpointId) -> Result<CheckpointDiff> {
        let a = self.store.load_checkpoint(from)?;
        let b = self.store.load_checkpoint(to)?;
        Ok(CheckpointDiff {
            from: a.id,
            to: b.id,
            status_changes: status_changes(&a.tree.nodes, &b.tree.nodes),
            mainline: self
                .controller
                .diff_positions(&a.main_commit, &b.main_commit)?,
        })
    }

    /// Restore the tree and its main line to `id`.
    ///
    /// Branches are abandoned unless the snapshot keeps them for a
    /// conflict-blocked task. Pinned conflict branches that were merged,
    /// abandoned or reused since are put back at their pinned commit and
    /// re-leased. Checkpoints taken after `id` stay listed on the tree.
    /// Callers must stop their workers first.
    pub async fn rewind_to(&self, id: &CheckpointId) -> Result<Checkpoint> {
        let checkpoint = self.store.load_checkpoint(id)?;
        let lock = self.controller.lock_main().await;
        let mut graph = self.graph.write().await;
        if checkpoint.tree_id != graph.tree_id() {
            return Err(Error::ForeignCheckpoint {
                checkpoint: checkpoint.id.to_string(),
                tree: checkpoint.tree_id.to_string(),
            });
        }

        let (commit, pins) = self.pinned_state(&checkpoint).await?;
        let mut tree = checkpoint.tree.clone();
        tree.checkpoint_ids = graph.checkpoint_ids().to_vec();
        tree.head_checkpoint = Some(checkpoint.id);
        let restored = TaskGraph::from_tree(tree)?;

        // A kept branch must still be the one the snapshot saw.
        let git = self.controller.git_ops().clone();
        let expected = pins.clone();
        let intact: HashSet<TaskId> = blocking(move || {
            let mut intact = HashSet::new();
            for (task_id, (branch, commit)) in expected {
                if git.branch_tip(&branch)?.as_deref() == Some(commit.as_str()) {
                    intact.insert(task_id);
                }
            }
            Ok(intact)
        })
        .await?;
        let keep: HashSet<TaskId> = checkpoint
            .tree
            .nodes
            .iter()
            .filter(|n| n.conflict().is_some())
            .filter(|n| !pins.contains_key(&n.id) || intact.contains(&n.id))
            .map(|n| n.id.clone())
            .collect();
        let abandoned = self.controller.abandon_all_except(&keep).await?;
        self.controller.reset_main(&lock, &commit).await?;
        for (task_id, (branch, pinned)) in &pins {
            if self.controller.restore_branch(branch, pinned).await? {
                debug!(task = %task_id, branch = %branch, "conflict branch restored");
            }
        }
        *graph = restored;
        self.controller.restore_leases(&graph).await?;
        self.store.save_tree(&graph.snapshot())?;

        info!(
            checkpoint = %checkpoint.id.short(),
            commit = %commit,
            abandoned = abandoned.len(),
            "rewound"
        );
        Ok(checkpoint)
    }

    /// Start a new tree from checkpoint `id` on its own main line branch.
    ///
    /// The original tree and main line are untouched. The new tree gets an
    /// initial checkpoint identical in content to `id`.
    pub async fn branch_from(&self, id: &CheckpointId) -> Result<(TaskGraph, Checkpoint)> {
        let source = self.store.load_checkpoint(id)?;
        let tree_id = TreeId::new();
        let main_branch = format!("{}/trees/{}", self.branch_prefix, tree_id.short());
        self.controller
            .create_main_line(&main_branch, &source.main_commit)
            .await?;

        let mut tree = source.tree.clone();
        tree.id = tree_id;
        tree.main_branch = main_branch.clone();
        tree.created_at = Utc::now();
        tree.checkpoint_ids.clear();
        tree.head_checkpoint = None;
        for node in &mut tree.nodes {
            node.branch_name = None;
            node.worker_id = None;
        }
        let mut graph = TaskGraph::from_tree(tree)?;

        let checkpoint = Checkpoint {
            id: CheckpointId::new(),
            tree_id,
            created_at: Utc::now(),
            description: format!("branched from {}", source.id.short()),
            tree: graph.snapshot(),
            main_branch,
            main_commit: source.main_commit.clone(),
            status_changes: Vec::new(),
            branch_pins: Vec::new(),
        };
        self.pin(&checkpoint).await?;
        self.store.save_checkpoint(&checkpoint)?;
        graph.record_checkpoint(checkpoint.id);
        self.store.save_tree(&graph.snapshot())?;

        info!(
            source = %source.id.short(),
            tree = %tree_id.short(),
            main = %checkpoint.main_branch,
            "branched"
        );
        self.events.emit(SchedulerEvent::CheckpointCreated {
            tree_id,
            checkpoint_id: checkpoint.id,
            description: checkpoint.description.clone(),
        });
        Ok((graph, checkpoint))
    }

    /// Keep the newest `retain` checkpoints of the tree; delete the rest.
    pub async fn prune(&self, retain: usize) -> Result<Vec<CheckpointId>> {
        if retain == 0 {
            return Err(Error::Config(
                "checkpoint retention must keep at least one checkpoint".to_string(),
            ));
        }
        let mut graph = self.graph.write().await;
        let checkpoints = self.store.list_checkpoints(&graph.tree_id())?;
        let excess = checkpoints.len().saturating_sub(retain);
        let removed: Vec<CheckpointId> = checkpoints[..excess].iter().map(|c| c.id).collect();
        for id in &removed {
            let (refs, pinned) = (self.refs.clone(), *id);
            blocking(move || {
                refs.unpin_checkpoint(&pinned)?;
                refs.unpin_branches(&pinned).map(|_| ())
            })
            .await?;
            self.store.delete_checkpoint(id)?;
        }
        if !removed.is_empty() {
            graph.forget_checkpoints(&removed);
            self.store.save_tree(&graph.snapshot())?;
            debug!(removed = removed.len(), retain, "checkpoints pruned");
        }
        Ok(removed)
    }

    /// Pin the checkpoint's main line commit and its conflict branches.
    async fn pin(&self, checkpoint: &Checkpoint) -> Result<()> {
        let refs = self.refs.clone();
        let id = checkpoint.id;
        let main_commit = checkpoint.main_commit.clone();
        let branches: Vec<String> = checkpoint.branch_pins.iter().map(|p| p.commit.clone()).collect();
        blocking(move || {
            refs.pin_checkpoint(&id, &main_commit)?;
            for (slot, commit) in branches.iter().enumerate() {
                refs.pin_branch(&id, slot, commit)?;
            }
            Ok(())
        })
        .await
    }

    /// Main line commit and conflict branch tips to restore, preferring
    /// the pinned refs over the recorded values.
    async fn pinned_state(&self, checkpoint: &Checkpoint) -> Result<(String, HashMap<TaskId, (String, String)>)> {
        let refs = self.refs.clone();
        let id = checkpoint.id;
        let main_commit = checkpoint.main_commit.clone();
        let pins = checkpoint.branch_pins.clone();
        blocking(move || {
            let commit = refs.checkpoint_commit(&id)?.unwrap_or(main_commit);
            let mut branches = HashMap::new();
            for (slot, pin) in pins.into_iter().enumerate() {
                let tip = refs.pinned_branch(&id, slot)?.unwrap_or(pin.commit);
                branches.insert(pin.task_id, (pin.branch_name, tip));
            }
            Ok((commit, branches))
        })
        .await
    }
}

/// The same nodes, all pending: the state of a freshly planned tree.
fn pending_baseline(nodes: &[TaskNode]) -> Vec<TaskNode> {
    nodes
        .iter()
        .map(|n| {
            let mut node = TaskNode::new(n.id.clone(), &n.name);
            node.seq = n.seq;
            node
        })
        .collect()
}
