//! Task graph store.
//!
//! `TaskGraph` owns every node of one task tree. Nodes live in a petgraph
//! `StableDiGraph` arena with a `TaskId -> NodeIndex` index on the side.
//! Two kinds of edges are kept:
//!
//! - dependency edges point from a dependency to its dependent;
//! - hierarchy edges point from a child to its parent (the parent settles
//!   after its children).
//!
//! Cycle checks run over both kinds, so a child can never wait on its own
//! ancestor and a tree can never deadlock on its hierarchy. The ready set
//! is derived on demand and never stored.

use crate::core::ids::{CheckpointId, TreeId, WorkerId};
use crate::core::task::{Artifact, StatusKind, TaskId, TaskNode, TaskStatus};
use crate::core::tree::{TaskTree, TreeStats, TreeStatus};
use crate::error::{Result, StructuralError};
use chrono::{DateTime, Utc};
use petgraph::algo::{has_path_connecting, toposort};
use petgraph::stable_graph::{NodeIndex, StableDiGraph};
use petgraph::visit::EdgeRef;
use petgraph::Direction;
use std::collections::{HashMap, HashSet, VecDeque};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EdgeKind {
    Dependency,
    Hierarchy,
}

/// Extra information attached to a status change.
#[derive(Debug, Clone, Default)]
pub struct StatusMeta {
    /// Worker taking the task when moving to running.
    pub worker_id: Option<WorkerId>,
    /// Allows leaving the blocked state.
    pub allow_override: bool,
}

impl StatusMeta {
    pub fn worker(worker_id: WorkerId) -> Self {
        Self {
            worker_id: Some(worker_id),
            allow_override: false,
        }
    }

    pub fn with_override() -> Self {
        Self {
            worker_id: None,
            allow_override: true,
        }
    }
}

/// The task tree as a mutable graph.
pub struct TaskGraph {
    tree_id: TreeId,
    blueprint_id: String,
    main_branch: String,
    created_at: DateTime<Utc>,
    root_id: Option<TaskId>,
    checkpoint_ids: Vec<CheckpointId>,
    head_checkpoint: Option<CheckpointId>,
    archived_at: Option<DateTime<Utc>>,
    graph: StableDiGraph<TaskNode, EdgeKind>,
    index: HashMap<TaskId, NodeIndex>,
    next_seq: u64,
    stats: TreeStats,
    status: TreeStatus,
}

impl TaskGraph {
    /// Create an empty tree that merges into `main_branch`.
    pub fn new(blueprint_id: &str, main_branch: &str) -> Self {
        Self::with_id(TreeId::new(), blueprint_id, main_branch)
    }

    pub fn with_id(tree_id: TreeId, blueprint_id: &str, main_branch: &str) -> Self {
        Self {
            tree_id,
            blueprint_id: blueprint_id.to_string(),
            main_branch: main_branch.to_string(),
            created_at: Utc::now(),
            root_id: None,
            checkpoint_ids: Vec::new(),
            head_checkpoint: None,
            archived_at: None,
            graph: StableDiGraph::new(),
            index: HashMap::new(),
            next_seq: 0,
            stats: TreeStats::default(),
            status: TreeStatus::Pending,
        }
    }

    pub fn tree_id(&self) -> TreeId {
        self.tree_id
    }

    pub fn blueprint_id(&self) -> &str {
        &self.blueprint_id
    }

    pub fn main_branch(&self) -> &str {
        &self.main_branch
    }

    pub fn root_id(&self) -> Option<&TaskId> {
        self.root_id.as_ref()
    }

    pub fn stats(&self) -> TreeStats {
        self.stats
    }

    pub fn status(&self) -> TreeStatus {
        self.status
    }

    pub fn checkpoint_ids(&self) -> &[CheckpointId] {
        &self.checkpoint_ids
    }

    /// The checkpoint the current state descends from: the latest one
    /// taken, or the one last rewound to.
    pub fn head_checkpoint(&self) -> Option<CheckpointId> {
        self.head_checkpoint
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn contains(&self, id: &TaskId) -> bool {
        self.index.contains_key(id)
    }

    pub fn get(&self, id: &TaskId) -> Option<&TaskNode> {
        self.index.get(id).map(|&index| &self.graph[index])
    }

    /// All tasks in insertion order.
    pub fn tasks(&self) -> Vec<&TaskNode> {
        let mut tasks: Vec<&TaskNode> = self.nodes().collect();
        tasks.sort_by_key(|t| t.seq);
        tasks
    }

    pub fn tasks_with_status(&self, kind: StatusKind) -> Vec<&TaskNode> {
        self.tasks()
            .into_iter()
            .filter(|t| t.status.kind() == kind)
            .collect()
    }

    // ========== Structure ==========

    /// Add a task, optionally under a parent.
    ///
    /// All-or-nothing: on error neither the node nor any of its edges exist.
    pub fn add_task(&mut self, mut node: TaskNode, parent_id: Option<TaskId>) -> Result<()> {
        if parent_id.is_some() {
            node.parent_id = parent_id;
        }
        if self.index.contains_key(&node.id) {
            return Err(StructuralError::DuplicateId(node.id).into());
        }

        let parent_index = match &node.parent_id {
            Some(parent) => Some(
                *self
                    .index
                    .get(parent)
                    .ok_or_else(|| StructuralError::UnknownParent(parent.clone()))?,
            ),
            None => None,
        };

        let mut dependency_indices = Vec::with_capacity(node.dependencies.len());
        for dependency in &node.dependencies {
            if dependency == &node.id {
                return Err(StructuralError::Cycle {
                    task: node.id.clone(),
                    dependency: dependency.clone(),
                }
                .into());
            }
            let dep_index = *self.index.get(dependency).ok_or_else(|| {
                StructuralError::UnknownDependency {
                    task: node.id.clone(),
                    dependency: dependency.clone(),
                }
            })?;
            // New node N gets edges dep -> N -> parent; a path parent ~> dep closes a loop.
            if let Some(parent_index) = parent_index {
                if has_path_connecting(&self.graph, parent_index, dep_index, None) {
                    return Err(StructuralError::Cycle {
                        task: node.id.clone(),
                        dependency: dependency.clone(),
                    }
                    .into());
                }
            }
            dependency_indices.push(dep_index);
        }

        node.depth = parent_index.map_or(0, |p| self.graph[p].depth + 1);
        node.seq = self.next_seq;
        self.next_seq += 1;

        let id = node.id.clone();
        let is_root = node.parent_id.is_none() && self.root_id.is_none();
        let index = self.graph.add_node(node);
        self.index.insert(id.clone(), index);
        if let Some(parent_index) = parent_index {
            self.graph.add_edge(index, parent_index, EdgeKind::Hierarchy);
        }
        for dep_index in dependency_indices {
            self.graph.add_edge(dep_index, index, EdgeKind::Dependency);
        }
        if is_root {
            self.root_id = Some(id.clone());
        }

        debug!(task = %id, tree = %self.tree_id.short(), "task added");
        self.refresh();
        Ok(())
    }

    /// Make `task` wait for `depends_on`.
    pub fn add_dependency(&mut self, task: &TaskId, depends_on: &TaskId) -> Result<()> {
        let task_index = self.index_of(task)?;
        let dep_index =
            *self
                .index
                .get(depends_on)
                .ok_or_else(|| StructuralError::UnknownDependency {
                    task: task.clone(),
                    dependency: depends_on.clone(),
                })?;

        let cycle = task_index == dep_index
            || has_path_connecting(&self.graph, task_index, dep_index, None)
            || self.is_ancestor(task, depends_on);
        if cycle {
            return Err(StructuralError::Cycle {
                task: task.clone(),
                dependency: depends_on.clone(),
            }
            .into());
        }

        if self.graph[task_index].dependencies.contains(depends_on) {
            return Ok(());
        }
        self.graph
            .add_edge(dep_index, task_index, EdgeKind::Dependency);
        self.graph[task_index]
            .dependencies
            .insert(depends_on.clone());
        self.refresh();
        Ok(())
    }

    /// Remove a task nothing depends on and that has no children.
    pub fn remove_task(&mut self, id: &TaskId) -> Result<TaskNode> {
        let index = self.index_of(id)?;

        let dependents: Vec<TaskId> = self.dependents(id).into_iter().map(|t| t.id.clone()).collect();
        if !dependents.is_empty() {
            return Err(StructuralError::HasDependents {
                task: id.clone(),
                dependents,
            }
            .into());
        }
        let children: Vec<TaskId> = self.children(id).into_iter().map(|t| t.id.clone()).collect();
        if !children.is_empty() {
            return Err(StructuralError::HasChildren {
                task: id.clone(),
                children,
            }
            .into());
        }

        let node = self
            .graph
            .remove_node(index)
            .ok_or_else(|| StructuralError::UnknownTask(id.clone()))?;
        self.index.remove(id);
        if self.root_id.as_ref() == Some(id) {
            self.root_id = self
                .tasks()
                .into_iter()
                .find(|t| t.parent_id.is_none())
                .map(|t| t.id.clone());
        }
        debug!(task = %id, "task removed");
        self.refresh();
        Ok(node)
    }

    // ========== Queries ==========

    pub fn dependencies(&self, id: &TaskId) -> Vec<&TaskNode> {
        self.neighbors(id, Direction::Incoming, EdgeKind::Dependency)
    }

    pub fn dependents(&self, id: &TaskId) -> Vec<&TaskNode> {
        self.neighbors(id, Direction::Outgoing, EdgeKind::Dependency)
    }

    pub fn children(&self, id: &TaskId) -> Vec<&TaskNode> {
        self.neighbors(id, Direction::Incoming, EdgeKind::Hierarchy)
    }

    pub fn is_composite(&self, id: &TaskId) -> bool {
        !self.children(id).is_empty()
    }

    /// Everything that can no longer run if `id` never passes: dependents,
    /// children, and their dependents and children, breadth first.
    pub fn transitive_dependents(&self, id: &TaskId) -> Vec<TaskId> {
        let Some(&start) = self.index.get(id) else {
            return Vec::new();
        };
        let mut seen = HashSet::from([start]);
        let mut queue = VecDeque::from([start]);
        let mut result = Vec::new();

        while let Some(current) = queue.pop_front() {
            let downstream = self
                .graph
                .edges_directed(current, Direction::Outgoing)
                .filter(|e| *e.weight() == EdgeKind::Dependency)
                .map(|e| e.target())
                .chain(
                    self.graph
                        .edges_directed(current, Direction::Incoming)
                        .filter(|e| *e.weight() == EdgeKind::Hierarchy)
                        .map(|e| e.source()),
                );
            let mut next: Vec<NodeIndex> = downstream.filter(|n| seen.insert(*n)).collect();
            next.sort_by_key(|n| self.graph[*n].seq);
            for n in next {
                result.push(self.graph[n].id.clone());
                queue.push_back(n);
            }
        }
        result
    }

    /// Pending tasks whose dependencies are satisfied and whose parent has
    /// started, highest priority first, then oldest, then insertion order.
    pub fn ready_tasks(&self) -> Vec<&TaskNode> {
        let mut ready: Vec<&TaskNode> = self
            .graph
            .node_indices()
            .filter(|&index| self.is_ready(index))
            .map(|index| &self.graph[index])
            .collect();
        ready.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.created_at.cmp(&b.created_at))
                .then(a.seq.cmp(&b.seq))
        });
        ready
    }

    /// Tasks ordered so every task follows its dependencies and children.
    pub fn topological_order(&self) -> Result<Vec<&TaskNode>> {
        let sorted = toposort(&self.graph, None).map_err(|cycle| {
            let id = self.graph[cycle.node_id()].id.clone();
            StructuralError::Cycle {
                task: id.clone(),
                dependency: id,
            }
        })?;
        Ok(sorted.into_iter().map(|index| &self.graph[index]).collect())
    }

    /// Nothing is running and nothing can start.
    pub fn is_settled(&self) -> bool {
        self.stats.running == 0 && self.ready_tasks().is_empty()
    }

    // ========== Mutation ==========

    /// Move a task to a new status, enforcing the lifecycle.
    ///
    /// Illegal transitions fail with `InvalidTransition` and change nothing.
    pub fn update_status(
        &mut self,
        id: &TaskId,
        status: TaskStatus,
        meta: StatusMeta,
    ) -> Result<()> {
        use StatusKind::*;

        let index = self.index_of(id)?;
        let node = &self.graph[index];
        let from = node.status.kind();
        let to = status.kind();
        let allowed = match (from, to) {
            (Pending, Running | Blocked | Skipped) => true,
            (Running, Passed | Failed | Blocked | Skipped | Pending) => true,
            (Failed, Pending) => node.can_retry(),
            (Blocked, Pending | Running) => meta.allow_override,
            (Blocked, Skipped) => true,
            _ => false,
        };
        if !allowed {
            return Err(StructuralError::InvalidTransition {
                task: id.clone(),
                from: from.to_string(),
                to: to.to_string(),
            }
            .into());
        }
        // Only composites and explicit overrides run without a worker.
        if to == Running && meta.worker_id.is_none() && !meta.allow_override && !self.is_composite(id) {
            return Err(StructuralError::MissingWorker(id.clone()).into());
        }

        let now = Utc::now();
        let node = &mut self.graph[index];
        match to {
            Running => {
                node.started_at = Some(now);
                node.completed_at = None;
                node.worker_id = meta.worker_id;
            }
            Pending => {
                if from == Failed {
                    node.retry_count += 1;
                }
                node.worker_id = None;
                node.started_at = None;
                node.completed_at = None;
            }
            Failed => {
                if let TaskStatus::Failed { error } = &status {
                    node.last_error = Some(error.clone());
                }
                node.completed_at = Some(now);
                node.worker_id = None;
            }
            Passed | Skipped => {
                node.completed_at = Some(now);
                node.worker_id = None;
            }
            Blocked => {
                node.worker_id = None;
            }
        }
        debug!(task = %id, from = %from, to = %to, "status changed");
        node.status = status;
        self.refresh();
        Ok(())
    }

    pub fn set_branch(&mut self, id: &TaskId, branch: Option<String>) -> Result<()> {
        let index = self.index_of(id)?;
        self.graph[index].branch_name = branch;
        Ok(())
    }

    pub fn record_artifacts(&mut self, id: &TaskId, artifacts: Vec<Artifact>) -> Result<()> {
        let index = self.index_of(id)?;
        self.graph[index].artifacts.extend(artifacts);
        Ok(())
    }

    pub fn set_last_error(&mut self, id: &TaskId, error: Option<String>) -> Result<()> {
        let index = self.index_of(id)?;
        self.graph[index].last_error = error;
        Ok(())
    }

    pub fn record_checkpoint(&mut self, checkpoint: CheckpointId) {
        self.checkpoint_ids.push(checkpoint);
        self.head_checkpoint = Some(checkpoint);
    }

    pub fn forget_checkpoints(&mut self, removed: &[CheckpointId]) {
        self.checkpoint_ids.retain(|id| !removed.contains(id));
    }

    // ========== Serialization ==========

    pub fn snapshot(&self) -> TaskTree {
        TaskTree {
            id: self.tree_id,
            blueprint_id: self.blueprint_id.clone(),
            root_id: self.root_id.clone(),
            main_branch: self.main_branch.clone(),
            nodes: self.tasks().into_iter().cloned().collect(),
            stats: self.stats,
            status: self.status,
            created_at: self.created_at,
            checkpoint_ids: self.checkpoint_ids.clone(),
            head_checkpoint: self.head_checkpoint,
            archived_at: self.archived_at,
        }
    }

    /// Rebuild a graph from a persisted tree, validating its structure.
    pub fn from_tree(tree: TaskTree) -> Result<Self> {
        let mut graph = Self::with_id(tree.id, &tree.blueprint_id, &tree.main_branch);
        graph.created_at = tree.created_at;
        graph.checkpoint_ids = tree.checkpoint_ids;
        graph.head_checkpoint = tree.head_checkpoint;
        graph.archived_at = tree.archived_at;

        let mut nodes = tree.nodes;
        nodes.sort_by_key(|n| n.seq);
        for node in nodes {
            if graph.index.contains_key(&node.id) {
                return Err(StructuralError::DuplicateId(node.id).into());
            }
            graph.next_seq = graph.next_seq.max(node.seq + 1);
            let id = node.id.clone();
            let index = graph.graph.add_node(node);
            graph.index.insert(id, index);
        }

        let indices: Vec<NodeIndex> = graph.graph.node_indices().collect();
        for index in indices {
            let node = &graph.graph[index];
            let mut edges = Vec::new();
            if let Some(parent) = &node.parent_id {
                let parent_index = graph
                    .index
                    .get(parent)
                    .ok_or_else(|| StructuralError::UnknownParent(parent.clone()))?;
                edges.push((index, *parent_index, EdgeKind::Hierarchy));
            }
            for dependency in &node.dependencies {
                let dep_index = graph.index.get(dependency).ok_or_else(|| {
                    StructuralError::UnknownDependency {
                        task: node.id.clone(),
                        dependency: dependency.clone(),
                    }
                })?;
                edges.push((*dep_index, index, EdgeKind::Dependency));
            }
            for (from, to, kind) in edges {
                graph.graph.add_edge(from, to, kind);
            }
        }
        graph.topological_order()?;

        graph.root_id = tree
            .root_id
            .filter(|id| graph.index.contains_key(id))
            .or_else(|| {
                graph
                    .tasks()
                    .into_iter()
                    .find(|t| t.parent_id.is_none())
                    .map(|t| t.id.clone())
            });
        graph.refresh();
        Ok(graph)
    }

    // ========== Internals ==========

    fn nodes(&self) -> impl Iterator<Item = &TaskNode> {
        self.graph.node_indices().map(move |index| &self.graph[index])
    }

    fn index_of(&self, id: &TaskId) -> Result<NodeIndex> {
        self.index
            .get(id)
            .copied()
            .ok_or_else(|| StructuralError::UnknownTask(id.clone()).into())
    }

    fn neighbors(&self, id: &TaskId, direction: Direction, kind: EdgeKind) -> Vec<&TaskNode> {
        let Some(&index) = self.index.get(id) else {
            return Vec::new();
        };
        let mut found: Vec<&TaskNode> = self
            .graph
            .edges_directed(index, direction)
            .filter(|e| *e.weight() == kind)
            .map(|e| match direction {
                Direction::Incoming => &self.graph[e.source()],
                Direction::Outgoing => &self.graph[e.target()],
            })
            .collect();
        found.sort_by_key(|t| t.seq);
        found
    }

    /// Whether `ancestor` is on the parent chain of `id`.
    fn is_ancestor(&self, ancestor: &TaskId, id: &TaskId) -> bool {
        let mut current = self.get(id).and_then(|n| n.parent_id.clone());
        while let Some(parent) = current {
            if &parent == ancestor {
                return true;
            }
            current = self.get(&parent).and_then(|n| n.parent_id.clone());
        }
        false
    }

    fn is_ready(&self, index: NodeIndex) -> bool {
        let node = &self.graph[index];
        if node.status != TaskStatus::Pending {
            return false;
        }
        let dependencies_met = self
            .graph
            .edges_directed(index, Direction::Incoming)
            .filter(|e| *e.weight() == EdgeKind::Dependency)
            .all(|e| self.graph[e.source()].status.is_satisfied());
        let parent_started = self
            .graph
            .edges_directed(index, Direction::Outgoing)
            .filter(|e| *e.weight() == EdgeKind::Hierarchy)
            .all(|e| {
                matches!(
                    self.graph[e.target()].status,
                    TaskStatus::Running | TaskStatus::Passed
                )
            });
        dependencies_met && parent_started
    }

    fn refresh(&mut self) {
        let mut stats = TreeStats::default();
        for node in self.nodes() {
            stats.record(node);
        }
        let any_ready = self.graph.node_indices().any(|i| self.is_ready(i));

        self.status = if stats.total == 0 || stats.pending == stats.total {
            TreeStatus::Pending
        } else if stats.passed + stats.skipped == stats.total {
            TreeStatus::Completed
        } else if stats.running > 0 || any_ready {
            TreeStatus::Running
        } else if stats.failed > 0 {
            TreeStatus::Failed
        } else {
            TreeStatus::Blocked
        };
        self.stats = stats;

        if self.status.is_terminal() {
            self.archived_at.get_or_insert_with(Utc::now);
        } else {
            self.archived_at = None;
        }
    }
}

impl std::fmt::Debug for TaskGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskGraph")
            .field("tree_id", &self.tree_id)
            .field("tasks", &self.len())
            .field("status", &self.status)
            .finish()
    }
}
