//! Checkpoint, rewind and branch integration tests.

use std::sync::Arc;

use braid::core::{StatusKind, TaskId, TaskNode, TreeStatus};
use braid::git_refs::GitRefs;
use braid::orchestration::{
    ConcurrencyController, ControllerConfig, Scheduler, SchedulerConfig, TaskSnapshot,
};

use crate::fixtures::{Harness, ScriptedWorker};

fn chain() -> Vec<(TaskNode, Option<&'static str>)> {
    vec![
        (TaskNode::new("a", "A"), None),
        (TaskNode::new("b", "B").depends_on("a"), None),
        (TaskNode::new("c", "C").depends_on("b"), None),
    ]
}

fn every_pass() -> SchedulerConfig {
    SchedulerConfig {
        max_parallel: 2,
        checkpoint_every: 1,
        checkpoint_before_complex: false,
        ..SchedulerConfig::default()
    }
}

fn by_id(mut tasks: Vec<TaskSnapshot>) -> Vec<TaskSnapshot> {
    tasks.sort_by(|a, b| a.id.as_str().cmp(b.id.as_str()));
    tasks
}

/// Scenario D: checkpoint S1, two more tasks pass, rewind to S1. The tree
/// matches the S1 snapshot and nothing started after S1 is still around.
#[tokio::test]
async fn test_rewind_restores_checkpoint_state() {
    let harness = Harness::new(chain());
    let worker = Arc::new(ScriptedWorker::writes_own_file());
    let mut scheduler = harness.scheduler_with(worker.clone(), every_pass());

    let report = scheduler.run().await.unwrap();
    assert_eq!(report.tree_status, TreeStatus::Completed);

    let tree_id = report.tree_id;
    let checkpoints = harness.checkpoints.list_checkpoints(&tree_id).unwrap();
    assert_eq!(checkpoints.len(), 3);
    let s1 = &checkpoints[0];
    assert_eq!(s1.tree.node(&TaskId::from("a")).unwrap().status.kind(), StatusKind::Passed);
    assert_eq!(s1.tree.node(&TaskId::from("b")).unwrap().status.kind(), StatusKind::Pending);

    let main = harness.main_branch();
    assert!(harness.repo.read_on(&main, "c.txt").is_some());

    scheduler.rewind_to(&s1.id).await.unwrap();

    let status = scheduler.get_status().await;
    let expected: Vec<TaskSnapshot> = s1.tree.nodes.iter().map(TaskSnapshot::from).collect();
    assert_eq!(by_id(status.tasks.clone()), by_id(expected));
    assert!(status.sessions.is_empty());
    assert!(harness.controller.leases().await.is_empty());

    // The main line is back where S1 saw it.
    assert_eq!(harness.repo.tip(&main), s1.main_commit);
    assert!(harness.repo.read_on(&main, "a.txt").is_some());
    assert!(harness.repo.read_on(&main, "b.txt").is_none());
    assert!(harness.repo.read_on(&main, "c.txt").is_none());

    // Later checkpoints stay listed and the persisted tree matches.
    let saved = harness.store.load_tree(&tree_id).unwrap();
    assert_eq!(saved.checkpoint_ids.len(), 3);
    assert_eq!(saved.node(&TaskId::from("c")).unwrap().status.kind(), StatusKind::Pending);

    // Work after the rewind picks up from S1.
    let report = scheduler.run().await.unwrap();
    assert_eq!(report.tree_status, TreeStatus::Completed);
    assert_eq!(worker.calls(), vec!["a", "b", "c", "b", "c"]);
}

#[tokio::test]
async fn test_diff_between_checkpoints() {
    let harness = Harness::new(chain());
    let mut scheduler = harness.scheduler_with(Arc::new(ScriptedWorker::writes_own_file()), every_pass());
    let report = scheduler.run().await.unwrap();

    let checkpoints = harness.checkpoints.list_checkpoints(&report.tree_id).unwrap();
    let (first, last) = (&checkpoints[0], &checkpoints[2]);
    let diff = harness.checkpoints.diff(&first.id, &last.id).unwrap();

    let changed: Vec<String> = diff.status_changes.iter().map(|c| c.to_string()).collect();
    assert_eq!(changed, vec!["b: pending -> passed", "c: pending -> passed"]);
    let mut paths: Vec<String> = diff
        .mainline
        .files
        .iter()
        .map(|f| f.path.to_string_lossy().to_string())
        .collect();
    paths.sort();
    assert_eq!(paths, vec!["b.txt", "c.txt"]);

    let same = harness.checkpoints.diff(&first.id, &first.id).unwrap();
    assert!(same.is_empty());
}

/// `branch_from(cp)` starts a tree whose initial checkpoint is identical to
/// `cp`; the new tree then runs on its own main line.
#[tokio::test]
async fn test_branch_from_checkpoint() {
    let harness = Harness::new(chain());
    let mut scheduler = harness.scheduler_with(Arc::new(ScriptedWorker::writes_own_file()), every_pass());
    let report = scheduler.run().await.unwrap();
    let original_tip = harness.repo.tip(&harness.main_branch());

    let s1 = harness.checkpoints.list_checkpoints(&report.tree_id).unwrap()[0].clone();
    let (graph, initial) = harness.checkpoints.branch_from(&s1.id).await.unwrap();

    assert_ne!(graph.tree_id(), report.tree_id);
    assert!(graph.main_branch().starts_with("braid/trees/"));
    assert!(harness.checkpoints.diff(&s1.id, &initial.id).unwrap().is_empty());
    assert_eq!(harness.repo.tip(graph.main_branch()), s1.main_commit);
    assert_eq!(harness.repo.tip(&harness.main_branch()), original_tip);
    assert!(harness.store.load_tree(&graph.tree_id()).is_ok());

    let controller = Arc::new(
        ConcurrencyController::new(
            &harness.repo.path,
            ControllerConfig {
                tree_id: graph.tree_id(),
                main_branch: graph.main_branch().to_string(),
                branch_prefix: "braid".to_string(),
                worktree_dir: harness.worktrees.path().to_path_buf(),
            },
        )
        .unwrap(),
    );
    let branch_main = graph.main_branch().to_string();
    let worker = Arc::new(ScriptedWorker::writes_own_file());
    let mut branched = Scheduler::new(
        Arc::new(tokio::sync::RwLock::new(graph)),
        controller,
        worker.clone(),
        SchedulerConfig::default(),
    );
    let report = branched.run().await.unwrap();
    assert_eq!(report.tree_status, TreeStatus::Completed);
    assert_eq!(worker.calls(), vec!["b", "c"]);
    assert!(harness.repo.read_on(&branch_main, "c.txt").is_some());
}

#[tokio::test]
async fn test_retention_prunes_old_checkpoints() {
    let harness = Harness::new(chain());
    let config = SchedulerConfig {
        checkpoint_retention: Some(2),
        ..every_pass()
    };
    let mut scheduler = harness.scheduler_with(Arc::new(ScriptedWorker::writes_own_file()), config);
    let report = scheduler.run().await.unwrap();

    let kept = harness.checkpoints.list_checkpoints(&report.tree_id).unwrap();
    assert_eq!(kept.len(), 2);
    let graph = harness.graph.read().await;
    assert_eq!(graph.checkpoint_ids().len(), 2);

    let refs = GitRefs::new(&harness.repo.path).unwrap();
    assert_eq!(refs.pinned_checkpoints().unwrap().len(), 2);
}

#[tokio::test]
async fn test_restart_requeues_interrupted_work() {
    let harness = Harness::new(chain());
    {
        let mut scheduler = harness.scheduler(Arc::new(ScriptedWorker::writes_own_file()), 1);
        scheduler.dispatch_ready().await.unwrap();
        // Dropped with "a" still running, as if the process died.
    }
    let saved = harness.store.load_tree(&harness.graph.read().await.tree_id()).unwrap();
    assert_eq!(saved.node(&TaskId::from("a")).unwrap().status.kind(), StatusKind::Running);

    let worker = Arc::new(ScriptedWorker::writes_own_file());
    let mut scheduler = harness.scheduler(worker.clone(), 1);
    let report = scheduler.run().await.unwrap();
    assert_eq!(report.tree_status, TreeStatus::Completed);
    assert_eq!(report.task(&TaskId::from("a")).unwrap().retry_count, 0);
    assert_eq!(worker.calls(), vec!["a", "b", "c"]);
}
