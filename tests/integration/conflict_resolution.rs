//! Conflict resolution integration tests.
//!
//! Two workers editing the same lines, the merge queue's ordering, and
//! what the controller does with a branch that is already gone.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use braid::core::{BlockReason, StatusKind, TaskGraph, TaskId, TaskNode, TaskStatus, TreeStatus};
use braid::error::ConcurrencyError;
use braid::git::FileChange;
use braid::orchestration::{
    ConcurrencyController, ControllerConfig, Resolution, ResolutionRequest, ResolvedFile, Scheduler,
    SchedulerConfig, TaskResult,
};
use braid::Error;
use tokio::sync::RwLock;

use crate::fixtures::{Harness, ScriptedWorker};

/// Scenario B: overlapping edits. The first merge lands; the second comes
/// back with the conflict and leaves its task blocked, not failed.
#[tokio::test]
async fn test_overlapping_edits_block_second_task() {
    let harness = Harness::new(vec![
        (TaskNode::new("left", "Left").with_priority(2), None),
        (TaskNode::new("right", "Right").with_priority(1), None),
    ]);
    let worker = Arc::new(ScriptedWorker::new(|task, _| {
        TaskResult::success().writes("README.md", &format!("# Rewritten by {}\n", task.id))
    }));
    let mut scheduler = harness.scheduler(worker.clone(), 2);

    let report = scheduler.run().await.unwrap();

    let statuses: HashMap<String, StatusKind> = report
        .tasks
        .iter()
        .map(|t| (t.id.to_string(), t.status))
        .collect();
    let passed: Vec<&String> = statuses
        .iter()
        .filter(|(_, s)| **s == StatusKind::Passed)
        .map(|(id, _)| id)
        .collect();
    let blocked: Vec<&String> = statuses
        .iter()
        .filter(|(_, s)| **s == StatusKind::Blocked)
        .map(|(id, _)| id)
        .collect();
    assert_eq!(passed.len(), 1);
    assert_eq!(blocked.len(), 1);
    assert_eq!(report.stats.failed, 0);
    assert_eq!(report.tree_status, TreeStatus::Blocked);

    let winner = passed[0].as_str();
    let loser = blocked[0].as_str();
    assert_eq!(
        harness.repo.read_on(&harness.main_branch(), "README.md"),
        Some(format!("# Rewritten by {}\n", winner))
    );

    let graph = harness.graph.read().await;
    let node = graph.get(&TaskId::from(loser)).unwrap();
    let conflict = node.conflict().expect("conflict retained on the blocked task");
    assert_eq!(conflict.files.len(), 1);
    let file = &conflict.files[0];
    assert_eq!(file.path, std::path::PathBuf::from("README.md"));
    assert!(!file.marked.is_empty());
    assert!(file.marked.contains("<<<<<<<"));
    assert!(file.marked.contains(">>>>>>>"));
    assert_eq!(file.base.as_deref(), Some("# Test Repository\n"));
    assert!(matches!(
        &node.status,
        TaskStatus::Blocked {
            reason: BlockReason::MergeConflict { .. }
        }
    ));
    // The losing branch is kept for review.
    assert!(node.branch_name.is_some());
    assert!(harness.controller.lease(&TaskId::from(loser)).await.is_some());
}

/// After a conflict the task can be released and redone on top of the
/// new main line.
#[tokio::test]
async fn test_override_reruns_conflicted_task() {
    let harness = Harness::new(vec![
        (TaskNode::new("left", "Left").with_priority(2), None),
        (TaskNode::new("right", "Right").with_priority(1), None),
    ]);
    let worker = Arc::new(ScriptedWorker::new(|task, attempt| {
        if attempt == 1 {
            TaskResult::success().writes("README.md", &format!("# {}\n", task.id))
        } else {
            TaskResult::success().writes(&format!("{}.txt", task.id), "second try\n")
        }
    }));
    let mut scheduler = harness.scheduler(worker.clone(), 2);
    let report = scheduler.run().await.unwrap();
    let loser = report
        .tasks
        .iter()
        .find(|t| t.status == StatusKind::Blocked)
        .map(|t| t.id.clone())
        .unwrap();

    scheduler.override_blocked(&loser).await.unwrap();
    assert!(harness.controller.lease(&loser).await.is_none());
    let report = scheduler.run().await.unwrap();
    assert_eq!(report.tree_status, TreeStatus::Completed);
    assert_eq!(worker.attempts(loser.as_str()), 2);
}

/// Concurrent completions land on the main line in merge order, and the
/// first-parent history is that order.
#[tokio::test]
async fn test_merges_form_first_parent_total_order() {
    let tasks = (0..5)
        .map(|i| (TaskNode::new(format!("w{}", i), "worker"), None))
        .collect();
    let harness = Harness::new(tasks);
    let worker = Arc::new(ScriptedWorker::writes_own_file().with_delay(Duration::from_millis(5)));
    let mut scheduler = harness.scheduler(worker, 5);

    let report = scheduler.run().await.unwrap();
    assert_eq!(report.tree_status, TreeStatus::Completed);

    let history = harness
        .repo
        .git_ops()
        .first_parent_history(&harness.main_branch(), 100)
        .unwrap();
    let records = harness.controller.merge_history().await;
    assert_eq!(records.len(), 5);
    assert_eq!(history[0], records.last().unwrap().commit);

    let positions: Vec<usize> = records
        .iter()
        .map(|r| {
            history
                .iter()
                .position(|c| c == &r.commit)
                .expect("merge commit on the first-parent chain")
        })
        .collect();
    // Newest first in history, so later merges sit at smaller positions.
    assert!(positions.windows(2).all(|w| w[0] > w[1]));
    assert!(records.windows(2).all(|w| w[0].seq < w[1].seq));
}

/// Merging a branch that is already merged fails cleanly and leaves the
/// main line alone.
#[tokio::test]
async fn test_double_merge_is_no_branch() {
    let harness = Harness::new(vec![(TaskNode::new("a", "A"), None)]);
    let task = TaskId::from("a");
    let main = harness.main_branch();

    harness.controller.allocate_branch(&task).await.unwrap();
    harness
        .controller
        .commit_changes(
            &task,
            &[FileChange::Write {
                path: "a.txt".into(),
                content: "a\n".to_string(),
            }],
            "add a",
        )
        .await
        .unwrap();
    let merged = harness.controller.merge_worker_branch(&task, None).await.unwrap();
    assert!(merged.success);
    assert!(merged.conflict.is_none());
    let tip = harness.repo.tip(&main);
    assert_eq!(merged.commit.as_deref(), Some(tip.as_str()));

    let err = harness
        .controller
        .merge_worker_branch(&task, None)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        Error::Concurrency(ConcurrencyError::NoBranch(_))
    ));
    assert_eq!(harness.repo.tip(&main), tip);
    assert_eq!(harness.controller.merge_history().await.len(), 1);
}

fn overlapping_pair() -> Vec<(TaskNode, Option<&'static str>)> {
    vec![
        (TaskNode::new("left", "Left").with_priority(2), None),
        (TaskNode::new("right", "Right").with_priority(1), None),
    ]
}

fn rewrites_readme() -> ScriptedWorker {
    ScriptedWorker::new(|task, _| {
        TaskResult::success().writes("README.md", &format!("# Rewritten by {}\n", task.id))
    })
}

/// Keeps both sides of every conflicted file, main line first.
fn keep_both(request: &ResolutionRequest) -> Resolution {
    let files = request
        .conflict
        .files
        .iter()
        .map(|file| ResolvedFile {
            path: file.path.clone(),
            content: Some(format!(
                "{}{}",
                file.current.as_deref().unwrap_or(""),
                file.incoming.as_deref().unwrap_or("")
            )),
        })
        .collect();
    Resolution::Resolved { files }
}

fn assert_both_sides_on_main(harness: &Harness) {
    let readme = harness
        .repo
        .read_on(&harness.main_branch(), "README.md")
        .unwrap();
    assert!(readme.contains("# Rewritten by left\n"));
    assert!(readme.contains("# Rewritten by right\n"));
    assert!(!readme.contains("<<<<<<<"));
}

/// With auto_resolve on, the conflict goes to the executor and an accepted
/// resolution is merged: both tasks pass.
#[tokio::test]
async fn test_auto_resolve_merges_resolution() {
    let worker = Arc::new(rewrites_readme().with_resolver(keep_both));
    let harness = Harness::with_resolver(overlapping_pair(), worker.clone());
    let config = SchedulerConfig {
        max_parallel: 2,
        checkpoint_every: 0,
        checkpoint_before_complex: false,
        auto_resolve: true,
        ..SchedulerConfig::default()
    };
    let mut scheduler = harness.scheduler_with(worker, config);

    let report = scheduler.run().await.unwrap();
    assert_eq!(report.tree_status, TreeStatus::Completed);
    assert_eq!(report.stats.passed, 2);
    assert_both_sides_on_main(&harness);
    assert_eq!(harness.controller.merge_history().await.len(), 2);
    assert!(harness.controller.leases().await.is_empty());
}

/// A conflict-blocked branch survives a restart: a fresh controller and
/// scheduler can still retry its merge.
#[tokio::test]
async fn test_retry_merge_after_restart() {
    let harness = Harness::new(overlapping_pair());
    let mut scheduler = harness.scheduler(Arc::new(rewrites_readme()), 2);
    let report = scheduler.run().await.unwrap();
    assert_eq!(report.tree_status, TreeStatus::Blocked);
    let loser = report
        .tasks
        .iter()
        .find(|t| t.status == StatusKind::Blocked)
        .map(|t| t.id.clone())
        .unwrap();
    drop(scheduler);

    // Everything in memory is rebuilt from the store and the repository.
    let tree = harness.store.load_tree(&report.tree_id).unwrap();
    let graph = TaskGraph::from_tree(tree).unwrap();
    let resolver = Arc::new(rewrites_readme().with_resolver(keep_both));
    let controller = ConcurrencyController::new(
        &harness.repo.path,
        ControllerConfig {
            tree_id: graph.tree_id(),
            main_branch: graph.main_branch().to_string(),
            branch_prefix: "braid".to_string(),
            worktree_dir: harness.worktrees.path().to_path_buf(),
        },
    )
    .unwrap()
    .with_conflict_delegate(resolver.clone(), Duration::from_secs(30));
    let controller = Arc::new(controller);
    let graph = Arc::new(RwLock::new(graph));
    let mut restarted = Scheduler::new(graph.clone(), controller.clone(), resolver, SchedulerConfig::default())
        .with_store(harness.store.clone());

    let merge = restarted.retry_merge(&loser, Some("keep both")).await.unwrap();
    assert!(merge.success);
    assert_both_sides_on_main(&harness);
    assert_eq!(
        graph.read().await.get(&loser).unwrap().status.kind(),
        StatusKind::Passed
    );
    assert!(controller.lease(&loser).await.is_none());
    let saved = harness.store.load_tree(&report.tree_id).unwrap();
    assert_eq!(saved.node(&loser).unwrap().status.kind(), StatusKind::Passed);
}

