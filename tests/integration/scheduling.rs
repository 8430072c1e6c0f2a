//! Scheduling integration tests.
//!
//! Dependency order, retry budgets, failure propagation and dispatch order
//! against a real repository.

use std::sync::Arc;
use std::time::Duration;

use braid::core::{StatusKind, TaskId, TaskNode, TreeStatus};
use braid::orchestration::{EventSink, SchedulerConfig, SchedulerEvent, TaskResult, WorkerEvent};

use crate::fixtures::{Harness, ScriptedWorker};

fn status(report: &braid::orchestration::StatusReport, id: &str) -> StatusKind {
    report.task(&TaskId::from(id)).unwrap().status
}

/// Scenario A: A fails for good, so B (depends on A) is blocked and never
/// handed to a worker. Independent work still completes.
#[tokio::test]
async fn test_failed_dependency_blocks_dependent() {
    let harness = Harness::new(vec![
        (TaskNode::new("a", "A").with_max_retries(1), None),
        (TaskNode::new("b", "B").depends_on("a"), None),
        (TaskNode::new("c", "C"), None),
    ]);
    let worker = Arc::new(ScriptedWorker::new(|task, _| {
        if task.id.as_str() == "a" {
            TaskResult::failure("compile error")
        } else {
            TaskResult::success().writes(&format!("{}.txt", task.id), "ok\n")
        }
    }));
    let mut scheduler = harness.scheduler(worker.clone(), 2);

    let report = scheduler.run().await.unwrap();

    assert_eq!(status(&report, "a"), StatusKind::Failed);
    assert_eq!(status(&report, "b"), StatusKind::Blocked);
    assert_eq!(status(&report, "c"), StatusKind::Passed);
    assert_eq!(worker.attempts("b"), 0);
    assert_eq!(report.tree_status, TreeStatus::Failed);
    assert!(harness.repo.read_on(&harness.main_branch(), "c.txt").is_some());
    assert!(harness.repo.read_on(&harness.main_branch(), "b.txt").is_none());
}

/// A task failing max_retries + 1 times fails once, for good.
#[tokio::test]
async fn test_retry_budget_is_exact() {
    let harness = Harness::new(vec![(TaskNode::new("a", "A").with_max_retries(2), None)]);
    let worker = Arc::new(ScriptedWorker::new(|_, attempt| {
        TaskResult::failure(format!("attempt {} failed", attempt))
    }));
    let (events, mut rx) = EventSink::channel(256);
    let mut scheduler = harness.scheduler(worker.clone(), 1).with_events(events);

    let report = scheduler.run().await.unwrap();
    assert_eq!(worker.attempts("a"), 3);
    let snapshot = report.task(&TaskId::from("a")).unwrap();
    assert_eq!(snapshot.status, StatusKind::Failed);
    assert_eq!(snapshot.retry_count, 2);
    assert_eq!(snapshot.last_error.as_deref(), Some("attempt 3 failed"));

    // Hints carry the previous attempt's error.
    assert_eq!(
        worker.hints_for("a"),
        vec![
            None,
            Some("attempt 1 failed".to_string()),
            Some("attempt 2 failed".to_string())
        ]
    );

    let mut transitions = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if let SchedulerEvent::TaskStatusChanged { task_id, to, .. } = event {
            if task_id.as_str() == "a" {
                transitions.push(to);
            }
        }
    }
    assert_eq!(transitions.iter().filter(|s| **s == StatusKind::Running).count(), 3);
    assert_eq!(transitions.last(), Some(&StatusKind::Failed));

    // Running again never dispatches it.
    let report = scheduler.run().await.unwrap();
    assert_eq!(worker.attempts("a"), 3);
    assert_eq!(status(&report, "a"), StatusKind::Failed);
}

#[tokio::test]
async fn test_priority_decides_dispatch_order() {
    let harness = Harness::new(vec![
        (TaskNode::new("low", "Low").with_priority(1), None),
        (TaskNode::new("high", "High").with_priority(9), None),
        (TaskNode::new("mid", "Mid").with_priority(5), None),
        (TaskNode::new("tail", "Tail").with_priority(9).depends_on("low"), None),
    ]);
    let worker = Arc::new(ScriptedWorker::writes_own_file());
    let mut scheduler = harness.scheduler(worker.clone(), 1);

    let report = scheduler.run().await.unwrap();
    assert_eq!(report.tree_status, TreeStatus::Completed);
    assert_eq!(worker.calls(), vec!["high", "mid", "low", "tail"]);
}

#[tokio::test]
async fn test_parallel_workers_respect_budget() {
    let tasks = (0..6)
        .map(|i| (TaskNode::new(format!("t{}", i), "parallel"), None))
        .collect();
    let harness = Harness::new(tasks);
    let worker = Arc::new(ScriptedWorker::writes_own_file().with_delay(Duration::from_millis(20)));
    let mut scheduler = harness.scheduler(worker.clone(), 3);

    assert_eq!(scheduler.dispatch_ready().await.unwrap(), 3);
    assert_eq!(scheduler.active_count(), 3);
    assert_eq!(scheduler.get_status().await.sessions.len(), 3);

    let report = scheduler.run().await.unwrap();
    assert_eq!(report.stats.passed, 6);
    assert!(report.sessions.is_empty());
    assert_eq!(harness.controller.merge_history().await.len(), 6);
    for i in 0..6 {
        let file = format!("t{}.txt", i);
        assert_eq!(
            harness.repo.read_on(&harness.main_branch(), &file).as_deref(),
            Some("done\n")
        );
    }
}

#[tokio::test]
async fn test_dependents_see_dependency_artifacts() {
    let harness = Harness::new(vec![
        (TaskNode::new("schema", "Schema"), None),
        (TaskNode::new("api", "Api").depends_on("schema"), None),
    ]);
    let worker = Arc::new(ScriptedWorker::new(|task, _| {
        TaskResult::success().writes(&format!("{}.rs", task.id), "// generated\n")
    }));
    let mut scheduler = harness.scheduler(worker, 2);
    scheduler.run().await.unwrap();

    let graph = harness.graph.read().await;
    let schema = graph.get(&TaskId::from("schema")).unwrap();
    assert_eq!(schema.artifacts.len(), 1);
    assert_eq!(schema.artifacts[0].path, std::path::PathBuf::from("schema.rs"));
    assert!(schema.artifacts[0].commit.is_some());
    assert!(schema.branch_name.is_none());
}

#[tokio::test]
async fn test_handle_fails_once_scheduler_is_gone() {
    let harness = Harness::new(vec![(TaskNode::new("a", "A"), None)]);
    let mut scheduler = harness.scheduler(Arc::new(ScriptedWorker::writes_own_file()), 1);
    let handle = scheduler.handle();

    let report = scheduler.run().await.unwrap();
    assert_eq!(report.tree_status, TreeStatus::Completed);
    drop(scheduler);
    assert!(handle.pause().await.is_err());
    assert!(handle.status().await.is_err());
}

/// An attempt that outlives task_timeout counts as a failed attempt and
/// the retry is told why.
#[tokio::test]
async fn test_timed_out_attempt_is_retried() {
    let harness = Harness::new(vec![(TaskNode::new("a", "A").with_max_retries(1), None)]);
    let worker = Arc::new(
        ScriptedWorker::writes_own_file().with_delay_on_attempt(1, Duration::from_secs(30)),
    );
    let config = SchedulerConfig {
        max_parallel: 1,
        task_timeout: Duration::from_millis(200),
        checkpoint_every: 0,
        checkpoint_before_complex: false,
        ..SchedulerConfig::default()
    };
    let mut scheduler = harness.scheduler_with(worker.clone(), config);

    let report = scheduler.run().await.unwrap();
    assert_eq!(status(&report, "a"), StatusKind::Passed);
    assert_eq!(report.task(&TaskId::from("a")).unwrap().retry_count, 1);
    assert_eq!(worker.attempts("a"), 2);
    let hints = worker.hints_for("a");
    assert_eq!(hints[0], None);
    assert!(hints[1].as_deref().unwrap().contains("timed out"));
    assert!(harness.repo.read_on(&harness.main_branch(), "a.txt").is_some());
}

fn late_success(worker_id: braid::core::WorkerId, task: &str) -> WorkerEvent {
    WorkerEvent {
        worker_id,
        task_id: TaskId::from(task),
        outcome: Ok(TaskResult::success().writes(&format!("{}.txt", task), "late\n")),
    }
}

/// A result arriving after its task was cancelled changes nothing.
#[tokio::test]
async fn test_late_result_after_cancel_is_discarded() {
    let harness = Harness::new(vec![(TaskNode::new("a", "A"), None)]);
    let worker = Arc::new(ScriptedWorker::writes_own_file().with_delay(Duration::from_secs(30)));
    let mut scheduler = harness.scheduler(worker, 1);
    let main = harness.main_branch();
    let tip = harness.repo.tip(&main);

    assert_eq!(scheduler.dispatch_ready().await.unwrap(), 1);
    let session = scheduler.get_status().await.sessions[0].clone();
    scheduler.cancel(&TaskId::from("a")).await.unwrap();

    scheduler
        .handle_worker_event(late_success(session.worker_id, "a"))
        .await
        .unwrap();
    let report = scheduler.get_status().await;
    assert_eq!(status(&report, "a"), StatusKind::Skipped);
    assert_eq!(harness.repo.tip(&main), tip);
    assert!(harness.controller.merge_history().await.is_empty());
    assert!(harness.controller.lease(&TaskId::from("a")).await.is_none());
}

/// A result from a session replaced by a rewind doesn't complete the
/// task's new attempt.
#[tokio::test]
async fn test_late_result_from_replaced_session_is_discarded() {
    let harness = Harness::new(vec![(TaskNode::new("a", "A"), None)]);
    let worker = Arc::new(ScriptedWorker::writes_own_file().with_delay(Duration::from_secs(30)));
    let mut scheduler = harness.scheduler(worker.clone(), 1);
    let start = scheduler.checkpoint("start").await.unwrap();

    scheduler.dispatch_ready().await.unwrap();
    let first = scheduler.get_status().await.sessions[0].clone();
    scheduler.rewind_to(&start.id).await.unwrap();
    scheduler.dispatch_ready().await.unwrap();
    let second = scheduler.get_status().await.sessions[0].clone();
    assert_ne!(first.worker_id, second.worker_id);

    scheduler
        .handle_worker_event(late_success(first.worker_id, "a"))
        .await
        .unwrap();
    let report = scheduler.get_status().await;
    assert_eq!(status(&report, "a"), StatusKind::Running);
    assert_eq!(report.sessions.len(), 1);
    assert_eq!(report.sessions[0].worker_id, second.worker_id);
    assert!(harness.controller.merge_history().await.is_empty());
    assert!(harness.controller.lease(&TaskId::from("a")).await.is_some());
    assert_eq!(worker.attempts("a"), 2);
}

