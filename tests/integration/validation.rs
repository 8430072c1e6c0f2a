//! Completion validation through the scheduler.
//!
//! A reported success without the evidence its category needs is treated
//! as a failed attempt: retried with the rejection as a hint, never merged.

use std::path::PathBuf;
use std::sync::Arc;

use braid::core::{StatusKind, TaskCategory, TaskId, TaskNode};
use braid::orchestration::{CategoryReport, TaskResult, WorkerAction};

use crate::fixtures::{Harness, ScriptedWorker};

/// Scenario C: a test task claims success without touching tests or running
/// them. The claim is rejected and the task retried; it passes only once the
/// evidence is there.
#[tokio::test]
async fn test_unsupported_test_success_is_retried() {
    let harness = Harness::new(vec![(
        TaskNode::new("tests", "Cover login").with_category(TaskCategory::Test),
        None,
    )]);
    let worker = Arc::new(ScriptedWorker::new(|_, attempt| {
        if attempt == 1 {
            TaskResult::success().with_action(WorkerAction::Read {
                path: PathBuf::from("src/login.rs"),
            })
        } else {
            TaskResult::success()
                .writes("tests/login_test.rs", "#[test]\nfn login() {}\n")
                .with_action(WorkerAction::RunTests {
                    command: "cargo test".to_string(),
                    passed: true,
                })
                .with_report(CategoryReport::Test {
                    tests_ran: true,
                    tests_passed: Some(true),
                })
        }
    }));
    let mut scheduler = harness.scheduler(worker.clone(), 1);

    let report = scheduler.run().await.unwrap();
    let task = report.task(&TaskId::from("tests")).unwrap();
    assert_eq!(task.status, StatusKind::Passed);
    assert_eq!(task.retry_count, 1);
    assert_eq!(worker.attempts("tests"), 2);

    let hints = worker.hints_for("tests");
    assert_eq!(hints[0], None);
    assert!(hints[1]
        .as_deref()
        .unwrap()
        .contains("Test task did not change any test files"));

    // Only the validated attempt reached the main line.
    let records = harness.controller.merge_history().await;
    assert_eq!(records.len(), 1);
    assert!(harness
        .repo
        .read_on(&harness.main_branch(), "tests/login_test.rs")
        .is_some());
}

#[tokio::test]
async fn test_rejected_every_time_ends_failed() {
    let harness = Harness::new(vec![(
        TaskNode::new("code", "Implement")
            .with_category(TaskCategory::Code)
            .with_max_retries(1),
        None,
    )]);
    // Claims success but changes nothing.
    let worker = Arc::new(ScriptedWorker::new(|_, _| {
        TaskResult::success().with_action(WorkerAction::Inspect {
            target: "api".to_string(),
        })
    }));
    let mut scheduler = harness.scheduler(worker.clone(), 1);

    let report = scheduler.run().await.unwrap();
    let task = report.task(&TaskId::from("code")).unwrap();
    assert_eq!(task.status, StatusKind::Failed);
    assert!(task
        .last_error
        .as_deref()
        .unwrap()
        .contains("code task reported success without file changes"));
    assert_eq!(worker.attempts("code"), 2);
    assert!(harness.controller.merge_history().await.is_empty());
}

#[tokio::test]
async fn test_category_evidence_rules() {
    let harness = Harness::new(vec![
        (TaskNode::new("docs", "Docs").with_category(TaskCategory::Docs), None),
        (
            TaskNode::new("wire", "Wire up")
                .with_category(TaskCategory::Integration)
                .with_max_retries(0),
            None,
        ),
        (
            TaskNode::new("mismatch", "Mismatch")
                .with_category(TaskCategory::Code)
                .with_max_retries(0),
            None,
        ),
    ]);
    let worker = Arc::new(ScriptedWorker::new(|task, _| match task.id.as_str() {
        // Docs only needs to show activity.
        "docs" => TaskResult::success().with_action(WorkerAction::Read {
            path: PathBuf::from("README.md"),
        }),
        // Integration needs an inspection or an edit; a command is neither.
        "wire" => TaskResult::success().with_action(WorkerAction::Command {
            command: "true".to_string(),
            exit_code: Some(0),
        }),
        _ => TaskResult::success()
            .writes("src/lib.rs", "pub fn f() {}\n")
            .with_report(CategoryReport::Docs),
    }));
    let mut scheduler = harness.scheduler(worker, 3);

    let report = scheduler.run().await.unwrap();
    assert_eq!(report.task(&TaskId::from("docs")).unwrap().status, StatusKind::Passed);

    let wire = report.task(&TaskId::from("wire")).unwrap();
    assert_eq!(wire.status, StatusKind::Failed);
    assert!(wire.last_error.as_deref().unwrap().contains("did not inspect"));

    let mismatch = report.task(&TaskId::from("mismatch")).unwrap();
    assert_eq!(mismatch.status, StatusKind::Failed);
    assert!(mismatch
        .last_error
        .as_deref()
        .unwrap()
        .contains("does not match task category"));
}
