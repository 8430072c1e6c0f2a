//! Completion validation.
//!
//! A worker saying "done" is not enough. Before a reported success is
//! committed and merged it has to show the evidence its task category
//! calls for; a rejection is handled exactly like a reported failure.

use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;

use crate::core::{TaskCategory, TaskNode};
use crate::error::ValidationError;
use crate::orchestration::executor::{CategoryReport, TaskResult, WorkerAction};

/// Paths that look like test code in the common layouts.
static TEST_PATH_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(^|/)(tests?|__tests__|specs?)/|(^|/)test_[^/]+$|[_.](test|spec)\.[A-Za-z0-9]+$|(^|/)conftest\.py$",
    )
    .unwrap()
});

pub fn is_test_path(path: &Path) -> bool {
    TEST_PATH_RE.is_match(&path.to_string_lossy().replace('\\', "/"))
}

/// Check a reported success against the task's category.
pub fn validate(task: &TaskNode, result: &TaskResult) -> Result<(), ValidationError> {
    if let Some(report) = &result.report {
        if report.category() != task.category {
            return Err(ValidationError::CategoryMismatch {
                expected: task.category.to_string(),
                reported: report.category().to_string(),
            });
        }
    }

    if result.actions.is_empty() {
        return Err(ValidationError::NoActivity);
    }

    match task.category {
        TaskCategory::Code | TaskCategory::Refactor | TaskCategory::Config => {
            if result.file_changes.is_empty() {
                return Err(ValidationError::NoFileChanges {
                    category: task.category.to_string(),
                });
            }
        }
        TaskCategory::Test => {
            if !result.file_changes.iter().any(|c| is_test_path(c.path())) {
                return Err(ValidationError::NoTestChanges);
            }
            if !tests_ran(result) {
                return Err(ValidationError::TestsNotRun);
            }
        }
        TaskCategory::Integration => {
            let looked = result
                .actions
                .iter()
                .any(|a| matches!(a, WorkerAction::Inspect { .. } | WorkerAction::Edit { .. }));
            if !looked {
                return Err(ValidationError::NoInspection);
            }
        }
        TaskCategory::Docs => {}
    }
    Ok(())
}

fn tests_ran(result: &TaskResult) -> bool {
    let recorded = result
        .actions
        .iter()
        .any(|a| matches!(a, WorkerAction::RunTests { .. }));
    let reported = matches!(
        result.report,
        Some(CategoryReport::Test {
            tests_ran: true,
            ..
        })
    );
    recorded || reported
}
