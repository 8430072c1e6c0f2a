//! Merge outcome types shared by the controller, the graph and checkpoints.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// One file that failed to merge cleanly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictFile {
    /// Path relative to the repository root.
    pub path: PathBuf,
    /// Content with `<<<<<<<`/`=======`/`>>>>>>>` markers.
    pub marked: String,
    /// Content at the merge base, if the file existed there.
    pub base: Option<String>,
    /// Content currently on the main line.
    pub current: Option<String>,
    /// Content from the worker branch.
    pub incoming: Option<String>,
}

/// Every conflicted path of a single merge attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictInfo {
    pub branch_name: String,
    /// Main line commit the merge was attempted against.
    pub main_commit: String,
    /// Tip of the worker branch.
    pub branch_commit: String,
    pub files: Vec<ConflictFile>,
}

impl ConflictInfo {
    pub fn paths(&self) -> Vec<&PathBuf> {
        self.files.iter().map(|f| &f.path).collect()
    }

    pub fn summary(&self) -> String {
        let paths: Vec<String> = self
            .files
            .iter()
            .map(|f| f.path.display().to_string())
            .collect();
        format!(
            "merge conflict on {} in {}",
            self.branch_name,
            paths.join(", ")
        )
    }
}

/// Outcome of merging a worker branch into the main line.
///
/// A successful merge never carries conflict details.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeResult {
    pub success: bool,
    pub branch_name: String,
    /// Main line tip after the merge.
    pub commit: Option<String>,
    pub conflict: Option<ConflictInfo>,
    pub needs_human_review: bool,
}

impl MergeResult {
    pub fn merged(branch_name: &str, commit: String) -> Self {
        Self {
            success: true,
            branch_name: branch_name.to_string(),
            commit: Some(commit),
            conflict: None,
            needs_human_review: false,
        }
    }

    pub fn conflicted(conflict: ConflictInfo) -> Self {
        Self {
            success: false,
            branch_name: conflict.branch_name.clone(),
            commit: None,
            conflict: Some(conflict),
            needs_human_review: true,
        }
    }
}
