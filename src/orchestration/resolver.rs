//! Merge mechanics for worker branches.
//!
//! Merges are computed in memory with `merge_commits`, so neither the
//! worker's worktree nor any other branch is touched. Only a clean result
//! (or an accepted resolution) moves the main line.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use git2::{BranchType, Commit, ErrorCode, Index, IndexEntry, IndexTime, MergeFileOptions, Repository};
use tracing::{debug, info};

use crate::core::{ConflictFile, ConflictInfo};
use crate::error::ConcurrencyError;
use crate::git::{move_branch, signature, GitOps};
use crate::orchestration::executor::ResolvedFile;
use crate::Result;

/// How a merge attempt ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    /// The branch adds nothing the main line doesn't have.
    UpToDate { commit: String },
    FastForward { commit: String },
    Merged { commit: String },
    Conflicted(ConflictInfo),
}

impl MergeOutcome {
    pub fn commit(&self) -> Option<&str> {
        match self {
            MergeOutcome::UpToDate { commit }
            | MergeOutcome::FastForward { commit }
            | MergeOutcome::Merged { commit } => Some(commit),
            MergeOutcome::Conflicted(_) => None,
        }
    }
}

/// Merges worker branches into the main line.
#[derive(Debug, Clone)]
pub struct ConflictResolver {
    git_ops: GitOps,
}

impl ConflictResolver {
    pub fn new(git_ops: GitOps) -> Self {
        Self { git_ops }
    }

    pub fn git_ops(&self) -> &GitOps {
        &self.git_ops
    }

    /// Three-way merge `branch` into `main_branch`.
    ///
    /// Up-to-date and fast-forward cases are detected first. A conflicting
    /// merge leaves the main line untouched and returns the conflict details.
    pub fn merge(&self, main_branch: &str, branch: &str, message: &str) -> Result<MergeOutcome> {
        let repo = self.git_ops.open()?;
        let main_commit = main_tip(&repo, main_branch)?;
        let branch_commit = repo
            .find_branch(branch, BranchType::Local)?
            .get()
            .peel_to_commit()?;
        let (main_id, branch_id) = (main_commit.id(), branch_commit.id());

        if main_id == branch_id || repo.graph_descendant_of(main_id, branch_id)? {
            debug!(branch, "branch already contained in main line");
            return Ok(MergeOutcome::UpToDate {
                commit: main_id.to_string(),
            });
        }

        if repo.graph_descendant_of(branch_id, main_id)? {
            move_branch(&repo, main_branch, branch_id, &format!("braid: fast-forward {}", branch))?;
            info!(branch, commit = %branch_id, "fast-forwarded main line");
            return Ok(MergeOutcome::FastForward {
                commit: branch_id.to_string(),
            });
        }

        let mut index = repo.merge_commits(&main_commit, &branch_commit, None)?;
        if index.has_conflicts() {
            let conflict = extract_conflicts(&repo, &index, main_branch, branch, &main_commit, &branch_commit)?;
            info!(branch, files = conflict.files.len(), "merge conflict");
            return Ok(MergeOutcome::Conflicted(conflict));
        }

        let commit = self.write_merge(&repo, &mut index, main_branch, &main_commit, &branch_commit, message)?;
        info!(branch, commit = %commit, "merged into main line");
        Ok(MergeOutcome::Merged { commit })
    }

    /// Redo the merge described by `conflict` with resolved contents.
    ///
    /// Returns `None` when the resolution doesn't clear every conflict or
    /// either side has moved since the conflict was recorded.
    pub fn merge_resolved(
        &self,
        main_branch: &str,
        conflict: &ConflictInfo,
        files: &[ResolvedFile],
        message: &str,
    ) -> Result<Option<String>> {
        let repo = self.git_ops.open()?;
        let main_commit = main_tip(&repo, main_branch)?;
        let branch_commit = repo
            .find_branch(&conflict.branch_name, BranchType::Local)?
            .get()
            .peel_to_commit()?;
        if main_commit.id().to_string() != conflict.main_commit
            || branch_commit.id().to_string() != conflict.branch_commit
        {
            debug!(branch = %conflict.branch_name, "stale conflict, not applying resolution");
            return Ok(None);
        }

        let mut index = repo.merge_commits(&main_commit, &branch_commit, None)?;
        let mut modes: HashMap<PathBuf, u32> = HashMap::new();
        for entry in index.conflicts()? {
            let entry = entry?;
            let side = entry.our.as_ref().or(entry.their.as_ref()).or(entry.ancestor.as_ref());
            if let Some(side) = side {
                modes.insert(entry_path(side), side.mode);
            }
        }

        for file in files {
            let Some(mode) = modes.get(&file.path) else {
                continue;
            };
            index.conflict_remove(&file.path)?;
            if let Some(content) = &file.content {
                let id = repo.blob(content.as_bytes())?;
                index.add(&resolved_entry(&file.path, *mode, id, content.len()))?;
            }
        }
        if index.has_conflicts() {
            return Ok(None);
        }

        let commit = self.write_merge(&repo, &mut index, main_branch, &main_commit, &branch_commit, message)?;
        info!(branch = %conflict.branch_name, commit = %commit, "merged with resolution");
        Ok(Some(commit))
    }

    fn write_merge(
        &self,
        repo: &Repository,
        index: &mut Index,
        main_branch: &str,
        main_commit: &Commit<'_>,
        branch_commit: &Commit<'_>,
        message: &str,
    ) -> Result<String> {
        let tree_id = index.write_tree_to(repo)?;
        let tree = repo.find_tree(tree_id)?;
        let sig = signature(repo)?;
        let oid = repo.commit(None, &sig, &sig, message, &tree, &[main_commit, branch_commit])?;
        move_branch(repo, main_branch, oid, message)?;
        Ok(oid.to_string())
    }
}

/// Checks a proposed resolution against the conflict it answers.
///
/// Every conflicted path needs an entry and no content may keep markers.
pub fn check_resolution(conflict: &ConflictInfo, files: &[ResolvedFile]) -> std::result::Result<(), String> {
    for conflicted in &conflict.files {
        let Some(file) = files.iter().find(|f| f.path == conflicted.path) else {
            return Err(format!("{} was not resolved", conflicted.path.display()));
        };
        if file.content.as_deref().is_some_and(has_conflict_markers) {
            return Err(format!(
                "{} still contains conflict markers",
                conflicted.path.display()
            ));
        }
    }
    Ok(())
}

pub fn has_conflict_markers(content: &str) -> bool {
    content.lines().any(|line| {
        line.starts_with("<<<<<<<") || line.starts_with(">>>>>>>") || line.trim_end() == "======="
    })
}

fn main_ref(main_branch: &str) -> String {
    format!("refs/heads/{}", main_branch)
}

fn main_tip<'r>(repo: &'r Repository, main_branch: &str) -> Result<Commit<'r>> {
    match repo.find_reference(&main_ref(main_branch)) {
        Ok(reference) => Ok(reference.peel_to_commit()?),
        Err(e) if e.code() == ErrorCode::NotFound => {
            Err(ConcurrencyError::MainLineMissing(main_branch.to_string()).into())
        }
        Err(e) => Err(e.into()),
    }
}

fn entry_path(entry: &IndexEntry) -> PathBuf {
    PathBuf::from(String::from_utf8_lossy(&entry.path).to_string())
}

fn resolved_entry(path: &Path, mode: u32, id: git2::Oid, len: usize) -> IndexEntry {
    IndexEntry {
        ctime: IndexTime::new(0, 0),
        mtime: IndexTime::new(0, 0),
        dev: 0,
        ino: 0,
        mode,
        uid: 0,
        gid: 0,
        file_size: index_size(len),
        id,
        flags: 0,
        flags_extended: 0,
        path: path.to_string_lossy().as_bytes().to_vec(),
    }
}

/// Index entries carry a 32-bit size; larger files saturate instead of wrapping.
fn index_size(len: usize) -> u32 {
    u32::try_from(len).unwrap_or(u32::MAX)
}

fn read_blob(repo: &Repository, entry: Option<&IndexEntry>) -> Result<Option<String>> {
    match entry {
        Some(e) if !e.id.is_zero() => {
            let blob = repo.find_blob(e.id)?;
            Ok(Some(String::from_utf8_lossy(blob.content()).to_string()))
        }
        _ => Ok(None),
    }
}

fn extract_conflicts(
    repo: &Repository,
    index: &Index,
    main_branch: &str,
    branch: &str,
    main_commit: &Commit<'_>,
    branch_commit: &Commit<'_>,
) -> Result<ConflictInfo> {
    let mut files = Vec::new();
    for conflict in index.conflicts()? {
        let conflict = conflict?;
        let Some(any_side) = conflict
            .our
            .as_ref()
            .or(conflict.their.as_ref())
            .or(conflict.ancestor.as_ref())
        else {
            continue;
        };
        let path = entry_path(any_side);
        let base = read_blob(repo, conflict.ancestor.as_ref())?;
        let current = read_blob(repo, conflict.our.as_ref())?;
        let incoming = read_blob(repo, conflict.their.as_ref())?;

        let marked = match (&conflict.ancestor, &conflict.our, &conflict.their) {
            (Some(ancestor), Some(ours), Some(theirs)) => {
                let mut opts = MergeFileOptions::new();
                opts.our_label(main_branch).their_label(branch);
                let merged = repo.merge_file_from_index(ancestor, ours, theirs, Some(&mut opts))?;
                String::from_utf8_lossy(merged.content()).to_string()
            }
            _ => whole_file_markers(main_branch, branch, current.as_deref(), incoming.as_deref()),
        };

        files.push(ConflictFile {
            path,
            marked,
            base,
            current,
            incoming,
        });
    }
    files.sort_by(|a, b| a.path.cmp(&b.path));

    Ok(ConflictInfo {
        branch_name: branch.to_string(),
        main_commit: main_commit.id().to_string(),
        branch_commit: branch_commit.id().to_string(),
        files,
    })
}

/// Markers around both full versions, for add/add and modify/delete conflicts.
fn whole_file_markers(main_branch: &str, branch: &str, current: Option<&str>, incoming: Option<&str>) -> String {
    let mut out = format!("<<<<<<< {}\n", main_branch);
    push_terminated(&mut out, current.unwrap_or(""));
    out.push_str("=======\n");
    push_terminated(&mut out, incoming.unwrap_or(""));
    out.push_str(&format!(">>>>>>> {}\n", branch));
    out
}

fn push_terminated(out: &mut String, content: &str) {
    out.push_str(content);
    if !content.is_empty() && !content.ends_with('\n') {
        out.push('\n');
    }
}
