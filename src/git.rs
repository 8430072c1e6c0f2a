use std::fs;
use std::path::{Component, Path, PathBuf};

use git2::build::CheckoutBuilder;
use git2::{
    BranchType, Delta, DiffFormat, ErrorCode, IndexAddOption, Oid, Patch, Repository, Signature,
    Sort, StatusOptions,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{Error, Result};

/// One change a worker made (or wants made) inside its worktree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "op")]
pub enum FileChange {
    /// Replace the file with `content`, creating parent directories.
    Write { path: PathBuf, content: String },
    Delete { path: PathBuf },
    /// Already modified on disk by the worker.
    Touched { path: PathBuf },
}

impl FileChange {
    pub fn path(&self) -> &Path {
        match self {
            FileChange::Write { path, .. }
            | FileChange::Delete { path }
            | FileChange::Touched { path } => path,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Added,
    Deleted,
    Modified,
    Renamed,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDiff {
    pub path: PathBuf,
    pub kind: ChangeKind,
    pub insertions: usize,
    pub deletions: usize,
}

/// Content difference between two commits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitDiff {
    pub from: String,
    pub to: String,
    pub files: Vec<FileDiff>,
    /// Unified patch text.
    pub patch: String,
}

impl CommitDiff {
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct GitOps {
    repo_path: PathBuf,
}

impl GitOps {
    pub fn new(repo_path: &Path) -> Result<Self> {
        debug!(path = %repo_path.display(), "GitOps::new");
        let repo = Repository::discover(repo_path)?;
        let root = repo
            .workdir()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| repo.path().to_path_buf());
        Ok(Self { repo_path: root })
    }

    pub fn open(&self) -> Result<Repository> {
        Ok(Repository::open(&self.repo_path)?)
    }

    pub fn repo_path(&self) -> &Path {
        &self.repo_path
    }

    /// Name of the branch HEAD points at.
    pub fn current_branch(&self) -> Result<String> {
        let repo = self.open()?;
        let head = repo.head()?;
        if head.is_branch() {
            if let Some(name) = head.shorthand() {
                return Ok(name.to_string());
            }
        }
        Err(Error::Config(
            "HEAD is detached; set main_branch explicitly".to_string(),
        ))
    }

    pub fn branch_tip(&self, branch: &str) -> Result<Option<String>> {
        let repo = self.open()?;
        let tip = match repo.find_branch(branch, BranchType::Local) {
            Ok(b) => Some(b.get().peel_to_commit()?.id().to_string()),
            Err(e) if e.code() == ErrorCode::NotFound => None,
            Err(e) => return Err(e.into()),
        };
        Ok(tip)
    }

    pub fn branch_exists(&self, branch: &str) -> Result<bool> {
        Ok(self.branch_tip(branch)?.is_some())
    }

    pub fn create_branch(&self, branch: &str, commit: &str) -> Result<()> {
        let repo = self.open()?;
        let commit = repo.find_commit(Oid::from_str(commit)?)?;
        repo.branch(branch, &commit, false)?;
        debug!(branch, commit = %commit.id(), "branch created");
        Ok(())
    }

    /// Create `branch` at `base_commit` and check it out in a new worktree.
    pub fn create_worktree(&self, branch: &str, base_commit: &str, worktree_path: &Path) -> Result<()> {
        debug!(branch, path = %worktree_path.display(), "GitOps::create_worktree");
        self.create_branch(branch, base_commit)?;
        self.attach_worktree(branch, worktree_path)
    }

    /// Check out an existing branch in a new worktree.
    pub fn attach_worktree(&self, branch: &str, worktree_path: &Path) -> Result<()> {
        let repo = self.open()?;
        let reference = repo.find_branch(branch, BranchType::Local)?.into_reference();
        let mut opts = git2::WorktreeAddOptions::new();
        opts.reference(Some(&reference));
        if let Some(parent) = worktree_path.parent() {
            fs::create_dir_all(parent)?;
        }
        // Worktree names can't contain slashes; the folder name is unique per task.
        let name = worktree_name(worktree_path, branch);
        repo.worktree(&name, worktree_path, Some(&opts))?;
        debug!(branch, worktree = %name, "worktree attached");
        Ok(())
    }

    /// Remove a worktree and its admin files so the branch is no longer
    /// considered checked out. Keeps going when individual steps fail.
    pub fn remove_worktree(&self, worktree_path: &Path) -> Result<()> {
        debug!(path = %worktree_path.display(), "GitOps::remove_worktree");
        let repo = self.open()?;
        let folder = worktree_path
            .file_name()
            .and_then(|n| n.to_str())
            .map(str::to_string);

        let names: Vec<String> = repo.worktrees()?.iter().flatten().map(String::from).collect();
        let known = names.iter().find(|name| {
            repo.find_worktree(name)
                .map(|wt| wt.path() == worktree_path)
                .unwrap_or(false)
                || Some(name.as_str()) == folder.as_deref()
        });

        if let Some(name) = known {
            if let Ok(worktree) = repo.find_worktree(name) {
                let _ = worktree.unlock();
                if let Err(e) = worktree.prune(Some(
                    git2::WorktreePruneOptions::new()
                        .valid(true)
                        .working_tree(true)
                        .locked(true),
                )) {
                    warn!(worktree = %name, error = %e, "worktree prune failed");
                }
            }
        }

        if worktree_path.exists() {
            fs::remove_dir_all(worktree_path)?;
        }

        // A leftover .git/worktrees/<name> keeps the branch marked as checked out.
        for name in known.into_iter().chain(folder.as_ref()) {
            let admin_dir = repo.path().join("worktrees").join(name);
            if admin_dir.exists() {
                debug!(dir = %admin_dir.display(), "removing worktree admin dir");
                let _ = fs::remove_dir_all(&admin_dir);
            }
        }
        Ok(())
    }

    /// Delete a local branch. Missing branches are not an error.
    pub fn delete_branch(&self, branch: &str) -> Result<()> {
        let repo = self.open()?;
        let mut found = match repo.find_branch(branch, BranchType::Local) {
            Ok(b) => b,
            Err(e) if e.code() == ErrorCode::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        if let Err(e) = found.delete() {
            warn!(branch, error = %e, "branch delete failed, removing ref directly");
            let mut reference = repo.find_reference(&format!("refs/heads/{}", branch))?;
            reference.delete()?;
        }
        debug!(branch, "branch deleted");
        Ok(())
    }

    /// Point `branch` at `commit`, refreshing the main checkout if it has
    /// that branch checked out.
    pub fn set_branch_tip(&self, branch: &str, commit: &str, message: &str) -> Result<()> {
        let repo = self.open()?;
        let oid = Oid::from_str(commit)?;
        move_branch(&repo, branch, oid, message)
    }
    /// Apply changes to files inside `worktree`.
    pub fn apply_changes(worktree: &Path, changes: &[FileChange]) -> Result<()> {
        for change in changes {
            let relative = change.path();
            if !is_contained(relative) {
                return Err(Error::Contract(format!(
                    "change path escapes the worktree: {}",
                    relative.display()
                )));
            }
            let full = worktree.join(relative);
            match change {
                FileChange::Write { content, .. } => {
                    if let Some(parent) = full.parent() {
                        fs::create_dir_all(parent)?;
                    }
                    fs::write(&full, content)?;
                }
                FileChange::Delete { .. } => {
                    if full.exists() {
                        fs::remove_file(&full)?;
                    }
                }
                FileChange::Touched { .. } => {}
            }
        }
        Ok(())
    }

    /// Stage everything in `worktree` and commit it.
    ///
    /// Returns `None` when the staged tree equals the current commit's tree.
    pub fn commit_all(&self, worktree: &Path, message: &str) -> Result<Option<String>> {
        let repo = Repository::open(worktree)?;
        let mut index = repo.index()?;
        index.add_all(["."].iter(), IndexAddOption::DEFAULT, None)?;
        index.update_all(["."].iter(), None)?;
        index.write()?;

        let tree_id = index.write_tree()?;
        let parent = match repo.head() {
            Ok(head) => Some(head.peel_to_commit()?),
            Err(e) if e.code() == ErrorCode::UnbornBranch => None,
            Err(e) => return Err(e.into()),
        };
        if parent.as_ref().map(|p| p.tree_id()) == Some(tree_id) {
            debug!(path = %worktree.display(), "nothing to commit");
            return Ok(None);
        }

        let tree = repo.find_tree(tree_id)?;
        let sig = signature(&repo)?;
        let parents: Vec<&git2::Commit> = parent.iter().collect();
        let commit_id = repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &parents)?;
        debug!(commit = %commit_id, "commit created");
        Ok(Some(commit_id.to_string()))
    }

    /// Paths with uncommitted changes in `worktree`, untracked files included.
    pub fn changed_files(worktree: &Path) -> Result<Vec<PathBuf>> {
        let repo = Repository::open(worktree)?;
        let mut opts = StatusOptions::new();
        opts.include_untracked(true).recurse_untracked_dirs(true);
        let statuses = repo.statuses(Some(&mut opts))?;
        let mut paths: Vec<PathBuf> = statuses
            .iter()
            .filter_map(|entry| entry.path().map(PathBuf::from))
            .collect();
        paths.sort();
        Ok(paths)
    }

    pub fn is_dirty(worktree: &Path) -> Result<bool> {
        Ok(!Self::changed_files(worktree)?.is_empty())
    }

    /// File-level stats and patch text between two commits.
    pub fn diff_commits(&self, from: &str, to: &str) -> Result<CommitDiff> {
        let repo = self.open()?;
        let from_tree = repo.find_commit(Oid::from_str(from)?)?.tree()?;
        let to_tree = repo.find_commit(Oid::from_str(to)?)?.tree()?;
        let diff = repo.diff_tree_to_tree(Some(&from_tree), Some(&to_tree), None)?;

        let mut files = Vec::new();
        for (idx, delta) in diff.deltas().enumerate() {
            let path = delta
                .new_file()
                .path()
                .or_else(|| delta.old_file().path())
                .map(Path::to_path_buf)
                .unwrap_or_default();
            let (insertions, deletions) = match Patch::from_diff(&diff, idx)? {
                Some(patch) => {
                    let (_, added, removed) = patch.line_stats()?;
                    (added, removed)
                }
                None => (0, 0),
            };
            let kind = match delta.status() {
                Delta::Added | Delta::Untracked => ChangeKind::Added,
                Delta::Deleted => ChangeKind::Deleted,
                Delta::Modified => ChangeKind::Modified,
                Delta::Renamed => ChangeKind::Renamed,
                _ => ChangeKind::Other,
            };
            files.push(FileDiff {
                path,
                kind,
                insertions,
                deletions,
            });
        }

        let mut patch = String::new();
        diff.print(DiffFormat::Patch, |_delta, _hunk, line| {
            if matches!(line.origin(), '+' | '-' | ' ') {
                patch.push(line.origin());
            }
            patch.push_str(&String::from_utf8_lossy(line.content()));
            true
        })?;

        Ok(CommitDiff {
            from: from.to_string(),
            to: to.to_string(),
            files,
            patch,
        })
    }

    /// Commits reachable from `branch` following first parents, newest first.
    pub fn first_parent_history(&self, branch: &str, limit: usize) -> Result<Vec<String>> {
        let repo = self.open()?;
        let mut walk = repo.revwalk()?;
        walk.push_ref(&format!("refs/heads/{}", branch))?;
        walk.simplify_first_parent()?;
        walk.set_sorting(Sort::TOPOLOGICAL)?;
        let mut commits = Vec::new();
        for oid in walk.take(limit) {
            commits.push(oid?.to_string());
        }
        Ok(commits)
    }

    /// Content of `path` at `commit`, if the file exists there.
    pub fn file_at(&self, commit: &str, path: &Path) -> Result<Option<String>> {
        let repo = self.open()?;
        let tree = repo.find_commit(Oid::from_str(commit)?)?.tree()?;
        let content = match tree.get_path(path) {
            Ok(entry) => {
                let blob = repo.find_blob(entry.id())?;
                Some(String::from_utf8_lossy(blob.content()).to_string())
            }
            Err(e) if e.code() == ErrorCode::NotFound => None,
            Err(e) => return Err(e.into()),
        };
        Ok(content)
    }
}

/// Move `branch` to `target`.
///
/// When the primary checkout has `branch` checked out, its files are
/// updated first with a safe checkout against the old tip. Local edits are
/// never overwritten: a checkout that would touch an edited file is skipped
/// with a warning and only the ref moves.
pub(crate) fn move_branch(repo: &Repository, branch: &str, target: Oid, message: &str) -> Result<()> {
    let commit = repo.find_commit(target)?;
    if checked_out_in_primary(repo, branch) {
        let mut opts = CheckoutBuilder::new();
        opts.safe();
        if let Err(e) = repo.checkout_tree(commit.as_object(), Some(&mut opts)) {
            warn!(branch, error = %e, "checkout has local edits, leaving its files alone");
        }
    }
    repo.reference(&format!("refs/heads/{}", branch), target, true, message)?;
    Ok(())
}

fn checked_out_in_primary(repo: &Repository, branch: &str) -> bool {
    if repo.is_bare() {
        return false;
    }
    match repo.head() {
        Ok(head) => head.is_branch() && head.shorthand() == Some(branch),
        Err(_) => false,
    }
}

pub(crate) fn signature(repo: &Repository) -> Result<Signature<'static>> {
    Ok(repo
        .signature()
        .or_else(|_| Signature::now("braid", "braid@localhost"))?)
}

fn worktree_name(worktree_path: &Path, branch: &str) -> String {
    worktree_path
        .file_name()
        .and_then(|n| n.to_str())
        .map(str::to_string)
        .unwrap_or_else(|| branch.replace('/', "-"))
}

fn is_contained(path: &Path) -> bool {
    !path.as_os_str().is_empty()
        && path
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}
