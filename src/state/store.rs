//! JSON persistence under the state directory.
//!
//! Layout:
//!
//! ```text
//! <state_dir>/trees/<tree-id>.json
//! <state_dir>/checkpoints/<checkpoint-id>.json
//! ```
//!
//! Writes go to a temp file and are renamed into place; the previous
//! version is kept as `<name>.json.bak`.

use std::fs;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use crate::checkpoint::Checkpoint;
use crate::core::{CheckpointId, TaskTree, TreeId};
use crate::{Error, Result};

const TREES_DIR: &str = "trees";
const CHECKPOINTS_DIR: &str = "checkpoints";

#[derive(Debug, Clone)]
pub struct StateStore {
    root: PathBuf,
}

impl StateStore {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn tree_path(&self, id: &TreeId) -> PathBuf {
        self.root.join(TREES_DIR).join(format!("{}.json", id))
    }

    fn checkpoint_path(&self, id: &CheckpointId) -> PathBuf {
        self.root.join(CHECKPOINTS_DIR).join(format!("{}.json", id))
    }

    // ========== Trees ==========

    pub fn save_tree(&self, tree: &TaskTree) -> Result<()> {
        write_json(&self.tree_path(&tree.id), tree)
    }

    pub fn load_tree(&self, id: &TreeId) -> Result<TaskTree> {
        read_json(&self.tree_path(id))?.ok_or_else(|| Error::TreeNotFound(id.to_string()))
    }

    /// Resolve a full tree id or a unique prefix of one.
    pub fn find_tree(&self, prefix: &str) -> Result<TaskTree> {
        if let Ok(id) = prefix.parse::<TreeId>() {
            return self.load_tree(&id);
        }
        let mut matches = self
            .list_trees()?
            .into_iter()
            .filter(|t| t.id.to_string().starts_with(prefix));
        match (matches.next(), matches.next()) {
            (Some(tree), None) => Ok(tree),
            _ => Err(Error::TreeNotFound(prefix.to_string())),
        }
    }

    /// All stored trees, oldest first.
    pub fn list_trees(&self) -> Result<Vec<TaskTree>> {
        let mut trees: Vec<TaskTree> = read_dir_json(&self.root.join(TREES_DIR))?;
        trees.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(trees)
    }

    // ========== Checkpoints ==========

    pub fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<()> {
        write_json(&self.checkpoint_path(&checkpoint.id), checkpoint)
    }

    pub fn load_checkpoint(&self, id: &CheckpointId) -> Result<Checkpoint> {
        read_json(&self.checkpoint_path(id))?
            .ok_or_else(|| Error::CheckpointNotFound(id.to_string()))
    }

    /// Resolve a full checkpoint id or a unique prefix of one.
    pub fn find_checkpoint(&self, prefix: &str) -> Result<Checkpoint> {
        if let Ok(id) = prefix.parse::<CheckpointId>() {
            return self.load_checkpoint(&id);
        }
        let all: Vec<Checkpoint> = read_dir_json(&self.root.join(CHECKPOINTS_DIR))?;
        let mut matches = all
            .into_iter()
            .filter(|c| c.id.to_string().starts_with(prefix));
        match (matches.next(), matches.next()) {
            (Some(checkpoint), None) => Ok(checkpoint),
            _ => Err(Error::CheckpointNotFound(prefix.to_string())),
        }
    }

    /// Checkpoints of one tree ordered by creation time.
    pub fn list_checkpoints(&self, tree_id: &TreeId) -> Result<Vec<Checkpoint>> {
        let all: Vec<Checkpoint> = read_dir_json(&self.root.join(CHECKPOINTS_DIR))?;
        let mut checkpoints: Vec<Checkpoint> =
            all.into_iter().filter(|c| &c.tree_id == tree_id).collect();
        checkpoints.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(checkpoints)
    }

    pub fn delete_checkpoint(&self, id: &CheckpointId) -> Result<()> {
        let path = self.checkpoint_path(id);
        if path.exists() {
            fs::remove_file(&path)?;
        }
        let backup = path.with_extension("json.bak");
        if backup.exists() {
            fs::remove_file(&backup)?;
        }
        debug!(checkpoint = %id, "checkpoint deleted");
        Ok(())
    }
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)?;
    }
    let contents = serde_json::to_string_pretty(value)?;
    if path.exists() {
        fs::copy(path, path.with_extension("json.bak"))?;
    }
    let temp_path = path.with_extension("json.tmp");
    fs::write(&temp_path, contents)?;
    fs::rename(&temp_path, path)?;
    debug!(path = %path.display(), "state saved");
    Ok(())
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }
    let contents = fs::read_to_string(path)?;
    Ok(Some(serde_json::from_str(&contents)?))
}

/// Every `*.json` in `dir`. Unreadable files are skipped with a warning.
fn read_dir_json<T: DeserializeOwned>(dir: &Path) -> Result<Vec<T>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut out = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        match read_json(&path) {
            Ok(Some(value)) => out.push(value),
            Ok(None) => {}
            Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable state file"),
        }
    }
    Ok(out)
}
