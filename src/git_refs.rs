//! Pinning refs under the `refs/braid/` namespace.
//!
//! Checkpoints record a main line commit. Rewinding moves the main line
//! backwards, so every checkpoint pins its commit with a ref to keep the
//! later history reachable and safe from garbage collection. Branches kept
//! for conflict-blocked tasks are pinned alongside, so a rewind can bring
//! them back after they were merged or abandoned.

use std::path::{Path, PathBuf};

use git2::{ErrorCode, Oid, Repository};
use tracing::debug;

use crate::core::CheckpointId;
use crate::Result;

const BRAID_REFS_PREFIX: &str = "refs/braid/";
const CHECKPOINT_SCOPE: &str = "checkpoints/";
const BRANCH_SCOPE: &str = "branches/";

#[derive(Debug, Clone)]
pub struct GitRefs {
    repo_path: PathBuf,
}

impl GitRefs {
    pub fn new(repo_path: &Path) -> Result<Self> {
        let repo = Repository::discover(repo_path)?;
        Ok(Self {
            repo_path: repo.path().to_path_buf(),
        })
    }

    fn repo(&self) -> Result<Repository> {
        Ok(Repository::open(&self.repo_path)?)
    }

    fn full_ref_name(name: &str) -> String {
        format!("{}{}", BRAID_REFS_PREFIX, name)
    }

    /// Point `refs/braid/{name}` at `target`, replacing any previous value.
    pub fn pin(&self, name: &str, target: &str) -> Result<()> {
        let repo = self.repo()?;
        let refname = Self::full_ref_name(name);
        let oid = Oid::from_str(target)?;
        repo.find_commit(oid)?;
        repo.reference(&refname, oid, true, "braid: pin")?;
        debug!(refname, target, "ref pinned");
        Ok(())
    }

    pub fn read(&self, name: &str) -> Result<Option<String>> {
        let repo = self.repo()?;
        let target = match repo.find_reference(&Self::full_ref_name(name)) {
            Ok(reference) => reference.target().map(|oid| oid.to_string()),
            Err(e) if e.code() == ErrorCode::NotFound => None,
            Err(e) => return Err(e.into()),
        };
        Ok(target)
    }

    /// Idempotent: missing refs are fine.
    pub fn unpin(&self, name: &str) -> Result<()> {
        let repo = self.repo()?;
        let refname = Self::full_ref_name(name);
        let mut reference = match repo.find_reference(&refname) {
            Ok(reference) => reference,
            Err(e) if e.code() == ErrorCode::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        reference.delete()?;
        debug!(refname, "ref deleted");
        Ok(())
    }

    /// Short names (without `refs/braid/`) under an optional sub-prefix.
    pub fn list(&self, prefix: Option<&str>) -> Result<Vec<String>> {
        let repo = self.repo()?;
        let glob = format!("{}{}*", BRAID_REFS_PREFIX, prefix.unwrap_or(""));
        let mut names = Vec::new();
        for reference in repo.references_glob(&glob)? {
            if let Some(name) = reference?.name() {
                if let Some(short) = name.strip_prefix(BRAID_REFS_PREFIX) {
                    names.push(short.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    pub fn pin_checkpoint(&self, id: &CheckpointId, commit: &str) -> Result<()> {
        self.pin(&checkpoint_ref(id), commit)
    }

    pub fn checkpoint_commit(&self, id: &CheckpointId) -> Result<Option<String>> {
        self.read(&checkpoint_ref(id))
    }

    pub fn unpin_checkpoint(&self, id: &CheckpointId) -> Result<()> {
        self.unpin(&checkpoint_ref(id))
    }

    /// Pin the `slot`-th preserved branch of a checkpoint.
    pub fn pin_branch(&self, checkpoint: &CheckpointId, slot: usize, commit: &str) -> Result<()> {
        self.pin(&branch_ref(checkpoint, slot), commit)
    }

    pub fn pinned_branch(&self, checkpoint: &CheckpointId, slot: usize) -> Result<Option<String>> {
        self.read(&branch_ref(checkpoint, slot))
    }

    /// Drop every branch pin of a checkpoint. Returns how many there were.
    pub fn unpin_branches(&self, checkpoint: &CheckpointId) -> Result<usize> {
        let names = self.list(Some(&format!("{}{}/", BRANCH_SCOPE, checkpoint)))?;
        for name in &names {
            self.unpin(name)?;
        }
        Ok(names.len())
    }

    pub fn pinned_checkpoints(&self) -> Result<Vec<String>> {
        Ok(self
            .list(Some(CHECKPOINT_SCOPE))?
            .into_iter()
            .filter_map(|name| name.strip_prefix(CHECKPOINT_SCOPE).map(str::to_string))
            .collect())
    }
}

fn checkpoint_ref(id: &CheckpointId) -> String {
    format!("{}{}", CHECKPOINT_SCOPE, id)
}

fn branch_ref(checkpoint: &CheckpointId, slot: usize) -> String {
    format!("{}{}/{}", BRANCH_SCOPE, checkpoint, slot)
}
