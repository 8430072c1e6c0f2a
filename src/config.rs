use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::debug;

use crate::{Error, Result};

/// Name of the repository-local override file.
pub const LOCAL_CONFIG_FILE: &str = ".braid.toml";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Shell command run for each task inside its worktree.
    pub worker_command: Option<String>,
    /// Command run after the worker to record a test run.
    pub test_command: Option<String>,
    /// Command asked to resolve merge conflicts; reads the conflict as JSON on stdin.
    pub resolve_command: Option<String>,
    pub max_parallel: usize,
    pub max_retries: u32,
    pub task_timeout_secs: u64,
    /// Take a checkpoint every N passed tasks. Zero disables.
    pub checkpoint_every: usize,
    pub checkpoint_before_complex: bool,
    /// Checkpoints kept per tree; older ones are pruned.
    pub checkpoint_retention: Option<usize>,
    /// Main line branch; the repository's current branch when unset.
    pub main_branch: Option<String>,
    pub branch_prefix: String,
    pub worktree_dir: Option<String>,
    pub state_dir: Option<String>,
    pub auto_resolve: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            worker_command: None,
            test_command: None,
            resolve_command: None,
            max_parallel: 4,
            max_retries: 2,
            task_timeout_secs: 600,
            checkpoint_every: 5,
            checkpoint_before_complex: true,
            checkpoint_retention: None,
            main_branch: None,
            branch_prefix: "braid".to_string(),
            worktree_dir: None,
            state_dir: None,
            auto_resolve: true,
        }
    }
}

impl Config {
    pub fn braid_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".braid"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::braid_dir()?.join("braid.toml"))
    }

    pub fn worktrees_dir(&self) -> Result<PathBuf> {
        match &self.worktree_dir {
            Some(dir) => Ok(expand_tilde(dir)),
            None => Ok(Self::braid_dir()?.join("worktrees")),
        }
    }

    pub fn state_dir(&self) -> Result<PathBuf> {
        match &self.state_dir {
            Some(dir) => Ok(expand_tilde(dir)),
            None => Ok(Self::braid_dir()?.join("state")),
        }
    }

    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.task_timeout_secs)
    }

    /// Load the user config, then apply `.braid.toml` from `repo` if present.
    pub fn load_for_repo(repo: &Path) -> Result<Self> {
        let base = Self::load()?;
        let local = repo.join(LOCAL_CONFIG_FILE);
        if !local.exists() {
            return Ok(base);
        }
        debug!(path = %local.display(), "applying repository config");
        let overrides: toml::Table = toml::from_str(&fs::read_to_string(&local)?)?;
        base.merged_with(overrides)
    }

    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        debug!(path = %path.display(), "Config::load");
        if !path.exists() {
            debug!("config file not found, using defaults");
            return Ok(Self::default());
        }
        Self::from_file(&path)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let config: Self = toml::from_str(&fs::read_to_string(path)?)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let braid_dir = Self::braid_dir()?;
        if !braid_dir.exists() {
            fs::create_dir_all(&braid_dir)?;
        }
        let path = Self::config_path()?;
        fs::write(&path, toml::to_string_pretty(self)?)?;
        debug!(path = %path.display(), "config saved");
        Ok(())
    }

    pub fn ensure_dirs(&self) -> Result<()> {
        for dir in [Self::braid_dir()?, self.worktrees_dir()?, self.state_dir()?] {
            if !dir.exists() {
                debug!(dir = %dir.display(), "creating directory");
                fs::create_dir_all(&dir)?;
            }
        }
        Ok(())
    }

    fn merged_with(&self, overrides: toml::Table) -> Result<Self> {
        let mut table = toml::Table::try_from(self)?;
        for (key, value) in overrides {
            table.insert(key, value);
        }
        let merged: Self = table.try_into()?;
        merged.validate()?;
        Ok(merged)
    }

    fn validate(&self) -> Result<()> {
        if self.max_parallel == 0 {
            return Err(Error::Config("max_parallel must be at least 1".to_string()));
        }
        if self.branch_prefix.trim().is_empty() || self.branch_prefix.contains(' ') {
            return Err(Error::Config(format!(
                "invalid branch_prefix '{}'",
                self.branch_prefix
            )));
        }
        if self.checkpoint_retention == Some(0) {
            return Err(Error::Config(
                "checkpoint_retention must keep at least one checkpoint".to_string(),
            ));
        }
        Ok(())
    }
}

pub(crate) fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
