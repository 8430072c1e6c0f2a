//! Structured logging for debugging braid.
//!
//! Log lines go to `~/.braid/braid.log`, truncated on every start. The filter
//! comes from `BRAID_LOG` (standard `EnvFilter` syntax) and otherwise defaults
//! to `info`, or `debug` when `--debug` or `BRAID_DEBUG=1` is set.

use std::fs::{File, OpenOptions};
use std::path::PathBuf;
use std::sync::{Mutex, OnceLock};

use tracing_subscriber::EnvFilter;

static LOG_PATH: OnceLock<PathBuf> = OnceLock::new();

pub const FILTER_ENV: &str = "BRAID_LOG";
pub const DEBUG_ENV: &str = "BRAID_DEBUG";

/// Initialize logging at the default level.
pub fn init() {
    init_with_debug(false);
}

/// Initialize logging with explicit debug mode setting.
///
/// Safe to call more than once; only the first call installs a subscriber.
pub fn init_with_debug(debug: bool) {
    let debug_enabled = debug || env_debug();
    let filter = build_filter(debug_enabled, std::env::var(FILTER_ENV).ok().as_deref());

    let Some(file) = open_log_file() else {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .try_init();
        return;
    };

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(false)
        .with_target(true)
        .with_writer(Mutex::new(file))
        .try_init();

    tracing::info!(debug = debug_enabled, "braid logging initialized");
}

/// Path of the active log file, if logging went to a file.
pub fn log_path() -> Option<&'static PathBuf> {
    LOG_PATH.get()
}

fn env_debug() -> bool {
    std::env::var(DEBUG_ENV)
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

fn build_filter(debug: bool, directive: Option<&str>) -> EnvFilter {
    if let Some(directive) = directive.filter(|d| !d.trim().is_empty()) {
        if let Ok(filter) = EnvFilter::try_new(directive) {
            return filter;
        }
    }
    EnvFilter::new(if debug { "debug" } else { "info" })
}

fn open_log_file() -> Option<File> {
    let braid_dir = dirs::home_dir()?.join(".braid");
    std::fs::create_dir_all(&braid_dir).ok()?;
    let path = braid_dir.join("braid.log");
    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&path)
        .ok()?;
    let _ = LOG_PATH.set(path);
    Some(file)
}
