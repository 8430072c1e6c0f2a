pub mod checkpoint;
pub mod config;
pub mod core;
pub mod error;
pub mod git;
pub mod git_refs;
pub mod log;
pub mod orchestration;
pub mod plan;
pub mod state;
pub mod util;

pub use error::{Error, Result};
