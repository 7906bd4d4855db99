//! # Gauntlet Utilities
//!
//! Small helpers shared across the workspace: POSIX shell quoting for remote
//! command lines, duration parsing and formatting, run-directory resolution,
//! and the environment variable names of the per-test runtime contract.

pub mod duration;
pub mod env;
pub mod shell;
pub mod workdir;

pub use duration::{format_hms, parse_duration};
pub use shell::{join_command, quote};
pub use workdir::{allocate_run_dir, last_run_dir, run_dir_by_id, runs_root};
