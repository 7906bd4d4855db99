//! # Gauntlet Engine
//!
//! The engine drives test campaigns: it walks every plan of a run through
//! the discover, provision, prepare, execute, report, and finish steps,
//! persisting enough state after each one for an interrupted run to be
//! resumed without repeating finished work.
//!
//! ## Architecture
//!
//! - **`plan`**: campaign file parsing and validation
//! - **`run`**: run directory layout and the persisted step markers
//! - **`steps`**: the pipeline driver and the individual steps
//! - **`execute`**: per-guest test streams and invocation supervision
//! - **`library`**: resolver for helper shell libraries
//! - **`results`**: the persisted results document
//! - **`manage`**: status inspection and run cleanup

mod execute;
pub mod library;
pub mod manage;
pub mod plan;
pub mod results;
pub mod run;
pub mod scripts;
pub mod state;
mod steps;
pub mod topology;

pub use manage::{CleanTarget, PlanProgress, RunOverview, clean, overview};
pub use run::Run;
pub use steps::{ResumeTarget, RunReport, RunRequest, perform_run};
