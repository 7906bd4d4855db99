//! # Gauntlet Types
//!
//! Shared type definitions for the gauntlet test-campaign executor: the
//! outcome/severity model, persisted result records, test definitions with
//! their restart policy, guest descriptor records, and the step pipeline.
//!
//! Everything persisted to disk lives here so that every crate reads and
//! writes the same wire format: YAML documents with kebab-case keys.

pub mod guest;
pub mod outcome;
pub mod result;
pub mod step;
pub mod test;

pub use guest::{GuestCapabilities, GuestRecord, SshDescriptor, TransportDescriptor};
pub use outcome::Outcome;
pub use result::{
    EXIT_ERROR, EXIT_FAIL, EXIT_OK, EXIT_WARN, RESULTS_FORMAT_COMPAT, RESULTS_FORMAT_VERSION,
    ResultFormatError, ResultsDocument, SubResult, TestResult, Totals,
};
pub use step::Step;
pub use test::{LibraryRequirement, RestartPolicy, ResultInterpretation, Test, TestSpec};
