//! Persisted result records, the results file version gate, and run totals.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::outcome::Outcome;

/// Format version written into every results file.
pub const RESULTS_FORMAT_VERSION: u32 = 1;

/// Oldest format version this reader still accepts.
pub const RESULTS_FORMAT_COMPAT: u32 = 1;

/// One explicit in-test outcome report. A test may produce several.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SubResult {
    pub name: String,
    pub result: Outcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub log: Vec<String>,
}

/// Final record for one test, persisted as part of a results file.
///
/// A test's outcome equals the most severe subresult when any were reported;
/// otherwise it is derived from the exit status of the test process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct TestResult {
    pub name: String,
    pub result: Outcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub log: Vec<String>,
    pub serial_number: u64,
    pub guest: String,
    /// Wall-clock duration of the test, formatted "HH:MM:SS".
    pub duration: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub subresult: Vec<SubResult>,
}

impl TestResult {
    /// Most severe subresult outcome, `None` when the test never reported.
    pub fn subresult_outcome(&self) -> Option<Outcome> {
        Outcome::aggregate(self.subresult.iter().map(|sub| sub.result))
    }
}

/// On-disk results file: a version gate plus the result list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ResultsDocument {
    #[serde(default = "current_version")]
    pub version: u32,
    #[serde(default)]
    pub results: Vec<TestResult>,
}

fn current_version() -> u32 {
    RESULTS_FORMAT_VERSION
}

impl ResultsDocument {
    pub fn new(results: Vec<TestResult>) -> Self {
        Self {
            version: RESULTS_FORMAT_VERSION,
            results,
        }
    }

    /// Reject documents written by readers outside the compatibility window.
    pub fn check_version(&self, path: &str) -> Result<(), ResultFormatError> {
        if self.version < RESULTS_FORMAT_COMPAT || self.version > RESULTS_FORMAT_VERSION {
            return Err(ResultFormatError::Incompatible {
                path: path.to_string(),
                found: self.version,
                minimum: RESULTS_FORMAT_COMPAT,
                current: RESULTS_FORMAT_VERSION,
            });
        }
        Ok(())
    }
}

/// Errors raised while reading or writing a results file.
#[derive(Debug, Error)]
pub enum ResultFormatError {
    #[error("results file '{path}' uses format version {found}; this reader supports versions {minimum} through {current}")]
    Incompatible {
        path: String,
        found: u32,
        minimum: u32,
        current: u32,
    },
    #[error("results file '{path}' could not be parsed: {source}")]
    Malformed {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("results file '{path}' could not be accessed: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Per-outcome counters used for the run summary and the process exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Totals {
    pub skipped: usize,
    pub passed: usize,
    pub info: usize,
    pub warned: usize,
    pub failed: usize,
    pub errored: usize,
    pub pending: usize,
}

/// Process exit code: every test passed or only benign outcomes occurred.
pub const EXIT_OK: i32 = 0;
/// Process exit code: at least one test failed.
pub const EXIT_FAIL: i32 = 1;
/// Process exit code: an infrastructure error occurred.
pub const EXIT_ERROR: i32 = 2;
/// Process exit code: warnings were reported, but nothing failed.
pub const EXIT_WARN: i32 = 3;

impl Totals {
    pub fn from_results<'a, I>(results: I) -> Self
    where
        I: IntoIterator<Item = &'a TestResult>,
    {
        let mut totals = Totals::default();
        for result in results {
            totals.count(result.result);
        }
        totals
    }

    pub fn count(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Skip => self.skipped += 1,
            Outcome::Pass => self.passed += 1,
            Outcome::Info => self.info += 1,
            Outcome::Warn => self.warned += 1,
            Outcome::Fail => self.failed += 1,
            Outcome::Error => self.errored += 1,
            Outcome::Pending => self.pending += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.skipped + self.passed + self.info + self.warned + self.failed + self.errored + self.pending
    }

    /// Tests that actually ran: everything except skipped and pending ones.
    pub fn executed(&self) -> usize {
        self.total() - self.skipped - self.pending
    }

    /// Headline such as "4 tests executed".
    pub fn executed_phrase(&self) -> String {
        format!("{} executed", plural(self.executed(), "test"))
    }

    /// Totals line in severity order, e.g. "2 tests passed, 1 info and 1 warn"
    /// or "1 test passed, 1 test failed and 1 pending".
    pub fn phrase(&self) -> String {
        let mut parts = Vec::new();
        if self.skipped > 0 {
            parts.push(format!("{} skipped", plural(self.skipped, "test")));
        }
        if self.passed > 0 {
            parts.push(format!("{} passed", plural(self.passed, "test")));
        }
        if self.info > 0 {
            parts.push(format!("{} info", self.info));
        }
        if self.warned > 0 {
            parts.push(format!("{} warn", self.warned));
        }
        if self.failed > 0 {
            parts.push(format!("{} failed", plural(self.failed, "test")));
        }
        if self.errored > 0 {
            parts.push(plural(self.errored, "error"));
        }
        if self.pending > 0 {
            parts.push(format!("{} pending", self.pending));
        }
        match parts.len() {
            0 => "no results".to_string(),
            1 => parts.remove(0),
            _ => {
                let last = parts.pop().expect("at least two parts");
                format!("{} and {}", parts.join(", "), last)
            }
        }
    }

    /// Exit code for the whole run. Precedence: error > fail > warn > ok.
    /// A run where nothing executed while tests were still pending counts as
    /// broken, not successful.
    pub fn exit_code(&self) -> i32 {
        if self.errored > 0 {
            EXIT_ERROR
        } else if self.failed > 0 {
            EXIT_FAIL
        } else if self.pending > 0 && self.executed() == 0 {
            EXIT_ERROR
        } else if self.warned > 0 {
            EXIT_WARN
        } else {
            EXIT_OK
        }
    }
}

fn plural(count: usize, noun: &str) -> String {
    if count == 1 {
        format!("{count} {noun}")
    } else {
        format!("{count} {noun}s")
    }
}
