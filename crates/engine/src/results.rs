//! Durable result store for one plan's execute step.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::debug;

use gauntlet_types::{Outcome, ResultFormatError, ResultsDocument, Test, TestResult, Totals};

/// Store behind `execute/results.yaml`. Every record call rewrites the
/// file, so a crash loses at most the in-flight test.
#[derive(Debug)]
pub struct ResultStore {
    path: PathBuf,
    document: Mutex<ResultsDocument>,
}

impl ResultStore {
    /// Start from an empty result list, discarding any previous file.
    pub fn create(path: PathBuf) -> Result<Self> {
        ensure_parent(&path)?;
        let store = Self {
            path,
            document: Mutex::new(ResultsDocument::new(Vec::new())),
        };
        {
            let document = store.document.lock().expect("result store lock poisoned");
            store.save_locked(&document)?;
        }
        Ok(store)
    }

    /// Load an existing result file, or start fresh when there is none.
    pub fn open_or_create(path: PathBuf) -> Result<Self> {
        ensure_parent(&path)?;
        let document = match std::fs::read_to_string(&path) {
            Ok(raw) => {
                let document: ResultsDocument =
                    serde_yaml::from_str(&raw).map_err(|source| ResultFormatError::Malformed {
                        path: path.display().to_string(),
                        source,
                    })?;
                document.check_version(&path.display().to_string())?;
                document
            }
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                ResultsDocument::new(Vec::new())
            }
            Err(source) => {
                return Err(ResultFormatError::Io {
                    path: path.display().to_string(),
                    source,
                }
                .into());
            }
        };
        Ok(Self {
            path,
            document: Mutex::new(document),
        })
    }

    /// Record one final result, replacing any earlier record of the same
    /// test invocation.
    pub fn record(&self, result: TestResult) -> Result<()> {
        let mut document = self.document.lock().expect("result store lock poisoned");
        debug!(test = %result.name, outcome = %result.result, "recording result");
        let existing = document
            .results
            .iter_mut()
            .find(|entry| entry.name == result.name && entry.serial_number == result.serial_number);
        match existing {
            Some(entry) => *entry = result,
            None => document.results.push(result),
        }
        self.save_locked(&document)
    }

    /// Latest recorded outcome of a test, across all its invocations.
    pub fn last_outcome(&self, test: &str) -> Option<Outcome> {
        self.document
            .lock()
            .expect("result store lock poisoned")
            .results
            .iter()
            .rev()
            .find(|result| result.name == test)
            .map(|result| result.result)
    }

    pub fn has_result(&self, test: &str, serial_number: u64) -> bool {
        self.document
            .lock()
            .expect("result store lock poisoned")
            .results
            .iter()
            .any(|result| result.name == test && result.serial_number == serial_number)
    }

    /// Record `pending` for every listed test that has no result yet.
    /// Returns how many records were added.
    pub fn backfill_pending<'a, I>(&self, tests: I, note: &str) -> Result<usize>
    where
        I: IntoIterator<Item = (&'a Test, &'a str)>,
    {
        let mut document = self.document.lock().expect("result store lock poisoned");
        let mut added = 0;
        for (test, guest) in tests {
            let recorded = document
                .results
                .iter()
                .any(|result| result.name == test.name() && result.serial_number == test.serial_number);
            if recorded {
                continue;
            }
            document.results.push(TestResult {
                name: test.name().to_string(),
                result: Outcome::Pending,
                note: Some(note.to_string()),
                log: Vec::new(),
                serial_number: test.serial_number,
                guest: guest.to_string(),
                duration: "00:00:00".to_string(),
                subresult: Vec::new(),
            });
            added += 1;
        }
        if added > 0 {
            self.save_locked(&document)?;
        }
        Ok(added)
    }

    pub fn totals(&self) -> Totals {
        let document = self.document.lock().expect("result store lock poisoned");
        Totals::from_results(document.results.iter())
    }

    pub fn snapshot(&self) -> Vec<TestResult> {
        self.document
            .lock()
            .expect("result store lock poisoned")
            .results
            .clone()
    }

    fn save_locked(&self, document: &ResultsDocument) -> Result<()> {
        let rendered = serde_yaml::to_string(document).context("cannot render results")?;
        std::fs::write(&self.path, rendered)
            .with_context(|| format!("cannot write results file '{}'", self.path.display()))?;
        Ok(())
    }
}

fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("cannot create '{}'", parent.display()))?;
    }
    Ok(())
}
