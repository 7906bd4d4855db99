//! The execute step: dispatch discovered tests to their guests and
//! collect a result for every one of them.

mod invocation;
mod supervisor;

use anyhow::{Context, anyhow, bail};
use indexmap::IndexMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use gauntlet_guest::Guest;
use gauntlet_types::{GuestRecord, Outcome, Test, TestResult};
use gauntlet_util::format_hms;

use crate::library::{self, LibraryError};
use crate::plan::PlanSpec;
use crate::results::ResultStore;
use crate::run::Run;
use supervisor::{Disposition, TestSession, run_test};

/// Which of the discovered tests this round should run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Selection {
    /// Tests without a recorded result for their invocation.
    Remaining,
    /// Tests whose latest result is anything but pass or skip. Used by
    /// reruns; passed work is never repeated.
    NotPassed,
}

/// State shared by every per-guest test stream.
struct StreamShared {
    run: Arc<Run>,
    plan: String,
    plan_environment: IndexMap<String, String>,
    records: Vec<GuestRecord>,
    results: Arc<ResultStore>,
    libraries: Option<PathBuf>,
    exit_first: bool,
    interactive: bool,
    /// Set once the first failure trips exit-first dispatching.
    tripped: AtomicBool,
    /// Set when a test asks for the whole run to stop.
    abort: AtomicBool,
    cancel: CancellationToken,
}

/// Execute the selected tests. Returns whether a test aborted the run.
#[allow(clippy::too_many_arguments)]
pub(crate) async fn run(
    run: Arc<Run>,
    plan_name: String,
    plan: &PlanSpec,
    tests: &[Test],
    records: Vec<GuestRecord>,
    guests: Vec<Arc<dyn Guest>>,
    results: Arc<ResultStore>,
    selection: Selection,
    interactive: bool,
    cancel: CancellationToken,
) -> anyhow::Result<bool> {
    let mut selected: Vec<Test> = tests
        .iter()
        .filter(|test| match selection {
            Selection::Remaining => !results.has_result(test.name(), test.serial_number),
            Selection::NotPassed => !matches!(
                results.last_outcome(test.name()),
                Some(Outcome::Pass) | Some(Outcome::Skip)
            ),
        })
        .cloned()
        .collect();
    if selected.is_empty() {
        info!(plan = %plan_name, "every test already has a result");
        return Ok(false);
    }
    debug!(plan = %plan_name, tests = selected.len(), "executing");

    // Resolve helper libraries up front. A failed resolution is a test
    // problem, not a run problem: the affected tests get error results
    // and everything else still runs.
    let libraries = loop {
        if !selected.iter().any(|test| !test.spec.libraries.is_empty()) {
            break None;
        }
        match library::fetch(&run.libraries_dir(&plan_name), selected.iter()).await {
            Ok(_) => break Some(run.libraries_dir(&plan_name)),
            Err(error @ LibraryError::Workdir { .. }) => return Err(error.into()),
            Err(error) => {
                warn!(plan = %plan_name, "library resolution failed: {error}");
                let affected = error.affected_tests().to_vec();
                if affected.is_empty() {
                    return Err(error.into());
                }
                let note = error.to_string();
                for test in &selected {
                    if !affected.iter().any(|name| name == test.name()) {
                        continue;
                    }
                    let guest = &records[assign_guest(&records, test)?].name;
                    results.record(undispatched(test, guest, Outcome::Error, &note))?;
                }
                selected.retain(|test| !affected.iter().any(|name| name == test.name()));
            }
        }
    };

    let mut queues: Vec<Vec<Test>> = vec![Vec::new(); records.len()];
    for test in selected {
        let index = assign_guest(&records, &test)?;
        queues[index].push(test);
    }

    let shared = Arc::new(StreamShared {
        run,
        plan: plan_name,
        plan_environment: plan.environment.clone(),
        records,
        results: results.clone(),
        libraries,
        exit_first: plan.execute.exit_first,
        interactive,
        tripped: AtomicBool::new(false),
        abort: AtomicBool::new(false),
        cancel,
    });

    if interactive {
        // Interactive runs own the terminal; streams take turns.
        for (index, queue) in queues.iter().enumerate() {
            if queue.is_empty() {
                continue;
            }
            drive_stream(shared.clone(), index, guests[index].clone(), queue.clone()).await?;
        }
    } else {
        let mut handles = Vec::new();
        for (index, queue) in queues.iter().enumerate() {
            if queue.is_empty() {
                continue;
            }
            handles.push(tokio::spawn(drive_stream(
                shared.clone(),
                index,
                guests[index].clone(),
                queue.clone(),
            )));
        }
        for joined in futures_util::future::join_all(handles).await {
            joined.context("test stream crashed")??;
        }
    }

    if shared.cancel.is_cancelled() {
        bail!("run interrupted");
    }

    let pairs: Vec<(&Test, &str)> = queues
        .iter()
        .enumerate()
        .flat_map(|(index, queue)| {
            let guest = shared.records[index].name.as_str();
            queue.iter().map(move |test| (test, guest))
        })
        .collect();
    let backfilled = results.backfill_pending(pairs, "test never started")?;
    if backfilled > 0 {
        info!(pending = backfilled, "tests never started");
    }

    Ok(shared.abort.load(Ordering::SeqCst))
}

/// Index of the guest a test runs on: its pinned guest, or the first one.
fn assign_guest(records: &[GuestRecord], test: &Test) -> anyhow::Result<usize> {
    match &test.spec.guest {
        Some(wanted) => records
            .iter()
            .position(|record| record.role_or_name() == wanted || &record.name == wanted)
            .ok_or_else(|| anyhow!("test '{}' pins unknown guest '{wanted}'", test.name())),
        None => Ok(0),
    }
}

async fn drive_stream(
    shared: Arc<StreamShared>,
    index: usize,
    guest: Arc<dyn Guest>,
    queue: Vec<Test>,
) -> anyhow::Result<()> {
    let record = &shared.records[index];
    let session = TestSession {
        run: shared.run.as_ref(),
        plan: &shared.plan,
        plan_environment: &shared.plan_environment,
        guests: &shared.records,
        record,
        guest: &guest,
        results: shared.results.as_ref(),
        libraries: shared.libraries.as_deref(),
        interactive: shared.interactive,
        cancel: &shared.cancel,
    };

    for (position, test) in queue.iter().enumerate() {
        if session.cancel.is_cancelled()
            || shared.abort.load(Ordering::SeqCst)
            || shared.tripped.load(Ordering::SeqCst)
        {
            break;
        }

        let outcome = if let Some((outcome, note)) = requirement_block(session.results, test) {
            info!(test = %test.name(), result = %outcome, "{note}");
            session
                .results
                .record(undispatched(test, &record.name, outcome, &note))?;
            outcome
        } else {
            match run_test(&session, test).await? {
                Disposition::Completed(outcome) => {
                    if shared.exit_first
                        && matches!(outcome, Outcome::Fail | Outcome::Error)
                        && !shared.tripped.swap(true, Ordering::SeqCst)
                    {
                        warn!(
                            test = %test.name(),
                            "first failure with exit-first set, dispatching no further tests"
                        );
                    }
                    outcome
                }
                Disposition::GuestLost(reason) => {
                    warn!(guest = %record.name, "{reason}");
                    for remaining in &queue[position + 1..] {
                        session
                            .results
                            .record(undispatched(remaining, &record.name, Outcome::Pending, &reason))?;
                    }
                    return Ok(());
                }
                Disposition::Abort => {
                    shared.abort.store(true, Ordering::SeqCst);
                    return Ok(());
                }
            }
        };

        // A required test that did not survive takes the rest of its
        // stream with it; explicit `requires` entries on other guests are
        // still gated through the results file.
        if test.spec.required
            && matches!(outcome, Outcome::Fail | Outcome::Error | Outcome::Skip)
        {
            let note = match outcome {
                Outcome::Skip => format!("required test '{}' was skipped", test.name()),
                _ => format!("required test '{}' failed", test.name()),
            };
            warn!(guest = %record.name, "{note}, skipping the rest of its queue");
            for remaining in &queue[position + 1..] {
                session
                    .results
                    .record(undispatched(remaining, &record.name, Outcome::Skip, &note))?;
            }
            return Ok(());
        }
    }
    Ok(())
}

/// Check a test's `requires` list against the results recorded so far.
/// Returns the outcome and note to record instead of running the test.
fn requirement_block(results: &ResultStore, test: &Test) -> Option<(Outcome, String)> {
    for requirement in &test.spec.requires {
        let block = match results.last_outcome(requirement) {
            None => Some((
                Outcome::Pending,
                format!("required test '{requirement}' has not produced a result"),
            )),
            Some(Outcome::Fail) | Some(Outcome::Error) => Some((
                Outcome::Skip,
                format!("required test '{requirement}' failed"),
            )),
            Some(Outcome::Skip) => Some((
                Outcome::Skip,
                format!("required test '{requirement}' was skipped"),
            )),
            Some(Outcome::Pending) => Some((
                Outcome::Pending,
                format!("required test '{requirement}' never ran"),
            )),
            Some(Outcome::Pass) | Some(Outcome::Info) | Some(Outcome::Warn) => None,
        };
        if block.is_some() {
            return block;
        }
    }
    None
}

/// Result for a test that never got to run.
fn undispatched(test: &Test, guest: &str, outcome: Outcome, note: &str) -> TestResult {
    TestResult {
        name: test.name().to_string(),
        result: outcome,
        note: Some(note.to_string()),
        log: Vec::new(),
        serial_number: test.serial_number,
        guest: guest.to_string(),
        duration: format_hms(Duration::ZERO),
        subresult: Vec::new(),
    }
}
