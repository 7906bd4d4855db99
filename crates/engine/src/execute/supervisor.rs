//! Supervision of a single test invocation on its guest.
//!
//! One invocation may span several command runs: restart policies rerun
//! the test command, and reboot requests interrupt it around a guest
//! reboot. The duration budget covers the whole invocation, not the
//! individual runs.

use anyhow::{Context, bail};
use indexmap::IndexMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use gauntlet_guest::{Guest, GuestError, OutputSink, RunOptions, StreamKind, Termination};
use gauntlet_types::{GuestRecord, Outcome, ResultInterpretation, SubResult, Test, TestResult};
use gauntlet_util::env;
use gauntlet_util::{format_hms, parse_duration, quote};

use crate::results::ResultStore;
use crate::run::Run;
use crate::scripts;
use crate::topology::Topology;

use super::invocation::{InvocationPaths, InvocationState};

/// Reboot watchdog used when the guest record does not name one.
const DEFAULT_REBOOT_TIMEOUT: Duration = Duration::from_secs(600);

/// Everything a test invocation needs from its surroundings.
pub(super) struct TestSession<'a> {
    pub run: &'a Run,
    pub plan: &'a str,
    pub plan_environment: &'a IndexMap<String, String>,
    pub guests: &'a [GuestRecord],
    pub record: &'a GuestRecord,
    pub guest: &'a Arc<dyn Guest>,
    pub results: &'a ResultStore,
    pub libraries: Option<&'a Path>,
    pub interactive: bool,
    pub cancel: &'a CancellationToken,
}

/// How an invocation left the stream it ran on.
pub(super) enum Disposition {
    /// A result was recorded; the stream continues.
    Completed(Outcome),
    /// The guest became unreachable; the rest of its stream cannot run.
    GuestLost(String),
    /// The test asked for the whole run to stop.
    Abort,
}

/// Run one test to a recorded result.
pub(super) async fn run_test(
    session: &TestSession<'_>,
    test: &Test,
) -> anyhow::Result<Disposition> {
    let paths = InvocationPaths::new(session.run.invocation_dir(session.plan, test));
    let budget = parse_duration(&test.spec.duration).with_context(|| {
        format!(
            "test '{}' has an invalid duration '{}'",
            test.name(),
            test.spec.duration
        )
    })?;

    let mut state = match InvocationState::load(&paths.state_file())? {
        Some(state) => {
            info!(
                test = %test.name(),
                reboots = state.reboot_count,
                restarts = state.restart_count,
                "resuming an interrupted invocation"
            );
            state
        }
        None => {
            prepare_workspace(session, test, &paths)?;
            let state = InvocationState::new(test, &session.record.name);
            state.save(&paths.state_file())?;
            state
        }
    };

    if session.interactive {
        warn!(test = %test.name(), "interactive run, duration enforcement suspended");
    }

    loop {
        if session.cancel.is_cancelled() {
            bail!("run interrupted");
        }

        // Stale control files from the previous round must not be taken
        // for fresh requests. Push replicates the removals.
        for stale in [paths.pidfile(), paths.reboot_marker(), paths.abort_marker()] {
            remove_file_if_present(&stale)?;
        }
        if let Err(error) = session.guest.push(&paths.data()).await {
            let note = error.to_string();
            finalize(session, test, &state, &paths, Outcome::Error, Some(note.clone()), Vec::new())?;
            return Ok(Disposition::GuestLost(note));
        }

        let timeout = if session.interactive {
            None
        } else {
            match state.remaining(budget) {
                Some(left) if !left.is_zero() => Some(left),
                _ => {
                    let note = format!("test exceeded the duration '{}'", test.spec.duration);
                    let outcome =
                        finalize(session, test, &state, &paths, Outcome::Error, Some(note), Vec::new())?;
                    return Ok(Disposition::Completed(outcome));
                }
            }
        };

        let environment = invocation_environment(session, test, &state, &paths);
        debug!(
            test = %test.name(),
            "environment: {}",
            environment
                .iter()
                .map(|(key, value)| format!("{key}={}", env::display_env_value(key, value)))
                .collect::<Vec<_>>()
                .join(" ")
        );
        let command = format!(
            "printf '%s\\n' \"$$\" > {pidfile} && export PATH={scripts}:\"$PATH\" && exec sh -c {test}",
            pidfile = quote(&paths.pidfile().display().to_string()),
            scripts = quote(&paths.scripts().display().to_string()),
            test = quote(&test.spec.test),
        );

        let log = if session.interactive {
            None
        } else {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(paths.output())
                .with_context(|| format!("cannot open output log {}", paths.output().display()))?;
            Some(Mutex::new(file))
        };
        let writer = log.as_ref().map(|file| {
            move |_kind: StreamKind, line: &str| {
                let mut file = file.lock().expect("output log lock poisoned");
                let _ = writeln!(file, "{line}");
            }
        });

        let data = paths.data();
        let pidfile = paths.pidfile();
        let mut options = RunOptions::new(&environment);
        options.cwd = Some(&data);
        options.timeout = timeout;
        options.interactive = session.interactive;
        options.elevate = session.record.supports_elevation();
        options.cancel = session.cancel.child_token();
        options.sink = writer.as_ref().map(|writer| writer as &OutputSink);
        options.pidfile = Some(&pidfile);

        let output = match session.guest.run(&command, options).await {
            Ok(output) => output,
            Err(error @ GuestError::Unresponsive { .. }) => {
                let note = error.to_string();
                finalize(session, test, &state, &paths, Outcome::Error, Some(note.clone()), Vec::new())?;
                return Ok(Disposition::GuestLost(note));
            }
            Err(error) => {
                return Err(error)
                    .with_context(|| format!("cannot run test '{}'", test.name()));
            }
        };
        drop(writer);
        drop(log);

        if output.termination == Termination::Cancelled {
            bail!("run interrupted");
        }

        if let Err(error) = session.guest.pull(&paths.data()).await {
            let note = error.to_string();
            finalize(session, test, &state, &paths, Outcome::Error, Some(note.clone()), Vec::new())?;
            return Ok(Disposition::GuestLost(note));
        }

        if paths.abort_marker().exists() {
            info!(test = %test.name(), "test requested an abort of the whole run");
            let subresults = match read_reports(&paths)? {
                Reports::Parsed(subresults) => subresults,
                Reports::Malformed(_) => Vec::new(),
            };
            let outcome = Outcome::aggregate(subresults.iter().map(|sub| sub.result))
                .unwrap_or(Outcome::Error);
            let note = Some("the test aborted the run".to_string());
            finalize(session, test, &state, &paths, outcome, note, subresults)?;
            return Ok(Disposition::Abort);
        }

        if paths.reboot_marker().exists() {
            if !session.record.supports_reboot() {
                let note = format!("guest '{}' cannot reboot", session.record.name);
                let outcome =
                    finalize(session, test, &state, &paths, Outcome::Error, Some(note), Vec::new())?;
                return Ok(Disposition::Completed(outcome));
            }
            state.reboot_count += 1;
            // The snapshot goes to disk before the guest goes down, so a
            // crashed runner can still resume this invocation.
            state.save(&paths.state_file())?;
            let watchdog = session
                .record
                .reboot_timeout
                .as_deref()
                .and_then(parse_duration)
                .unwrap_or(DEFAULT_REBOOT_TIMEOUT);
            info!(
                guest = %session.record.name,
                reboots = state.reboot_count,
                "rebooting at the test's request"
            );
            match session.guest.reboot(watchdog).await {
                Ok(()) => continue,
                Err(error @ GuestError::RebootTimeout { .. }) => {
                    // A slow boot is not a lost guest; the next test
                    // probes the connection itself.
                    let note = error.to_string();
                    let outcome =
                        finalize(session, test, &state, &paths, Outcome::Error, Some(note), Vec::new())?;
                    return Ok(Disposition::Completed(outcome));
                }
                Err(error @ GuestError::Unresponsive { .. }) => {
                    let note = error.to_string();
                    finalize(session, test, &state, &paths, Outcome::Error, Some(note.clone()), Vec::new())?;
                    return Ok(Disposition::GuestLost(note));
                }
                Err(error) => {
                    return Err(error)
                        .with_context(|| format!("cannot reboot guest '{}'", session.record.name));
                }
            }
        }

        if output.termination == Termination::TimedOut {
            append_output(
                &paths,
                &format!(
                    "gauntlet: maximum test duration '{}' exceeded, terminating the test process group",
                    test.spec.duration
                ),
            )?;
            append_output(&paths, "gauntlet: remaining output drained, closing the log")?;
            let note = format!("test exceeded the duration '{}'", test.spec.duration);
            let outcome =
                finalize(session, test, &state, &paths, Outcome::Error, Some(note), Vec::new())?;
            return Ok(Disposition::Completed(outcome));
        }

        if let Some(code) = output.exit_code {
            if test.spec.restart.restarts_on(code) && state.restart_count < test.spec.restart.max_count
            {
                state.restart_count += 1;
                state.save(&paths.state_file())?;
                info!(
                    test = %test.name(),
                    restarts = state.restart_count,
                    "restart policy matched exit code {code}"
                );
                continue;
            }
        }

        let (outcome, note, subresults) = match read_reports(&paths)? {
            Reports::Malformed(reason) => (
                Outcome::Error,
                Some(format!("unreadable result report: {reason}")),
                Vec::new(),
            ),
            Reports::Parsed(subresults) => {
                let (outcome, note) = conclude(test, &subresults, output.exit_code);
                (outcome, note, subresults)
            }
        };
        let outcome = finalize(session, test, &state, &paths, outcome, note, subresults)?;
        return Ok(Disposition::Completed(outcome));
    }
}

/// Lay out a fresh invocation directory: guest-facing `data/` with the
/// helper scripts and the topology document.
fn prepare_workspace(
    session: &TestSession<'_>,
    test: &Test,
    paths: &InvocationPaths,
) -> anyhow::Result<()> {
    if paths.root().exists() {
        std::fs::remove_dir_all(paths.root()).with_context(|| {
            format!(
                "cannot clear stale invocation directory {}",
                paths.root().display()
            )
        })?;
    }
    std::fs::create_dir_all(paths.scripts())
        .with_context(|| format!("cannot create {}", paths.scripts().display()))?;
    scripts::install(&paths.scripts())
        .with_context(|| format!("cannot install helper scripts for test '{}'", test.name()))?;
    Topology::new(session.record, session.guests).write(&paths.topology())?;
    Ok(())
}

fn invocation_environment(
    session: &TestSession<'_>,
    test: &Test,
    state: &InvocationState,
    paths: &InvocationPaths,
) -> IndexMap<String, String> {
    let mut environment = session.plan_environment.clone();
    for (key, value) in &test.spec.environment {
        environment.insert(key.clone(), value.clone());
    }
    environment.insert(env::TEST_NAME_ENV.into(), test.name().to_string());
    environment.insert(env::TEST_SERIAL_ENV.into(), test.serial_number.to_string());
    environment.insert(env::REBOOT_COUNT_ENV.into(), state.reboot_count.to_string());
    environment.insert(env::RESTART_COUNT_ENV.into(), state.restart_count.to_string());
    environment.insert(env::TEST_DATA_ENV.into(), paths.data().display().to_string());
    environment.insert(env::TEST_PIDFILE_ENV.into(), paths.pidfile().display().to_string());
    environment.insert(env::TEST_REPORTS_ENV.into(), paths.reports().display().to_string());
    environment.insert(
        env::REBOOT_REQUEST_ENV.into(),
        paths.reboot_marker().display().to_string(),
    );
    environment.insert(
        env::ABORT_REQUEST_ENV.into(),
        paths.abort_marker().display().to_string(),
    );
    environment.insert(env::TOPOLOGY_ENV.into(), paths.topology().display().to_string());
    if let Some(libraries) = session.libraries {
        environment.insert(env::LIBRARIES_ENV.into(), libraries.display().to_string());
    }
    environment
}

enum Reports {
    Parsed(Vec<SubResult>),
    Malformed(String),
}

fn read_reports(paths: &InvocationPaths) -> anyhow::Result<Reports> {
    let raw = match std::fs::read_to_string(paths.reports()) {
        Ok(raw) => raw,
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
            return Ok(Reports::Parsed(Vec::new()));
        }
        Err(error) => {
            return Err(error).with_context(|| {
                format!("cannot read result reports {}", paths.reports().display())
            });
        }
    };
    let mut subresults = Vec::new();
    for line in raw.lines().filter(|line| !line.trim().is_empty()) {
        match serde_json::from_str::<SubResult>(line) {
            Ok(subresult) if !subresult.result.is_reportable() => {
                return Ok(Reports::Malformed(format!(
                    "'{}' is not reportable; valid results are {}",
                    subresult.result,
                    Outcome::REPORTABLE.map(|outcome| outcome.to_string()).join(", "),
                )));
            }
            Ok(subresult) => subresults.push(subresult),
            Err(error) => return Ok(Reports::Malformed(error.to_string())),
        }
    }
    Ok(Reports::Parsed(subresults))
}

/// Derive the test outcome once the command has exited on its own.
/// Explicit reports always win over the exit code.
fn conclude(test: &Test, subresults: &[SubResult], exit_code: Option<i32>) -> (Outcome, Option<String>) {
    if let Some(outcome) = Outcome::aggregate(subresults.iter().map(|sub| sub.result)) {
        return (outcome, None);
    }
    match (&test.spec.result, exit_code) {
        (ResultInterpretation::Custom, _) => (
            Outcome::Error,
            Some("test did not report any result".to_string()),
        ),
        (ResultInterpretation::ExitCode, Some(0)) => (Outcome::Pass, None),
        (ResultInterpretation::ExitCode, Some(code)) => (
            Outcome::Fail,
            Some(format!("test failed with exit code {code}")),
        ),
        (ResultInterpretation::ExitCode, None) => (
            Outcome::Error,
            Some("test process was terminated by a signal".to_string()),
        ),
    }
}

/// Record the result and drop the invocation snapshot; the invocation is
/// over after this.
fn finalize(
    session: &TestSession<'_>,
    test: &Test,
    state: &InvocationState,
    paths: &InvocationPaths,
    outcome: Outcome,
    note: Option<String>,
    subresults: Vec<SubResult>,
) -> anyhow::Result<Outcome> {
    let mut log = Vec::new();
    if paths.output().is_file() {
        log.push(session.run.relative(&paths.output()).display().to_string());
    }
    let subresult: Vec<SubResult> = subresults
        .into_iter()
        .map(|sub| rebase_subresult(session, paths, sub))
        .collect();
    // Attachments reported through subresults are also listed on the test.
    for sub in &subresult {
        for entry in &sub.log {
            if !log.contains(entry) {
                log.push(entry.clone());
            }
        }
    }
    let result = TestResult {
        name: test.name().to_string(),
        result: outcome,
        note,
        log,
        serial_number: test.serial_number,
        guest: session.record.name.clone(),
        duration: format_hms(state.elapsed()),
        subresult,
    };
    session.results.record(result)?;
    remove_file_if_present(&paths.state_file())?;
    Ok(outcome)
}

/// Attachment paths in reports are relative to the guest-side data
/// directory; results list them relative to the run directory.
fn rebase_subresult(session: &TestSession<'_>, paths: &InvocationPaths, mut sub: SubResult) -> SubResult {
    sub.log = sub
        .log
        .iter()
        .map(|entry| {
            let path = Path::new(entry);
            let absolute = if path.is_absolute() {
                path.to_path_buf()
            } else {
                paths.data().join(path)
            };
            session.run.relative(&absolute).display().to_string()
        })
        .collect();
    sub
}

fn append_output(paths: &InvocationPaths, line: &str) -> anyhow::Result<()> {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(paths.output())
        .with_context(|| format!("cannot append to {}", paths.output().display()))?;
    writeln!(file, "{line}")
        .with_context(|| format!("cannot append to {}", paths.output().display()))
}

fn remove_file_if_present(path: &Path) -> anyhow::Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(error) => Err(error).with_context(|| format!("cannot remove {}", path.display())),
    }
}
