//! Output streaming and termination for spawned commands.
//!
//! Both transports spawn a `tokio::process` child with piped output and
//! hand it to [`supervise`], which forwards lines to the caller's sink
//! while watching the duration budget and the cancellation token. Killing
//! is transport-specific and injected as a closure: SIGTERM first, then
//! SIGKILL once the grace period runs out.

use std::io;
use std::process::ExitStatus;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Child;
use tokio::time::{Instant, sleep_until};

use crate::{RunOptions, StreamKind, Termination};

/// How long a command gets between SIGTERM and SIGKILL.
const KILL_GRACE: Duration = Duration::from_secs(5);

/// How long to keep draining output after the child has exited, in case a
/// leftover process inherited the pipes.
const DRAIN_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum KillPhase {
    Graceful,
    Forced,
}

pub(crate) struct Supervised {
    pub status: Option<ExitStatus>,
    pub termination: Termination,
}

pub(crate) async fn supervise<F>(
    child: &mut Child,
    options: &RunOptions<'_>,
    mut terminate: F,
) -> io::Result<Supervised>
where
    F: FnMut(KillPhase),
{
    let Some(stdout) = child.stdout.take() else {
        return Err(io::Error::other("child stdout was not piped"));
    };
    let Some(stderr) = child.stderr.take() else {
        return Err(io::Error::other("child stderr was not piped"));
    };
    let mut stdout_lines = BufReader::new(stdout).lines();
    let mut stderr_lines = BufReader::new(stderr).lines();
    let mut stdout_done = false;
    let mut stderr_done = false;

    let deadline = options.timeout.map(|limit| Instant::now() + limit);
    let mut kill_at: Option<Instant> = None;
    let mut drain_until: Option<Instant> = None;
    let mut termination = Termination::Exited;
    let mut status: Option<ExitStatus> = None;

    loop {
        if status.is_some() && stdout_done && stderr_done {
            break;
        }
        tokio::select! {
            line = stdout_lines.next_line(), if !stdout_done => match line? {
                Some(line) => {
                    if let Some(sink) = options.sink {
                        sink(StreamKind::Stdout, &line);
                    }
                }
                None => stdout_done = true,
            },
            line = stderr_lines.next_line(), if !stderr_done => match line? {
                Some(line) => {
                    if let Some(sink) = options.sink {
                        sink(StreamKind::Stderr, &line);
                    }
                }
                None => stderr_done = true,
            },
            result = child.wait(), if status.is_none() => {
                status = Some(result?);
                drain_until = Some(Instant::now() + DRAIN_GRACE);
            }
            _ = sleep_opt(deadline), if termination == Termination::Exited && status.is_none() => {
                termination = Termination::TimedOut;
                terminate(KillPhase::Graceful);
                kill_at = Some(Instant::now() + KILL_GRACE);
            }
            _ = options.cancel.cancelled(), if termination == Termination::Exited && status.is_none() => {
                termination = Termination::Cancelled;
                terminate(KillPhase::Graceful);
                kill_at = Some(Instant::now() + KILL_GRACE);
            }
            _ = sleep_opt(kill_at), if kill_at.is_some() => {
                terminate(KillPhase::Forced);
                kill_at = None;
            }
            _ = sleep_opt(drain_until), if drain_until.is_some() => {
                // Something inherited the pipes and kept them open.
                break;
            }
        }
    }

    Ok(Supervised { status, termination })
}

async fn sleep_opt(at: Option<Instant>) {
    match at {
        Some(at) => sleep_until(at).await,
        None => std::future::pending::<()>().await,
    }
}

/// Deliver a signal to a whole process group.
pub(crate) fn signal_group(pid: u32, signal: libc::c_int) {
    let _ = unsafe { libc::kill(-(pid as libc::pid_t), signal) };
}

/// Deliver a signal to a single process.
pub(crate) fn signal_process(pid: u32, signal: libc::c_int) {
    let _ = unsafe { libc::kill(pid as libc::pid_t, signal) };
}
