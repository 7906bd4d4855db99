//! Command execution on the orchestrating host.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, warn};

use gauntlet_types::GuestRecord;
use gauntlet_util::shell::quote;

use crate::supervise::{KillPhase, signal_group, supervise};
use crate::{CommandOutput, Guest, GuestError, RunOptions, Termination};

/// Runs commands directly on the host. Every command gets its own process
/// group, so a timed-out test and everything it spawned can be killed
/// together.
pub struct LocalGuest {
    name: String,
}

impl LocalGuest {
    pub fn new(record: &GuestRecord) -> Self {
        Self {
            name: record.name.clone(),
        }
    }

    fn command_error(&self, source: std::io::Error) -> GuestError {
        GuestError::Command {
            name: self.name.clone(),
            source,
        }
    }
}

#[async_trait]
impl Guest for LocalGuest {
    fn name(&self) -> &str {
        &self.name
    }

    fn supports_reboot(&self) -> bool {
        false
    }

    async fn connect(&self) -> Result<(), GuestError> {
        Ok(())
    }

    async fn run(&self, command: &str, options: RunOptions<'_>) -> Result<CommandOutput, GuestError> {
        let shell_command = if options.elevate {
            format!("sudo -E sh -c {}", quote(command))
        } else {
            command.to_string()
        };

        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(&shell_command);
        for (key, value) in options.env {
            cmd.env(key, value);
        }
        if let Some(cwd) = options.cwd {
            cmd.current_dir(cwd);
        }
        cmd.process_group(0);
        cmd.kill_on_drop(true);

        if options.interactive {
            let mut child = cmd.spawn().map_err(|source| self.command_error(source))?;
            let pid = child.id();
            tokio::select! {
                result = child.wait() => {
                    let status = result.map_err(|source| self.command_error(source))?;
                    return Ok(CommandOutput {
                        exit_code: status.code(),
                        termination: Termination::Exited,
                    });
                }
                _ = options.cancel.cancelled() => {
                    if let Some(pid) = pid {
                        signal_group(pid, libc::SIGTERM);
                    }
                    let _ = child.wait().await;
                    return Ok(CommandOutput {
                        exit_code: None,
                        termination: Termination::Cancelled,
                    });
                }
            }
        }

        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        debug!(guest = %self.name, command, "running command");
        let mut child = cmd.spawn().map_err(|source| self.command_error(source))?;
        let pid = child.id();
        let supervised = supervise(&mut child, &options, move |phase| {
            let Some(pid) = pid else { return };
            match phase {
                KillPhase::Graceful => signal_group(pid, libc::SIGTERM),
                KillPhase::Forced => {
                    warn!(pid, "command survived SIGTERM, sending SIGKILL");
                    signal_group(pid, libc::SIGKILL);
                }
            }
        })
        .await
        .map_err(|source| self.command_error(source))?;

        let exit_code = match supervised.termination {
            Termination::Exited => supervised.status.and_then(|status| status.code()),
            _ => None,
        };
        Ok(CommandOutput {
            exit_code,
            termination: supervised.termination,
        })
    }

    async fn push(&self, _path: &Path) -> Result<(), GuestError> {
        // The workdir already lives on this machine.
        Ok(())
    }

    async fn pull(&self, _path: &Path) -> Result<(), GuestError> {
        Ok(())
    }

    async fn reboot(&self, _timeout: Duration) -> Result<(), GuestError> {
        Err(GuestError::RebootUnsupported {
            name: self.name.clone(),
        })
    }

    async fn disconnect(&self) -> Result<(), GuestError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::StreamKind;
    use indexmap::IndexMap;
    use std::sync::Mutex;
    use std::time::Instant;

    fn local() -> LocalGuest {
        let record: GuestRecord = serde_yaml::from_str("name: default-0\nhow: local\n").unwrap();
        LocalGuest::new(&record)
    }

    #[tokio::test]
    async fn captures_both_streams_and_the_exit_code() {
        let env = IndexMap::new();
        let lines = Mutex::new(Vec::new());
        let sink = |kind: StreamKind, line: &str| {
            lines.lock().unwrap().push((kind, line.to_string()));
        };
        let mut options = RunOptions::new(&env);
        options.sink = Some(&sink);

        let output = local().run("echo one; echo two >&2", options).await.unwrap();
        assert_eq!(output.exit_code, Some(0));
        assert_eq!(output.termination, Termination::Exited);
        assert!(output.success());

        let lines = lines.into_inner().unwrap();
        assert!(lines.contains(&(StreamKind::Stdout, "one".to_string())));
        assert!(lines.contains(&(StreamKind::Stderr, "two".to_string())));
    }

    #[tokio::test]
    async fn reports_nonzero_exit_codes() {
        let env = IndexMap::new();
        let output = local().run("exit 3", RunOptions::new(&env)).await.unwrap();
        assert_eq!(output.exit_code, Some(3));
        assert!(!output.success());
    }

    #[tokio::test]
    async fn exports_environment_and_working_directory() {
        let workdir = tempfile::tempdir().unwrap();
        let mut env = IndexMap::new();
        env.insert("GAUNTLET_PROBE".to_string(), "42".to_string());

        let lines = Mutex::new(Vec::new());
        let sink = |_kind: StreamKind, line: &str| {
            lines.lock().unwrap().push(line.to_string());
        };
        let mut options = RunOptions::new(&env);
        options.cwd = Some(workdir.path());
        options.sink = Some(&sink);

        let output = local().run("echo $GAUNTLET_PROBE; pwd", options).await.unwrap();
        assert_eq!(output.exit_code, Some(0));

        let lines = lines.into_inner().unwrap();
        assert_eq!(lines[0], "42");
        assert!(lines[1].ends_with(workdir.path().file_name().unwrap().to_str().unwrap()));
    }

    #[tokio::test]
    async fn kills_commands_past_their_duration() {
        let env = IndexMap::new();
        let mut options = RunOptions::new(&env);
        options.timeout = Some(Duration::from_millis(200));

        let started = Instant::now();
        let output = local().run("sleep 30", options).await.unwrap();
        assert_eq!(output.termination, Termination::TimedOut);
        assert_eq!(output.exit_code, None);
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn the_whole_process_group_dies_on_timeout() {
        let env = IndexMap::new();
        let mut options = RunOptions::new(&env);
        options.timeout = Some(Duration::from_millis(200));

        // The background child would keep the stdout pipe open long after
        // the shell itself is gone if it survived the group kill.
        let started = Instant::now();
        let output = local().run("sleep 30 & wait", options).await.unwrap();
        assert_eq!(output.termination, Termination::TimedOut);
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn stops_on_cancellation() {
        let env = IndexMap::new();
        let mut options = RunOptions::new(&env);
        let cancel = options.cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            cancel.cancel();
        });

        let output = local().run("sleep 30", options).await.unwrap();
        assert_eq!(output.termination, Termination::Cancelled);
        assert_eq!(output.exit_code, None);
    }

    #[tokio::test]
    async fn reboot_is_refused() {
        let error = local().reboot(Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(error, GuestError::RebootUnsupported { .. }));
    }
}
