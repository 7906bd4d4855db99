//! Command execution on remote guests over OpenSSH.
//!
//! The client binaries do the heavy lifting: `ssh` with connection
//! multiplexing for commands, `rsync` over the same control socket for
//! directory transfer. When the socket path would exceed the unix length
//! limit, multiplexing is skipped and every operation opens its own
//! connection. Environment and working directory are folded into the
//! remote command line, so nothing is assumed about the remote sshd
//! configuration.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use gauntlet_types::{GuestRecord, SshDescriptor};
use gauntlet_util::shell::{join_command, quote};

use crate::supervise::{KillPhase, signal_process, supervise};
use crate::{CommandOutput, Guest, GuestError, RunOptions, Termination};

/// Interval between reachability probes while waiting out a reboot.
const PROBE_INTERVAL: Duration = Duration::from_secs(5);

/// Per-probe connection budget, so a dead host fails fast.
const CONNECT_TIMEOUT_SECS: u32 = 10;

/// Unix domain socket paths are limited to roughly a hundred bytes on
/// common platforms; beyond this no control socket is used at all.
const MAX_SOCKET_PATH: usize = 80;

/// Exit status OpenSSH reserves for its own failures.
const SSH_FAILURE_CODE: i32 = 255;

pub struct SshGuest {
    name: String,
    target: String,
    port: Option<u16>,
    key: Option<PathBuf>,
    elevated: bool,
    reboot_capable: bool,
    /// `None` disables multiplexing; each operation connects on its own.
    control_socket: Option<PathBuf>,
}

impl SshGuest {
    pub fn new(record: &GuestRecord, descriptor: &SshDescriptor, socket_dir: &Path) -> Self {
        let control_socket = control_socket_path(socket_dir, &record.name);
        if control_socket.is_none() {
            warn!(
                guest = %record.name,
                "control socket path too long, connecting per operation"
            );
        }
        Self {
            name: record.name.clone(),
            target: descriptor.target(),
            port: descriptor.port,
            key: descriptor.key.clone(),
            elevated: record.supports_elevation(),
            reboot_capable: record.supports_reboot(),
            control_socket,
        }
    }

    fn ssh_options(&self) -> Vec<String> {
        let mut options = vec![
            "-o".into(),
            "BatchMode=yes".into(),
            "-o".into(),
            "StrictHostKeyChecking=accept-new".into(),
            "-o".into(),
            format!("ConnectTimeout={CONNECT_TIMEOUT_SECS}"),
        ];
        if let Some(socket) = &self.control_socket {
            options.push("-o".into());
            options.push("ControlMaster=auto".into());
            options.push("-o".into());
            options.push("ControlPersist=5m".into());
            options.push("-o".into());
            options.push(format!("ControlPath={}", socket.display()));
        }
        if let Some(port) = self.port {
            options.push("-p".into());
            options.push(port.to_string());
        }
        if let Some(key) = &self.key {
            options.push("-i".into());
            options.push(key.display().to_string());
        }
        options
    }

    /// One-shot remote command, output collected after exit.
    async fn capture(&self, remote_command: &str) -> std::io::Result<std::process::Output> {
        let mut cmd = Command::new("ssh");
        cmd.args(self.ssh_options());
        cmd.arg(&self.target);
        cmd.arg("--");
        cmd.arg(remote_command);
        cmd.stdin(Stdio::null());
        cmd.output().await
    }

    async fn boot_time(&self) -> Option<u64> {
        let output = self.capture("cat /proc/stat").await.ok()?;
        if !output.status.success() {
            return None;
        }
        parse_boot_time(&String::from_utf8_lossy(&output.stdout))
    }

    async fn wait_for_boot(&self, before: Option<u64>) {
        loop {
            sleep(PROBE_INTERVAL).await;
            let Some(after) = self.boot_time().await else {
                debug!(guest = %self.name, "guest not reachable yet");
                continue;
            };
            match before {
                Some(before) if after == before => {
                    // Still the old boot; the probe raced the shutdown.
                    self.drop_control_socket();
                    continue;
                }
                _ => return,
            }
        }
    }

    async fn transfer(&self, from: String, to: String) -> Result<(), GuestError> {
        let mut rsh = vec!["ssh".to_string()];
        rsh.extend(self.ssh_options());

        let mut cmd = Command::new("rsync");
        cmd.arg("-a").arg("--delete");
        cmd.arg("-e").arg(join_command(&rsh));
        cmd.arg(&from).arg(&to);
        cmd.stdin(Stdio::null());

        let output = cmd.output().await.map_err(|error| GuestError::Transfer {
            name: self.name.clone(),
            reason: error.to_string(),
        })?;
        if !output.status.success() {
            return Err(GuestError::Transfer {
                name: self.name.clone(),
                reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        debug!(guest = %self.name, %from, %to, "transfer complete");
        Ok(())
    }

    fn command_error(&self, source: std::io::Error) -> GuestError {
        GuestError::Command {
            name: self.name.clone(),
            source,
        }
    }

    /// A stale socket makes ssh reuse a connection to the old boot.
    fn drop_control_socket(&self) {
        if let Some(socket) = &self.control_socket {
            let _ = std::fs::remove_file(socket);
        }
    }
}

#[async_trait]
impl Guest for SshGuest {
    fn name(&self) -> &str {
        &self.name
    }

    fn supports_reboot(&self) -> bool {
        self.reboot_capable
    }

    async fn connect(&self) -> Result<(), GuestError> {
        if let Some(parent) = self.control_socket.as_deref().and_then(Path::parent) {
            let _ = std::fs::create_dir_all(parent);
        }
        let output = self.capture("true").await.map_err(|error| GuestError::Connect {
            name: self.name.clone(),
            reason: error.to_string(),
        })?;
        if !output.status.success() {
            return Err(GuestError::Connect {
                name: self.name.clone(),
                reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        debug!(guest = %self.name, target = %self.target, "connection established");
        Ok(())
    }

    async fn run(&self, command: &str, options: RunOptions<'_>) -> Result<CommandOutput, GuestError> {
        let remote = remote_script(command, &options);

        let mut cmd = Command::new("ssh");
        cmd.args(self.ssh_options());
        if options.interactive {
            cmd.arg("-t");
        }
        cmd.arg(&self.target);
        cmd.arg("--");
        cmd.arg(&remote);
        cmd.kill_on_drop(true);

        if options.interactive {
            let mut child = cmd.spawn().map_err(|source| self.command_error(source))?;
            let pid = child.id();
            tokio::select! {
                result = child.wait() => {
                    let status = result.map_err(|source| self.command_error(source))?;
                    if status.code() == Some(SSH_FAILURE_CODE) {
                        return Err(GuestError::Unresponsive { name: self.name.clone() });
                    }
                    return Ok(CommandOutput {
                        exit_code: status.code(),
                        termination: Termination::Exited,
                    });
                }
                _ = options.cancel.cancelled() => {
                    if let Some(pid) = pid {
                        signal_process(pid, libc::SIGTERM);
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

        debug!(guest = %self.name, command, "running remote command");
        let mut child = cmd.spawn().map_err(|source| self.command_error(source))?;
        let ssh_pid = child.id();
        let kill_options = self.ssh_options();
        let target = self.target.clone();
        let pidfile = options.pidfile.map(|path| path.to_string_lossy().into_owned());

        let supervised = supervise(&mut child, &options, move |phase| {
            let signal = match phase {
                KillPhase::Graceful => "TERM",
                KillPhase::Forced => "KILL",
            };
            if let Some(pidfile) = &pidfile {
                spawn_remote_kill(&kill_options, &target, pidfile, signal);
            }
            if phase == KillPhase::Forced {
                // The remote side is gone or past help; drop the client.
                if let Some(pid) = ssh_pid {
                    signal_process(pid, libc::SIGKILL);
                }
            }
        })
        .await
        .map_err(|source| self.command_error(source))?;

        if supervised.termination == Termination::Exited
            && supervised.status.and_then(|status| status.code()) == Some(SSH_FAILURE_CODE)
        {
            return Err(GuestError::Unresponsive { name: self.name.clone() });
        }
        let exit_code = match supervised.termination {
            Termination::Exited => supervised.status.and_then(|status| status.code()),
            _ => None,
        };
        Ok(CommandOutput {
            exit_code,
            termination: supervised.termination,
        })
    }

    async fn push(&self, path: &Path) -> Result<(), GuestError> {
        if let Some(parent) = path.parent() {
            let mkdir = format!("mkdir -p {}", quote(&parent.to_string_lossy()));
            let _ = self.capture(&mkdir).await;
        }
        self.transfer(
            format!("{}/", path.display()),
            format!("{}:{}/", self.target, path.display()),
        )
        .await
    }

    async fn pull(&self, path: &Path) -> Result<(), GuestError> {
        if let Some(parent) = path.parent() {
            let _ = tokio::fs::create_dir_all(parent).await;
        }
        self.transfer(
            format!("{}:{}/", self.target, path.display()),
            format!("{}/", path.display()),
        )
        .await
    }

    async fn reboot(&self, timeout: Duration) -> Result<(), GuestError> {
        let before = self.boot_time().await;
        info!(guest = %self.name, "rebooting");
        let reboot_command = if self.elevated { "sudo reboot" } else { "reboot" };
        // The connection usually dies mid-command; any exit status is fine.
        let _ = self.capture(reboot_command).await;
        self.drop_control_socket();

        tokio::time::timeout(timeout, self.wait_for_boot(before))
            .await
            .map_err(|_| GuestError::RebootTimeout {
                name: self.name.clone(),
                timeout,
            })
    }

    async fn disconnect(&self) -> Result<(), GuestError> {
        let Some(socket) = &self.control_socket else {
            return Ok(());
        };
        let mut cmd = Command::new("ssh");
        cmd.arg("-o");
        cmd.arg(format!("ControlPath={}", socket.display()));
        cmd.arg("-O").arg("exit");
        cmd.arg(&self.target);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::null());
        cmd.stderr(Stdio::null());
        let _ = cmd.status().await;
        let _ = std::fs::remove_file(socket);
        Ok(())
    }
}

/// Kill the remote process recorded in the pidfile, trying the process
/// group first. Fire and forget: the caller is already tearing down.
fn spawn_remote_kill(ssh_options: &[String], target: &str, pidfile: &str, signal: &str) {
    let remote = format!(
        "pid=$(cat {pidfile} 2>/dev/null) && {{ kill -s {signal} -- -\"$pid\" 2>/dev/null || kill -s {signal} \"$pid\" 2>/dev/null; }}",
        pidfile = quote(pidfile),
    );
    let mut cmd = Command::new("ssh");
    cmd.args(ssh_options);
    cmd.arg(target);
    cmd.arg("--");
    cmd.arg(remote);
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::null());
    cmd.stderr(Stdio::null());
    match cmd.spawn() {
        Ok(mut child) => {
            tokio::spawn(async move {
                let _ = child.wait().await;
            });
        }
        Err(error) => warn!(%error, "could not deliver remote kill"),
    }
}

/// Pick a control socket path short enough for a unix domain socket, or
/// `None` when the run directory sits too deep for one.
fn control_socket_path(socket_dir: &Path, name: &str) -> Option<PathBuf> {
    let preferred = socket_dir.join(format!("{name}.ssh"));
    (preferred.as_os_str().len() <= MAX_SOCKET_PATH).then_some(preferred)
}

/// The `btime` line of /proc/stat, i.e. the boot moment in epoch seconds.
fn parse_boot_time(stat: &str) -> Option<u64> {
    stat.lines()
        .find_map(|line| line.strip_prefix("btime "))
        .and_then(|rest| rest.trim().parse().ok())
}

/// Fold environment and working directory into a single shell script so
/// the remote side needs no cooperation from sshd.
fn remote_script(command: &str, options: &RunOptions<'_>) -> String {
    let mut script = String::new();
    for (key, value) in options.env {
        script.push_str(&format!("export {key}={}; ", quote(value)));
    }
    if let Some(cwd) = options.cwd {
        script.push_str(&format!("cd {} && ", quote(&cwd.to_string_lossy())));
    }
    script.push_str(command);
    if options.elevate {
        format!("sudo -E sh -c {}", quote(&script))
    } else {
        format!("sh -c {}", quote(&script))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use indexmap::IndexMap;

    #[test]
    fn socket_path_is_dropped_when_too_long() {
        let short = control_socket_path(Path::new("/tmp/run"), "g");
        assert_eq!(short.as_deref(), Some(Path::new("/tmp/run/g.ssh")));

        let deep = PathBuf::from(format!("/{}", "very-long-segment/".repeat(8)));
        assert_eq!(control_socket_path(&deep, "guest"), None);
    }

    #[test]
    fn multiplexing_is_skipped_without_a_control_socket() {
        let yaml = "name: server\nhow: ssh\nhost: server.test\nuser: root\n";
        let record: GuestRecord = serde_yaml::from_str(yaml).unwrap();
        let gauntlet_types::TransportDescriptor::Ssh(descriptor) = &record.transport else {
            panic!("expected ssh transport");
        };
        let deep = PathBuf::from(format!("/{}", "very-long-segment/".repeat(8)));
        let guest = SshGuest::new(&record, descriptor, &deep);

        assert_eq!(guest.control_socket, None);
        let joined = guest.ssh_options().join(" ");
        assert!(!joined.contains("Control"), "{joined}");
        assert!(joined.contains("BatchMode=yes"), "{joined}");
    }

    #[test]
    fn parses_boot_time_from_proc_stat() {
        let stat = "cpu  1 2 3\nbtime 1700000000\nprocesses 999\n";
        assert_eq!(parse_boot_time(stat), Some(1_700_000_000));
        assert_eq!(parse_boot_time("cpu 1 2 3\n"), None);
    }

    #[test]
    fn remote_script_folds_env_cwd_and_elevation() {
        let mut env = IndexMap::new();
        env.insert("PLAN".to_string(), "smoke".to_string());
        let mut options = RunOptions::new(&env);
        options.cwd = Some(Path::new("/var/tmp/work"));

        let script = remote_script("./run.sh --fast", &options);
        assert_eq!(
            script,
            "sh -c 'export PLAN=smoke; cd /var/tmp/work && ./run.sh --fast'"
        );

        options.elevate = true;
        let script = remote_script("id", &options);
        assert!(script.starts_with("sudo -E sh -c "), "script: {script}");
    }

    #[test]
    fn ssh_options_carry_port_key_and_control_path() {
        let yaml = "name: server\nhow: ssh\nhost: server.test\nuser: root\nport: 2222\nkey: /home/user/.ssh/id_test\n";
        let record: GuestRecord = serde_yaml::from_str(yaml).unwrap();
        let gauntlet_types::TransportDescriptor::Ssh(descriptor) = &record.transport else {
            panic!("expected ssh transport");
        };
        let guest = SshGuest::new(&record, descriptor, Path::new("/tmp/run"));

        assert_eq!(guest.target, "root@server.test");
        let options = guest.ssh_options();
        let joined = options.join(" ");
        assert!(joined.contains("ControlPath=/tmp/run/server.ssh"), "{joined}");
        assert!(joined.contains("-p 2222"), "{joined}");
        assert!(joined.contains("-i /home/user/.ssh/id_test"), "{joined}");
    }
}
