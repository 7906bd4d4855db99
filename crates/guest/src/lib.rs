//! # Gauntlet Guest Transports
//!
//! A guest is a machine that runs commands on behalf of the pipeline:
//! either the orchestrating host itself or a remote machine reached over
//! SSH. The [`Guest`] trait hides the transport, so the execute step can
//! stream output, enforce durations, and survive reboots without knowing
//! which kind of machine it is talking to.

mod local;
mod ssh;
mod supervise;

pub use local::LocalGuest;
pub use ssh::SshGuest;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use indexmap::IndexMap;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use gauntlet_types::{GuestRecord, TransportDescriptor};

/// Which stream a captured output line arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

/// Callback receiving captured output lines as they arrive.
pub type OutputSink<'a> = dyn Fn(StreamKind, &str) + Send + Sync + 'a;

/// How a command run came to an end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// The command exited on its own.
    Exited,
    /// The duration budget expired and the command was killed.
    TimedOut,
    /// The run was cancelled and the command was killed.
    Cancelled,
}

/// Outcome of a single command run on a guest.
#[derive(Debug, Clone, Copy)]
pub struct CommandOutput {
    /// Exit code, present only when the command exited on its own.
    pub exit_code: Option<i32>,
    pub termination: Termination,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.termination == Termination::Exited && self.exit_code == Some(0)
    }
}

/// Options for a single command run.
pub struct RunOptions<'a> {
    /// Environment exported to the command.
    pub env: &'a IndexMap<String, String>,
    /// Working directory for the command.
    pub cwd: Option<&'a Path>,
    /// Wall-clock budget; the command is killed once it expires.
    pub timeout: Option<Duration>,
    /// Attach the command to the caller's terminal instead of capturing
    /// output. Interactive runs are exempt from the duration budget.
    pub interactive: bool,
    /// Run the command through sudo.
    pub elevate: bool,
    /// Cooperative cancellation for the whole run.
    pub cancel: CancellationToken,
    /// Receives captured output lines.
    pub sink: Option<&'a OutputSink<'a>>,
    /// Path on the guest where the command's wrapper records its pid.
    /// Remote transports use it to kill the process tree on timeout.
    pub pidfile: Option<&'a Path>,
}

impl<'a> RunOptions<'a> {
    pub fn new(env: &'a IndexMap<String, String>) -> Self {
        Self {
            env,
            cwd: None,
            timeout: None,
            interactive: false,
            elevate: false,
            cancel: CancellationToken::new(),
            sink: None,
            pidfile: None,
        }
    }
}

/// Errors surfaced by guest transports.
#[derive(Debug, Error)]
pub enum GuestError {
    #[error("could not connect to guest '{name}': {reason}")]
    Connect { name: String, reason: String },

    #[error("could not run command on guest '{name}'")]
    Command {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("transfer to or from guest '{name}' failed: {reason}")]
    Transfer { name: String, reason: String },

    #[error("guest '{name}' did not come back within {}s of rebooting", .timeout.as_secs())]
    RebootTimeout { name: String, timeout: Duration },

    #[error("guest '{name}' does not support rebooting")]
    RebootUnsupported { name: String },

    #[error("lost connection to guest '{name}'")]
    Unresponsive { name: String },
}

/// A machine that runs commands for the pipeline.
#[async_trait]
pub trait Guest: Send + Sync {
    /// Guest name, unique within a plan.
    fn name(&self) -> &str;

    /// Whether this guest can be rebooted and reached again afterwards.
    fn supports_reboot(&self) -> bool;

    /// Establish the connection and verify the guest is reachable.
    async fn connect(&self) -> Result<(), GuestError>;

    /// Run a shell command on the guest.
    async fn run(&self, command: &str, options: RunOptions<'_>) -> Result<CommandOutput, GuestError>;

    /// Replicate a local directory to the same path on the guest.
    async fn push(&self, path: &Path) -> Result<(), GuestError>;

    /// Retrieve a directory from the guest back to the same local path.
    async fn pull(&self, path: &Path) -> Result<(), GuestError>;

    /// Reboot the guest and wait until it is reachable again, for at most
    /// `timeout`.
    async fn reboot(&self, timeout: Duration) -> Result<(), GuestError>;

    /// Tear the connection down. Guests must tolerate repeated calls.
    async fn disconnect(&self) -> Result<(), GuestError>;
}

/// Build the transport for a provisioned guest record. `socket_dir` hosts
/// connection state such as SSH control sockets.
pub fn from_record(record: &GuestRecord, socket_dir: &Path) -> Arc<dyn Guest> {
    match &record.transport {
        TransportDescriptor::Local => Arc::new(LocalGuest::new(record)),
        TransportDescriptor::Ssh(descriptor) => Arc::new(SshGuest::new(record, descriptor, socket_dir)),
    }
}
