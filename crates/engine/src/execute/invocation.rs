//! Working state and on-disk layout of a single test invocation.

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use gauntlet_types::Test;

/// State that must survive a guest reboot or a crash of the runner
/// itself. Saved before anything that can take the invocation down and
/// removed once a result has been recorded.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub(crate) struct InvocationState {
    pub test: String,
    pub serial_number: u64,
    pub guest: String,
    pub started: DateTime<Utc>,
    #[serde(default)]
    pub reboot_count: u32,
    #[serde(default)]
    pub restart_count: u32,
}

impl InvocationState {
    pub(crate) fn new(test: &Test, guest: &str) -> Self {
        InvocationState {
            test: test.name().to_string(),
            serial_number: test.serial_number,
            guest: guest.to_string(),
            started: Utc::now(),
            reboot_count: 0,
            restart_count: 0,
        }
    }

    pub(crate) fn save(&self, path: &Path) -> anyhow::Result<()> {
        let rendered = serde_yaml::to_string(self)?;
        std::fs::write(path, rendered)
            .with_context(|| format!("cannot write invocation state to {}", path.display()))
    }

    pub(crate) fn load(path: &Path) -> anyhow::Result<Option<Self>> {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(error) => {
                return Err(error)
                    .with_context(|| format!("cannot read invocation state {}", path.display()));
            }
        };
        let state = serde_yaml::from_str(&raw)
            .with_context(|| format!("malformed invocation state {}", path.display()))?;
        Ok(Some(state))
    }

    /// Wall-clock time since the invocation first started. The clock
    /// keeps running across reboots and restarts.
    pub(crate) fn elapsed(&self) -> Duration {
        Utc::now()
            .signed_duration_since(self.started)
            .to_std()
            .unwrap_or_default()
    }

    /// What is left of the duration budget, `None` once exhausted.
    pub(crate) fn remaining(&self, budget: Duration) -> Option<Duration> {
        budget.checked_sub(self.elapsed())
    }
}

/// Paths inside one invocation directory. Everything under `data/` is
/// pushed to the guest; the rest stays on the runner side.
#[derive(Debug, Clone)]
pub(crate) struct InvocationPaths {
    root: PathBuf,
}

impl InvocationPaths {
    pub(crate) fn new(root: PathBuf) -> Self {
        InvocationPaths { root }
    }

    pub(crate) fn root(&self) -> &Path {
        &self.root
    }

    pub(crate) fn output(&self) -> PathBuf {
        self.root.join("output.txt")
    }

    pub(crate) fn state_file(&self) -> PathBuf {
        self.root.join("invocation.yaml")
    }

    pub(crate) fn data(&self) -> PathBuf {
        self.root.join("data")
    }

    pub(crate) fn scripts(&self) -> PathBuf {
        self.data().join("scripts")
    }

    pub(crate) fn pidfile(&self) -> PathBuf {
        self.data().join("pid")
    }

    pub(crate) fn reports(&self) -> PathBuf {
        self.data().join("reports.json")
    }

    pub(crate) fn reboot_marker(&self) -> PathBuf {
        self.data().join("reboot-requested")
    }

    pub(crate) fn abort_marker(&self) -> PathBuf {
        self.data().join("abort-requested")
    }

    pub(crate) fn topology(&self) -> PathBuf {
        self.data().join("topology.yaml")
    }
}
