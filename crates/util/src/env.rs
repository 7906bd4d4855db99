//! Environment variable names of the per-test runtime contract, plus
//! redaction of secret-looking values before they reach a log.

use once_cell::sync::Lazy;
use regex::Regex;

/// Overrides the root directory holding all run directories.
pub const WORKDIR_ROOT_ENV: &str = "GAUNTLET_WORKDIR_ROOT";

/// Stable numeric id of the test, identical across restarts and reboots.
pub const TEST_SERIAL_ENV: &str = "GAUNTLET_TEST_SERIAL_NUMBER";
/// How many times this test's guest has rebooted since the test started.
pub const REBOOT_COUNT_ENV: &str = "GAUNTLET_REBOOT_COUNT";
/// How many times this test has been restarted by its restart policy.
pub const RESTART_COUNT_ENV: &str = "GAUNTLET_TEST_RESTART_COUNT";
/// Name of the test currently running.
pub const TEST_NAME_ENV: &str = "GAUNTLET_TEST_NAME";

/// Writable scratch directory owned by the test.
pub const TEST_DATA_ENV: &str = "GAUNTLET_TEST_DATA";
/// File holding the pid of the test process group leader; consumed by the
/// reboot and abort helper commands.
pub const TEST_PIDFILE_ENV: &str = "GAUNTLET_TEST_PIDFILE";
/// File collecting the test's explicit result reports, one JSON object per
/// line.
pub const TEST_REPORTS_ENV: &str = "GAUNTLET_TEST_REPORTS";
/// Marker file whose presence asks the engine to reboot the guest and
/// resume the same test.
pub const REBOOT_REQUEST_ENV: &str = "GAUNTLET_REBOOT_REQUEST";
/// Marker file whose presence aborts the whole run.
pub const ABORT_REQUEST_ENV: &str = "GAUNTLET_ABORT_REQUEST";
/// Topology document naming every guest of the plan and its role.
pub const TOPOLOGY_ENV: &str = "GAUNTLET_TOPOLOGY";
/// Directory holding the fetched helper libraries.
pub const LIBRARIES_ENV: &str = "GAUNTLET_LIBRARIES";

static SECRET_ASSIGNMENT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^[A-Z0-9_]*(KEY|TOKEN|SECRET|PASSWORD)$").expect("secret pattern compiles")
});

/// Whether an environment variable's value should be hidden in logs.
pub fn is_secret_name(name: &str) -> bool {
    SECRET_ASSIGNMENT.is_match(name)
}

/// Value as it may appear in a log line.
pub fn display_env_value<'a>(name: &str, value: &'a str) -> &'a str {
    if is_secret_name(name) { "<redacted>" } else { value }
}
