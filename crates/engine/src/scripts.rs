//! In-test helper commands installed on every guest.
//!
//! The helpers are plain POSIX sh so they work on any guest with a shell.
//! They talk to the engine purely through files inside the invocation's
//! data directory, named by the environment the engine injects.

use std::io;
use std::path::Path;

pub const REPORT_RESULT_NAME: &str = "gauntlet-report-result";
pub const REBOOT_NAME: &str = "gauntlet-reboot";
pub const ABORT_NAME: &str = "gauntlet-abort";

const REPORT_RESULT: &str = r#"#!/bin/sh
# Report one named (sub)result for the running test. Usage:
#   gauntlet-report-result [--name NAME] [--note NOTE] [--log FILE]... OUTCOME
set -eu

: "${GAUNTLET_TEST_REPORTS:?gauntlet-report-result must run inside a gauntlet test}"

name="${GAUNTLET_TEST_NAME:-}"
note=""
logs=""
outcome=""

escape() {
    printf '%s' "$1" | sed -e 's/\\/\\\\/g' -e 's/"/\\"/g'
}

while [ "$#" -gt 0 ]; do
    case "$1" in
        --name) name="$2"; shift 2 ;;
        --note) note="$2"; shift 2 ;;
        --log)
            if [ -n "$logs" ]; then logs="$logs,"; fi
            logs="$logs\"$(escape "$2")\""
            shift 2
            ;;
        *) outcome="$1"; shift ;;
    esac
done

case "$outcome" in
    skip|pass|info|warn|fail|error) ;;
    *)
        echo "gauntlet-report-result: outcome must be one of skip, pass, info, warn, fail, error" >&2
        exit 2
        ;;
esac

record="{\"name\":\"$(escape "$name")\",\"result\":\"$outcome\""
if [ -n "$note" ]; then
    record="$record,\"note\":\"$(escape "$note")\""
fi
if [ -n "$logs" ]; then
    record="$record,\"log\":[$logs]"
fi
record="$record}"

printf '%s\n' "$record" >> "$GAUNTLET_TEST_REPORTS"
"#;

const REBOOT: &str = r#"#!/bin/sh
# Ask the engine to reboot this guest and resume the same test afterwards.
set -eu

: "${GAUNTLET_REBOOT_REQUEST:?gauntlet-reboot must run inside a gauntlet test}"
: "${GAUNTLET_TEST_PIDFILE:?gauntlet-reboot must run inside a gauntlet test}"

touch "$GAUNTLET_REBOOT_REQUEST"

pid="$(cat "$GAUNTLET_TEST_PIDFILE")"
kill -s TERM -- "-$pid" 2>/dev/null || kill -s TERM "$pid"
"#;

const ABORT: &str = r#"#!/bin/sh
# Stop the whole run: the engine finalizes this test from what it reported
# so far and dispatches nothing further on any guest.
set -eu

: "${GAUNTLET_ABORT_REQUEST:?gauntlet-abort must run inside a gauntlet test}"
: "${GAUNTLET_TEST_PIDFILE:?gauntlet-abort must run inside a gauntlet test}"

touch "$GAUNTLET_ABORT_REQUEST"

pid="$(cat "$GAUNTLET_TEST_PIDFILE")"
kill -s TERM -- "-$pid" 2>/dev/null || kill -s TERM "$pid"
"#;

/// Write the helper commands into `dir` and mark them executable.
pub fn install(dir: &Path) -> io::Result<()> {
    std::fs::create_dir_all(dir)?;
    for (name, body) in [
        (REPORT_RESULT_NAME, REPORT_RESULT),
        (REBOOT_NAME, REBOOT),
        (ABORT_NAME, ABORT),
    ] {
        let path = dir.join(name);
        std::fs::write(&path, body)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use gauntlet_types::{Outcome, SubResult};
    use std::process::Command;

    #[test]
    fn install_writes_executable_helpers() {
        let dir = tempfile::tempdir().unwrap();
        install(dir.path()).unwrap();
        for name in [REPORT_RESULT_NAME, REBOOT_NAME, ABORT_NAME] {
            let path = dir.path().join(name);
            assert!(path.is_file(), "{name} missing");
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                let mode = std::fs::metadata(&path).unwrap().permissions().mode();
                assert_eq!(mode & 0o111, 0o111, "{name} not executable");
            }
        }
    }

    #[test]
    fn report_result_appends_a_parsable_record() {
        let dir = tempfile::tempdir().unwrap();
        install(dir.path()).unwrap();
        let reports = dir.path().join("reports.json");

        let status = Command::new(dir.path().join(REPORT_RESULT_NAME))
            .args(["--name", "/setup", "--note", "it \"worked\"", "--log", "setup.log", "pass"])
            .env("GAUNTLET_TEST_REPORTS", &reports)
            .env("GAUNTLET_TEST_NAME", "/outer")
            .status()
            .unwrap();
        assert!(status.success());

        let raw = std::fs::read_to_string(&reports).unwrap();
        let record: SubResult = serde_json::from_str(raw.trim()).unwrap();
        assert_eq!(record.name, "/setup");
        assert_eq!(record.result, Outcome::Pass);
        assert_eq!(record.note.as_deref(), Some("it \"worked\""));
        assert_eq!(record.log, vec!["setup.log"]);
    }

    #[test]
    fn report_result_defaults_the_name_to_the_test() {
        let dir = tempfile::tempdir().unwrap();
        install(dir.path()).unwrap();
        let reports = dir.path().join("reports.json");

        let status = Command::new(dir.path().join(REPORT_RESULT_NAME))
            .arg("warn")
            .env("GAUNTLET_TEST_REPORTS", &reports)
            .env("GAUNTLET_TEST_NAME", "/outer")
            .status()
            .unwrap();
        assert!(status.success());

        let record: SubResult =
            serde_json::from_str(std::fs::read_to_string(&reports).unwrap().trim()).unwrap();
        assert_eq!(record.name, "/outer");
        assert_eq!(record.result, Outcome::Warn);
    }

    #[test]
    fn report_result_rejects_unknown_outcomes() {
        let dir = tempfile::tempdir().unwrap();
        install(dir.path()).unwrap();

        let status = Command::new(dir.path().join(REPORT_RESULT_NAME))
            .arg("great")
            .env("GAUNTLET_TEST_REPORTS", dir.path().join("reports.json"))
            .status()
            .unwrap();
        assert_eq!(status.code(), Some(2));
    }

    #[test]
    fn reboot_helper_touches_the_marker() {
        let dir = tempfile::tempdir().unwrap();
        install(dir.path()).unwrap();
        let marker = dir.path().join("reboot-requested");
        let pidfile = dir.path().join("pid");

        // a long-lived throwaway process stands in for the test group
        let mut sleeper = Command::new("sleep").arg("30").spawn().unwrap();
        std::fs::write(&pidfile, sleeper.id().to_string()).unwrap();

        let status = Command::new(dir.path().join(REBOOT_NAME))
            .env("GAUNTLET_REBOOT_REQUEST", &marker)
            .env("GAUNTLET_TEST_PIDFILE", &pidfile)
            .status()
            .unwrap();
        assert!(status.success());
        assert!(marker.is_file());
        sleeper.wait().unwrap();
    }
}
