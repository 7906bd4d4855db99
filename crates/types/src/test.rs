//! Test definitions: the declared spec plus the discovered form with its
//! stable serial number.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Duration budget applied when a test does not declare one.
pub const DEFAULT_TEST_DURATION: &str = "5m";

/// How the final outcome of a test is determined when it never reported
/// through the in-test interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ResultInterpretation {
    /// Zero exit status is a pass, anything else a fail.
    #[default]
    ExitCode,
    /// The test must report explicitly; never reporting is an error.
    Custom,
}

/// Which exit codes trigger a restart of the same test, and how often.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RestartPolicy {
    #[serde(default)]
    pub on_exit_codes: Vec<i32>,
    /// Upper bound on restarts of one test.
    #[serde(default = "default_max_count")]
    pub max_count: u32,
}

fn default_max_count() -> u32 {
    1
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            on_exit_codes: Vec::new(),
            max_count: default_max_count(),
        }
    }
}

impl RestartPolicy {
    /// Whether the given exit code asks for another run of the test.
    pub fn restarts_on(&self, exit_code: i32) -> bool {
        self.on_exit_codes.contains(&exit_code)
    }
}

/// An external shell-helper dependency declared by a test.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct LibraryRequirement {
    /// Repository location; a trailing `.git` does not change identity.
    pub location: String,
    /// Branch, tag, or commit. A value starting with `@` names a file in the
    /// repository whose first line holds the literal ref.
    #[serde(default, rename = "ref", skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
    /// Pinned logical name; derived from the location when omitted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// A test as declared in a plan, before discovery assigns serial numbers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct TestSpec {
    pub name: String,
    /// Shell command executed on the guest.
    pub test: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    /// Wall-clock budget, e.g. "300", "5m" or "2h".
    #[serde(default = "default_duration")]
    pub duration: String,
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub environment: IndexMap<String, String>,
    /// Role or guest name this test is pinned to; first guest when omitted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guest: Option<String>,
    /// Names of tests that must be selected and succeed before this one.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub requires: Vec<String>,
    /// Marks a test other tests are expected to require.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub required: bool,
    #[serde(default, skip_serializing_if = "is_default_interpretation")]
    pub result: ResultInterpretation,
    #[serde(default, skip_serializing_if = "is_default_restart")]
    pub restart: RestartPolicy,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub libraries: Vec<LibraryRequirement>,
}

fn default_duration() -> String {
    DEFAULT_TEST_DURATION.to_string()
}

fn is_default_interpretation(value: &ResultInterpretation) -> bool {
    *value == ResultInterpretation::default()
}

fn is_default_restart(value: &RestartPolicy) -> bool {
    *value == RestartPolicy::default()
}

/// A discovered test: the declared spec plus the serial number that stays
/// stable across restarts and reboots of the same test.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Test {
    #[serde(flatten)]
    pub spec: TestSpec,
    pub serial_number: u64,
}

impl Test {
    pub fn name(&self) -> &str {
        &self.spec.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spec_defaults_apply() {
        let spec: TestSpec = serde_yaml::from_str("name: /smoke\ntest: \"echo ok\"\n").unwrap();
        assert_eq!(spec.duration, DEFAULT_TEST_DURATION);
        assert_eq!(spec.result, ResultInterpretation::ExitCode);
        assert!(spec.restart.on_exit_codes.is_empty());
        assert_eq!(spec.restart.max_count, 1);
        assert!(!spec.required);
    }

    #[test]
    fn restart_policy_parses_kebab_case() {
        let spec: TestSpec = serde_yaml::from_str(
            "name: /flaky\ntest: \"run.sh\"\nrestart:\n  on-exit-codes: [2, 71]\n  max-count: 3\n",
        )
        .unwrap();
        assert!(spec.restart.restarts_on(71));
        assert!(!spec.restart.restarts_on(1));
        assert_eq!(spec.restart.max_count, 3);
    }

    #[test]
    fn library_requirement_ref_key() {
        let requirement: LibraryRequirement =
            serde_yaml::from_str("location: https://example.com/helpers\nref: main\nname: /helpers\n").unwrap();
        assert_eq!(requirement.reference.as_deref(), Some("main"));
    }

    #[test]
    fn discovered_test_flattens_spec() {
        let test: Test =
            serde_yaml::from_str("name: /smoke\ntest: \"echo ok\"\nserial-number: 4\n").unwrap();
        assert_eq!(test.name(), "/smoke");
        assert_eq!(test.serial_number, 4);
        let yaml = serde_yaml::to_string(&test).unwrap();
        assert!(yaml.contains("serial-number: 4"), "yaml: {yaml}");
    }

    #[test]
    fn custom_result_interpretation() {
        let spec: TestSpec =
            serde_yaml::from_str("name: /custom\ntest: \"report.sh\"\nresult: custom\n").unwrap();
        assert_eq!(spec.result, ResultInterpretation::Custom);
    }
}
