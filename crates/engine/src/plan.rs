//! Campaign plan documents and their load-time validation.
//!
//! A campaign file is a YAML mapping of plan name to plan. Every reference
//! inside a plan (required tests, guest pins, durations) is checked here,
//! before a run directory is ever allocated.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use thiserror::Error;

use gauntlet_types::{GuestCapabilities, GuestRecord, TestSpec, TransportDescriptor};
use gauntlet_util::parse_duration;

/// One named, ordered invocation inside the prepare or finish step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct PhaseSpec {
    pub name: String,
    /// Phases run sorted by this weight; declaration order breaks ties.
    #[serde(default = "default_phase_order")]
    pub order: u32,
    /// Shell command run on every guest of the plan.
    pub script: String,
}

fn default_phase_order() -> u32 {
    50
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct DiscoverSpec {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tests: Vec<TestSpec>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ProvisionSpec {
    /// Guests to attach to; an empty list provisions one local guest.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub guests: Vec<GuestRecord>,
}

impl ProvisionSpec {
    /// Declared guests, or the implicit local guest when none are declared.
    pub fn effective_guests(&self) -> Vec<GuestRecord> {
        if self.guests.is_empty() {
            vec![GuestRecord {
                name: "default".to_string(),
                role: None,
                transport: TransportDescriptor::Local,
                capabilities: GuestCapabilities::default(),
                reboot_timeout: None,
            }]
        } else {
            self.guests.clone()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ExecuteSpec {
    /// Stop dispatching new tests after the first fail or error.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub exit_first: bool,
}

/// One plan of a campaign document.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct PlanSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    /// Plan-wide environment; a test's own environment wins on conflicts.
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub environment: IndexMap<String, String>,
    #[serde(default)]
    pub discover: DiscoverSpec,
    #[serde(default)]
    pub provision: ProvisionSpec,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub prepare: Vec<PhaseSpec>,
    #[serde(default)]
    pub execute: ExecuteSpec,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub finish: Vec<PhaseSpec>,
}

#[derive(Debug, Error)]
pub enum PlanError {
    #[error("cannot read plan file '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("plan file '{path}' is not a valid campaign document: {source}")]
    Malformed {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("cannot render plan '{path}': {source}")]
    Render {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("plan file '{path}' defines no plans")]
    Empty { path: PathBuf },
    #[error("plan '{plan}' defines test '{test}' more than once")]
    DuplicateTest { plan: String, test: String },
    #[error("plan '{plan}' defines guest '{guest}' more than once")]
    DuplicateGuest { plan: String, guest: String },
    #[error("plan '{plan}' defines phase '{phase}' more than once in {step}")]
    DuplicatePhase {
        plan: String,
        step: String,
        phase: String,
    },
    #[error("test '{test}' in plan '{plan}' requires unknown test '{requirement}'")]
    UnknownRequirement {
        plan: String,
        test: String,
        requirement: String,
    },
    #[error("test '{test}' in plan '{plan}' requires itself")]
    SelfRequirement { plan: String, test: String },
    #[error("test '{test}' in plan '{plan}' wants guest or role '{guest}', which the plan does not provision")]
    UnknownGuest {
        plan: String,
        test: String,
        guest: String,
    },
    #[error("test '{test}' in plan '{plan}' declares an invalid duration '{duration}'")]
    InvalidDuration {
        plan: String,
        test: String,
        duration: String,
    },
    #[error("guest '{guest}' in plan '{plan}' declares an invalid reboot-timeout '{timeout}'")]
    InvalidRebootTimeout {
        plan: String,
        guest: String,
        timeout: String,
    },
}

/// Load and validate a campaign document.
pub fn load_plans(path: &Path) -> Result<IndexMap<String, PlanSpec>, PlanError> {
    let raw = std::fs::read_to_string(path).map_err(|source| PlanError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let plans: IndexMap<String, PlanSpec> =
        serde_yaml::from_str(&raw).map_err(|source| PlanError::Malformed {
            path: path.to_path_buf(),
            source,
        })?;
    if plans.is_empty() {
        return Err(PlanError::Empty {
            path: path.to_path_buf(),
        });
    }
    for (name, plan) in &plans {
        validate(name, plan)?;
    }
    Ok(plans)
}

/// Load one frozen plan snapshot from inside a run directory.
pub fn load_snapshot(path: &Path) -> Result<PlanSpec, PlanError> {
    let raw = std::fs::read_to_string(path).map_err(|source| PlanError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_yaml::from_str(&raw).map_err(|source| PlanError::Malformed {
        path: path.to_path_buf(),
        source,
    })
}

/// Freeze a plan into a run directory so later resumes are immune to edits
/// of the original campaign file.
pub fn write_snapshot(path: &Path, plan: &PlanSpec) -> Result<(), PlanError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|source| PlanError::Io {
            path: path.to_path_buf(),
            source,
        })?;
    }
    let rendered = serde_yaml::to_string(plan).map_err(|source| PlanError::Render {
        path: path.to_path_buf(),
        source,
    })?;
    std::fs::write(path, rendered).map_err(|source| PlanError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn validate(name: &str, plan: &PlanSpec) -> Result<(), PlanError> {
    let mut tests: HashSet<&str> = HashSet::new();
    for test in &plan.discover.tests {
        if !tests.insert(test.name.as_str()) {
            return Err(PlanError::DuplicateTest {
                plan: name.to_string(),
                test: test.name.clone(),
            });
        }
    }

    let guests = plan.provision.effective_guests();
    let mut guest_names: HashSet<&str> = HashSet::new();
    for guest in &plan.provision.guests {
        if !guest_names.insert(guest.name.as_str()) {
            return Err(PlanError::DuplicateGuest {
                plan: name.to_string(),
                guest: guest.name.clone(),
            });
        }
        if let Some(timeout) = &guest.reboot_timeout {
            if parse_duration(timeout).is_none() {
                return Err(PlanError::InvalidRebootTimeout {
                    plan: name.to_string(),
                    guest: guest.name.clone(),
                    timeout: timeout.clone(),
                });
            }
        }
    }
    let mut targets: HashSet<&str> = HashSet::new();
    for guest in &guests {
        targets.insert(guest.role_or_name());
    }
    let guest_names: HashSet<String> = guests.iter().map(|guest| guest.name.clone()).collect();

    // Phase names key the per-phase log files.
    for (step, phases) in [("prepare", &plan.prepare), ("finish", &plan.finish)] {
        let mut seen: HashSet<&str> = HashSet::new();
        for phase in phases {
            if !seen.insert(phase.name.as_str()) {
                return Err(PlanError::DuplicatePhase {
                    plan: name.to_string(),
                    step: step.to_string(),
                    phase: phase.name.clone(),
                });
            }
        }
    }

    for test in &plan.discover.tests {
        if parse_duration(&test.duration).is_none() {
            return Err(PlanError::InvalidDuration {
                plan: name.to_string(),
                test: test.name.clone(),
                duration: test.duration.clone(),
            });
        }
        for requirement in &test.requires {
            if requirement == &test.name {
                return Err(PlanError::SelfRequirement {
                    plan: name.to_string(),
                    test: test.name.clone(),
                });
            }
            if !tests.contains(requirement.as_str()) {
                return Err(PlanError::UnknownRequirement {
                    plan: name.to_string(),
                    test: test.name.clone(),
                    requirement: requirement.clone(),
                });
            }
        }
        if let Some(wanted) = &test.guest {
            if !targets.contains(wanted.as_str()) && !guest_names.contains(wanted) {
                return Err(PlanError::UnknownGuest {
                    plan: name.to_string(),
                    test: test.name.clone(),
                    guest: wanted.clone(),
                });
            }
        }
    }
    Ok(())
}
