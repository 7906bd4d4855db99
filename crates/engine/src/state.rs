//! Durable per-run state: which pipeline steps of which plan are done.

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;

use gauntlet_types::Step;

/// File name of the run state document inside a run directory.
pub const RUN_STATE_FILE: &str = "run.yaml";

/// Progress of one plan inside a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub struct PlanState {
    /// Steps completed for this plan, in completion order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub done: Vec<Step>,
}

/// On-disk shape of `run.yaml`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RunDocument {
    pub created: DateTime<Utc>,
    /// Plan file this run was started from.
    pub plan_path: PathBuf,
    /// Per-plan progress, keyed by plan name in campaign order.
    #[serde(default)]
    pub plans: IndexMap<String, PlanState>,
}

#[derive(Debug, Error)]
pub enum StateError {
    #[error("cannot access run state '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("run state '{path}' is not a valid run document: {source}")]
    Malformed {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("cannot render run state '{path}': {source}")]
    Render {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
}

/// Durable store for one run's step markers.
///
/// Every mutating call writes the document back to disk before returning,
/// so a crash at any point leaves a resumable state behind. Resuming a run
/// whose state cannot be read is a hard error; guessing at lost progress
/// would redo or silently skip steps.
#[derive(Debug)]
pub struct RunStateStore {
    path: PathBuf,
    document: Mutex<RunDocument>,
}

impl RunStateStore {
    /// Seed the state document of a freshly allocated run directory.
    pub fn create(run_root: &Path, plan_path: &Path) -> Result<Self, StateError> {
        let document = RunDocument {
            created: Utc::now(),
            plan_path: plan_path.to_path_buf(),
            plans: IndexMap::new(),
        };
        let store = Self {
            path: run_root.join(RUN_STATE_FILE),
            document: Mutex::new(document),
        };
        {
            let document = store.document.lock().expect("run state lock poisoned");
            store.save_locked(&document)?;
        }
        Ok(store)
    }

    /// Load the state of an existing run directory.
    pub fn load(run_root: &Path) -> Result<Self, StateError> {
        let path = run_root.join(RUN_STATE_FILE);
        let raw = std::fs::read_to_string(&path).map_err(|source| StateError::Io {
            path: path.clone(),
            source,
        })?;
        let document: RunDocument =
            serde_yaml::from_str(&raw).map_err(|source| StateError::Malformed {
                path: path.clone(),
                source,
            })?;
        Ok(Self {
            path,
            document: Mutex::new(document),
        })
    }

    pub fn created(&self) -> DateTime<Utc> {
        self.document.lock().expect("run state lock poisoned").created
    }

    pub fn plan_path(&self) -> PathBuf {
        self.document
            .lock()
            .expect("run state lock poisoned")
            .plan_path
            .clone()
    }

    /// Plan names in campaign order.
    pub fn plan_names(&self) -> Vec<String> {
        self.document
            .lock()
            .expect("run state lock poisoned")
            .plans
            .keys()
            .cloned()
            .collect()
    }

    /// Register plans the document does not know yet.
    pub fn ensure_plans<I, S>(&self, names: I) -> Result<(), StateError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut document = self.document.lock().expect("run state lock poisoned");
        let mut changed = false;
        for name in names {
            let name = name.as_ref();
            if !document.plans.contains_key(name) {
                document.plans.insert(name.to_string(), PlanState::default());
                changed = true;
            }
        }
        if changed {
            self.save_locked(&document)?;
        }
        Ok(())
    }

    pub fn is_done(&self, plan: &str, step: Step) -> bool {
        self.document
            .lock()
            .expect("run state lock poisoned")
            .plans
            .get(plan)
            .is_some_and(|state| state.done.contains(&step))
    }

    /// Completed steps of one plan, in completion order.
    pub fn done_steps(&self, plan: &str) -> Vec<Step> {
        self.document
            .lock()
            .expect("run state lock poisoned")
            .plans
            .get(plan)
            .map(|state| state.done.clone())
            .unwrap_or_default()
    }

    pub fn mark_done(&self, plan: &str, step: Step) -> Result<(), StateError> {
        let mut document = self.document.lock().expect("run state lock poisoned");
        let state = document.plans.entry(plan.to_string()).or_default();
        if !state.done.contains(&step) {
            state.done.push(step);
            self.save_locked(&document)?;
        }
        Ok(())
    }

    /// Clear the marker for a step and, transitively, every later step.
    /// Later steps depend on the artifacts of earlier ones, so redoing a
    /// step invalidates everything after it.
    pub fn reset_from(&self, plan: &str, step: Step) -> Result<(), StateError> {
        let mut document = self.document.lock().expect("run state lock poisoned");
        let mut changed = false;
        if let Some(state) = document.plans.get_mut(plan) {
            let before = state.done.len();
            state.done.retain(|done| !step.and_later().contains(done));
            changed = state.done.len() != before;
        }
        if changed {
            self.save_locked(&document)?;
        }
        Ok(())
    }

    /// Drop every step marker of every plan.
    pub fn reset_all(&self) -> Result<(), StateError> {
        let mut document = self.document.lock().expect("run state lock poisoned");
        let mut changed = false;
        for state in document.plans.values_mut() {
            if !state.done.is_empty() {
                state.done.clear();
                changed = true;
            }
        }
        if changed {
            self.save_locked(&document)?;
        }
        Ok(())
    }

    fn save_locked(&self, document: &RunDocument) -> Result<(), StateError> {
        let rendered =
            serde_yaml::to_string(document).map_err(|source| StateError::Render {
                path: self.path.clone(),
                source,
            })?;
        std::fs::write(&self.path, rendered).map_err(|source| StateError::Io {
            path: self.path.clone(),
            source,
        })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn markers_survive_a_reload() {
        let dir = tempfile::tempdir().unwrap();
        let store = RunStateStore::create(dir.path(), Path::new("/tmp/plans.yaml")).unwrap();
        store.ensure_plans(["/smoke"]).unwrap();
        store.mark_done("/smoke", Step::Discover).unwrap();
        store.mark_done("/smoke", Step::Provision).unwrap();

        let reloaded = RunStateStore::load(dir.path()).unwrap();
        assert!(reloaded.is_done("/smoke", Step::Discover));
        assert!(reloaded.is_done("/smoke", Step::Provision));
        assert!(!reloaded.is_done("/smoke", Step::Execute));
        assert_eq!(reloaded.plan_path(), PathBuf::from("/tmp/plans.yaml"));
    }

    #[test]
    fn reset_clears_the_step_and_everything_after_it() {
        let dir = tempfile::tempdir().unwrap();
        let store = RunStateStore::create(dir.path(), Path::new("plans.yaml")).unwrap();
        for step in Step::PIPELINE {
            store.mark_done("/smoke", step).unwrap();
        }

        store.reset_from("/smoke", Step::Execute).unwrap();
        assert!(store.is_done("/smoke", Step::Prepare));
        assert!(!store.is_done("/smoke", Step::Execute));
        assert!(!store.is_done("/smoke", Step::Report));
        assert!(!store.is_done("/smoke", Step::Finish));
    }

    #[test]
    fn reset_all_touches_every_plan() {
        let dir = tempfile::tempdir().unwrap();
        let store = RunStateStore::create(dir.path(), Path::new("plans.yaml")).unwrap();
        store.mark_done("/first", Step::Discover).unwrap();
        store.mark_done("/second", Step::Discover).unwrap();

        store.reset_all().unwrap();
        assert!(!store.is_done("/first", Step::Discover));
        assert!(!store.is_done("/second", Step::Discover));
        // the plans themselves stay registered
        assert_eq!(store.plan_names(), vec!["/first", "/second"]);
    }

    #[test]
    fn loading_a_missing_document_fails() {
        let dir = tempfile::tempdir().unwrap();
        let error = RunStateStore::load(dir.path()).unwrap_err();
        assert!(matches!(error, StateError::Io { .. }));
    }

    #[test]
    fn loading_garbage_fails_loudly() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(RUN_STATE_FILE), "created: [not, a, date").unwrap();
        let error = RunStateStore::load(dir.path()).unwrap_err();
        assert!(matches!(error, StateError::Malformed { .. }));
    }
}
