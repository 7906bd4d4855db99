//! A run directory and the path layout inside it.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tracing::info;

use gauntlet_types::{Step, Test};
use gauntlet_util::{allocate_run_dir, runs_root};

use crate::state::RunStateStore;

/// One run: an allocated directory under the runs root plus its durable
/// state document. All per-plan artifact paths are derived here so every
/// step agrees on the layout.
pub struct Run {
    id: String,
    root: PathBuf,
    pub state: RunStateStore,
}

impl Run {
    /// Allocate the next run directory and seed its state document.
    pub fn create(plan_path: &Path) -> Result<Self> {
        let root = allocate_run_dir(&runs_root()).context("cannot allocate a run directory")?;
        let plan_path = plan_path
            .canonicalize()
            .with_context(|| format!("cannot resolve plan file '{}'", plan_path.display()))?;
        let state = RunStateStore::create(&root, &plan_path)?;
        let id = run_id_of(&root);
        info!(run = %id, "created {}", root.display());
        Ok(Self { id, root, state })
    }

    /// Reattach to an existing run directory.
    pub fn open(root: PathBuf) -> Result<Self> {
        let state = RunStateStore::load(&root)?;
        let id = run_id_of(&root);
        Ok(Self { id, root, state })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory of one plan inside the run. A leading `/` in the plan name
    /// must not escape the run directory.
    pub fn plan_dir(&self, plan: &str) -> PathBuf {
        self.root.join("plans").join(plan.trim_start_matches('/'))
    }

    /// Frozen copy of the plan as it was when the run started.
    pub fn plan_file(&self, plan: &str) -> PathBuf {
        self.plan_dir(plan).join("plan.yaml")
    }

    pub fn tests_file(&self, plan: &str) -> PathBuf {
        self.plan_dir(plan).join("discover").join("tests.yaml")
    }

    pub fn guests_file(&self, plan: &str) -> PathBuf {
        self.plan_dir(plan).join("provision").join("guests.yaml")
    }

    /// Directory holding SSH control sockets for the plan's guests.
    pub fn socket_dir(&self, plan: &str) -> PathBuf {
        self.plan_dir(plan).join("provision")
    }

    pub fn results_file(&self, plan: &str) -> PathBuf {
        self.plan_dir(plan).join("execute").join("results.yaml")
    }

    /// Directory collecting the log files of one step's phases.
    pub fn step_dir(&self, plan: &str, step: Step) -> PathBuf {
        self.plan_dir(plan).join(step.as_str())
    }

    pub fn libraries_dir(&self, plan: &str) -> PathBuf {
        self.plan_dir(plan).join("libraries")
    }

    /// Workspace of one test invocation, stable across reboots and
    /// restarts of that test.
    pub fn invocation_dir(&self, plan: &str, test: &Test) -> PathBuf {
        let slug = format!("{}-{}", sanitize(test.name()), test.serial_number);
        self.plan_dir(plan).join("execute").join("data").join(slug)
    }

    /// Path relative to the run root, as referenced from result records.
    pub fn relative<'a>(&self, path: &'a Path) -> &'a Path {
        path.strip_prefix(&self.root).unwrap_or(path)
    }
}

pub(crate) fn run_id_of(root: &Path) -> String {
    root.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| root.display().to_string())
}

/// Turn a path-like name into a single safe file name component.
pub(crate) fn sanitize(name: &str) -> String {
    name.trim_matches('/').replace('/', "-")
}

#[cfg(test)]
mod tests {
    use super::*;
    use gauntlet_types::TestSpec;
    use gauntlet_util::env::WORKDIR_ROOT_ENV;

    fn test(name: &str, serial_number: u64) -> Test {
        let spec: TestSpec =
            serde_yaml::from_str(&format!("name: {name}\ntest: 'true'\n")).unwrap();
        Test {
            spec,
            serial_number,
        }
    }

    #[test]
    fn create_then_open_keeps_the_id() {
        let dir = tempfile::tempdir().unwrap();
        let plan = dir.path().join("plans.yaml");
        std::fs::write(&plan, "/p: {}\n").unwrap();
        temp_env::with_var(WORKDIR_ROOT_ENV, Some(dir.path().join("work")), || {
            let created = Run::create(&plan).unwrap();
            assert_eq!(created.id(), "run-001");

            let opened = Run::open(created.root().to_path_buf()).unwrap();
            assert_eq!(opened.id(), "run-001");
            assert_eq!(opened.state.plan_path(), plan.canonicalize().unwrap());
        });
    }

    #[test]
    fn plan_names_stay_inside_the_run_directory() {
        let dir = tempfile::tempdir().unwrap();
        let plan = dir.path().join("plans.yaml");
        std::fs::write(&plan, "/p: {}\n").unwrap();
        temp_env::with_var(WORKDIR_ROOT_ENV, Some(dir.path().join("work")), || {
            let run = Run::create(&plan).unwrap();
            let nested = run.plan_dir("/plans/smoke");
            assert!(nested.starts_with(run.root()));
            assert!(nested.ends_with("plans/plans/smoke"));
        });
    }

    #[test]
    fn invocation_directories_embed_name_and_serial() {
        let dir = tempfile::tempdir().unwrap();
        let plan = dir.path().join("plans.yaml");
        std::fs::write(&plan, "/p: {}\n").unwrap();
        temp_env::with_var(WORKDIR_ROOT_ENV, Some(dir.path().join("work")), || {
            let run = Run::create(&plan).unwrap();
            let path = run.invocation_dir("/smoke", &test("/tests/compile", 3));
            assert!(path.ends_with("plans/smoke/execute/data/tests-compile-3"));
        });
    }

    #[test]
    fn relative_strips_the_run_root() {
        let dir = tempfile::tempdir().unwrap();
        let plan = dir.path().join("plans.yaml");
        std::fs::write(&plan, "/p: {}\n").unwrap();
        temp_env::with_var(WORKDIR_ROOT_ENV, Some(dir.path().join("work")), || {
            let run = Run::create(&plan).unwrap();
            let absolute = run.results_file("/smoke");
            let relative = run.relative(&absolute);
            assert_eq!(relative, Path::new("plans/smoke/execute/results.yaml"));
        });
    }
}
