//! Management of existing runs: status inspection and cleanup.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::path::PathBuf;
use tracing::info;

use gauntlet_types::{Step, Totals};
use gauntlet_util::{last_run_dir, run_dir_by_id, runs_root};

use crate::results::ResultStore;
use crate::run::{Run, run_id_of};
use crate::steps::ResumeTarget;

/// Step progress and totals of one plan.
#[derive(Debug, Clone)]
pub struct PlanProgress {
    pub name: String,
    pub done: Vec<Step>,
    /// Totals once the plan has a results file, `None` before that.
    pub totals: Option<Totals>,
}

/// Everything `gauntlet status` shows for one run.
#[derive(Debug, Clone)]
pub struct RunOverview {
    pub id: String,
    pub created: DateTime<Utc>,
    pub plans: Vec<PlanProgress>,
}

/// Which run directories `gauntlet clean` removes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CleanTarget {
    All,
    Last,
    Id(String),
}

pub fn overview(target: &ResumeTarget) -> Result<RunOverview> {
    let root = runs_root();
    let run_dir = match target {
        ResumeTarget::Id(id) => run_dir_by_id(&root, id)?,
        ResumeTarget::Last => last_run_dir(&root)?
            .with_context(|| format!("no runs found under {}", root.display()))?,
    };
    inspect(run_dir)
}

fn inspect(root: PathBuf) -> Result<RunOverview> {
    let run = Run::open(root)?;
    let mut plans = Vec::new();
    for name in run.state.plan_names() {
        let done = run.state.done_steps(&name);
        let results_file = run.results_file(&name);
        let totals = if results_file.is_file() {
            Some(ResultStore::open_or_create(results_file)?.totals())
        } else {
            None
        };
        plans.push(PlanProgress { name, done, totals });
    }
    Ok(RunOverview {
        id: run.id().to_string(),
        created: run.state.created(),
        plans,
    })
}

/// Remove the targeted run directories. Returns the removed run ids.
pub fn clean(target: &CleanTarget) -> Result<Vec<String>> {
    let root = runs_root();
    let victims: Vec<PathBuf> = match target {
        CleanTarget::All => match std::fs::read_dir(&root) {
            Ok(entries) => {
                let mut dirs: Vec<PathBuf> = entries
                    .filter_map(Result::ok)
                    .map(|entry| entry.path())
                    .filter(|path| path.is_dir())
                    .collect();
                dirs.sort();
                dirs
            }
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(error) => {
                return Err(error).with_context(|| format!("cannot list {}", root.display()));
            }
        },
        CleanTarget::Last => last_run_dir(&root)?.into_iter().collect(),
        CleanTarget::Id(id) => vec![run_dir_by_id(&root, id)?],
    };

    let mut removed = Vec::new();
    for victim in victims {
        let id = run_id_of(&victim);
        std::fs::remove_dir_all(&victim)
            .with_context(|| format!("cannot remove {}", victim.display()))?;
        info!(run = %id, "removed");
        removed.push(id);
    }
    Ok(removed)
}
