//! The pipeline driver: walk every plan of a run through its steps,
//! skipping work that is already marked done.

mod discover;
mod phases;
mod provision;
mod report;

use anyhow::{Result, anyhow, bail};
use indexmap::IndexMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use gauntlet_guest::Guest;
use gauntlet_types::{EXIT_ERROR, GuestRecord, Step, Test, Totals};
use gauntlet_util::{last_run_dir, run_dir_by_id, runs_root};

use crate::execute::{self, Selection};
use crate::plan::{self, PlanSpec};
use crate::results::ResultStore;
use crate::run::Run;

/// Which existing run a command refers to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResumeTarget {
    Last,
    Id(String),
}

/// Everything `gauntlet run` accepts.
#[derive(Debug, Clone, Default)]
pub struct RunRequest {
    /// Plan file for a fresh run.
    pub plan_path: Option<PathBuf>,
    /// Resume an existing run instead of starting a fresh one.
    pub resume: Option<ResumeTarget>,
    /// Wipe the results of the resumed run and execute everything again.
    pub again: bool,
    /// Redo the whole pipeline of the resumed run, every step included.
    pub force: bool,
    /// Re-execute only the tests that have not passed yet.
    pub rerun: bool,
    /// Stop once this step has run.
    pub until: Option<Step>,
    /// Attach tests to the terminal instead of capturing output.
    pub interactive: bool,
}

/// What a finished run hands back to the caller.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub run_id: String,
    pub totals: Totals,
    /// Plans that broke with an infrastructure error.
    pub broken_plans: Vec<String>,
}

impl RunReport {
    /// Process exit code with severity precedence error > fail > warn >
    /// ok. A broken plan is always an error.
    pub fn exit_code(&self) -> i32 {
        if self.broken_plans.is_empty() {
            self.totals.exit_code()
        } else {
            EXIT_ERROR
        }
    }
}

struct PlanOutcome {
    totals: Totals,
    aborted: bool,
}

/// Run the pipeline the request describes, creating or resuming the run
/// directory as needed.
pub async fn perform_run(request: RunRequest, cancel: CancellationToken) -> Result<RunReport> {
    let resuming = request.resume.is_some() || request.again || request.force || request.rerun;
    let (run, plans) = if resuming {
        let target = request.resume.clone().unwrap_or(ResumeTarget::Last);
        let root = resolve_run_dir(&target)?;
        let run = Run::open(root)?;
        info!(run = %run.id(), "resuming");
        let plans = resume_plans(&run)?;
        (run, plans)
    } else {
        let plan_path = request.plan_path.clone().ok_or_else(|| {
            anyhow!("a plan file is required to start a new run (try --plan FILE, or --last to resume)")
        })?;
        let plans = plan::load_plans(&plan_path)?;
        let run = Run::create(&plan_path)?;
        run.state.ensure_plans(plans.keys())?;
        (run, plans)
    };

    if request.force {
        run.state.reset_all()?;
        info!("redoing every step");
    } else if request.again {
        for name in run.state.plan_names() {
            run.state.reset_from(&name, Step::Execute)?;
        }
        info!("redoing execution");
    }

    let run = Arc::new(run);
    let mut totals = Totals::default();
    let mut broken = Vec::new();
    let mut aborted = false;

    for (name, plan) in &plans {
        if aborted {
            warn!(plan = %name, "skipped, an earlier plan aborted the run");
            continue;
        }
        match drive_plan(run.clone(), name, plan, &request, &cancel).await {
            Ok(outcome) => {
                merge(&mut totals, outcome.totals);
                aborted = outcome.aborted;
            }
            Err(error) => {
                if cancel.is_cancelled() {
                    return Err(error);
                }
                error!(plan = %name, "plan broke: {error:#}");
                broken.push(name.clone());
            }
        }
    }

    Ok(RunReport {
        run_id: run.id().to_string(),
        totals,
        broken_plans: broken,
    })
}

fn resolve_run_dir(target: &ResumeTarget) -> Result<PathBuf> {
    let root = runs_root();
    match target {
        ResumeTarget::Id(id) => run_dir_by_id(&root, id),
        ResumeTarget::Last => {
            last_run_dir(&root)?.ok_or_else(|| anyhow!("no runs found under {}", root.display()))
        }
    }
}

/// Plans of a resumed run come from the per-plan snapshots when they
/// exist; a plan that never reached its snapshot falls back to the
/// original plan file.
fn resume_plans(run: &Run) -> Result<IndexMap<String, PlanSpec>> {
    let mut plans = IndexMap::new();
    let mut original: Option<IndexMap<String, PlanSpec>> = None;
    for name in run.state.plan_names() {
        let snapshot = run.plan_file(&name);
        let plan = if snapshot.is_file() {
            plan::load_snapshot(&snapshot)?
        } else {
            let source = match &mut original {
                Some(source) => source,
                None => original.insert(plan::load_plans(&run.state.plan_path())?),
            };
            source.shift_remove(&name).ok_or_else(|| {
                anyhow!(
                    "plan '{name}' is no longer in {}",
                    run.state.plan_path().display()
                )
            })?
        };
        plans.insert(name, plan);
    }
    Ok(plans)
}

fn merge(into: &mut Totals, other: Totals) {
    into.skipped += other.skipped;
    into.passed += other.passed;
    into.info += other.info;
    into.warned += other.warned;
    into.failed += other.failed;
    into.errored += other.errored;
    into.pending += other.pending;
}

/// Transports are opened once per plan pass, the first time a step needs
/// them, and closed when the plan is over.
async fn connect_once(
    run: &Run,
    plan_name: &str,
    records: &[GuestRecord],
    cache: &mut Option<Vec<Arc<dyn Guest>>>,
) -> Result<Vec<Arc<dyn Guest>>> {
    match cache {
        Some(guests) => Ok(guests.clone()),
        None => {
            let guests = provision::connect(run, plan_name, records).await?;
            *cache = Some(guests.clone());
            Ok(guests)
        }
    }
}

async fn drive_plan(
    run: Arc<Run>,
    name: &str,
    plan: &PlanSpec,
    request: &RunRequest,
    cancel: &CancellationToken,
) -> Result<PlanOutcome> {
    info!(plan = %name, "pipeline starting");
    let snapshot = run.plan_file(name);
    if !snapshot.is_file() {
        plan::write_snapshot(&snapshot, plan)?;
    }

    let wipe = request.force || request.again;
    let results = if wipe {
        Arc::new(ResultStore::create(run.results_file(name))?)
    } else {
        Arc::new(ResultStore::open_or_create(run.results_file(name))?)
    };

    let mut tests: Option<Vec<Test>> = None;
    let mut records: Option<Vec<GuestRecord>> = None;
    let mut transports: Option<Vec<Arc<dyn Guest>>> = None;
    let mut totals = Totals::default();
    let mut aborted = false;
    let mut reentered = false;

    let driven: Result<()> = async {
        for step in Step::PIPELINE {
            if let Some(until) = request.until {
                if step > until {
                    info!(plan = %name, "stopping after the {until} step");
                    break;
                }
            }
            if cancel.is_cancelled() {
                bail!("run interrupted");
            }
            let done = run.state.is_done(name, step);
            match step {
                Step::Discover => {
                    tests = Some(if done {
                        discover::load(&run, name)?
                    } else {
                        let list = discover::run(&run, name, plan)?;
                        run.state.mark_done(name, step)?;
                        list
                    });
                }
                Step::Provision => {
                    records = Some(if done {
                        provision::load(&run, name)?
                    } else {
                        let list = provision::run(&run, name, plan)?;
                        run.state.mark_done(name, step)?;
                        list
                    });
                }
                Step::Prepare | Step::Finish => {
                    if done && !(step == Step::Finish && reentered) {
                        continue;
                    }
                    let records =
                        records.as_ref().ok_or_else(|| anyhow!("{step} before provision"))?;
                    let guests = connect_once(&run, name, records, &mut transports).await?;
                    phases::run(&run, name, plan, step, records, &guests, cancel).await?;
                    if !done {
                        run.state.mark_done(name, step)?;
                    }
                }
                Step::Execute => {
                    let selection = if done {
                        if request.rerun {
                            reentered = true;
                            Some(Selection::NotPassed)
                        } else {
                            None
                        }
                    } else if request.rerun {
                        Some(Selection::NotPassed)
                    } else {
                        Some(Selection::Remaining)
                    };
                    let Some(selection) = selection else { continue };
                    let tests = tests.as_ref().ok_or_else(|| anyhow!("execute before discover"))?;
                    let records =
                        records.as_ref().ok_or_else(|| anyhow!("execute before provision"))?;
                    let guests = connect_once(&run, name, records, &mut transports).await?;
                    aborted = execute::run(
                        run.clone(),
                        name.to_string(),
                        plan,
                        tests,
                        records.clone(),
                        guests,
                        results.clone(),
                        selection,
                        request.interactive,
                        cancel.clone(),
                    )
                    .await?;
                    if !done {
                        run.state.mark_done(name, step)?;
                    }
                    if aborted {
                        // report and finish still run; later plans do not
                        warn!(plan = %name, "a test aborted the run");
                    }
                }
                Step::Report => {
                    let snapshot = results.snapshot();
                    if done && !reentered {
                        totals = Totals::from_results(snapshot.iter());
                        continue;
                    }
                    totals = report::run(name, &snapshot);
                    if !done {
                        run.state.mark_done(name, step)?;
                    }
                }
                // not part of the pipeline walk; `gauntlet clean` owns it
                Step::Cleanup => {}
            }
        }
        Ok(())
    }
    .await;

    if let Some(guests) = &transports {
        for guest in guests {
            if let Err(error) = guest.disconnect().await {
                warn!(guest = %guest.name(), "disconnect failed: {error}");
            }
        }
    }
    driven?;
    Ok(PlanOutcome { totals, aborted })
}

#[cfg(test)]
mod tests {
    use super::*;
    use gauntlet_types::{EXIT_FAIL, EXIT_OK, EXIT_WARN, Outcome};

    #[test]
    fn broken_plans_force_the_error_exit() {
        let mut totals = Totals::default();
        totals.count(Outcome::Pass);
        let report = RunReport {
            run_id: "run-001".into(),
            totals,
            broken_plans: vec!["/suite".into()],
        };
        assert_eq!(report.exit_code(), EXIT_ERROR);
    }

    #[test]
    fn exit_codes_follow_the_most_severe_outcome() {
        let mut totals = Totals::default();
        totals.count(Outcome::Pass);
        let ok = RunReport {
            run_id: "run-001".into(),
            totals,
            broken_plans: Vec::new(),
        };
        assert_eq!(ok.exit_code(), EXIT_OK);

        totals.count(Outcome::Warn);
        let warned = RunReport {
            run_id: "run-001".into(),
            totals,
            broken_plans: Vec::new(),
        };
        assert_eq!(warned.exit_code(), EXIT_WARN);

        totals.count(Outcome::Fail);
        let failed = RunReport {
            run_id: "run-001".into(),
            totals,
            broken_plans: Vec::new(),
        };
        assert_eq!(failed.exit_code(), EXIT_FAIL);
    }

    #[test]
    fn totals_merge_by_field() {
        let mut left = Totals::default();
        left.count(Outcome::Pass);
        left.count(Outcome::Fail);
        let mut right = Totals::default();
        right.count(Outcome::Pass);
        right.count(Outcome::Pending);
        merge(&mut left, right);
        assert_eq!(left.passed, 2);
        assert_eq!(left.failed, 1);
        assert_eq!(left.pending, 1);
        assert_eq!(left.total(), 4);
    }
}
