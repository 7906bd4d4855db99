//! Prepare and finish phases: plan-level scripts run on every guest, in
//! phase order.

use anyhow::{Context, Result, bail};
use std::fs::OpenOptions;
use std::io::Write;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::info;

use gauntlet_guest::{Guest, OutputSink, RunOptions, StreamKind, Termination};
use gauntlet_types::{GuestRecord, Step};

use crate::plan::{PhaseSpec, PlanSpec};
use crate::run::{Run, sanitize};

/// Run the phases the step defines. A failed phase breaks the plan; the
/// phases are environment work, not tests.
pub(crate) async fn run(
    run: &Run,
    plan_name: &str,
    plan: &PlanSpec,
    step: Step,
    records: &[GuestRecord],
    guests: &[Arc<dyn Guest>],
    cancel: &CancellationToken,
) -> Result<()> {
    let mut phases: Vec<&PhaseSpec> = match step {
        Step::Prepare => plan.prepare.iter().collect(),
        Step::Finish => plan.finish.iter().collect(),
        _ => Vec::new(),
    };
    if phases.is_empty() {
        return Ok(());
    }
    // Stable sort: equal orders keep their declaration order.
    phases.sort_by_key(|phase| phase.order);

    let dir = run.step_dir(plan_name, step);
    std::fs::create_dir_all(&dir).with_context(|| format!("cannot create {}", dir.display()))?;

    for phase in phases {
        for (record, guest) in records.iter().zip(guests) {
            if cancel.is_cancelled() {
                bail!("run interrupted");
            }

            let log_path = dir.join(format!("{}-{}.log", sanitize(&phase.name), record.name));
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&log_path)
                .with_context(|| format!("cannot open phase log {}", log_path.display()))?;
            let file = Mutex::new(file);
            let writer = |_kind: StreamKind, line: &str| {
                let mut file = file.lock().expect("phase log lock poisoned");
                let _ = writeln!(file, "{line}");
            };

            let mut options = RunOptions::new(&plan.environment);
            options.elevate = record.supports_elevation();
            options.cancel = cancel.child_token();
            options.sink = Some(&writer as &OutputSink);

            let output = guest.run(&phase.script, options).await.with_context(|| {
                format!("cannot run {step} phase '{}' on guest '{}'", phase.name, record.name)
            })?;
            if output.termination == Termination::Cancelled {
                bail!("run interrupted");
            }
            if !output.success() {
                let reason = match output.exit_code {
                    Some(code) => format!("exit {code}"),
                    None => "killed by a signal".to_string(),
                };
                bail!(
                    "{step} phase '{}' failed on guest '{}' ({reason})",
                    phase.name,
                    record.name
                );
            }
            info!(phase = %phase.name, guest = %record.name, "{step} phase complete");
        }
    }
    Ok(())
}
