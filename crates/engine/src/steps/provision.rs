//! The provision step: freeze the guest set and open the transports.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

use gauntlet_guest::{Guest, from_record};
use gauntlet_types::GuestRecord;

use crate::plan::PlanSpec;
use crate::run::Run;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct GuestsDocument {
    guests: Vec<GuestRecord>,
}

pub(crate) fn run(run: &Run, plan_name: &str, plan: &PlanSpec) -> Result<Vec<GuestRecord>> {
    let guests = plan.provision.effective_guests();

    let path = run.guests_file(plan_name);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("cannot create {}", parent.display()))?;
    }
    let document = GuestsDocument { guests };
    let rendered = serde_yaml::to_string(&document)?;
    std::fs::write(&path, rendered)
        .with_context(|| format!("cannot write {}", path.display()))?;

    info!(plan = %plan_name, guests = document.guests.len(), "guests provisioned");
    Ok(document.guests)
}

pub(crate) fn load(run: &Run, plan_name: &str) -> Result<Vec<GuestRecord>> {
    let path = run.guests_file(plan_name);
    let raw = std::fs::read_to_string(&path)
        .with_context(|| format!("cannot read provisioned guests {}", path.display()))?;
    let document: GuestsDocument = serde_yaml::from_str(&raw)
        .with_context(|| format!("malformed guest list {}", path.display()))?;
    Ok(document.guests)
}

/// Open a transport to every guest and verify it is reachable. An
/// unreachable guest breaks the whole plan.
pub(crate) async fn connect(
    run: &Run,
    plan_name: &str,
    records: &[GuestRecord],
) -> Result<Vec<Arc<dyn Guest>>> {
    let socket_dir = run.socket_dir(plan_name);
    std::fs::create_dir_all(&socket_dir)
        .with_context(|| format!("cannot create {}", socket_dir.display()))?;

    let mut guests = Vec::with_capacity(records.len());
    for record in records {
        let guest = from_record(record, &socket_dir);
        guest
            .connect()
            .await
            .with_context(|| format!("cannot reach guest '{}'", record.name))?;
        info!(guest = %record.name, "guest is reachable");
        guests.push(guest);
    }
    Ok(guests)
}
