//! Multihost topology document pushed to every guest.
//!
//! Tests read this file (path in `GAUNTLET_TOPOLOGY`) to find their peers:
//! which guest they run on, and every guest of the plan with its role.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

use gauntlet_types::GuestRecord;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct TopologyGuest {
    pub name: String,
    pub role: String,
}

impl TopologyGuest {
    fn from_record(record: &GuestRecord) -> Self {
        Self {
            name: record.name.clone(),
            role: record.role_or_name().to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Topology {
    /// The guest the reading test runs on.
    pub guest: TopologyGuest,
    /// Every guest of the plan, in provision order.
    pub guests: Vec<TopologyGuest>,
}

impl Topology {
    pub fn new(current: &GuestRecord, all: &[GuestRecord]) -> Self {
        Self {
            guest: TopologyGuest::from_record(current),
            guests: all.iter().map(TopologyGuest::from_record).collect(),
        }
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        let rendered = serde_yaml::to_string(self).context("cannot render topology")?;
        std::fs::write(path, rendered)
            .with_context(|| format!("cannot write topology '{}'", path.display()))?;
        Ok(())
    }
}
