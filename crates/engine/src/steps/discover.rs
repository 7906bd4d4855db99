//! The discover step: freeze the test list and hand out serial numbers.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use gauntlet_types::Test;

use crate::plan::PlanSpec;
use crate::run::Run;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TestsDocument {
    tests: Vec<Test>,
}

/// Serial numbers are assigned once, in declaration order, and never
/// change for the lifetime of the run.
pub(crate) fn run(run: &Run, plan_name: &str, plan: &PlanSpec) -> Result<Vec<Test>> {
    let tests: Vec<Test> = plan
        .discover
        .tests
        .iter()
        .enumerate()
        .map(|(index, spec)| Test {
            spec: spec.clone(),
            serial_number: index as u64 + 1,
        })
        .collect();

    let path = run.tests_file(plan_name);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("cannot create {}", parent.display()))?;
    }
    let document = TestsDocument { tests };
    let rendered = serde_yaml::to_string(&document)?;
    std::fs::write(&path, rendered)
        .with_context(|| format!("cannot write {}", path.display()))?;

    info!(plan = %plan_name, tests = document.tests.len(), "tests discovered");
    Ok(document.tests)
}

pub(crate) fn load(run: &Run, plan_name: &str) -> Result<Vec<Test>> {
    let path = run.tests_file(plan_name);
    let raw = std::fs::read_to_string(&path)
        .with_context(|| format!("cannot read discovered tests {}", path.display()))?;
    let document: TestsDocument = serde_yaml::from_str(&raw)
        .with_context(|| format!("malformed test list {}", path.display()))?;
    Ok(document.tests)
}
