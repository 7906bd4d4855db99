//! The report step: print every result and the run summary.

use tracing::info;

use gauntlet_types::{TestResult, Totals};

pub(crate) fn run(plan_name: &str, results: &[TestResult]) -> Totals {
    info!(plan = %plan_name, "results:");
    let mut totals = Totals::default();
    for result in results {
        totals.count(result.result);
        match &result.note {
            Some(note) => info!(
                "  {} {} ({}): {note}",
                result.result, result.name, result.duration
            ),
            None => info!("  {} {} ({})", result.result, result.name, result.duration),
        }
        for sub in &result.subresult {
            match &sub.note {
                Some(note) => info!("    {} {}: {note}", sub.result, sub.name),
                None => info!("    {} {}", sub.result, sub.name),
            }
        }
        for log in &result.log {
            info!("    log: {log}");
        }
    }
    info!(plan = %plan_name, "{}", totals.executed_phrase());
    info!(plan = %plan_name, "{}", totals.phrase());
    totals
}
