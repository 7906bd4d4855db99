//! The step pipeline and its strict total order.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// One step of a plan's pipeline. The derived `Ord` follows declaration
/// order, which is the execution order; `cleanup` is terminal and not part
/// of the regular pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Step {
    Discover,
    Provision,
    Prepare,
    Execute,
    Report,
    Finish,
    Cleanup,
}

impl Step {
    /// Regular pipeline in execution order; excludes the terminal `cleanup`.
    pub const PIPELINE: [Step; 6] = [
        Step::Discover,
        Step::Provision,
        Step::Prepare,
        Step::Execute,
        Step::Report,
        Step::Finish,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Step::Discover => "discover",
            Step::Provision => "provision",
            Step::Prepare => "prepare",
            Step::Execute => "execute",
            Step::Report => "report",
            Step::Finish => "finish",
            Step::Cleanup => "cleanup",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Step::Cleanup)
    }

    /// This step and every pipeline step after it. Clearing a step's done
    /// marker must clear these too, since later steps depend on earlier
    /// artifacts.
    pub fn and_later(self) -> &'static [Step] {
        match Step::PIPELINE.iter().position(|step| *step == self) {
            Some(index) => &Step::PIPELINE[index..],
            None => &[],
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Step {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "discover" => Ok(Step::Discover),
            "provision" => Ok(Step::Provision),
            "prepare" => Ok(Step::Prepare),
            "execute" => Ok(Step::Execute),
            "report" => Ok(Step::Report),
            "finish" => Ok(Step::Finish),
            "cleanup" => Ok(Step::Cleanup),
            other => Err(format!("unknown step '{other}'")),
        }
    }
}
