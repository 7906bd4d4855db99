//! Outcome model and severity ordering.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Outcome of a test or subresult.
///
/// The derived `Ord` follows declaration order, which is the severity order:
/// `skip` is least severe, `error` most severe. `Pending` marks tests that
/// were selected but never got to run; it sits outside the severity scale and
/// is never reported from inside a test, so it never participates in
/// subresult aggregation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    /// Deliberately excluded from execution.
    Skip,
    /// Executed and succeeded.
    #[default]
    Pass,
    /// Informational outcome, still benign.
    Info,
    /// Executed with warnings.
    Warn,
    /// The test itself found a problem.
    Fail,
    /// The execution broke: timeout, unreachable guest, crashed process.
    Error,
    /// Selected but never executed (distinct from `Skip`).
    Pending,
}

impl Outcome {
    /// Outcomes a test is allowed to report through the in-test interface.
    pub const REPORTABLE: [Outcome; 6] = [
        Outcome::Skip,
        Outcome::Pass,
        Outcome::Info,
        Outcome::Warn,
        Outcome::Fail,
        Outcome::Error,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Skip => "skip",
            Outcome::Pass => "pass",
            Outcome::Info => "info",
            Outcome::Warn => "warn",
            Outcome::Fail => "fail",
            Outcome::Error => "error",
            Outcome::Pending => "pending",
        }
    }

    /// Whether a test may emit this outcome through the reporting interface.
    pub fn is_reportable(&self) -> bool {
        !matches!(self, Outcome::Pending)
    }

    /// Most severe outcome of the sequence, `None` when empty.
    pub fn aggregate<I>(outcomes: I) -> Option<Outcome>
    where
        I: IntoIterator<Item = Outcome>,
    {
        outcomes.into_iter().max()
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Outcome {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "skip" => Ok(Outcome::Skip),
            "pass" => Ok(Outcome::Pass),
            "info" => Ok(Outcome::Info),
            "warn" => Ok(Outcome::Warn),
            "fail" => Ok(Outcome::Fail),
            "error" => Ok(Outcome::Error),
            "pending" => Ok(Outcome::Pending),
            other => Err(format!("unknown outcome '{other}'")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_order_matches_scale() {
        assert!(Outcome::Skip < Outcome::Pass);
        assert!(Outcome::Pass < Outcome::Info);
        assert!(Outcome::Info < Outcome::Warn);
        assert!(Outcome::Warn < Outcome::Fail);
        assert!(Outcome::Fail < Outcome::Error);
    }

    #[test]
    fn aggregate_picks_most_severe() {
        let reported = [Outcome::Pass, Outcome::Warn, Outcome::Info];
        assert_eq!(Outcome::aggregate(reported), Some(Outcome::Warn));
        assert_eq!(Outcome::aggregate([]), None);
    }

    #[test]
    fn serializes_lowercase() {
        assert_eq!(serde_json::to_string(&Outcome::Warn).unwrap(), "\"warn\"");
        let parsed: Outcome = serde_json::from_str("\"error\"").unwrap();
        assert_eq!(parsed, Outcome::Error);
    }

    #[test]
    fn pending_is_not_reportable() {
        assert!(!Outcome::Pending.is_reportable());
        assert!(Outcome::REPORTABLE.iter().all(Outcome::is_reportable));
    }

    #[test]
    fn parses_from_str() {
        assert_eq!("fail".parse::<Outcome>().unwrap(), Outcome::Fail);
        assert!("bogus".parse::<Outcome>().is_err());
    }
}
