//! Duration parsing and formatting.
//!
//! Plans declare budgets in the short form ("300", "5m", "2h"); results
//! record elapsed wall time as "HH:MM:SS".

use std::time::Duration;

/// Parse a duration string: a bare number of seconds or a number with an
/// `s`, `m` or `h` suffix (case insensitive).
pub fn parse_duration(value: &str) -> Option<Duration> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return None;
    }
    let last = trimmed.chars().last()?;
    if last.is_ascii_alphabetic() {
        let number: u64 = trimmed[..trimmed.len() - 1].parse().ok()?;
        return match last {
            's' | 'S' => Some(Duration::from_secs(number)),
            'm' | 'M' => Some(Duration::from_secs(number * 60)),
            'h' | 'H' => Some(Duration::from_secs(number * 3600)),
            _ => None,
        };
    }
    let number: u64 = trimmed.parse().ok()?;
    Some(Duration::from_secs(number))
}

/// Format elapsed wall time as "HH:MM:SS". Hours grow past two digits
/// rather than wrapping.
pub fn format_hms(elapsed: Duration) -> String {
    let total = elapsed.as_secs();
    let hours = total / 3600;
    let minutes = (total % 3600) / 60;
    let seconds = total % 60;
    format!("{hours:02}:{minutes:02}:{seconds:02}")
}
