//! Short duration grammar: `<int><unit>` with `unit ∈ {s, m, h, d, w, M, y}`.
//!
//! `M` and `y` are calendar-naive approximations (30 d and 365 d
//! respectively) — see DESIGN.md open question (iii).

use crate::error::ReplicatorError;
use chrono::Duration as ChronoDuration;

const DAY_SECS: i64 = 24 * 60 * 60;

/// Parse a duration string like `30d`, `6h`, `2w`, `1M`, `1y` into a
/// `chrono::Duration`. Returns `ReplicatorError::InvalidDuration` for any
/// string that doesn't match `<int><unit>` exactly.
pub fn parse_duration(input: &str) -> Result<ChronoDuration, ReplicatorError> {
    let input = input.trim();
    if input.is_empty() {
        return Err(ReplicatorError::InvalidDuration(input.to_string()));
    }

    let (digits, unit) = input.split_at(input.len() - 1);
    let amount: i64 = digits
        .parse()
        .map_err(|_| ReplicatorError::InvalidDuration(input.to_string()))?;

    let secs = match unit {
        "s" => amount,
        "m" => amount * 60,
        "h" => amount * 3600,
        "d" => amount * DAY_SECS,
        "w" => amount * DAY_SECS * 7,
        "M" => amount * DAY_SECS * 30,
        "y" => amount * DAY_SECS * 365,
        _ => return Err(ReplicatorError::InvalidDuration(input.to_string())),
    };

    Ok(ChronoDuration::seconds(secs))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_each_unit() {
        assert_eq!(parse_duration("30s").unwrap(), ChronoDuration::seconds(30));
        assert_eq!(parse_duration("5m").unwrap(), ChronoDuration::seconds(300));
        assert_eq!(parse_duration("2h").unwrap(), ChronoDuration::seconds(7200));
        assert_eq!(parse_duration("30d").unwrap(), ChronoDuration::seconds(30 * DAY_SECS));
        assert_eq!(parse_duration("1w").unwrap(), ChronoDuration::seconds(7 * DAY_SECS));
        assert_eq!(parse_duration("1M").unwrap(), ChronoDuration::seconds(30 * DAY_SECS));
        assert_eq!(parse_duration("1y").unwrap(), ChronoDuration::seconds(365 * DAY_SECS));
    }

    #[test]
    fn rejects_malformed_input() {
        assert!(parse_duration("").is_err());
        assert!(parse_duration("30").is_err());
        assert!(parse_duration("d30").is_err());
        assert!(parse_duration("30x").is_err());
    }
}
