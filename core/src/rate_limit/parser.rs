//! Rate spec strings: `<limit>/<multiplier?><unit>`, e.g. `10/s`, `100/5 minutes`.

use crate::error::{Result, StevedoreError};
use regex::Regex;
use std::sync::OnceLock;

fn spec_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| {
        Regex::new(r"(?i)^\s*(?P<limit>\d+)\s*/\s*(?P<multiplier>\d+)?\s*(?P<unit>[a-z]+)\s*$")
            .expect("rate spec regex is valid")
    })
}

/// Parse a rate spec into `(limit, step in seconds)`
pub fn parse_rate_limit(spec: &str) -> Result<(usize, u64)> {
    let invalid = || StevedoreError::InvalidRateLimit(format!("invalid time rate limit `{}`", spec));

    let captures = spec_regex().captures(spec).ok_or_else(invalid)?;

    let limit: usize = captures["limit"].parse().map_err(|_| invalid())?;
    let multiplier: u64 = match captures.name("multiplier") {
        Some(value) => value.as_str().parse::<u64>().map_err(|_| invalid())?.max(1),
        None => 1,
    };

    let unit = captures["unit"].to_ascii_lowercase();
    let seconds: u64 = match unit.as_str() {
        "s" | "sec" | "secs" | "second" | "seconds" => 1,
        "m" | "min" | "mins" | "minute" | "minutes" => 60,
        "h" | "hour" | "hours" => 3600,
        "d" | "day" | "days" => 86400,
        _ => {
            return Err(StevedoreError::InvalidRateLimit(format!(
                "invalid time rate limit unit `{}`",
                unit
            )))
        }
    };

    let step = seconds.checked_mul(multiplier).ok_or_else(invalid)?;
    Ok((limit, step))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_units_and_multipliers() {
        assert_eq!(parse_rate_limit("10/s").unwrap(), (10, 1));
        assert_eq!(parse_rate_limit(" 5 / 2 MINUTES ").unwrap(), (5, 120));
        assert_eq!(parse_rate_limit("100/hour").unwrap(), (100, 3600));
        assert_eq!(parse_rate_limit("1/3d").unwrap(), (1, 259_200));
        assert_eq!(parse_rate_limit("7/0sec").unwrap(), (7, 1));
    }

    #[test]
    fn rejects_bad_syntax_and_units() {
        assert!(matches!(
            parse_rate_limit("ten per second"),
            Err(StevedoreError::InvalidRateLimit(_))
        ));
        assert!(matches!(
            parse_rate_limit("10/weeks"),
            Err(StevedoreError::InvalidRateLimit(msg)) if msg.contains("weeks")
        ));
        assert!(parse_rate_limit("10/").is_err());
    }
}
