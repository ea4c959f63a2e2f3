//! Duration strings such as `30s`, `1m30s`, `250ms` or `1.5h`.
//!
//! A duration is a sequence of decimal numbers, each with an optional
//! fraction and a mandatory unit suffix. Valid units are `ns`, `us` (or `µs`),
//! `ms`, `s`, `m` and `h`. A bare `0` is accepted. Negative durations are
//! rejected.

use std::time::Duration;

/// Error returned for an unparsable duration string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DurationError(pub String);

impl std::fmt::Display for DurationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for DurationError {}

/// Parses a duration string.
pub fn parse_duration(input: &str) -> Result<Duration, DurationError> {
    let s = input.trim();
    if s.is_empty() {
        return Err(DurationError("empty duration".to_string()));
    }
    if s == "0" {
        return Ok(Duration::ZERO);
    }
    if s.starts_with('-') {
        return Err(DurationError(format!("negative duration '{}'", input)));
    }

    let mut rest = s.strip_prefix('+').unwrap_or(s);
    let mut total_nanos: f64 = 0.0;

    while !rest.is_empty() {
        let num_len = rest
            .char_indices()
            .find(|(_, c)| !(c.is_ascii_digit() || *c == '.'))
            .map(|(i, _)| i)
            .unwrap_or(rest.len());
        if num_len == 0 {
            return Err(DurationError(format!("invalid duration '{}'", input)));
        }
        let number: f64 = rest[..num_len]
            .parse()
            .map_err(|_| DurationError(format!("invalid number in duration '{}'", input)))?;
        rest = &rest[num_len..];

        let unit_len = rest
            .char_indices()
            .find(|(_, c)| c.is_ascii_digit() || *c == '.')
            .map(|(i, _)| i)
            .unwrap_or(rest.len());
        let unit = &rest[..unit_len];
        rest = &rest[unit_len..];

        let scale = match unit {
            "ns" => 1.0,
            "us" | "µs" => 1e3,
            "ms" => 1e6,
            "s" => 1e9,
            "m" => 60.0 * 1e9,
            "h" => 3600.0 * 1e9,
            "" => return Err(DurationError(format!("missing unit in duration '{}'", input))),
            other => {
                return Err(DurationError(format!(
                    "unknown unit '{}' in duration '{}'",
                    other, input
                )))
            }
        };
        total_nanos += number * scale;
    }

    if !total_nanos.is_finite() || total_nanos > u64::MAX as f64 {
        return Err(DurationError(format!("duration '{}' out of range", input)));
    }
    Ok(Duration::from_nanos(total_nanos.round() as u64))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_simple_units() {
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("2h").unwrap(), Duration::from_secs(7200));
        assert_eq!(parse_duration("10us").unwrap(), Duration::from_micros(10));
        assert_eq!(parse_duration("0").unwrap(), Duration::ZERO);
    }

    #[test]
    fn test_compound_and_fraction() {
        assert_eq!(parse_duration("1m30s").unwrap(), Duration::from_secs(90));
        assert_eq!(parse_duration("1.5s").unwrap(), Duration::from_millis(1500));
        assert_eq!(parse_duration("1h0m5s").unwrap(), Duration::from_secs(3605));
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(parse_duration("").is_err());
        assert!(parse_duration("invalid").is_err());
        assert!(parse_duration("30").is_err());
        assert!(parse_duration("5x").is_err());
        assert!(parse_duration("-5s").is_err());
        assert!(parse_duration("s").is_err());
    }

    proptest! {
        #[test]
        fn prop_whole_seconds(n in 0u64..1_000_000) {
            prop_assert_eq!(parse_duration(&format!("{}s", n)).unwrap(), Duration::from_secs(n));
        }

        #[test]
        fn prop_minutes_and_seconds(m in 0u64..10_000, s in 0u64..60) {
            let parsed = parse_duration(&format!("{}m{}s", m, s)).unwrap();
            prop_assert_eq!(parsed, Duration::from_secs(m * 60 + s));
        }
    }
}
