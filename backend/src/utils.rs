use chrono::{DateTime, Utc};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid ISO 8601 duration {input:?}: {reason}")]
pub struct DurationParseError {
    pub input: String,
    pub reason: &'static str,
}

/// Parse an RFC 3339 / ISO 8601 instant (`2024-01-01T00:00:00Z`).
pub fn parse_iso8601_timestamp(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Parse an ISO 8601 duration (`PT1H2M3S`, `P1DT30M`, `P0D`) into total seconds.
///
/// Weeks, days, hours, minutes and seconds are accepted. Years and months have
/// no fixed length and are rejected, as is any malformed input.
pub fn parse_iso8601_duration(value: &str) -> Result<f64, DurationParseError> {
    let fail = |reason| DurationParseError {
        input: value.to_string(),
        reason,
    };

    let (sign, rest) = match value.strip_prefix('-') {
        Some(rest) => (-1.0, rest),
        None => (1.0, value.strip_prefix('+').unwrap_or(value)),
    };
    let rest = rest.strip_prefix('P').ok_or_else(|| fail("missing 'P' designator"))?;

    let mut total = 0.0;
    let mut components = 0;
    let mut in_time = false;
    let mut number = String::new();
    let mut saw_fraction = false;

    for ch in rest.chars() {
        match ch {
            '0'..='9' => number.push(ch),
            '.' | ',' => {
                if saw_fraction {
                    return Err(fail("fraction on more than one component"));
                }
                number.push('.');
            }
            'T' => {
                if in_time || !number.is_empty() {
                    return Err(fail("misplaced 'T' designator"));
                }
                in_time = true;
            }
            unit => {
                if number.is_empty() {
                    return Err(fail("designator without a number"));
                }
                if saw_fraction {
                    return Err(fail("fraction is only allowed on the last component"));
                }
                let amount: f64 = number.parse().map_err(|_| fail("invalid number"))?;
                saw_fraction = number.contains('.');
                number.clear();

                let seconds_per_unit = match (in_time, unit) {
                    (false, 'W') => 7.0 * 86_400.0,
                    (false, 'D') => 86_400.0,
                    (false, 'Y') | (false, 'M') => {
                        return Err(fail("years and months have no fixed length"))
                    }
                    (true, 'H') => 3_600.0,
                    (true, 'M') => 60.0,
                    (true, 'S') => 1.0,
                    _ => return Err(fail("unknown designator")),
                };
                total += amount * seconds_per_unit;
                components += 1;
            }
        }
    }

    if !number.is_empty() {
        return Err(fail("trailing number without designator"));
    }
    if components == 0 {
        return Err(fail("no components"));
    }

    Ok(sign * total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn parses_time_components() {
        assert_eq!(parse_iso8601_duration("PT1H2M3S"), Ok(3723.0));
        assert_eq!(parse_iso8601_duration("PT45S"), Ok(45.0));
        assert_eq!(parse_iso8601_duration("PT1M"), Ok(60.0));
        assert_eq!(parse_iso8601_duration("PT0.5S"), Ok(0.5));
    }

    #[test]
    fn parses_date_components() {
        assert_eq!(parse_iso8601_duration("P0D"), Ok(0.0));
        assert_eq!(parse_iso8601_duration("P1DT1S"), Ok(86_401.0));
        assert_eq!(parse_iso8601_duration("P1W"), Ok(604_800.0));
    }

    #[test]
    fn rejects_malformed_input() {
        for input in ["", "P", "PT", "1H", "PTXS", "PT1H2", "invalid", "PT1.5M2S", "P1Y", "P2M"] {
            assert!(
                parse_iso8601_duration(input).is_err(),
                "{input:?} should be rejected"
            );
        }
    }

    #[test]
    fn parses_timestamps() {
        assert_eq!(
            parse_iso8601_timestamp("2024-03-01T12:00:00Z"),
            Some(Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap())
        );
        assert_eq!(
            parse_iso8601_timestamp("2024-03-01T21:00:00+09:00"),
            Some(Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap())
        );
        assert_eq!(parse_iso8601_timestamp("yesterday"), None);
    }
}
