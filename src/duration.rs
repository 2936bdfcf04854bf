//! Duration expressions such as `"1h30m"`, `"1.5s"` or `"300ms"`
//!
//! Parsing accepts a sequence of decimal numbers, each with an optional
//! fraction and a mandatory unit suffix (`ns`, `us`/`µs`, `ms`, `s`, `m`,
//! `h`), with an optional leading sign. The single value `"0"` needs no unit.
//!
//! Formatting produces the canonical form used in token responses:
//! `72h0m0s`, `1m30s`, `1.5s`, `500ms`, `0s`.

use chrono::TimeDelta;

const NANOS_PER_MICRO: u128 = 1_000;
const NANOS_PER_MILLI: u128 = 1_000_000;
const NANOS_PER_SEC: u128 = 1_000_000_000;
const NANOS_PER_MIN: u128 = 60 * NANOS_PER_SEC;
const NANOS_PER_HOUR: u128 = 60 * NANOS_PER_MIN;

/// Fraction digits beyond this carry no weight at nanosecond precision
const MAX_FRACTION_DIGITS: usize = 18;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DurationError {
    #[error("invalid duration {0:?}")]
    Invalid(String),
    #[error("missing unit in duration {0:?}")]
    MissingUnit(String),
    #[error("unknown unit {unit:?} in duration {input:?}")]
    UnknownUnit { unit: String, input: String },
    #[error("duration {0:?} out of range")]
    Overflow(String),
}

fn unit_nanos(unit: &str) -> Option<u128> {
    match unit {
        "ns" => Some(1),
        "us" | "\u{00b5}s" | "\u{03bc}s" => Some(NANOS_PER_MICRO),
        "ms" => Some(NANOS_PER_MILLI),
        "s" => Some(NANOS_PER_SEC),
        "m" => Some(NANOS_PER_MIN),
        "h" => Some(NANOS_PER_HOUR),
        _ => None,
    }
}

/// Parse a duration expression
pub fn parse_duration(input: &str) -> Result<TimeDelta, DurationError> {
    let invalid = || DurationError::Invalid(input.to_string());

    let (negative, mut rest) = match input.as_bytes().first() {
        Some(b'-') => (true, &input[1..]),
        Some(b'+') => (false, &input[1..]),
        _ => (false, input),
    };

    if rest == "0" {
        return Ok(TimeDelta::zero());
    }
    if rest.is_empty() {
        return Err(invalid());
    }

    let mut total: u128 = 0;

    while !rest.is_empty() {
        let int_len = rest.bytes().take_while(u8::is_ascii_digit).count();
        let (int_digits, after_int) = rest.split_at(int_len);

        let (frac_digits, after_number) = match after_int.strip_prefix('.') {
            Some(after_dot) => {
                let frac_len = after_dot.bytes().take_while(u8::is_ascii_digit).count();
                after_dot.split_at(frac_len)
            }
            None => ("", after_int),
        };

        if int_digits.is_empty() && frac_digits.is_empty() {
            return Err(invalid());
        }

        let unit_len = after_number
            .find(|c: char| c == '.' || c.is_ascii_digit())
            .unwrap_or(after_number.len());
        let (unit, remaining) = after_number.split_at(unit_len);

        if unit.is_empty() {
            return Err(DurationError::MissingUnit(input.to_string()));
        }
        let scale = unit_nanos(unit).ok_or_else(|| DurationError::UnknownUnit {
            unit: unit.to_string(),
            input: input.to_string(),
        })?;

        let whole: u128 = if int_digits.is_empty() {
            0
        } else {
            int_digits
                .parse()
                .map_err(|_| DurationError::Overflow(input.to_string()))?
        };

        let mut nanos = whole
            .checked_mul(scale)
            .ok_or_else(|| DurationError::Overflow(input.to_string()))?;

        if !frac_digits.is_empty() {
            let digits = &frac_digits[..frac_digits.len().min(MAX_FRACTION_DIGITS)];
            let numerator: u128 = digits.parse().map_err(|_| invalid())?;
            let denominator = 10u128.pow(digits.len() as u32);
            nanos = nanos
                .checked_add(numerator * scale / denominator)
                .ok_or_else(|| DurationError::Overflow(input.to_string()))?;
        }

        total = total
            .checked_add(nanos)
            .filter(|t| *t <= i64::MAX as u128)
            .ok_or_else(|| DurationError::Overflow(input.to_string()))?;

        rest = remaining;
    }

    let nanos = total as i64;
    Ok(TimeDelta::nanoseconds(if negative { -nanos } else { nanos }))
}

/// Format a duration in canonical `72h0m0s` form
pub fn format_duration(duration: TimeDelta) -> String {
    let nanos = duration.num_nanoseconds().unwrap_or(if duration < TimeDelta::zero() {
        i64::MIN
    } else {
        i64::MAX
    });

    if nanos == 0 {
        return "0s".to_string();
    }

    let sign = if nanos < 0 { "-" } else { "" };
    let magnitude = nanos.unsigned_abs() as u128;

    if magnitude < NANOS_PER_SEC {
        let body = if magnitude < NANOS_PER_MICRO {
            format!("{}ns", magnitude)
        } else if magnitude < NANOS_PER_MILLI {
            format!("{}\u{00b5}s", format_fraction(magnitude, 3))
        } else {
            format!("{}ms", format_fraction(magnitude, 6))
        };
        return format!("{}{}", sign, body);
    }

    let seconds = format_fraction(magnitude % NANOS_PER_MIN, 9);
    let total_minutes = magnitude / NANOS_PER_MIN;
    let hours = total_minutes / 60;
    let minutes = total_minutes % 60;

    if hours > 0 {
        format!("{}{}h{}m{}s", sign, hours, minutes, seconds)
    } else if minutes > 0 {
        format!("{}{}m{}s", sign, minutes, seconds)
    } else {
        format!("{}{}s", sign, seconds)
    }
}

/// Render `value / 10^precision` with trailing fractional zeros removed
fn format_fraction(value: u128, precision: u32) -> String {
    let divisor = 10u128.pow(precision);
    let whole = value / divisor;
    let fraction = value % divisor;

    if fraction == 0 {
        return whole.to_string();
    }

    let digits = format!("{:0width$}", fraction, width = precision as usize);
    format!("{}.{}", whole, digits.trim_end_matches('0'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple_units() {
        assert_eq!(parse_duration("1h").unwrap(), TimeDelta::hours(1));
        assert_eq!(parse_duration("30m").unwrap(), TimeDelta::minutes(30));
        assert_eq!(parse_duration("45s").unwrap(), TimeDelta::seconds(45));
        assert_eq!(parse_duration("300ms").unwrap(), TimeDelta::milliseconds(300));
        assert_eq!(parse_duration("7us").unwrap(), TimeDelta::microseconds(7));
        assert_eq!(parse_duration("7µs").unwrap(), TimeDelta::microseconds(7));
        assert_eq!(parse_duration("12ns").unwrap(), TimeDelta::nanoseconds(12));
    }

    #[test]
    fn test_parse_compound_and_fractional() {
        assert_eq!(
            parse_duration("1h30m").unwrap(),
            TimeDelta::minutes(90)
        );
        assert_eq!(
            parse_duration("1.5h").unwrap(),
            TimeDelta::minutes(90)
        );
        assert_eq!(
            parse_duration("2h45m30.5s").unwrap(),
            TimeDelta::hours(2) + TimeDelta::minutes(45) + TimeDelta::milliseconds(30_500)
        );
        assert_eq!(parse_duration(".5s").unwrap(), TimeDelta::milliseconds(500));
    }

    #[test]
    fn test_parse_sign_and_zero() {
        assert_eq!(parse_duration("0").unwrap(), TimeDelta::zero());
        assert_eq!(parse_duration("-0").unwrap(), TimeDelta::zero());
        assert_eq!(parse_duration("-1h").unwrap(), TimeDelta::hours(-1));
        assert_eq!(parse_duration("+10s").unwrap(), TimeDelta::seconds(10));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(matches!(parse_duration(""), Err(DurationError::Invalid(_))));
        assert!(matches!(parse_duration("nope"), Err(DurationError::Invalid(_))));
        assert!(matches!(parse_duration("-"), Err(DurationError::Invalid(_))));
        assert!(matches!(parse_duration("10"), Err(DurationError::MissingUnit(_))));
        assert!(matches!(parse_duration("1h30"), Err(DurationError::MissingUnit(_))));
        assert!(matches!(
            parse_duration("3d"),
            Err(DurationError::UnknownUnit { .. })
        ));
        assert!(matches!(
            parse_duration("99999999999999999999h"),
            Err(DurationError::Overflow(_))
        ));
    }

    #[test]
    fn test_parse_fraction_overflow() {
        // Whole part just under u128::MAX / 1000, fraction pushes it over
        assert!(matches!(
            parse_duration("340282366920938463463374607431768211.999us"),
            Err(DurationError::Overflow(_))
        ));
        assert!(matches!(
            parse_duration("9223372036.9s"),
            Err(DurationError::Overflow(_))
        ));
    }

    #[test]
    fn test_format_canonical_forms() {
        assert_eq!(format_duration(TimeDelta::hours(72)), "72h0m0s");
        assert_eq!(format_duration(TimeDelta::hours(24)), "24h0m0s");
        assert_eq!(format_duration(TimeDelta::minutes(90)), "1h30m0s");
        assert_eq!(format_duration(TimeDelta::seconds(90)), "1m30s");
        assert_eq!(format_duration(TimeDelta::seconds(30)), "30s");
        assert_eq!(format_duration(TimeDelta::milliseconds(1500)), "1.5s");
        assert_eq!(format_duration(TimeDelta::milliseconds(500)), "500ms");
        assert_eq!(format_duration(TimeDelta::microseconds(1500)), "1.5ms");
        assert_eq!(format_duration(TimeDelta::nanoseconds(1500)), "1.5µs");
        assert_eq!(format_duration(TimeDelta::nanoseconds(42)), "42ns");
        assert_eq!(format_duration(TimeDelta::zero()), "0s");
        assert_eq!(format_duration(TimeDelta::hours(-1)), "-1h0m0s");
    }

    #[test]
    fn test_format_parse_agree() {
        for expr in ["72h0m0s", "1h30m0s", "2m3.25s", "750ms"] {
            assert_eq!(format_duration(parse_duration(expr).unwrap()), expr);
        }
    }
}
