use chrono::Utc;
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum TimeParseError {
    #[error("invalid time expression: `{0}`")]
    InvalidExpression(String),
}

/// Current UTC time in microseconds.
pub fn utc_timestamp_usec() -> u64 {
    Utc::now().timestamp_micros() as u64
}

/// Resolves a query time value against `now` (microseconds).
///
/// Accepts a microsecond timestamp, the literal `"now"`, or a relative
/// expression `"now-<N><unit>"` / `"now+<N><unit>"` with unit one of
/// `s`, `m`, `h`, `d`.
pub fn parse_query_time(value: &serde_json::Value, now: u64) -> Result<u64, TimeParseError> {
    if let Some(n) = value.as_u64() {
        return Ok(n);
    }
    let expr = value
        .as_str()
        .ok_or_else(|| TimeParseError::InvalidExpression(value.to_string()))?
        .trim();
    if let Ok(n) = expr.parse::<u64>() {
        return Ok(n);
    }
    if expr == "now" {
        return Ok(now);
    }
    let rest = expr
        .strip_prefix("now")
        .ok_or_else(|| TimeParseError::InvalidExpression(expr.to_string()))?;
    let (sign, body) = match rest.as_bytes().first() {
        Some(b'-') => (-1i64, &rest[1..]),
        Some(b'+') => (1i64, &rest[1..]),
        _ => return Err(TimeParseError::InvalidExpression(expr.to_string())),
    };
    let unit_pos = body
        .find(|c: char| !c.is_ascii_digit())
        .ok_or_else(|| TimeParseError::InvalidExpression(expr.to_string()))?;
    let quantity: i64 = body[..unit_pos]
        .parse()
        .map_err(|_| TimeParseError::InvalidExpression(expr.to_string()))?;
    let usec_per_unit: i64 = match &body[unit_pos..] {
        "s" => 1_000_000,
        "m" => 60 * 1_000_000,
        "h" => 3_600 * 1_000_000,
        "d" => 86_400 * 1_000_000,
        _ => return Err(TimeParseError::InvalidExpression(expr.to_string())),
    };
    let delta = sign * quantity * usec_per_unit;
    Ok((now as i64 + delta).max(0) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const NOW: u64 = 1_700_000_000_000_000;

    #[test]
    fn absolute_timestamps_pass_through() {
        assert_eq!(parse_query_time(&json!(123456), NOW), Ok(123456));
        assert_eq!(parse_query_time(&json!("123456"), NOW), Ok(123456));
    }

    #[test]
    fn now_resolves() {
        assert_eq!(parse_query_time(&json!("now"), NOW), Ok(NOW));
    }

    #[test]
    fn relative_expressions_resolve() {
        assert_eq!(
            parse_query_time(&json!("now-10m"), NOW),
            Ok(NOW - 600 * 1_000_000)
        );
        assert_eq!(
            parse_query_time(&json!("now-1h"), NOW),
            Ok(NOW - 3_600 * 1_000_000)
        );
        assert_eq!(
            parse_query_time(&json!("now+30s"), NOW),
            Ok(NOW + 30 * 1_000_000)
        );
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(parse_query_time(&json!("yesterday"), NOW).is_err());
        assert!(parse_query_time(&json!("now-"), NOW).is_err());
        assert!(parse_query_time(&json!("now-10w"), NOW).is_err());
        assert!(parse_query_time(&json!(null), NOW).is_err());
    }
}
