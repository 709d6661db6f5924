//! Single-frame syslog decoding.
//!
//! Two header grammars are accepted: legacy BSD
//! (`<PRI>Mon DD HH:MM:SS host prog: TAG [sd]`) and RFC 5424
//! (`<PRI>1 ISO8601 host app proc msgid [sd]`). The structured-data block is
//! a vendor id followed by `key="value"` pairs. A frame whose header decodes
//! but whose structured block is damaged still yields a result, marked
//! unstructured.

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, Utc};
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum FrameError {
    #[error("frame does not begin with a priority field")]
    MissingPriority,
    #[error("invalid priority field")]
    InvalidPriority,
    #[error("invalid timestamp: `{0}`")]
    InvalidTimestamp(String),
    #[error("truncated header")]
    TruncatedHeader,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedFrame {
    pub facility: u8,
    pub severity: u8,
    pub timestamp_us: u64,
    pub hostname: String,
    pub program: String,
    pub tag: String,
    /// Vendor id of the structured-data block, e.g. `junos@2636.1.1.1.2.26`.
    pub hardware: String,
    pub fields: Vec<(String, String)>,
    pub is_structured: bool,
}

pub fn parse_frame(frame: &str, now: DateTime<Utc>) -> Result<ParsedFrame, FrameError> {
    let rest = frame.strip_prefix('<').ok_or(FrameError::MissingPriority)?;
    let (pri_str, rest) = rest.split_once('>').ok_or(FrameError::MissingPriority)?;
    let pri: u16 = pri_str.parse().map_err(|_| FrameError::InvalidPriority)?;
    if pri > 191 {
        return Err(FrameError::InvalidPriority);
    }

    let mut parsed = ParsedFrame {
        facility: (pri >> 3) as u8,
        severity: (pri & 0x7) as u8,
        ..Default::default()
    };

    let body = if let Some(v1) = rest.strip_prefix("1 ") {
        parse_rfc5424_header(v1, &mut parsed)?
    } else {
        parse_bsd_header(rest, now, &mut parsed)?
    };

    parse_structured_data(body, &mut parsed);
    Ok(parsed)
}

fn next_token<'a>(input: &'a str) -> Option<(&'a str, &'a str)> {
    let input = input.trim_start_matches(' ');
    if input.is_empty() {
        return None;
    }
    match input.find(' ') {
        Some(pos) => Some((&input[..pos], &input[pos + 1..])),
        None => Some((input, "")),
    }
}

fn parse_rfc5424_header<'a>(
    input: &'a str,
    parsed: &mut ParsedFrame,
) -> Result<&'a str, FrameError> {
    let (ts, rest) = next_token(input).ok_or(FrameError::TruncatedHeader)?;
    parsed.timestamp_us = parse_iso_timestamp(ts)?;
    let (hostname, rest) = next_token(rest).ok_or(FrameError::TruncatedHeader)?;
    parsed.hostname = hostname.to_string();
    let (program, rest) = next_token(rest).ok_or(FrameError::TruncatedHeader)?;
    parsed.program = program.to_string();
    let (_procid, rest) = next_token(rest).ok_or(FrameError::TruncatedHeader)?;
    let (msgid, rest) = next_token(rest).unwrap_or(("-", ""));
    if msgid != "-" {
        parsed.tag = msgid.to_string();
    }
    Ok(rest)
}

fn parse_bsd_header<'a>(
    input: &'a str,
    now: DateTime<Utc>,
    parsed: &mut ParsedFrame,
) -> Result<&'a str, FrameError> {
    let (month, rest) = next_token(input).ok_or(FrameError::TruncatedHeader)?;
    let (day, rest) = next_token(rest).ok_or(FrameError::TruncatedHeader)?;
    let (time, rest) = next_token(rest).ok_or(FrameError::TruncatedHeader)?;
    parsed.timestamp_us = parse_bsd_timestamp(month, day, time, now)?;
    let (hostname, rest) = next_token(rest).ok_or(FrameError::TruncatedHeader)?;
    parsed.hostname = hostname.to_string();
    let (program, rest) = next_token(rest).ok_or(FrameError::TruncatedHeader)?;
    parsed.program = program.trim_end_matches(':').to_string();
    let rest = match next_token(rest) {
        Some((tag, rest)) if !tag.starts_with('[') => {
            parsed.tag = tag.to_string();
            rest
        }
        Some((_, _)) | None => rest,
    };
    Ok(rest)
}

fn parse_bsd_timestamp(
    month: &str,
    day: &str,
    time: &str,
    now: DateTime<Utc>,
) -> Result<u64, FrameError> {
    let expr = format!("{} {month} {day} {time}", now.year());
    let bad = || FrameError::InvalidTimestamp(format!("{month} {day} {time}"));
    let naive = NaiveDateTime::parse_from_str(&expr, "%Y %b %e %H:%M:%S").map_err(|_| bad())?;
    // the wire carries no year; a timestamp in the future means the message
    // was stamped late last year
    let naive = if naive.and_utc() > now + Duration::days(1) {
        NaiveDate::from_ymd_opt(now.year() - 1, naive.month(), naive.day())
            .ok_or_else(bad)?
            .and_time(naive.time())
    } else {
        naive
    };
    Ok(naive.and_utc().timestamp_micros() as u64)
}

fn parse_iso_timestamp(ts: &str) -> Result<u64, FrameError> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(ts) {
        return Ok(dt.timestamp_micros() as u64);
    }
    // devices commonly emit single-digit offset hours (`+5:00`)
    if let Some(fixed) = pad_offset_hour(ts) {
        if let Ok(dt) = DateTime::parse_from_rfc3339(&fixed) {
            return Ok(dt.timestamp_micros() as u64);
        }
    }
    // no timezone designator at all: interpret as UTC
    if let Ok(naive) = NaiveDateTime::parse_from_str(ts, "%Y-%m-%dT%H:%M:%S%.f") {
        return Ok(naive.and_utc().timestamp_micros() as u64);
    }
    Err(FrameError::InvalidTimestamp(ts.to_string()))
}

fn pad_offset_hour(ts: &str) -> Option<String> {
    let t_pos = ts.find('T')?;
    let sign_pos = ts[t_pos..]
        .rfind(['+', '-'])
        .map(|p| p + t_pos)
        .filter(|&p| p > t_pos)?;
    let offset = &ts[sign_pos + 1..];
    let (hours, minutes) = offset.split_once(':')?;
    if hours.len() == 1 {
        Some(format!("{}0{hours}:{minutes}", &ts[..sign_pos + 1]))
    } else {
        None
    }
}

fn parse_structured_data(body: &str, parsed: &mut ParsedFrame) {
    let Some(open) = body.find('[') else {
        return;
    };
    let inner = &body[open + 1..];
    let Some(close) = find_unquoted(inner, ']') else {
        // damaged block: keep the header result, drop the fields
        return;
    };
    let inner = &inner[..close];
    let Some((sd_id, mut rest)) = next_token(inner) else {
        return;
    };
    parsed.hardware = sd_id.to_string();
    parsed.is_structured = true;
    while let Some(eq) = rest.find('=') {
        let key = rest[..eq].trim().to_string();
        let after = &rest[eq + 1..];
        let Some(after) = after.strip_prefix('"') else {
            break;
        };
        let Some(end) = after.find('"') else {
            break;
        };
        parsed.fields.push((key, after[..end].to_string()));
        rest = &after[end + 1..];
    }
}

fn find_unquoted(input: &str, needle: char) -> Option<usize> {
    let mut in_quotes = false;
    for (idx, c) in input.char_indices() {
        match c {
            '"' => in_quotes = !in_quotes,
            c if c == needle && !in_quotes => return Some(idx),
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2016, 12, 20, 0, 0, 0).unwrap()
    }

    const BSD_FRAME: &str = "<14>Dec 17 14:46:29 syslog-hostname RT_FLOW: \
         APPTRACK_SESSION_CLOSE [junos@2636.1.1.1.2.26 reason=\"TCP RST\" \
         source-address=\"4.0.0.1\" source-port=\"13175\"]";

    #[test]
    fn bsd_frame_decodes() {
        let frame = parse_frame(BSD_FRAME, now()).unwrap();
        assert_eq!(frame.facility, 1);
        assert_eq!(frame.severity, 6);
        assert_eq!(frame.hostname, "syslog-hostname");
        assert_eq!(frame.program, "RT_FLOW");
        assert_eq!(frame.tag, "APPTRACK_SESSION_CLOSE");
        assert_eq!(frame.hardware, "junos@2636.1.1.1.2.26");
        assert!(frame.is_structured);
        assert_eq!(
            frame.fields,
            vec![
                ("reason".to_string(), "TCP RST".to_string()),
                ("source-address".to_string(), "4.0.0.1".to_string()),
                ("source-port".to_string(), "13175".to_string()),
            ]
        );
        let expected = Utc
            .with_ymd_and_hms(2016, 12, 17, 14, 46, 29)
            .unwrap()
            .timestamp_micros() as u64;
        assert_eq!(frame.timestamp_us, expected);
    }

    #[test]
    fn rfc5424_frame_decodes() {
        let frame = parse_frame(
            "<14>1 2016-12-17T14:46:29.585Z syslog-hostname RT_FLOW - \
             APPTRACK_SESSION_CLOSE [junos@2636.1.1.1.2.26 reason=\"TCP RST\"]",
            now(),
        )
        .unwrap();
        assert_eq!(frame.hostname, "syslog-hostname");
        assert_eq!(frame.program, "RT_FLOW");
        assert_eq!(frame.tag, "APPTRACK_SESSION_CLOSE");
        assert!(frame.is_structured);
        assert_eq!(frame.fields[0].1, "TCP RST");
    }

    #[test]
    fn single_digit_timezone_offset_is_accepted() {
        let frame = parse_frame(
            "<14>1 2016-12-17T19:46:29.585+5:00 syslog-hostname RT_FLOW - \
             APPTRACK_SESSION_CLOSE [junos@2636.1.1.1.2.26 reason=\"TCP RST\"]",
            now(),
        )
        .unwrap();
        let expected = Utc
            .with_ymd_and_hms(2016, 12, 17, 14, 46, 29)
            .unwrap()
            .timestamp_micros() as u64
            + 585_000;
        assert_eq!(frame.timestamp_us, expected);
    }

    #[test]
    fn damaged_structured_block_keeps_header() {
        let truncated = &BSD_FRAME[..BSD_FRAME.len() - 1];
        let frame = parse_frame(truncated, now()).unwrap();
        assert_eq!(frame.hostname, "syslog-hostname");
        assert!(!frame.is_structured);
        assert!(frame.fields.is_empty());
    }

    #[test]
    fn values_keep_spaces_inside_quotes() {
        let frame = parse_frame(
            "<30>Dec  7 01:02:03 host prog: TAG [v@1 msg=\"a b ] c\" n=\"1\"]",
            now(),
        )
        .unwrap();
        assert_eq!(frame.fields[0].1, "a b ] c");
        assert_eq!(frame.fields[1].1, "1");
    }

    #[test]
    fn priority_is_validated() {
        assert_eq!(
            parse_frame("no angle bracket", now()),
            Err(FrameError::MissingPriority)
        );
        assert_eq!(
            parse_frame("<999>1 t h a p m", now()),
            Err(FrameError::InvalidPriority)
        );
        assert_eq!(
            parse_frame("<abc>whatever", now()),
            Err(FrameError::InvalidPriority)
        );
    }

    #[test]
    fn year_inference_rolls_back_for_future_dates() {
        let now = Utc.with_ymd_and_hms(2017, 1, 2, 0, 0, 0).unwrap();
        let frame = parse_frame(
            "<14>Dec 30 10:00:00 host prog: TAG plain message",
            now,
        )
        .unwrap();
        let expected = Utc
            .with_ymd_and_hms(2016, 12, 30, 10, 0, 0)
            .unwrap()
            .timestamp_micros() as u64;
        assert_eq!(frame.timestamp_us, expected);
    }
}
