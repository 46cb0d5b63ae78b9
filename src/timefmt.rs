//! Timestamp parsing and formatting.
//!
//! The CRM emits ISO-8601 strings in several flavours (`Z` suffix, `+HH:MM`,
//! occasionally `+HHMM`, date-only values). Everything is normalised into a
//! `DateTime<FixedOffset>` so that the mapper, the tracker store and the
//! criteria builder agree on one representation. Values without offset
//! information are treated as UTC.

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, SecondsFormat, Utc};

/// Parse a CRM timestamp. Returns `None` for anything unparsable.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<FixedOffset>> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    let normalized = normalize_offset(trimmed);

    if let Ok(dt) = DateTime::parse_from_rfc3339(&normalized) {
        return Some(dt);
    }
    if let Ok(dt) = DateTime::parse_from_str(&normalized, "%Y-%m-%dT%H:%M:%S%.f%:z") {
        return Some(dt);
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(&normalized, fmt) {
            return Some(naive.and_utc().fixed_offset());
        }
    }
    NaiveDate::parse_from_str(&normalized, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc().fixed_offset())
}

/// Rewrite a trailing `Z` as `+00:00` and a trailing `+HHMM` / `-HHMM`
/// offset as `+HH:MM` / `-HH:MM`. Other strings are returned unchanged.
pub fn normalize_offset(raw: &str) -> String {
    if let Some(stripped) = raw.strip_suffix('Z').or_else(|| raw.strip_suffix('z')) {
        return format!("{}+00:00", stripped);
    }
    if raw.len() > 5 && raw.is_char_boundary(raw.len() - 5) {
        let tail = &raw[raw.len() - 5..];
        let sign = tail.as_bytes()[0];
        let digits = &tail[1..];
        // Only touch offsets that follow a time component.
        let has_time = raw[..raw.len() - 5].contains(':');
        if (sign == b'+' || sign == b'-') && has_time && digits.bytes().all(|b| b.is_ascii_digit())
        {
            return format!(
                "{}{}{}:{}",
                &raw[..raw.len() - 5],
                sign as char,
                &digits[..2],
                &digits[2..]
            );
        }
    }
    raw.to_string()
}

/// Format a timestamp the way it is stored and sent to the CRM:
/// second precision with a colon-separated offset.
pub fn format_timestamp(ts: &DateTime<FixedOffset>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, false)
}

pub fn now_string() -> String {
    format_timestamp(&Utc::now().fixed_offset())
}
