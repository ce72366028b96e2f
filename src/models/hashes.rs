// src/models/hashes.rs

use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};

/// Normalize a digest value: trimmed, lower-case, hex only
pub fn normalize_digest(value: &str) -> Option<String> {
    let trimmed = value.trim();

    if trimmed.is_empty() {
        return None;
    }

    if !trimmed.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }

    Some(trimmed.to_lowercase())
}

/// Parse an upstream timestamp into UTC. Accepts RFC 3339 and bare dates.
pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    let trimmed = value.trim();

    if let Ok(ts) = DateTime::parse_from_rfc3339(trimmed) {
        return Some(ts.with_timezone(&Utc));
    }

    NaiveDate::parse_from_str(trimmed, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc())
}

/// Render a timestamp the way STIX expects it
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Truncate text to at most `max_chars` characters, preferring a word boundary
/// in the second half of the window.
pub fn truncate_text(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }

    let cut = text
        .char_indices()
        .nth(max_chars)
        .map(|(idx, _)| idx)
        .unwrap_or(text.len());
    let window = &text[..cut];

    let min_keep = window.len() / 2;
    match window.rfind(char::is_whitespace) {
        Some(ws) if ws >= min_keep => window[..ws].trim_end().to_string(),
        _ => window.to_string(),
    }
}
