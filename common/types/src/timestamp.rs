use chrono::{DateTime, Datelike, Duration, Utc};
use regex::Regex;
use std::borrow::Cow;

/// Anomalies encountered while resolving an event timestamp. The event is
/// never dropped for these, but the pipeline reports them as ingestion
/// warnings so operators can see misbehaving SDKs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimestampWarning {
    /// The timestamp was further in the future than tolerated, and was
    /// clamped to the ingestion instant.
    FutureEvent { parsed: DateTime<Utc> },
    /// The timestamp could not be parsed at all and was ignored.
    Invalid { raw: String },
}

/// Resolve the event timestamp, in order of precedence:
/// 1. the explicit `timestamp` field, adjusted for client clock skew when
///    `sent_at` is available (and not ignored);
/// 2. `sent_at` (or the ingestion instant) minus the `offset` milliseconds;
/// 3. the ingestion instant.
///
/// Timestamps more than `future_tolerance_ms` in the future are clamped to
/// `now`. Unparseable timestamps fall back to the next precedence level.
/// Either case is reported through the returned [`TimestampWarning`].
pub fn parse_event_timestamp(
    timestamp: Option<&str>,
    offset: Option<i64>,
    sent_at: Option<DateTime<Utc>>,
    ignore_sent_at: bool,
    future_tolerance_ms: i64,
    now: DateTime<Utc>,
) -> (DateTime<Utc>, Option<TimestampWarning>) {
    let effective_sent_at = if ignore_sent_at { None } else { sent_at };

    let mut warning = None;
    let mut parsed_ts = None;

    if let Some(timestamp_str) = timestamp {
        match parse_date(timestamp_str) {
            Some(parsed) => {
                parsed_ts = match effective_sent_at {
                    // Handle clock skew between client and server:
                    // x = now + (timestamp - sent_at)
                    Some(sent_at) => Some(now + parsed.signed_duration_since(sent_at)),
                    None => Some(parsed),
                };
            }
            None => {
                warning = Some(TimestampWarning::Invalid {
                    raw: timestamp_str.to_string(),
                });
            }
        }
    }

    let mut parsed_ts = match (parsed_ts, offset) {
        (Some(ts), _) => ts,
        (None, Some(offset_ms)) => {
            effective_sent_at.unwrap_or(now) - Duration::milliseconds(offset_ms)
        }
        (None, None) => now,
    };

    // Future-dated events get clamped to the ingestion instant
    let now_diff = parsed_ts.signed_duration_since(now).num_milliseconds();
    if now_diff > future_tolerance_ms {
        warning = Some(TimestampWarning::FutureEvent { parsed: parsed_ts });
        parsed_ts = now;
    }

    // Out of bounds for ClickHouse - fall back to epoch
    if parsed_ts.year() < 0 || parsed_ts.year() > 9999 {
        parsed_ts = DateTime::UNIX_EPOCH;
    }

    (parsed_ts, warning)
}

/// Parse a date string using a streamlined approach, in order of preference:
/// 1. chrono RFC3339 parser (standard ISO 8601 with proper timezone conversion)
/// 2. dateparser (handles 95%+ of formats): slash-separated, RFC2822, numeric timestamps
/// 3. jiff (minimal fallback): civil datetime with T but no timezone (e.g., "2023-01-01T12:00:00")
pub fn parse_date(supposed_iso_string: &str) -> Option<DateTime<Utc>> {
    // First normalize any non-standard timezone formats (e.g., +03 -> +03:00)
    let normalized_input = normalize_timezone_format(supposed_iso_string);

    if let Ok(dt) = DateTime::parse_from_rfc3339(&normalized_input) {
        return Some(dt.with_timezone(&Utc));
    }

    if let Ok(dt) = dateparser::parse(&normalized_input) {
        return Some(dt);
    }

    // The one format dateparser can't handle: civil datetime with T but no timezone
    if let Ok(jiff_civil) = normalized_input.parse::<jiff::civil::DateTime>() {
        return convert_jiff_to_chrono(jiff_civil.to_zoned(jiff::tz::TimeZone::UTC).ok()?);
    }

    None
}

/// Normalize non-standard timezone suffixes to RFC3339, e.g.
/// "2025-09-17T14:05:04.805+03" -> "2025-09-17T14:05:04.805+03:00".
/// Borrows the input when no normalization is needed.
fn normalize_timezone_format(input: &str) -> Cow<'_, str> {
    if input.len() < 3 {
        return Cow::Borrowed(input);
    }

    let last_3_chars = &input[input.len() - 3..];
    if !(last_3_chars.starts_with('+') || last_3_chars.starts_with('-'))
        || !last_3_chars[1..].chars().all(|c| c.is_ascii_digit())
    {
        return Cow::Borrowed(input);
    }

    // Pattern: YYYY-MM-DDTHH:MM:SS[.fff][+/-]HH
    static TIMEZONE_REGEX: std::sync::LazyLock<Regex> = std::sync::LazyLock::new(|| {
        Regex::new(r"^\d{4}-\d{2}-\d{2}T\d{2}:\d{2}:\d{2}(?:\.\d{1,9})?[+-]\d{2}$").unwrap()
    });

    if TIMEZONE_REGEX.is_match(input) {
        Cow::Owned(format!("{input}:00"))
    } else {
        Cow::Borrowed(input)
    }
}

fn convert_jiff_to_chrono(jiff_timestamp: jiff::Zoned) -> Option<DateTime<Utc>> {
    let seconds = jiff_timestamp.timestamp().as_second();
    let nanos = jiff_timestamp.timestamp().subsec_nanosecond();
    let nanos_u32 = nanos.try_into().ok()?;
    DateTime::from_timestamp(seconds, nanos_u32)
}
