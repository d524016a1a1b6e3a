//! Wall-clock instants and durations in the envelope wire format.
//!
//! Instants render as ISO-8601 UTC with six subsecond digits and an explicit
//! `+00:00` offset. Durations render as `DD.HH:MM:SS.mmmmmm` with at least
//! two day digits and exactly six microsecond digits, zero-padded. The
//! parser is the exact inverse of the formatter to microsecond precision;
//! the live metrics collector uses it to recover milliseconds from envelope
//! durations.

use crate::telemetry::TelemetryError;
use time::format_description::FormatItem;
use time::macros::format_description;
use time::OffsetDateTime;

const NANOS_PER_MICRO: u64 = 1_000;
const NANOS_PER_SECOND: u64 = 1_000_000_000;
const NANOS_PER_MINUTE: u64 = 60 * NANOS_PER_SECOND;
const NANOS_PER_HOUR: u64 = 60 * NANOS_PER_MINUTE;
const NANOS_PER_DAY: u64 = 24 * NANOS_PER_HOUR;

const INSTANT_FORMAT: &[FormatItem<'static>] = format_description!(
    "[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:6]+00:00"
);

/// Renders an epoch-nanosecond instant as ISO-8601 UTC.
///
/// Out-of-range instants fall back to the epoch rather than failing the
/// envelope; the ingestion service rejects envelopes without a time.
///
/// # Arguments
///
/// * `epoch_nanos` - Nanoseconds since the Unix epoch
///
/// # Returns
///
/// The instant as `YYYY-MM-DDTHH:MM:SS.mmmmmm+00:00`.
///
/// # Example
///
/// ```rust
/// use appinsights_agent_native::telemetry::time_format::format_instant;
///
/// assert_eq!(format_instant(0), "1970-01-01T00:00:00.000000+00:00");
/// ```
#[must_use]
pub fn format_instant(epoch_nanos: i128) -> String {
    let datetime = OffsetDateTime::from_unix_timestamp_nanos(epoch_nanos)
        .unwrap_or(OffsetDateTime::UNIX_EPOCH);
    datetime
        .format(INSTANT_FORMAT)
        .unwrap_or_else(|_| String::from("1970-01-01T00:00:00.000000+00:00"))
}

/// Renders a nanosecond duration as `DD.HH:MM:SS.mmmmmm`.
///
/// Days have at least two digits and grow as needed; microseconds are
/// always six digits, zero-padded.
///
/// # Arguments
///
/// * `duration_nanos` - Duration in nanoseconds; sub-microsecond
///   precision is truncated
///
/// # Returns
///
/// * `Ok(rendered)` - The wire-format duration string
/// * `Err(InvalidInput)` - The duration is negative
///
/// # Example
///
/// ```rust
/// use appinsights_agent_native::telemetry::time_format::format_duration;
///
/// assert_eq!(format_duration(150_000_000).unwrap(), "00.00:00:00.150000");
/// ```
pub fn format_duration(duration_nanos: i64) -> Result<String, TelemetryError> {
    if duration_nanos < 0 {
        return Err(TelemetryError::InvalidInput(format!(
            "negative duration: {duration_nanos}ns"
        )));
    }
    let mut remaining = duration_nanos as u64;

    let days = remaining / NANOS_PER_DAY;
    remaining %= NANOS_PER_DAY;
    let hours = remaining / NANOS_PER_HOUR;
    remaining %= NANOS_PER_HOUR;
    let minutes = remaining / NANOS_PER_MINUTE;
    remaining %= NANOS_PER_MINUTE;
    let seconds = remaining / NANOS_PER_SECOND;
    remaining %= NANOS_PER_SECOND;
    let micros = remaining / NANOS_PER_MICRO;

    Ok(format!(
        "{days:02}.{hours:02}:{minutes:02}:{seconds:02}.{micros:06}"
    ))
}

/// Parses a `DD.HH:MM:SS.mmmmmm` duration back to nanoseconds.
///
/// Exact inverse of [`format_duration`] to microsecond precision.
///
/// # Arguments
///
/// * `duration` - A wire-format duration string
///
/// # Returns
///
/// * `Ok(nanos)` - The duration in nanoseconds
/// * `Err(InvalidInput)` - The string does not have the five expected
///   numeric fields
pub fn parse_duration(duration: &str) -> Result<u64, TelemetryError> {
    let parts: Vec<&str> = duration.split(['.', ':']).collect();
    if parts.len() != 5 {
        return Err(TelemetryError::InvalidInput(format!(
            "malformed duration: {duration:?}"
        )));
    }
    let field = |i: usize| -> Result<u64, TelemetryError> {
        parts[i]
            .parse::<u64>()
            .map_err(|_| TelemetryError::InvalidInput(format!("malformed duration: {duration:?}")))
    };
    let days = field(0)?;
    let hours = field(1)?;
    let minutes = field(2)?;
    let seconds = field(3)?;
    let micros = field(4)?;

    Ok(days * NANOS_PER_DAY
        + hours * NANOS_PER_HOUR
        + minutes * NANOS_PER_MINUTE
        + seconds * NANOS_PER_SECOND
        + micros * NANOS_PER_MICRO)
}

/// Parses an envelope duration and truncates to whole milliseconds.
///
/// The live metrics collector uses this to recover the millisecond
/// duration it packs into its counter words.
///
/// # Arguments
///
/// * `duration` - A wire-format duration string
pub fn duration_to_millis(duration: &str) -> Result<u64, TelemetryError> {
    Ok(parse_duration(duration)? / 1_000_000)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn formats_millisecond_duration() {
        assert_eq!(format_duration(150_000_000).unwrap(), "00.00:00:00.150000");
    }

    #[test]
    fn formats_zero_duration() {
        assert_eq!(format_duration(0).unwrap(), "00.00:00:00.000000");
    }

    #[test]
    fn formats_multi_day_duration() {
        let nanos = (3 * NANOS_PER_DAY
            + 4 * NANOS_PER_HOUR
            + 5 * NANOS_PER_MINUTE
            + 6 * NANOS_PER_SECOND
            + 7_000) as i64;
        assert_eq!(format_duration(nanos).unwrap(), "03.04:05:06.000007");
    }

    #[test]
    fn day_field_grows_past_two_digits() {
        let nanos = (123 * NANOS_PER_DAY) as i64;
        assert_eq!(format_duration(nanos).unwrap(), "123.00:00:00.000000");
    }

    #[test]
    fn negative_duration_is_rejected() {
        assert!(matches!(
            format_duration(-1),
            Err(TelemetryError::InvalidInput(_))
        ));
    }

    #[test]
    fn round_trips_to_microsecond_precision() {
        for nanos in [
            0_i64,
            999,                 // below one microsecond, truncated
            1_000,
            150_000_000,
            86_400_000_000_000,  // one day
            90_061_000_007_000,  // 1d 1h 1m 1s 7us
        ] {
            let formatted = format_duration(nanos).unwrap();
            let micros_truncated = (nanos as u64 / 1_000) * 1_000;
            assert_eq!(parse_duration(&formatted).unwrap(), micros_truncated);
        }
    }

    #[test]
    fn duration_to_millis_truncates() {
        assert_eq!(duration_to_millis("00.00:00:00.150000").unwrap(), 150);
        assert_eq!(duration_to_millis("00.00:00:01.999999").unwrap(), 1999);
        assert_eq!(duration_to_millis("01.00:00:00.000000").unwrap(), 86_400_000);
    }

    #[test]
    fn malformed_duration_is_rejected() {
        assert!(duration_to_millis("nonsense").is_err());
        assert!(duration_to_millis("00.00:00:00").is_err());
        assert!(duration_to_millis("aa.bb:cc:dd.eeeeee").is_err());
    }

    #[test]
    fn formats_epoch_instant() {
        assert_eq!(format_instant(0), "1970-01-01T00:00:00.000000+00:00");
    }

    #[test]
    fn formats_instant_with_microseconds() {
        // 2021-03-01T12:30:45.123456Z
        let nanos: i128 = 1_614_601_845_123_456_000;
        assert_eq!(format_instant(nanos), "2021-03-01T12:30:45.123456+00:00");
    }
}
