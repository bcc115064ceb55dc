//! Human duration strings used throughout the config ("500ms", "30s", "5m", "1h").

use std::time::Duration;

use crate::error::{ConfigError, ConfigResult};

/// Longest duration a config field may hold (365 days).
pub const MAX_DURATION: Duration = Duration::from_secs(365 * 24 * 3600);

/// Parse a duration string like "5s", "500ms", "2m", "1h".
///
/// A bare number is read as seconds.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if let Some(ms) = s.strip_suffix("ms") {
        ms.trim().parse::<u64>().ok().map(Duration::from_millis)
    } else if let Some(secs) = s.strip_suffix('s') {
        secs.trim().parse::<u64>().ok().map(Duration::from_secs)
    } else if let Some(mins) = s.strip_suffix('m') {
        mins.trim()
            .parse::<u64>()
            .ok()
            .and_then(|m| m.checked_mul(60))
            .map(Duration::from_secs)
    } else if let Some(hours) = s.strip_suffix('h') {
        hours
            .trim()
            .parse::<u64>()
            .ok()
            .and_then(|h| h.checked_mul(3600))
            .map(Duration::from_secs)
    } else {
        s.parse::<u64>().ok().map(Duration::from_secs)
    }
}

/// Parse a duration field of a config entry, naming the entry on failure.
///
/// Values above [`MAX_DURATION`] are rejected.
pub fn duration_field(entry: &str, field: &'static str, value: &str) -> ConfigResult<Duration> {
    let duration = parse_duration(value).ok_or_else(|| ConfigError::InvalidDuration {
        entry: entry.to_string(),
        field,
        value: value.to_string(),
    })?;
    if duration > MAX_DURATION {
        return Err(ConfigError::Invalid {
            entry: entry.to_string(),
            reason: format!("`{field}` exceeds {}", format_duration(MAX_DURATION)),
        });
    }
    Ok(duration)
}

/// Render a duration the way the config spells it.
pub fn format_duration(d: Duration) -> String {
    let ms = d.as_millis();
    if ms % 1000 != 0 {
        format!("{ms}ms")
    } else {
        format!("{}s", d.as_secs())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_seconds_and_millis() {
        assert_eq!(parse_duration("30s"), Some(Duration::from_secs(30)));
        assert_eq!(parse_duration("500ms"), Some(Duration::from_millis(500)));
        assert_eq!(parse_duration("0s"), Some(Duration::ZERO));
    }

    #[test]
    fn parse_minutes_and_hours() {
        assert_eq!(parse_duration("5m"), Some(Duration::from_secs(300)));
        assert_eq!(parse_duration("24h"), Some(Duration::from_secs(86_400)));
    }

    #[test]
    fn parse_plain_number_as_seconds() {
        assert_eq!(parse_duration("10"), Some(Duration::from_secs(10)));
        assert_eq!(parse_duration(" 7 "), Some(Duration::from_secs(7)));
    }

    #[test]
    fn parse_rejects_garbage() {
        assert_eq!(parse_duration("soon"), None);
        assert_eq!(parse_duration("-5s"), None);
        assert_eq!(parse_duration(""), None);
    }

    #[test]
    fn parse_rejects_overflowing_units() {
        assert_eq!(parse_duration("400000000000000000m"), None);
        assert_eq!(parse_duration("18446744073709551615h"), None);
        assert_eq!(
            parse_duration("1000000m"),
            Some(Duration::from_secs(60_000_000))
        );
    }

    #[test]
    fn duration_field_caps_length() {
        assert_eq!(duration_field("db", "timeout", "8760h").unwrap(), MAX_DURATION);
        let err = duration_field("db", "timeout", "8761h").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }), "{err}");
        assert!(err.to_string().contains("`timeout` exceeds"), "{err}");
    }

    #[test]
    fn duration_field_names_the_entry() {
        let err = duration_field("db", "timeout", "fast").unwrap_err();
        assert_eq!(err.to_string(), "db: invalid duration for `timeout`: \"fast\"");
    }

    #[test]
    fn format_round_numbers_as_seconds() {
        assert_eq!(format_duration(Duration::from_secs(2)), "2s");
        assert_eq!(format_duration(Duration::from_millis(1500)), "1500ms");
    }
}
