//! Time related utils.

use crate::Error;
use chrono::SecondsFormat;
use chrono::Utc;

/// The timestamp type used across the pipeline.
pub type DateTime = chrono::DateTime<Utc>;

/// Take the current time.
pub fn now() -> DateTime {
    Utc::now()
}

/// Format a time into an RFC 3339 string: `2022-03-01T08:12:34Z`.
///
/// SAS start/expiry fields use this format.
pub fn format_rfc3339(t: DateTime) -> String {
    t.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Parse an RFC 3339 string into a time.
pub fn parse_rfc3339(s: &str) -> crate::Result<DateTime> {
    chrono::DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| Error::invalid_argument(format!("invalid rfc3339 timestamp: {s}")).with_source(e))
}

/// Format a time into an http date string: `Tue, 01 Mar 2022 08:12:34 GMT`.
///
/// The `x-ms-date` header uses this format.
pub fn format_http_date(t: DateTime) -> String {
    t.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_time() -> DateTime {
        parse_rfc3339("2022-03-01T08:12:34Z").unwrap()
    }

    #[test]
    fn test_format_rfc3339() {
        assert_eq!(format_rfc3339(test_time()), "2022-03-01T08:12:34Z");
    }

    #[test]
    fn test_format_http_date() {
        assert_eq!(format_http_date(test_time()), "Tue, 01 Mar 2022 08:12:34 GMT");
    }

    #[test]
    fn test_parse_rfc3339_rejects_garbage() {
        assert!(parse_rfc3339("yesterday").is_err());
    }
}
