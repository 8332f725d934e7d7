//! Time helpers. All persisted timestamps are UTC epoch seconds.

use crate::error::{SrmError, SrmResult};
use chrono::{DateTime, TimeZone, Utc};

/// Current UTC time in epoch seconds.
pub fn now_epoch() -> i64 {
    Utc::now().timestamp()
}

/// Formats epoch seconds as an HTTP date (`Last-Modified`).
pub fn http_date(epoch: i64) -> String {
    match Utc.timestamp_opt(epoch, 0).single() {
        Some(dt) => dt.format("%a, %d %b %Y %H:%M:%S GMT").to_string(),
        None => String::new(),
    }
}

/// Parses an HTTP date (`If-Modified-Since`) into epoch seconds.
pub fn parse_http_date(value: &str) -> SrmResult<i64> {
    DateTime::parse_from_rfc2822(value.trim())
        .map(|dt| dt.timestamp())
        .map_err(|e| SrmError::bad_request(format!("invalid HTTP date '{}': {}", value, e)))
}

/// Parses a timestamp given either as epoch seconds or RFC 3339.
pub fn parse_timestamp(value: &str) -> SrmResult<i64> {
    let value = value.trim();
    if let Ok(epoch) = value.parse::<i64>() {
        return Ok(epoch);
    }
    if let Ok(epoch) = value.parse::<f64>() {
        return Ok(epoch as i64);
    }
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.timestamp())
        .map_err(|e| SrmError::bad_request(format!("invalid timestamp '{}': {}", value, e)))
}

/// Formats epoch seconds as RFC 3339 in UTC.
pub fn rfc3339(epoch: i64) -> String {
    match Utc.timestamp_opt(epoch, 0).single() {
        Some(dt) => dt.to_rfc3339(),
        None => epoch.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_date_round_trip() {
        let text = http_date(1_700_000_000);
        assert_eq!(text, "Tue, 14 Nov 2023 22:13:20 GMT");
        assert_eq!(parse_http_date(&text).unwrap(), 1_700_000_000);
    }

    #[test]
    fn test_parse_timestamp_forms() {
        assert_eq!(parse_timestamp("1700000000").unwrap(), 1_700_000_000);
        assert_eq!(parse_timestamp("1700000000.75").unwrap(), 1_700_000_000);
        assert_eq!(
            parse_timestamp("2023-11-14T22:13:20+00:00").unwrap(),
            1_700_000_000
        );
        assert!(parse_timestamp("yesterday").is_err());
    }

    #[test]
    fn test_rfc3339() {
        assert_eq!(rfc3339(0), "1970-01-01T00:00:00+00:00");
    }
}
