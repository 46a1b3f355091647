pub mod backoff;
pub mod conflict;
pub mod engine;
pub mod events;
pub mod network;
pub mod queue;
pub mod remote;
pub mod service;
pub mod state;
pub mod store;

use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

pub(crate) fn now_millis() -> i64 {
    (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}

pub(crate) fn format_millis(ms: i64) -> Option<String> {
    let at = OffsetDateTime::from_unix_timestamp_nanos(i128::from(ms) * 1_000_000).ok()?;
    at.format(&Rfc3339).ok()
}

pub(crate) fn parse_rfc3339_millis(value: &str) -> Option<i64> {
    let at = OffsetDateTime::parse(value.trim(), &Rfc3339).ok()?;
    Some((at.unix_timestamp_nanos() / 1_000_000) as i64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rfc3339_round_trips_at_millisecond_precision() {
        let formatted = format_millis(1_700_000_000_123).unwrap();
        assert_eq!(formatted, "2023-11-14T22:13:20.123Z");
        assert_eq!(parse_rfc3339_millis(&formatted), Some(1_700_000_000_123));
    }

    #[test]
    fn rejects_non_rfc3339_values() {
        assert_eq!(parse_rfc3339_millis("yesterday"), None);
    }
}
