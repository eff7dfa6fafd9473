// ABOUTME: Utilities for working with times and timestamps.
// ABOUTME: Converts between chrono instants and the epoch-millis form stored in SQLite.
use chrono::{DateTime, Utc};

/// Get the current UTC time
pub fn utc_now() -> DateTime<Utc> {
    Utc::now()
}

/// Convert an instant to the integer epoch-milliseconds form used in storage
pub fn to_millis(time: DateTime<Utc>) -> i64 {
    time.timestamp_millis()
}

/// Rebuild an instant from stored epoch milliseconds
///
/// Values outside chrono's representable range collapse to the epoch rather
/// than panicking; stored timestamps are always produced by [`to_millis`].
pub fn from_millis(millis: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_millis(millis).unwrap_or_else(|| {
        DateTime::<Utc>::from_timestamp_millis(0).expect("epoch is representable")
    })
}

/// Milliseconds elapsed between two instants, clamped at zero
pub fn duration_ms(start: DateTime<Utc>, end: DateTime<Utc>) -> i64 {
    (end - start).num_milliseconds().max(0)
}
