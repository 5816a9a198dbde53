//! Millisecond-epoch time helpers.

/// Current time as milliseconds since the Unix epoch.
#[must_use]
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Seconds → milliseconds, saturating.
#[must_use]
pub fn secs_to_ms(secs: i64) -> i64 {
    secs.saturating_mul(1_000)
}
