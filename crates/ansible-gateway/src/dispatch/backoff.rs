//! Retry backoff for failed runtime deliveries.
//!
//! `raw = min(300s, 2s * 2^(attempts-1))`, ±20 % uniform jitter, then
//! clamped to [250 ms, 300 s]. The clamp runs *after* jitter, so the final
//! attempt can never overshoot the ceiling.

use std::time::Duration;

/// Base delay for the first retry (milliseconds).
pub const RETRY_BASE_MS: u64 = 2_000;

/// Backoff ceiling (milliseconds).
pub const RETRY_CEILING_MS: u64 = 300_000;

/// Floor after jitter (milliseconds).
pub const RETRY_FLOOR_MS: u64 = 250;

/// Jitter amplitude (±20 %).
const JITTER: f64 = 0.2;

/// Compute the retry delay for a given attempt count with an explicit
/// jitter sample in [-1, 1]. Pure, for exact boundary tests.
#[must_use]
pub fn retry_delay_with(attempts: u32, jitter_sample: f64) -> Duration {
    let exponent = attempts.saturating_sub(1).min(63);
    let raw = RETRY_BASE_MS
        .saturating_mul(1u64.checked_shl(exponent).unwrap_or(u64::MAX))
        .min(RETRY_CEILING_MS);

    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let jittered = ((raw as f64) * (1.0 + jitter_sample.clamp(-1.0, 1.0) * JITTER)) as u64;
    Duration::from_millis(jittered.clamp(RETRY_FLOOR_MS, RETRY_CEILING_MS))
}

/// Compute the retry delay with random jitter.
#[must_use]
pub fn retry_delay(attempts: u32) -> Duration {
    retry_delay_with(attempts, fastrand::f64() * 2.0 - 1.0)
}
