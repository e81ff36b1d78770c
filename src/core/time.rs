//! Internal time representation.
//!
//! The wire format carries double-precision seconds since the Unix
//! epoch; internally every timestamp is an integer nanosecond count so
//! arithmetic stays exact across millions of ticks.

use std::time::{SystemTime, UNIX_EPOCH};

/// Nanoseconds since the Unix epoch.
pub type Nanos = u64;

pub const NANOS_PER_SEC: u64 = 1_000_000_000;
pub const NANOS_PER_MILLI: u64 = 1_000_000;

/// Current wall time in nanoseconds.
pub fn now_nanos() -> Nanos {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

/// Wire seconds to internal nanoseconds. Negative or non-finite inputs
/// clamp to zero.
pub fn secs_to_nanos(secs: f64) -> Nanos {
    if !secs.is_finite() || secs <= 0.0 {
        return 0;
    }
    (secs * NANOS_PER_SEC as f64) as u64
}

/// Internal nanoseconds to wire seconds.
pub fn nanos_to_secs(nanos: Nanos) -> f64 {
    nanos as f64 / NANOS_PER_SEC as f64
}
