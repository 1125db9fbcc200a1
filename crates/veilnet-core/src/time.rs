//! Protocol timestamps.
//!
//! The wire format carries 64-bit nanoseconds since the Unix epoch.
//! Handshake messages are rejected when the sender's clock deviates from
//! ours by more than 30 seconds; a timestamp exactly 30 s old is still
//! accepted.

use std::time::{SystemTime, UNIX_EPOCH};

/// Maximum tolerated clock skew in nanoseconds (30 s, inclusive)
pub const MAX_CLOCK_SKEW_NS: u64 = 30_000_000_000;

/// Current time as nanoseconds since the Unix epoch
#[must_use]
pub fn unix_now_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

/// Whether `timestamp_ns` is within the skew window around `now_ns`
#[must_use]
pub fn within_skew(timestamp_ns: u64, now_ns: u64) -> bool {
    now_ns.abs_diff(timestamp_ns) <= MAX_CLOCK_SKEW_NS
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_boundary_accepted() {
        let now = 1_700_000_000_000_000_000u64;
        assert!(within_skew(now - MAX_CLOCK_SKEW_NS, now));
        assert!(within_skew(now + MAX_CLOCK_SKEW_NS, now));
    }

    #[test]
    fn test_past_boundary_rejected() {
        let now = 1_700_000_000_000_000_000u64;
        assert!(!within_skew(now - MAX_CLOCK_SKEW_NS - 1_000_000, now));
        assert!(!within_skew(now + MAX_CLOCK_SKEW_NS + 1_000_000, now));
    }

    #[test]
    fn test_now_is_nonzero() {
        assert!(unix_now_ns() > 0);
    }
}
