//! Catalog time units.
//!
//! Positions and runtimes exchanged with the catalog are expressed in ticks
//! of 100 nanoseconds. Renderers work in [`Duration`]s and milliseconds.

use std::time::Duration;

/// Ticks in one millisecond. Every other conversion derives from this.
pub const TICKS_PER_MILLISECOND: i64 = 10_000;

pub const TICKS_PER_SECOND: i64 = TICKS_PER_MILLISECOND * 1_000;

pub fn ticks_from_millis(millis: i64) -> i64 {
    millis * TICKS_PER_MILLISECOND
}

/// Truncates towards zero.
pub fn ticks_to_millis(ticks: i64) -> i64 {
    ticks / TICKS_PER_MILLISECOND
}

pub fn ticks_from_seconds(seconds: i64) -> i64 {
    seconds * TICKS_PER_SECOND
}

pub fn ticks_to_seconds_f64(ticks: i64) -> f64 {
    ticks as f64 / TICKS_PER_SECOND as f64
}

pub fn ticks_from_duration(duration: Duration) -> i64 {
    // 100ns resolution; sub-tick remainder is dropped.
    i64::try_from(duration.as_nanos() / 100).unwrap_or(i64::MAX)
}

/// Negative tick counts clamp to zero.
pub fn ticks_to_duration(ticks: i64) -> Duration {
    let ticks = ticks.max(0) as u64;
    Duration::from_nanos(ticks.saturating_mul(100))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constants() {
        assert_eq!(TICKS_PER_SECOND, 10_000_000);
        assert_eq!(ticks_from_millis(1), 10_000);
        assert_eq!(ticks_from_seconds(90), 900_000_000);
    }

    #[test]
    fn test_millis_round_trip() {
        for millis in [0, 1, 999, 1_500, 7_200_000] {
            assert_eq!(ticks_to_millis(ticks_from_millis(millis)), millis);
        }
        assert_eq!(ticks_to_millis(15_999), 1);
    }

    #[test]
    fn test_duration_round_trip() {
        let duration = Duration::from_millis(123_456);
        assert_eq!(ticks_to_duration(ticks_from_duration(duration)), duration);
        assert_eq!(ticks_from_duration(Duration::from_nanos(250)), 2);
        assert_eq!(ticks_to_duration(-5), Duration::ZERO);
    }

    #[test]
    fn test_seconds_f64() {
        assert_eq!(ticks_to_seconds_f64(25_000_000), 2.5);
    }
}
