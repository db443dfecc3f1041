//! Time utility functions
//!
//! Sparkplug-B carries 64-bit unsigned timestamps. Some publishers send
//! seconds, some milliseconds; everything downstream works in milliseconds
//! since the Unix epoch, so normalisation happens exactly once, here.

use chrono::Utc;

/// Any value below this is interpreted as seconds since epoch.
/// 10^12 ms is 2001-09-09; 10^12 s is the year 33658.
const MS_THRESHOLD: u64 = 1_000_000_000_000;

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Normalise a Sparkplug 64-bit timestamp to milliseconds since epoch.
///
/// Values below 10^12 are treated as seconds and scaled up. Values that do
/// not fit an `i64` (including anything at or above 2^53, where float-path
/// producers already lost precision) saturate instead of crashing.
pub fn normalize_sparkplug_ts(raw: u64) -> i64 {
    let ms = if raw < MS_THRESHOLD {
        raw.saturating_mul(1000)
    } else {
        raw
    };
    i64::try_from(ms).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn millisecond_timestamps_pass_through() {
        assert_eq!(normalize_sparkplug_ts(1_700_000_000_000), 1_700_000_000_000);
    }

    #[test]
    fn second_timestamps_are_scaled() {
        assert_eq!(normalize_sparkplug_ts(1_700_000_000), 1_700_000_000_000);
    }

    #[test]
    fn zero_stays_zero() {
        assert_eq!(normalize_sparkplug_ts(0), 0);
    }

    #[test]
    fn huge_values_do_not_crash() {
        // >= 2^53: precision loss acceptable, crash is not
        let ts = normalize_sparkplug_ts(u64::MAX);
        assert_eq!(ts, i64::MAX);

        let ts = normalize_sparkplug_ts(1 << 53);
        assert_eq!(ts, 1_i64 << 53);
    }

    #[test]
    fn now_ms_is_reasonable() {
        // sanity: after 2023-01-01 in ms
        assert!(now_ms() > 1_672_531_200_000);
    }
}
