//! Wall-clock helpers. All protocol timestamps are Unix milliseconds as u64.

use std::time::{SystemTime, UNIX_EPOCH};

/// Current timestamp in Unix milliseconds.
#[must_use]
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Truncate a millisecond timestamp to the start of its hour.
#[must_use]
pub fn hour_bucket(ms: u64) -> u64 {
    const HOUR_MS: u64 = 60 * 60 * 1000;
    ms - (ms % HOUR_MS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hour_bucket() {
        const HOUR_MS: u64 = 60 * 60 * 1000;
        assert_eq!(hour_bucket(0), 0);
        assert_eq!(hour_bucket(HOUR_MS - 1), 0);
        assert_eq!(hour_bucket(HOUR_MS), HOUR_MS);
        assert_eq!(hour_bucket(HOUR_MS + 1234), HOUR_MS);
    }

    #[test]
    fn test_now_is_sane() {
        // after 2020-01-01
        assert!(now_ms() > 1_577_836_800_000);
    }
}
