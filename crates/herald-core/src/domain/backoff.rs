//! Backoff policy: decides how long a failed publish waits before retry.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Capped exponential backoff for broker publish failures.
///
/// delay = min(2^attempt_count, cap) seconds
///
/// `attempt_count` is the value stored on the row when the failure is
/// recorded, so the reference cap of 64s gives:
/// - attempt 0: 1s
/// - attempt 1: 2s
/// - ...
/// - attempt 6: 64s
/// - attempt 7 and later: 64s
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    pub cap: Duration,
}

impl BackoffPolicy {
    pub const DEFAULT_CAP: Duration = Duration::from_secs(64);

    pub fn new(cap: Duration) -> Self {
        Self { cap }
    }

    pub fn next_delay(&self, attempt_count: u32) -> Duration {
        // 2^63 already exceeds any Duration we care about; clamp the shift.
        let exponent = attempt_count.min(63);
        let secs = 1u64.checked_shl(exponent).unwrap_or(u64::MAX);
        Duration::from_secs(secs).min(self.cap)
    }

    pub fn next_attempt_at(
        &self,
        now: chrono::DateTime<chrono::Utc>,
        attempt_count: u32,
    ) -> chrono::DateTime<chrono::Utc> {
        let delay = chrono::Duration::from_std(self.next_delay(attempt_count))
            .unwrap_or(chrono::Duration::MAX);
        now.checked_add_signed(delay).unwrap_or(now)
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CAP)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use rstest::rstest;

    #[rstest]
    #[case(0, 1)]
    #[case(1, 2)]
    #[case(2, 4)]
    #[case(3, 8)]
    #[case(4, 16)]
    #[case(5, 32)]
    #[case(6, 64)]
    #[case(7, 64)]
    fn default_policy_doubles_until_cap(#[case] attempt_count: u32, #[case] expected_secs: u64) {
        let policy = BackoffPolicy::default();
        assert_eq!(
            policy.next_delay(attempt_count),
            Duration::from_secs(expected_secs)
        );
    }

    #[test]
    fn huge_attempt_counts_stay_at_cap() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.next_delay(64), Duration::from_secs(64));
        assert_eq!(policy.next_delay(u32::MAX), Duration::from_secs(64));
    }

    #[test]
    fn custom_cap_is_respected() {
        let policy = BackoffPolicy::new(Duration::from_secs(10));
        assert_eq!(policy.next_delay(3), Duration::from_secs(8));
        assert_eq!(policy.next_delay(4), Duration::from_secs(10));
    }

    #[test]
    fn next_attempt_at_adds_delay() {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let policy = BackoffPolicy::default();
        let at = policy.next_attempt_at(now, 3);
        assert_eq!((at - now).num_seconds(), 8);
    }
}
