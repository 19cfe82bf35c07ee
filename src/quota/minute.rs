use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};

use crate::clock::minute_stamp;
use crate::providers::ProviderDescriptor;

/// Buckets older than this many minutes are purged on every write.
const RETAIN_MINUTES: i64 = 2;

#[derive(Debug, Default, Clone, Copy)]
struct MinuteBucket {
    requests: u64,
    tokens: u64,
}

/// Result of a minute-window check against a provider's rpm/tpm.
#[derive(Debug, Clone, Copy)]
pub struct MinuteCheck {
    pub allowed: bool,
    pub current_requests: u64,
    pub current_tokens: u64,
}

/// Volatile per-(provider, minute) usage counters.
///
/// Lost on restart, which is fine: minute-level limits self-heal within
/// 60 seconds. The map stays bounded because every write purges buckets
/// older than two minutes.
#[derive(Default)]
pub struct MinuteWindowTracker {
    buckets: Mutex<HashMap<(&'static str, i64), MinuteBucket>>,
}

impl MinuteWindowTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one request and its tokens in the current minute bucket.
    /// Called only after an attempt actually proceeds, never speculatively.
    pub fn record_usage(&self, provider: &'static str, tokens: u64) {
        self.record_usage_at(provider, tokens, Utc::now());
    }

    pub fn record_usage_at(&self, provider: &'static str, tokens: u64, now: DateTime<Utc>) {
        let stamp = minute_stamp(now);
        let mut buckets = self.buckets.lock().unwrap();

        let bucket = buckets.entry((provider, stamp)).or_default();
        bucket.requests += 1;
        bucket.tokens += tokens;

        buckets.retain(|(_, s), _| stamp - *s < RETAIN_MINUTES);
    }

    /// Pure read of the current minute bucket against the provider's
    /// rpm/tpm ceilings (0 = unbounded on that dimension).
    pub fn check_limit(&self, desc: &ProviderDescriptor) -> MinuteCheck {
        self.check_limit_at(desc, Utc::now())
    }

    pub fn check_limit_at(&self, desc: &ProviderDescriptor, now: DateTime<Utc>) -> MinuteCheck {
        let stamp = minute_stamp(now);
        let bucket = self
            .buckets
            .lock()
            .unwrap()
            .get(&(desc.id, stamp))
            .copied()
            .unwrap_or_default();

        let requests_ok = desc.limits.rpm == 0 || bucket.requests < desc.limits.rpm;
        let tokens_ok = desc.limits.tpm == 0 || bucket.tokens < desc.limits.tpm;

        MinuteCheck {
            allowed: requests_ok && tokens_ok,
            current_requests: bucket.requests,
            current_tokens: bucket.tokens,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::ProviderLimits;
    use chrono::{Duration, TimeZone};

    fn desc(rpm: u64, tpm: u64) -> ProviderDescriptor {
        ProviderDescriptor {
            id: "test-prov",
            display_name: "Test",
            model_id: "test-model",
            credential_key: "TEST_KEY",
            base_url: "http://localhost",
            limits: ProviderLimits {
                rpm,
                tpm,
                rpd: 0,
                tpd: 0,
            },
            description: "",
        }
    }

    fn at(min: u32, sec: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 12, min, sec).unwrap()
    }

    #[test]
    fn test_rpm_ceiling() {
        let tracker = MinuteWindowTracker::new();
        let d = desc(2, 0);
        let now = at(0, 10);

        assert!(tracker.check_limit_at(&d, now).allowed);
        tracker.record_usage_at("test-prov", 100, now);
        assert!(tracker.check_limit_at(&d, now).allowed);
        tracker.record_usage_at("test-prov", 100, now);

        let check = tracker.check_limit_at(&d, now);
        assert!(!check.allowed);
        assert_eq!(check.current_requests, 2);
        assert_eq!(check.current_tokens, 200);
    }

    #[test]
    fn test_zero_limit_is_unbounded() {
        let tracker = MinuteWindowTracker::new();
        let d = desc(0, 0);
        let now = at(0, 0);

        for _ in 0..10_000 {
            tracker.record_usage_at("test-prov", 1_000_000, now);
        }
        assert!(tracker.check_limit_at(&d, now).allowed);
    }

    #[test]
    fn test_window_decay_after_two_minutes() {
        let tracker = MinuteWindowTracker::new();
        let d = desc(1, 0);
        let now = at(0, 0);

        tracker.record_usage_at("test-prov", 500, now);
        assert!(!tracker.check_limit_at(&d, now).allowed);

        // Next minute reads a fresh bucket even before any purge
        let next = now + Duration::minutes(1);
        let check = tracker.check_limit_at(&d, next);
        assert!(check.allowed);
        assert_eq!(check.current_requests, 0);

        // A write two minutes later purges the old bucket entirely
        tracker.record_usage_at("other-prov", 1, now + Duration::minutes(2));
        let buckets = tracker.buckets.lock().unwrap();
        assert!(!buckets.contains_key(&("test-prov", minute_stamp(now))));
        drop(buckets);

        let check = tracker.check_limit_at(&d, now + Duration::minutes(2));
        assert_eq!(check.current_requests, 0);
        assert_eq!(check.current_tokens, 0);
    }

    #[test]
    fn test_tpm_ceiling_independent_of_rpm() {
        let tracker = MinuteWindowTracker::new();
        let d = desc(0, 1_000);
        let now = at(5, 30);

        tracker.record_usage_at("test-prov", 999, now);
        assert!(tracker.check_limit_at(&d, now).allowed);
        tracker.record_usage_at("test-prov", 1, now);
        assert!(!tracker.check_limit_at(&d, now).allowed);
    }
}
