use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Duration, FixedOffset, NaiveDate, Utc};

use crate::clock::reference_day;

/// Above this many tracked sources, stale entries are dropped on admit.
const PURGE_THRESHOLD: usize = 4096;

#[derive(Debug, Clone)]
struct VisitorEntry {
    minute_count: u32,
    minute_reset_at: DateTime<Utc>,
    day_count: u32,
    day: NaiveDate,
}

/// Outcome of an admission check.
#[derive(Debug, Clone)]
pub struct ThrottleDecision {
    pub allowed: bool,
    pub reason: Option<String>,
    pub retry_after_seconds: Option<u64>,
}

impl ThrottleDecision {
    fn admitted() -> Self {
        Self {
            allowed: true,
            reason: None,
            retry_after_seconds: None,
        }
    }
}

/// Per-source-IP admission control, independent of provider quotas.
///
/// Two ceilings per source: a rolling 60-second window and a
/// reference-timezone calendar day. State is in-process only and lost on
/// restart — worst case a burst goes briefly un-throttled after a deploy.
pub struct VisitorThrottle {
    rpm: u32,
    rpd: u32,
    tz: FixedOffset,
    entries: Mutex<HashMap<String, VisitorEntry>>,
}

impl VisitorThrottle {
    pub fn new(rpm: u32, rpd: u32, tz: FixedOffset) -> Self {
        Self {
            rpm,
            rpd,
            tz,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn admit(&self, source_id: &str) -> ThrottleDecision {
        self.admit_at(source_id, Utc::now())
    }

    pub fn admit_at(&self, source_id: &str, now: DateTime<Utc>) -> ThrottleDecision {
        let today = reference_day(now, self.tz);
        let mut entries = self.entries.lock().unwrap();

        if entries.len() > PURGE_THRESHOLD {
            entries.retain(|_, e| e.day == today || e.minute_reset_at > now);
        }

        let entry = entries
            .entry(source_id.to_string())
            .or_insert_with(|| VisitorEntry {
                minute_count: 0,
                minute_reset_at: now + Duration::seconds(60),
                day_count: 0,
                day: today,
            });

        // Lazy resets
        if entry.day != today {
            entry.day = today;
            entry.day_count = 0;
        }
        if now >= entry.minute_reset_at {
            entry.minute_count = 0;
            entry.minute_reset_at = now + Duration::seconds(60);
        }

        // Day ceiling first: the coarser, more user-visible rejection
        if entry.day_count >= self.rpd {
            return ThrottleDecision {
                allowed: false,
                reason: Some(
                    "You've reached today's message limit. Please come back tomorrow.".to_string(),
                ),
                retry_after_seconds: None,
            };
        }

        if entry.minute_count >= self.rpm {
            let retry_after = (entry.minute_reset_at - now).num_seconds().max(1) as u64;
            return ThrottleDecision {
                allowed: false,
                reason: Some(format!(
                    "You're sending messages too quickly. Try again in {retry_after} seconds."
                )),
                retry_after_seconds: Some(retry_after),
            };
        }

        entry.minute_count += 1;
        entry.day_count += 1;
        ThrottleDecision::admitted()
    }
}
