use chrono::{DateTime, FixedOffset, NaiveDate, Utc};

/// Calendar day in the reference timezone.
///
/// Daily quotas reset at midnight in this zone regardless of where the
/// process runs, so the boundary is deterministic across deployments.
pub fn reference_day(now: DateTime<Utc>, tz: FixedOffset) -> NaiveDate {
    now.with_timezone(&tz).date_naive()
}

/// Epoch-minute stamp for minute-window bucketing.
///
/// Minute windows are short-lived and self-correcting, so plain UTC
/// wall-clock minute boundaries are sufficient here.
pub fn minute_stamp(now: DateTime<Utc>) -> i64 {
    now.timestamp() / 60
}

pub fn now_secs() -> u64 {
    Utc::now().timestamp() as u64
}
