use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, FixedOffset, Utc};
use serde::Serialize;
use turso::Database;
use utoipa::ToSchema;

use crate::clock::reference_day;
use crate::db::{self, get_string, get_u64};
use crate::error::ChatError;
use crate::providers::ProviderDescriptor;

/// Snapshot of one provider's standing against its daily ceilings.
#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct QuotaStatus {
    pub available: bool,
    pub requests_used: u64,
    pub tokens_used: u64,
    /// 0 = unbounded
    pub requests_limit: u64,
    /// 0 = unbounded
    pub tokens_limit: u64,
    pub percent_requests: f64,
    pub percent_tokens: f64,
}

/// One ledger row, as reported to the admin dashboard.
#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct DailyUsageRow {
    pub day: String,
    pub provider: String,
    pub requests: u64,
    pub tokens_in: u64,
    pub tokens_out: u64,
}

/// Durable per-(day, provider) usage counters.
///
/// Rows are created on first use of a day and never deleted here; they back
/// both quota enforcement and historical reporting. "Today" is computed in
/// the configured reference timezone, so resets happen at one deterministic
/// wall-clock moment regardless of where the server runs.
pub struct DailyQuotaLedger {
    db: Arc<Database>,
    tz: FixedOffset,
}

impl DailyQuotaLedger {
    pub fn new(db: Arc<Database>, tz: FixedOffset) -> Self {
        Self { db, tz }
    }

    /// Record one completed request. A single upsert-with-increment
    /// statement: concurrent recordings against the same row are both
    /// reflected, with no read-modify-write from application memory.
    pub async fn record_usage(
        &self,
        provider: &str,
        tokens_in: u64,
        tokens_out: u64,
    ) -> Result<(), ChatError> {
        self.record_usage_at(provider, tokens_in, tokens_out, Utc::now())
            .await
    }

    pub async fn record_usage_at(
        &self,
        provider: &str,
        tokens_in: u64,
        tokens_out: u64,
        now: DateTime<Utc>,
    ) -> Result<(), ChatError> {
        let day = reference_day(now, self.tz).to_string();
        let conn = db::connect(&self.db)?;

        conn.execute(
            "INSERT INTO daily_usage (day, provider, requests, tokens_in, tokens_out) \
             VALUES (?, ?, 1, ?, ?) \
             ON CONFLICT (day, provider) DO UPDATE SET \
             requests = requests + 1, \
             tokens_in = tokens_in + excluded.tokens_in, \
             tokens_out = tokens_out + excluded.tokens_out",
            (day, provider, tokens_in as i64, tokens_out as i64),
        )
        .await
        .map_err(|e| ChatError::Database(format!("Failed to record usage: {e}")))?;

        Ok(())
    }

    /// Read today's standing for a provider. An absent row is all-zero usage.
    pub async fn check_quota(&self, desc: &ProviderDescriptor) -> Result<QuotaStatus, ChatError> {
        self.check_quota_at(desc, Utc::now()).await
    }

    pub async fn check_quota_at(
        &self,
        desc: &ProviderDescriptor,
        now: DateTime<Utc>,
    ) -> Result<QuotaStatus, ChatError> {
        let day = reference_day(now, self.tz).to_string();
        let conn = db::connect(&self.db)?;

        let mut rows = conn
            .query(
                "SELECT requests, tokens_in, tokens_out FROM daily_usage \
                 WHERE day = ? AND provider = ?",
                (day, desc.id),
            )
            .await
            .map_err(|e| ChatError::Database(format!("Failed to read quota: {e}")))?;

        let (requests_used, tokens_used) = match rows
            .next()
            .await
            .map_err(|e| ChatError::Database(format!("Failed to read quota row: {e}")))?
        {
            Some(row) => (get_u64(&row, 0), get_u64(&row, 1) + get_u64(&row, 2)),
            None => (0, 0),
        };

        let requests_limit = desc.limits.rpd;
        let tokens_limit = desc.limits.tpd;

        let available = (requests_limit == 0 || requests_used < requests_limit)
            && (tokens_limit == 0 || tokens_used < tokens_limit);

        Ok(QuotaStatus {
            available,
            requests_used,
            tokens_used,
            requests_limit,
            tokens_limit,
            percent_requests: percent(requests_used, requests_limit),
            percent_tokens: percent(tokens_used, tokens_limit),
        })
    }

    /// Per-provider quota snapshot for reporting. Independent point reads;
    /// no cross-provider consistency is needed or attempted.
    pub async fn all_quotas(
        &self,
        descs: &[ProviderDescriptor],
    ) -> Result<HashMap<String, QuotaStatus>, ChatError> {
        let mut out = HashMap::new();
        for desc in descs {
            out.insert(desc.id.to_string(), self.check_quota(desc).await?);
        }
        Ok(out)
    }

    /// Recent ledger rows for the admin usage-history view.
    pub async fn history(&self, days: u32) -> Result<Vec<DailyUsageRow>, ChatError> {
        let cutoff = reference_day(Utc::now(), self.tz) - chrono::Days::new(days as u64);
        let conn = db::connect(&self.db)?;

        let mut rows = conn
            .query(
                "SELECT day, provider, requests, tokens_in, tokens_out FROM daily_usage \
                 WHERE day >= ? ORDER BY day DESC, provider",
                [cutoff.to_string()],
            )
            .await
            .map_err(|e| ChatError::Database(format!("Failed to read usage history: {e}")))?;

        let mut out = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            out.push(DailyUsageRow {
                day: get_string(&row, 0),
                provider: get_string(&row, 1),
                requests: get_u64(&row, 2),
                tokens_in: get_u64(&row, 3),
                tokens_out: get_u64(&row, 4),
            });
        }
        Ok(out)
    }
}

fn percent(used: u64, limit: u64) -> f64 {
    if limit == 0 {
        0.0
    } else {
        used as f64 / limit as f64 * 100.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::ProviderLimits;
    use chrono::TimeZone;

    fn desc(rpd: u64, tpd: u64) -> ProviderDescriptor {
        ProviderDescriptor {
            id: "test-prov",
            display_name: "Test",
            model_id: "test-model",
            credential_key: "TEST_KEY",
            base_url: "http://localhost",
            limits: ProviderLimits {
                rpm: 0,
                tpm: 0,
                rpd,
                tpd,
            },
            description: "",
        }
    }

    async fn ledger() -> DailyQuotaLedger {
        let db = db::open_in_memory().await.unwrap();
        DailyQuotaLedger::new(db, "+00:00".parse().unwrap())
    }

    #[tokio::test]
    async fn test_absent_row_is_zero_usage() {
        let ledger = ledger().await;
        let status = ledger.check_quota(&desc(10, 0)).await.unwrap();
        assert!(status.available);
        assert_eq!(status.requests_used, 0);
        assert_eq!(status.tokens_used, 0);
        assert_eq!(status.percent_requests, 0.0);
    }

    #[tokio::test]
    async fn test_increment_counts_every_recording() {
        let ledger = ledger().await;
        for _ in 0..5 {
            ledger.record_usage("test-prov", 100, 50).await.unwrap();
        }
        let status = ledger.check_quota(&desc(10, 0)).await.unwrap();
        assert_eq!(status.requests_used, 5);
        assert_eq!(status.tokens_used, 750);
        assert_eq!(status.percent_requests, 50.0);
        assert!(status.available);
    }

    #[tokio::test]
    async fn test_requests_ceiling_exhausts() {
        let ledger = ledger().await;
        let d = desc(3, 0);
        for _ in 0..3 {
            ledger.record_usage("test-prov", 1, 1).await.unwrap();
        }
        let status = ledger.check_quota(&d).await.unwrap();
        assert!(!status.available);
        assert_eq!(status.percent_requests, 100.0);
    }

    #[tokio::test]
    async fn test_unbounded_tokens_never_reject() {
        let ledger = ledger().await;
        let d = desc(0, 0);
        ledger
            .record_usage("test-prov", 50_000_000, 50_000_000)
            .await
            .unwrap();
        let status = ledger.check_quota(&d).await.unwrap();
        assert!(status.available);
        assert_eq!(status.percent_tokens, 0.0);
    }

    #[tokio::test]
    async fn test_day_boundary_resets_usage() {
        let ledger = ledger().await;
        let d = desc(1, 0);
        let monday = Utc.with_ymd_and_hms(2025, 6, 2, 10, 0, 0).unwrap();
        let tuesday = Utc.with_ymd_and_hms(2025, 6, 3, 10, 0, 0).unwrap();

        ledger
            .record_usage_at("test-prov", 10, 10, monday)
            .await
            .unwrap();
        assert!(!ledger.check_quota_at(&d, monday).await.unwrap().available);

        // A new reference day reads a fresh row; Monday's row is retained
        assert!(ledger.check_quota_at(&d, tuesday).await.unwrap().available);
        let history = ledger.history(30).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].day, "2025-06-02");
        assert_eq!(history[0].requests, 1);
    }

    #[tokio::test]
    async fn test_concurrent_recordings_all_reflected() {
        let ledger = Arc::new(ledger().await);
        let mut handles = Vec::new();
        for _ in 0..20 {
            let ledger = Arc::clone(&ledger);
            handles.push(tokio::spawn(async move {
                ledger.record_usage("test-prov", 10, 5).await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let status = ledger.check_quota(&desc(0, 0)).await.unwrap();
        assert_eq!(status.requests_used, 20);
        assert_eq!(status.tokens_used, 300);
    }
}
