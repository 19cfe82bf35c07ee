use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use turso::Database;
use utoipa::ToSchema;

use crate::db::{self, get_string, get_u64, opt_string};
use crate::error::ChatError;

/// One failed provider attempt, as stored and as fed to the admin UI.
#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ErrorRecord {
    pub provider: String,
    /// One of "timeout", "quota", "rate_limit", "other"
    pub error_type: String,
    pub message: String,
    /// Provider that picked up the request after this failure;
    /// absent on the terminal failure of a request
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback_used: Option<String>,
    /// Epoch milliseconds
    pub timestamp: u64,
}

/// Rolling failure count for one (provider, error type) pair.
#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ErrorSummary {
    pub provider: String,
    pub error_type: String,
    pub count: u64,
}

/// Append-only log of provider failures. Written on every failed attempt,
/// read only by the admin error feed — the enforcement path never consults it.
pub struct ProviderErrorLog {
    db: Arc<Database>,
}

impl ProviderErrorLog {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    pub async fn record(
        &self,
        provider: &str,
        error_type: &str,
        message: &str,
        fallback_used: Option<&str>,
    ) -> Result<(), ChatError> {
        let conn = db::connect(&self.db)?;
        conn.execute(
            "INSERT INTO provider_errors (provider, error_type, message, fallback_used, created_at) \
             VALUES (?, ?, ?, ?, ?)",
            (
                provider,
                error_type,
                message,
                fallback_used,
                Utc::now().timestamp_millis(),
            ),
        )
        .await
        .map_err(|e| ChatError::Database(format!("Failed to record provider error: {e}")))?;
        Ok(())
    }

    /// Most recent records, newest first.
    pub async fn recent(&self, limit: u32) -> Result<Vec<ErrorRecord>, ChatError> {
        let conn = db::connect(&self.db)?;
        let mut rows = conn
            .query(
                "SELECT provider, error_type, message, fallback_used, created_at \
                 FROM provider_errors ORDER BY id DESC LIMIT ?",
                [limit as i64],
            )
            .await
            .map_err(|e| ChatError::Database(format!("Failed to read error log: {e}")))?;

        let mut out = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            out.push(ErrorRecord {
                provider: get_string(&row, 0),
                error_type: get_string(&row, 1),
                message: get_string(&row, 2),
                fallback_used: opt_string(&row, 3),
                timestamp: get_u64(&row, 4),
            });
        }
        Ok(out)
    }

    /// Failure counts grouped by provider and error type over the last
    /// `window_hours` hours.
    pub async fn summary(&self, window_hours: u32) -> Result<Vec<ErrorSummary>, ChatError> {
        let cutoff = Utc::now().timestamp_millis() - (window_hours as i64) * 3600 * 1000;
        let conn = db::connect(&self.db)?;
        let mut rows = conn
            .query(
                "SELECT provider, error_type, COUNT(*) FROM provider_errors \
                 WHERE created_at >= ? GROUP BY provider, error_type \
                 ORDER BY COUNT(*) DESC",
                [cutoff],
            )
            .await
            .map_err(|e| ChatError::Database(format!("Failed to summarize error log: {e}")))?;

        let mut out = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            out.push(ErrorSummary {
                provider: get_string(&row, 0),
                error_type: get_string(&row, 1),
                count: get_u64(&row, 2),
            });
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_append_and_feed_order() {
        let log = ProviderErrorLog::new(db::open_in_memory().await.unwrap());

        log.record("gemini", "timeout", "request timed out", Some("mistral"))
            .await
            .unwrap();
        log.record("mistral", "other", "connection refused", None)
            .await
            .unwrap();

        let recent = log.recent(10).await.unwrap();
        assert_eq!(recent.len(), 2);
        // Newest first
        assert_eq!(recent[0].provider, "mistral");
        assert_eq!(recent[0].fallback_used, None);
        assert_eq!(recent[1].provider, "gemini");
        assert_eq!(recent[1].fallback_used.as_deref(), Some("mistral"));
    }

    #[tokio::test]
    async fn test_summary_groups_by_provider_and_type() {
        let log = ProviderErrorLog::new(db::open_in_memory().await.unwrap());

        for _ in 0..3 {
            log.record("gemini", "rate_limit", "429", None).await.unwrap();
        }
        log.record("gemini", "timeout", "timed out", None).await.unwrap();

        let summary = log.summary(24).await.unwrap();
        assert_eq!(summary.len(), 2);
        assert_eq!(summary[0].provider, "gemini");
        assert_eq!(summary[0].error_type, "rate_limit");
        assert_eq!(summary[0].count, 3);
    }
}
