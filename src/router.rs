use std::sync::Arc;

use tracing::debug;

use crate::error::ChatError;
use crate::providers::ProviderCatalog;
use crate::quota::{DailyQuotaLedger, MinuteWindowTracker, QuotaStatus};

/// The provider chosen for an attempt, with its quota standing at
/// selection time.
#[derive(Debug, Clone)]
pub struct Selection {
    pub provider_id: String,
    pub quota: QuotaStatus,
}

/// First-fit provider selection over the preferred-then-fallback order.
///
/// No load balancing: the first candidate that is available, under its
/// minute window, and under its daily quota wins.
pub struct FallbackRouter {
    catalog: Arc<ProviderCatalog>,
    minute: Arc<MinuteWindowTracker>,
    ledger: Arc<DailyQuotaLedger>,
}

impl FallbackRouter {
    pub fn new(
        catalog: Arc<ProviderCatalog>,
        minute: Arc<MinuteWindowTracker>,
        ledger: Arc<DailyQuotaLedger>,
    ) -> Self {
        Self {
            catalog,
            minute,
            ledger,
        }
    }

    /// Build the de-duplicated candidate order: `preferred` first, then each
    /// fallback id not already present, keeping only ids in `available`.
    /// An unconfigured preferred id drops out here like any other candidate.
    pub fn candidate_order(
        preferred: &str,
        fallback_order: &[String],
        available: &[String],
    ) -> Vec<String> {
        let mut order: Vec<String> = Vec::with_capacity(fallback_order.len() + 1);
        order.push(preferred.to_string());
        for id in fallback_order {
            if !order.contains(id) {
                order.push(id.clone());
            }
        }
        order.retain(|id| available.iter().any(|a| a == id));
        order
    }

    /// Walk `candidates` in order and return the first admissible provider,
    /// or `None` when every candidate is over a ceiling — a terminal,
    /// user-visible condition, not something to retry internally.
    pub async fn select_from(
        &self,
        candidates: &[String],
    ) -> Result<Option<Selection>, ChatError> {
        for id in candidates {
            let desc = self.catalog.get(id);

            let minute = self.minute.check_limit(desc);
            if !minute.allowed {
                debug!(
                    provider = %id,
                    requests = minute.current_requests,
                    tokens = minute.current_tokens,
                    "minute window exceeded — skipping"
                );
                continue;
            }

            let quota = self.ledger.check_quota(desc).await?;
            if !quota.available {
                debug!(
                    provider = %id,
                    requests_used = quota.requests_used,
                    tokens_used = quota.tokens_used,
                    "daily quota exhausted — skipping"
                );
                continue;
            }

            return Ok(Some(Selection {
                provider_id: id.clone(),
                quota,
            }));
        }

        Ok(None)
    }

    /// One-shot selection over the full configured order.
    pub async fn select(
        &self,
        preferred: &str,
        fallback_order: &[String],
        available: &[String],
    ) -> Result<Option<Selection>, ChatError> {
        let candidates = Self::candidate_order(preferred, fallback_order, available);
        self.select_from(&candidates).await
    }
}
