use std::sync::Arc;

use axum::{
    Json,
    extract::{Query, State},
    http::StatusCode,
};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use super::{ErrorResponse, admin_error};
use crate::AppState;
use crate::quota::ledger::DailyUsageRow;

// --- Types ---

#[derive(Deserialize, ToSchema)]
pub struct UsageHistoryQuery {
    /// How many days back to report (default 30, capped at 365)
    pub days: Option<u32>,
}

#[derive(Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct UsageHistoryResponse {
    pub days: u32,
    pub rows: Vec<DailyUsageRow>,
}

// --- Handlers ---

/// Per-day per-provider usage from the daily ledger, newest day first
#[utoipa::path(
    get,
    path = "/usage-history",
    tag = "usage",
    params(("days" = Option<u32>, Query, description = "Days back (default 30)")),
    responses(
        (status = 200, body = UsageHistoryResponse),
        (status = 500, body = ErrorResponse),
    )
)]
pub async fn get_usage_history(
    State(state): State<Arc<AppState>>,
    Query(query): Query<UsageHistoryQuery>,
) -> Result<Json<UsageHistoryResponse>, (StatusCode, Json<ErrorResponse>)> {
    let days = query.days.unwrap_or(30).min(365);
    let rows = state.ledger.history(days).await.map_err(admin_error)?;
    Ok(Json(UsageHistoryResponse { days, rows }))
}
