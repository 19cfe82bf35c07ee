use std::sync::Arc;

use axum::{
    Json,
    extract::{Query, State},
    http::StatusCode,
};
use serde::Deserialize;
use utoipa::ToSchema;

use super::{ErrorResponse, admin_error};
use crate::AppState;
use crate::quota::ErrorRecord;
use crate::quota::errors::ErrorSummary;

// --- Types ---

#[derive(Deserialize, ToSchema)]
pub struct ErrorFeedQuery {
    /// Maximum records to return (default 50, capped at 500)
    pub limit: Option<u32>,
}

#[derive(Deserialize, ToSchema)]
pub struct ErrorSummaryQuery {
    /// Rolling window in hours (default 24)
    pub hours: Option<u32>,
}

#[derive(serde::Serialize, ToSchema)]
pub struct ErrorFeedResponse {
    pub errors: Vec<ErrorRecord>,
}

#[derive(serde::Serialize, ToSchema)]
pub struct ErrorSummaryResponse {
    pub summary: Vec<ErrorSummary>,
}

// --- Handlers ---

/// Most recent provider failures, newest first
#[utoipa::path(
    get,
    path = "/errors",
    tag = "errors",
    params(("limit" = Option<u32>, Query, description = "Max records (default 50)")),
    responses(
        (status = 200, body = ErrorFeedResponse),
        (status = 500, body = ErrorResponse),
    )
)]
pub async fn get_errors(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ErrorFeedQuery>,
) -> Result<Json<ErrorFeedResponse>, (StatusCode, Json<ErrorResponse>)> {
    let limit = query.limit.unwrap_or(50).min(500);
    let errors = state.error_log.recent(limit).await.map_err(admin_error)?;
    Ok(Json(ErrorFeedResponse { errors }))
}

/// Failure counts grouped by provider and error type
#[utoipa::path(
    get,
    path = "/errors/summary",
    tag = "errors",
    params(("hours" = Option<u32>, Query, description = "Rolling window in hours (default 24)")),
    responses(
        (status = 200, body = ErrorSummaryResponse),
        (status = 500, body = ErrorResponse),
    )
)]
pub async fn get_error_summary(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ErrorSummaryQuery>,
) -> Result<Json<ErrorSummaryResponse>, (StatusCode, Json<ErrorResponse>)> {
    let hours = query.hours.unwrap_or(24);
    let summary = state.error_log.summary(hours).await.map_err(admin_error)?;
    Ok(Json(ErrorSummaryResponse { summary }))
}
