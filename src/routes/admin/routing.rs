use std::sync::Arc;

use axum::{Json, extract::State, http::StatusCode};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use super::{ErrorResponse, admin_error};
use crate::AppState;
use crate::quota::QuotaStatus;
use crate::settings::RoutingSettings;

// --- Types ---

#[derive(Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ProviderLimitsView {
    pub rpm: u64,
    pub tpm: u64,
    pub rpd: u64,
    pub tpd: u64,
}

#[derive(Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ProviderStatus {
    pub id: String,
    pub display_name: String,
    pub model_id: String,
    pub description: String,
    pub available: bool,
    pub limits: ProviderLimitsView,
    pub quota: QuotaStatus,
}

#[derive(Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct RoutingStatusResponse {
    pub settings: RoutingSettings,
    pub providers: Vec<ProviderStatus>,
}

#[derive(Deserialize, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct UpdateRoutingRequest {
    pub preferred: Option<String>,
    pub fallback_order: Option<Vec<String>>,
}

// --- Handlers ---

/// Current routing settings plus a per-provider quota snapshot
#[utoipa::path(
    get,
    path = "/routing",
    tag = "routing",
    responses(
        (status = 200, body = RoutingStatusResponse),
        (status = 500, body = ErrorResponse),
    )
)]
pub async fn get_routing(
    State(state): State<Arc<AppState>>,
) -> Result<Json<RoutingStatusResponse>, (StatusCode, Json<ErrorResponse>)> {
    let settings = state
        .settings
        .get(&state.catalog)
        .await
        .map_err(admin_error)?;

    let mut quotas = state
        .ledger
        .all_quotas(state.catalog.all())
        .await
        .map_err(admin_error)?;

    let mut providers = Vec::new();
    for desc in state.catalog.all() {
        let quota = quotas.remove(desc.id).ok_or_else(|| {
            admin_error(crate::error::ChatError::Internal(format!(
                "missing quota snapshot for {}",
                desc.id
            )))
        })?;
        providers.push(ProviderStatus {
            id: desc.id.to_string(),
            display_name: desc.display_name.to_string(),
            model_id: desc.model_id.to_string(),
            description: desc.description.to_string(),
            available: state.catalog.is_available(desc.id),
            limits: ProviderLimitsView {
                rpm: desc.limits.rpm,
                tpm: desc.limits.tpm,
                rpd: desc.limits.rpd,
                tpd: desc.limits.tpd,
            },
            quota,
        });
    }

    Ok(Json(RoutingStatusResponse {
        settings,
        providers,
    }))
}

/// Update the preferred provider and/or the fallback order
#[utoipa::path(
    put,
    path = "/routing",
    tag = "routing",
    request_body = UpdateRoutingRequest,
    responses(
        (status = 200, body = RoutingSettings),
        (status = 400, body = ErrorResponse),
        (status = 500, body = ErrorResponse),
    )
)]
pub async fn update_routing(
    State(state): State<Arc<AppState>>,
    Json(body): Json<UpdateRoutingRequest>,
) -> Result<Json<RoutingSettings>, (StatusCode, Json<ErrorResponse>)> {
    let settings = state
        .settings
        .update(&state.catalog, body.preferred, body.fallback_order)
        .await
        .map_err(admin_error)?;
    Ok(Json(settings))
}
