mod errors;
mod routing;
mod session;
mod usage_history;

// Glob re-exports so utoipa's `routes!()` macro can find the hidden `__path_*`
// structs alongside the handler functions at the `crate::routes::admin::*` path.
pub use errors::*;
pub use routing::*;
pub use session::*;
pub use usage_history::*;

use axum::{Json, http::StatusCode};
use serde::Serialize;
use utoipa::ToSchema;

use crate::error::ChatError;

// --- Shared response types ---

#[derive(Serialize, ToSchema)]
pub struct SuccessResponse {
    pub success: bool,
}

#[derive(Serialize, ToSchema)]
pub struct ErrorResponse {
    pub error: String,
}

/// Map a store error onto the admin API's status + JSON error tuple.
pub(super) fn admin_error(err: ChatError) -> (StatusCode, Json<ErrorResponse>) {
    let status = match &err {
        ChatError::BadRequest(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (
        status,
        Json(ErrorResponse {
            error: err.to_string(),
        }),
    )
}
