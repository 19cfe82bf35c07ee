use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;

/// Message shown to visitors when every provider is unavailable or failed.
/// Deliberately generic — the per-provider reasons stay in the error log.
const EXHAUSTED_MESSAGE: &str =
    "The assistant is temporarily unavailable. Please try again in a few minutes.";

#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    /// Per-visitor ceiling hit (minute or day). Expected, user-facing.
    #[error("{reason}")]
    ThrottleRejected {
        reason: String,
        retry_after: Option<u64>,
    },

    /// Every candidate was over quota or unconfigured before any call was made.
    #[error("all providers exhausted")]
    RoutingExhausted,

    /// Every candidate was tried and failed.
    #[error("all provider attempts failed")]
    Exhausted,

    #[error("{0}")]
    BadRequest(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl IntoResponse for ChatError {
    fn into_response(self) -> Response {
        match self {
            ChatError::ThrottleRejected {
                reason,
                retry_after,
            } => {
                let mut body = json!({ "error": reason });
                if let Some(secs) = retry_after {
                    body["retryAfter"] = json!(secs);
                }
                (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response()
            }
            // Both exhaustion cases read the same to visitors
            ChatError::RoutingExhausted | ChatError::Exhausted => (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "error": EXHAUSTED_MESSAGE })),
            )
                .into_response(),
            ChatError::BadRequest(message) => {
                (StatusCode::BAD_REQUEST, Json(json!({ "error": message }))).into_response()
            }
            err @ (ChatError::Database(_) | ChatError::Internal(_)) => {
                tracing::error!("request failed: {err}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({ "error": "Internal server error" })),
                )
                    .into_response()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exhaustion_messages_are_generic() {
        // Neither exhaustion variant names a backend
        for err in [ChatError::RoutingExhausted, ChatError::Exhausted] {
            let text = err.to_string();
            assert!(!text.contains("gemini"));
            assert!(!text.contains("mistral"));
            assert!(!text.contains("groq"));
        }
    }
}
