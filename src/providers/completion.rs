use std::env;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::debug;

use super::ProviderDescriptor;

/// One turn of a conversation, in the OpenAI-compatible wire shape all
/// catalog providers accept.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

/// A successful provider response.
#[derive(Debug, Clone)]
pub struct Completion {
    pub text: String,
    pub tokens_in: u64,
    pub tokens_out: u64,
}

/// A failed provider attempt, classified for the error log. Never surfaced
/// to visitors directly — the orchestrator converts it into "try the next
/// candidate".
#[derive(Debug, thiserror::Error)]
pub enum CompletionError {
    #[error("provider did not respond within the timeout")]
    Timeout,

    #[error("provider rejected for quota: {0}")]
    Quota(String),

    #[error("provider rate limited: {0}")]
    RateLimit(String),

    #[error("{0}")]
    Other(String),
}

impl CompletionError {
    pub fn error_type(&self) -> &'static str {
        match self {
            CompletionError::Timeout => "timeout",
            CompletionError::Quota(_) => "quota",
            CompletionError::RateLimit(_) => "rate_limit",
            CompletionError::Other(_) => "other",
        }
    }
}

/// The opaque completion capability the orchestrator consumes. The caller
/// owns the timeout; implementations just make the call.
#[async_trait]
pub trait CompletionBackend: Send + Sync {
    async fn complete(
        &self,
        desc: &ProviderDescriptor,
        messages: &[ChatMessage],
    ) -> Result<Completion, CompletionError>;
}

/// Production backend: POST to the descriptor's OpenAI-compatible
/// `chat/completions` endpoint with the credential named by the descriptor.
pub struct HttpCompletionBackend {
    client: Client,
}

impl HttpCompletionBackend {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl CompletionBackend for HttpCompletionBackend {
    async fn complete(
        &self,
        desc: &ProviderDescriptor,
        messages: &[ChatMessage],
    ) -> Result<Completion, CompletionError> {
        let api_key = env::var(desc.credential_key)
            .map_err(|_| CompletionError::Other(format!("{} is not set", desc.credential_key)))?;

        let url = format!("{}/chat/completions", desc.base_url);
        debug!(provider = %desc.id, model = %desc.model_id, "sending completion request");

        let response = self
            .client
            .post(&url)
            .bearer_auth(api_key)
            .json(&json!({
                "model": desc.model_id,
                "messages": messages,
            }))
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    CompletionError::Timeout
                } else {
                    CompletionError::Other(format!("transport error: {e}"))
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_http_failure(status, &body));
        }

        let value: Value = response
            .json()
            .await
            .map_err(|e| CompletionError::Other(format!("invalid response body: {e}")))?;
        parse_completion(&value)
    }
}

/// Map a non-success HTTP status onto the error taxonomy.
fn classify_http_failure(status: StatusCode, body: &str) -> CompletionError {
    let summary: String = body.chars().take(300).collect();
    match status {
        StatusCode::TOO_MANY_REQUESTS => {
            if summary.to_lowercase().contains("quota") {
                CompletionError::Quota(summary)
            } else {
                CompletionError::RateLimit(summary)
            }
        }
        StatusCode::PAYMENT_REQUIRED | StatusCode::FORBIDDEN => CompletionError::Quota(summary),
        _ => CompletionError::Other(format!("HTTP {status}: {summary}")),
    }
}

/// Extract text and token counts from an OpenAI-compatible response body.
/// A missing usage block is tolerated (zero tokens); missing text is not.
fn parse_completion(value: &Value) -> Result<Completion, CompletionError> {
    let text = value
        .get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("message"))
        .and_then(|m| m.get("content"))
        .and_then(|t| t.as_str())
        .ok_or_else(|| CompletionError::Other("response has no message content".to_string()))?
        .to_string();

    let usage = value.get("usage");
    let tokens_in = usage
        .and_then(|u| u.get("prompt_tokens"))
        .and_then(|v| v.as_u64())
        .unwrap_or(0);
    let tokens_out = usage
        .and_then(|u| u.get("completion_tokens"))
        .and_then(|v| v.as_u64())
        .unwrap_or(0);

    Ok(Completion {
        text,
        tokens_in,
        tokens_out,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_completion() {
        let value = serde_json::json!({
            "choices": [{ "message": { "role": "assistant", "content": "Hello there" } }],
            "usage": { "prompt_tokens": 42, "completion_tokens": 7 }
        });
        let completion = parse_completion(&value).unwrap();
        assert_eq!(completion.text, "Hello there");
        assert_eq!(completion.tokens_in, 42);
        assert_eq!(completion.tokens_out, 7);
    }

    #[test]
    fn test_parse_completion_missing_usage() {
        let value = serde_json::json!({
            "choices": [{ "message": { "content": "ok" } }]
        });
        let completion = parse_completion(&value).unwrap();
        assert_eq!(completion.tokens_in, 0);
        assert_eq!(completion.tokens_out, 0);
    }

    #[test]
    fn test_parse_completion_missing_content() {
        let value = serde_json::json!({ "choices": [] });
        let err = parse_completion(&value).unwrap_err();
        assert_eq!(err.error_type(), "other");
    }

    #[test]
    fn test_classify_http_failure() {
        let rate = classify_http_failure(StatusCode::TOO_MANY_REQUESTS, "slow down");
        assert_eq!(rate.error_type(), "rate_limit");

        let quota = classify_http_failure(
            StatusCode::TOO_MANY_REQUESTS,
            "You exceeded your current quota",
        );
        assert_eq!(quota.error_type(), "quota");

        let forbidden = classify_http_failure(StatusCode::FORBIDDEN, "billing disabled");
        assert_eq!(forbidden.error_type(), "quota");

        let server = classify_http_failure(StatusCode::INTERNAL_SERVER_ERROR, "boom");
        assert_eq!(server.error_type(), "other");
    }
}
