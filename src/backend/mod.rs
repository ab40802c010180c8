//! Model transport port and normalized request/response types.
//!
//! The [`Backend`] trait is the single "call the model" primitive the
//! [`RetryingClient`](crate::client::RetryingClient) wraps. Implementations
//! translate an [`LlmRequest`] into a provider call and must return either an
//! [`LlmResponse`] or an already-classified
//! [`OrchestratorError`](crate::OrchestratorError) (`Timeout`, `RateLimit`,
//! `Service` or `Validation`).
//!
//! ## Architecture
//!
//! ```text
//! RetryingClient ──► LlmRequest ──► Backend::complete() ──► LlmResponse
//!                                          │
//!                         ┌────────────────┼────────────────┐
//!                   OpenAiBackend    OllamaBackend     MockBackend
//!                 /v1/chat/completions  /api/chat      scripted outcomes
//! ```

pub mod backoff;
pub mod mock;
pub mod ollama;
pub mod openai;

pub use backoff::{JitterStrategy, RetryDecision, RetryPolicy};
pub use mock::{MockBackend, MockOutcome};
pub use ollama::OllamaBackend;
pub use openai::OpenAiBackend;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{OrchestratorError, Result};

/// The role of a chat message author.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// A single message in a chat conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LlmMessage {
    pub role: Role,
    pub content: String,
}

impl LlmMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// A normalized, provider-agnostic model call.
#[derive(Debug, Clone, PartialEq)]
pub struct LlmRequest {
    /// Model identifier (e.g. `"gpt-4o-mini"`, `"llama3.2:3b"`).
    pub model: String,
    /// Ordered conversation, system message first if any.
    pub messages: Vec<LlmMessage>,
    pub temperature: f64,
    pub max_tokens: u32,
    /// Upper bound the backend should apply to its own transport.
    pub timeout: Duration,
}

/// A normalized model response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LlmResponse {
    /// The generated text.
    pub content: String,
    /// Prompt plus completion tokens, as reported by the provider.
    pub tokens_used: u32,
    /// Provider stop reason (`"stop"`, `"length"`, ...), when reported.
    pub finish_reason: Option<String>,
}

/// Abstraction over LLM providers.
///
/// This trait is object-safe and designed to be used as `Arc<dyn Backend>`.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Execute one model call. No retries: that is the client's job.
    async fn complete(&self, request: &LlmRequest) -> Result<LlmResponse>;

    /// Human-readable name for logging and diagnostics.
    fn name(&self) -> &'static str;
}

/// Map a non-success HTTP status to the client's error taxonomy.
///
/// 429 is throttling, 408 and 5xx are service-side and retryable, every
/// other 4xx means the request itself was rejected.
pub fn classify_status(status: u16, body: String, retry_after: Option<Duration>) -> OrchestratorError {
    match status {
        429 => OrchestratorError::RateLimit { retry_after },
        408 | 500..=599 => OrchestratorError::Service(format!("HTTP {}: {}", status, body)),
        400..=499 => OrchestratorError::Validation(format!("HTTP {}: {}", status, body)),
        _ => OrchestratorError::Service(format!("unexpected HTTP {}: {}", status, body)),
    }
}

/// Map a transport-level `reqwest` failure, keeping the configured bound on timeouts.
pub(crate) fn classify_transport(err: reqwest::Error, timeout: Duration) -> OrchestratorError {
    if err.is_timeout() {
        OrchestratorError::Timeout(timeout)
    } else {
        OrchestratorError::from(err)
    }
}

/// Strip known provider path suffixes from a base URL so backends can
/// append their own endpoint path.
/// e.g., "https://api.openai.com/v1" -> "https://api.openai.com"
/// e.g., "http://localhost:11434/api" -> "http://localhost:11434"
pub fn normalize_base_url(url: &str) -> String {
    let trimmed = url.trim_end_matches('/');
    // Longest suffix first
    for suffix in ["/v1/chat/completions", "/v1", "/api/chat", "/api"] {
        if let Some(stripped) = trimmed.strip_suffix(suffix) {
            return stripped.to_string();
        }
    }
    trimmed.to_string()
}

/// Parse a `Retry-After` header value given in whole seconds.
pub(crate) fn parse_retry_after(value: &str) -> Option<Duration> {
    value.trim().parse::<u64>().ok().map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_classify_429_is_rate_limit() {
        let err = classify_status(429, "slow down".into(), Some(Duration::from_secs(7)));
        assert_eq!(err.kind(), ErrorKind::RateLimit);
        assert_eq!(err.retry_after(), Some(Duration::from_secs(7)));
    }

    #[test]
    fn test_classify_5xx_is_service() {
        assert_eq!(classify_status(503, String::new(), None).kind(), ErrorKind::Service);
        assert_eq!(classify_status(500, String::new(), None).kind(), ErrorKind::Service);
        assert_eq!(classify_status(408, String::new(), None).kind(), ErrorKind::Service);
    }

    #[test]
    fn test_classify_4xx_is_validation() {
        let err = classify_status(400, "bad request".into(), None);
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert!(err.to_string().contains("bad request"));
        assert_eq!(classify_status(401, String::new(), None).kind(), ErrorKind::Validation);
    }

    #[test]
    fn test_parse_retry_after() {
        assert_eq!(parse_retry_after(" 12 "), Some(Duration::from_secs(12)));
        assert_eq!(parse_retry_after("Wed, 21 Oct 2015 07:28:00 GMT"), None);
    }

    #[test]
    fn test_normalize_base_url() {
        assert_eq!(normalize_base_url("https://api.openai.com/v1/"), "https://api.openai.com");
        assert_eq!(
            normalize_base_url("https://api.openai.com/v1/chat/completions"),
            "https://api.openai.com"
        );
        assert_eq!(normalize_base_url("http://localhost:11434/api"), "http://localhost:11434");
        assert_eq!(normalize_base_url("http://localhost:8000"), "http://localhost:8000");
    }

    #[test]
    fn test_role_serializes_lowercase() {
        let json = serde_json::to_string(&LlmMessage::assistant("hi")).unwrap();
        assert_eq!(json, r#"{"role":"assistant","content":"hi"}"#);
    }
}
