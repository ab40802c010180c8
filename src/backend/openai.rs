//! Backend for OpenAI-compatible APIs.
//!
//! [`OpenAiBackend`] covers: OpenAI, vLLM, llama.cpp server, LM Studio,
//! Together AI, Groq, Mistral, Fireworks, and Ollama's `/v1/` endpoint.
//!
//! Endpoint: `/v1/chat/completions`. Token usage is read from
//! `usage.total_tokens`; a response without it reports zero tokens, which
//! the client rejects as a malformed response.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use tracing::debug;

use super::{classify_status, classify_transport, normalize_base_url, parse_retry_after, Backend, LlmRequest, LlmResponse};
use crate::config::OrchestratorConfig;
use crate::error::{OrchestratorError, Result};

/// Backend for any OpenAI-compatible API.
///
/// # Example
///
/// ```
/// use llm_orchestrator::backend::OpenAiBackend;
///
/// let backend = OpenAiBackend::new("https://api.openai.com").with_api_key("sk-...");
/// ```
#[derive(Clone)]
pub struct OpenAiBackend {
    http: Client,
    base_url: String,
    /// Sent as `Authorization: Bearer {key}` when set.
    api_key: Option<String>,
    /// Sent as `OpenAI-Organization: {org}` when set.
    organization: Option<String>,
}

impl std::fmt::Debug for OpenAiBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiBackend")
            .field("base_url", &self.base_url)
            .field(
                "api_key",
                &self.api_key.as_ref().map(|k| match k.get(..6) {
                    Some(prefix) if k.len() > 6 => format!("{}***", prefix),
                    _ => "***".to_string(),
                }),
            )
            .field("organization", &self.organization)
            .finish()
    }
}

impl OpenAiBackend {
    /// Backend for the provider at `base_url`, without authentication.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(Client::new(), base_url)
    }

    /// Reuse an existing connection pool.
    pub fn with_client(http: Client, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: normalize_base_url(&base_url.into()),
            api_key: None,
            organization: None,
        }
    }

    pub fn from_config(config: &OrchestratorConfig) -> Self {
        let backend = Self::new(config.base_url.clone());
        match &config.api_key {
            Some(key) => backend.with_api_key(key.clone()),
            None => backend,
        }
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    pub fn with_organization(mut self, org: impl Into<String>) -> Self {
        self.organization = Some(org.into());
        self
    }

    pub fn has_api_key(&self) -> bool {
        self.api_key.is_some()
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn endpoint(&self) -> String {
        format!("{}/v1/chat/completions", self.base_url)
    }

    /// Build the request body for `/v1/chat/completions`.
    fn build_body(request: &LlmRequest) -> Value {
        let messages: Vec<Value> = request
            .messages
            .iter()
            .map(|m| json!({"role": m.role.as_str(), "content": m.content}))
            .collect();

        json!({
            "model": request.model,
            "messages": messages,
            "temperature": request.temperature,
            "max_tokens": request.max_tokens,
            "stream": false,
        })
    }

    fn build_http_request(&self, body: &Value, timeout: Duration) -> reqwest::RequestBuilder {
        let mut req = self.http.post(self.endpoint()).json(body).timeout(timeout);

        if let Some(ref key) = self.api_key {
            req = req.bearer_auth(key);
        }
        if let Some(ref org) = self.organization {
            req = req.header("OpenAI-Organization", org.as_str());
        }

        req
    }

    /// Pull content, usage and stop reason out of a completion body.
    fn parse_response(json_resp: &Value) -> Result<LlmResponse> {
        let choice = json_resp
            .get("choices")
            .and_then(|c| c.get(0))
            .ok_or_else(|| OrchestratorError::Service("response has no choices".to_string()))?;

        let content = choice
            .get("message")
            .and_then(|m| m.get("content"))
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();

        let tokens_used = json_resp
            .get("usage")
            .and_then(|u| u.get("total_tokens"))
            .and_then(Value::as_u64)
            .map(|n| u32::try_from(n).unwrap_or(u32::MAX))
            .unwrap_or(0);

        let finish_reason = choice
            .get("finish_reason")
            .and_then(Value::as_str)
            .map(str::to_string);

        Ok(LlmResponse {
            content,
            tokens_used,
            finish_reason,
        })
    }
}

#[async_trait]
impl Backend for OpenAiBackend {
    async fn complete(&self, request: &LlmRequest) -> Result<LlmResponse> {
        let body = Self::build_body(request);
        debug!(model = %request.model, messages = request.messages.len(), "openai request");

        let resp = self
            .build_http_request(&body, request.timeout)
            .send()
            .await
            .map_err(|e| classify_transport(e, request.timeout))?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let retry_after = resp
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(parse_retry_after);
            let text = resp.text().await.unwrap_or_default();
            return Err(classify_status(status, text, retry_after));
        }

        let json_resp: Value = resp
            .json()
            .await
            .map_err(|e| match e.is_timeout() {
                true => OrchestratorError::Timeout(request.timeout),
                false => OrchestratorError::Service(format!("malformed response body: {}", e)),
            })?;

        Self::parse_response(&json_resp)
    }

    fn name(&self) -> &'static str {
        "openai"
    }
}
