//! Backend for Ollama's native chat API.
//!
//! [`OllamaBackend`] translates normalized [`LlmRequest`]s into
//! `/api/chat` calls with `stream: false`. Token usage is the sum of
//! `prompt_eval_count` and `eval_count`.

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use tracing::debug;

use super::{classify_status, classify_transport, normalize_base_url, parse_retry_after, Backend, LlmRequest, LlmResponse};
use crate::error::{OrchestratorError, Result};

/// Backend for a local or remote Ollama server.
///
/// # Example
///
/// ```
/// use llm_orchestrator::backend::OllamaBackend;
///
/// let backend = OllamaBackend::new("http://localhost:11434");
/// ```
#[derive(Debug, Clone)]
pub struct OllamaBackend {
    http: Client,
    base_url: String,
}

impl OllamaBackend {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: Client::new(),
            base_url: normalize_base_url(&base_url.into()),
        }
    }

    /// Build the JSON body for `/api/chat`.
    fn build_chat_body(request: &LlmRequest) -> Value {
        let messages: Vec<Value> = request
            .messages
            .iter()
            .map(|m| json!({"role": m.role.as_str(), "content": m.content}))
            .collect();

        json!({
            "model": request.model,
            "messages": messages,
            "stream": false,
            "options": {
                "temperature": request.temperature,
                "num_predict": request.max_tokens,
            },
        })
    }

    fn parse_response(json_resp: &Value) -> LlmResponse {
        let content = json_resp
            .get("message")
            .and_then(|m| m.get("content"))
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();

        let count = |field: &str| json_resp.get(field).and_then(Value::as_u64).unwrap_or(0);
        let total = count("prompt_eval_count") + count("eval_count");

        LlmResponse {
            content,
            tokens_used: u32::try_from(total).unwrap_or(u32::MAX),
            finish_reason: json_resp
                .get("done_reason")
                .and_then(Value::as_str)
                .map(str::to_string),
        }
    }
}

#[async_trait]
impl Backend for OllamaBackend {
    async fn complete(&self, request: &LlmRequest) -> Result<LlmResponse> {
        let url = format!("{}/api/chat", self.base_url);
        let body = Self::build_chat_body(request);
        debug!(model = %request.model, %url, "ollama request");

        let resp = self
            .http
            .post(&url)
            .json(&body)
            .timeout(request.timeout)
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
            .map_err(|e| OrchestratorError::Service(format!("malformed response body: {}", e)))?;

        Ok(Self::parse_response(&json_resp))
    }

    fn name(&self) -> &'static str {
        "ollama"
    }
}
