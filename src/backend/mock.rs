//! Mock backend for testing without a live LLM.
//!
//! [`MockBackend`] plays back a script of [`MockOutcome`]s in order, so
//! retry, throttling and timeout paths can be driven deterministically.
//!
//! # Example
//!
//! ```
//! use llm_orchestrator::backend::{MockBackend, MockOutcome};
//!
//! let mock = MockBackend::fixed(r#"{"ok": true}"#);
//! let flaky = MockBackend::scripted(vec![
//!     MockOutcome::RateLimited(None),
//!     MockOutcome::reply("done", 12),
//! ]);
//! ```

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use super::{Backend, LlmRequest, LlmResponse};
use crate::error::{OrchestratorError, Result};

/// One scripted reaction of a [`MockBackend`].
#[derive(Debug, Clone, PartialEq)]
pub enum MockOutcome {
    /// Answer with this text and token count.
    Reply { content: String, tokens_used: u32 },
    /// 429-equivalent.
    RateLimited(Option<Duration>),
    /// 5xx-equivalent.
    ServiceError(String),
    /// 4xx-equivalent.
    Rejected(String),
    /// Never answer; the client's timeout has to fire.
    Hang,
}

impl MockOutcome {
    pub fn reply(content: impl Into<String>, tokens_used: u32) -> Self {
        MockOutcome::Reply {
            content: content.into(),
            tokens_used,
        }
    }
}

/// A test backend that plays back scripted outcomes.
///
/// Outcomes are consumed in order; once the script runs out the last entry
/// repeats. Routes added with [`respond_when`](Self::respond_when) take
/// precedence and do not advance the script.
#[derive(Debug)]
pub struct MockBackend {
    script: Vec<MockOutcome>,
    routes: Vec<(String, MockOutcome)>,
    index: AtomicUsize,
    latency: Duration,
    calls: Mutex<Vec<LlmRequest>>,
}

impl MockBackend {
    /// Create a mock backend that plays `script` in order.
    ///
    /// An empty script behaves like a backend that returns an empty body.
    pub fn scripted(script: Vec<MockOutcome>) -> Self {
        Self {
            script,
            routes: Vec::new(),
            index: AtomicUsize::new(0),
            latency: Duration::ZERO,
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Canned text replies in order, each reporting 10 tokens.
    pub fn new(responses: Vec<String>) -> Self {
        Self::scripted(
            responses
                .into_iter()
                .map(|text| MockOutcome::reply(text, 10))
                .collect(),
        )
    }

    /// Create a mock that always returns the same response.
    pub fn fixed(response: impl Into<String>) -> Self {
        Self::new(vec![response.into()])
    }

    /// Use `outcome` whenever any message in the request contains `needle`.
    pub fn respond_when(mut self, needle: impl Into<String>, outcome: MockOutcome) -> Self {
        self.routes.push((needle.into(), outcome));
        self
    }

    /// Sleep this long before answering each call.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Number of calls received so far.
    pub fn call_count(&self) -> usize {
        self.lock_calls().len()
    }

    /// Every request received so far, in arrival order.
    pub fn requests(&self) -> Vec<LlmRequest> {
        self.lock_calls().clone()
    }

    fn lock_calls(&self) -> std::sync::MutexGuard<'_, Vec<LlmRequest>> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn next_outcome(&self, request: &LlmRequest) -> Option<MockOutcome> {
        let routed = self.routes.iter().find(|(needle, _)| {
            request
                .messages
                .iter()
                .any(|m| m.content.contains(needle.as_str()))
        });
        if let Some((_, outcome)) = routed {
            return Some(outcome.clone());
        }

        let idx = self.index.fetch_add(1, Ordering::Relaxed);
        self.script
            .get(idx)
            .or_else(|| self.script.last())
            .cloned()
    }
}

#[async_trait]
impl Backend for MockBackend {
    async fn complete(&self, request: &LlmRequest) -> Result<LlmResponse> {
        self.lock_calls().push(request.clone());

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        match self.next_outcome(request) {
            Some(MockOutcome::Reply {
                content,
                tokens_used,
            }) => Ok(LlmResponse {
                content,
                tokens_used,
                finish_reason: Some("stop".to_string()),
            }),
            Some(MockOutcome::RateLimited(retry_after)) => {
                Err(OrchestratorError::RateLimit { retry_after })
            }
            Some(MockOutcome::ServiceError(msg)) => Err(OrchestratorError::Service(msg)),
            Some(MockOutcome::Rejected(msg)) => Err(OrchestratorError::Validation(msg)),
            Some(MockOutcome::Hang) => futures::future::pending::<Result<LlmResponse>>().await,
            None => Ok(LlmResponse {
                content: String::new(),
                tokens_used: 0,
                finish_reason: None,
            }),
        }
    }

    fn name(&self) -> &'static str {
        "mock"
    }
}
