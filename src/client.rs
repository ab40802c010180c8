//! The canonical resilient model client.
//!
//! [`RetryingClient`] wraps a [`Backend`] with input validation, a shared
//! [`RateLimiter`], a per-call timeout and a [`RetryPolicy`]. Every model
//! call in the crate goes through it.
//!
//! ```text
//! generate() ─► validate ─► limiter slot ─► timeout(backend.complete) ─► check body
//!                               ▲                                           │
//!                               └──── sleep(base * 2^attempt) ◄── retryable error
//! ```

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, warn};

use crate::backend::{Backend, LlmMessage, LlmRequest, LlmResponse, RetryPolicy};
use crate::config::{OrchestratorConfig, RateLimitMode};
use crate::diagnostics::CallDiagnostics;
use crate::error::{OrchestratorError, Result};
use crate::events::{emit, Event, EventHandler};
use crate::output_parser;
use crate::prompt;
use crate::rate_limiter::{RateDecision, RateLimiter};

/// Highest sampling temperature accepted by common providers.
pub const MAX_TEMPERATURE: f64 = 2.0;

/// A successful `generate` call and what it took to get it.
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub response: LlmResponse,
    pub diagnostics: CallDiagnostics,
}

impl Completion {
    pub fn content(&self) -> &str {
        &self.response.content
    }

    /// Tokens billed for this call, including rejected replies that were retried.
    pub fn tokens_used(&self) -> u32 {
        self.response
            .tokens_used
            .saturating_add(self.diagnostics.rejected_tokens)
    }
}

/// A successful `generate_structured` call.
#[derive(Debug, Clone, PartialEq)]
pub struct StructuredCompletion {
    /// The JSON object recovered from the model text.
    pub value: Value,
    /// The raw call it was extracted from.
    pub completion: Completion,
}

/// Resilient client over one backend and one shared rate limiter.
///
/// Cheap to share: wrap it in an `Arc` and hand it to every stage.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use llm_orchestrator::backend::{MockBackend, RetryPolicy};
/// use llm_orchestrator::client::RetryingClient;
/// use llm_orchestrator::rate_limiter::RateLimiter;
///
/// let client = RetryingClient::builder(
///     Arc::new(MockBackend::fixed("hi")),
///     Arc::new(RateLimiter::per_minute(30)),
/// )
/// .policy(RetryPolicy::default())
/// .build();
/// ```
#[derive(Clone)]
pub struct RetryingClient {
    backend: Arc<dyn Backend>,
    limiter: Arc<RateLimiter>,
    policy: RetryPolicy,
    rate_limit_mode: RateLimitMode,
    call_timeout: Duration,
    structured_max_tokens: u32,
    structured_temperature: f64,
    event_handler: Option<Arc<dyn EventHandler>>,
}

impl std::fmt::Debug for RetryingClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryingClient")
            .field("backend", &self.backend.name())
            .field("limiter", &self.limiter)
            .field("policy", &self.policy)
            .field("rate_limit_mode", &self.rate_limit_mode)
            .field("call_timeout", &self.call_timeout)
            .field("has_event_handler", &self.event_handler.is_some())
            .finish()
    }
}

impl RetryingClient {
    /// Start building a client over `backend`, drawing on `limiter`.
    pub fn builder(backend: Arc<dyn Backend>, limiter: Arc<RateLimiter>) -> RetryingClientBuilder {
        RetryingClientBuilder {
            backend,
            limiter,
            policy: None,
            rate_limit_mode: RateLimitMode::default(),
            call_timeout: Duration::from_secs(120),
            structured_max_tokens: 4096,
            structured_temperature: 0.3,
            event_handler: None,
        }
    }

    /// Client with policy, mode, timeout and structured defaults taken from `config`.
    pub fn from_config(
        config: &OrchestratorConfig,
        backend: Arc<dyn Backend>,
        limiter: Arc<RateLimiter>,
    ) -> Self {
        Self::builder(backend, limiter)
            .policy(RetryPolicy::from_config(config))
            .rate_limit_mode(config.rate_limit_mode)
            .call_timeout(config.call_timeout)
            .structured_defaults(config.structured_max_tokens, config.structured_temperature)
            .build()
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Call the model, retrying transient failures per the policy.
    ///
    /// Non-retryable errors are returned as-is. A retryable error that
    /// survives every attempt comes back as
    /// [`OrchestratorError::RetriesExhausted`].
    pub async fn generate(
        &self,
        messages: &[LlmMessage],
        model: &str,
        max_tokens: u32,
        temperature: f64,
    ) -> Result<Completion> {
        validate(messages, model, max_tokens, temperature)?;

        let request = LlmRequest {
            model: model.to_string(),
            messages: messages.to_vec(),
            temperature,
            max_tokens,
            timeout: self.call_timeout,
        };

        let max_attempts = self.policy.max_attempts();
        let mut diagnostics = CallDiagnostics::default();
        let mut last_error: Option<OrchestratorError> = None;

        for attempt in 0..max_attempts {
            if let Some(ref err) = last_error {
                let delay = self.policy.delay_after(attempt - 1, err);
                warn!(
                    backend = self.backend.name(),
                    model,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "retrying model call"
                );
                emit(
                    &self.event_handler,
                    Event::TransportRetry {
                        model: model.to_string(),
                        attempt,
                        delay,
                        reason: err.to_string(),
                    },
                );
                diagnostics.backoff_total += delay;
                tokio::time::sleep(delay).await;
            }

            diagnostics.attempts = attempt + 1;
            self.acquire_slot(model, &mut diagnostics).await?;

            match self.call_once(&request, &mut diagnostics).await {
                Ok(response) => {
                    diagnostics.retries = attempt;
                    debug!(
                        model,
                        tokens = response.tokens_used,
                        retries = attempt,
                        "model call succeeded"
                    );
                    return Ok(Completion {
                        response,
                        diagnostics,
                    });
                }
                Err(err) if self.policy.should_retry(&err) => last_error = Some(err),
                Err(err) => {
                    debug!(model, error = %err, "model call failed without retry");
                    return Err(err);
                }
            }
        }

        let last = last_error.unwrap_or_else(|| {
            OrchestratorError::Service("no attempt was made".to_string())
        });
        warn!(model, attempts = max_attempts, error = %last, "model call retries exhausted");
        Err(OrchestratorError::RetriesExhausted {
            attempts: max_attempts,
            tokens_used: diagnostics.rejected_tokens,
            last: Box::new(last),
        })
    }

    /// Ask for JSON matching `schema_hint` and extract it from the reply.
    ///
    /// Uses the client's structured token budget and temperature. A reply
    /// without a recoverable object is an [`OrchestratorError::Parsing`]
    /// carrying the tokens the call consumed; it is not retried here.
    pub async fn generate_structured(
        &self,
        messages: &[LlmMessage],
        model: &str,
        schema_hint: &str,
    ) -> Result<StructuredCompletion> {
        self.generate_structured_with(
            messages,
            model,
            schema_hint,
            self.structured_max_tokens,
            self.structured_temperature,
        )
        .await
    }

    /// [`generate_structured`](Self::generate_structured) with an explicit budget and temperature.
    pub async fn generate_structured_with(
        &self,
        messages: &[LlmMessage],
        model: &str,
        schema_hint: &str,
        max_tokens: u32,
        temperature: f64,
    ) -> Result<StructuredCompletion> {
        if messages.is_empty() {
            return Err(OrchestratorError::Validation(
                "messages must not be empty".to_string(),
            ));
        }

        let augmented = prompt::with_schema(messages, schema_hint);
        let completion = self
            .generate(&augmented, model, max_tokens, temperature)
            .await?;

        match output_parser::extract(completion.content()) {
            Ok(value) => Ok(StructuredCompletion { value, completion }),
            Err(source) => {
                warn!(model, error = %source, "structured output could not be extracted");
                Err(OrchestratorError::Parsing {
                    source,
                    tokens_used: completion.tokens_used(),
                })
            }
        }
    }

    /// Take a limiter slot, sleeping or failing per the configured mode.
    async fn acquire_slot(&self, model: &str, diagnostics: &mut CallDiagnostics) -> Result<()> {
        loop {
            match self.limiter.try_acquire() {
                RateDecision::Allowed => return Ok(()),
                RateDecision::Limited { wait } => match self.rate_limit_mode {
                    RateLimitMode::FailFast => {
                        debug!(model, wait_ms = wait.as_millis() as u64, "rate limited, failing fast");
                        return Err(OrchestratorError::RateLimit {
                            retry_after: Some(wait),
                        });
                    }
                    RateLimitMode::Wait => {
                        debug!(model, wait_ms = wait.as_millis() as u64, "rate limited, waiting");
                        emit(
                            &self.event_handler,
                            Event::RateLimited {
                                model: model.to_string(),
                                wait,
                            },
                        );
                        diagnostics.rate_limit_wait += wait;
                        tokio::time::sleep(wait).await;
                    }
                },
            }
        }
    }

    /// One bounded transport call plus response sanity checks.
    async fn call_once(
        &self,
        request: &LlmRequest,
        diagnostics: &mut CallDiagnostics,
    ) -> Result<LlmResponse> {
        let response =
            match tokio::time::timeout(self.call_timeout, self.backend.complete(request)).await {
                Err(_elapsed) => return Err(OrchestratorError::Timeout(self.call_timeout)),
                Ok(Err(OrchestratorError::Timeout(d))) if d.is_zero() => {
                    return Err(OrchestratorError::Timeout(self.call_timeout))
                }
                Ok(result) => result?,
            };

        if response.content.trim().is_empty() {
            diagnostics.rejected_tokens = diagnostics
                .rejected_tokens
                .saturating_add(response.tokens_used);
            return Err(OrchestratorError::Service(
                "model returned empty content".to_string(),
            ));
        }
        if response.tokens_used == 0 {
            return Err(OrchestratorError::Service(
                "model response carries no token usage".to_string(),
            ));
        }
        Ok(response)
    }
}

/// Builder for [`RetryingClient`].
pub struct RetryingClientBuilder {
    backend: Arc<dyn Backend>,
    limiter: Arc<RateLimiter>,
    policy: Option<RetryPolicy>,
    rate_limit_mode: RateLimitMode,
    call_timeout: Duration,
    structured_max_tokens: u32,
    structured_temperature: f64,
    event_handler: Option<Arc<dyn EventHandler>>,
}

impl RetryingClientBuilder {
    /// Set the retry policy. Default: [`RetryPolicy::default()`].
    pub fn policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = Some(policy);
        self
    }

    /// Wait for a limiter slot or fail fast. Default: wait.
    pub fn rate_limit_mode(mut self, mode: RateLimitMode) -> Self {
        self.rate_limit_mode = mode;
        self
    }

    /// Bound on one transport call. Default: 120 seconds.
    pub fn call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// Token budget and temperature for `generate_structured`.
    pub fn structured_defaults(mut self, max_tokens: u32, temperature: f64) -> Self {
        self.structured_max_tokens = max_tokens;
        self.structured_temperature = temperature;
        self
    }

    pub fn event_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.event_handler = Some(handler);
        self
    }

    pub fn build(self) -> RetryingClient {
        RetryingClient {
            backend: self.backend,
            limiter: self.limiter,
            policy: self.policy.unwrap_or_default(),
            rate_limit_mode: self.rate_limit_mode,
            call_timeout: self.call_timeout,
            structured_max_tokens: self.structured_max_tokens,
            structured_temperature: self.structured_temperature,
            event_handler: self.event_handler,
        }
    }
}

fn validate(messages: &[LlmMessage], model: &str, max_tokens: u32, temperature: f64) -> Result<()> {
    if messages.is_empty() {
        return Err(OrchestratorError::Validation(
            "messages must not be empty".to_string(),
        ));
    }
    if model.trim().is_empty() {
        return Err(OrchestratorError::Validation(
            "model must not be empty".to_string(),
        ));
    }
    if max_tokens == 0 {
        return Err(OrchestratorError::Validation(
            "max_tokens must be greater than zero".to_string(),
        ));
    }
    if !temperature.is_finite() || !(0.0..=MAX_TEMPERATURE).contains(&temperature) {
        return Err(OrchestratorError::Validation(format!(
            "temperature {} is outside 0.0..={}",
            temperature, MAX_TEMPERATURE
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{MockBackend, MockOutcome};
    use crate::error::ErrorKind;
    use crate::events::EventLog;
    use crate::output_parser::ParseError;
    use tokio::time::Instant;

    fn msgs() -> Vec<LlmMessage> {
        vec![LlmMessage::user("hello")]
    }

    fn client_over(mock: Arc<MockBackend>, policy: RetryPolicy) -> RetryingClient {
        RetryingClient::builder(mock, Arc::new(RateLimiter::per_minute(1000)))
            .policy(policy)
            .call_timeout(Duration::from_secs(5))
            .build()
    }

    #[tokio::test(start_paused = true)]
    async fn test_two_rate_limits_then_success_reports_two_retries() {
        let mock = Arc::new(MockBackend::scripted(vec![
            MockOutcome::RateLimited(None),
            MockOutcome::RateLimited(None),
            MockOutcome::reply("done", 30),
        ]));
        let client = client_over(mock.clone(), RetryPolicy::new(3, Duration::from_secs(1)));

        let completion = client.generate(&msgs(), "m", 100, 0.5).await.unwrap();
        assert_eq!(completion.content(), "done");
        assert_eq!(completion.tokens_used(), 30);
        assert_eq!(completion.diagnostics.retries, 2);
        assert_eq!(completion.diagnostics.attempts, 3);
        assert_eq!(mock.call_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_schedule_is_exponential() {
        let mock = Arc::new(MockBackend::scripted(vec![
            MockOutcome::ServiceError("503".into()),
            MockOutcome::ServiceError("503".into()),
            MockOutcome::ServiceError("503".into()),
            MockOutcome::reply("ok", 5),
        ]));
        let client = client_over(mock.clone(), RetryPolicy::new(4, Duration::from_millis(500)));

        let start = Instant::now();
        let completion = client.generate(&msgs(), "m", 100, 0.5).await.unwrap();
        // 500ms + 1s + 2s
        assert_eq!(completion.diagnostics.backoff_total, Duration::from_millis(3500));
        assert_eq!(start.elapsed(), Duration::from_millis(3500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_wraps_last_error_with_attempt_count() {
        let mock = Arc::new(MockBackend::scripted(vec![MockOutcome::ServiceError(
            "upstream down".into(),
        )]));
        let client = client_over(mock.clone(), RetryPolicy::new(3, Duration::from_secs(1)));

        let err = client.generate(&msgs(), "m", 100, 0.5).await.unwrap_err();
        match err {
            OrchestratorError::RetriesExhausted {
                attempts,
                tokens_used,
                ref last,
            } => {
                assert_eq!(attempts, 3);
                assert_eq!(tokens_used, 0);
                assert!(last.to_string().contains("upstream down"));
            }
            other => panic!("expected RetriesExhausted, got {:?}", other),
        }
        assert_eq!(err.kind(), ErrorKind::Service);
        assert_eq!(mock.call_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_validation_error_from_backend_is_not_retried() {
        let mock = Arc::new(MockBackend::scripted(vec![
            MockOutcome::Rejected("HTTP 400: bad model".into()),
            MockOutcome::reply("never", 1),
        ]));
        let client = client_over(mock.clone(), RetryPolicy::new(5, Duration::from_secs(1)));

        let err = client.generate(&msgs(), "m", 100, 0.5).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::Validation(_)));
        assert_eq!(mock.call_count(), 1);
    }

    #[tokio::test]
    async fn test_invalid_input_fails_before_calling_backend() {
        let mock = Arc::new(MockBackend::fixed("x"));
        let client = client_over(mock.clone(), RetryPolicy::default());

        for result in [
            client.generate(&[], "m", 100, 0.5).await,
            client.generate(&msgs(), "", 100, 0.5).await,
            client.generate(&msgs(), "m", 0, 0.5).await,
            client.generate(&msgs(), "m", 100, -0.1).await,
            client.generate(&msgs(), "m", 100, f64::NAN).await,
            client.generate(&msgs(), "m", 100, 2.5).await,
        ] {
            assert_eq!(result.unwrap_err().kind(), ErrorKind::Validation);
        }
        assert_eq!(mock.call_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hanging_backend_times_out_and_retries() {
        let mock = Arc::new(MockBackend::scripted(vec![
            MockOutcome::Hang,
            MockOutcome::reply("late but fine", 8),
        ]));
        let client = client_over(mock.clone(), RetryPolicy::new(2, Duration::from_secs(1)));

        let start = Instant::now();
        let completion = client.generate(&msgs(), "m", 100, 0.5).await.unwrap();
        assert_eq!(completion.content(), "late but fine");
        // 5s timeout + 1s backoff
        assert_eq!(start.elapsed(), Duration::from_secs(6));
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_attempt_timeout_is_exhausted_timeout() {
        let mock = Arc::new(MockBackend::scripted(vec![MockOutcome::Hang]));
        let client = client_over(mock, RetryPolicy::none());

        let err = client.generate(&msgs(), "m", 100, 0.5).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert!(matches!(
            err,
            OrchestratorError::RetriesExhausted { attempts: 1, .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_or_unmetered_response_is_retried() {
        let mock = Arc::new(MockBackend::scripted(vec![
            MockOutcome::reply("   ", 10),
            MockOutcome::reply("no usage", 0),
            MockOutcome::reply("good", 10),
        ]));
        let client = client_over(mock.clone(), RetryPolicy::new(3, Duration::from_millis(10)));

        let completion = client.generate(&msgs(), "m", 100, 0.5).await.unwrap();
        assert_eq!(completion.content(), "good");
        assert_eq!(completion.diagnostics.retries, 2);
        assert_eq!(completion.diagnostics.rejected_tokens, 10);
        assert_eq!(completion.tokens_used(), 20);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_reply_tokens_are_billed_on_success() {
        let mock = Arc::new(MockBackend::scripted(vec![
            MockOutcome::reply("", 40),
            MockOutcome::reply("ok", 10),
        ]));
        let client = client_over(mock.clone(), RetryPolicy::new(3, Duration::from_millis(10)));

        let completion = client.generate(&msgs(), "m", 100, 0.5).await.unwrap();
        assert_eq!(completion.content(), "ok");
        assert_eq!(completion.response.tokens_used, 10);
        assert_eq!(completion.tokens_used(), 50);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_reply_tokens_survive_exhaustion() {
        let mock = Arc::new(MockBackend::scripted(vec![MockOutcome::reply("   ", 40)]));
        let client = client_over(mock.clone(), RetryPolicy::new(3, Duration::from_millis(10)));

        let err = client.generate(&msgs(), "m", 100, 0.5).await.unwrap_err();
        assert!(matches!(
            err,
            OrchestratorError::RetriesExhausted { attempts: 3, .. }
        ));
        assert_eq!(err.tokens_used(), 120);
        assert_eq!(mock.call_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_mode_sleeps_for_limiter_slot() {
        let limiter = Arc::new(RateLimiter::per_minute(1));
        assert!(limiter.try_acquire().is_allowed());

        let client = RetryingClient::builder(Arc::new(MockBackend::fixed("ok")), limiter)
            .rate_limit_mode(RateLimitMode::Wait)
            .build();

        let start = Instant::now();
        let completion = client.generate(&msgs(), "m", 100, 0.5).await.unwrap();
        assert_eq!(start.elapsed(), Duration::from_secs(60));
        assert_eq!(completion.diagnostics.rate_limit_wait, Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fail_fast_mode_surfaces_retry_after() {
        let limiter = Arc::new(RateLimiter::per_minute(1));
        assert!(limiter.try_acquire().is_allowed());

        let mock = Arc::new(MockBackend::fixed("ok"));
        let client = RetryingClient::builder(mock.clone(), limiter)
            .rate_limit_mode(RateLimitMode::FailFast)
            .build();

        let err = client.generate(&msgs(), "m", 100, 0.5).await.unwrap_err();
        assert_eq!(err.retry_after(), Some(Duration::from_secs(60)));
        assert_eq!(mock.call_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_events_emitted() {
        let log = Arc::new(EventLog::new());
        let mock = Arc::new(MockBackend::scripted(vec![
            MockOutcome::ServiceError("503".into()),
            MockOutcome::reply("ok", 3),
        ]));
        let client = RetryingClient::builder(mock, Arc::new(RateLimiter::per_minute(10)))
            .policy(RetryPolicy::new(2, Duration::from_secs(2)))
            .event_handler(log.clone())
            .build();

        client.generate(&msgs(), "m", 100, 0.5).await.unwrap();
        let events = log.events();
        assert_eq!(events.len(), 1);
        assert_eq!(
            events[0],
            Event::TransportRetry {
                model: "m".into(),
                attempt: 1,
                delay: Duration::from_secs(2),
                reason: "model service error: 503".into(),
            }
        );
    }

    #[tokio::test]
    async fn test_generate_structured_extracts_object() {
        let mock = Arc::new(MockBackend::scripted(vec![MockOutcome::reply(
            "Sure:\n```json\n{\"title\": \"Engineer\", \"skills\": [\"rust\"]}\n```",
            42,
        )]));
        let client = client_over(mock.clone(), RetryPolicy::default());

        let out = client
            .generate_structured(&msgs(), "m", r#"{"title": "string", "skills": ["string"]}"#)
            .await
            .unwrap();
        assert_eq!(out.value["title"], "Engineer");
        assert_eq!(out.completion.tokens_used(), 42);

        let sent = &mock.requests()[0];
        assert!(sent.messages[0].content.contains("\"skills\""));
        assert_eq!(sent.max_tokens, 4096);
    }

    #[tokio::test]
    async fn test_generate_structured_parse_failure_keeps_tokens() {
        let mock = Arc::new(MockBackend::scripted(vec![MockOutcome::reply(
            "I cannot do that.",
            17,
        )]));
        let client = client_over(mock.clone(), RetryPolicy::default());

        let err = client.generate_structured(&msgs(), "m", "{}").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Parsing);
        assert_eq!(err.tokens_used(), 17);
        assert!(matches!(
            err,
            OrchestratorError::Parsing {
                source: ParseError::NoObject,
                ..
            }
        ));
        assert_eq!(mock.call_count(), 1);
    }
}
