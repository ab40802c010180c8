//! Externally supplied settings for the client, limiter and runner.
//!
//! Nothing in the crate hard-codes a model, a retry budget or a quota:
//! everything flows from an [`OrchestratorConfig`], built in code or loaded
//! from `LLM_*` environment variables (and an optional `.env` file).

use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, Context};

use crate::error::{OrchestratorError, Result};

/// What the client does when the shared limiter has no free slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RateLimitMode {
    /// Sleep for the wait the limiter reports, then try again.
    #[default]
    Wait,
    /// Return `RateLimit { retry_after }` immediately.
    FailFast,
}

impl FromStr for RateLimitMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "wait" | "block" => Ok(RateLimitMode::Wait),
            "fail_fast" | "fail-fast" | "reject" => Ok(RateLimitMode::FailFast),
            other => Err(anyhow!("unknown rate limit mode '{}'", other)),
        }
    }
}

/// Settings shared by [`RetryingClient`](crate::client::RetryingClient),
/// [`RateLimiter`](crate::rate_limiter::RateLimiter) and
/// [`PipelineRunner`](crate::runner::PipelineRunner).
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Base URL of the OpenAI-compatible provider.
    pub base_url: String,
    /// Bearer token for the provider, if it needs one.
    pub api_key: Option<String>,
    /// Model used by stages without an entry in `stage_models`.
    pub default_model: String,
    /// Model per stage name.
    pub stage_models: HashMap<String, String>,
    /// Total attempts per call, including the first. Minimum 1.
    pub max_attempts: u32,
    /// First backoff delay; attempt `n` waits `base_delay * 2^n`.
    pub base_delay: Duration,
    /// Ceiling on a single backoff delay.
    pub max_delay: Duration,
    /// Shared quota across every generation using the same limiter.
    pub requests_per_minute: u32,
    /// Bound on one transport call.
    pub call_timeout: Duration,
    pub rate_limit_mode: RateLimitMode,
    /// Token budget for `generate_structured` calls.
    pub structured_max_tokens: u32,
    /// Sampling temperature for `generate_structured` calls.
    pub structured_temperature: f64,
    /// Cap on generations executing at once. `None` = unbounded.
    pub max_concurrent_generations: Option<usize>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com".to_string(),
            api_key: None,
            default_model: "gpt-4o-mini".to_string(),
            stage_models: HashMap::new(),
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            requests_per_minute: 30,
            call_timeout: Duration::from_secs(120),
            rate_limit_mode: RateLimitMode::Wait,
            structured_max_tokens: 4096,
            structured_temperature: 0.3,
            max_concurrent_generations: None,
        }
    }
}

impl OrchestratorConfig {
    /// Load from the process environment, reading `.env` first if present.
    ///
    /// Unset variables keep their [`Default`] value; malformed ones are errors.
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok(); // .env is optional
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary key lookup (used by `from_env` and tests).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let mut config = Self::default();

        if let Some(url) = lookup("LLM_BASE_URL") {
            config.base_url = url;
        }
        config.api_key = lookup("LLM_API_KEY").filter(|k| !k.is_empty());
        if let Some(model) = lookup("LLM_MODEL") {
            config.default_model = model;
        }
        if let Some(raw) = lookup("LLM_STAGE_MODELS") {
            config.stage_models = parse_stage_models(&raw)?;
        }
        if let Some(n) = parse_var::<u32>(&lookup, "LLM_MAX_ATTEMPTS")? {
            config.max_attempts = n;
        }
        if let Some(ms) = parse_var::<u64>(&lookup, "LLM_BASE_DELAY_MS")? {
            config.base_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var::<u64>(&lookup, "LLM_MAX_DELAY_MS")? {
            config.max_delay = Duration::from_millis(ms);
        }
        if let Some(rpm) = parse_var::<u32>(&lookup, "LLM_REQUESTS_PER_MINUTE")? {
            config.requests_per_minute = rpm;
        }
        if let Some(secs) = parse_var::<u64>(&lookup, "LLM_TIMEOUT_SECS")? {
            config.call_timeout = Duration::from_secs(secs);
        }
        if let Some(mode) = parse_var::<RateLimitMode>(&lookup, "LLM_RATE_LIMIT_MODE")? {
            config.rate_limit_mode = mode;
        }
        if let Some(tokens) = parse_var::<u32>(&lookup, "LLM_STRUCTURED_MAX_TOKENS")? {
            config.structured_max_tokens = tokens;
        }
        if let Some(temp) = parse_var::<f64>(&lookup, "LLM_STRUCTURED_TEMPERATURE")? {
            config.structured_temperature = temp;
        }
        config.max_concurrent_generations = parse_var::<usize>(&lookup, "LLM_MAX_CONCURRENT")?;

        config.validate()?;
        Ok(config)
    }

    /// Reject settings that would make the client unusable.
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(OrchestratorError::InvalidConfig(
                "max_attempts must be at least 1".to_string(),
            ));
        }
        if self.requests_per_minute == 0 {
            return Err(OrchestratorError::InvalidConfig(
                "requests_per_minute must be at least 1".to_string(),
            ));
        }
        if self.call_timeout.is_zero() {
            return Err(OrchestratorError::InvalidConfig(
                "call_timeout must be non-zero".to_string(),
            ));
        }
        if self.max_delay < self.base_delay {
            return Err(OrchestratorError::InvalidConfig(format!(
                "max_delay ({:?}) is shorter than base_delay ({:?})",
                self.max_delay, self.base_delay
            )));
        }
        if self.max_concurrent_generations == Some(0) {
            return Err(OrchestratorError::InvalidConfig(
                "max_concurrent_generations must be at least 1 when set".to_string(),
            ));
        }
        Ok(())
    }

    /// Model for the named stage, falling back to `default_model`.
    pub fn model_for_stage(&self, stage: &str) -> &str {
        self.stage_models
            .get(stage)
            .map(String::as_str)
            .unwrap_or(&self.default_model)
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    pub fn with_default_model(mut self, model: impl Into<String>) -> Self {
        self.default_model = model.into();
        self
    }

    pub fn with_stage_model(mut self, stage: impl Into<String>, model: impl Into<String>) -> Self {
        self.stage_models.insert(stage.into(), model.into());
        self
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_requests_per_minute(mut self, rpm: u32) -> Self {
        self.requests_per_minute = rpm;
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn with_rate_limit_mode(mut self, mode: RateLimitMode) -> Self {
        self.rate_limit_mode = mode;
        self
    }

    pub fn with_max_concurrent_generations(mut self, n: usize) -> Self {
        self.max_concurrent_generations = Some(n);
        self
    }
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> anyhow::Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| anyhow!("{}", e))
            .with_context(|| format!("{} has an invalid value '{}'", key, raw)),
    }
}

/// Parse `stage=model` pairs separated by commas.
fn parse_stage_models(raw: &str) -> anyhow::Result<HashMap<String, String>> {
    raw.split(',')
        .map(str::trim)
        .filter(|pair| !pair.is_empty())
        .map(|pair| -> anyhow::Result<(String, String)> {
            let (stage, model) = pair
                .split_once('=')
                .with_context(|| format!("LLM_STAGE_MODELS entry '{}' is not stage=model", pair))?;
            Ok((stage.trim().to_string(), model.trim().to_string()))
        })
        .collect()
}
