//! Retry policy: which failures to retry and how long to wait between attempts.
//!
//! [`RetryPolicy`] is an immutable value handed to the client at construction.
//! Delays grow as `base_delay * 2^attempt`, capped at `max_delay`, with
//! optional jitter for fleets sharing one provider quota.

use std::collections::HashMap;
use std::time::Duration;

use crate::config::OrchestratorConfig;
use crate::error::{ErrorKind, OrchestratorError};

/// What to do with a failure of a given [`ErrorKind`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry,
    FailFast,
}

/// Jitter strategy to prevent thundering herd on shared rate limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum JitterStrategy {
    /// Delay is exactly the calculated value.
    #[default]
    None,
    /// Random value in `[0, calculated_delay]`.
    Full,
    /// `calculated_delay/2 + random in [0, calculated_delay/2]`.
    Equal,
}

/// Retry budget, backoff curve and error classification table.
///
/// # Example
///
/// ```
/// use llm_orchestrator::backend::RetryPolicy;
/// use std::time::Duration;
///
/// let policy = RetryPolicy::new(3, Duration::from_secs(1));
/// assert_eq!(policy.delay_for_attempt(0), Duration::from_secs(1));
/// assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(4));
/// ```
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first. Never below 1.
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
    jitter: JitterStrategy,
    /// Wait at least as long as a provider `Retry-After` hint asks.
    respect_retry_after: bool,
    classification: HashMap<ErrorKind, RetryDecision>,
}

impl RetryPolicy {
    /// Retry timeouts, throttling and service errors up to `max_attempts` total attempts.
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        let classification = HashMap::from([
            (ErrorKind::Timeout, RetryDecision::Retry),
            (ErrorKind::RateLimit, RetryDecision::Retry),
            (ErrorKind::Service, RetryDecision::Retry),
            (ErrorKind::Validation, RetryDecision::FailFast),
            (ErrorKind::Parsing, RetryDecision::FailFast),
            (ErrorKind::Other, RetryDecision::FailFast),
        ]);
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay: Duration::from_secs(30),
            jitter: JitterStrategy::None,
            respect_retry_after: true,
            classification,
        }
    }

    /// A single attempt, no retries.
    pub fn none() -> Self {
        Self::new(1, Duration::ZERO)
    }

    pub fn from_config(config: &OrchestratorConfig) -> Self {
        Self::new(config.max_attempts, config.base_delay).with_max_delay(config.max_delay)
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    pub fn with_jitter(mut self, jitter: JitterStrategy) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn with_respect_retry_after(mut self, respect: bool) -> Self {
        self.respect_retry_after = respect;
        self
    }

    /// Override the decision for one error kind. `Validation` always fails fast.
    pub fn classify(mut self, kind: ErrorKind, decision: RetryDecision) -> Self {
        if kind != ErrorKind::Validation {
            self.classification.insert(kind, decision);
        }
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn base_delay(&self) -> Duration {
        self.base_delay
    }

    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }

    pub fn decision_for(&self, kind: ErrorKind) -> RetryDecision {
        self.classification
            .get(&kind)
            .copied()
            .unwrap_or(RetryDecision::FailFast)
    }

    /// Whether `error` may be retried (budget permitting).
    pub fn should_retry(&self, error: &OrchestratorError) -> bool {
        let kind = error.kind();
        kind != ErrorKind::Validation && self.decision_for(kind) == RetryDecision::Retry
    }

    /// Backoff after failed attempt `attempt` (0-indexed): `base_delay * 2^attempt`,
    /// capped at `max_delay`, then jittered.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.base_delay.as_secs_f64() * 2f64.powi(attempt.min(63) as i32);
        let capped = base.min(self.max_delay.as_secs_f64());

        let jittered = match self.jitter {
            JitterStrategy::None => capped,
            JitterStrategy::Full => fastrand::f64() * capped,
            JitterStrategy::Equal => capped / 2.0 + fastrand::f64() * (capped / 2.0),
        };

        // Float rounding near Duration::MAX can overflow; clamp to the ceiling.
        Duration::try_from_secs_f64(jittered).map_or(self.max_delay, |d| d.min(self.max_delay))
    }

    /// Delay before retrying after `error` on `attempt`, honouring a `Retry-After` hint.
    pub fn delay_after(&self, attempt: u32, error: &OrchestratorError) -> Duration {
        let computed = self.delay_for_attempt(attempt);
        match error.retry_after() {
            Some(hint) if self.respect_retry_after => computed.max(hint).min(self.max_delay),
            _ => computed,
        }
    }
}

impl Default for RetryPolicy {
    /// Three attempts, 1s base delay, 30s ceiling.
    fn default() -> Self {
        Self::new(3, Duration::from_secs(1))
    }
}
