//! Call diagnostics: what the client went through to get an answer.
//!
//! [`CallDiagnostics`] is attached to every [`Completion`](crate::client::Completion).
//! It records how many attempts were made, how long was spent in backoff,
//! and how long the call queued behind the shared rate limiter.

use std::time::Duration;

/// Records what happened during one client call.
///
/// # Example
///
/// ```
/// use llm_orchestrator::diagnostics::CallDiagnostics;
///
/// let diag = CallDiagnostics::default();
/// assert!(diag.first_try());
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallDiagnostics {
    /// Attempts made, including the successful one.
    pub attempts: u32,

    /// Retries before success. 0 = first attempt succeeded.
    pub retries: u32,

    /// Total time spent in backoff delays.
    pub backoff_total: Duration,

    /// Total time spent waiting for a rate-limiter slot.
    pub rate_limit_wait: Duration,

    /// Tokens billed for replies that were rejected (empty content) and retried.
    pub rejected_tokens: u32,
}

impl CallDiagnostics {
    /// Quick check: did the first attempt succeed?
    pub fn first_try(&self) -> bool {
        self.retries == 0
    }

    /// Time spent not talking to the model.
    pub fn overhead(&self) -> Duration {
        self.backoff_total + self.rate_limit_wait
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_diagnostics_default() {
        let d = CallDiagnostics::default();
        assert!(d.first_try());
        assert_eq!(d.attempts, 0);
        assert_eq!(d.overhead(), Duration::ZERO);
    }

    #[test]
    fn test_overhead_sums_waits() {
        let d = CallDiagnostics {
            attempts: 3,
            retries: 2,
            backoff_total: Duration::from_secs(3),
            rate_limit_wait: Duration::from_millis(500),
            rejected_tokens: 0,
        };
        assert!(!d.first_try());
        assert_eq!(d.overhead(), Duration::from_millis(3500));
    }
}
