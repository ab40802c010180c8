use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

use crate::output_parser::ParseError;
use crate::record::GenerationStatus;

/// Coarse classification of a failure, used by [`RetryPolicy`](crate::backend::backoff::RetryPolicy)
/// to decide between retrying and failing fast.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Bad caller input or a 4xx-equivalent rejection (other than 429).
    Validation,
    /// Throttled by the local limiter or by the backend (429-equivalent).
    RateLimit,
    /// No response within the per-call bound.
    Timeout,
    /// Backend-side failure (5xx-equivalent) or a malformed/empty response.
    Service,
    /// Structured output could not be extracted from model text.
    Parsing,
    /// Everything else: state, persistence and configuration errors.
    Other,
}

/// Errors produced by the client, the pipeline and the runner.
#[derive(Error, Debug)]
pub enum OrchestratorError {
    /// Bad caller input. Never retried.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Throttled, either by the shared limiter or by the backend.
    #[error("rate limited (retry after {retry_after:?})")]
    RateLimit {
        /// How long the caller should wait before trying again, when known.
        retry_after: Option<Duration>,
    },

    /// The backend did not answer within the configured timeout.
    #[error("model call timed out after {0:?}")]
    Timeout(Duration),

    /// Backend failure: 5xx status, transport error, or malformed/empty body.
    #[error("model service error: {0}")]
    Service(String),

    /// Output extraction failed on an otherwise successful call.
    #[error("could not extract structured output: {source}")]
    Parsing {
        /// The extractor's reason.
        #[source]
        source: ParseError,
        /// Tokens spent on the call whose output could not be parsed.
        tokens_used: u32,
    },

    /// A retryable error persisted through every allowed attempt.
    #[error("giving up after {attempts} attempts: {last}")]
    RetriesExhausted {
        /// Total attempts made, including the first.
        attempts: u32,
        /// Tokens billed for replies that were rejected along the way.
        tokens_used: u32,
        /// The last classified error.
        last: Box<OrchestratorError>,
    },

    /// No generation record with this id.
    #[error("generation {0} not found")]
    NotFound(Uuid),

    /// The generation has not reached a terminal state yet.
    #[error("generation {id} is not ready (status: {status})")]
    NotReady { id: Uuid, status: GenerationStatus },

    /// A state-machine transition was requested from the wrong state.
    #[error("cannot {action} a generation in state {from}")]
    InvalidTransition {
        from: GenerationStatus,
        action: &'static str,
    },

    /// The generation finished in `Failed`; carries its reason.
    #[error("generation failed: {0}")]
    GenerationFailed(String),

    /// The generation was cancelled cooperatively.
    #[error("generation was cancelled")]
    Cancelled,

    /// The persistence port rejected or failed an operation.
    #[error("repository error: {0}")]
    Repository(String),

    /// Invalid configuration or stage plan.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Catch-all for other errors.
    #[error("{0}")]
    Other(String),
}

impl OrchestratorError {
    /// Classify this error. `RetriesExhausted` reports the kind of the error it wraps.
    pub fn kind(&self) -> ErrorKind {
        match self {
            OrchestratorError::Validation(_) => ErrorKind::Validation,
            OrchestratorError::RateLimit { .. } => ErrorKind::RateLimit,
            OrchestratorError::Timeout(_) => ErrorKind::Timeout,
            OrchestratorError::Service(_) => ErrorKind::Service,
            OrchestratorError::Parsing { .. } => ErrorKind::Parsing,
            OrchestratorError::RetriesExhausted { last, .. } => last.kind(),
            _ => ErrorKind::Other,
        }
    }

    /// Tokens already consumed by the operation that produced this error.
    ///
    /// Parse failures carry the tokens of the unparseable reply. Exhausted
    /// retries carry the tokens of every billed reply that was rejected.
    pub fn tokens_used(&self) -> u32 {
        match self {
            OrchestratorError::Parsing { tokens_used, .. } => *tokens_used,
            OrchestratorError::RetriesExhausted {
                tokens_used, last, ..
            } => tokens_used.saturating_add(last.tokens_used()),
            _ => 0,
        }
    }

    /// The retry-after hint, if this is (or wraps) a rate-limit error.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            OrchestratorError::RateLimit { retry_after } => *retry_after,
            OrchestratorError::RetriesExhausted { last, .. } => last.retry_after(),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for OrchestratorError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            OrchestratorError::Timeout(Duration::ZERO)
        } else if err.is_builder() {
            OrchestratorError::Validation(err.to_string())
        } else {
            OrchestratorError::Service(err.to_string())
        }
    }
}

impl From<serde_json::Error> for OrchestratorError {
    fn from(err: serde_json::Error) -> Self {
        OrchestratorError::Service(format!("malformed response body: {}", err))
    }
}

impl From<anyhow::Error> for OrchestratorError {
    fn from(err: anyhow::Error) -> Self {
        OrchestratorError::Other(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;
