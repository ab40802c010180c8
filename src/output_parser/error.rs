//! Error types for structured output extraction.

/// Why a structured value could not be recovered from model text.
///
/// Malformed output is an expected outcome of an LLM call, so extraction
/// returns this as a tagged result rather than panicking or guessing.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    /// The response was empty or whitespace-only (after reasoning blocks were stripped).
    #[error("empty model response")]
    EmptyResponse,

    /// No `{` appears anywhere in the text.
    #[error("no JSON object found in model response")]
    NoObject,

    /// A `{` was found but its matching `}` never arrived.
    #[error("unbalanced braces: object starting at byte {start} is never closed")]
    Unbalanced {
        /// Byte offset of the opening brace within the searched text.
        start: usize,
    },

    /// A balanced span was found but it is not valid JSON.
    #[error("extracted span is not valid JSON: {reason} (span: {span})")]
    InvalidJson {
        /// The serde error message.
        reason: String,
        /// A truncated copy of the offending span (max 200 chars).
        span: String,
    },

    /// Valid JSON was extracted but did not match the requested type.
    #[error("JSON deserialization failed: {reason}")]
    DeserializationFailed {
        /// The serde error message.
        reason: String,
    },
}

/// Truncate a string to at most `max_chars` characters, appending "..." if truncated.
pub(crate) fn truncate(s: &str, max_chars: usize) -> String {
    match s.char_indices().nth(max_chars) {
        None => s.to_string(),
        Some((idx, _)) => format!("{}...", &s[..idx]),
    }
}
