//! Structured value extraction from free-form model text.
//!
//! [`extract`] is the single entry point used by the client: it is pure,
//! deterministic and never returns a partially-parsed value.

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::output_parser::error::{truncate, ParseError};
use crate::output_parser::extract::{
    fenced_blocks, first_object_span, preprocess, FencedBlock, ObjectSpan,
};

/// Recover a single JSON object from arbitrary model text.
///
/// Steps:
/// 1. Strip `<think>` blocks and surrounding whitespace.
/// 2. If fenced code blocks containing `{` are present, search only inside
///    one: the first tagged `json`, else the first whose object parses,
///    else the first of them.
/// 3. Take the span from the first `{` to its matching `}`.
/// 4. Parse the span; any syntax error is reported, never repaired.
///
/// # Examples
///
/// ```
/// use llm_orchestrator::output_parser::extract;
///
/// let text = "Sure, here you go:\n```json\n{\"a\": {\"b\": 1}}\n```\nHope that helps!";
/// let value = extract(text).unwrap();
/// assert_eq!(value["a"]["b"], 1);
/// ```
pub fn extract(text: &str) -> Result<Value, ParseError> {
    let span = extract_span(text)?;
    serde_json::from_str::<Value>(&span).map_err(|e| ParseError::InvalidJson {
        reason: e.to_string(),
        span: truncate(&span, 200),
    })
}

/// Return the exact text of the object [`extract`] would parse, without parsing it.
pub fn extract_span(text: &str) -> Result<String, ParseError> {
    let cleaned = preprocess(text);
    if cleaned.is_empty() {
        return Err(ParseError::EmptyResponse);
    }

    match first_object_span(object_region(&cleaned)) {
        ObjectSpan::Found(span) => Ok(span.to_string()),
        ObjectSpan::Missing => Err(ParseError::NoObject),
        ObjectSpan::Unclosed(start) => Err(ParseError::Unbalanced { start }),
    }
}

fn object_region(cleaned: &str) -> &str {
    let blocks: Vec<FencedBlock<'_>> = fenced_blocks(cleaned)
        .into_iter()
        .filter(|block| block.content.contains('{'))
        .collect();

    blocks
        .iter()
        .find(|block| block.tag.eq_ignore_ascii_case("json"))
        .or_else(|| blocks.iter().find(|block| parses(block.content)))
        .or_else(|| blocks.first())
        .map_or(cleaned, |block| block.content)
}

fn parses(region: &str) -> bool {
    matches!(
        first_object_span(region),
        ObjectSpan::Found(span) if serde_json::from_str::<Value>(span).is_ok()
    )
}

/// Extract and deserialize into a typed value.
pub fn extract_as<T: DeserializeOwned>(text: &str) -> Result<T, ParseError> {
    let value = extract(text)?;
    serde_json::from_value(value).map_err(|e| ParseError::DeserializationFailed {
        reason: e.to_string(),
    })
}
