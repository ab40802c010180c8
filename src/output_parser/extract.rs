//! Low-level extraction strategies for model output.
//!
//! Everything here works on borrowed slices of the response and never
//! allocates a modified copy of the structured value itself, so the span
//! handed to the JSON parser is byte-for-byte what the model wrote.

/// Strip reasoning blocks, then trim whitespace.
pub fn preprocess(text: &str) -> String {
    strip_think_tags(text).trim().to_string()
}

/// Strip all `<think>...</think>` and `<thinking>...</thinking>` blocks from text.
///
/// An unclosed block swallows the rest of the text.
///
/// # Examples
///
/// ```
/// use llm_orchestrator::output_parser::strip_think_tags;
///
/// assert_eq!(strip_think_tags("<think>hmm</think>{\"a\": 1}"), "{\"a\": 1}");
/// assert_eq!(strip_think_tags("<thinking>no close"), "");
/// ```
pub fn strip_think_tags(text: &str) -> String {
    let result = strip_tag_variant(text, "<think>", "</think>");
    strip_tag_variant(&result, "<thinking>", "</thinking>")
}

fn strip_tag_variant(text: &str, open: &str, close: &str) -> String {
    let mut result = text.to_string();
    while let Some(start) = result.find(open) {
        match result[start..].find(close) {
            Some(end_offset) => {
                let end = start + end_offset + close.len();
                result.replace_range(start..end, "");
            }
            None => {
                result.truncate(start);
                break;
            }
        }
    }
    result
}

/// A complete fenced code block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FencedBlock<'a> {
    /// Language tag on the opening fence, empty when there is none.
    pub tag: &'a str,
    /// Trimmed text between the fences.
    pub content: &'a str,
}

/// Return every complete fenced code block, in order.
///
/// The opening fence may carry a language tag (`` ```json ``) or none.
/// An opening fence without a closing one ends the scan.
///
/// # Examples
///
/// ```
/// use llm_orchestrator::output_parser::extract::fenced_blocks;
///
/// let input = "```rust\nlet x = 1;\n```\nthen\n```json\n{\"a\": 1}\n```";
/// let blocks = fenced_blocks(input);
/// assert_eq!(blocks.len(), 2);
/// assert_eq!(blocks[1].tag, "json");
/// assert_eq!(blocks[1].content, "{\"a\": 1}");
/// ```
pub fn fenced_blocks(text: &str) -> Vec<FencedBlock<'_>> {
    let mut blocks = Vec::new();
    let mut pos = 0;

    while let Some(offset) = text[pos..].find("```") {
        let after_backticks = pos + offset + 3;

        // Language tag runs to the end of the fence line. A fence with content
        // on the same line and no newline (```{"a":1}```) has no tag.
        let rest = &text[after_backticks..];
        let (tag, content_start) = match rest.find('\n') {
            Some(line_end) if is_language_tag(&rest[..line_end]) => {
                (rest[..line_end].trim(), after_backticks + line_end + 1)
            }
            _ => ("", after_backticks),
        };

        let Some(close_offset) = text[content_start..].find("```") else {
            break;
        };
        let close = content_start + close_offset;
        blocks.push(FencedBlock {
            tag,
            content: text[content_start..close].trim(),
        });
        pos = close + 3;
    }
    blocks
}

/// Return the content of the first complete fenced code block.
///
/// # Examples
///
/// ```
/// use llm_orchestrator::output_parser::extract::fenced_block;
///
/// let input = "Here:\n```json\n{\"a\": 1}\n```\nbye";
/// assert_eq!(fenced_block(input), Some("{\"a\": 1}"));
/// ```
pub fn fenced_block(text: &str) -> Option<&str> {
    fenced_blocks(text).first().map(|block| block.content)
}

fn is_language_tag(s: &str) -> bool {
    let s = s.trim();
    s.is_empty()
        || s.chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '+' | '.'))
}

/// Outcome of scanning for a balanced object span.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectSpan<'a> {
    /// The exact text from the first `{` to its matching `}`.
    Found(&'a str),
    /// There is no `{` in the text.
    Missing,
    /// The first `{` (at this byte offset) is never closed.
    Unclosed(usize),
}

/// Find the first `{` and return the span up to its matching `}`.
///
/// Depth counting skips braces inside JSON string literals, honouring
/// backslash escapes, so `{"a": "}"}` is returned whole.
///
/// # Examples
///
/// ```
/// use llm_orchestrator::output_parser::extract::{first_object_span, ObjectSpan};
///
/// let input = r#"Result: {"a": {"b": "}"}} trailing"#;
/// assert_eq!(first_object_span(input), ObjectSpan::Found(r#"{"a": {"b": "}"}}"#));
/// ```
pub fn first_object_span(text: &str) -> ObjectSpan<'_> {
    let Some(start) = text.find('{') else {
        return ObjectSpan::Missing;
    };

    let mut depth: usize = 0;
    let mut in_string = false;
    let mut escape_next = false;

    for (i, ch) in text[start..].char_indices() {
        if escape_next {
            escape_next = false;
            continue;
        }
        if in_string {
            match ch {
                '\\' => escape_next = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    let end = start + i;
                    return ObjectSpan::Found(&text[start..=end]);
                }
            }
            _ => {}
        }
    }

    ObjectSpan::Unclosed(start)
}
