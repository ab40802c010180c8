//! Prompt building: placeholder substitution and schema instructions.

use std::collections::BTreeMap;

use crate::backend::{LlmMessage, Role};

/// Build a prompt string with variable substitution.
///
/// Replaces `{key}` placeholders with values from `vars`. The special
/// `{input}` placeholder is replaced by `input`. Unknown placeholders are
/// left untouched, and substituted values are never scanned again, so
/// model output fed into a later prompt is inserted verbatim.
///
/// Use `{{` to insert a literal `{` and `}}` to insert a literal `}`.
///
/// # Example
///
/// ```
/// use std::collections::BTreeMap;
/// use llm_orchestrator::prompt::render;
///
/// let vars = BTreeMap::from([("name".to_string(), "Alice".to_string())]);
/// let result = render("Hello {name}, here is JSON: {{\"key\": \"val\"}}", "data", &vars);
/// assert_eq!(result, r#"Hello Alice, here is JSON: {"key": "val"}"#);
/// ```
pub fn render(template: &str, input: &str, vars: &BTreeMap<String, String>) -> String {
    let mut rendered = String::with_capacity(template.len() + input.len());
    let mut rest = template;

    while let Some(pos) = rest.find(|c| c == '{' || c == '}') {
        rendered.push_str(&rest[..pos]);
        let tail = &rest[pos..];

        if tail.starts_with("{{") {
            rendered.push('{');
            rest = &tail[2..];
            continue;
        }
        if tail.starts_with("}}") {
            rendered.push('}');
            rest = &tail[2..];
            continue;
        }
        if let Some(close) = tail.strip_prefix('{').and_then(|t| t.find('}')) {
            let key = &tail[1..1 + close];
            let value = match key {
                "input" => Some(input),
                _ => vars.get(key).map(String::as_str),
            };
            if let Some(value) = value {
                rendered.push_str(value);
                rest = &tail[close + 2..];
                continue;
            }
        }

        // A lone brace or an unknown placeholder: keep the brace, move on.
        rendered.push_str(&tail[..1]);
        rest = &tail[1..];
    }

    rendered.push_str(rest);
    rendered
}

/// The instruction appended to a structured request.
pub fn schema_instruction(schema_hint: &str) -> String {
    format!(
        "Respond with a single JSON object matching this schema:\n{}\n\
         Return only the JSON object, without commentary.",
        schema_hint.trim()
    )
}

/// Append the schema instruction to the last user message.
///
/// A conversation without a user message gets a new one at the end.
pub fn with_schema(messages: &[LlmMessage], schema_hint: &str) -> Vec<LlmMessage> {
    let mut augmented = messages.to_vec();
    let instruction = schema_instruction(schema_hint);

    match augmented.iter_mut().rev().find(|m| m.role == Role::User) {
        Some(last_user) => {
            last_user.content.push_str("\n\n");
            last_user.content.push_str(&instruction);
        }
        None => augmented.push(LlmMessage::user(instruction)),
    }
    augmented
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_render_basic() {
        let result = render("Hello {name}, process {input}", "data", &vars(&[("name", "Alice")]));
        assert_eq!(result, "Hello Alice, process data");
    }

    #[test]
    fn test_render_unknown_placeholder_untouched() {
        let result = render("Keep {missing} as is", "x", &BTreeMap::new());
        assert_eq!(result, "Keep {missing} as is");
    }

    #[test]
    fn test_render_escaped_braces_no_substitution() {
        let result = render(
            "Output format: {{\"result\": {{\"value\": 42}}}}",
            "data",
            &BTreeMap::new(),
        );
        assert_eq!(result, r#"Output format: {"result": {"value": 42}}"#);
    }

    #[test]
    fn test_render_mixed_escaped_and_placeholder() {
        let result = render(
            "Type is {schema}, format: {{\"type\": \"object\"}}",
            "x",
            &vars(&[("schema", "string")]),
        );
        assert_eq!(result, r#"Type is string, format: {"type": "object"}"#);
    }

    #[test]
    fn test_with_schema_appends_to_last_user_message() {
        let messages = vec![
            LlmMessage::system("You are terse."),
            LlmMessage::user("first"),
            LlmMessage::assistant("ok"),
            LlmMessage::user("second"),
        ];
        let augmented = with_schema(&messages, r#"{"title": "string"}"#);

        assert_eq!(augmented.len(), 4);
        assert_eq!(augmented[1].content, "first");
        assert!(augmented[3].content.starts_with("second\n\n"));
        assert!(augmented[3].content.contains(r#"{"title": "string"}"#));
        // Input is not mutated.
        assert_eq!(messages[3].content, "second");
    }

    #[test]
    fn test_with_schema_without_user_message() {
        let augmented = with_schema(&[LlmMessage::system("sys")], "{}");
        assert_eq!(augmented.len(), 2);
        assert_eq!(augmented[1].role, Role::User);
    }

    #[test]
    fn test_substituted_values_are_not_rescanned() {
        let result = render(
            "Refine {draft} for {input}",
            "a {draft} request",
            &vars(&[("draft", r#"{"note": "see {input}"}"#)]),
        );
        assert_eq!(
            result,
            r#"Refine {"note": "see {input}"} for a {draft} request"#
        );
    }

    #[test]
    fn test_lone_braces_kept() {
        assert_eq!(render("a } b { c", "x", &BTreeMap::new()), "a } b { c");
        assert_eq!(render("{ {input}", "x", &BTreeMap::new()), "{ x");
    }
}
