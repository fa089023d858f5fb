//! Reply normalization.
//!
//! The chat endpoint has answered with several body shapes over time. This
//! module classifies a body into one [`ReplyShape`] and reduces it to the
//! ordered text fragments a conversation view shows as separate messages.

use serde_json::{Map, Value};

/// Label used when a pipeline step carries no `stepType`.
pub const DEFAULT_STEP_LABEL: &str = "Step";

/// Recognized reply body shapes, in detection priority order.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplyShape {
    /// The body is a bare string.
    Text(String),
    /// `{ "result": "..." }`.
    Legacy(String),
    /// `{ "choices": [{ "message": { "content": "..." } }] }`.
    ChatCompletion(String),
    /// `{ "result": [ step, ... ] }` pipeline trace.
    Pipeline(Vec<Value>),
    /// Anything else; rendered as indented JSON.
    Unrecognized(Value),
}

impl ReplyShape {
    /// Classify a reply body. First match wins.
    #[must_use]
    pub fn detect(payload: &Value) -> Self {
        if let Value::String(text) = payload {
            return Self::Text(text.clone());
        }

        if let Some(Value::String(text)) = payload.get("result") {
            return Self::Legacy(text.clone());
        }

        if let Some(content) = payload
            .pointer("/choices/0/message/content")
            .and_then(Value::as_str)
            .filter(|content| !content.is_empty())
        {
            return Self::ChatCompletion(content.to_string());
        }

        if let Some(Value::Array(steps)) = payload.get("result") {
            return Self::Pipeline(steps.clone());
        }

        Self::Unrecognized(payload.clone())
    }

    /// Reduce this shape to display fragments.
    #[must_use]
    pub fn into_fragments(self) -> Vec<String> {
        let fragments = match self {
            Self::Text(text) | Self::Legacy(text) | Self::ChatCompletion(text) => vec![text],
            Self::Pipeline(steps) => steps.iter().map(summarize_step).collect(),
            Self::Unrecognized(payload) => vec![to_pretty_json(&payload)],
        };
        fragments
            .into_iter()
            .filter(|fragment| !fragment.trim().is_empty())
            .collect()
    }
}

/// Normalize a reply body into ordered, non-blank display fragments.
#[must_use]
pub fn extract_fragments(payload: &Value) -> Vec<String> {
    ReplyShape::detect(payload).into_fragments()
}

/// Summarize one pipeline step record (`stepType`, `output`).
#[must_use]
pub fn summarize_step(step: &Value) -> String {
    let label = step
        .get("stepType")
        .and_then(Value::as_str)
        .filter(|label| !label.is_empty())
        .unwrap_or(DEFAULT_STEP_LABEL);
    let output = unwrap_nested_json(step.get("output").cloned().unwrap_or(Value::Null));

    if let Value::String(text) = &output {
        return text.trim().to_string();
    }

    if let Some(Value::Object(_) | Value::Array(_)) = output.get("Value") {
        return summarize_tool_result(label, &output);
    }

    format!("[{label}] {}", to_pretty_json(&output))
}

/// Parse text that holds a JSON object or array; leave everything else alone.
///
/// When the parsed object has a textual `Value` field that itself holds a
/// JSON object or array, that field is replaced by its parsed form. Nesting
/// below that second level stays as text.
#[must_use]
pub fn unwrap_nested_json(value: Value) -> Value {
    let Value::String(text) = value else {
        return value;
    };
    let Some(mut parsed) = parse_structured(&text) else {
        return Value::String(text);
    };

    if let Value::Object(fields) = &mut parsed
        && let Some(Value::String(inner)) = fields.get("Value")
        && let Some(inner_parsed) = parse_structured(inner)
    {
        fields.insert("Value".to_string(), inner_parsed);
    }
    parsed
}

fn parse_structured(text: &str) -> Option<Value> {
    match serde_json::from_str::<Value>(text) {
        Ok(parsed @ (Value::Object(_) | Value::Array(_))) => Some(parsed),
        _ => None,
    }
}

fn summarize_tool_result(label: &str, output: &Value) -> String {
    let key_suffix = output
        .get("Key")
        .filter(|key| is_truthy(key))
        .map(|key| match key {
            Value::String(key) => format!(" {key}"),
            other => format!(" {other}"),
        })
        .unwrap_or_default();

    let value = output.get("Value");
    let status = if value
        .and_then(|value| value.get("isError"))
        .is_some_and(is_truthy)
    {
        "(error)"
    } else {
        "(ok)"
    };

    let text_parts: Vec<&str> = value
        .and_then(|value| value.get("content"))
        .and_then(Value::as_array)
        .map(|parts| parts.iter().filter_map(text_part).collect())
        .unwrap_or_default();

    if text_parts.is_empty() {
        format!("[{label}]{key_suffix} {status}")
    } else {
        format!("[{label}]{key_suffix} {status}\n{}", text_parts.join("\n"))
    }
}

fn text_part(part: &Value) -> Option<&str> {
    let part: &Map<String, Value> = part.as_object()?;
    if part.get("type").and_then(Value::as_str) != Some("text") {
        return None;
    }
    part.get("text")
        .and_then(Value::as_str)
        .filter(|text| !text.is_empty())
}

/// JavaScript-style truthiness for JSON values.
fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(flag) => *flag,
        Value::Number(number) => number.as_f64().is_some_and(|n| n != 0.0 && !n.is_nan()),
        Value::String(text) => !text.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

fn to_pretty_json(value: &Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck::quickcheck;
    use serde_json::json;

    #[test]
    fn plain_string_is_a_single_fragment() {
        assert_eq!(extract_fragments(&json!("hello")), vec!["hello"]);
    }

    #[test]
    fn legacy_result_string() {
        assert_eq!(extract_fragments(&json!({"result": "hi"})), vec!["hi"]);
    }

    #[test]
    fn chat_completion_content() {
        let payload = json!({"choices": [{"message": {"content": "x"}}]});
        assert_eq!(
            ReplyShape::detect(&payload),
            ReplyShape::ChatCompletion("x".to_string())
        );
        assert_eq!(extract_fragments(&payload), vec!["x"]);
    }

    #[test]
    fn empty_chat_completion_content_falls_through_to_fallback() {
        let payload = json!({"choices": [{"message": {"content": ""}}]});
        assert!(matches!(
            ReplyShape::detect(&payload),
            ReplyShape::Unrecognized(_)
        ));
    }

    #[test]
    fn empty_pipeline_yields_no_fragments() {
        assert!(extract_fragments(&json!({"result": []})).is_empty());
    }

    #[test]
    fn pipeline_tool_result_with_text_parts() {
        let output = r#"{"Key":"k","Value":{"isError":false,"content":[{"type":"text","text":"done"}]}}"#;
        let payload = json!({"result": [{"stepType": "search", "output": output}]});
        assert_eq!(extract_fragments(&payload), vec!["[search] k (ok)\ndone"]);
    }

    #[test]
    fn pipeline_preserves_order_and_drops_blank_steps() {
        let payload = json!({
            "$type": "objectArray",
            "result": [
                {"stepType": "input", "output": "  first  "},
                {"stepType": "noop", "output": "   "},
                {"stepType": "answer", "output": "second"}
            ]
        });
        assert_eq!(extract_fragments(&payload), vec!["first", "second"]);
    }

    #[test]
    fn numeric_text_output_is_returned_trimmed_without_label() {
        assert_eq!(summarize_step(&json!({"stepType": "calc", "output": " 42 "})), "42");
    }

    #[test]
    fn tool_result_error_status_without_text() {
        let step = json!({
            "stepType": "email",
            "output": {"Key": "send", "Value": {"isError": true, "content": [{"type": "image"}]}}
        });
        assert_eq!(summarize_step(&step), "[email] send (error)");
    }

    #[test]
    fn tool_result_without_key_has_no_suffix() {
        let step = json!({
            "output": r#"{"Value":"{\"content\":[{\"type\":\"text\",\"text\":\"a\"},{\"type\":\"text\",\"text\":\"\"},{\"type\":\"text\",\"text\":\"b\"}]}"}"#
        });
        assert_eq!(summarize_step(&step), "[Step] (ok)\na\nb");
    }

    #[test]
    fn unstructured_object_output_is_pretty_printed_with_label() {
        let step = json!({"stepType": "plan", "output": {"steps": 2}});
        assert_eq!(summarize_step(&step), "[plan] {\n  \"steps\": 2\n}");
    }

    #[test]
    fn missing_output_renders_null() {
        assert_eq!(summarize_step(&json!({"stepType": "x"})), "[x] null");
    }

    #[test]
    fn unknown_shape_is_pretty_printed() {
        let payload = json!({"status": "queued", "id": 3});
        assert_eq!(
            extract_fragments(&payload),
            vec!["{\n  \"status\": \"queued\",\n  \"id\": 3\n}"]
        );
    }

    #[test]
    fn non_object_payloads_fall_back_without_panicking() {
        assert_eq!(extract_fragments(&json!(12)), vec!["12"]);
        assert_eq!(extract_fragments(&json!(null)), vec!["null"]);
        assert_eq!(extract_fragments(&json!([1])), vec!["[\n  1\n]"]);
    }

    #[test]
    fn unwrap_parses_value_field_exactly_once() {
        let inner = json!({"deep": "{\"x\":1}"}).to_string();
        let outer = json!({"Key": "k", "Value": inner}).to_string();
        let unwrapped = unwrap_nested_json(Value::String(outer));
        assert_eq!(unwrapped["Value"]["deep"], json!("{\"x\":1}"));
    }

    #[test]
    fn unwrap_keeps_unparseable_value_field_as_text() {
        let outer = json!({"Key": "k", "Value": "not json"}).to_string();
        let unwrapped = unwrap_nested_json(Value::String(outer));
        assert_eq!(unwrapped["Value"], json!("not json"));
    }

    #[test]
    fn unwrap_leaves_non_text_untouched() {
        let value = json!({"Value": "{\"a\":1}"});
        assert_eq!(unwrap_nested_json(value.clone()), value);
    }

    quickcheck! {
        fn unwrap_is_identity_on_non_structured_text(text: String) -> bool {
            if parse_structured(&text).is_some() {
                return true;
            }
            unwrap_nested_json(Value::String(text.clone())) == Value::String(text)
        }
    }
}
