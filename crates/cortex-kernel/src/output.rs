//! Structured-output parsing.
//!
//! Reasoners are asked for a list of named action calls, but real models
//! wrap that list in many ways.  [`parse_invocations`] accepts:
//!
//! - `{"actions": [...]}` (also `tool_calls`),
//! - a bare array of calls,
//! - a single call object,
//! - a JSON string holding any of the above (fences and prose around it are
//!   tolerated, see [`extract_json`]).
//!
//! For each call the action name is taken from `action`, `name`, `type`, or
//! an OpenAI-style `function.name`.  Arguments come from `arguments`, `args`
//! or `parameters` (an object or a JSON-encoded object); when none of these
//! keys is present the remaining keys of the call are used.  A call whose
//! name or arguments cannot be recovered is dropped on its own and recorded
//! in [`ParsedOutput::dropped`].

use cortex_types::{ActionInvocation, CortexError};
use serde_json::{Map, Value};
use tracing::warn;

const NAME_KEYS: [&str; 3] = ["action", "name", "type"];
const ARGUMENT_KEYS: [&str; 3] = ["arguments", "args", "parameters"];
const ENVELOPE_KEYS: [&str; 2] = ["actions", "tool_calls"];

/// Invocations recovered from one Reasoner response.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedOutput {
    pub invocations: Vec<ActionInvocation>,
    /// Why each unrecoverable item was dropped.
    pub dropped: Vec<String>,
}

/// Parse a Reasoner response into action invocations.
///
/// `null` and empty strings parse as "no actions".
///
/// # Errors
///
/// [`CortexError::ReasonerFailed`] when the response as a whole is not a
/// recognisable envelope (e.g. a number, or prose with no JSON inside).
pub fn parse_invocations(response: &Value) -> Result<ParsedOutput, CortexError> {
    let items = match response {
        Value::Null => return Ok(ParsedOutput::default()),
        Value::String(text) if text.trim().is_empty() => return Ok(ParsedOutput::default()),
        Value::String(text) => {
            let inner = extract_json(text).ok_or_else(|| {
                CortexError::ReasonerFailed(format!("response is not JSON: {}", preview(text)))
            })?;
            if inner.is_string() {
                return Err(CortexError::ReasonerFailed(
                    "response is a doubly-encoded string".into(),
                ));
            }
            return parse_invocations(&inner);
        }
        Value::Array(items) => items.clone(),
        Value::Object(map) => match ENVELOPE_KEYS.iter().find_map(|k| map.get(*k)) {
            Some(Value::Array(items)) => items.clone(),
            Some(Value::Null) => Vec::new(),
            Some(other) => vec![other.clone()],
            None => vec![response.clone()],
        },
        other => {
            return Err(CortexError::ReasonerFailed(format!(
                "unexpected response shape: {}",
                preview(&other.to_string())
            )));
        }
    };

    let mut parsed = ParsedOutput::default();
    for (index, item) in items.iter().enumerate() {
        match parse_item(item) {
            Ok(invocation) => parsed.invocations.push(invocation),
            Err(reason) => {
                warn!(index, %reason, "dropping malformed action call");
                parsed.dropped.push(reason);
            }
        }
    }
    Ok(parsed)
}

fn parse_item(item: &Value) -> Result<ActionInvocation, String> {
    let item = match item {
        Value::String(text) => extract_json(text).ok_or_else(|| format!("not a call: {}", preview(text)))?,
        other => other.clone(),
    };
    let map = match item {
        Value::Object(map) => map,
        other => return Err(format!("not an object: {}", preview(&other.to_string()))),
    };

    if let Some(Value::Object(function)) = map.get("function") {
        let name = function
            .get("name")
            .and_then(Value::as_str)
            .filter(|n| !n.trim().is_empty())
            .ok_or("function call without a name")?;
        let arguments = decode_arguments(function.get("arguments"))?;
        return Ok(ActionInvocation::new(name.trim(), arguments));
    }

    let (name_key, name) = NAME_KEYS
        .iter()
        .find_map(|key| {
            map.get(*key)
                .and_then(Value::as_str)
                .filter(|n| !n.trim().is_empty())
                .map(|n| (*key, n.trim().to_string()))
        })
        .ok_or("call without an action name")?;

    let arguments = match ARGUMENT_KEYS.iter().find_map(|k| map.get(*k)) {
        Some(raw) => decode_arguments(Some(raw))?,
        None => map
            .iter()
            .filter(|(k, _)| k.as_str() != name_key)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect(),
    };
    Ok(ActionInvocation::new(name, arguments))
}

fn decode_arguments(raw: Option<&Value>) -> Result<Map<String, Value>, String> {
    match raw {
        None | Some(Value::Null) => Ok(Map::new()),
        Some(Value::Object(map)) => Ok(map.clone()),
        Some(Value::String(text)) if text.trim().is_empty() => Ok(Map::new()),
        Some(Value::String(text)) => match serde_json::from_str::<Value>(text) {
            Ok(Value::Object(map)) => Ok(map),
            _ => Err(format!("arguments are not an object: {}", preview(text))),
        },
        Some(other) => Err(format!("arguments are not an object: {other}")),
    }
}

/// Pull a JSON value out of free text.
///
/// Tries, in order: the whole text, the body of the first Markdown code fence,
/// and the span from the first `[`/`{` to the matching last `]`/`}`.
pub fn extract_json(text: &str) -> Option<Value> {
    let trimmed = text.trim();
    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        return Some(value);
    }

    if let Some(body) = fenced_body(trimmed) {
        if let Ok(value) = serde_json::from_str::<Value>(body.trim()) {
            return Some(value);
        }
    }

    for (open, close) in [('[', ']'), ('{', '}')] {
        if let (Some(start), Some(end)) = (trimmed.find(open), trimmed.rfind(close)) {
            if start < end {
                if let Ok(value) = serde_json::from_str::<Value>(&trimmed[start..=end]) {
                    return Some(value);
                }
            }
        }
    }
    None
}

fn fenced_body(text: &str) -> Option<&str> {
    let start = text.find("```")?;
    let after = &text[start + 3..];
    // Skip an info string such as `json`.
    let body_start = after.find('\n').map(|i| i + 1).unwrap_or(0);
    let body = &after[body_start..];
    let end = body.find("```")?;
    Some(&body[..end])
}

fn preview(text: &str) -> String {
    const LIMIT: usize = 80;
    if text.chars().count() <= LIMIT {
        text.to_string()
    } else {
        let cut: String = text.chars().take(LIMIT).collect();
        format!("{cut}…")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn names(parsed: &ParsedOutput) -> Vec<&str> {
        parsed.invocations.iter().map(|i| i.action_name.as_str()).collect()
    }

    #[test]
    fn bare_array() {
        let parsed =
            parse_invocations(&json!([{"action": "speak", "arguments": {"text": "hi"}}])).unwrap();
        assert_eq!(parsed.invocations.len(), 1);
        assert_eq!(parsed.invocations[0].to_string(), r#"speak(text="hi")"#);
    }

    #[test]
    fn actions_envelope() {
        let parsed = parse_invocations(&json!({
            "actions": [{"action": "sit"}, {"name": "wag", "args": {"times": 2}}]
        }))
        .unwrap();
        assert_eq!(names(&parsed), vec!["sit", "wag"]);
        assert!(parsed.invocations[0].arguments.is_empty());
        assert_eq!(parsed.invocations[1].argument("times"), Some(&json!(2)));
    }

    #[test]
    fn single_object() {
        let parsed = parse_invocations(&json!({"type": "stop", "parameters": {}})).unwrap();
        assert_eq!(names(&parsed), vec!["stop"]);
    }

    #[test]
    fn empty_responses() {
        assert!(parse_invocations(&json!([])).unwrap().invocations.is_empty());
        assert!(parse_invocations(&Value::Null).unwrap().invocations.is_empty());
        assert!(parse_invocations(&json!({"actions": []})).unwrap().invocations.is_empty());
        assert!(parse_invocations(&json!("")).unwrap().invocations.is_empty());
    }

    #[test]
    fn json_string_envelope_with_fence() {
        let text = "Sure!\n```json\n[{\"action\": \"speak\", \"arguments\": {\"text\": \"hi\"}}]\n```";
        let parsed = parse_invocations(&json!(text)).unwrap();
        assert_eq!(names(&parsed), vec!["speak"]);
    }

    #[test]
    fn openai_function_call_with_string_arguments() {
        let parsed = parse_invocations(&json!({
            "tool_calls": [{
                "type": "function",
                "function": {"name": "move", "arguments": "{\"distance\": 1.0}"}
            }]
        }))
        .unwrap();
        assert_eq!(names(&parsed), vec!["move"]);
        assert_eq!(parsed.invocations[0].argument("distance"), Some(&json!(1.0)));
    }

    #[test]
    fn flat_arguments_are_collected() {
        let parsed = parse_invocations(&json!([{"action": "speak", "text": "hi"}])).unwrap();
        assert_eq!(parsed.invocations[0].argument("text"), Some(&json!("hi")));
        assert_eq!(parsed.invocations[0].argument("action"), None);
    }

    #[test]
    fn bad_items_are_dropped_individually() {
        let parsed = parse_invocations(&json!([
            {"action": "speak", "arguments": {"text": "hi"}},
            {"arguments": {"text": "nameless"}},
            42,
            {"action": "wag", "arguments": "not json"},
            {"action": "sit"}
        ]))
        .unwrap();
        assert_eq!(names(&parsed), vec!["speak", "sit"]);
        assert_eq!(parsed.dropped.len(), 3);
    }

    #[test]
    fn unrecognisable_response_is_an_error() {
        assert!(matches!(
            parse_invocations(&json!(17)),
            Err(CortexError::ReasonerFailed(_))
        ));
        assert!(matches!(
            parse_invocations(&json!("I would rather not.")),
            Err(CortexError::ReasonerFailed(_))
        ));
    }

    #[test]
    fn extract_json_from_prose() {
        let value = extract_json("Here you go: {\"action\": \"sit\"} hope that helps").unwrap();
        assert_eq!(value, json!({"action": "sit"}));
        assert!(extract_json("nothing here").is_none());
    }
}
