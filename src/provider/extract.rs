//! Tool-call extraction from textual completions.
//!
//! Some providers never populate structured `tool_calls` and instead emit
//! `<tool_call>{...}</tool_call>` markup, or a bare JSON array of calls, in
//! the assistant content. This module recovers those calls and strips the
//! markup so the transcript stays clean.

use crate::provider::types::{ResponseMessage, ToolCall};
use once_cell::sync::Lazy;
use regex::Regex;

static TOOL_CALL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)<tool_call>\s*(.*?)\s*</tool_call>").expect("valid regex"));

static THINK_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)<think>.*?</think>").expect("valid regex"));

static JSON_ARRAY_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)\[\s*\{.*\}\s*\]").expect("valid regex"));

/// Remove `<think>…</think>` spans from assistant content.
#[must_use]
pub fn strip_think(content: &str) -> String {
    THINK_RE.replace_all(content, "").trim().to_string()
}

/// Extract tool calls embedded in assistant text.
///
/// Returns the content with every recognized call region removed, plus the
/// recovered calls with synthesized `call_<ts>_<index>` ids.
#[must_use]
pub fn extract_tool_calls(content: &str) -> (String, Vec<ToolCall>) {
    let ts = chrono::Utc::now().timestamp_millis();
    let mut calls = Vec::new();

    for capture in TOOL_CALL_RE.captures_iter(content) {
        let inner = capture.get(1).map_or("", |m| m.as_str());
        if let Ok(value) = serde_json::from_str::<serde_json::Value>(inner)
            && let Some((name, arguments)) = parse_call_object(&value)
        {
            calls.push(ToolCall::new(
                format!("call_{ts}_{}", calls.len()),
                name,
                arguments,
            ));
        }
    }

    if !calls.is_empty() {
        let cleaned = TOOL_CALL_RE.replace_all(content, "").trim().to_string();
        return (cleaned, calls);
    }

    // Fallback: a bare JSON array of call objects. Gated strictly: the array
    // must parse and every element must be an object carrying a name, so
    // arrays appearing in legitimate prose are left alone.
    if content.contains("\"name\"")
        && let Some(found) = JSON_ARRAY_RE.find(content)
        && let Ok(serde_json::Value::Array(items)) =
            serde_json::from_str::<serde_json::Value>(found.as_str())
        && !items.is_empty()
    {
        let parsed: Vec<_> = items.iter().map(parse_call_object).collect();
        if parsed.iter().all(Option::is_some) {
            let calls: Vec<ToolCall> = parsed
                .into_iter()
                .flatten()
                .enumerate()
                .map(|(index, (name, arguments))| {
                    ToolCall::new(format!("call_{ts}_{index}"), name, arguments)
                })
                .collect();
            let mut cleaned = content.to_string();
            cleaned.replace_range(found.range(), "");
            return (cleaned.trim().to_string(), calls);
        }
    }

    (content.to_string(), Vec::new())
}

/// Accept both `{name|function, arguments|parameters}` shapes, including the
/// nested `{"function": {"name", "arguments"}}` variant.
fn parse_call_object(value: &serde_json::Value) -> Option<(String, String)> {
    let obj = value.as_object()?;

    let name = obj
        .get("name")
        .and_then(|v| v.as_str())
        .or_else(|| obj.get("function").and_then(|v| v.as_str()))
        .or_else(|| {
            obj.get("function")
                .and_then(|v| v.get("name"))
                .and_then(|v| v.as_str())
        })?
        .to_string();

    let arguments = obj
        .get("arguments")
        .or_else(|| obj.get("parameters"))
        .or_else(|| obj.get("function").and_then(|v| v.get("arguments")))
        .or_else(|| obj.get("function").and_then(|v| v.get("parameters")));

    let arguments = match arguments {
        Some(serde_json::Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => "{}".to_string(),
    };

    Some((name, arguments))
}

/// Apply textual extraction to a completion's assistant message in place.
///
/// Runs after every non-streaming completion: when no structured calls are
/// present but the content carries call markup, the recovered calls are
/// promoted to `tool_calls` and the markup is stripped. Idempotent.
pub fn normalize_response_message(message: &mut ResponseMessage) {
    let has_structured = message
        .tool_calls
        .as_ref()
        .is_some_and(|calls| !calls.is_empty());
    if has_structured {
        return;
    }

    let Some(content) = &message.content else {
        return;
    };
    if !content.contains("<tool_call>") && !content.contains("\"name\"") {
        return;
    }

    let (cleaned, calls) = extract_tool_calls(content);
    if calls.is_empty() {
        return;
    }
    message.content = Some(cleaned);
    message.tool_calls = Some(calls);
}
