//! Tool call parsing: normalizes model output to `ToolCall` structs.
//!
//! Two shapes are recognized:
//!
//! 1. **native**: OpenAI `tool_calls` objects. The arguments arrive as a
//!    JSON-encoded string that may be empty or slightly malformed.
//!
//! 2. **fenced JSON**: a fenced code block in the text content holding an
//!    object with a tool name and an arguments object:
//!    ````text
//!    ```json
//!    {"name": "fs_read_file", "arguments": {"path": "/tmp/a"}}
//!    ```
//!    ````
//!    A block holding an array of such objects yields one call per element.

use serde_json::{Map, Value};
use uuid::Uuid;

use super::types::ToolCall;

/// Keys accepted for the tool name in a fenced call, in priority order.
const NAME_KEYS: &[&str] = &["name", "tool", "tool_name"];

/// Keys accepted for the arguments in a fenced call, in priority order.
const ARGUMENT_KEYS: &[&str] = &["arguments", "args", "parameters", "input"];

// ─── Native Calls ────────────────────────────────────────────────────────────

/// Build a `ToolCall` from a native function call.
///
/// Empty arguments become `{}`. Malformed JSON is repaired when possible;
/// otherwise the raw text is kept as a string value so argument validation
/// reports it instead of the call silently vanishing.
pub fn parse_native_tool_call(id: Option<&str>, name: &str, arguments_json: &str) -> ToolCall {
    let arguments = if arguments_json.trim().is_empty() {
        Value::Object(Map::new())
    } else {
        repair_malformed_tool_call_json(arguments_json).unwrap_or_else(|| {
            tracing::warn!(tool = name, raw = arguments_json, "unparseable tool call arguments");
            Value::String(arguments_json.to_string())
        })
    };

    ToolCall {
        id: id
            .filter(|s| !s.is_empty())
            .map(String::from)
            .unwrap_or_else(new_call_id),
        name: name.trim().to_string(),
        arguments,
    }
}

pub fn new_call_id() -> String {
    format!("call_{}", Uuid::new_v4())
}

// ─── Fenced JSON ─────────────────────────────────────────────────────────────

/// A fenced block found in text: byte range of the whole fence and its body.
struct Fence<'a> {
    start: usize,
    end: usize,
    body: &'a str,
}

/// Find every fenced block (```` ``` ````, optional info string) in `text`.
/// An unterminated trailing fence is ignored.
fn find_fences(text: &str) -> Vec<Fence<'_>> {
    let mut fences = Vec::new();
    let mut cursor = 0;

    while let Some(open_rel) = text[cursor..].find("```") {
        let start = cursor + open_rel;
        let after_ticks = start + 3;
        // The info string runs to the end of the line.
        let body_start = match text[after_ticks..].find('\n') {
            Some(nl) => after_ticks + nl + 1,
            None => break,
        };
        let Some(close_rel) = text[body_start..].find("```") else {
            break;
        };
        let body_end = body_start + close_rel;
        let end = body_end + 3;
        fences.push(Fence {
            start,
            end,
            body: &text[body_start..body_end],
        });
        cursor = end;
    }

    fences
}

/// Extract tool calls from fenced JSON blocks, in order of appearance.
/// Blocks that are not JSON, or JSON without both a name and arguments,
/// are ignored.
pub fn parse_fenced_tool_calls(text: &str) -> Vec<ToolCall> {
    find_fences(text)
        .iter()
        .flat_map(|fence| calls_in_block(fence.body))
        .collect()
}

/// `text` with every tool-call fence removed and whitespace trimmed.
pub fn strip_fenced_tool_calls(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut cursor = 0;
    for fence in find_fences(text) {
        if calls_in_block(fence.body).is_empty() {
            continue;
        }
        out.push_str(&text[cursor..fence.start]);
        cursor = fence.end;
    }
    out.push_str(&text[cursor..]);
    out.trim().to_string()
}

fn calls_in_block(body: &str) -> Vec<ToolCall> {
    let Some(value) = repair_malformed_tool_call_json(body.trim()) else {
        return Vec::new();
    };
    match value {
        Value::Array(items) => items.iter().filter_map(call_from_object).collect(),
        other => call_from_object(&other).into_iter().collect(),
    }
}

fn call_from_object(value: &Value) -> Option<ToolCall> {
    let obj = value.as_object()?;

    // OpenAI-style nesting: {"function": {"name": ..., "arguments": ...}}
    if let Some(inner) = obj.get("function").filter(|f| f.is_object()) {
        return call_from_object(inner);
    }

    let name = NAME_KEYS
        .iter()
        .find_map(|k| obj.get(*k).and_then(Value::as_str))
        .map(str::trim)
        .filter(|n| !n.is_empty())?;
    let arguments = ARGUMENT_KEYS.iter().find_map(|k| obj.get(*k))?;

    let arguments = match arguments {
        Value::String(encoded) => parse_native_tool_call(None, name, encoded).arguments,
        Value::Null => Value::Object(Map::new()),
        other => other.clone(),
    };

    Some(ToolCall {
        id: obj
            .get("id")
            .and_then(Value::as_str)
            .map(String::from)
            .unwrap_or_else(new_call_id),
        name: name.to_string(),
        arguments,
    })
}

// ─── Malformed JSON Repair ───────────────────────────────────────────────────

/// Attempt to repair malformed JSON arguments from a model tool call.
///
/// Common malformations:
/// 1. Doubled quote before a value: `"key":""value"`
/// 2. Trailing commas: `{"a":1,}`
/// 3. Missing closing braces
/// 4. Raw control characters inside strings
///
/// Returns `Some(value)` if repair succeeds, `None` if irreparable.
pub fn repair_malformed_tool_call_json(raw: &str) -> Option<Value> {
    if let Ok(v) = serde_json::from_str::<Value>(raw) {
        return Some(v);
    }

    let repairs: [fn(&str) -> String; 4] = [
        repair_double_quotes,
        repair_trailing_commas,
        repair_unbalanced_braces,
        repair_control_characters,
    ];

    let mut repaired = raw.to_string();
    for repair in repairs {
        repaired = repair(&repaired);
        if let Ok(v) = serde_json::from_str::<Value>(&repaired) {
            return Some(v);
        }
    }
    None
}

/// Collapse `:""x` to `:"x` when `x` starts a value. An empty string is
/// followed by whitespace, `,`, `}` or `]` and is left alone.
fn repair_double_quotes(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut result = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        if i + 3 < bytes.len()
            && bytes[i] == b':'
            && bytes[i + 1] == b'"'
            && bytes[i + 2] == b'"'
            && !matches!(bytes[i + 3], b',' | b'}' | b']')
            && !bytes[i + 3].is_ascii_whitespace()
        {
            result.extend_from_slice(b":\"");
            i += 3;
            continue;
        }
        result.push(bytes[i]);
        i += 1;
    }

    String::from_utf8(result).unwrap_or_else(|_| input.to_string())
}

/// Remove trailing commas before `}` or `]`.
fn repair_trailing_commas(input: &str) -> String {
    let chars: Vec<char> = input.chars().collect();
    let mut result = String::with_capacity(input.len());

    for (i, &ch) in chars.iter().enumerate() {
        if ch == ',' {
            let next = chars[i + 1..].iter().find(|c| !c.is_whitespace());
            if matches!(next, Some('}') | Some(']')) {
                continue;
            }
        }
        result.push(ch);
    }

    result
}

/// Append closing braces to balance unmatched opening braces.
fn repair_unbalanced_braces(input: &str) -> String {
    let mut depth: i32 = 0;
    let mut in_string = false;
    let mut escape_next = false;

    for ch in input.chars() {
        if escape_next {
            escape_next = false;
            continue;
        }
        match ch {
            '\\' if in_string => escape_next = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => depth -= 1,
            _ => {}
        }
    }

    let mut result = input.to_string();
    for _ in 0..depth.max(0) {
        result.push('}');
    }
    result
}

/// Drop control characters other than `\n`, `\r`, `\t`.
fn repair_control_characters(input: &str) -> String {
    input
        .chars()
        .filter(|&c| !c.is_control() || c == '\n' || c == '\r' || c == '\t')
        .collect()
}

// ─── Tests ───────────────────────────────────────────────────────────────────
