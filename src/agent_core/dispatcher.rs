//! Dispatcher: turns one model response into tool results.
//!
//! Detection prefers native function calls; only when there are none is the
//! text scanned for fenced JSON call descriptors. Calls then run one at a
//! time, in the order detected, each under its own deadline carved out of
//! the turn's remaining budget. A failing call never aborts the rest of the
//! batch: every call yields exactly one [`ToolResult`].

use std::fmt;
use std::time::{Duration, Instant};

use serde::Serialize;
use uuid::Uuid;

use crate::context::CallContext;
use crate::errors::ErrorKind;
use crate::inference::tool_call_parser::parse_fenced_tool_calls;
use crate::inference::types::{Completion, ToolCall};
use crate::mcp_client::{McpClient, McpError};

// ─── Constants ───────────────────────────────────────────────────────────────

/// Default per-call deadline.
pub const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(60);

/// Maximum payload characters fed back to the model per tool result.
pub const MAX_TOOL_RESULT_CHARS: usize = 6_000;

/// How many similar names to offer for an unknown tool.
const MAX_SUGGESTIONS: usize = 3;

// ─── Types ───────────────────────────────────────────────────────────────────

/// Outcome class of one tool call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ToolStatus {
    Ok,
    ToolError,
    TransportError,
    Timeout,
    NotFound,
    Denied,
}

impl ToolStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ToolStatus::Ok => "ok",
            ToolStatus::ToolError => "tool-error",
            ToolStatus::TransportError => "transport-error",
            ToolStatus::Timeout => "timeout",
            ToolStatus::NotFound => "not-found",
            ToolStatus::Denied => "denied",
        }
    }

    pub fn is_ok(&self) -> bool {
        *self == ToolStatus::Ok
    }
}

impl From<ErrorKind> for ToolStatus {
    fn from(kind: ErrorKind) -> Self {
        match kind {
            ErrorKind::Timeout => ToolStatus::Timeout,
            ErrorKind::NotFound => ToolStatus::NotFound,
            ErrorKind::Denied => ToolStatus::Denied,
            ErrorKind::TransportError | ErrorKind::HandshakeError | ErrorKind::ConfigError => {
                ToolStatus::TransportError
            }
            ErrorKind::ToolError | ErrorKind::LlmError => ToolStatus::ToolError,
        }
    }
}

impl fmt::Display for ToolStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured outcome of one tool call.
#[derive(Debug, Clone, Serialize)]
pub struct ToolResult {
    /// Process-unique id of this invocation.
    pub invocation_id: String,
    /// The model's id for the call it made (native `tool_call_id`).
    pub call_id: String,
    /// Qualified name when the call resolved, otherwise the name as emitted.
    pub tool_name: String,
    pub status: ToolStatus,
    /// Text fed back to the model.
    pub payload: String,
    #[serde(rename = "elapsed_ms", serialize_with = "serialize_millis")]
    pub elapsed: Duration,
}

fn serialize_millis<S>(d: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.serialize_u64(d.as_millis() as u64)
}

// ─── Detection ───────────────────────────────────────────────────────────────

/// Tool calls requested by one completion: native calls if any, otherwise
/// fenced JSON descriptors in the text, otherwise none.
pub fn detect_tool_calls(completion: &Completion) -> Vec<ToolCall> {
    if !completion.tool_calls.is_empty() {
        return completion.tool_calls.clone();
    }
    match completion.content.as_deref() {
        Some(text) => parse_fenced_tool_calls(text),
        None => Vec::new(),
    }
}

// ─── Dispatcher ──────────────────────────────────────────────────────────────

/// Executes detected tool calls against one runtime generation.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    tool_timeout: Duration,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new(DEFAULT_TOOL_TIMEOUT)
    }
}

impl Dispatcher {
    pub fn new(tool_timeout: Duration) -> Self {
        Self { tool_timeout }
    }

    pub fn tool_timeout(&self) -> Duration {
        self.tool_timeout
    }

    /// Execute `calls` sequentially. Returns one result per call, in order.
    pub async fn dispatch(
        &self,
        calls: &[ToolCall],
        tools: &McpClient,
        turn: &CallContext,
    ) -> Vec<ToolResult> {
        let mut results = Vec::with_capacity(calls.len());
        for call in calls {
            results.push(self.dispatch_one(call, tools, turn).await);
        }
        results
    }

    /// Resolve → validate → execute one call.
    pub async fn dispatch_one(
        &self,
        call: &ToolCall,
        tools: &McpClient,
        turn: &CallContext,
    ) -> ToolResult {
        let start = Instant::now();
        let invocation_id = Uuid::new_v4().to_string();

        let finish = |tool_name: &str, status: ToolStatus, payload: String| {
            let elapsed = start.elapsed();
            tracing::info!(
                tool = %tool_name,
                invocation = %invocation_id,
                status = %status,
                elapsed_ms = elapsed.as_millis() as u64,
                "tool call finished"
            );
            ToolResult {
                invocation_id: invocation_id.clone(),
                call_id: call.id.clone(),
                tool_name: tool_name.to_string(),
                status,
                payload: truncate_payload(&payload, tool_name),
                elapsed,
            }
        };

        let tool = match tools.resolve(&call.name) {
            Ok(tool) => tool,
            Err(e) => {
                let payload = match &e {
                    McpError::UnknownTool { .. } => {
                        not_found_payload(&call.name, &tools.registry().find_similar(&call.name, MAX_SUGGESTIONS))
                    }
                    other => other.to_string(),
                };
                return finish(&call.name, ToolStatus::from(e.kind()), payload);
            }
        };

        if turn.is_cancelled() {
            return finish(
                &tool.qualified_name,
                ToolStatus::TransportError,
                "turn cancelled before the call was made".to_string(),
            );
        }

        let ctx = turn.child(self.tool_timeout);
        tracing::debug!(
            tool = %tool.qualified_name,
            server = %tool.server_id,
            deadline_ms = ctx.budget().as_millis() as u64,
            "dispatching tool call"
        );

        match tools.call_tool(&tool, call.arguments.clone(), &ctx).await {
            Ok(result) if result.is_error => {
                finish(&tool.qualified_name, ToolStatus::ToolError, result.text())
            }
            Ok(result) => finish(&tool.qualified_name, ToolStatus::Ok, result.text()),
            Err(e) => finish(&tool.qualified_name, ToolStatus::from(e.kind()), e.to_string()),
        }
    }
}

fn not_found_payload(name: &str, suggestions: &[String]) -> String {
    if suggestions.is_empty() {
        format!("Tool '{name}' does not exist. Use only the tools listed in your instructions.")
    } else {
        format!(
            "Tool '{name}' does not exist. Did you mean: {}?",
            suggestions.join(", ")
        )
    }
}

/// Cap a payload at [`MAX_TOOL_RESULT_CHARS`] characters, cutting on a
/// character boundary and appending a notice.
fn truncate_payload(payload: &str, tool_name: &str) -> String {
    let total = payload.chars().count();
    if total <= MAX_TOOL_RESULT_CHARS {
        return payload.to_string();
    }

    let cut = payload
        .char_indices()
        .nth(MAX_TOOL_RESULT_CHARS)
        .map(|(i, _)| i)
        .unwrap_or(payload.len());
    tracing::warn!(
        tool = %tool_name,
        original_chars = total,
        truncated_to = MAX_TOOL_RESULT_CHARS,
        "tool result truncated"
    );
    format!(
        "{}\n\n[... truncated: showing first {MAX_TOOL_RESULT_CHARS} of {total} chars]",
        &payload[..cut]
    )
}

// ─── Re-prompt Rendering ─────────────────────────────────────────────────────

/// One result as the content of a native `tool` message.
pub fn render_tool_message(result: &ToolResult) -> String {
    if result.status.is_ok() {
        result.payload.clone()
    } else {
        format!("[{}] {}", result.status, result.payload)
    }
}

/// Human-readable serialization of a batch of results for a follow-up
/// prompt.
pub fn render_reprompt(user_text: &str, results: &[ToolResult]) -> String {
    let mut out = format!("The user asked: {user_text}\n\n");
    for result in results {
        if result.status.is_ok() {
            out.push_str(&format!("I used tool {} and got:\n{}\n\n", result.tool_name, result.payload));
        } else {
            out.push_str(&format!(
                "I tried tool {} but it failed ({}):\n{}\n\n",
                result.tool_name, result.status, result.payload
            ));
        }
    }
    out.push_str(
        "Answer the user using only these results. If a tool failed, say so plainly \
         or call a different tool.",
    );
    out
}

// ─── Tests ───────────────────────────────────────────────────────────────────
