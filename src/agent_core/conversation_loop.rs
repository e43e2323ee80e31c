//! Conversation Loop: one user turn from message to final reply.
//!
//! The loop:
//! 1. Record the user message in the thread's history ring
//! 2. Render system prompt + tool schemas + history + user text
//! 3. Call the LLM; detect tool calls in its response
//! 4. Dispatch the calls, feed the results back, and call the LLM again
//! 5. Stop when the LLM answers without tool calls, or after
//!    `max_tool_rounds` rounds of tools
//!
//! Every blocking step runs under the turn's [`CallContext`], so a reload or
//! shutdown cancels the LLM call or the tool call that is in flight.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::context::CallContext;
use crate::frontend::{ChatFrontend, IncomingMessage};
use crate::inference::config::ToolCallFormat;
use crate::inference::tool_call_parser::strip_fenced_tool_calls;
use crate::inference::types::{ChatMessage, Completion, CompletionOptions, Role, ToolCall, ToolCallResponse};
use crate::inference::{InferenceError, LlmProvider};
use crate::mcp_client::McpClient;

use super::conversation::{HistoryEntry, HistoryRole, HistoryStore};
use super::dispatcher::{
    detect_tool_calls, render_reprompt, render_tool_message, Dispatcher, ToolResult,
    DEFAULT_TOOL_TIMEOUT,
};
use super::errors::AgentError;
use super::prompt::{build_messages, render_system_prompt, tool_definitions};

// ─── Constants ───────────────────────────────────────────────────────────────

/// Maximum tool rounds per user turn.
pub const DEFAULT_MAX_TOOL_ROUNDS: usize = 4;

/// Overall budget for one turn, LLM calls and tools included.
pub const DEFAULT_TURN_TIMEOUT: Duration = Duration::from_secs(300);

/// Transient status shown while a turn is running.
pub const THINKING_STATUS: &str = "thinking…";

/// Sent when the LLM provider fails.
pub const APOLOGY_TEXT: &str =
    "Sorry, I couldn't get an answer from the language model just now. Please try again in a moment.";

/// Sent when a reload or shutdown cancels a running turn.
pub const INTERRUPTED_TEXT: &str =
    "Sorry, your request was interrupted by reload. Please send it again.";

/// Sent when the turn budget runs out.
pub const TIMEOUT_TEXT: &str = "Sorry, that took too long and was stopped. Please try again.";

/// Appended when the model still wants tools after the last allowed round.
pub const TOOL_BUDGET_NOTE: &str =
    "(I stopped here because this message reached its limit of tool calls.)";

/// Used when the model answers with nothing at all.
const EMPTY_REPLY: &str = "I don't have an answer for that.";

// ─── Types ───────────────────────────────────────────────────────────────────

/// Tunables of the loop, taken from configuration.
#[derive(Debug, Clone)]
pub struct LoopSettings {
    pub max_tool_rounds: usize,
    pub tool_timeout: Duration,
    pub turn_timeout: Duration,
    /// Overrides the default preamble.
    pub system_prompt: Option<String>,
    pub tool_call_format: ToolCallFormat,
    pub options: CompletionOptions,
}

impl Default for LoopSettings {
    fn default() -> Self {
        Self {
            max_tool_rounds: DEFAULT_MAX_TOOL_ROUNDS,
            tool_timeout: DEFAULT_TOOL_TIMEOUT,
            turn_timeout: DEFAULT_TURN_TIMEOUT,
            system_prompt: None,
            tool_call_format: ToolCallFormat::NativeJson,
            options: CompletionOptions::default(),
        }
    }
}

/// What a completed turn produced.
#[derive(Debug, Clone)]
pub struct TurnOutcome {
    pub reply: String,
    /// Tool rounds executed.
    pub tool_rounds: usize,
    pub llm_calls: usize,
    pub tool_results: Vec<ToolResult>,
    /// The model still asked for tools after the last allowed round.
    pub budget_exhausted: bool,
}

// ─── ConversationLoop ────────────────────────────────────────────────────────

/// Runs turns against one runtime generation.
pub struct ConversationLoop {
    llm: Arc<dyn LlmProvider>,
    tools: Arc<McpClient>,
    history: Arc<HistoryStore>,
    dispatcher: Dispatcher,
    settings: LoopSettings,
}

impl ConversationLoop {
    pub fn new(
        llm: Arc<dyn LlmProvider>,
        tools: Arc<McpClient>,
        history: Arc<HistoryStore>,
        settings: LoopSettings,
    ) -> Self {
        Self {
            llm,
            tools,
            history,
            dispatcher: Dispatcher::new(settings.tool_timeout),
            settings,
        }
    }

    pub fn tools(&self) -> &Arc<McpClient> {
        &self.tools
    }

    pub fn settings(&self) -> &LoopSettings {
        &self.settings
    }

    /// Handle one inbound message end to end: status, turn, reply.
    ///
    /// Failures of the turn itself are turned into a user-facing message and
    /// still returned so the caller can log them. Only a failure to deliver
    /// the reply is a front-end error.
    pub async fn handle(
        &self,
        msg: &IncomingMessage,
        frontend: &dyn ChatFrontend,
        ctx: &CallContext,
    ) -> Result<TurnOutcome, AgentError> {
        if let Err(e) = frontend.status(&msg.thread_id, THINKING_STATUS).await {
            tracing::warn!(thread = %msg.thread_id, error = %e, "failed to show status");
        }

        let result = self.run_turn(&msg.thread_id, &msg.text, ctx).await;
        let reply = match &result {
            Ok(outcome) => outcome.reply.as_str(),
            Err(e) => {
                tracing::error!(thread = %msg.thread_id, error = %e, kind = %e.kind(), "turn failed");
                user_facing_error(e)
            }
        };

        frontend.send(&msg.thread_id, reply).await?;
        result
    }

    /// Run the turn algorithm for `user_text` on `thread_id`.
    pub async fn run_turn(
        &self,
        thread_id: &str,
        user_text: &str,
        ctx: &CallContext,
    ) -> Result<TurnOutcome, AgentError> {
        let started = Instant::now();
        let descriptions = self.tools.describe_all();
        let system = render_system_prompt(
            self.settings.system_prompt.as_deref(),
            &descriptions,
            self.settings.tool_call_format,
        );
        let definitions = tool_definitions(&descriptions);
        let mut messages = build_messages(system, self.history.messages(thread_id), user_text);
        self.history
            .append(thread_id, HistoryEntry::new(HistoryRole::User, user_text));

        let mut tool_rounds = 0;
        let mut llm_calls = 0;
        let mut tool_results = Vec::new();

        let (reply, budget_exhausted) = loop {
            check_context(ctx)?;
            llm_calls += 1;
            let completion = self
                .llm
                .complete(&messages, &definitions, &self.settings.options, ctx)
                .await
                .map_err(|e| llm_failure(e, ctx))?;

            let calls = detect_tool_calls(&completion);
            if calls.is_empty() {
                break (completion.content.unwrap_or_default(), false);
            }

            if tool_rounds >= self.settings.max_tool_rounds {
                tracing::warn!(
                    thread = %thread_id,
                    rounds = tool_rounds,
                    pending_calls = calls.len(),
                    "tool round budget exhausted"
                );
                break (budget_reply(&completion), true);
            }
            tool_rounds += 1;

            tracing::info!(
                thread = %thread_id,
                round = tool_rounds,
                calls = calls.len(),
                "executing tool round"
            );
            let results = self.dispatcher.dispatch(&calls, &self.tools, ctx).await;
            check_context(ctx)?;

            self.history.extend(thread_id, round_history(&completion, &calls, &results));
            messages.extend(round_messages(&completion, &calls, &results, user_text));
            tool_results.extend(results);
        };

        let reply = if reply.trim().is_empty() {
            EMPTY_REPLY.to_string()
        } else {
            reply
        };
        self.history
            .append(thread_id, HistoryEntry::new(HistoryRole::Assistant, reply.clone()));

        tracing::info!(
            thread = %thread_id,
            llm_calls,
            rounds = tool_rounds,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "turn complete"
        );

        Ok(TurnOutcome {
            reply,
            tool_rounds,
            llm_calls,
            tool_results,
            budget_exhausted,
        })
    }
}

// ─── Helpers ─────────────────────────────────────────────────────────────────

fn check_context(ctx: &CallContext) -> Result<(), AgentError> {
    if ctx.is_cancelled() {
        return Err(AgentError::Interrupted {
            reason: "turn cancelled".to_string(),
        });
    }
    if ctx.remaining().is_zero() {
        return Err(AgentError::TurnTimeout {
            timeout_secs: ctx.budget().as_secs(),
        });
    }
    Ok(())
}

/// An LLM failure caused by the turn's own context is reported as such.
fn llm_failure(err: InferenceError, ctx: &CallContext) -> AgentError {
    match check_context(ctx) {
        Err(interrupted) => interrupted,
        Ok(()) => AgentError::from(err),
    }
}

pub fn user_facing_error(err: &AgentError) -> &'static str {
    match err {
        AgentError::Interrupted { .. } => INTERRUPTED_TEXT,
        AgentError::TurnTimeout { .. } => TIMEOUT_TEXT,
        AgentError::Llm { .. } | AgentError::Frontend { .. } => APOLOGY_TEXT,
    }
}

fn budget_reply(completion: &Completion) -> String {
    let text = completion
        .content
        .as_deref()
        .map(strip_fenced_tool_calls)
        .unwrap_or_default();
    if text.is_empty() {
        TOOL_BUDGET_NOTE.to_string()
    } else {
        format!("{text}\n\n{TOOL_BUDGET_NOTE}")
    }
}

/// The raw assistant text of a tool round, or a summary of its calls.
fn assistant_text(completion: &Completion, calls: &[ToolCall]) -> String {
    match completion.content.as_deref().filter(|c| !c.trim().is_empty()) {
        Some(text) => text.to_string(),
        None => {
            let names: Vec<&str> = calls.iter().map(|c| c.name.as_str()).collect();
            format!("[called {}]", names.join(", "))
        }
    }
}

fn round_history(completion: &Completion, calls: &[ToolCall], results: &[ToolResult]) -> Vec<HistoryEntry> {
    std::iter::once(HistoryEntry::new(
        HistoryRole::Assistant,
        assistant_text(completion, calls),
    ))
    .chain(results.iter().map(|r| {
        HistoryEntry::new(
            HistoryRole::Tool,
            format!("{} ({}): {}", r.tool_name, r.status, r.payload),
        )
    }))
    .collect()
}

/// Messages appended for the re-prompt.
///
/// Native calls are answered with one `tool` message per call id. Fenced
/// calls have no ids, so the results go back as one user message.
fn round_messages(
    completion: &Completion,
    calls: &[ToolCall],
    results: &[ToolResult],
    user_text: &str,
) -> Vec<ChatMessage> {
    if completion.tool_calls.is_empty() {
        return vec![
            ChatMessage::assistant(assistant_text(completion, calls)),
            ChatMessage::user(render_reprompt(user_text, results)),
        ];
    }

    let mut out = Vec::with_capacity(results.len() + 1);
    out.push(ChatMessage {
        role: Role::Assistant,
        content: completion.content.clone(),
        tool_call_id: None,
        tool_calls: Some(calls.iter().map(ToolCallResponse::from).collect()),
    });
    out.extend(results.iter().map(|r| ChatMessage {
        role: Role::Tool,
        content: Some(render_tool_message(r)),
        tool_call_id: Some(r.call_id.clone()),
        tool_calls: None,
    }));
    out
}

// ─── Tests ───────────────────────────────────────────────────────────────────
