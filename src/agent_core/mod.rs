//! Agent Core: the conversation side of the bridge.
//!
//! Submodules:
//! - `conversation`: Per-thread history rings
//! - `prompt`: System prompt and tool schema rendering
//! - `dispatcher`: Detects tool calls in model output and executes them
//! - `conversation_loop`: One user turn, from message to final reply
//! - `errors`: Agent-level error types

pub mod conversation;
pub mod conversation_loop;
pub mod dispatcher;
pub mod errors;
pub mod prompt;

#[cfg(test)]
pub(crate) mod testing;

// Re-exports for convenience
pub use conversation::{HistoryEntry, HistoryRole, HistoryStore, DEFAULT_HISTORY_LIMIT, DEFAULT_HISTORY_THREADS};
pub use conversation_loop::{
    ConversationLoop, LoopSettings, TurnOutcome, APOLOGY_TEXT, INTERRUPTED_TEXT, THINKING_STATUS,
};
pub use dispatcher::{detect_tool_calls, render_reprompt, Dispatcher, ToolResult, ToolStatus};
pub use errors::AgentError;
