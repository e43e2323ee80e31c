//! The LLM provider contract consumed by the conversation loop.

use async_trait::async_trait;

use super::errors::InferenceError;
use super::types::{ChatMessage, Completion, CompletionOptions, ToolDefinition};
use crate::context::CallContext;

/// Anything that can complete a chat prompt.
///
/// `tools` is the full schema list rendered from the registry. Providers that
/// do not support native function calling may ignore it; the system prompt
/// already describes the tools in text.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Short identifier used in logs.
    fn name(&self) -> &str;

    /// Complete `messages`, returning text and/or native tool calls.
    /// Must give up when `ctx` is cancelled or its deadline passes.
    async fn complete(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
        options: &CompletionOptions,
        ctx: &CallContext,
    ) -> Result<Completion, InferenceError>;
}
