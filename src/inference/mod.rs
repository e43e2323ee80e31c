//! Inference: the LLM provider contract and an OpenAI-compatible provider.
//!
//! This module handles all communication with the model endpoint:
//! - The `LlmProvider` trait the conversation loop consumes
//! - Non-streaming chat completions with a fallback chain
//! - Tool call parsing (native function calls + fenced JSON blocks)
//! - Model configuration (the `llm` config section)
//!
//! The client speaks the OpenAI Chat Completions API, making the model
//! interchangeable via config. Switching models is a config change, not a
//! code change.

pub mod client;
pub mod config;
pub mod errors;
pub mod provider;
pub mod tool_call_parser;
pub mod types;

// Re-exports for convenience
pub use client::InferenceClient;
pub use config::{ModelConfig, ModelsConfig, ToolCallFormat};
pub use errors::InferenceError;
pub use provider::LlmProvider;
pub use types::{ChatMessage, Completion, CompletionOptions, Role, ToolCall, ToolDefinition};
