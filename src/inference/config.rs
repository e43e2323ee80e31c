//! Model configuration.
//!
//! The `llm` section of the bridge configuration: which model endpoints
//! exist, which one is active, and the order to fall back in.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::errors::InferenceError;

// ─── Public Types ────────────────────────────────────────────────────────────

/// How the model expresses tool calls.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCallFormat {
    /// OpenAI `tool_calls` objects; `tools` is sent with the request.
    #[default]
    NativeJson,
    /// Fenced JSON blocks in the text; tools are described in the prompt
    /// only.
    FencedJson,
}

/// A single model's runtime configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// OpenAI-compatible base URL, e.g. `http://localhost:11434/v1`.
    #[serde(alias = "baseUrl")]
    pub base_url: String,
    /// Model name sent in the request; defaults to the config key.
    #[serde(default, alias = "modelName")]
    pub model_name: Option<String>,
    /// Sent as a bearer token when present.
    #[serde(default, alias = "apiKey", skip_serializing)]
    pub api_key: Option<String>,
    #[serde(default, alias = "toolCallFormat")]
    pub tool_call_format: ToolCallFormat,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens", alias = "maxTokens")]
    pub max_tokens: u32,
    /// Per-request ceiling; the turn budget may cut it shorter.
    #[serde(default = "default_timeout_seconds", alias = "timeoutSeconds")]
    pub timeout_seconds: u64,
}

fn default_temperature() -> f32 {
    0.2
}
fn default_max_tokens() -> u32 {
    1024
}
fn default_timeout_seconds() -> u64 {
    120
}

/// The `llm` configuration section.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelsConfig {
    #[serde(default, alias = "activeModel")]
    pub active_model: String,
    #[serde(default, alias = "fallbackChain")]
    pub fallback_chain: Vec<String>,
    #[serde(default)]
    pub models: HashMap<String, ModelConfig>,
}

impl ModelsConfig {
    /// Model keys in the order they are tried: the active model, then the
    /// fallback chain, skipping duplicates and unknown keys.
    pub fn attempt_order(&self) -> Vec<String> {
        let mut order: Vec<String> = Vec::new();
        let candidates = std::iter::once(&self.active_model).chain(self.fallback_chain.iter());
        for key in candidates {
            if self.models.contains_key(key) && !order.contains(key) {
                order.push(key.clone());
            }
        }
        order
    }
}

/// Resolve the active model configuration, respecting the fallback chain.
///
/// Returns `(model_key, ModelConfig)` for the first configured model.
/// Connectivity is checked at request time by the client.
pub fn resolve_active_model(config: &ModelsConfig) -> Result<(String, ModelConfig), InferenceError> {
    config
        .attempt_order()
        .into_iter()
        .next()
        .and_then(|key| config.models.get(&key).cloned().map(|m| (key, m)))
        .ok_or_else(|| InferenceError::ConfigError {
            reason: format!(
                "active model '{}' not found in config and no fallback available",
                config.active_model
            ),
        })
}

// ─── Tests ───────────────────────────────────────────────────────────────────
