//! Agent Core error types.

use thiserror::Error;

use crate::errors::ErrorKind;
use crate::frontend::FrontendError;
use crate::inference::InferenceError;

/// Errors that end a conversation turn early.
#[derive(Debug, Error)]
pub enum AgentError {
    /// The LLM provider failed (after its own fallback chain).
    #[error("LLM call failed: {source}")]
    Llm {
        #[from]
        source: InferenceError,
    },

    /// The turn's deadline elapsed.
    #[error("turn timed out after {timeout_secs}s")]
    TurnTimeout { timeout_secs: u64 },

    /// The turn was cancelled from outside (reload or shutdown).
    #[error("turn interrupted: {reason}")]
    Interrupted { reason: String },

    /// The reply could not be delivered to the chat front-end.
    #[error("front-end error: {source}")]
    Frontend {
        #[from]
        source: FrontendError,
    },
}

impl AgentError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AgentError::Llm { source } => source.kind(),
            AgentError::TurnTimeout { .. } | AgentError::Interrupted { .. } => ErrorKind::Timeout,
            AgentError::Frontend { source } => source.kind(),
        }
    }
}
