//! Stable, user-visible error taxonomy.
//!
//! Every module-level error type maps onto exactly one [`ErrorKind`] via a
//! `kind()` method. The string forms are part of the external contract: they
//! appear in logs, tool results fed back to the model, and status reports.

use std::fmt;

use serde::{Deserialize, Serialize};

/// The eight error classes surfaced by the bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    /// Server spec missing required fields, or both command and URL absent.
    ConfigError,
    /// I/O failed, process exited, stream closed.
    TransportError,
    /// `initialize` returned an error or a malformed result.
    HandshakeError,
    /// Any deadline exceeded.
    Timeout,
    /// Tool name did not resolve.
    NotFound,
    /// Tool blocked by policy.
    Denied,
    /// Server completed the call but returned an error payload.
    ToolError,
    /// The LLM provider failed.
    LlmError,
}

impl ErrorKind {
    /// The stable status string.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::ConfigError => "config-error",
            ErrorKind::TransportError => "transport-error",
            ErrorKind::HandshakeError => "handshake-error",
            ErrorKind::Timeout => "timeout",
            ErrorKind::NotFound => "not-found",
            ErrorKind::Denied => "denied",
            ErrorKind::ToolError => "tool-error",
            ErrorKind::LlmError => "llm-error",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
