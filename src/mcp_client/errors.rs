//! MCP Client error types.

use thiserror::Error;

use crate::errors::ErrorKind;

/// Errors that can occur during MCP client operations.
#[derive(Debug, Error)]
pub enum McpError {
    /// Server spec is unusable (missing command/url, bad header, ...).
    #[error("config error for server '{server}': {reason}")]
    ConfigError {
        server: String,
        reason: String,
    },

    /// A server process failed to start.
    #[error("failed to spawn server '{name}': {reason}")]
    SpawnFailed {
        name: String,
        reason: String,
    },

    /// The initialization handshake failed.
    #[error("server '{name}' initialization failed: {reason}")]
    HandshakeFailed {
        name: String,
        reason: String,
    },

    /// JSON-RPC communication error (I/O error, unexpected HTTP status, ...).
    #[error("transport error for server '{server}': {reason}")]
    TransportError {
        server: String,
        reason: String,
    },

    /// The adapter is closed: the process exited, the stream ended, or
    /// `close()` was called.
    #[error("transport for server '{server}' is closed: {reason}")]
    TransportClosed {
        server: String,
        reason: String,
    },

    /// Server returned a JSON-RPC error response.
    #[error("server error [{code}]: {message}")]
    ServerError {
        code: i32,
        message: String,
        data: Option<serde_json::Value>,
    },

    /// Tool not found in the aggregated registry.
    #[error("unknown tool: '{name}'")]
    UnknownTool {
        name: String,
    },

    /// Tool exists on a server but was filtered out by allow/block policy.
    #[error("tool '{name}' is blocked by policy: {reason}")]
    Denied {
        name: String,
        reason: String,
    },

    /// Tool call arguments failed schema validation.
    #[error("invalid arguments for '{tool}': {reason}")]
    InvalidArguments {
        tool: String,
        reason: String,
    },

    /// A request exceeded its deadline.
    #[error("'{operation}' on server '{server}' timed out after {timeout_ms}ms")]
    Timeout {
        server: String,
        operation: String,
        timeout_ms: u64,
    },

    /// A request was abandoned because its context was cancelled.
    #[error("'{operation}' on server '{server}' was cancelled")]
    Cancelled {
        server: String,
        operation: String,
    },

    /// The session is not in a state that accepts this operation.
    #[error("server '{server}' is {state}, cannot {operation}")]
    NotReady {
        server: String,
        state: String,
        operation: String,
    },
}

impl McpError {
    /// Map onto the stable taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            McpError::ConfigError { .. } => ErrorKind::ConfigError,
            McpError::SpawnFailed { .. }
            | McpError::TransportError { .. }
            | McpError::TransportClosed { .. }
            | McpError::Cancelled { .. }
            | McpError::NotReady { .. } => ErrorKind::TransportError,
            McpError::HandshakeFailed { .. } => ErrorKind::HandshakeError,
            McpError::ServerError { .. } | McpError::InvalidArguments { .. } => {
                ErrorKind::ToolError
            }
            McpError::UnknownTool { .. } => ErrorKind::NotFound,
            McpError::Denied { .. } => ErrorKind::Denied,
            McpError::Timeout { .. } => ErrorKind::Timeout,
        }
    }

    /// Whether this error means the underlying connection is gone.
    pub fn is_connection_loss(&self) -> bool {
        matches!(
            self,
            McpError::TransportClosed { .. } | McpError::TransportError { .. }
        )
    }
}
