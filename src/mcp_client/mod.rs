//! MCP Client: JSON-RPC tool servers over stdio, SSE and streamable HTTP.
//!
//! This module handles:
//! - Transports that frame JSON-RPC over a child process or HTTP
//! - Per-server sessions: handshake, catalog discovery, tool calls
//! - Tool aggregation across servers into one qualified namespace
//! - Bring-up and shutdown of one generation of sessions

pub mod client;
pub mod errors;
pub mod registry;
pub mod session;
pub mod transport;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

// Re-exports for convenience
pub use client::{McpClient, ServerStatus};
pub use errors::McpError;
pub use registry::{RegisteredTool, SessionId, ToolDescription, ToolPolicy, ToolRegistry};
pub use session::{ServerSession, SessionState};
pub use types::{CallToolResult, ServerSpec, ToolDef, TransportKind};
