//! Shared types for the MCP client.
//!
//! JSON-RPC 2.0 message types, MCP protocol structures, and the per-server
//! configuration record.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Protocol revision sent in `initialize`.
pub const PROTOCOL_VERSION: &str = "2024-11-05";

// ─── JSON-RPC 2.0 ───────────────────────────────────────────────────────────

/// A JSON-RPC id. Ids we issue are numeric; servers may use strings for
/// their own requests.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(u64),
    String(String),
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestId::Number(n) => write!(f, "{n}"),
            RequestId::String(s) => f.write_str(s),
        }
    }
}

impl From<u64> for RequestId {
    fn from(n: u64) -> Self {
        RequestId::Number(n)
    }
}

impl From<String> for RequestId {
    fn from(s: String) -> Self {
        RequestId::String(s)
    }
}

/// JSON-RPC 2.0 request message.
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub id: u64,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    /// Create a new JSON-RPC request.
    pub fn new(id: u64, method: &str, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            method: method.to_string(),
            params,
        }
    }
}

/// JSON-RPC 2.0 notification (no id, no response).
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcNotification {
    pub jsonrpc: String,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcNotification {
    pub fn new(method: &str, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            method: method.to_string(),
            params,
        }
    }
}

/// JSON-RPC 2.0 response message (success or error).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    #[serde(default = "jsonrpc_version")]
    pub jsonrpc: String,
    pub id: RequestId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    /// A success reply to a server-initiated request.
    pub fn success(id: RequestId, result: Value) -> Self {
        Self {
            jsonrpc: jsonrpc_version(),
            id,
            result: Some(result),
            error: None,
        }
    }

    /// An error reply to a server-initiated request.
    pub fn failure(id: RequestId, error: JsonRpcError) -> Self {
        Self {
            jsonrpc: jsonrpc_version(),
            id,
            result: None,
            error: Some(error),
        }
    }
}

fn jsonrpc_version() -> String {
    "2.0".to_string()
}

/// JSON-RPC 2.0 error object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

// ─── Incoming Frames ─────────────────────────────────────────────────────────

/// Something the server sent that is not a reply to one of our requests.
#[derive(Debug, Clone)]
pub enum ServerEvent {
    /// A notification (`method`, no `id`).
    Notification { method: String, params: Option<Value> },
    /// A server-to-client request that expects a reply.
    Request {
        id: RequestId,
        method: String,
        params: Option<Value>,
    },
}

impl ServerEvent {
    pub fn method(&self) -> &str {
        match self {
            ServerEvent::Notification { method, .. } | ServerEvent::Request { method, .. } => {
                method
            }
        }
    }
}

/// A classified inbound frame.
#[derive(Debug, Clone)]
pub enum IncomingFrame {
    Response(JsonRpcResponse),
    Event(ServerEvent),
}

impl IncomingFrame {
    /// Classify one raw frame. Returns a description of the problem when the
    /// text is not a JSON-RPC message.
    pub fn parse(text: &str) -> Result<Self, String> {
        let value: Value =
            serde_json::from_str(text).map_err(|e| format!("invalid JSON: {e}"))?;
        let obj = value
            .as_object()
            .ok_or_else(|| "frame is not a JSON object".to_string())?;

        let method = obj.get("method").and_then(|m| m.as_str()).map(str::to_string);
        let has_id = obj.get("id").is_some_and(|id| !id.is_null());
        let params = obj.get("params").cloned();

        match (method, has_id) {
            (Some(method), true) => {
                let id: RequestId = serde_json::from_value(obj["id"].clone())
                    .map_err(|e| format!("bad request id: {e}"))?;
                Ok(IncomingFrame::Event(ServerEvent::Request { id, method, params }))
            }
            (Some(method), false) => {
                Ok(IncomingFrame::Event(ServerEvent::Notification { method, params }))
            }
            (None, true) if obj.contains_key("result") || obj.contains_key("error") => {
                serde_json::from_value::<JsonRpcResponse>(value)
                    .map(IncomingFrame::Response)
                    .map_err(|e| format!("bad response: {e}"))
            }
            _ => Err("frame has neither a method nor a result/error".to_string()),
        }
    }
}

// ─── MCP Protocol Types ──────────────────────────────────────────────────────

/// A tool as advertised by a server in `tools/list`.
///
/// Unknown fields (annotations, output schemas, ...) are kept in `extra` so
/// they survive a round-trip.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDef {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "inputSchema", alias = "input_schema", default = "empty_object_schema")]
    pub input_schema: Value,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn empty_object_schema() -> Value {
    serde_json::json!({"type": "object", "properties": {}})
}

/// `initialize` response payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitializeResult {
    #[serde(rename = "protocolVersion")]
    pub protocol_version: String,
    #[serde(default)]
    pub capabilities: Value,
    #[serde(default, rename = "serverInfo", skip_serializing_if = "Option::is_none")]
    pub server_info: Option<ServerInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Server info returned in the initialize response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerInfo {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
}

/// One page of `tools/list`.
#[derive(Debug, Clone, Deserialize)]
pub struct ListToolsResult {
    #[serde(default)]
    pub tools: Vec<ToolDef>,
    #[serde(default, rename = "nextCursor")]
    pub next_cursor: Option<String>,
}

/// One entry of a `tools/call` result's `content` array.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentBlock {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    #[serde(default, rename = "mimeType", skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// `tools/call` result payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallToolResult {
    #[serde(default)]
    pub content: Vec<ContentBlock>,
    #[serde(default, rename = "isError")]
    pub is_error: bool,
    #[serde(
        default,
        rename = "structuredContent",
        skip_serializing_if = "Option::is_none"
    )]
    pub structured_content: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl CallToolResult {
    /// Human-readable rendering of the content blocks.
    ///
    /// Text blocks are joined with newlines; other block types are noted by
    /// type so the model knows something non-textual came back. Falls back to
    /// the structured content when there are no blocks at all.
    pub fn text(&self) -> String {
        let parts: Vec<String> = self
            .content
            .iter()
            .map(|block| match (&block.text, block.kind.as_str()) {
                (Some(text), _) => text.clone(),
                (None, kind) => match &block.mime_type {
                    Some(mime) => format!("[{kind} content: {mime}]"),
                    None => format!("[{kind} content]"),
                },
            })
            .collect();

        if parts.is_empty() {
            return match &self.structured_content {
                Some(v) => v.to_string(),
                None => String::new(),
            };
        }
        parts.join("\n")
    }
}

// ─── Server Configuration ────────────────────────────────────────────────────

/// Which transport a server speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Child process, line-delimited JSON over stdin/stdout.
    Stdio,
    /// Long-lived `text/event-stream` GET plus POSTed requests.
    Sse,
    /// Streamable HTTP: POST per request, JSON or SSE-framed reply.
    #[serde(alias = "streamable-http", alias = "streamable_http")]
    Http,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TransportKind::Stdio => "stdio",
            TransportKind::Sse => "sse",
            TransportKind::Http => "http",
        })
    }
}

/// One tool server, as written in the configuration file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSpec {
    pub id: String,
    /// Inferred from `command`/`url` when omitted.
    #[serde(default)]
    pub transport: Option<TransportKind>,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Working directory for the child process.
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default, alias = "endpoint")]
    pub url: Option<String>,
    #[serde(default, alias = "httpHeaders", alias = "headers")]
    pub http_headers: HashMap<String, String>,
    #[serde(default)]
    pub disabled: bool,
    #[serde(
        default = "default_initialize_timeout_seconds",
        alias = "initializeTimeoutSeconds"
    )]
    pub initialize_timeout_seconds: u64,
    #[serde(default, alias = "allowList")]
    pub allow_list: Vec<String>,
    #[serde(default, alias = "blockList")]
    pub block_list: Vec<String>,
}

fn default_initialize_timeout_seconds() -> u64 {
    5
}

/// Where a transport connects to, resolved from a [`ServerSpec`].
#[derive(Debug, Clone, PartialEq)]
pub enum Endpoint {
    Process {
        command: String,
        args: Vec<String>,
        env: HashMap<String, String>,
        cwd: Option<String>,
    },
    Url {
        url: String,
        headers: HashMap<String, String>,
    },
}

impl ServerSpec {
    /// A stdio spec with defaults for everything else.
    pub fn stdio(id: &str, command: &str, args: &[&str]) -> Self {
        Self {
            id: id.to_string(),
            transport: Some(TransportKind::Stdio),
            command: Some(command.to_string()),
            args: args.iter().map(|a| a.to_string()).collect(),
            env: HashMap::new(),
            cwd: None,
            url: None,
            http_headers: HashMap::new(),
            disabled: false,
            initialize_timeout_seconds: default_initialize_timeout_seconds(),
            allow_list: Vec::new(),
            block_list: Vec::new(),
        }
    }

    /// An HTTP-family spec (sse or streamable http).
    pub fn remote(id: &str, transport: TransportKind, url: &str) -> Self {
        Self {
            transport: Some(transport),
            command: None,
            url: Some(url.to_string()),
            ..Self::stdio(id, "", &[])
        }
    }

    /// The effective transport: explicit, or inferred from which endpoint
    /// fields are present. `None` when neither a command nor a URL is given.
    pub fn transport_kind(&self) -> Option<TransportKind> {
        if let Some(kind) = self.transport {
            return Some(kind);
        }
        match (&self.command, &self.url) {
            (Some(cmd), _) if !cmd.trim().is_empty() => Some(TransportKind::Stdio),
            (_, Some(url)) if !url.trim().is_empty() => Some(TransportKind::Http),
            _ => None,
        }
    }

    /// Resolve the endpoint for the effective transport.
    pub fn endpoint(&self) -> Result<Endpoint, String> {
        let kind = self
            .transport_kind()
            .ok_or_else(|| "neither 'command' nor 'url' is set".to_string())?;

        match kind {
            TransportKind::Stdio => {
                let command = self
                    .command
                    .as_deref()
                    .map(str::trim)
                    .filter(|c| !c.is_empty())
                    .ok_or_else(|| "stdio transport requires 'command'".to_string())?;
                Ok(Endpoint::Process {
                    command: command.to_string(),
                    args: self.args.clone(),
                    env: self.env.clone(),
                    cwd: self.cwd.clone(),
                })
            }
            TransportKind::Sse | TransportKind::Http => {
                let url = self
                    .url
                    .as_deref()
                    .map(str::trim)
                    .filter(|u| !u.is_empty())
                    .ok_or_else(|| format!("{kind} transport requires 'url'"))?;
                Ok(Endpoint::Url {
                    url: url.to_string(),
                    headers: self.http_headers.clone(),
                })
            }
        }
    }

    pub fn initialize_timeout(&self) -> Duration {
        Duration::from_secs(self.initialize_timeout_seconds)
    }
}

// ─── Standard Error Codes ────────────────────────────────────────────────────

/// Well-known JSON-RPC error codes.
pub mod error_codes {
    /// Invalid JSON was received.
    pub const PARSE_ERROR: i32 = -32700;
    /// The JSON sent is not a valid Request object.
    pub const INVALID_REQUEST: i32 = -32600;
    /// The method does not exist or is not available.
    pub const METHOD_NOT_FOUND: i32 = -32601;
    /// Invalid method parameters.
    pub const INVALID_PARAMS: i32 = -32602;
    /// Internal JSON-RPC error.
    pub const INTERNAL_ERROR: i32 = -32603;
}

// ─── Tests ───────────────────────────────────────────────────────────────────
