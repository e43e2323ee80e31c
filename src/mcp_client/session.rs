//! Server session: one tool server, one transport, one lifecycle.
//!
//! A session runs the protocol handshake, holds the server's tool catalog,
//! and turns transport failures into session state:
//!
//! ```text
//! Created --initialize ok-->    Ready --callTool ok--> Ready
//! Created --initialize fail-->  Degraded
//! Ready   --connection lost-->  Degraded
//! any     --close-->            Closed
//! ```
//!
//! Requests on one session are serialized; sessions never block each other.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::errors::McpError;
use super::transport::{self, extract_result, Transport};
use super::types::{
    error_codes, CallToolResult, InitializeResult, JsonRpcError, JsonRpcResponse,
    ListToolsResult, ServerEvent, ServerSpec, ToolDef, PROTOCOL_VERSION,
};
use crate::context::CallContext;

/// Budget for `tools/list`, including every page.
pub const LIST_TOOLS_TIMEOUT: Duration = Duration::from_secs(20);

/// Upper bound on pages followed in one `tools/list`.
const MAX_LIST_PAGES: usize = 100;

// ─── State ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Created,
    Initializing,
    Ready,
    /// Will not serve further calls; still holds its transport until closed.
    Degraded,
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SessionState::Created => "created",
            SessionState::Initializing => "initializing",
            SessionState::Ready => "ready",
            SessionState::Degraded => "degraded",
            SessionState::Closed => "closed",
        })
    }
}

// ─── ServerSession ───────────────────────────────────────────────────────────

pub struct ServerSession {
    spec: ServerSpec,
    transport: Arc<dyn Transport>,
    state: Mutex<SessionState>,
    /// Held for the duration of each request.
    request_lock: tokio::sync::Mutex<()>,
    catalog: Mutex<Vec<ToolDef>>,
    server_info: Mutex<Option<InitializeResult>>,
    last_error: Mutex<Option<String>>,
    catalog_stale: Arc<AtomicBool>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl ServerSession {
    /// Wrap an open transport. Starts draining its server events.
    pub fn new(spec: ServerSpec, transport: Arc<dyn Transport>) -> Self {
        let catalog_stale = Arc::new(AtomicBool::new(false));
        let pump = transport.take_events().map(|events| {
            tokio::spawn(pump_events(
                spec.id.clone(),
                Arc::clone(&transport),
                events,
                Arc::clone(&catalog_stale),
            ))
        });

        Self {
            spec,
            transport,
            state: Mutex::new(SessionState::Created),
            request_lock: tokio::sync::Mutex::new(()),
            catalog: Mutex::new(Vec::new()),
            server_info: Mutex::new(None),
            last_error: Mutex::new(None),
            catalog_stale,
            pump: Mutex::new(pump),
        }
    }

    /// Open the transport for `spec` and wrap it. Connection setup is
    /// bounded by `ctx`.
    pub async fn open(
        spec: ServerSpec,
        http: &reqwest::Client,
        ctx: &CallContext,
    ) -> Result<Self, McpError> {
        let transport = transport::open(&spec, http, ctx).await?;
        Ok(Self::new(spec, Arc::from(transport)))
    }

    pub fn id(&self) -> &str {
        &self.spec.id
    }

    pub fn spec(&self) -> &ServerSpec {
        &self.spec
    }

    pub fn state(&self) -> SessionState {
        *lock(&self.state)
    }

    /// The catalog from the most recent successful `list_tools`.
    pub fn catalog(&self) -> Vec<ToolDef> {
        lock(&self.catalog).clone()
    }

    pub fn server_info(&self) -> Option<InitializeResult> {
        lock(&self.server_info).clone()
    }

    pub fn last_error(&self) -> Option<String> {
        lock(&self.last_error).clone()
    }

    /// Whether the server announced that its tool list changed since the
    /// last `list_tools`.
    pub fn is_catalog_stale(&self) -> bool {
        self.catalog_stale.load(Ordering::SeqCst)
    }

    // ─── Lifecycle ───────────────────────────────────────────────────────

    /// Run the protocol handshake. Allowed exactly once, from `Created`.
    pub async fn initialize(&self, ctx: &CallContext) -> Result<InitializeResult, McpError> {
        {
            let mut state = lock(&self.state);
            if *state != SessionState::Created {
                return Err(self.not_ready(*state, "initialize"));
            }
            *state = SessionState::Initializing;
        }

        match self.handshake(ctx).await {
            Ok(result) => {
                *lock(&self.server_info) = Some(result.clone());
                self.transition(SessionState::Initializing, SessionState::Ready);
                tracing::info!(
                    server = %self.spec.id,
                    protocol = %result.protocol_version,
                    server_name = result.server_info.as_ref().and_then(|i| i.name.as_deref()).unwrap_or(""),
                    "server initialized"
                );
                Ok(result)
            }
            Err(e) => {
                let e = self.with_diagnostics(e);
                self.degrade(&e);
                Err(e)
            }
        }
    }

    async fn handshake(&self, ctx: &CallContext) -> Result<InitializeResult, McpError> {
        let params = serde_json::json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": {
                "name": env!("CARGO_PKG_NAME"),
                "version": env!("CARGO_PKG_VERSION"),
            },
        });

        let response = self.request("initialize", Some(params), ctx).await?;
        let value = extract_result(response).map_err(|e| self.handshake_failed(e.to_string()))?;
        let result: InitializeResult = serde_json::from_value(value)
            .map_err(|e| self.handshake_failed(format!("malformed initialize result: {e}")))?;

        if result.protocol_version != PROTOCOL_VERSION {
            tracing::debug!(
                server = %self.spec.id,
                offered = PROTOCOL_VERSION,
                accepted = %result.protocol_version,
                "server negotiated a different protocol version"
            );
        }

        self.transport
            .notify("notifications/initialized", None)
            .await?;
        Ok(result)
    }

    /// Fetch the full tool catalog, following pagination under one deadline.
    /// Requires `Ready`.
    pub async fn list_tools(&self, ctx: &CallContext) -> Result<Vec<ToolDef>, McpError> {
        self.require_ready("list tools")?;
        let ctx = ctx.child(LIST_TOOLS_TIMEOUT);

        match self.fetch_catalog(&ctx).await {
            Ok(tools) => {
                *lock(&self.catalog) = tools.clone();
                self.catalog_stale.store(false, Ordering::SeqCst);
                Ok(tools)
            }
            Err(e) => Err(self.observe_failure(e)),
        }
    }

    async fn fetch_catalog(&self, ctx: &CallContext) -> Result<Vec<ToolDef>, McpError> {
        let mut tools: Vec<ToolDef> = Vec::new();
        let mut cursor: Option<String> = None;

        for _ in 0..MAX_LIST_PAGES {
            let params = cursor.as_ref().map(|c| serde_json::json!({ "cursor": c }));
            let response = self.request("tools/list", params, ctx).await?;
            let value = extract_result(response)?;
            let page: ListToolsResult =
                serde_json::from_value(value).map_err(|e| McpError::ServerError {
                    code: error_codes::INTERNAL_ERROR,
                    message: format!("malformed tools/list result: {e}"),
                    data: None,
                })?;

            for tool in page.tools {
                if tools.iter().any(|t| t.name == tool.name) {
                    tracing::warn!(server = %self.spec.id, tool = %tool.name, "server advertised a tool twice, keeping the first");
                    continue;
                }
                tools.push(tool);
            }

            match page.next_cursor {
                Some(next) if !next.is_empty() => cursor = Some(next),
                _ => return Ok(tools),
            }
        }

        tracing::warn!(server = %self.spec.id, pages = MAX_LIST_PAGES, "tools/list pagination limit reached");
        Ok(tools)
    }

    /// Invoke one tool by the name the server uses for it. A result with
    /// `isError: true` is still `Ok`; the caller decides how to report it.
    #[tracing::instrument(skip(self, arguments, ctx), fields(server = %self.spec.id))]
    pub async fn call_tool(
        &self,
        raw_name: &str,
        arguments: Value,
        ctx: &CallContext,
    ) -> Result<CallToolResult, McpError> {
        self.require_ready("call tools")?;

        let params = serde_json::json!({ "name": raw_name, "arguments": arguments });
        let outcome = async {
            let response = self.request("tools/call", Some(params), ctx).await?;
            let value = extract_result(response)?;
            serde_json::from_value::<CallToolResult>(value).map_err(|e| McpError::ServerError {
                code: error_codes::INTERNAL_ERROR,
                message: format!("malformed tools/call result: {e}"),
                data: None,
            })
        }
        .await;

        outcome.map_err(|e| self.observe_failure(e))
    }

    /// `initialize` then `list_tools` back to back under one budget.
    ///
    /// The handshake gets the server's own initialize timeout carved out of
    /// `ctx`; the catalog fetch gets whatever is left.
    #[tracing::instrument(skip(self, ctx), fields(server = %self.spec.id, transport = %self.transport.kind()))]
    pub async fn bring_up(&self, ctx: &CallContext) -> Result<Vec<ToolDef>, McpError> {
        let started = std::time::Instant::now();
        self.initialize(&ctx.child(self.spec.initialize_timeout()))
            .await?;
        let tools = self.list_tools(ctx).await?;
        tracing::info!(
            tools = tools.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "server ready"
        );
        Ok(tools)
    }

    /// Close the transport. Idempotent.
    pub async fn close(&self) {
        {
            let mut state = lock(&self.state);
            if *state == SessionState::Closed {
                return;
            }
            *state = SessionState::Closed;
        }
        if let Some(pump) = lock(&self.pump).take() {
            pump.abort();
        }
        self.transport.close().await;
        tracing::debug!(server = %self.spec.id, "session closed");
    }

    // ─── Internals ───────────────────────────────────────────────────────

    async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        ctx: &CallContext,
    ) -> Result<JsonRpcResponse, McpError> {
        let _turn = ctx
            .run(self.request_lock.lock())
            .await
            .map_err(|i| transport::interrupted_error(&self.spec.id, method, ctx, i))?;
        self.transport.request(method, params, ctx).await
    }

    fn require_ready(&self, operation: &str) -> Result<(), McpError> {
        let state = self.state();
        if state == SessionState::Ready && self.transport.is_closed() {
            let err = McpError::TransportClosed {
                server: self.spec.id.clone(),
                reason: "connection lost".to_string(),
            };
            self.degrade(&err);
            return Err(err);
        }
        if state != SessionState::Ready {
            return Err(self.not_ready(state, operation));
        }
        Ok(())
    }

    /// Record a failed request; connection loss degrades the session.
    fn observe_failure(&self, err: McpError) -> McpError {
        if err.is_connection_loss() {
            let err = self.with_diagnostics(err);
            self.degrade(&err);
            return err;
        }
        *lock(&self.last_error) = Some(err.to_string());
        err
    }

    fn degrade(&self, err: &McpError) {
        *lock(&self.last_error) = Some(err.to_string());
        let mut state = lock(&self.state);
        if matches!(*state, SessionState::Initializing | SessionState::Ready) {
            *state = SessionState::Degraded;
            tracing::warn!(server = %self.spec.id, error = %err, "session degraded");
        }
    }

    fn transition(&self, from: SessionState, to: SessionState) {
        let mut state = lock(&self.state);
        if *state == from {
            *state = to;
        }
    }

    fn not_ready(&self, state: SessionState, operation: &str) -> McpError {
        McpError::NotReady {
            server: self.spec.id.clone(),
            state: state.to_string(),
            operation: operation.to_string(),
        }
    }

    fn handshake_failed(&self, reason: String) -> McpError {
        McpError::HandshakeFailed {
            name: self.spec.id.clone(),
            reason,
        }
    }

    /// Append the transport's diagnostics (child stderr) to errors that
    /// describe a dead or failing server.
    fn with_diagnostics(&self, err: McpError) -> McpError {
        let Some(tail) = self.transport.diagnostics() else {
            return err;
        };
        let suffix = format!(" (stderr: {})", tail.trim());
        match err {
            McpError::TransportClosed { server, reason } => McpError::TransportClosed {
                server,
                reason: reason + &suffix,
            },
            McpError::TransportError { server, reason } => McpError::TransportError {
                server,
                reason: reason + &suffix,
            },
            McpError::HandshakeFailed { name, reason } => McpError::HandshakeFailed {
                name,
                reason: reason + &suffix,
            },
            other => other,
        }
    }
}

impl Drop for ServerSession {
    fn drop(&mut self) {
        if let Some(pump) = lock(&self.pump).take() {
            pump.abort();
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

// ─── Server Events ───────────────────────────────────────────────────────────

async fn pump_events(
    server: String,
    transport: Arc<dyn Transport>,
    mut events: mpsc::Receiver<ServerEvent>,
    catalog_stale: Arc<AtomicBool>,
) {
    while let Some(event) = events.recv().await {
        match event {
            ServerEvent::Request { id, method, .. } => {
                let response = if method == "ping" {
                    JsonRpcResponse::success(id, serde_json::json!({}))
                } else {
                    tracing::debug!(server = %server, method = %method, "rejecting unsupported server request");
                    JsonRpcResponse::failure(
                        id,
                        JsonRpcError {
                            code: error_codes::METHOD_NOT_FOUND,
                            message: format!("method not supported by client: {method}"),
                            data: None,
                        },
                    )
                };
                if let Err(e) = transport.respond(response).await {
                    tracing::debug!(server = %server, error = %e, "failed to answer server request");
                }
            }
            ServerEvent::Notification { method, params } => match method.as_str() {
                "notifications/tools/list_changed" => {
                    catalog_stale.store(true, Ordering::SeqCst);
                    tracing::info!(server = %server, "tool list changed on server, reload to pick it up");
                }
                "notifications/message" => log_server_message(&server, params.as_ref()),
                other => {
                    tracing::trace!(server = %server, method = other, "ignoring server notification");
                }
            },
        }
    }
}

/// Map a server log notification onto a tracing event.
fn log_server_message(server: &str, params: Option<&Value>) {
    let empty = Value::Null;
    let params = params.unwrap_or(&empty);
    let level = params.get("level").and_then(Value::as_str).unwrap_or("info");
    let logger = params.get("logger").and_then(Value::as_str).unwrap_or("");
    let data = match params.get("data") {
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => String::new(),
    };

    match level {
        "debug" => tracing::debug!(server, logger, "{data}"),
        "info" | "notice" => tracing::info!(server, logger, "{data}"),
        "warning" => tracing::warn!(server, logger, "{data}"),
        "error" | "critical" | "alert" | "emergency" => tracing::error!(server, logger, "{data}"),
        _ => tracing::info!(server, logger, level, "{data}"),
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
