//! Scripted transport for unit tests.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use super::errors::McpError;
use super::transport::{interrupted_error, Transport, EVENT_CHANNEL_CAPACITY};
use super::types::{
    JsonRpcError, JsonRpcResponse, RequestId, ServerEvent, ToolDef, TransportKind,
    PROTOCOL_VERSION,
};
use crate::context::CallContext;

/// What the scripted server does with one request.
pub(crate) enum Reply {
    Result(Value),
    Error(i32, String),
    /// Never answer; the caller's deadline decides.
    Hang,
}

type Handler = Box<dyn Fn(&str, Option<Value>) -> Reply + Send + Sync>;

pub(crate) struct ScriptedTransport {
    server_id: String,
    handler: Handler,
    next_id: AtomicU64,
    log: Mutex<Vec<(String, Option<Value>)>>,
    responses: Mutex<Vec<JsonRpcResponse>>,
    events_tx: mpsc::Sender<ServerEvent>,
    events: Mutex<Option<mpsc::Receiver<ServerEvent>>>,
    killed: Mutex<Option<String>>,
    diagnostics: Mutex<Option<String>>,
    closed: AtomicBool,
    close_count: AtomicUsize,
}

impl ScriptedTransport {
    pub(crate) fn new(
        server_id: &str,
        handler: impl Fn(&str, Option<Value>) -> Reply + Send + Sync + 'static,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            server_id: server_id.to_string(),
            handler: Box::new(handler),
            next_id: AtomicU64::new(1),
            log: Mutex::new(Vec::new()),
            responses: Mutex::new(Vec::new()),
            events_tx,
            events: Mutex::new(Some(events_rx)),
            killed: Mutex::new(None),
            diagnostics: Mutex::new(None),
            closed: AtomicBool::new(false),
            close_count: AtomicUsize::new(0),
        }
    }

    /// A well-behaved server advertising `tools`. `tools/call` answers
    /// "hello", except tool `hang` (never answers) and `fail` (`isError`).
    pub(crate) fn tool_server(server_id: &str, tools: Vec<ToolDef>) -> Self {
        let listing = serde_json::json!({ "tools": tools });
        Self::new(server_id, move |method, params| match method {
            "initialize" => Self::initialize_ok(),
            "tools/list" => Reply::Result(listing.clone()),
            "tools/call" => {
                let name = params
                    .as_ref()
                    .and_then(|p| p.get("name"))
                    .and_then(Value::as_str)
                    .unwrap_or("");
                match name {
                    "hang" => Reply::Hang,
                    "fail" => Reply::Result(serde_json::json!({
                        "content": [{"type": "text", "text": "it broke"}],
                        "isError": true
                    })),
                    _ => Reply::Result(serde_json::json!({
                        "content": [{"type": "text", "text": "hello"}]
                    })),
                }
            }
            _ => Self::error(-32601, "Method not found"),
        })
    }

    pub(crate) fn initialize_ok() -> Reply {
        Reply::Result(serde_json::json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {"tools": {}},
            "serverInfo": {"name": "scripted", "version": "0.0.1"}
        }))
    }

    pub(crate) fn ok(value: Value) -> Reply {
        Reply::Result(value)
    }

    pub(crate) fn error(code: i32, message: &str) -> Reply {
        Reply::Error(code, message.to_string())
    }

    pub(crate) fn hang() -> Reply {
        Reply::Hang
    }

    /// Simulate the server going away.
    pub(crate) fn kill(&self, reason: &str) {
        *self.killed.lock().unwrap() = Some(reason.to_string());
    }

    /// What `diagnostics()` reports from now on, like a child's stderr.
    pub(crate) fn set_diagnostics(&self, text: &str) {
        *self.diagnostics.lock().unwrap() = Some(text.to_string());
    }

    pub(crate) async fn push_event(&self, event: ServerEvent) {
        self.events_tx.send(event).await.unwrap();
    }

    /// Every request and notification method seen, in order.
    pub(crate) fn methods(&self) -> Vec<String> {
        self.log.lock().unwrap().iter().map(|(m, _)| m.clone()).collect()
    }

    /// Params of the most recent `method` request.
    pub(crate) fn params_for(&self, method: &str) -> Option<Value> {
        self.log
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(m, _)| m == method)
            .and_then(|(_, p)| p.clone())
    }

    /// Replies sent to server-initiated requests.
    pub(crate) fn responses(&self) -> Vec<JsonRpcResponse> {
        self.responses.lock().unwrap().clone()
    }

    pub(crate) fn close_count(&self) -> usize {
        self.close_count.load(Ordering::SeqCst)
    }

    fn closed_error(&self) -> McpError {
        McpError::TransportClosed {
            server: self.server_id.clone(),
            reason: self
                .killed
                .lock()
                .unwrap()
                .clone()
                .unwrap_or_else(|| "transport closed".to_string()),
        }
    }
}

/// A tool with a single string `path` argument.
pub(crate) fn tool(name: &str) -> ToolDef {
    serde_json::from_value(serde_json::json!({
        "name": name,
        "description": format!("{name} tool"),
        "inputSchema": {
            "type": "object",
            "properties": {"path": {"type": "string"}}
        }
    }))
    .unwrap()
}

#[async_trait]
impl Transport for ScriptedTransport {
    fn server_id(&self) -> &str {
        &self.server_id
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Stdio
    }

    async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        ctx: &CallContext,
    ) -> Result<JsonRpcResponse, McpError> {
        if self.is_closed() {
            return Err(self.closed_error());
        }
        self.log
            .lock()
            .unwrap()
            .push((method.to_string(), params.clone()));
        let id = RequestId::Number(self.next_id.fetch_add(1, Ordering::SeqCst));

        match (self.handler)(method, params) {
            Reply::Result(value) => Ok(JsonRpcResponse::success(id, value)),
            Reply::Error(code, message) => Ok(JsonRpcResponse::failure(
                id,
                JsonRpcError {
                    code,
                    message,
                    data: None,
                },
            )),
            Reply::Hang => {
                let interrupted = ctx
                    .run(std::future::pending::<()>())
                    .await
                    .unwrap_err();
                Err(interrupted_error(&self.server_id, method, ctx, interrupted))
            }
        }
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), McpError> {
        if self.is_closed() {
            return Err(self.closed_error());
        }
        self.log.lock().unwrap().push((method.to_string(), params));
        Ok(())
    }

    async fn respond(&self, response: JsonRpcResponse) -> Result<(), McpError> {
        self.responses.lock().unwrap().push(response);
        Ok(())
    }

    fn take_events(&self) -> Option<mpsc::Receiver<ServerEvent>> {
        self.events.lock().unwrap().take()
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst) || self.killed.lock().unwrap().is_some()
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.close_count.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn diagnostics(&self) -> Option<String> {
        self.diagnostics.lock().unwrap().clone()
    }
}
