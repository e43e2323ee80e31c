//! JSON-RPC transports.
//!
//! One [`Transport`] is one connection to one tool server. Three variants
//! share the same contract:
//! - `stdio`: child process, one JSON object per stdout line
//! - `sse`: long-lived `text/event-stream` GET, requests POSTed to the
//!   endpoint the server announces, replies delivered on the stream
//! - `http` (streamable HTTP): one POST per request, reply is either a JSON
//!   body or an SSE-framed body
//!
//! Replies are matched to requests by id through [`PendingRequests`]; all
//! other inbound frames go to a bounded event channel that the owning
//! session drains.

pub mod http;
pub mod sse;
pub mod sse_codec;
pub mod stdio;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use super::errors::McpError;
use super::types::{
    Endpoint, IncomingFrame, JsonRpcNotification, JsonRpcResponse, RequestId, ServerEvent,
    ServerSpec, TransportKind,
};
use crate::context::{CallContext, Interrupted};

pub use http::HttpTransport;
pub use sse::SseTransport;
pub use stdio::StdioTransport;

/// Capacity of the per-transport server-event channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 64;

// ─── Contract ────────────────────────────────────────────────────────────────

/// Uniform request/response + event contract over any framing.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Id of the server this transport talks to (for logs and errors).
    fn server_id(&self) -> &str;

    fn kind(&self) -> TransportKind;

    /// Send a request and wait for the reply with the same id.
    ///
    /// Never waits past `ctx`'s deadline. On deadline or cancellation the
    /// pending entry is dropped and the server is told to cancel.
    async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        ctx: &CallContext,
    ) -> Result<JsonRpcResponse, McpError>;

    /// Send a notification (no reply expected).
    async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), McpError>;

    /// Reply to a server-initiated request.
    async fn respond(&self, response: JsonRpcResponse) -> Result<(), McpError>;

    /// The stream of server-initiated frames. Yields `Some` exactly once.
    fn take_events(&self) -> Option<mpsc::Receiver<ServerEvent>>;

    fn is_closed(&self) -> bool;

    /// Release the connection and any OS resources. Idempotent.
    async fn close(&self);

    /// Extra context for error messages, unlabelled (e.g. the recent child
    /// stderr tail). The session decides how to present it.
    fn diagnostics(&self) -> Option<String> {
        None
    }
}

/// Open a transport for `spec`. Connection setup (spawning, the SSE GET)
/// is bounded by `ctx`.
pub async fn open(
    spec: &ServerSpec,
    http: &reqwest::Client,
    ctx: &CallContext,
) -> Result<Box<dyn Transport>, McpError> {
    let endpoint = spec.endpoint().map_err(|reason| McpError::ConfigError {
        server: spec.id.clone(),
        reason,
    })?;

    match endpoint {
        Endpoint::Process {
            command,
            args,
            env,
            cwd,
        } => {
            let transport = StdioTransport::spawn(&spec.id, &command, &args, &env, cwd.as_deref())?;
            Ok(Box::new(transport))
        }
        Endpoint::Url { url, headers } => {
            let headers = header_map(&spec.id, &headers)?;
            if spec.transport_kind() == Some(TransportKind::Sse) {
                let transport =
                    SseTransport::connect(&spec.id, &url, headers, http.clone(), ctx).await?;
                Ok(Box::new(transport))
            } else {
                Ok(Box::new(HttpTransport::new(&spec.id, &url, headers, http.clone())))
            }
        }
    }
}

// ─── Pending Requests ────────────────────────────────────────────────────────

/// In-flight request table shared between a transport's writer side and its
/// reader task.
pub(crate) struct PendingRequests {
    server: String,
    inner: Mutex<PendingInner>,
}

struct PendingInner {
    waiters: HashMap<u64, oneshot::Sender<JsonRpcResponse>>,
    closed: Option<String>,
}

impl PendingRequests {
    pub(crate) fn new(server: &str) -> Arc<Self> {
        Arc::new(Self {
            server: server.to_string(),
            inner: Mutex::new(PendingInner {
                waiters: HashMap::new(),
                closed: None,
            }),
        })
    }

    /// Register interest in the reply to `id`. The entry is removed when the
    /// returned guard drops, whether or not a reply arrived.
    pub(crate) fn register(
        self: &Arc<Self>,
        id: u64,
    ) -> Result<(PendingGuard, oneshot::Receiver<JsonRpcResponse>), McpError> {
        let (tx, rx) = oneshot::channel();
        let mut inner = self.lock();
        if let Some(reason) = &inner.closed {
            return Err(McpError::TransportClosed {
                server: self.server.clone(),
                reason: reason.clone(),
            });
        }
        inner.waiters.insert(id, tx);
        Ok((
            PendingGuard {
                pending: Arc::clone(self),
                id,
            },
            rx,
        ))
    }

    /// Hand a reply to its waiter. Returns `false` for unknown or stale ids.
    pub(crate) fn complete(&self, response: JsonRpcResponse) -> bool {
        let id = match &response.id {
            RequestId::Number(n) => *n,
            RequestId::String(_) => return false,
        };
        let waiter = self.lock().waiters.remove(&id);
        match waiter {
            Some(tx) => tx.send(response).is_ok(),
            None => false,
        }
    }

    /// Mark the connection closed and fail every waiter. Returns `true` the
    /// first time only.
    pub(crate) fn close(&self, reason: &str) -> bool {
        let mut inner = self.lock();
        if inner.closed.is_some() {
            return false;
        }
        inner.closed = Some(reason.to_string());
        // Dropping the senders wakes every receiver with a RecvError.
        inner.waiters.clear();
        true
    }

    pub(crate) fn closed_reason(&self) -> Option<String> {
        self.lock().closed.clone()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.lock().closed.is_some()
    }

    #[cfg(test)]
    pub(crate) fn in_flight(&self) -> usize {
        self.lock().waiters.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PendingInner> {
        // A poisoned table still holds valid data; keep using it.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Wait for the reply behind `rx`, bounded by `ctx`.
    pub(crate) async fn await_reply(
        &self,
        method: &str,
        rx: oneshot::Receiver<JsonRpcResponse>,
        ctx: &CallContext,
    ) -> Result<JsonRpcResponse, McpError> {
        match ctx.run(rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(McpError::TransportClosed {
                server: self.server.clone(),
                reason: self
                    .closed_reason()
                    .unwrap_or_else(|| "connection closed".to_string()),
            }),
            Err(interrupted) => Err(interrupted_error(&self.server, method, ctx, interrupted)),
        }
    }
}

/// Removes a pending entry on drop.
pub(crate) struct PendingGuard {
    pending: Arc<PendingRequests>,
    id: u64,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.pending.lock().waiters.remove(&self.id);
    }
}

// ─── Shared Helpers ──────────────────────────────────────────────────────────

/// Route one inbound frame: replies to their waiter, everything else to the
/// event channel. Malformed frames are logged and dropped.
pub(crate) fn route_frame(
    server: &str,
    text: &str,
    pending: &PendingRequests,
    events: &mpsc::Sender<ServerEvent>,
) {
    match IncomingFrame::parse(text) {
        Ok(IncomingFrame::Response(response)) => {
            let id = response.id.clone();
            if !pending.complete(response) {
                tracing::debug!(server, id = %id, "discarding reply with no waiter");
            }
        }
        Ok(IncomingFrame::Event(event)) => forward_event(server, event, events),
        Err(reason) => {
            tracing::debug!(server, reason = %reason, frame = %preview(text), "discarding malformed frame");
        }
    }
}

/// Push a server event without blocking the reader.
pub(crate) fn forward_event(server: &str, event: ServerEvent, events: &mpsc::Sender<ServerEvent>) {
    match events.try_send(event) {
        Ok(()) => {}
        Err(mpsc::error::TrySendError::Full(event)) => {
            tracing::warn!(server, method = %event.method(), "event channel full, dropping server event");
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {}
    }
}

/// The `notifications/cancelled` frame for an abandoned request.
pub(crate) fn cancel_notification(id: u64, reason: &str) -> JsonRpcNotification {
    JsonRpcNotification::new(
        "notifications/cancelled",
        Some(serde_json::json!({ "requestId": id, "reason": reason })),
    )
}

/// Convert a context interruption into the matching error.
pub(crate) fn interrupted_error(
    server: &str,
    method: &str,
    ctx: &CallContext,
    interrupted: Interrupted,
) -> McpError {
    match interrupted {
        Interrupted::DeadlineExceeded => McpError::Timeout {
            server: server.to_string(),
            operation: method.to_string(),
            timeout_ms: ctx.budget().as_millis() as u64,
        },
        Interrupted::Cancelled => McpError::Cancelled {
            server: server.to_string(),
            operation: method.to_string(),
        },
    }
}

/// Whether an error means the request was abandoned locally.
pub(crate) fn was_abandoned(err: &McpError) -> bool {
    matches!(err, McpError::Timeout { .. } | McpError::Cancelled { .. })
}

/// Build request headers from configuration values.
pub(crate) fn header_map(
    server: &str,
    headers: &HashMap<String, String>,
) -> Result<HeaderMap, McpError> {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        let name = HeaderName::from_bytes(name.as_bytes()).map_err(|e| McpError::ConfigError {
            server: server.to_string(),
            reason: format!("invalid header name '{name}': {e}"),
        })?;
        let value = HeaderValue::from_str(value).map_err(|e| McpError::ConfigError {
            server: server.to_string(),
            reason: format!("invalid value for header '{name}': {e}"),
        })?;
        map.insert(name, value);
    }
    Ok(map)
}

/// Extract the result from a JSON-RPC response, converting errors to `McpError`.
pub fn extract_result(response: JsonRpcResponse) -> Result<Value, McpError> {
    if let Some(err) = response.error {
        return Err(McpError::ServerError {
            code: err.code,
            message: err.message,
            data: err.data,
        });
    }

    response.result.ok_or(McpError::ServerError {
        code: super::types::error_codes::INTERNAL_ERROR,
        message: "response missing both result and error".into(),
        data: None,
    })
}

fn preview(text: &str) -> &str {
    let mut end = text.len().min(200);
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

// ─── Tests ───────────────────────────────────────────────────────────────────
