//! Streamable HTTP transport.
//!
//! Every request is its own POST. The server answers with either a JSON body
//! (a single response or a batch) or an SSE-framed body that carries the
//! response plus any notifications emitted while handling it. A session id
//! handed out in the `Mcp-Session-Id` header is echoed on later requests and
//! released with a DELETE on close.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{HeaderMap, ACCEPT, CONTENT_TYPE};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;

use super::sse_codec::event_stream;
use super::{
    cancel_notification, forward_event, interrupted_error, was_abandoned, Transport,
    EVENT_CHANNEL_CAPACITY,
};
use crate::context::CallContext;
use crate::mcp_client::errors::McpError;
use crate::mcp_client::types::{
    IncomingFrame, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, RequestId, ServerEvent,
    TransportKind,
};

/// Header carrying the server-assigned session id.
pub const SESSION_HEADER: &str = "mcp-session-id";

const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// JSON-RPC over one POST per message.
pub struct HttpTransport {
    server_id: String,
    url: String,
    headers: HeaderMap,
    http: reqwest::Client,
    session_id: Arc<Mutex<Option<String>>>,
    next_id: AtomicU64,
    events_tx: mpsc::Sender<ServerEvent>,
    events: Mutex<Option<mpsc::Receiver<ServerEvent>>>,
    closed: AtomicBool,
}

impl HttpTransport {
    /// No I/O happens until the first request.
    pub fn new(server_id: &str, url: &str, headers: HeaderMap, http: reqwest::Client) -> Self {
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            server_id: server_id.to_string(),
            url: url.to_string(),
            headers,
            http,
            session_id: Arc::new(Mutex::new(None)),
            next_id: AtomicU64::new(1),
            events_tx,
            events: Mutex::new(Some(events_rx)),
            closed: AtomicBool::new(false),
        }
    }

    /// The session id assigned by the server, if any.
    pub fn session_id(&self) -> Option<String> {
        self.session_id
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn poster(&self) -> Poster {
        Poster {
            server_id: self.server_id.clone(),
            url: self.url.clone(),
            headers: self.headers.clone(),
            http: self.http.clone(),
            session_id: Arc::clone(&self.session_id),
        }
    }

    /// POST one request and read until its reply shows up.
    async fn exchange(&self, id: u64, body: &JsonRpcRequest) -> Result<JsonRpcResponse, McpError> {
        let response = self.poster().post(body).await?;

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_ascii_lowercase();

        if content_type.starts_with("text/event-stream") {
            let mut stream = std::pin::pin!(event_stream(response));
            while let Some(item) = stream.next().await {
                let event = item.map_err(|reason| self.transport_error(reason))?;
                if let Some(reply) = self.take_frame(id, &event.data) {
                    return Ok(reply);
                }
            }
            return Err(self.transport_error("reply stream ended without a response".to_string()));
        }

        let text = response
            .text()
            .await
            .map_err(|e| self.transport_error(format!("failed to read body: {e}")))?;
        if text.trim().is_empty() {
            return Err(self.transport_error("server accepted the request but sent no reply".to_string()));
        }

        let value: Value = serde_json::from_str(&text)
            .map_err(|e| self.transport_error(format!("invalid JSON reply: {e}")))?;
        let frames = match value {
            Value::Array(items) => items,
            single => vec![single],
        };

        let mut reply = None;
        for frame in frames {
            let text = frame.to_string();
            if reply.is_none() {
                reply = self.take_frame(id, &text);
            } else {
                self.take_frame(id, &text);
            }
        }
        reply.ok_or_else(|| self.transport_error(format!("no reply with id {id} in response body")))
    }

    /// Classify one frame; returns it if it is the reply to `id`, otherwise
    /// forwards events and drops unrelated replies.
    fn take_frame(&self, id: u64, text: &str) -> Option<JsonRpcResponse> {
        match IncomingFrame::parse(text) {
            Ok(IncomingFrame::Response(resp)) if resp.id == RequestId::Number(id) => Some(resp),
            Ok(IncomingFrame::Response(resp)) => {
                tracing::debug!(server = %self.server_id, id = %resp.id, "discarding reply for another request");
                None
            }
            Ok(IncomingFrame::Event(event)) => {
                forward_event(&self.server_id, event, &self.events_tx);
                None
            }
            Err(reason) => {
                tracing::debug!(server = %self.server_id, reason = %reason, "discarding malformed frame");
                None
            }
        }
    }

    fn send_cancel(&self, id: u64, reason: &str) {
        let poster = self.poster();
        let note = cancel_notification(id, reason);
        tokio::spawn(async move {
            if let Err(e) = poster.post(&note).await {
                tracing::debug!(server = %poster.server_id, request_id = id, error = %e, "cancel notification not delivered");
            }
        });
    }

    fn transport_error(&self, reason: String) -> McpError {
        McpError::TransportError {
            server: self.server_id.clone(),
            reason,
        }
    }

    fn closed_error(&self) -> McpError {
        McpError::TransportClosed {
            server: self.server_id.clone(),
            reason: "transport closed".to_string(),
        }
    }
}

/// Everything needed to POST a frame, detached from the transport so
/// fire-and-forget sends can outlive the call that started them.
struct Poster {
    server_id: String,
    url: String,
    headers: HeaderMap,
    http: reqwest::Client,
    session_id: Arc<Mutex<Option<String>>>,
}

impl Poster {
    async fn post<T: Serialize + ?Sized>(&self, body: &T) -> Result<reqwest::Response, McpError> {
        let mut request = self
            .http
            .post(&self.url)
            .headers(self.headers.clone())
            .header(ACCEPT, "application/json, text/event-stream")
            .json(body);
        if let Some(session) = self.current_session() {
            request = request.header(SESSION_HEADER, session);
        }

        let response = request.send().await.map_err(|e| McpError::TransportError {
            server: self.server_id.clone(),
            reason: format!("POST failed: {e}"),
        })?;

        if let Some(session) = response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            let mut slot = self.session_id.lock().unwrap_or_else(|e| e.into_inner());
            if slot.as_deref() != Some(session) {
                tracing::debug!(server = %self.server_id, session, "session id assigned");
                *slot = Some(session.to_string());
            }
        }

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(McpError::TransportError {
                server: self.server_id.clone(),
                reason: format!("POST returned HTTP {status}: {}", text.trim()),
            });
        }
        Ok(response)
    }

    fn current_session(&self) -> Option<String> {
        self.session_id
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[async_trait]
impl Transport for HttpTransport {
    fn server_id(&self) -> &str {
        &self.server_id
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Http
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

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = JsonRpcRequest::new(id, method, params);
        let result = match ctx.run(self.exchange(id, &body)).await {
            Ok(result) => result,
            Err(interrupted) => Err(interrupted_error(&self.server_id, method, ctx, interrupted)),
        };

        if let Err(e) = &result {
            if was_abandoned(e) {
                self.send_cancel(id, &e.to_string());
            }
        }
        result
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), McpError> {
        if self.is_closed() {
            return Err(self.closed_error());
        }
        self.poster()
            .post(&JsonRpcNotification::new(method, params))
            .await
            .map(|_| ())
    }

    async fn respond(&self, response: JsonRpcResponse) -> Result<(), McpError> {
        if self.is_closed() {
            return Err(self.closed_error());
        }
        self.poster().post(&response).await.map(|_| ())
    }

    fn take_events(&self) -> Option<mpsc::Receiver<ServerEvent>> {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).take()
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let Some(session) = self.session_id() else {
            return;
        };

        let delete = self
            .http
            .delete(&self.url)
            .headers(self.headers.clone())
            .header(SESSION_HEADER, session)
            .send();
        match tokio::time::timeout(CLOSE_TIMEOUT, delete).await {
            Ok(Ok(resp)) => {
                tracing::debug!(server = %self.server_id, status = %resp.status(), "session released");
            }
            Ok(Err(e)) => {
                tracing::debug!(server = %self.server_id, error = %e, "session release failed");
            }
            Err(_) => {
                tracing::debug!(server = %self.server_id, "session release timed out");
            }
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
