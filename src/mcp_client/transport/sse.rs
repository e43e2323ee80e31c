//! HTTP + Server-Sent Events transport.
//!
//! The client opens a long-lived GET on the server's SSE URL. The first
//! `endpoint` event names the URL to POST requests to; replies and
//! server-initiated messages arrive as `message` events on the stream. When
//! the stream ends the transport is closed and pending requests fail.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{HeaderMap, ACCEPT};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use super::sse_codec::event_stream;
use super::{
    cancel_notification, interrupted_error, route_frame, was_abandoned, PendingRequests,
    Transport, EVENT_CHANNEL_CAPACITY,
};
use crate::context::CallContext;
use crate::mcp_client::errors::McpError;
use crate::mcp_client::types::{
    JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, ServerEvent, TransportKind,
};

/// JSON-RPC over an SSE stream plus POSTed requests.
pub struct SseTransport {
    server_id: String,
    http: reqwest::Client,
    headers: HeaderMap,
    /// Where requests are POSTed, as announced by the `endpoint` event.
    post_url: String,
    pending: Arc<PendingRequests>,
    next_id: AtomicU64,
    events: Mutex<Option<mpsc::Receiver<ServerEvent>>>,
    reader_task: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl SseTransport {
    /// Open the event stream and wait for the `endpoint` announcement.
    pub async fn connect(
        server_id: &str,
        url: &str,
        headers: HeaderMap,
        http: reqwest::Client,
        ctx: &CallContext,
    ) -> Result<Self, McpError> {
        let base = reqwest::Url::parse(url).map_err(|e| McpError::ConfigError {
            server: server_id.to_string(),
            reason: format!("invalid url '{url}': {e}"),
        })?;

        let request = http
            .get(base.clone())
            .headers(headers.clone())
            .header(ACCEPT, "text/event-stream")
            .send();
        let response = ctx
            .run(request)
            .await
            .map_err(|i| interrupted_error(server_id, "connect", ctx, i))?
            .map_err(|e| McpError::TransportError {
                server: server_id.to_string(),
                reason: format!("failed to open event stream: {e}"),
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(McpError::TransportError {
                server: server_id.to_string(),
                reason: format!("event stream returned HTTP {status}"),
            });
        }

        let pending = PendingRequests::new(server_id);
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (endpoint_tx, endpoint_rx) = oneshot::channel();
        let reader_task = tokio::spawn(read_stream(
            server_id.to_string(),
            response,
            Arc::clone(&pending),
            events_tx,
            endpoint_tx,
        ));

        let endpoint = match ctx.run(endpoint_rx).await {
            Ok(Ok(endpoint)) => endpoint,
            Ok(Err(_)) => {
                reader_task.abort();
                return Err(McpError::TransportClosed {
                    server: server_id.to_string(),
                    reason: pending
                        .closed_reason()
                        .unwrap_or_else(|| "stream ended before endpoint event".to_string()),
                });
            }
            Err(interrupted) => {
                reader_task.abort();
                return Err(interrupted_error(server_id, "connect", ctx, interrupted));
            }
        };

        let post_url = base.join(&endpoint).map_err(|e| McpError::TransportError {
            server: server_id.to_string(),
            reason: format!("bad endpoint '{endpoint}': {e}"),
        })?;
        tracing::info!(server = server_id, post_url = %post_url, "sse transport connected");

        Ok(Self {
            server_id: server_id.to_string(),
            http,
            headers,
            post_url: post_url.to_string(),
            pending,
            next_id: AtomicU64::new(1),
            events: Mutex::new(Some(events_rx)),
            reader_task: Mutex::new(Some(reader_task)),
            closed: AtomicBool::new(false),
        })
    }

    async fn post<T: Serialize + ?Sized>(&self, body: &T) -> Result<(), McpError> {
        post_frame(&self.http, &self.post_url, &self.headers, &self.server_id, body).await
    }

    fn send_cancel(&self, id: u64, reason: &str) {
        let http = self.http.clone();
        let url = self.post_url.clone();
        let headers = self.headers.clone();
        let server = self.server_id.clone();
        let note = cancel_notification(id, reason);
        tokio::spawn(async move {
            if let Err(e) = post_frame(&http, &url, &headers, &server, &note).await {
                tracing::debug!(server = %server, request_id = id, error = %e, "cancel notification not delivered");
            }
        });
    }

    fn closed_error(&self) -> McpError {
        McpError::TransportClosed {
            server: self.server_id.clone(),
            reason: self
                .pending
                .closed_reason()
                .unwrap_or_else(|| "transport closed".to_string()),
        }
    }
}

#[async_trait]
impl Transport for SseTransport {
    fn server_id(&self) -> &str {
        &self.server_id
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Sse
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
        let (_guard, rx) = self.pending.register(id)?;
        let body = JsonRpcRequest::new(id, method, params);

        let result = match ctx.run(self.post(&body)).await {
            Ok(Ok(())) => self.pending.await_reply(method, rx, ctx).await,
            Ok(Err(e)) => Err(e),
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
        self.post(&JsonRpcNotification::new(method, params)).await
    }

    async fn respond(&self, response: JsonRpcResponse) -> Result<(), McpError> {
        if self.is_closed() {
            return Err(self.closed_error());
        }
        self.post(&response).await
    }

    fn take_events(&self) -> Option<mpsc::Receiver<ServerEvent>> {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).take()
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst) || self.pending.is_closed()
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.pending.close("transport closed");
        let task = self
            .reader_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(task) = task {
            // Dropping the response body closes the connection.
            task.abort();
        }
        tracing::debug!(server = %self.server_id, "sse transport closed");
    }
}

async fn read_stream(
    server: String,
    response: reqwest::Response,
    pending: Arc<PendingRequests>,
    events_tx: mpsc::Sender<ServerEvent>,
    endpoint_tx: oneshot::Sender<String>,
) {
    let mut endpoint_tx = Some(endpoint_tx);
    let mut stream = std::pin::pin!(event_stream(response));

    let reason = loop {
        match stream.next().await {
            Some(Ok(event)) => match event.event.as_deref() {
                Some("endpoint") => match endpoint_tx.take() {
                    Some(tx) => {
                        let _ = tx.send(event.data.trim().to_string());
                    }
                    None => {
                        tracing::debug!(server = %server, "ignoring repeated endpoint event");
                    }
                },
                None | Some("message") => route_frame(&server, &event.data, &pending, &events_tx),
                Some(other) => {
                    tracing::debug!(server = %server, event = other, "ignoring unknown sse event type");
                }
            },
            Some(Err(reason)) => break reason,
            None => break "event stream closed by server".to_string(),
        }
    };

    if pending.close(&reason) {
        tracing::warn!(server = %server, reason = %reason, "sse transport closed");
    }
}

async fn post_frame<T: Serialize + ?Sized>(
    http: &reqwest::Client,
    url: &str,
    headers: &HeaderMap,
    server: &str,
    body: &T,
) -> Result<(), McpError> {
    let response = http
        .post(url)
        .headers(headers.clone())
        .json(body)
        .send()
        .await
        .map_err(|e| McpError::TransportError {
            server: server.to_string(),
            reason: format!("POST failed: {e}"),
        })?;

    let status = response.status();
    if !status.is_success() {
        let text = response.text().await.unwrap_or_default();
        return Err(McpError::TransportError {
            server: server.to_string(),
            reason: format!("POST returned HTTP {status}: {}", text.trim()),
        });
    }
    Ok(())
}

// ─── Tests ───────────────────────────────────────────────────────────────────
