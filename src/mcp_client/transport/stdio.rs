//! JSON-RPC over a child process's stdio.
//!
//! One JSON object per line in both directions. A background task owns the
//! read side: replies are matched to waiters by id, everything else becomes
//! a server event, and lines that are not JSON-RPC (servers that print
//! banners to stdout) are dropped. EOF on stdout closes the transport and
//! fails every pending request.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use super::{
    cancel_notification, interrupted_error, route_frame, was_abandoned, PendingRequests,
    Transport, EVENT_CHANNEL_CAPACITY,
};
use crate::context::CallContext;
use crate::mcp_client::errors::McpError;
use crate::mcp_client::types::{
    JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, ServerEvent, TransportKind,
};

// ─── Constants ───────────────────────────────────────────────────────────────

/// How long `close()` waits for the child to exit after stdin is closed.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

/// How much trailing stderr is kept for error messages.
const STDERR_TAIL_CHARS: usize = 2000;

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

// ─── Transport ───────────────────────────────────────────────────────────────

/// Bi-directional JSON-RPC transport over a child process's stdio.
pub struct StdioTransport {
    server_id: String,
    /// `None` once stdin has been closed.
    writer: Arc<Mutex<Option<BoxedWriter>>>,
    pending: Arc<PendingRequests>,
    next_id: AtomicU64,
    events: std::sync::Mutex<Option<mpsc::Receiver<ServerEvent>>>,
    child: Mutex<Option<Child>>,
    stderr_tail: Arc<std::sync::Mutex<String>>,
    reader_task: std::sync::Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl StdioTransport {
    /// Spawn `command` with piped stdio and attach a transport to it.
    ///
    /// The child is killed if the transport is dropped without `close()`.
    pub fn spawn(
        server_id: &str,
        command: &str,
        args: &[String],
        env: &HashMap<String, String>,
        cwd: Option<&str>,
    ) -> Result<Self, McpError> {
        let mut cmd = Command::new(command);
        cmd.args(args);
        for (key, value) in env {
            cmd.env(key, value);
        }
        if let Some(dir) = cwd {
            cmd.current_dir(dir);
        }

        // Windows: prevent console window from appearing for child processes
        #[cfg(target_os = "windows")]
        {
            const CREATE_NO_WINDOW: u32 = 0x08000000;
            cmd.creation_flags(CREATE_NO_WINDOW);
        }

        cmd.stdin(std::process::Stdio::piped());
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());
        cmd.kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| McpError::SpawnFailed {
            name: server_id.to_string(),
            reason: format!("{command}: {e}"),
        })?;

        let stdin = child.stdin.take().ok_or(McpError::SpawnFailed {
            name: server_id.to_string(),
            reason: "failed to capture stdin".into(),
        })?;
        let stdout = child.stdout.take().ok_or(McpError::SpawnFailed {
            name: server_id.to_string(),
            reason: "failed to capture stdout".into(),
        })?;
        let stderr = child.stderr.take();

        tracing::info!(
            server = server_id,
            command,
            pid = child.id(),
            "spawned tool server process"
        );

        let transport = Self::build(server_id, Box::new(stdin), stdout, Some(child));
        if let Some(stderr) = stderr {
            tokio::spawn(pump_stderr(
                server_id.to_string(),
                stderr,
                Arc::clone(&transport.stderr_tail),
            ));
        }
        Ok(transport)
    }

    /// Attach a transport to an arbitrary pipe pair (no child process).
    pub fn from_pipes<W, R>(server_id: &str, writer: W, reader: R) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
        R: AsyncRead + Send + Unpin + 'static,
    {
        Self::build(server_id, Box::new(writer), reader, None)
    }

    fn build<R>(server_id: &str, writer: BoxedWriter, reader: R, child: Option<Child>) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        let pending = PendingRequests::new(server_id);
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let reader_task = tokio::spawn(read_loop(
            server_id.to_string(),
            reader,
            Arc::clone(&pending),
            events_tx,
        ));

        Self {
            server_id: server_id.to_string(),
            writer: Arc::new(Mutex::new(Some(writer))),
            pending,
            next_id: AtomicU64::new(1),
            events: std::sync::Mutex::new(Some(events_rx)),
            child: Mutex::new(child),
            stderr_tail: Arc::new(std::sync::Mutex::new(String::new())),
            reader_task: std::sync::Mutex::new(Some(reader_task)),
            closed: AtomicBool::new(false),
        }
    }

    /// Write one frame on a background task so an interrupted caller never
    /// leaves half a line in the pipe.
    async fn send_line(&self, line: String, method: &str, ctx: &CallContext) -> Result<(), McpError> {
        let writer = Arc::clone(&self.writer);
        let server = self.server_id.clone();
        let write = tokio::spawn(async move { write_frame(&writer, &server, &line).await });

        match ctx.run(write).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => Err(McpError::TransportError {
                server: self.server_id.clone(),
                reason: format!("writer task failed: {join_err}"),
            }),
            Err(interrupted) => Err(interrupted_error(&self.server_id, method, ctx, interrupted)),
        }
    }

    /// Tell the server to stop working on `id`. Fire-and-forget.
    fn send_cancel(&self, id: u64, reason: &str) {
        let writer = Arc::clone(&self.writer);
        let server = self.server_id.clone();
        let note = cancel_notification(id, reason);
        tokio::spawn(async move {
            let result = match encode(&server, &note) {
                Ok(line) => write_frame(&writer, &server, &line).await,
                Err(e) => Err(e),
            };
            if let Err(e) = result {
                tracing::debug!(server = %server, request_id = id, error = %e, "cancel notification not delivered");
            }
        });
    }

    async fn write_now(&self, line: &str) -> Result<(), McpError> {
        if self.is_closed() {
            return Err(self.closed_error());
        }
        write_frame(&self.writer, &self.server_id, line).await
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
impl Transport for StdioTransport {
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

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (_guard, rx) = self.pending.register(id)?;
        let line = encode(&self.server_id, &JsonRpcRequest::new(id, method, params))?;

        let result = match self.send_line(line, method, ctx).await {
            Ok(()) => self.pending.await_reply(method, rx, ctx).await,
            Err(e) => Err(e),
        };

        if let Err(e) = &result {
            if was_abandoned(e) {
                tracing::debug!(server = %self.server_id, method, request_id = id, "abandoning request");
                self.send_cancel(id, &e.to_string());
            }
        }
        result
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), McpError> {
        let line = encode(&self.server_id, &JsonRpcNotification::new(method, params))?;
        self.write_now(&line).await
    }

    async fn respond(&self, response: JsonRpcResponse) -> Result<(), McpError> {
        let line = encode(&self.server_id, &response)?;
        self.write_now(&line).await
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

        // Closing stdin is the polite shutdown request for stdio servers. A
        // writer stuck on a full pipe is abandoned; killing the child below
        // unblocks it.
        if let Ok(mut writer) = tokio::time::timeout(SHUTDOWN_TIMEOUT, self.writer.lock()).await {
            if let Some(mut w) = writer.take() {
                let _ = w.shutdown().await;
            }
        }

        if let Some(mut child) = self.child.lock().await.take() {
            match tokio::time::timeout(SHUTDOWN_TIMEOUT, child.wait()).await {
                Ok(Ok(status)) => {
                    tracing::debug!(server = %self.server_id, %status, "tool server exited");
                }
                _ => {
                    tracing::warn!(server = %self.server_id, "tool server did not exit, killing");
                    let _ = child.kill().await;
                }
            }
        }

        let task = self
            .reader_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(task) = task {
            task.abort();
        }
    }

    fn diagnostics(&self) -> Option<String> {
        let tail = self.stderr_tail.lock().unwrap_or_else(|e| e.into_inner());
        if tail.trim().is_empty() {
            None
        } else {
            Some(tail.trim().to_string())
        }
    }
}

// ─── Background Tasks ────────────────────────────────────────────────────────

async fn read_loop<R>(
    server: String,
    reader: R,
    pending: Arc<PendingRequests>,
    events: mpsc::Sender<ServerEvent>,
) where
    R: AsyncRead + Send + Unpin + 'static,
{
    let mut lines = BufReader::new(reader).lines();
    let reason = loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let trimmed = line.trim();
                if !trimmed.is_empty() {
                    route_frame(&server, trimmed, &pending, &events);
                }
            }
            Ok(None) => break "server stdout closed (process may have exited)".to_string(),
            Err(e) => break format!("failed to read from stdout: {e}"),
        }
    };

    if pending.close(&reason) {
        tracing::warn!(server = %server, reason = %reason, "stdio transport closed");
    }
}

async fn pump_stderr(server: String, stderr: ChildStderr, tail: Arc<std::sync::Mutex<String>>) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        tracing::debug!(server = %server, line = %line, "server stderr");
        let mut tail = tail.lock().unwrap_or_else(|e| e.into_inner());
        push_tail(&mut tail, &line);
    }
}

/// Append `line` to `tail`, keeping only the last `STDERR_TAIL_CHARS` bytes.
fn push_tail(tail: &mut String, line: &str) {
    if !tail.is_empty() {
        tail.push('\n');
    }
    tail.push_str(line);
    if tail.len() > STDERR_TAIL_CHARS {
        let mut cut = tail.len() - STDERR_TAIL_CHARS;
        while !tail.is_char_boundary(cut) {
            cut += 1;
        }
        tail.drain(..cut);
    }
}

async fn write_frame(
    writer: &Mutex<Option<BoxedWriter>>,
    server: &str,
    line: &str,
) -> Result<(), McpError> {
    let mut guard = writer.lock().await;
    let w = guard.as_mut().ok_or_else(|| McpError::TransportClosed {
        server: server.to_string(),
        reason: "stdin closed".into(),
    })?;
    w.write_all(line.as_bytes())
        .await
        .map_err(|e| McpError::TransportError {
            server: server.to_string(),
            reason: format!("failed to write to stdin: {e}"),
        })?;
    w.flush().await.map_err(|e| McpError::TransportError {
        server: server.to_string(),
        reason: format!("failed to flush stdin: {e}"),
    })
}

fn encode<T: Serialize>(server: &str, message: &T) -> Result<String, McpError> {
    let mut json = serde_json::to_string(message).map_err(|e| McpError::TransportError {
        server: server.to_string(),
        reason: format!("failed to serialize message: {e}"),
    })?;
    json.push('\n');
    Ok(json)
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, split, DuplexStream, ReadHalf, WriteHalf};

    /// The far end of an in-memory stdio pair.
    struct FakeServer {
        lines: tokio::io::Lines<BufReader<ReadHalf<DuplexStream>>>,
        out: WriteHalf<DuplexStream>,
    }

    impl FakeServer {
        async fn next_message(&mut self) -> Value {
            let line = self.lines.next_line().await.unwrap().unwrap();
            serde_json::from_str(&line).unwrap()
        }

        async fn send_raw(&mut self, text: &str) {
            self.out.write_all(text.as_bytes()).await.unwrap();
            self.out.write_all(b"\n").await.unwrap();
            self.out.flush().await.unwrap();
        }

        async fn reply(&mut self, id: &Value, result: Value) {
            let msg = serde_json::json!({"jsonrpc": "2.0", "id": id, "result": result});
            self.send_raw(&msg.to_string()).await;
        }
    }

    fn pair() -> (StdioTransport, FakeServer) {
        let (client_end, server_end) = duplex(64 * 1024);
        let (client_read, client_write) = split(client_end);
        let (server_read, server_write) = split(server_end);
        let transport = StdioTransport::from_pipes("fake", client_write, client_read);
        let server = FakeServer {
            lines: BufReader::new(server_read).lines(),
            out: server_write,
        };
        (transport, server)
    }

    fn ctx(ms: u64) -> CallContext {
        CallContext::new(Duration::from_millis(ms))
    }

    #[tokio::test]
    async fn test_request_round_trip() {
        let (transport, mut server) = pair();
        let server_task = tokio::spawn(async move {
            let msg = server.next_message().await;
            assert_eq!(msg["method"], "tools/list");
            server.send_raw("server starting up...").await;
            server.reply(&msg["id"], serde_json::json!({"tools": []})).await;
            server
        });

        let resp = transport.request("tools/list", None, &ctx(1000)).await.unwrap();
        assert!(resp.result.is_some());
        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_out_of_order_replies_matched_by_id() {
        let (transport, mut server) = pair();
        let transport = Arc::new(transport);

        let server_task = tokio::spawn(async move {
            let first = server.next_message().await;
            let second = server.next_message().await;
            server.reply(&second["id"], serde_json::json!({"n": second["params"]["n"]})).await;
            server.reply(&first["id"], serde_json::json!({"n": first["params"]["n"]})).await;
            server
        });

        let a = {
            let t = Arc::clone(&transport);
            tokio::spawn(async move {
                t.request("echo", Some(serde_json::json!({"n": 1})), &ctx(1000)).await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        let b = {
            let t = Arc::clone(&transport);
            tokio::spawn(async move {
                t.request("echo", Some(serde_json::json!({"n": 2})), &ctx(1000)).await
            })
        };

        assert_eq!(a.await.unwrap().unwrap().result.unwrap()["n"], 1);
        assert_eq!(b.await.unwrap().unwrap().result.unwrap()["n"], 2);
        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_timeout_sends_cancel_notification() {
        let (transport, mut server) = pair();
        let started = std::time::Instant::now();
        let err = transport
            .request("tools/call", None, &ctx(100))
            .await
            .unwrap_err();
        assert!(matches!(err, McpError::Timeout { .. }));
        assert!(started.elapsed() < Duration::from_millis(200));

        let request = server.next_message().await;
        let cancel = server.next_message().await;
        assert_eq!(cancel["method"], "notifications/cancelled");
        assert_eq!(cancel["params"]["requestId"], request["id"]);

        // A late reply is ignored and the transport keeps working.
        server.reply(&request["id"], serde_json::json!({})).await;
        assert!(!transport.is_closed());
    }

    #[tokio::test]
    async fn test_server_exit_fails_pending_and_closes() {
        let (transport, server) = pair();
        let transport = Arc::new(transport);
        let pending = {
            let t = Arc::clone(&transport);
            tokio::spawn(async move { t.request("tools/call", None, &ctx(5000)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(server);

        let err = pending.await.unwrap().unwrap_err();
        assert!(matches!(err, McpError::TransportClosed { .. }), "got {err:?}");
        assert!(transport.is_closed());

        let err = transport.request("tools/list", None, &ctx(100)).await.unwrap_err();
        assert_eq!(err.kind(), crate::errors::ErrorKind::TransportError);
    }

    #[tokio::test]
    async fn test_server_notifications_become_events() {
        let (transport, mut server) = pair();
        let mut events = transport.take_events().unwrap();
        assert!(transport.take_events().is_none());

        server
            .send_raw(r#"{"jsonrpc":"2.0","method":"notifications/tools/list_changed"}"#)
            .await;
        server.send_raw(r#"{"jsonrpc":"2.0","id":"s1","method":"ping"}"#).await;

        let first = events.recv().await.unwrap();
        assert_eq!(first.method(), "notifications/tools/list_changed");
        let second = events.recv().await.unwrap();
        assert!(matches!(second, ServerEvent::Request { .. }));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (transport, _server) = pair();
        transport.close().await;
        transport.close().await;
        assert!(transport.is_closed());
        let err = transport.notify("notifications/initialized", None).await.unwrap_err();
        assert!(matches!(err, McpError::TransportClosed { .. }));
    }

    #[tokio::test]
    async fn test_spawn_missing_binary_fails() {
        let err = StdioTransport::spawn(
            "ghost",
            "/nonexistent/definitely-not-a-tool-server",
            &[],
            &HashMap::new(),
            None,
        )
        .err()
        .unwrap();
        assert!(matches!(err, McpError::SpawnFailed { .. }));
        assert_eq!(err.kind(), crate::errors::ErrorKind::TransportError);
    }

    #[test]
    fn test_push_tail_keeps_last_chars() {
        let mut tail = String::new();
        for i in 0..1000 {
            push_tail(&mut tail, &format!("line {i}"));
        }
        assert!(tail.len() <= STDERR_TAIL_CHARS);
        assert!(tail.ends_with("line 999"));
    }

    #[tokio::test]
    async fn test_diagnostics_is_bare_stderr_tail() {
        let (transport, _server) = pair();
        assert_eq!(transport.diagnostics(), None);
        push_tail(&mut transport.stderr_tail.lock().unwrap(), "fatal: no config");
        assert_eq!(transport.diagnostics().as_deref(), Some("fatal: no config"));
    }
}
