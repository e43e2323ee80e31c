//! Chat front-end contract and the console front-end.
//!
//! The runtime knows nothing about chat semantics beyond this: messages
//! arrive as `{thread_id, user_id, text}` and replies go out through
//! [`ChatFrontend::send`], with optional transient status lines.

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, Mutex};

use crate::errors::ErrorKind;

/// Thread id used for every console message.
pub const CONSOLE_THREAD: &str = "console";

/// Ingress buffer between the front-end reader and the supervisor.
const INGRESS_CAPACITY: usize = 64;

// ─── Contract ────────────────────────────────────────────────────────────────

/// One inbound chat message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingMessage {
    pub thread_id: String,
    pub user_id: String,
    pub text: String,
}

impl IncomingMessage {
    pub fn new(thread_id: &str, user_id: &str, text: &str) -> Self {
        Self {
            thread_id: thread_id.to_string(),
            user_id: user_id.to_string(),
            text: text.to_string(),
        }
    }
}

#[derive(Debug, Error)]
pub enum FrontendError {
    /// A message could not be delivered.
    #[error("failed to send to thread '{thread_id}': {reason}")]
    SendFailed { thread_id: String, reason: String },

    /// The front-end connection is gone.
    #[error("front-end disconnected: {reason}")]
    Disconnected { reason: String },
}

impl FrontendError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::TransportError
    }
}

/// Egress side of a chat front-end.
#[async_trait]
pub trait ChatFrontend: Send + Sync {
    /// Deliver a user-visible message to a thread.
    async fn send(&self, thread_id: &str, text: &str) -> Result<(), FrontendError>;

    /// Show a transient status (e.g. "thinking…"). Best-effort.
    async fn status(&self, thread_id: &str, text: &str) -> Result<(), FrontendError>;
}

// ─── Console ─────────────────────────────────────────────────────────────────

/// Line-oriented front-end: replies and status lines go to a writer
/// (stdout in production). Status lines are prefixed with `…`.
pub struct ConsoleFrontend<W> {
    out: Mutex<W>,
}

impl ConsoleFrontend<tokio::io::Stdout> {
    pub fn stdout() -> Self {
        Self::new(tokio::io::stdout())
    }
}

impl<W> ConsoleFrontend<W>
where
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(out: W) -> Self {
        Self { out: Mutex::new(out) }
    }

    /// Consume the front-end and return its writer.
    pub fn into_inner(self) -> W {
        self.out.into_inner()
    }

    async fn write_line(&self, thread_id: &str, line: &str) -> Result<(), FrontendError> {
        let mut out = self.out.lock().await;
        let result = async {
            out.write_all(line.as_bytes()).await?;
            out.write_all(b"\n").await?;
            out.flush().await
        }
        .await;
        result.map_err(|e| FrontendError::SendFailed {
            thread_id: thread_id.to_string(),
            reason: e.to_string(),
        })
    }
}

#[async_trait]
impl<W> ChatFrontend for ConsoleFrontend<W>
where
    W: AsyncWrite + Unpin + Send,
{
    async fn send(&self, thread_id: &str, text: &str) -> Result<(), FrontendError> {
        self.write_line(thread_id, text).await
    }

    async fn status(&self, thread_id: &str, text: &str) -> Result<(), FrontendError> {
        self.write_line(thread_id, &format!("… {text}")).await
    }
}

/// Read non-empty lines from `reader` as messages on the console thread.
/// The channel closes when the reader hits EOF or fails.
pub fn read_console_lines<R>(reader: R, user_id: &str) -> mpsc::Receiver<IncomingMessage>
where
    R: AsyncBufRead + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(INGRESS_CAPACITY);
    let user_id = user_id.to_string();

    tokio::spawn(async move {
        let mut lines = reader.lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    let text = line.trim();
                    if text.is_empty() {
                        continue;
                    }
                    let msg = IncomingMessage::new(CONSOLE_THREAD, &user_id, text);
                    if tx.send(msg).await.is_err() {
                        break;
                    }
                }
                Ok(None) => {
                    tracing::info!("console input closed");
                    break;
                }
                Err(e) => {
                    tracing::error!(error = %e, "console input failed");
                    break;
                }
            }
        }
    });

    rx
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    #[tokio::test]
    async fn test_console_writes_replies_and_status() {
        let console = ConsoleFrontend::new(Vec::<u8>::new());
        console.status("console", "thinking…").await.unwrap();
        console.send("console", "The file says: hello").await.unwrap();

        let out = String::from_utf8(console.into_inner()).unwrap();
        assert_eq!(out, "… thinking…\nThe file says: hello\n");
    }

    #[tokio::test]
    async fn test_read_console_lines_skips_blank() {
        let input = Cursor::new(b"read /tmp/a\n\n   \nsecond\n".to_vec());
        let mut rx = read_console_lines(input, "me");

        let first = rx.recv().await.unwrap();
        assert_eq!(first, IncomingMessage::new("console", "me", "read /tmp/a"));
        assert_eq!(rx.recv().await.unwrap().text, "second");
        assert!(rx.recv().await.is_none());
    }
}
