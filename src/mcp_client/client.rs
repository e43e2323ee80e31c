//! MCP Client: one generation of server sessions plus their registry.
//!
//! Orchestrates bring-up of every configured server, builds the tool
//! registry from the sessions that reached Ready, and routes tool calls to
//! the owning session. A reload throws the whole client away and builds a
//! new one; nothing here is patched in place.

use std::sync::{Arc, RwLock, RwLockReadGuard};
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;

use super::errors::McpError;
use super::registry::{RegisteredTool, SessionId, ToolDescription, ToolPolicy, ToolRegistry};
use super::session::{ServerSession, SessionState, LIST_TOOLS_TIMEOUT};
use super::types::{CallToolResult, ServerSpec, ToolDef};
use crate::context::CallContext;

// ─── Constants ───────────────────────────────────────────────────────────────

/// TCP connect timeout for the shared HTTP client.
const HTTP_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

// ─── Status ──────────────────────────────────────────────────────────────────

/// Per-server status line.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServerStatus {
    pub id: String,
    pub state: SessionState,
    pub tool_count: usize,
    pub last_error: Option<String>,
}

// ─── McpClient ───────────────────────────────────────────────────────────────

/// All sessions of one generation and the registry built from them.
pub struct McpClient {
    /// Indexed by [`SessionId`].
    sessions: Vec<Arc<ServerSession>>,
    /// Servers whose transport could not even be opened.
    failed: Vec<ServerStatus>,
    /// Disabled servers, skipped entirely.
    disabled: Vec<String>,
    registry: RwLock<ToolRegistry>,
}

impl McpClient {
    /// Build the shared HTTP client used by every sse/http transport.
    pub fn http_client() -> Result<reqwest::Client, McpError> {
        reqwest::Client::builder()
            .connect_timeout(HTTP_CONNECT_TIMEOUT)
            .build()
            .map_err(|e| McpError::TransportError {
                server: "*".to_string(),
                reason: format!("failed to build HTTP client: {e}"),
            })
    }

    /// Bring up every enabled server concurrently and register the tools of
    /// those that reached Ready, in configuration order.
    ///
    /// Partial startup is normal: failures are logged and reported through
    /// [`McpClient::status`], never returned.
    pub async fn start(servers: &[ServerSpec], http: &reqwest::Client, ctx: &CallContext) -> Self {
        let mut disabled = Vec::new();
        let enabled: Vec<&ServerSpec> = servers
            .iter()
            .filter(|spec| {
                if spec.disabled {
                    tracing::info!(server = %spec.id, "server disabled, skipping");
                    disabled.push(spec.id.clone());
                }
                !spec.disabled
            })
            .collect();

        let attempts = futures::future::join_all(
            enabled.iter().map(|spec| start_one((*spec).clone(), http, ctx)),
        )
        .await;

        let mut sessions = Vec::new();
        let mut failed = Vec::new();
        let mut registry = ToolRegistry::new();

        for attempt in attempts {
            match attempt {
                Ok((session, tools)) => {
                    let id: SessionId = sessions.len();
                    if let Some(tools) = tools {
                        let spec = session.spec();
                        let policy = ToolPolicy::new(&spec.allow_list, &spec.block_list);
                        let report = registry.register(id, &spec.id, &tools, &policy);
                        tracing::info!(
                            server = %spec.id,
                            registered = report.registered.len(),
                            denied = report.denied.len(),
                            skipped = report.skipped.len(),
                            "tools registered"
                        );
                    }
                    sessions.push(Arc::new(session));
                }
                Err(status) => failed.push(status),
            }
        }

        tracing::info!(
            servers = sessions.len(),
            failed = failed.len(),
            disabled = disabled.len(),
            tools = registry.len(),
            "tool runtime started"
        );

        Self {
            sessions,
            failed,
            disabled,
            registry: RwLock::new(registry),
        }
    }

    /// A client over already-built sessions. Sessions that are Ready
    /// contribute their current catalog.
    pub fn from_sessions(sessions: Vec<Arc<ServerSession>>) -> Self {
        let mut registry = ToolRegistry::new();
        for (id, session) in sessions.iter().enumerate() {
            if session.state() == SessionState::Ready {
                let spec = session.spec();
                let policy = ToolPolicy::new(&spec.allow_list, &spec.block_list);
                registry.register(id, &spec.id, &session.catalog(), &policy);
            }
        }
        Self {
            sessions,
            failed: Vec::new(),
            disabled: Vec::new(),
            registry: RwLock::new(registry),
        }
    }

    /// Read access to the registry.
    pub fn registry(&self) -> RwLockReadGuard<'_, ToolRegistry> {
        self.registry.read().unwrap_or_else(|e| e.into_inner())
    }

    /// Tool descriptions for the prompt.
    pub fn describe_all(&self) -> Vec<ToolDescription> {
        self.registry().describe_all()
    }

    /// Resolve a model-emitted name to a registered tool.
    pub fn resolve(&self, name: &str) -> Result<RegisteredTool, McpError> {
        self.registry().resolve(name).cloned()
    }

    pub fn session(&self, id: SessionId) -> Option<&Arc<ServerSession>> {
        self.sessions.get(id)
    }

    pub fn sessions(&self) -> &[Arc<ServerSession>] {
        &self.sessions
    }

    // ─── Tool Execution ──────────────────────────────────────────────────

    /// Execute a resolved tool call on its owning session.
    ///
    /// Steps:
    /// 1. Validate and coerce the arguments against the schema
    /// 2. Find the owning session
    /// 3. Send `tools/call` under `ctx`
    pub async fn call_tool(
        &self,
        tool: &RegisteredTool,
        arguments: Value,
        ctx: &CallContext,
    ) -> Result<CallToolResult, McpError> {
        let arguments = self.registry().prepare_arguments(tool, arguments)?;

        let session = self
            .sessions
            .get(tool.session)
            .ok_or_else(|| McpError::UnknownTool {
                name: tool.qualified_name.clone(),
            })?;

        session.call_tool(tool.raw_name(), arguments, ctx).await
    }

    // ─── Status ──────────────────────────────────────────────────────────

    /// One line per enabled server: open sessions first, then servers that
    /// failed to open, each group in configuration order.
    pub fn status(&self) -> Vec<ServerStatus> {
        let registry = self.registry();
        let mut lines: Vec<ServerStatus> = self
            .sessions
            .iter()
            .map(|s| ServerStatus {
                id: s.id().to_string(),
                state: s.state(),
                tool_count: registry.tools_for_server(s.id()),
                last_error: s.last_error(),
            })
            .collect();
        lines.extend(self.failed.iter().cloned());
        lines
    }

    pub fn disabled_servers(&self) -> &[String] {
        &self.disabled
    }

    /// Number of registered tools.
    pub fn tool_count(&self) -> usize {
        self.registry().len()
    }

    // ─── Shutdown ────────────────────────────────────────────────────────

    /// Close every session concurrently and empty the registry.
    pub async fn shutdown_all(&self) {
        futures::future::join_all(self.sessions.iter().map(|s| s.close())).await;
        *self.registry.write().unwrap_or_else(|e| e.into_inner()) = ToolRegistry::new();
        tracing::info!(servers = self.sessions.len(), "all sessions closed");
    }
}

/// Open and bring up one server. `Ok((session, None))` is a session that
/// exists but did not reach Ready; `Err` means no session could be created.
async fn start_one(
    spec: ServerSpec,
    http: &reqwest::Client,
    ctx: &CallContext,
) -> Result<(ServerSession, Option<Vec<ToolDef>>), ServerStatus> {
    let id = spec.id.clone();
    let budget = ctx.child(spec.initialize_timeout() + LIST_TOOLS_TIMEOUT);

    let session = match ServerSession::open(spec, http, &budget).await {
        Ok(session) => session,
        Err(e) => {
            tracing::error!(server = %id, error = %e, kind = %e.kind(), "failed to open transport");
            return Err(ServerStatus {
                id,
                state: SessionState::Degraded,
                tool_count: 0,
                last_error: Some(e.to_string()),
            });
        }
    };

    match session.bring_up(&budget).await {
        Ok(tools) => Ok((session, Some(tools))),
        Err(e) => {
            tracing::error!(server = %id, error = %e, kind = %e.kind(), "server bring-up failed");
            Ok((session, None))
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
