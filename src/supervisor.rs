//! Supervisor: builds runtime generations and swaps them on reload.
//!
//! A generation is one [`McpClient`] (sessions + registry), one LLM provider
//! and the [`ConversationLoop`] over them. Messages are routed to one worker
//! task per chat thread, so turns of the same thread run in arrival order
//! while different threads progress in parallel. A worker that sees no
//! message for `thread_idle_seconds` hands its inbox back to the serve loop,
//! which releases the thread or restarts the worker if a message slipped in.
//!
//! Reload sequence:
//! 1. Stop reading the ingress channel (new messages wait there)
//! 2. Let queued and running turns finish for up to the grace period
//! 3. Cancel whatever is still running (those turns reply "interrupted")
//! 4. Close every session of the old generation
//! 5. Re-read the configuration and build the next generation
//!
//! Conversation history belongs to the supervisor and survives reloads.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinSet};
use tokio::time::Interval;
use tokio_util::sync::CancellationToken;

use crate::agent_core::{AgentError, ConversationLoop, HistoryStore};
use crate::config::{load_config, BridgeConfig};
use crate::context::CallContext;
use crate::frontend::{ChatFrontend, IncomingMessage};
use crate::inference::{InferenceClient, InferenceError, LlmProvider};
use crate::mcp_client::{McpClient, McpError};

// ─── Constants ───────────────────────────────────────────────────────────────

/// Upper bound on bringing up all servers of one generation.
const STARTUP_TIMEOUT: Duration = Duration::from_secs(120);

// ─── Types ───────────────────────────────────────────────────────────────────

/// Lifecycle requests from signals or the embedding program.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    Reload,
    Shutdown,
}

/// Builds the LLM provider of a generation from its configuration.
pub type ProviderFactory =
    Arc<dyn Fn(&BridgeConfig) -> Result<Arc<dyn LlmProvider>, InferenceError> + Send + Sync>;

/// The OpenAI-compatible client configured by the `llm` section.
pub fn openai_compatible() -> ProviderFactory {
    Arc::new(|config: &BridgeConfig| {
        let client = InferenceClient::from_config(config.llm.clone())?;
        Ok(Arc::new(client) as Arc<dyn LlmProvider>)
    })
}

/// Why `serve` returned.
enum Exit {
    Reload,
    Shutdown,
    IngressClosed,
}

/// What thread workers share within one generation.
struct Runtime {
    conversation: ConversationLoop,
    /// Parent of every turn context; cancelled when the grace period ends.
    cancel: CancellationToken,
    turn_timeout: Duration,
    idle_timeout: Duration,
}

/// A worker that stopped on its own, returning its inbox.
struct Parked {
    thread_id: String,
    inbox: mpsc::UnboundedReceiver<IncomingMessage>,
}

struct Generation {
    number: u64,
    runtime: Arc<Runtime>,
    threads: HashMap<String, mpsc::UnboundedSender<IncomingMessage>>,
    workers: JoinSet<Parked>,
}

impl Generation {
    /// Queue a message on its thread's worker, starting one if needed.
    fn admit(&mut self, msg: IncomingMessage, frontend: &Arc<dyn ChatFrontend>) {
        let msg = match self.threads.get(&msg.thread_id) {
            Some(tx) => match tx.send(msg) {
                Ok(()) => return,
                Err(rejected) => {
                    tracing::warn!(thread = %rejected.0.thread_id, "thread worker gone, restarting it");
                    rejected.0
                }
            },
            None => msg,
        };

        let (tx, rx) = mpsc::unbounded_channel();
        let thread_id = msg.thread_id.clone();
        // Cannot fail: `rx` is alive.
        let _ = tx.send(msg);
        self.spawn_worker(thread_id.clone(), rx, frontend);
        self.threads.insert(thread_id, tx);
    }

    fn spawn_worker(
        &mut self,
        thread_id: String,
        inbox: mpsc::UnboundedReceiver<IncomingMessage>,
        frontend: &Arc<dyn ChatFrontend>,
    ) {
        self.workers.spawn(thread_worker(
            Arc::clone(&self.runtime),
            Arc::clone(frontend),
            thread_id,
            inbox,
        ));
    }

    /// Handle a worker that finished while the generation is serving.
    ///
    /// An idle worker whose inbox is still empty releases its thread; one
    /// that raced a new message is restarted on the same inbox so the
    /// thread keeps its order. A panicked worker is forgotten, and the
    /// next message on its thread starts a fresh one.
    fn reap(&mut self, joined: Result<Parked, JoinError>, frontend: &Arc<dyn ChatFrontend>) {
        match joined {
            Ok(Parked { thread_id, inbox }) if inbox.is_empty() => {
                self.threads.remove(&thread_id);
                tracing::debug!(generation = self.number, thread = %thread_id, "idle thread worker released");
            }
            Ok(Parked { thread_id, inbox }) => self.spawn_worker(thread_id, inbox, frontend),
            Err(e) => {
                log_worker_exit(Err(e));
                self.threads.retain(|_, tx| !tx.is_closed());
            }
        }
    }

    /// Stop this generation: finish or cancel its turns, then close its
    /// sessions. `None` waits for every turn to finish on its own.
    async fn drain(self, grace: Option<Duration>) {
        let Generation {
            number,
            runtime,
            threads,
            mut workers,
        } = self;
        drop(threads);

        let finished = match grace {
            Some(grace) => tokio::time::timeout(grace, join_workers(&mut workers))
                .await
                .is_ok(),
            None => {
                join_workers(&mut workers).await;
                true
            }
        };
        if !finished {
            tracing::warn!(
                generation = number,
                running = workers.len(),
                "grace period over, cancelling in-flight turns"
            );
            runtime.cancel.cancel();
            join_workers(&mut workers).await;
        }

        runtime.conversation.tools().shutdown_all().await;
        tracing::info!(generation = number, "generation closed");
    }
}

async fn join_workers(workers: &mut JoinSet<Parked>) {
    while let Some(joined) = workers.join_next().await {
        log_worker_exit(joined.map(drop));
    }
}

fn log_worker_exit(joined: Result<(), JoinError>) {
    if let Err(e) = joined {
        if e.is_panic() {
            tracing::error!(error = %e, "thread worker panicked");
        }
    }
}

/// Runs the turns of one chat thread, one after another, until the inbox
/// closes or stays empty for the idle timeout.
async fn thread_worker(
    runtime: Arc<Runtime>,
    frontend: Arc<dyn ChatFrontend>,
    thread_id: String,
    mut inbox: mpsc::UnboundedReceiver<IncomingMessage>,
) -> Parked {
    loop {
        let msg = match tokio::time::timeout(runtime.idle_timeout, inbox.recv()).await {
            Ok(Some(msg)) => msg,
            Ok(None) | Err(_) => return Parked { thread_id, inbox },
        };
        let ctx = CallContext::with_token(runtime.turn_timeout, runtime.cancel.child_token());
        let started = Instant::now();

        match runtime.conversation.handle(&msg, frontend.as_ref(), &ctx).await {
            Ok(outcome) => tracing::info!(
                thread = %msg.thread_id,
                user = %msg.user_id,
                rounds = outcome.tool_rounds,
                llm_calls = outcome.llm_calls,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "turn complete"
            ),
            Err(AgentError::Frontend { source }) => tracing::error!(
                thread = %msg.thread_id,
                error = %source,
                "failed to deliver reply"
            ),
            Err(e) => tracing::warn!(
                thread = %msg.thread_id,
                kind = %e.kind(),
                error = %e,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "turn ended with an error"
            ),
        }
    }
}

// ─── Supervisor ──────────────────────────────────────────────────────────────

pub struct Supervisor {
    /// Last configuration that produced a generation.
    config: BridgeConfig,
    /// Re-read on reload when set.
    config_path: Option<PathBuf>,
    history: Arc<HistoryStore>,
    frontend: Arc<dyn ChatFrontend>,
    providers: ProviderFactory,
    http: reqwest::Client,
    generations: u64,
}

impl Supervisor {
    pub fn new(
        config: BridgeConfig,
        frontend: Arc<dyn ChatFrontend>,
        providers: ProviderFactory,
    ) -> Result<Self, McpError> {
        Ok(Self {
            history: Arc::new(HistoryStore::with_max_threads(
                config.history_limit,
                config.history_max_threads,
            )),
            config,
            config_path: None,
            frontend,
            providers,
            http: McpClient::http_client()?,
            generations: 0,
        })
    }

    /// Re-read this file on every reload.
    pub fn with_config_path(mut self, path: PathBuf) -> Self {
        self.config_path = Some(path);
        self
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn history(&self) -> &Arc<HistoryStore> {
        &self.history
    }

    /// Serve until a shutdown request or until the ingress channel closes.
    ///
    /// Only a failure to build the first generation is returned. Later
    /// rebuild failures fall back to the last good configuration, and if
    /// that fails too the supervisor waits for the next reload request.
    pub async fn run(
        mut self,
        mut ingress: mpsc::Receiver<IncomingMessage>,
        mut control: mpsc::Receiver<Control>,
    ) -> anyhow::Result<()> {
        let initial = self.config.clone();
        let mut generation = self
            .build(&initial)
            .await
            .context("failed to start the tool runtime")?;

        loop {
            match self.serve(&mut generation, &mut ingress, &mut control).await {
                Exit::Reload => {
                    tracing::info!(generation = generation.number, "reload requested");
                    generation.drain(Some(self.config.shutdown_grace())).await;
                    generation = match self.recover(&mut control).await {
                        Some(next) => next,
                        None => return Ok(()),
                    };
                }
                Exit::Shutdown => {
                    tracing::info!(generation = generation.number, "shutdown requested");
                    generation.drain(Some(self.config.shutdown_grace())).await;
                    return Ok(());
                }
                Exit::IngressClosed => {
                    tracing::info!("front-end closed, finishing pending turns");
                    generation.drain(None).await;
                    return Ok(());
                }
            }
        }
    }

    async fn serve(
        &self,
        generation: &mut Generation,
        ingress: &mut mpsc::Receiver<IncomingMessage>,
        control: &mut mpsc::Receiver<Control>,
    ) -> Exit {
        let mut timer = self
            .config
            .reload_interval()
            .map(|every| tokio::time::interval_at(tokio::time::Instant::now() + every, every));
        let mut control_open = true;

        loop {
            tokio::select! {
                msg = ingress.recv() => match msg {
                    Some(msg) => generation.admit(msg, &self.frontend),
                    None => return Exit::IngressClosed,
                },
                request = control.recv(), if control_open => match request {
                    Some(Control::Reload) => return Exit::Reload,
                    Some(Control::Shutdown) => return Exit::Shutdown,
                    None => control_open = false,
                },
                _ = next_tick(&mut timer) => {
                    tracing::info!("periodic reload");
                    return Exit::Reload;
                }
                Some(joined) = generation.workers.join_next() => generation.reap(joined, &self.frontend),
            }
        }
    }

    /// Rebuild until a generation comes up. Between attempts, wait for a
    /// reload request or the periodic timer. `None` means shutdown.
    async fn recover(&mut self, control: &mut mpsc::Receiver<Control>) -> Option<Generation> {
        loop {
            match self.rebuild().await {
                Ok(generation) => return Some(generation),
                Err(e) => tracing::error!(
                    error = %format!("{e:#}"),
                    "tool runtime unavailable, retrying on the next reload request"
                ),
            }

            let every = self.config.reload_interval();
            let retry = async move {
                match every {
                    Some(every) => tokio::time::sleep(every).await,
                    None => std::future::pending().await,
                }
            };
            tokio::select! {
                request = control.recv() => match request {
                    Some(Control::Reload) => {}
                    Some(Control::Shutdown) => return None,
                    None => match every {
                        Some(every) => tokio::time::sleep(every).await,
                        None => {
                            tracing::error!("no reload source left, stopping");
                            return None;
                        }
                    },
                },
                _ = retry => {}
            }
        }
    }

    /// Build the next generation from freshly loaded configuration, or
    /// from the last good one when loading or building fails.
    async fn rebuild(&mut self) -> anyhow::Result<Generation> {
        if let Some(path) = self.config_path.clone() {
            match load_config(&path) {
                Ok(candidate) => {
                    if candidate.history_limit != self.history.limit() {
                        tracing::warn!(
                            current = self.history.limit(),
                            configured = candidate.history_limit,
                            "history_limit changes take effect after restart"
                        );
                    }
                    match self.build(&candidate).await {
                        Ok(generation) => {
                            self.config = candidate;
                            return Ok(generation);
                        }
                        Err(e) => tracing::error!(
                            error = %format!("{e:#}"),
                            "new configuration failed to start, keeping the previous one"
                        ),
                    }
                }
                Err(e) => tracing::error!(
                    path = %path.display(),
                    kind = %e.kind(),
                    error = %e,
                    "configuration reload failed, keeping the previous one"
                ),
            }
        }

        let previous = self.config.clone();
        self.build(&previous)
            .await
            .context("failed to rebuild the tool runtime")
    }

    async fn build(&mut self, config: &BridgeConfig) -> anyhow::Result<Generation> {
        let llm = (self.providers)(config).context("failed to build the LLM provider")?;

        let ctx = CallContext::new(STARTUP_TIMEOUT);
        let tools = Arc::new(McpClient::start(&config.servers, &self.http, &ctx).await);
        self.generations += 1;

        for status in tools.status() {
            tracing::info!(
                generation = self.generations,
                server = %status.id,
                state = %status.state,
                tools = status.tool_count,
                last_error = status.last_error.as_deref().unwrap_or(""),
                "server status"
            );
        }
        for id in tools.disabled_servers() {
            tracing::info!(generation = self.generations, server = %id, state = "disabled", "server status");
        }

        let conversation =
            ConversationLoop::new(llm, tools, Arc::clone(&self.history), config.loop_settings());
        Ok(Generation {
            number: self.generations,
            runtime: Arc::new(Runtime {
                conversation,
                cancel: CancellationToken::new(),
                turn_timeout: config.turn_timeout(),
                idle_timeout: config.thread_idle(),
            }),
            threads: HashMap::new(),
            workers: JoinSet::new(),
        })
    }
}

async fn next_tick(timer: &mut Option<Interval>) {
    match timer {
        Some(timer) => {
            timer.tick().await;
        }
        None => std::future::pending().await,
    }
}

// ─── Signals ─────────────────────────────────────────────────────────────────

/// Translate OS signals into [`Control`] requests.
///
/// Unix: SIGHUP reloads, SIGINT and SIGTERM shut down. Elsewhere Ctrl-C
/// shuts down. Must be called from within the runtime.
pub fn spawn_signal_listener() -> std::io::Result<mpsc::Receiver<Control>> {
    let (tx, rx) = mpsc::channel(8);

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut hangup = signal(SignalKind::hangup())?;
        let mut interrupt = signal(SignalKind::interrupt())?;
        let mut terminate = signal(SignalKind::terminate())?;

        tokio::spawn(async move {
            loop {
                let request = tokio::select! {
                    got = hangup.recv() => got.map(|()| {
                        tracing::info!("received SIGHUP, reloading");
                        Control::Reload
                    }),
                    got = interrupt.recv() => got.map(|()| {
                        tracing::info!("received SIGINT, shutting down");
                        Control::Shutdown
                    }),
                    got = terminate.recv() => got.map(|()| {
                        tracing::info!("received SIGTERM, shutting down");
                        Control::Shutdown
                    }),
                };
                let Some(request) = request else { break };
                if tx.send(request).await.is_err() {
                    break;
                }
            }
        });
    }

    #[cfg(not(unix))]
    {
        tokio::spawn(async move {
            while tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("received Ctrl+C, shutting down");
                if tx.send(Control::Shutdown).await.is_err() {
                    break;
                }
            }
        });
    }

    Ok(rx)
}

// ─── Tests ───────────────────────────────────────────────────────────────────
