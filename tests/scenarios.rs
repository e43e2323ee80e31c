//! End-to-end scenarios against the `fake-tool-server` binary.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::mpsc;

use chatops_bridge::agent_core::{ConversationLoop, Dispatcher, HistoryStore, LoopSettings, ToolStatus};
use chatops_bridge::config::{parse_config, BridgeConfig, ConfigFormat};
use chatops_bridge::context::CallContext;
use chatops_bridge::errors::ErrorKind;
use chatops_bridge::frontend::{ChatFrontend, FrontendError, IncomingMessage};
use chatops_bridge::inference::{
    ChatMessage, Completion, CompletionOptions, InferenceError, LlmProvider, ToolCall, ToolDefinition,
};
use chatops_bridge::mcp_client::{McpClient, ServerSpec, SessionState};
use chatops_bridge::supervisor::{Control, ProviderFactory, Supervisor};

const FAKE_SERVER: &str = env!("CARGO_BIN_EXE_fake-tool-server");

// ─── Helpers ─────────────────────────────────────────────────────────────────

fn fake(id: &str, extra: &[&str]) -> ServerSpec {
    let mut args = vec!["--name", id];
    args.extend_from_slice(extra);
    ServerSpec::stdio(id, FAKE_SERVER, &args)
}

async fn start(servers: &[ServerSpec]) -> McpClient {
    let http = McpClient::http_client().unwrap();
    McpClient::start(servers, &http, &CallContext::new(Duration::from_secs(20))).await
}

fn call(name: &str, arguments: serde_json::Value) -> ToolCall {
    ToolCall {
        id: format!("call_{name}"),
        name: name.to_string(),
        arguments,
    }
}

/// Answers from a fixed script, then with "done".
#[derive(Default)]
struct ScriptProvider {
    script: Mutex<VecDeque<Completion>>,
    requests: Mutex<Vec<(Vec<ChatMessage>, usize)>>,
}

impl ScriptProvider {
    fn new(script: Vec<Completion>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            requests: Mutex::new(Vec::new()),
        })
    }

    fn requests(&self) -> Vec<(Vec<ChatMessage>, usize)> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl LlmProvider for ScriptProvider {
    fn name(&self) -> &str {
        "script"
    }

    async fn complete(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
        _options: &CompletionOptions,
        _ctx: &CallContext,
    ) -> Result<Completion, InferenceError> {
        self.requests
            .lock()
            .unwrap()
            .push((messages.to_vec(), tools.len()));
        let next = self.script.lock().unwrap().pop_front();
        Ok(next.unwrap_or_else(|| Completion::text("done")))
    }
}

#[derive(Default)]
struct Recorder {
    sent: Mutex<Vec<String>>,
}

impl Recorder {
    fn sent(&self) -> Vec<String> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChatFrontend for Recorder {
    async fn send(&self, _thread_id: &str, text: &str) -> Result<(), FrontendError> {
        self.sent.lock().unwrap().push(text.to_string());
        Ok(())
    }

    async fn status(&self, _thread_id: &str, _text: &str) -> Result<(), FrontendError> {
        Ok(())
    }
}

async fn wait_for(mut done: impl FnMut() -> bool) {
    let waited = tokio::time::timeout(Duration::from_secs(20), async {
        while !done() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "condition not reached in time");
}

// ─── Happy path ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_tool_call_result_reaches_the_model() {
    let client = Arc::new(start(&[fake("fs", &["--tools", "read_file"])]).await);
    assert_eq!(client.tool_count(), 1);

    let llm = ScriptProvider::new(vec![
        Completion::calls(vec![call("fs_read_file", json!({"path": "/tmp/a"}))]),
        Completion::text("The file says: hello"),
    ]);
    let conversation = ConversationLoop::new(
        llm.clone(),
        Arc::clone(&client),
        Arc::new(HistoryStore::new(50)),
        LoopSettings::default(),
    );
    let frontend = Recorder::default();

    let outcome = conversation
        .handle(
            &IncomingMessage::new("t", "u", "read /tmp/a"),
            &frontend,
            &CallContext::new(Duration::from_secs(30)),
        )
        .await
        .unwrap();

    assert_eq!(outcome.tool_rounds, 1);
    assert_eq!(outcome.tool_results.len(), 1);
    assert_eq!(outcome.tool_results[0].status, ToolStatus::Ok);
    assert_eq!(outcome.tool_results[0].payload, "hello");
    assert_eq!(frontend.sent(), vec!["The file says: hello"]);

    let requests = llm.requests();
    assert_eq!(requests.len(), 2);
    assert!(requests[1].0.iter().any(|m| m.text().contains("hello")));

    client.shutdown_all().await;
}

// ─── Deadlines ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_slow_tool_times_out_and_session_survives() {
    let client = start(&[fake("fs", &[])]).await;
    let dispatcher = Dispatcher::new(Duration::from_secs(2));
    let turn = CallContext::new(Duration::from_secs(60));

    let started = Instant::now();
    let results = dispatcher
        .dispatch(&[call("fs_sleep", json!({"seconds": 10}))], &client, &turn)
        .await;
    let elapsed = started.elapsed();

    assert_eq!(results[0].status, ToolStatus::Timeout);
    assert!(elapsed < Duration::from_millis(2100), "took {elapsed:?}");

    let results = dispatcher
        .dispatch(&[call("fs_read_file", json!({"path": "/tmp/a"}))], &client, &turn)
        .await;
    assert_eq!(results[0].status, ToolStatus::Ok);
    assert_eq!(client.sessions()[0].state(), SessionState::Ready);

    client.shutdown_all().await;
}

// ─── Unknown tools ───────────────────────────────────────────────────────────

#[tokio::test]
async fn test_unknown_tool_is_reported_to_the_model() {
    let client = Arc::new(start(&[fake("fs", &[])]).await);
    let llm = ScriptProvider::new(vec![
        Completion::calls(vec![call("no_such_tool", json!({}))]),
        Completion::text("I could not find that tool."),
    ]);
    let conversation = ConversationLoop::new(
        llm.clone(),
        Arc::clone(&client),
        Arc::new(HistoryStore::new(50)),
        LoopSettings::default(),
    );

    let outcome = conversation
        .run_turn("t", "use the magic tool", &CallContext::new(Duration::from_secs(30)))
        .await
        .unwrap();

    assert_eq!(outcome.tool_results[0].status, ToolStatus::NotFound);
    assert_eq!(outcome.reply, "I could not find that tool.");
    let reprompt = &llm.requests()[1].0;
    assert!(reprompt.iter().any(|m| m.text().contains("not-found")));

    client.shutdown_all().await;
}

// ─── Server loss ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_server_exiting_after_initialize_is_degraded() {
    let servers = [fake("gone", &["--exit-after-initialize"]), fake("fs", &[])];
    let client = start(&servers).await;

    let status = client.status();
    let gone = status.iter().find(|s| s.id == "gone").unwrap();
    assert_eq!(gone.state, SessionState::Degraded);
    assert_eq!(gone.tool_count, 0);
    assert!(gone.last_error.is_some());
    assert!(client.describe_all().iter().all(|t| !t.name.starts_with("gone_")));
    assert!(client.describe_all().iter().any(|t| t.name == "fs_read_file"));
    client.shutdown_all().await;

    // A rebuild from the same configuration still leaves it out.
    let rebuilt = start(&servers).await;
    assert!(rebuilt.describe_all().iter().all(|t| !t.name.starts_with("gone_")));
    rebuilt.shutdown_all().await;
}

#[tokio::test]
async fn test_server_dying_mid_session_degrades_it() {
    let client = start(&[fake("fs", &[])]).await;
    let dispatcher = Dispatcher::default();
    let turn = CallContext::new(Duration::from_secs(30));

    let results = dispatcher
        .dispatch(&[call("fs_crash", json!({}))], &client, &turn)
        .await;
    assert_eq!(results[0].status, ToolStatus::TransportError);
    assert_eq!(client.sessions()[0].state(), SessionState::Degraded);

    let results = dispatcher
        .dispatch(&[call("fs_read_file", json!({"path": "/x"}))], &client, &turn)
        .await;
    assert_eq!(results[0].status, ToolStatus::TransportError);

    client.shutdown_all().await;
    assert_eq!(client.sessions()[0].state(), SessionState::Closed);
}

// ─── Name collisions ─────────────────────────────────────────────────────────

#[tokio::test]
async fn test_same_raw_name_on_two_servers() {
    let client = start(&[fake("a", &["--tools", "search"]), fake("b", &["--tools", "search"])]).await;
    let names: Vec<String> = client.describe_all().into_iter().map(|t| t.name).collect();
    assert!(names.contains(&"a_search".to_string()));
    assert!(names.contains(&"b_search".to_string()));

    let err = client.resolve("search").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);

    let results = Dispatcher::default()
        .dispatch(
            &[call("b_search", json!({"query": "logs"}))],
            &client,
            &CallContext::new(Duration::from_secs(10)),
        )
        .await;
    assert_eq!(results[0].payload, "b: results for logs");
    client.shutdown_all().await;

    let mut b = fake("b", &["--tools", "search"]);
    b.disabled = true;
    let single = start(&[fake("a", &["--tools", "search"]), b]).await;
    assert_eq!(single.resolve("search").unwrap().qualified_name, "a_search");
    single.shutdown_all().await;
}

#[tokio::test]
async fn test_paginated_catalog() {
    let client = start(&[fake("fs", &["--page-size", "2"])]).await;
    assert_eq!(client.tool_count(), 5);
    client.shutdown_all().await;
}

// ─── Reload ──────────────────────────────────────────────────────────────────

fn bridge_yaml(block: &str) -> String {
    format!(
        r#"
max_tool_rounds: 2
shutdown_grace_seconds: 10
llm:
  active_model: m
  models:
    m:
      base_url: "http://127.0.0.1:9/v1"
servers:
  - id: fs
    command: "{FAKE_SERVER}"
    args: ["--name", "fs"]
    block_list: [{block}]
"#
    )
}

#[cfg(unix)]
#[tokio::test]
async fn test_sighup_reloads_after_in_flight_turn() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bridge.yaml");
    std::fs::write(&path, bridge_yaml("")).unwrap();
    let config = parse_config(&bridge_yaml(""), ConfigFormat::Yaml, &|_| None).unwrap();

    // Rounds: the first turn keeps calling tools until its budget runs out.
    let looping = call("fs_read_file", json!({"path": "/tmp/a"}));
    let llm = ScriptProvider::new(vec![
        Completion::calls(vec![looping.clone()]),
        Completion::calls(vec![looping.clone()]),
        Completion::calls(vec![looping]),
        Completion::text("after reload"),
    ]);
    let provider = Arc::clone(&llm);
    let factory: ProviderFactory =
        Arc::new(move |_config: &BridgeConfig| Ok(Arc::clone(&provider) as Arc<dyn LlmProvider>));

    let frontend = Arc::new(Recorder::default());
    let supervisor = Supervisor::new(config, frontend.clone(), factory)
        .unwrap()
        .with_config_path(path.clone());

    let control = chatops_bridge::supervisor::spawn_signal_listener().unwrap();
    let (ingress, ingress_rx) = mpsc::channel(8);
    let task = tokio::spawn(supervisor.run(ingress_rx, control));

    ingress.send(IncomingMessage::new("t", "u", "loop")).await.unwrap();
    wait_for(|| !llm.requests().is_empty()).await;

    // Reload mid-turn with a config that blocks `sleep`.
    std::fs::write(&path, bridge_yaml("sleep")).unwrap();
    let hup = std::process::Command::new("kill")
        .args(["-HUP", &std::process::id().to_string()])
        .status()
        .unwrap();
    assert!(hup.success());

    wait_for(|| frontend.sent().len() == 1).await;
    assert!(frontend.sent()[0].contains("limit of tool calls"));
    assert_eq!(llm.requests().len(), 3);

    ingress.send(IncomingMessage::new("t", "u", "hello again")).await.unwrap();
    wait_for(|| frontend.sent().len() == 2).await;
    assert_eq!(frontend.sent()[1], "after reload");

    let requests = llm.requests();
    assert_eq!(requests[0].1, 5);
    assert_eq!(requests[3].1, 4);

    drop(ingress);
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_idle_reload_keeps_history() {
    let config = parse_config(&bridge_yaml(""), ConfigFormat::Yaml, &|_| None).unwrap();
    let llm = ScriptProvider::new(Vec::new());
    let provider = Arc::clone(&llm);
    let factory: ProviderFactory =
        Arc::new(move |_config: &BridgeConfig| Ok(Arc::clone(&provider) as Arc<dyn LlmProvider>));
    let frontend = Arc::new(Recorder::default());
    let supervisor = Supervisor::new(config, frontend.clone(), factory).unwrap();

    let (ingress, ingress_rx) = mpsc::channel(8);
    let (control, control_rx) = mpsc::channel(4);
    let task = tokio::spawn(supervisor.run(ingress_rx, control_rx));

    ingress.send(IncomingMessage::new("t", "u", "one")).await.unwrap();
    wait_for(|| frontend.sent().len() == 1).await;
    control.send(Control::Reload).await.unwrap();
    ingress.send(IncomingMessage::new("t", "u", "two")).await.unwrap();
    wait_for(|| frontend.sent().len() == 2).await;

    let requests = llm.requests();
    assert_eq!(requests[0].1, requests[1].1);
    // History crossed the reload.
    assert!(requests[1].0.iter().any(|m| m.text() == "one"));

    control.send(Control::Shutdown).await.unwrap();
    task.await.unwrap().unwrap();
}

fn read_events(path: &std::path::Path) -> Vec<(String, String)> {
    std::fs::read_to_string(path)
        .unwrap_or_default()
        .lines()
        .filter_map(|line| {
            let mut parts = line.split_whitespace().skip(1);
            Some((parts.next()?.to_string(), parts.next()?.to_string()))
        })
        .collect()
}

fn initializations(path: &std::path::Path) -> usize {
    read_events(path).iter().filter(|(_, event)| event == "initialize").count()
}

#[tokio::test]
async fn test_shutdown_closes_session_after_server_exits() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("events.log");
    let client = start(&[fake("fs", &["--event-log", log.to_str().unwrap()])]).await;
    assert_eq!(client.sessions()[0].state(), SessionState::Ready);

    client.shutdown_all().await;
    assert_eq!(client.sessions()[0].state(), SessionState::Closed);
    let events: Vec<String> = read_events(&log).into_iter().map(|(_, e)| e).collect();
    assert_eq!(events, vec!["initialize", "exit"]);
}

#[tokio::test]
async fn test_reload_closes_old_servers_before_starting_new_ones() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("events.log");
    let yaml = format!(
        r#"
shutdown_grace_seconds: 5
llm:
  active_model: m
  models:
    m:
      base_url: "http://127.0.0.1:9/v1"
servers:
  - id: fs
    command: "{FAKE_SERVER}"
    args: ["--name", "fs", "--event-log", "{}"]
  - id: web
    command: "{FAKE_SERVER}"
    args: ["--name", "web", "--event-log", "{}"]
"#,
        log.display(),
        log.display()
    );
    let config = parse_config(&yaml, ConfigFormat::Yaml, &|_| None).unwrap();
    let llm = ScriptProvider::new(Vec::new());
    let provider = Arc::clone(&llm);
    let factory: ProviderFactory =
        Arc::new(move |_config: &BridgeConfig| Ok(Arc::clone(&provider) as Arc<dyn LlmProvider>));
    let frontend = Arc::new(Recorder::default());
    let supervisor = Supervisor::new(config, frontend.clone(), factory).unwrap();

    let (ingress, ingress_rx) = mpsc::channel(8);
    let (control, control_rx) = mpsc::channel(4);
    let task = tokio::spawn(supervisor.run(ingress_rx, control_rx));

    ingress.send(IncomingMessage::new("t", "u", "one")).await.unwrap();
    wait_for(|| frontend.sent().len() == 1).await;
    assert_eq!(initializations(&log), 2);

    control.send(Control::Reload).await.unwrap();
    wait_for(|| initializations(&log) == 4).await;
    control.send(Control::Shutdown).await.unwrap();
    task.await.unwrap().unwrap();

    let events = read_events(&log);
    let first_generation: Vec<&String> = events[..2].iter().map(|(pid, _)| pid).collect();
    let first_new_init = events
        .iter()
        .position(|(pid, event)| event == "initialize" && !first_generation.contains(&pid))
        .unwrap();
    // Both old servers exited before any new one saw `initialize`.
    for old in &first_generation {
        let exited = events
            .iter()
            .position(|(pid, event)| event == "exit" && pid == *old)
            .unwrap();
        assert!(exited < first_new_init, "{events:?}");
    }
    assert_eq!(events.len(), 8, "{events:?}");
}
