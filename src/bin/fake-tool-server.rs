//! fake-tool-server: a small MCP tool server over stdio, used by the
//! end-to-end tests.
//!
//! Tools (select with `--tools`):
//! - `read_file {path}`: answers "hello"
//! - `sleep {seconds}`: sleeps, then answers "slept"; honors
//!   `notifications/cancelled`
//! - `search {query}`: answers "<server>: results for <query>"
//! - `fail`: answers with `isError: true`
//! - `crash`: exits the process without answering
//!
//! Requests are handled concurrently; replies are written one line each.
//! With `--event-log FILE` the server appends `<name> <pid> initialize`
//! when the handshake arrives and `<name> <pid> exit` when stdin closes.

use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use clap::Parser;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;

#[derive(Parser, Debug)]
#[command(name = "fake-tool-server")]
struct Args {
    /// Reported as `serverInfo.name` and used in search results.
    #[arg(long, default_value = "fake-tool-server")]
    name: String,

    /// Tools to advertise.
    #[arg(long, value_delimiter = ',', default_value = "read_file,sleep,search,fail,crash")]
    tools: Vec<String>,

    /// Exit right after answering `initialize`.
    #[arg(long)]
    exit_after_initialize: bool,

    /// Split `tools/list` into pages of this size (0 = one page).
    #[arg(long, default_value_t = 0)]
    page_size: usize,

    /// Append lifecycle events to this file.
    #[arg(long)]
    event_log: Option<PathBuf>,
}

struct Server {
    args: Args,
    out: mpsc::UnboundedSender<Value>,
    in_flight: Mutex<HashMap<String, AbortHandle>>,
}

impl Server {
    fn reply(&self, id: Value, result: Value) {
        let _ = self.out.send(json!({"jsonrpc": "2.0", "id": id, "result": result}));
    }

    fn fail(&self, id: Value, code: i32, message: &str) {
        let _ = self.out.send(json!({
            "jsonrpc": "2.0",
            "id": id,
            "error": {"code": code, "message": message},
        }));
    }

    fn record(&self, event: &str) {
        let Some(path) = &self.args.event_log else {
            return;
        };
        let written = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .and_then(|mut file| writeln!(file, "{} {} {event}", self.args.name, std::process::id()));
        if let Err(e) = written {
            eprintln!("event log {}: {e}", path.display());
        }
    }

    fn catalog(&self) -> Vec<Value> {
        self.args
            .tools
            .iter()
            .filter_map(|name| tool_schema(name))
            .collect()
    }

    fn list_tools(&self, id: Value, params: &Value) {
        let catalog = self.catalog();
        if self.args.page_size == 0 {
            self.reply(id, json!({ "tools": catalog }));
            return;
        }
        let start: usize = params["cursor"]
            .as_str()
            .and_then(|c| c.parse().ok())
            .unwrap_or(0);
        let end = (start + self.args.page_size).min(catalog.len());
        let page = catalog.get(start..end).unwrap_or_default().to_vec();
        let mut result = json!({ "tools": page });
        if end < catalog.len() {
            result["nextCursor"] = json!(end.to_string());
        }
        self.reply(id, result);
    }

    fn cancel(&self, params: &Value) {
        let key = params["requestId"].to_string();
        let handle = self
            .in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&key);
        if let Some(handle) = handle {
            eprintln!("cancelled request {key}");
            handle.abort();
        }
    }
}

fn tool_schema(name: &str) -> Option<Value> {
    let (description, properties, required) = match name {
        "read_file" => ("Read a text file", json!({"path": {"type": "string"}}), vec!["path"]),
        "sleep" => ("Sleep for a number of seconds", json!({"seconds": {"type": "number"}}), vec!["seconds"]),
        "search" => ("Search the index", json!({"query": {"type": "string"}}), vec!["query"]),
        "fail" => ("Always fails", json!({}), vec![]),
        "crash" => ("Exits the server", json!({}), vec![]),
        _ => return None,
    };
    Some(json!({
        "name": name,
        "description": description,
        "inputSchema": {"type": "object", "properties": properties, "required": required},
    }))
}

async fn call_tool(server: Arc<Server>, id: Value, params: Value) {
    let name = params["name"].as_str().unwrap_or_default().to_string();
    let args = &params["arguments"];

    if !server.args.tools.iter().any(|t| *t == name) {
        server.fail(id, -32602, &format!("unknown tool: {name}"));
        return;
    }

    let text_result = |text: String, is_error: bool| {
        json!({"content": [{"type": "text", "text": text}], "isError": is_error})
    };

    let result = match name.as_str() {
        "read_file" => text_result("hello".to_string(), false),
        "sleep" => {
            let seconds = args["seconds"].as_f64().unwrap_or(1.0).max(0.0);
            tokio::time::sleep(Duration::from_secs_f64(seconds)).await;
            text_result("slept".to_string(), false)
        }
        "search" => text_result(
            format!("{}: results for {}", server.args.name, args["query"].as_str().unwrap_or("")),
            false,
        ),
        "fail" => text_result("it broke".to_string(), true),
        "crash" => {
            eprintln!("crash requested, exiting");
            std::process::exit(3);
        }
        _ => text_result(String::new(), false),
    };

    server
        .in_flight
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .remove(&id.to_string());
    server.reply(id, result);
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    eprintln!("{} starting with tools: {}", args.name, args.tools.join(","));

    let (out, mut outgoing) = mpsc::unbounded_channel::<Value>();
    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(msg) = outgoing.recv().await {
            let line = format!("{msg}\n");
            if stdout.write_all(line.as_bytes()).await.is_err() {
                break;
            }
            let _ = stdout.flush().await;
        }
    });

    let server = Arc::new(Server {
        args,
        out,
        in_flight: Mutex::new(HashMap::new()),
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let Ok(msg) = serde_json::from_str::<Value>(&line) else {
            eprintln!("ignoring non-JSON line");
            continue;
        };
        let method = msg["method"].as_str().unwrap_or_default().to_string();
        let params = msg.get("params").cloned().unwrap_or(Value::Null);
        let id = msg.get("id").filter(|id| !id.is_null()).cloned();

        match (method.as_str(), id) {
            ("initialize", Some(id)) => {
                server.record("initialize");
                server.reply(
                    id,
                    json!({
                        "protocolVersion": params["protocolVersion"].as_str().unwrap_or("2024-11-05"),
                        "capabilities": {"tools": {"listChanged": false}},
                        "serverInfo": {"name": server.args.name, "version": env!("CARGO_PKG_VERSION")},
                    }),
                );
                if server.args.exit_after_initialize {
                    eprintln!("exiting after initialize");
                    break;
                }
            }
            ("ping", Some(id)) => server.reply(id, json!({})),
            ("tools/list", Some(id)) => server.list_tools(id, &params),
            ("tools/call", Some(id)) => {
                let key = id.to_string();
                let task = tokio::spawn(call_tool(Arc::clone(&server), id, params));
                server
                    .in_flight
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .insert(key, task.abort_handle());
            }
            ("notifications/cancelled", None) => server.cancel(&params),
            (_, None) => {}
            (other, Some(id)) => server.fail(id, -32601, &format!("method not found: {other}")),
        }
    }

    server.record("exit");
    for (_, handle) in server
        .in_flight
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .drain()
    {
        handle.abort();
    }
    drop(server);
    let _ = writer.await;
    Ok(())
}
