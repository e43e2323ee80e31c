//! OpenAI-compatible inference client.
//!
//! Sends non-streaming chat completion requests to the configured model
//! endpoint and walks the fallback chain when a model is unavailable. The
//! client is stateless between calls: every completion starts again from the
//! active model, so one bad minute on the primary does not pin later turns to
//! a fallback.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client as HttpClient;
use serde::Deserialize;

use super::config::{resolve_active_model, ModelConfig, ModelsConfig, ToolCallFormat};
use super::errors::InferenceError;
use super::provider::LlmProvider;
use super::tool_call_parser::parse_native_tool_call;
use super::types::{
    ChatCompletionRequest, ChatMessage, Completion, CompletionOptions, ToolDefinition,
};
use crate::context::{CallContext, Interrupted};

// ─── Constants ───────────────────────────────────────────────────────────────

/// TCP connection timeout.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

// ─── InferenceClient ─────────────────────────────────────────────────────────

/// Client for OpenAI-compatible `/chat/completions` endpoints.
pub struct InferenceClient {
    http: HttpClient,
    config: ModelsConfig,
}

impl InferenceClient {
    /// Create a client from the `llm` configuration section.
    ///
    /// Fails only when no model can be resolved. Does NOT check
    /// connectivity; that happens on the first request.
    pub fn from_config(config: ModelsConfig) -> Result<Self, InferenceError> {
        let (key, model) = resolve_active_model(&config)?;

        let http = HttpClient::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| InferenceError::ConnectionFailed {
                endpoint: model.base_url.clone(),
                reason: format!("failed to build HTTP client: {e}"),
            })?;

        tracing::info!(
            model = %key,
            fallbacks = config.attempt_order().len().saturating_sub(1),
            "inference client ready"
        );

        Ok(Self { http, config })
    }

    pub fn config(&self) -> &ModelsConfig {
        &self.config
    }

    /// Tool call format of the active model.
    pub fn tool_call_format(&self) -> ToolCallFormat {
        resolve_active_model(&self.config)
            .map(|(_, m)| m.tool_call_format)
            .unwrap_or_default()
    }

    /// One request against one model, bounded by the earlier of the model's
    /// own timeout and the caller's deadline.
    async fn try_model(
        &self,
        key: &str,
        model: &ModelConfig,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
        options: &CompletionOptions,
        ctx: &CallContext,
    ) -> Result<Completion, InferenceError> {
        let url = format!("{}/chat/completions", model.base_url.trim_end_matches('/'));
        let send_tools = model.tool_call_format == ToolCallFormat::NativeJson && !tools.is_empty();

        let body = ChatCompletionRequest {
            model: model.model_name.clone().unwrap_or_else(|| key.to_string()),
            messages: messages.to_vec(),
            tools: send_tools.then(|| tools.to_vec()),
            tool_choice: send_tools.then(|| "auto".to_string()),
            temperature: options.temperature.unwrap_or(model.temperature),
            max_tokens: options.max_tokens.unwrap_or(model.max_tokens),
            stream: false,
        };

        // Log the request metadata (not the full body, it can be huge)
        tracing::info!(
            url = %url,
            model = %body.model,
            message_count = body.messages.len(),
            tool_count = body.tools.as_ref().map(|t| t.len()).unwrap_or(0),
            max_tokens = body.max_tokens,
            "=== LLM REQUEST ==="
        );

        let model_ctx = ctx.child(Duration::from_secs(model.timeout_seconds));
        let mut request = self.http.post(&url).json(&body);
        if let Some(api_key) = model.api_key.as_deref().filter(|k| !k.is_empty()) {
            request = request.bearer_auth(api_key);
        }

        let exchange = async {
            let response = request.send().await.map_err(|e| map_send_error(&url, e))?;
            let status = response.status();
            let text = response.text().await.map_err(|e| map_send_error(&url, e))?;
            if !status.is_success() {
                return Err(InferenceError::HttpError {
                    status: status.as_u16(),
                    body: text,
                });
            }
            Ok(text)
        };

        let text = match model_ctx.run(exchange).await {
            Ok(result) => result?,
            Err(Interrupted::DeadlineExceeded) => {
                return Err(InferenceError::Timeout {
                    duration_secs: model_ctx.budget().as_secs(),
                })
            }
            Err(Interrupted::Cancelled) => return Err(InferenceError::Cancelled),
        };

        let mut completion = parse_completion(&text)?;
        completion.model = key.to_string();

        tracing::info!(
            model = %key,
            has_content = completion.content.is_some(),
            tool_calls = completion.tool_calls.len(),
            "=== LLM RESPONSE ==="
        );
        Ok(completion)
    }
}

#[async_trait]
impl LlmProvider for InferenceClient {
    fn name(&self) -> &str {
        "openai-compatible"
    }

    async fn complete(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
        options: &CompletionOptions,
        ctx: &CallContext,
    ) -> Result<Completion, InferenceError> {
        let mut attempted = Vec::new();
        let mut last_error: Option<InferenceError> = None;

        for key in self.config.attempt_order() {
            let Some(model) = self.config.models.get(&key) else {
                continue;
            };
            if ctx.is_cancelled() {
                return Err(InferenceError::Cancelled);
            }
            if !attempted.is_empty() && ctx.remaining().is_zero() {
                break;
            }
            attempted.push(key.clone());

            match self.try_model(&key, model, messages, tools, options, ctx).await {
                Ok(completion) => return Ok(completion),
                Err(e) if e.is_retriable() => {
                    tracing::warn!(model = %key, error = %e, "model unavailable, trying next in chain");
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(InferenceError::AllModelsUnavailable {
            attempted,
            last_error: last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "no models configured".to_string()),
        })
    }
}

fn map_send_error(url: &str, e: reqwest::Error) -> InferenceError {
    if e.is_timeout() {
        InferenceError::Timeout {
            duration_secs: CONNECT_TIMEOUT.as_secs(),
        }
    } else {
        InferenceError::ConnectionFailed {
            endpoint: url.to_string(),
            reason: e.to_string(),
        }
    }
}

// ─── Response Parsing ────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct CompletionResponse {
    choices: Vec<CompletionChoice>,
}

#[derive(Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
}

#[derive(Deserialize)]
struct CompletionMessage {
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<CompletionToolCall>>,
}

#[derive(Deserialize)]
struct CompletionToolCall {
    id: Option<String>,
    function: CompletionFunction,
}

#[derive(Deserialize)]
struct CompletionFunction {
    name: String,
    /// OpenAI sends a JSON-encoded string; some runtimes send an object.
    #[serde(default)]
    arguments: serde_json::Value,
}

/// Parse a non-streaming chat completion body.
///
/// Empty `content` is treated as absent. Native tool calls keep the order the
/// model emitted them in.
pub fn parse_completion(body: &str) -> Result<Completion, InferenceError> {
    let resp: CompletionResponse =
        serde_json::from_str(body).map_err(|e| InferenceError::MalformedResponse {
            reason: format!("failed to parse completion: {e}"),
        })?;

    let choice = resp
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| InferenceError::MalformedResponse {
            reason: "empty choices array".into(),
        })?;

    let content = choice.message.content.filter(|c| !c.trim().is_empty());
    let tool_calls = choice
        .message
        .tool_calls
        .unwrap_or_default()
        .into_iter()
        .map(|tc| {
            let arguments = match tc.function.arguments {
                serde_json::Value::String(s) => s,
                serde_json::Value::Null => String::new(),
                other => other.to_string(),
            };
            parse_native_tool_call(tc.id.as_deref(), &tc.function.name, &arguments)
        })
        .collect();

    Ok(Completion {
        content,
        tool_calls,
        model: String::new(),
    })
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    use axum::extract::{Path, State};
    use axum::http::{HeaderMap, StatusCode};
    use axum::response::{IntoResponse, Response};
    use axum::routing::post;
    use axum::{Json, Router};
    use serde_json::{json, Value};

    use super::*;

    #[derive(Clone, Default)]
    struct Seen {
        bodies: Arc<Mutex<Vec<(String, Value)>>>,
        auth: Arc<Mutex<Vec<Option<String>>>>,
    }

    /// Each path segment selects a behavior: `ok`, `calls`, `busy`, `bad`, `hang`.
    async fn completions(
        State(seen): State<Seen>,
        Path(mode): Path<String>,
        headers: HeaderMap,
        Json(body): Json<Value>,
    ) -> Response {
        seen.bodies.lock().unwrap().push((mode.clone(), body));
        seen.auth.lock().unwrap().push(
            headers
                .get("authorization")
                .and_then(|v| v.to_str().ok())
                .map(str::to_string),
        );
        match mode.as_str() {
            "ok" => Json(json!({
                "choices": [{"message": {"role": "assistant", "content": format!("answer from {mode}")}}]
            }))
            .into_response(),
            "calls" => Json(json!({
                "choices": [{"message": {"role": "assistant", "content": null, "tool_calls": [
                    {"id": "call_a", "type": "function", "function": {"name": "fs_read_file", "arguments": "{\"path\":\"/tmp/a\"}"}},
                    {"type": "function", "function": {"name": "fs_list", "arguments": ""}}
                ]}}]
            }))
            .into_response(),
            "busy" => (StatusCode::SERVICE_UNAVAILABLE, "busy").into_response(),
            "bad" => (StatusCode::BAD_REQUEST, "bad request").into_response(),
            _ => {
                tokio::time::sleep(Duration::from_secs(10)).await;
                StatusCode::OK.into_response()
            }
        }
    }

    async fn start_server() -> (String, Seen) {
        let seen = Seen::default();
        let app = Router::new()
            .route("/:mode/chat/completions", post(completions))
            .with_state(seen.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{addr}"), seen)
    }

    fn model(base: &str, mode: &str) -> ModelConfig {
        ModelConfig {
            base_url: format!("{base}/{mode}"),
            model_name: Some(format!("{mode}-model")),
            api_key: None,
            tool_call_format: ToolCallFormat::NativeJson,
            temperature: 0.2,
            max_tokens: 64,
            timeout_seconds: 5,
        }
    }

    fn client(active: &str, chain: &[&str], models: Vec<(&str, ModelConfig)>) -> InferenceClient {
        let config = ModelsConfig {
            active_model: active.to_string(),
            fallback_chain: chain.iter().map(|s| s.to_string()).collect(),
            models: models
                .into_iter()
                .map(|(k, m)| (k.to_string(), m))
                .collect::<HashMap<_, _>>(),
        };
        InferenceClient::from_config(config).unwrap()
    }

    fn tools() -> Vec<ToolDefinition> {
        vec![ToolDefinition::function(
            "fs_read_file",
            "Read a file",
            json!({"type": "object", "properties": {"path": {"type": "string"}}}),
        )]
    }

    #[tokio::test]
    async fn test_text_completion() {
        let (base, seen) = start_server().await;
        let client = client("primary", &[], vec![("primary", model(&base, "ok"))]);
        let ctx = CallContext::new(Duration::from_secs(5));

        let completion = client
            .complete(&[ChatMessage::user("hi")], &tools(), &CompletionOptions::default(), &ctx)
            .await
            .unwrap();
        assert_eq!(completion.content.as_deref(), Some("answer from ok"));
        assert_eq!(completion.model, "primary");

        let bodies = seen.bodies.lock().unwrap();
        assert_eq!(bodies[0].1["model"], "ok-model");
        assert_eq!(bodies[0].1["stream"], false);
        assert_eq!(bodies[0].1["tools"][0]["function"]["name"], "fs_read_file");
        assert_eq!(bodies[0].1["tool_choice"], "auto");
    }

    #[tokio::test]
    async fn test_native_tool_calls_parsed_in_order() {
        let (base, _) = start_server().await;
        let client = client("m", &[], vec![("m", model(&base, "calls"))]);
        let ctx = CallContext::new(Duration::from_secs(5));

        let completion = client
            .complete(&[ChatMessage::user("read /tmp/a")], &tools(), &CompletionOptions::default(), &ctx)
            .await
            .unwrap();
        assert!(completion.content.is_none());
        assert_eq!(completion.tool_calls.len(), 2);
        assert_eq!(completion.tool_calls[0].id, "call_a");
        assert_eq!(completion.tool_calls[0].arguments["path"], "/tmp/a");
        assert_eq!(completion.tool_calls[1].name, "fs_list");
        assert!(completion.tool_calls[1].id.starts_with("call_"));
    }

    #[tokio::test]
    async fn test_fenced_format_omits_tools_and_sends_api_key() {
        let (base, seen) = start_server().await;
        let mut m = model(&base, "ok");
        m.tool_call_format = ToolCallFormat::FencedJson;
        m.api_key = Some("sk-test".into());
        let client = client("m", &[], vec![("m", m)]);
        let ctx = CallContext::new(Duration::from_secs(5));

        client
            .complete(&[ChatMessage::user("hi")], &tools(), &CompletionOptions::default(), &ctx)
            .await
            .unwrap();
        assert!(seen.bodies.lock().unwrap()[0].1.get("tools").is_none());
        assert_eq!(seen.auth.lock().unwrap()[0].as_deref(), Some("Bearer sk-test"));
    }

    #[tokio::test]
    async fn test_falls_back_on_retriable_error() {
        let (base, seen) = start_server().await;
        let client = client(
            "primary",
            &["backup"],
            vec![("primary", model(&base, "busy")), ("backup", model(&base, "ok"))],
        );
        let ctx = CallContext::new(Duration::from_secs(5));

        let completion = client
            .complete(&[ChatMessage::user("hi")], &[], &CompletionOptions::default(), &ctx)
            .await
            .unwrap();
        assert_eq!(completion.model, "backup");

        // Stateless: the next call starts from the primary again.
        client
            .complete(&[ChatMessage::user("again")], &[], &CompletionOptions::default(), &ctx)
            .await
            .unwrap();
        let modes: Vec<String> = seen.bodies.lock().unwrap().iter().map(|(m, _)| m.clone()).collect();
        assert_eq!(modes, vec!["busy", "ok", "busy", "ok"]);
    }

    #[tokio::test]
    async fn test_non_retriable_error_stops_chain() {
        let (base, seen) = start_server().await;
        let client = client(
            "primary",
            &["backup"],
            vec![("primary", model(&base, "bad")), ("backup", model(&base, "ok"))],
        );
        let ctx = CallContext::new(Duration::from_secs(5));

        let err = client
            .complete(&[ChatMessage::user("hi")], &[], &CompletionOptions::default(), &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, InferenceError::HttpError { status: 400, .. }));
        assert_eq!(seen.bodies.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_all_models_unavailable() {
        let (base, _) = start_server().await;
        let client = client(
            "a",
            &["b"],
            vec![("a", model(&base, "busy")), ("b", model(&base, "busy"))],
        );
        let ctx = CallContext::new(Duration::from_secs(5));

        let err = client
            .complete(&[ChatMessage::user("hi")], &[], &CompletionOptions::default(), &ctx)
            .await
            .unwrap_err();
        match err {
            InferenceError::AllModelsUnavailable { attempted, last_error } => {
                assert_eq!(attempted, vec!["a", "b"]);
                assert!(last_error.contains("503"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_turn_deadline_bounds_model_call() {
        let (base, _) = start_server().await;
        let client = client(
            "slow",
            &["backup"],
            vec![("slow", model(&base, "hang")), ("backup", model(&base, "ok"))],
        );
        let ctx = CallContext::new(Duration::from_millis(300));
        let started = std::time::Instant::now();

        let err = client
            .complete(&[ChatMessage::user("hi")], &[], &CompletionOptions::default(), &ctx)
            .await
            .unwrap_err();
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(matches!(err, InferenceError::AllModelsUnavailable { ref attempted, .. } if attempted == &["slow"]));
    }

    #[tokio::test]
    async fn test_cancelled_context() {
        let (base, _) = start_server().await;
        let client = client("m", &[], vec![("m", model(&base, "hang"))]);
        let ctx = CallContext::new(Duration::from_secs(5));
        let cancel = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel.cancel();
        });

        let err = client
            .complete(&[ChatMessage::user("hi")], &[], &CompletionOptions::default(), &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, InferenceError::Cancelled));
    }

    #[test]
    fn test_parse_completion_rejects_empty_choices() {
        assert!(matches!(
            parse_completion(r#"{"choices": []}"#),
            Err(InferenceError::MalformedResponse { .. })
        ));
        assert!(parse_completion("not json").is_err());
    }

    #[test]
    fn test_parse_completion_object_arguments() {
        let body = r#"{"choices":[{"message":{"content":"","tool_calls":[{"function":{"name":"t","arguments":{"k":1}}}]}}]}"#;
        let completion = parse_completion(body).unwrap();
        assert!(completion.content.is_none());
        assert_eq!(completion.tool_calls[0].arguments["k"], 1);
    }
}
