//! Scripted LLM provider and recording front-end for unit tests.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::context::CallContext;
use crate::frontend::{ChatFrontend, FrontendError};
use crate::inference::types::{ChatMessage, Completion, CompletionOptions, ToolCall, ToolDefinition};
use crate::inference::{InferenceError, LlmProvider};

/// One scripted provider step.
pub(crate) enum Step {
    Reply(Completion),
    Fail(InferenceError),
    /// Wait this long (honoring the context) and then answer.
    Slow(Duration, Completion),
}

/// Replays scripted steps in order; once exhausted, answers with a fixed
/// text, or repeats a tool call forever when built with `looping`.
pub(crate) struct ScriptedLlm {
    steps: Mutex<VecDeque<Step>>,
    looping: Option<ToolCall>,
    seen: Mutex<Vec<Vec<ChatMessage>>>,
    tools_seen: Mutex<Vec<usize>>,
}

impl ScriptedLlm {
    pub(crate) fn new(steps: Vec<Step>) -> Self {
        Self {
            steps: Mutex::new(steps.into()),
            looping: None,
            seen: Mutex::new(Vec::new()),
            tools_seen: Mutex::new(Vec::new()),
        }
    }

    /// A provider that requests `call` on every completion.
    pub(crate) fn looping(call: ToolCall) -> Self {
        Self {
            looping: Some(call),
            ..Self::new(Vec::new())
        }
    }

    /// Messages of every completion request, in order.
    pub(crate) fn requests(&self) -> Vec<Vec<ChatMessage>> {
        self.seen.lock().unwrap().clone()
    }

    pub(crate) fn call_count(&self) -> usize {
        self.seen.lock().unwrap().len()
    }

    /// Number of tool definitions offered on each request.
    pub(crate) fn tool_counts(&self) -> Vec<usize> {
        self.tools_seen.lock().unwrap().clone()
    }
}

pub(crate) fn native_call(name: &str, arguments: serde_json::Value) -> Completion {
    Completion::calls(vec![ToolCall {
        id: format!("call_{name}"),
        name: name.to_string(),
        arguments,
    }])
}

#[async_trait]
impl LlmProvider for ScriptedLlm {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn complete(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
        _options: &CompletionOptions,
        ctx: &CallContext,
    ) -> Result<Completion, InferenceError> {
        self.seen.lock().unwrap().push(messages.to_vec());
        self.tools_seen.lock().unwrap().push(tools.len());

        let step = self.steps.lock().unwrap().pop_front();
        match step {
            Some(Step::Reply(c)) => Ok(c),
            Some(Step::Fail(e)) => Err(e),
            Some(Step::Slow(delay, c)) => match ctx.run(tokio::time::sleep(delay)).await {
                Ok(()) => Ok(c),
                Err(_) if ctx.is_cancelled() => Err(InferenceError::Cancelled),
                Err(_) => Err(InferenceError::Timeout {
                    duration_secs: delay.as_secs(),
                }),
            },
            None => match &self.looping {
                Some(call) => Ok(Completion::calls(vec![call.clone()])),
                None => Ok(Completion::text("done")),
            },
        }
    }
}

/// Records everything sent to it.
#[derive(Default)]
pub(crate) struct RecordingFrontend {
    sent: Mutex<Vec<(String, String)>>,
    statuses: Mutex<Vec<(String, String)>>,
    fail_sends: bool,
}

impl RecordingFrontend {
    pub(crate) fn failing() -> Self {
        Self {
            fail_sends: true,
            ..Default::default()
        }
    }

    /// `(thread_id, text)` of every sent message.
    pub(crate) fn sent(&self) -> Vec<(String, String)> {
        self.sent.lock().unwrap().clone()
    }

    pub(crate) fn sent_texts(&self) -> Vec<String> {
        self.sent().into_iter().map(|(_, t)| t).collect()
    }

    pub(crate) fn statuses(&self) -> Vec<(String, String)> {
        self.statuses.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChatFrontend for RecordingFrontend {
    async fn send(&self, thread_id: &str, text: &str) -> Result<(), FrontendError> {
        if self.fail_sends {
            return Err(FrontendError::Disconnected {
                reason: "test front-end".into(),
            });
        }
        self.sent
            .lock()
            .unwrap()
            .push((thread_id.to_string(), text.to_string()));
        Ok(())
    }

    async fn status(&self, thread_id: &str, text: &str) -> Result<(), FrontendError> {
        self.statuses
            .lock()
            .unwrap()
            .push((thread_id.to_string(), text.to_string()));
        Ok(())
    }
}
