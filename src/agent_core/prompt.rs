//! Prompt assembly: system preamble, tool schemas, history, user text.

use crate::inference::config::ToolCallFormat;
use crate::inference::types::{ChatMessage, ToolDefinition};
use crate::mcp_client::ToolDescription;

/// Identity and rules; the tool section is appended after it.
pub const DEFAULT_PREAMBLE: &str = "\
You are a helpful assistant in a team chat workspace. You can call tools \
provided by connected tool servers.\n\n\
Rules:\n\
1. Use the exact tool names listed below, including the server prefix \
(e.g. fs_read_file, NOT read_file).\n\
2. Call a tool only when it helps answer the question; otherwise answer directly.\n\
3. Only report results you actually received from tool calls. If a tool failed, \
say so instead of guessing.\n\
4. Be concise.";

/// Instructions for models that express calls as fenced JSON.
const FENCED_INSTRUCTIONS: &str = "\
To call a tool, reply with a fenced JSON block and nothing else, for example:\n\
```json\n\
{\"name\": \"<tool name>\", \"arguments\": {\"<arg>\": \"<value>\"}}\n\
```\n\
To call several tools, use one block per call. When you have the answer, reply \
in plain text without any JSON block.";

/// Build the system prompt.
///
/// Native-format models get a one-line summary per tool (their schemas are
/// sent out of band); fenced-format models get the full schemas plus the
/// calling convention.
pub fn render_system_prompt(
    preamble: Option<&str>,
    tools: &[ToolDescription],
    format: ToolCallFormat,
) -> String {
    let preamble = preamble.unwrap_or(DEFAULT_PREAMBLE);
    if tools.is_empty() {
        return format!("{preamble}\n\nNo tools are available right now; answer from your own knowledge.");
    }

    let mut out = format!("{preamble}\n\nAvailable tools:\n");
    for tool in tools {
        match format {
            ToolCallFormat::NativeJson => {
                out.push_str(&format!("- {}: {}\n", tool.name, first_line(&tool.description)));
            }
            ToolCallFormat::FencedJson => {
                out.push_str(&format!(
                    "- {}: {}\n  parameters: {}\n",
                    tool.name,
                    first_line(&tool.description),
                    tool.parameters
                ));
            }
        }
    }
    if format == ToolCallFormat::FencedJson {
        out.push('\n');
        out.push_str(FENCED_INSTRUCTIONS);
    }
    out
}

fn first_line(text: &str) -> &str {
    text.lines().next().unwrap_or("").trim()
}

/// OpenAI-format tool definitions for native function calling.
pub fn tool_definitions(tools: &[ToolDescription]) -> Vec<ToolDefinition> {
    tools
        .iter()
        .map(|t| ToolDefinition::function(&t.name, &t.description, t.parameters.clone()))
        .collect()
}

/// System prompt, then prior history, then the new user message.
pub fn build_messages(system: String, history: Vec<ChatMessage>, user_text: &str) -> Vec<ChatMessage> {
    let mut messages = Vec::with_capacity(history.len() + 2);
    messages.push(ChatMessage::system(system));
    messages.extend(history);
    messages.push(ChatMessage::user(user_text));
    messages
}
