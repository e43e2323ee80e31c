//! Tool registry: aggregates tool catalogs across all server sessions.
//!
//! Provides:
//! - One flat namespace of qualified names (`<serverId>_<rawName>`)
//! - Allow/block filtering at registration, with denied names remembered
//! - Lookup by qualified name and unique-bare-name resolution
//! - Best-effort argument validation and coercion against the input schema
//! - Serialization of tools into the LLM function-calling format

use std::collections::HashMap;

use serde::Serialize;
use serde_json::{Map, Value};

use super::errors::McpError;
use super::types::ToolDef;

/// Index of a session in the runtime's session table.
pub type SessionId = usize;

// ─── Entries ─────────────────────────────────────────────────────────────────

/// One registered tool.
#[derive(Debug, Clone, PartialEq)]
pub struct RegisteredTool {
    /// `<serverId>_<rawName>`.
    pub qualified_name: String,
    /// Owning session, as an index rather than a reference.
    pub session: SessionId,
    pub server_id: String,
    /// The definition as the server advertised it; `def.name` is the raw name.
    pub def: ToolDef,
}

impl RegisteredTool {
    pub fn raw_name(&self) -> &str {
        &self.def.name
    }
}

/// Allow/block policy for one server.
#[derive(Debug, Clone, Default)]
pub struct ToolPolicy {
    /// If non-empty, only these tools may register.
    pub allow_list: Vec<String>,
    /// These tools never register.
    pub block_list: Vec<String>,
}

impl ToolPolicy {
    pub fn new(allow_list: &[String], block_list: &[String]) -> Self {
        Self {
            allow_list: allow_list.to_vec(),
            block_list: block_list.to_vec(),
        }
    }

    /// Why `raw` (qualified as `qualified`) is not allowed, if it isn't.
    /// List entries may use either form.
    fn denial(&self, raw: &str, qualified: &str) -> Option<String> {
        let listed = |list: &[String]| list.iter().any(|n| n == raw || n == qualified);
        if listed(&self.block_list) {
            return Some("listed in block-list".to_string());
        }
        if !self.allow_list.is_empty() && !listed(&self.allow_list) {
            return Some("not in allow-list".to_string());
        }
        None
    }
}

/// What happened to each tool of one `register` call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RegistrationReport {
    pub server_id: String,
    pub registered: Vec<String>,
    pub denied: Vec<String>,
    /// Qualified names already taken by an earlier registration.
    pub skipped: Vec<String>,
}

/// Tool description handed to the prompt renderer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolDescription {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// Build the qualified name for a server's tool.
pub fn qualified_name(server_id: &str, raw_name: &str) -> String {
    format!("{server_id}_{raw_name}")
}

// ─── ToolRegistry ────────────────────────────────────────────────────────────

/// Aggregated tool registry across all sessions of one generation.
///
/// Registration order is preserved and decides every tie: the first
/// registration of a qualified name wins.
#[derive(Debug, Clone, Default)]
pub struct ToolRegistry {
    tools: Vec<RegisteredTool>,
    /// `qualified name → position in tools`.
    index: HashMap<String, usize>,
    /// `qualified name → why it was filtered out`.
    denied: HashMap<String, Denial>,
}

#[derive(Debug, Clone)]
struct Denial {
    /// The name the server advertised.
    raw_name: String,
    reason: String,
}

impl ToolRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session's catalog under `server_id`, applying `policy`.
    pub fn register(
        &mut self,
        session: SessionId,
        server_id: &str,
        tools: &[ToolDef],
        policy: &ToolPolicy,
    ) -> RegistrationReport {
        let mut report = RegistrationReport {
            server_id: server_id.to_string(),
            ..Default::default()
        };

        for def in tools {
            let fq_name = qualified_name(server_id, &def.name);

            if let Some(reason) = policy.denial(&def.name, &fq_name) {
                tracing::debug!(server = server_id, tool = %fq_name, reason = %reason, "tool denied by policy");
                self.denied.insert(
                    fq_name.clone(),
                    Denial {
                        raw_name: def.name.clone(),
                        reason,
                    },
                );
                report.denied.push(fq_name);
                continue;
            }

            if let Some(&existing) = self.index.get(&fq_name) {
                tracing::warn!(
                    server = server_id,
                    tool = %fq_name,
                    owner = %self.tools[existing].server_id,
                    "qualified tool name already registered, keeping the first"
                );
                report.skipped.push(fq_name);
                continue;
            }

            if let Some(other) = self
                .tools
                .iter()
                .find(|t| t.def.name == def.name && t.server_id != server_id)
            {
                tracing::warn!(
                    tool = %def.name,
                    first = %other.server_id,
                    second = server_id,
                    "raw tool name advertised by more than one server; use qualified names"
                );
            }

            self.index.insert(fq_name.clone(), self.tools.len());
            self.tools.push(RegisteredTool {
                qualified_name: fq_name.clone(),
                session,
                server_id: server_id.to_string(),
                def: def.clone(),
            });
            report.registered.push(fq_name);
        }

        report
    }

    /// Look up a tool by its qualified name.
    pub fn lookup(&self, qualified: &str) -> Result<&RegisteredTool, McpError> {
        if let Some(&pos) = self.index.get(qualified) {
            return Ok(&self.tools[pos]);
        }
        if let Some(denial) = self.denied.get(qualified) {
            return Err(McpError::Denied {
                name: qualified.to_string(),
                reason: denial.reason.clone(),
            });
        }
        Err(McpError::UnknownTool {
            name: qualified.to_string(),
        })
    }

    /// Resolve a name the model emitted.
    ///
    /// Qualified names are tried first. A bare raw name resolves only when
    /// exactly one registered tool carries it; otherwise `UnknownTool`.
    pub fn resolve(&self, name: &str) -> Result<&RegisteredTool, McpError> {
        match self.lookup(name) {
            Ok(tool) => return Ok(tool),
            Err(e @ McpError::Denied { .. }) => return Err(e),
            Err(_) => {}
        }

        let candidates: Vec<&RegisteredTool> =
            self.tools.iter().filter(|t| t.def.name == name).collect();
        match candidates.as_slice() {
            [only] => Ok(only),
            [] => {
                // A denied tool is reported as such only when the bare
                // name points at exactly one of them.
                let mut denied = self.denied.iter().filter(|(_, d)| d.raw_name == name);
                if let (Some((fq, denial)), None) = (denied.next(), denied.next()) {
                    return Err(McpError::Denied {
                        name: fq.clone(),
                        reason: denial.reason.clone(),
                    });
                }
                Err(McpError::UnknownTool {
                    name: name.to_string(),
                })
            }
            _ => {
                tracing::debug!(
                    tool = name,
                    candidates = candidates.len(),
                    "bare tool name is ambiguous"
                );
                Err(McpError::UnknownTool {
                    name: name.to_string(),
                })
            }
        }
    }

    /// Every registered tool, in registration order.
    pub fn describe_all(&self) -> Vec<ToolDescription> {
        self.tools
            .iter()
            .map(|t| ToolDescription {
                name: t.qualified_name.clone(),
                description: t.def.description.clone(),
                parameters: t.def.input_schema.clone(),
            })
            .collect()
    }

    /// Serialize all tool definitions into OpenAI function-calling format.
    ///
    /// Used to populate the `tools` field in chat completion requests.
    pub fn to_openai_tools(&self) -> Vec<Value> {
        self.describe_all()
            .into_iter()
            .map(|d| {
                serde_json::json!({
                    "type": "function",
                    "function": {
                        "name": d.name,
                        "description": d.description,
                        "parameters": d.parameters,
                    }
                })
            })
            .collect()
    }

    pub fn tools(&self) -> &[RegisteredTool] {
        &self.tools
    }

    /// Registered qualified names, in registration order.
    pub fn tool_names(&self) -> Vec<&str> {
        self.tools.iter().map(|t| t.qualified_name.as_str()).collect()
    }

    /// Number of registered tools.
    pub fn len(&self) -> usize {
        self.tools.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Count tools belonging to a specific server.
    pub fn tools_for_server(&self, server_id: &str) -> usize {
        self.tools.iter().filter(|t| t.server_id == server_id).count()
    }

    /// Find up to `max_results` registered names most similar to `name`.
    ///
    /// Compares against both qualified and raw names and ranks by the better
    /// of the two scores. Used to give the model a hint after a miss.
    pub fn find_similar(&self, name: &str, max_results: usize) -> Vec<String> {
        let mut scored: Vec<(String, f64)> = self
            .tools
            .iter()
            .map(|t| {
                let score = similarity(name, &t.qualified_name).max(similarity(name, &t.def.name));
                (t.qualified_name.clone(), score)
            })
            .filter(|(_, score)| *score > 0.3) // don't suggest wildly different tools
            .collect();

        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(max_results);
        scored.into_iter().map(|(name, _)| name).collect()
    }

    /// Validate `arguments` against the tool's input schema and coerce
    /// unambiguous type mismatches.
    ///
    /// This is a structural check of top-level fields only: required fields
    /// present, declared types matched. Full JSON Schema validation is left
    /// to the server.
    pub fn prepare_arguments(
        &self,
        tool: &RegisteredTool,
        arguments: Value,
    ) -> Result<Value, McpError> {
        let invalid = |reason: String| McpError::InvalidArguments {
            tool: tool.qualified_name.clone(),
            reason,
        };

        let mut args = match arguments {
            Value::Null => Map::new(),
            Value::Object(map) => map,
            // Some models double-encode the argument object.
            Value::String(s) => match serde_json::from_str::<Value>(&s) {
                Ok(Value::Object(map)) => map,
                _ => return Err(invalid("arguments must be a JSON object".to_string())),
            },
            other => {
                return Err(invalid(format!(
                    "arguments must be a JSON object, got {}",
                    json_type(&other)
                )))
            }
        };

        let schema = &tool.def.input_schema;
        if let Some(properties) = schema.get("properties").and_then(Value::as_object) {
            for (field, prop) in properties {
                let Some(expected) = prop.get("type").and_then(Value::as_str) else {
                    continue;
                };
                if let Some(value) = args.get_mut(field) {
                    coerce(value, expected).map_err(|reason| invalid(format!("'{field}': {reason}")))?;
                }
            }
        }

        if let Some(required) = schema.get("required").and_then(Value::as_array) {
            for field in required.iter().filter_map(Value::as_str) {
                if !args.contains_key(field) {
                    return Err(invalid(format!("missing required field: '{field}'")));
                }
            }
        }

        Ok(Value::Object(args))
    }
}

// ─── Coercion ────────────────────────────────────────────────────────────────

/// Coerce `value` to the JSON-schema `expected` type when the conversion is
/// unambiguous. Leaves matching values untouched.
fn coerce(value: &mut Value, expected: &str) -> Result<(), String> {
    let coerced = match (expected, &*value) {
        ("string", Value::String(_))
        | ("number", Value::Number(_))
        | ("boolean", Value::Bool(_))
        | ("array", Value::Array(_))
        | ("object", Value::Object(_))
        | ("null", Value::Null) => return Ok(()),
        ("integer", Value::Number(n)) if n.is_i64() || n.is_u64() => return Ok(()),
        ("integer", Value::Number(n)) => match n.as_f64() {
            Some(f) if f.fract() == 0.0 && f.abs() < i64::MAX as f64 => Value::from(f as i64),
            _ => return Err(format!("expected integer, got {n}")),
        },
        ("string", Value::Number(n)) => Value::String(n.to_string()),
        ("string", Value::Bool(b)) => Value::String(b.to_string()),
        ("number", Value::String(s)) => match s.trim().parse::<f64>() {
            Ok(f) => match serde_json::Number::from_f64(f) {
                Some(n) => Value::Number(n),
                None => return Err(format!("'{s}' is not a finite number")),
            },
            Err(_) => return Err(format!("expected number, got \"{s}\"")),
        },
        ("integer", Value::String(s)) => match s.trim().parse::<i64>() {
            Ok(i) => Value::from(i),
            Err(_) => return Err(format!("expected integer, got \"{s}\"")),
        },
        ("boolean", Value::String(s)) => match s.trim().to_ascii_lowercase().as_str() {
            "true" => Value::Bool(true),
            "false" => Value::Bool(false),
            _ => return Err(format!("expected boolean, got \"{s}\"")),
        },
        ("array" | "object", Value::String(s)) => match serde_json::from_str::<Value>(s) {
            Ok(parsed) if json_type(&parsed) == expected => parsed,
            _ => return Err(format!("expected {expected}, got a string")),
        },
        (expected, other) if is_known_type(expected) => {
            return Err(format!("expected {expected}, got {}", json_type(other)))
        }
        // Unknown or union types: leave it to the server.
        _ => return Ok(()),
    };
    *value = coerced;
    Ok(())
}

fn is_known_type(t: &str) -> bool {
    matches!(
        t,
        "string" | "number" | "integer" | "boolean" | "array" | "object" | "null"
    )
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

// ─── Edit Distance ───────────────────────────────────────────────────────────

/// Levenshtein edit distance over chars.
fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let n = b.len();

    // Single-row DP
    let mut prev: Vec<usize> = (0..=n).collect();
    let mut curr = vec![0usize; n + 1];

    for i in 1..=a.len() {
        curr[0] = i;
        for j in 1..=n {
            let cost = usize::from(a[i - 1] != b[j - 1]);
            curr[j] = (prev[j] + 1).min(curr[j - 1] + 1).min(prev[j - 1] + cost);
        }
        std::mem::swap(&mut prev, &mut curr);
    }

    prev[n]
}

/// Normalized similarity (0.0 = completely different, 1.0 = identical).
fn similarity(a: &str, b: &str) -> f64 {
    let max_len = a.chars().count().max(b.chars().count());
    if max_len == 0 {
        return 1.0;
    }
    1.0 - (levenshtein(a, b) as f64 / max_len as f64)
}

// ─── Tests ───────────────────────────────────────────────────────────────────
