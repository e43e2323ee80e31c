//! Bridge configuration: loading, `${VAR}` expansion, validation.
//!
//! The file is YAML unless its extension is `.json`. Keys are snake_case and
//! accept camelCase aliases. Environment references are expanded only in the
//! fields that commonly carry secrets or deployment-specific values (HTTP
//! headers, URLs, child-process env, API keys), against a lookup function
//! supplied by the caller so tests never touch the process environment.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::agent_core::conversation::{DEFAULT_HISTORY_LIMIT, DEFAULT_HISTORY_THREADS};
use crate::agent_core::conversation_loop::{LoopSettings, DEFAULT_MAX_TOOL_ROUNDS};
use crate::errors::ErrorKind;
use crate::inference::config::{resolve_active_model, ModelsConfig, ToolCallFormat};
use crate::inference::types::CompletionOptions;
use crate::mcp_client::{ServerSpec, TransportKind};

// ─── Constants ───────────────────────────────────────────────────────────────

/// Environment variable naming the config file.
pub const CONFIG_ENV_VAR: &str = "CHATOPS_BRIDGE_CONFIG";

/// Config file looked up in the working directory.
pub const LOCAL_CONFIG_FILE: &str = "chatops-bridge.yaml";

/// Shortest allowed periodic reload interval.
pub const MIN_RELOAD_INTERVAL_SECS: u64 = 10;

// ─── Errors ──────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {reason}")]
    Read { path: String, reason: String },

    #[error("failed to parse {path}: {reason}")]
    Parse { path: String, reason: String },

    #[error("invalid configuration: {reason}")]
    Invalid { reason: String },

    #[error("no configuration file found (searched: {})", .searched.join(", "))]
    NotFound { searched: Vec<String> },
}

impl ConfigError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::ConfigError
    }
}

fn invalid(reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        reason: reason.into(),
    }
}

// ─── Types ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Log settings, passed explicitly to `init_tracing`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive; `RUST_LOG` overrides it.
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
    /// Log file path; stderr when absent.
    #[serde(default)]
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::Text,
            file: None,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// The whole configuration record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    #[serde(default = "default_history_limit", alias = "historyLimit")]
    pub history_limit: usize,
    /// Threads whose history is kept; the least recently active is forgotten first.
    #[serde(default = "default_history_max_threads", alias = "historyMaxThreads")]
    pub history_max_threads: usize,
    #[serde(default = "default_max_tool_rounds", alias = "maxToolRounds")]
    pub max_tool_rounds: usize,
    #[serde(default, alias = "reloadEnabled")]
    pub reload_enabled: bool,
    #[serde(
        default = "default_reload_interval_seconds",
        alias = "reloadInterval",
        alias = "reloadIntervalSeconds"
    )]
    pub reload_interval_seconds: u64,
    #[serde(default = "default_shutdown_grace_seconds", alias = "shutdownGraceSeconds")]
    pub shutdown_grace_seconds: u64,
    #[serde(default = "default_tool_call_timeout_seconds", alias = "toolCallTimeoutSeconds")]
    pub tool_call_timeout_seconds: u64,
    #[serde(default = "default_turn_timeout_seconds", alias = "turnTimeoutSeconds")]
    pub turn_timeout_seconds: u64,
    /// A thread's worker task ends after this long without messages.
    #[serde(default = "default_thread_idle_seconds", alias = "threadIdleSeconds")]
    pub thread_idle_seconds: u64,
    #[serde(default, alias = "systemPrompt")]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub llm: ModelsConfig,
    #[serde(default)]
    pub servers: Vec<ServerSpec>,
}

fn default_history_limit() -> usize {
    DEFAULT_HISTORY_LIMIT
}
fn default_history_max_threads() -> usize {
    DEFAULT_HISTORY_THREADS
}
fn default_max_tool_rounds() -> usize {
    DEFAULT_MAX_TOOL_ROUNDS
}
fn default_reload_interval_seconds() -> u64 {
    60
}
fn default_shutdown_grace_seconds() -> u64 {
    10
}
fn default_tool_call_timeout_seconds() -> u64 {
    60
}
fn default_turn_timeout_seconds() -> u64 {
    300
}
fn default_thread_idle_seconds() -> u64 {
    300
}

impl BridgeConfig {
    /// Check everything that would otherwise fail later at start-up.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.history_limit == 0 {
            return Err(invalid("history_limit must be at least 1"));
        }
        if self.history_max_threads == 0 {
            return Err(invalid("history_max_threads must be at least 1"));
        }
        if self.reload_enabled && self.reload_interval_seconds < MIN_RELOAD_INTERVAL_SECS {
            return Err(invalid(format!(
                "reload_interval_seconds must be at least {MIN_RELOAD_INTERVAL_SECS} (got {})",
                self.reload_interval_seconds
            )));
        }
        if self.tool_call_timeout_seconds == 0
            || self.turn_timeout_seconds == 0
            || self.thread_idle_seconds == 0
        {
            return Err(invalid("timeouts must be greater than zero"));
        }

        let mut seen = HashSet::new();
        for spec in &self.servers {
            let id = spec.id.trim();
            if id.is_empty() {
                return Err(invalid("server id must not be empty"));
            }
            if spec.id.chars().any(char::is_whitespace) {
                return Err(invalid(format!("server id '{}' contains whitespace", spec.id)));
            }
            if !seen.insert(spec.id.as_str()) {
                return Err(invalid(format!("duplicate server id '{}'", spec.id)));
            }
            if spec.disabled {
                continue;
            }
            spec.endpoint()
                .map_err(|reason| invalid(format!("server '{}': {reason}", spec.id)))?;
        }

        if !self.llm.models.contains_key(&self.llm.active_model) {
            return Err(invalid(format!(
                "active_model '{}' is not defined under llm.models",
                self.llm.active_model
            )));
        }
        for key in &self.llm.fallback_chain {
            if !self.llm.models.contains_key(key) {
                tracing::warn!(model = %key, "fallback model not defined, it will be skipped");
            }
        }
        Ok(())
    }

    pub fn tool_call_timeout(&self) -> Duration {
        Duration::from_secs(self.tool_call_timeout_seconds)
    }

    pub fn turn_timeout(&self) -> Duration {
        Duration::from_secs(self.turn_timeout_seconds)
    }

    pub fn thread_idle(&self) -> Duration {
        Duration::from_secs(self.thread_idle_seconds)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_seconds)
    }

    /// The periodic reload interval, when periodic reload is enabled.
    pub fn reload_interval(&self) -> Option<Duration> {
        self.reload_enabled
            .then(|| Duration::from_secs(self.reload_interval_seconds.max(MIN_RELOAD_INTERVAL_SECS)))
    }

    /// Conversation loop settings derived from this configuration.
    pub fn loop_settings(&self) -> LoopSettings {
        let tool_call_format = resolve_active_model(&self.llm)
            .map(|(_, m)| m.tool_call_format)
            .unwrap_or(ToolCallFormat::NativeJson);
        LoopSettings {
            max_tool_rounds: self.max_tool_rounds,
            tool_timeout: self.tool_call_timeout(),
            turn_timeout: self.turn_timeout(),
            system_prompt: self.system_prompt.clone(),
            tool_call_format,
            options: CompletionOptions::default(),
        }
    }

    /// One line per server, for `--check` output.
    pub fn server_summary(&self) -> Vec<String> {
        self.servers
            .iter()
            .map(|s| {
                let kind = s
                    .transport_kind()
                    .map(|k| k.to_string())
                    .unwrap_or_else(|| "?".to_string());
                let target = match s.transport_kind() {
                    Some(TransportKind::Stdio) => s.command.clone().unwrap_or_default(),
                    _ => s.url.clone().unwrap_or_default(),
                };
                let state = if s.disabled { " (disabled)" } else { "" };
                format!("{} [{kind}] {target}{state}", s.id)
            })
            .collect()
    }

    /// Expand `${VAR}` references in the fields that allow them.
    fn expand(&mut self, lookup: &dyn Fn(&str) -> Option<String>) {
        for spec in &mut self.servers {
            if let Some(url) = spec.url.as_mut() {
                *url = interpolate_env_vars(url, lookup);
            }
            for value in spec.http_headers.values_mut() {
                *value = interpolate_env_vars(value, lookup);
            }
            for value in spec.env.values_mut() {
                *value = interpolate_env_vars(value, lookup);
            }
        }
        for model in self.llm.models.values_mut() {
            if let Some(key) = model.api_key.as_mut() {
                *key = interpolate_env_vars(key, lookup);
            }
        }
    }
}

// ─── Loading ─────────────────────────────────────────────────────────────────

/// Serialization format of a config file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    Yaml,
    Json,
}

impl ConfigFormat {
    /// `.json` is JSON; everything else is YAML.
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("json") => ConfigFormat::Json,
            _ => ConfigFormat::Yaml,
        }
    }
}

/// Process-environment lookup used in production.
pub fn process_env(name: &str) -> Option<String> {
    std::env::var(name).ok()
}

/// Load, expand and validate a config file against the process environment.
pub fn load_config(path: &Path) -> Result<BridgeConfig, ConfigError> {
    load_config_with(path, &process_env)
}

/// Load, expand and validate a config file with an explicit env lookup.
pub fn load_config_with(
    path: &Path,
    lookup: &dyn Fn(&str) -> Option<String>,
) -> Result<BridgeConfig, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;

    let config = parse_config(&raw, ConfigFormat::from_path(path), lookup).map_err(|e| match e {
        ConfigError::Parse { reason, .. } => ConfigError::Parse {
            path: path.display().to_string(),
            reason,
        },
        other => other,
    })?;

    tracing::info!(
        path = %path.display(),
        servers = config.servers.len(),
        active_model = %config.llm.active_model,
        "configuration loaded"
    );
    Ok(config)
}

/// Parse, expand and validate config text.
pub fn parse_config(
    raw: &str,
    format: ConfigFormat,
    lookup: &dyn Fn(&str) -> Option<String>,
) -> Result<BridgeConfig, ConfigError> {
    let parse_error = |reason: String| ConfigError::Parse {
        path: "<inline>".to_string(),
        reason,
    };
    let mut config: BridgeConfig = match format {
        ConfigFormat::Yaml => serde_yaml::from_str(raw).map_err(|e| parse_error(e.to_string()))?,
        ConfigFormat::Json => serde_json::from_str(raw).map_err(|e| parse_error(e.to_string()))?,
    };
    config.expand(lookup);
    config.validate()?;
    Ok(config)
}

/// Find the config file: explicit path, then `CHATOPS_BRIDGE_CONFIG`, then
/// `./chatops-bridge.yaml`, then `<config dir>/chatops-bridge/config.yaml`.
///
/// An explicit path or env value is returned as-is (a missing file fails
/// at load time with a clear read error).
pub fn resolve_config_path(
    explicit: Option<&Path>,
    lookup: &dyn Fn(&str) -> Option<String>,
) -> Result<PathBuf, ConfigError> {
    if let Some(path) = explicit {
        return Ok(path.to_path_buf());
    }
    if let Some(path) = lookup(CONFIG_ENV_VAR).filter(|p| !p.trim().is_empty()) {
        return Ok(PathBuf::from(expand_tilde(&path)));
    }

    let mut candidates = vec![PathBuf::from(LOCAL_CONFIG_FILE)];
    if let Some(dir) = dirs::config_dir() {
        candidates.push(dir.join("chatops-bridge").join("config.yaml"));
    }
    if let Some(found) = candidates.iter().find(|c| c.exists()) {
        return Ok(found.clone());
    }

    Err(ConfigError::NotFound {
        searched: std::iter::once(format!("${CONFIG_ENV_VAR}"))
            .chain(candidates.iter().map(|c| c.display().to_string()))
            .collect(),
    })
}

// ─── Env-var interpolation ───────────────────────────────────────────────────

/// Replace `${VAR}` and `${VAR:-default}` in a string. Unset variables
/// without a default expand to the empty string; an unterminated `${` is
/// kept literally.
pub fn interpolate_env_vars(input: &str, lookup: &dyn Fn(&str) -> Option<String>) -> String {
    let mut result = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find("${") {
        result.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                result.push_str(&resolve_var_expr(&after[..end], lookup));
                rest = &after[end + 1..];
            }
            None => {
                result.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    result.push_str(rest);
    result
}

/// Resolve a variable expression like `VAR` or `VAR:-default`.
fn resolve_var_expr(expr: &str, lookup: &dyn Fn(&str) -> Option<String>) -> String {
    match expr.split_once(":-") {
        Some((name, default)) => lookup(name.trim())
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| expand_tilde(default)),
        None => lookup(expr.trim()).unwrap_or_default(),
    }
}

/// Expand a leading `~` to the user's home directory.
fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix('~') {
        if let Some(home) = dirs::home_dir() {
            return format!("{}{rest}", home.display());
        }
    }
    path.to_string()
}

// ─── Tests ───────────────────────────────────────────────────────────────────
