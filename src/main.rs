//! chatops-bridge: console entry point.
//!
//! Reads chat messages from stdin, answers on stdout, logs to stderr or the
//! configured log file. SIGHUP reloads the tool runtime; SIGINT and SIGTERM
//! shut it down.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::io::BufReader;

use chatops_bridge::config::{load_config, process_env, resolve_config_path, BridgeConfig, ConfigError};
use chatops_bridge::frontend::{read_console_lines, ChatFrontend, ConsoleFrontend, FrontendError, CONSOLE_THREAD};
use chatops_bridge::init_tracing;
use chatops_bridge::supervisor::{openai_compatible, spawn_signal_listener, Supervisor};

const EXIT_CONFIG: u8 = 1;
const EXIT_FRONTEND: u8 = 2;
const EXIT_OTHER: u8 = 3;

#[derive(Parser, Debug)]
#[command(name = "chatops-bridge", version, about = "Routes LLM tool calls to MCP tool servers")]
struct Cli {
    /// Configuration file (YAML, or JSON with a .json extension).
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// Load and validate the configuration, print the servers, and exit.
    #[arg(long)]
    check: bool,

    /// User id attached to console messages.
    #[arg(long, default_value = "console-user")]
    user: String,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let (path, config) = match load(cli.config.as_deref()) {
        Ok(loaded) => loaded,
        Err(e) => {
            eprintln!("chatops-bridge: {e}");
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    if cli.check {
        print_check(&path, &config);
        return ExitCode::SUCCESS;
    }

    if let Err(e) = init_tracing(&config.logging) {
        eprintln!("chatops-bridge: {e}");
        return ExitCode::from(EXIT_OTHER);
    }

    match run(config, path, &cli.user).await {
        Ok(()) => {
            tracing::info!("=== chatops-bridge stopped ===");
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!(error = %format!("{e:#}"), "fatal error");
            eprintln!("chatops-bridge: {e:#}");
            ExitCode::from(exit_code_for(&e))
        }
    }
}

fn load(explicit: Option<&Path>) -> Result<(PathBuf, BridgeConfig), ConfigError> {
    let path = resolve_config_path(explicit, &process_env)?;
    let config = load_config(&path)?;
    Ok((path, config))
}

fn print_check(path: &Path, config: &BridgeConfig) {
    println!("configuration OK: {}", path.display());
    println!(
        "llm: {} (fallbacks: {})",
        config.llm.active_model,
        if config.llm.fallback_chain.is_empty() {
            "none".to_string()
        } else {
            config.llm.fallback_chain.join(", ")
        }
    );
    println!("servers:");
    for line in config.server_summary() {
        println!("  {line}");
    }
}

async fn run(config: BridgeConfig, path: PathBuf, user: &str) -> anyhow::Result<()> {
    let frontend = Arc::new(ConsoleFrontend::stdout());
    frontend
        .status(CONSOLE_THREAD, "starting tool servers")
        .await
        .context("console front-end unavailable")?;

    let ingress = read_console_lines(BufReader::new(tokio::io::stdin()), user);
    let control = spawn_signal_listener().context("failed to install signal handlers")?;

    let supervisor = Supervisor::new(config, frontend, openai_compatible())
        .context("failed to create the supervisor")?
        .with_config_path(path);
    supervisor.run(ingress, control).await
}

fn exit_code_for(err: &anyhow::Error) -> u8 {
    if err.chain().any(|cause| cause.downcast_ref::<ConfigError>().is_some()) {
        EXIT_CONFIG
    } else if err.chain().any(|cause| cause.downcast_ref::<FrontendError>().is_some()) {
        EXIT_FRONTEND
    } else {
        EXIT_OTHER
    }
}
