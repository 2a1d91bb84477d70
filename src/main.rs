//! # conduit
//!
//! Agent server binary. Loads settings, installs logging, wires the engine and
//! its tools for the configured role, and serves until interrupted.

#![deny(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use conduit_core::tools::Tool;
use conduit_delegate::{DelegationClient, DelegationConfig};
use conduit_engine::{
    DelegateTool, KeywordRouter, ReasoningEngine, ReportProgressTool, Route, ScriptStep, ScriptedEngine,
    ToolRegistry,
};
use conduit_server::{AppState, ServerConfig};
use conduit_settings::{AgentRole, ConduitSettings};
use conduit_telemetry::{init_telemetry, LogFormat, TelemetryConfig};
use tracing::Level;

/// Streaming delegation agent.
#[derive(Parser, Debug)]
#[command(name = "conduit", about = "Conduit agent server", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the HTTP server.
    Serve(ServeArgs),
    /// Print the resolved worker endpoints and the delegation tools built for them.
    Workers {
        /// Settings file (defaults to ~/.conduit/settings.json).
        #[arg(long)]
        settings: Option<PathBuf>,
    },
}

#[derive(Args, Debug)]
struct ServeArgs {
    /// Port to bind (0 for auto-assign). Overrides settings.
    #[arg(long)]
    port: Option<u16>,

    /// `orchestrator` or `worker`. Overrides settings.
    #[arg(long)]
    role: Option<AgentRole>,

    /// Agent name reported by the health endpoint. Overrides settings.
    #[arg(long)]
    name: Option<String>,

    /// Settings file (defaults to ~/.conduit/settings.json).
    #[arg(long)]
    settings: Option<PathBuf>,
}

fn load(path: Option<&PathBuf>) -> Result<ConduitSettings> {
    match path {
        Some(path) => conduit_settings::load_settings_from_path(path)
            .with_context(|| format!("Failed to load settings from {}", path.display())),
        None => conduit_settings::load_settings().with_context(|| {
            format!("Failed to load settings from {}", conduit_settings::settings_path().display())
        }),
    }
}

fn telemetry_config(settings: &ConduitSettings) -> TelemetryConfig {
    let log_level = settings.logging.level.parse::<Level>().unwrap_or_else(|_| {
        eprintln!("unknown log level {:?}, using info", settings.logging.level);
        Level::INFO
    });
    let format = settings.logging.format.parse::<LogFormat>().unwrap_or_else(|e| {
        eprintln!("{e}, using json");
        LogFormat::Json
    });
    TelemetryConfig {
        log_level,
        format,
        ..Default::default()
    }
}

/// A delegation tool per configured worker, routed by keyword.
fn orchestrator_engine(settings: &ConduitSettings) -> Result<(Arc<dyn ReasoningEngine>, ToolRegistry)> {
    let config = DelegationConfig {
        timeout: settings.delegation.timeout_secs.map(Duration::from_secs),
        connect_timeout: Duration::from_secs(settings.delegation.connect_timeout_secs),
    };

    let mut tools = ToolRegistry::new();
    let mut routes = Vec::with_capacity(settings.workers.len());
    for worker in &settings.workers {
        let endpoint = settings.endpoint_for(worker);
        let client = DelegationClient::new(&worker.name, &endpoint, &config)
            .with_context(|| format!("Failed to build client for {}", worker.name))?;
        let tool = DelegateTool::new(client, &worker.description);
        let keywords: Vec<&str> = worker.keywords.iter().map(String::as_str).collect();
        routes.push(Route::new(tool.name(), &keywords));
        tracing::info!(worker = %worker.name, endpoint = %endpoint, "registered worker");
        tools.register(Arc::new(tool));
    }

    let mut router = KeywordRouter::new(routes);
    if let Some(fallback) = &settings.agent.fallback_worker {
        router = router.with_fallback(format!("delegate_to_{fallback}"));
    }
    let engine: Arc<dyn ReasoningEngine> = Arc::new(router);
    Ok((engine, tools))
}

/// Without a model attached a worker narrates once and echoes its prompt.
fn worker_engine() -> (Arc<dyn ReasoningEngine>, ToolRegistry) {
    let mut tools = ToolRegistry::new();
    tools.register(Arc::new(ReportProgressTool));
    let engine: Arc<dyn ReasoningEngine> = Arc::new(ScriptedEngine::new(vec![
        ScriptStep::call("report_progress", serde_json::json!({"message": "Working on your request"})),
        ScriptStep::EchoPrompt,
    ]));
    (engine, tools)
}

async fn serve(args: ServeArgs) -> Result<()> {
    let mut settings = load(args.settings.as_ref())?;
    if let Some(port) = args.port {
        settings.server.port = port;
    }
    if let Some(role) = args.role {
        settings.agent.role = role;
    }
    if let Some(name) = args.name {
        settings.agent.name = name;
    }

    let _telemetry = init_telemetry(telemetry_config(&settings));
    tracing::info!(agent = %settings.agent.name, role = ?settings.agent.role, "starting conduit");

    let (engine, tools) = match settings.agent.role {
        AgentRole::Orchestrator => orchestrator_engine(&settings)?,
        AgentRole::Worker => {
            tracing::warn!("no reasoning model attached, worker will echo its prompt");
            worker_engine()
        }
    };

    let state = AppState::new(ServerConfig::from_settings(&settings), engine, tools);
    let handle = conduit_server::start(state)
        .await
        .context("Failed to start server")?;
    tracing::info!(port = handle.port, "conduit server ready");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl+c")?;
    tracing::info!("shutting down");
    handle.shutdown().await;
    Ok(())
}

fn print_workers(settings: &ConduitSettings) -> Result<()> {
    for worker in &settings.workers {
        println!("{:<26} {}", worker.name, settings.endpoint_for(worker));
    }
    let (_, tools) = orchestrator_engine(settings)?;
    println!();
    for def in tools.definitions() {
        println!("{:<32} {}", def.name, def.description);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Serve(args) => serve(args).await,
        Command::Workers { settings } => print_workers(&load(settings.as_ref())?),
    }
}
