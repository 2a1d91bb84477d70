use std::sync::Arc;
use std::time::Duration;

use axum::http::HeaderName;
use axum::routing::{get, post};
use axum::Router;
use conduit_core::cancel::CancellationRegistry;
use conduit_core::wire::{GENERATE_PATH, HEALTH_PATH, SESSION_HEADER};
use conduit_engine::{ReasoningEngine, SessionStore, ToolRegistry};
use conduit_settings::{AgentRole, ConduitSettings};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::handlers;

/// Server configuration.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub agent_name: String,
    pub role: AgentRole,
    pub heartbeat_interval: Duration,
    pub body_buffer: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 8000,
            agent_name: "root_agent".into(),
            role: AgentRole::Orchestrator,
            heartbeat_interval: Duration::from_secs(1),
            body_buffer: 32,
        }
    }
}

impl ServerConfig {
    pub fn from_settings(settings: &ConduitSettings) -> Self {
        Self {
            host: settings.server.host.clone(),
            port: settings.server.port,
            agent_name: settings.agent.name.clone(),
            role: settings.agent.role,
            heartbeat_interval: Duration::from_millis(settings.server.heartbeat_interval_ms.max(1)),
            body_buffer: settings.server.body_buffer.max(1),
        }
    }
}

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServerConfig>,
    pub engine: Arc<dyn ReasoningEngine>,
    pub tools: Arc<ToolRegistry>,
    pub registry: Arc<CancellationRegistry>,
    pub sessions: Arc<SessionStore>,
}

impl AppState {
    pub fn new(config: ServerConfig, engine: Arc<dyn ReasoningEngine>, tools: ToolRegistry) -> Self {
        Self {
            config: Arc::new(config),
            engine,
            tools: Arc::new(tools),
            registry: Arc::new(CancellationRegistry::new()),
            sessions: Arc::new(SessionStore::default()),
        }
    }
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::permissive().expose_headers([HeaderName::from_static(SESSION_HEADER)]);
    Router::new()
        .route(GENERATE_PATH, post(handlers::generate))
        .route(HEALTH_PATH, get(handlers::health))
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

/// Bind and start serving. Port 0 picks a free port.
pub async fn start(state: AppState) -> Result<ServerHandle, std::io::Error> {
    let addr = format!("{}:{}", state.config.host, state.config.port);
    let agent = state.config.agent_name.clone();
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let local_addr = listener.local_addr()?;

    tracing::info!(port = local_addr.port(), agent = %agent, engine = state.engine.name(), tools = state.tools.count(), "conduit server started");

    let sweeper = start_registry_sweeper(Arc::clone(&state.registry), REGISTRY_SWEEP_INTERVAL, REGISTRY_MAX_AGE);
    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    let router = build_router(state);
    let server = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router)
            .with_graceful_shutdown(async move { signal.cancelled().await })
            .await
        {
            tracing::error!(error = %e, "server error");
        }
    });

    Ok(ServerHandle {
        port: local_addr.port(),
        shutdown,
        server,
        sweeper,
    })
}

const REGISTRY_SWEEP_INTERVAL: Duration = Duration::from_secs(60);
const REGISTRY_MAX_AGE: Duration = Duration::from_secs(600);

/// Periodically drop cancellation entries whose request never tore down.
fn start_registry_sweeper(registry: Arc<CancellationRegistry>, every: Duration, max_age: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let evicted = registry.evict_older_than(max_age);
            if evicted > 0 {
                tracing::info!(evicted, "evicted stale cancellation entries");
            }
        }
    })
}

/// Handle returned by `start()`.
pub struct ServerHandle {
    pub port: u16,
    shutdown: CancellationToken,
    server: JoinHandle<()>,
    sweeper: JoinHandle<()>,
}

impl ServerHandle {
    pub fn url(&self) -> String {
        format!("http://127.0.0.1:{}", self.port)
    }

    /// Stop accepting connections and wait for in-flight responses.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        self.sweeper.abort();
        if let Err(e) = self.server.await {
            tracing::error!(error = %e, "server task failed");
        }
    }
}
