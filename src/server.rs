use axum::Router;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use url::Url;

use crate::AppState;
use crate::api;
use crate::config::{AppConfig, PersistenceProvider};
use crate::domain::Assistant;
use crate::graph::{EchoGraph, GraphRegistry};
use crate::runtime::Engine;
use crate::store::providers::{self, PostgresCheckpointStore, PostgresRunStore};
use crate::store::{CheckpointStore, MemoryCheckpointStore, MemoryRunStore, RunStore};
use crate::webhook::WebhookDispatcher;

/// Graphs served out of the box, each exposed through a system assistant.
pub fn default_graphs() -> Arc<GraphRegistry> {
    let graphs = GraphRegistry::new();
    graphs.register("echo", Arc::new(EchoGraph));
    Arc::new(graphs)
}

pub fn build_app(state: AppState) -> Router {
    api::build_router()
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

type Stores = (Arc<dyn RunStore>, Arc<dyn CheckpointStore>);

/// Run records and checkpoints always live in the same provider.
async fn stores(config: &AppConfig) -> anyhow::Result<Stores> {
    match config.persistence.provider {
        PersistenceProvider::Memory => Ok((
            Arc::new(MemoryRunStore::new()),
            Arc::new(MemoryCheckpointStore::new()),
        )),
        PersistenceProvider::Postgres => {
            let url = config.persistence.database_url.as_deref().ok_or_else(|| {
                anyhow::anyhow!("persistence.database_url is required for the postgres provider")
            })?;
            let pool = providers::connect(url, config.persistence.max_connections).await?;
            info!(name: "persistence.connected", "Connected to Postgres");
            Ok((
                Arc::new(PostgresRunStore::new(pool.clone())),
                Arc::new(PostgresCheckpointStore::new(pool)),
            ))
        }
    }
}

fn webhooks(config: &AppConfig) -> anyhow::Result<WebhookDispatcher> {
    let loopback = match &config.webhook.loopback_base_url {
        Some(base) => base.clone(),
        None => format!("http://127.0.0.1:{}", config.server.port),
    };
    let loopback = Url::parse(&loopback)?;
    Ok(WebhookDispatcher::new(
        Some(loopback),
        Duration::from_secs(config.webhook.timeout_secs),
    )?)
}

/// Wires the engine from configuration and registers the built-in graphs.
pub async fn build_engine(config: &AppConfig) -> anyhow::Result<Engine> {
    let graphs = default_graphs();
    let (runs, checkpoints) = stores(config).await?;
    let engine = Engine::new(
        config.engine_settings(),
        runs,
        checkpoints,
        Arc::clone(&graphs),
    )
    .with_webhooks(webhooks(config)?);

    for graph_id in ["echo"] {
        let assistant = engine
            .register_assistant(Assistant::system(graph_id))
            .await?;
        info!(
            name: "assistant.registered",
            graph_id,
            assistant_id = %assistant.assistant_id,
            "Registered system assistant"
        );
    }
    Ok(engine)
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

/// Start the Axum server with the provided configuration.
pub async fn start_server(config: Arc<AppConfig>) -> anyhow::Result<()> {
    info!(
        name: "engine.config.loaded",
        workers = config.engine.workers,
        max_attempts = config.engine.max_attempts,
        provider = ?config.persistence.provider,
        "Engine configuration loaded"
    );

    let engine = build_engine(&config).await?;
    let queue = engine.start();

    let state = AppState {
        engine,
        config: Arc::clone(&config),
    };
    let app = build_app(state);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    info!(
        name: "server.started",
        address = %addr,
        "Server started"
    );

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    queue.shutdown().await;
    info!(name: "server.stopped", "Server stopped");
    Ok(())
}
