//! Run Engine Server
//!
//! Entry point for the background run execution service.

use mimalloc::MiMalloc;

/// Global allocator for improved performance (M-MIMALLOC-APPS).
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

use std::sync::Arc;

use run_engine::{config::AppConfig, server, telemetry};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env (if present) before clap reads env fallbacks
    let _ = dotenvy::dotenv();

    let config = AppConfig::load()?;
    telemetry::init(&config.telemetry)?;

    server::start_server(Arc::new(config)).await
}
