//! API gateway (v1)
//!
//! # Architecture Overview
//!
//! ```text
//!     Client Request
//!     ──────────────▶ http server ──▶ router ──▶ request pipeline ──▶ backend
//!                     (request id,                (filters, validators,     │
//!                      timeout,                    rate limiter,            │
//!                      compression)                transformers,            │
//!                                                  enrichers)               ▼
//!     Client Response
//!     ◀────────────── http server ◀───────────── response pipeline ◀── response
//!
//!     Shared services: tracer, metrics collector, adaptive rate limiter
//!     Side listener:   admin API (health, stats, metrics, rate limits, routes)
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;

use api_gateway::admin::{setup_admin_router, AdminState};
use api_gateway::config::watcher::ConfigWatcher;
use api_gateway::config::{load_config, GatewayConfig};
use api_gateway::lifecycle::signals::shutdown_signal;
use api_gateway::observability::logging::init_logging;
use api_gateway::{Gateway, HttpServer, Shutdown};

#[derive(Parser)]
#[command(name = "api-gateway", version, about = "API gateway with request/response pipelines")]
struct Args {
    /// Path to the TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => load_config(path)?,
        None => GatewayConfig::default(),
    };
    init_logging(&config.observability)?;

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "api-gateway starting");
    tracing::info!(
        bind_address = %config.listener.bind_address,
        routes = config.routes.len(),
        rate_limit = config.rate_limit.enabled,
        tracing = config.tracing.enabled,
        request_timeout_secs = config.timeouts.request_secs,
        "Configuration loaded"
    );

    let gateway = Arc::new(Gateway::builder(config.clone()).build()?);
    let tasks = gateway.start_background_tasks();
    let shutdown = Shutdown::new();

    // Hot reload of the route table
    let _watcher = match &args.config {
        Some(path) => {
            let (watcher, mut updates) = ConfigWatcher::new(path);
            let watcher = watcher.run()?;
            let gateway = gateway.clone();
            tokio::spawn(async move {
                while let Some(new_config) = updates.recv().await {
                    gateway.reload_routes(new_config.routes);
                }
            });
            Some(watcher)
        }
        None => None,
    };

    if config.admin.enabled {
        let listener = TcpListener::bind(&config.admin.bind_address).await?;
        tracing::info!(address = %listener.local_addr()?, "Admin API listening");
        let app = setup_admin_router(AdminState::new(gateway.clone()));
        let stop = shutdown.clone();
        tokio::spawn(async move {
            let served = axum::serve(listener, app)
                .with_graceful_shutdown(async move { stop.wait().await })
                .await;
            if let Err(e) = served {
                tracing::error!(error = %e, "Admin API stopped with error");
            }
        });
    }

    let signal = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        signal.trigger();
    });

    let listener = TcpListener::bind(&config.listener.bind_address).await?;
    tracing::info!(address = %listener.local_addr()?, "Listening for connections");
    HttpServer::new(gateway.clone()).run(listener, shutdown).await?;

    gateway.shutdown(tasks).await;
    tracing::info!("Shutdown complete");
    Ok(())
}
