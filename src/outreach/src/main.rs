//! Outreach flow server: conversation maps, per-lead sessions, and the timer
//! sweep that moves idle sessions along their timer edges.
//!
//! Main entry point that wires the store, the engine, and the HTTP API.

use chrono::Utc;
use clap::Parser;
use outreach_api::ApiServer;
use outreach_core::config::{AppConfig, StoreBackend};
use outreach_core::event_bus::TracingSink;
use outreach_flow::ConversationEngine;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "outreach")]
#[command(about = "Outreach conversation flow engine")]
#[command(version)]
struct Cli {
    /// Path to a TOML config file
    #[arg(long, short, env = "OUTREACH_CONFIG")]
    config: Option<String>,

    /// Node identifier (overrides config)
    #[arg(long, env = "OUTREACH__NODE_ID")]
    node_id: Option<String>,

    /// HTTP port (overrides config)
    #[arg(long, env = "OUTREACH__API__HTTP_PORT")]
    http_port: Option<u16>,

    /// Store backend: memory, file, or redis (overrides config)
    #[arg(long, value_parser = parse_backend)]
    store: Option<StoreBackend>,

    /// Disable the periodic timer sweep
    #[arg(long, default_value_t = false)]
    no_sweep: bool,
}

fn parse_backend(raw: &str) -> Result<StoreBackend, String> {
    match raw {
        "memory" => Ok(StoreBackend::Memory),
        "file" => Ok(StoreBackend::File),
        "redis" => Ok(StoreBackend::Redis),
        other => Err(format!("unknown store backend {other:?}")),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "outreach=info,outreach_flow=info,tower_http=info".into()),
        )
        .json()
        .init();

    let cli = Cli::parse();

    info!("Outreach flow server starting up");

    // Load configuration
    let mut config = AppConfig::load_from(cli.config.as_deref()).unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        AppConfig::default()
    });

    // Apply CLI overrides
    if let Some(node_id) = cli.node_id {
        config.node_id = node_id;
    }
    if let Some(port) = cli.http_port {
        config.api.http_port = port;
    }
    if let Some(backend) = cli.store {
        config.store.backend = backend;
    }

    info!(
        node_id = %config.node_id,
        http_port = config.api.http_port,
        store = ?config.store.backend,
        unsubscribe_policy = ?config.engine.unsubscribe_policy,
        "Configuration loaded"
    );

    let store = outreach_store::open_store(&config).await?;
    let engine = ConversationEngine::new(store, config.engine.clone())
        .with_event_sink(Arc::new(TracingSink));

    let api_server = ApiServer::new(config.clone(), engine.clone());

    // Start metrics exporter
    if let Err(e) = api_server.start_metrics().await {
        error!(error = %e, "Failed to start metrics exporter");
    }

    // Spawn the timer sweep
    if cli.no_sweep {
        info!("Timer sweep disabled");
    } else {
        let sweeper = engine.clone();
        let period = Duration::from_secs(config.engine.timer_sweep_interval_secs.max(1));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                if let Err(e) = sweeper.sweep_timers(Utc::now()).await {
                    error!(error = %e, "Timer sweep failed");
                }
            }
        });
    }

    info!("Outreach flow server is ready to serve traffic");

    // Start HTTP server (blocks until shutdown)
    api_server.start_http().await?;

    Ok(())
}
