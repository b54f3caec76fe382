//! API server: the REST router plus the Prometheus exporter.

use crate::rest::{self, AppState};
use axum::routing::{get, post, put};
use axum::Router;
use outreach_core::config::AppConfig;
use outreach_flow::ConversationEngine;
use std::net::SocketAddr;
use std::time::Instant;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

/// Builds the REST router over `state`.
pub fn router(state: AppState) -> Router {
    Router::new()
        // Graph editing helpers
        .route("/v1/graphs/normalize", post(rest::normalize))
        .route("/v1/graphs/default", get(rest::default_template))
        .route("/v1/graphs/resolve", post(rest::resolve))
        // Maps
        .route("/v1/experiments/:experiment_id/map", get(rest::open_map))
        .route(
            "/v1/experiments/:experiment_id/map/draft",
            put(rest::save_draft),
        )
        .route(
            "/v1/experiments/:experiment_id/map/publish",
            post(rest::publish),
        )
        .route(
            "/v1/experiments/:experiment_id/map/archive",
            post(rest::archive_map),
        )
        // Sessions
        .route("/v1/runs/:run_id/sessions", post(rest::start_session))
        .route("/v1/runs/:run_id/events", get(rest::run_events))
        .route("/v1/sessions/:session_id", get(rest::get_session))
        .route("/v1/sessions/:session_id/events", post(rest::session_event))
        .route("/v1/sessions/:session_id/approve", post(rest::approve))
        .route("/v1/sessions/:session_id/cancel", post(rest::cancel))
        // Operational endpoints
        .route("/health", get(rest::health_check))
        // Middleware
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// HTTP front for a [`ConversationEngine`].
pub struct ApiServer {
    config: AppConfig,
    engine: ConversationEngine,
}

impl ApiServer {
    pub fn new(config: AppConfig, engine: ConversationEngine) -> Self {
        Self { config, engine }
    }

    /// Start the HTTP REST server.
    pub async fn start_http(&self) -> anyhow::Result<()> {
        let app = router(AppState {
            engine: self.engine.clone(),
            node_id: self.config.node_id.clone(),
            start_time: Instant::now(),
        });

        let addr = SocketAddr::new(self.config.api.host.parse()?, self.config.api.http_port);

        info!(addr = %addr, "Starting HTTP server");

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, app).await?;

        Ok(())
    }

    /// Start the metrics server on a separate port.
    pub async fn start_metrics(&self) -> anyhow::Result<()> {
        if !self.config.metrics.enabled {
            info!("Metrics exporter disabled");
            return Ok(());
        }
        metrics_exporter_prometheus::PrometheusBuilder::new()
            .with_http_listener(SocketAddr::new(
                self.config.api.host.parse()?,
                self.config.metrics.port,
            ))
            .install()?;

        info!(port = self.config.metrics.port, "Metrics exporter started");
        Ok(())
    }
}
