//! HTTP transport
//!
//! Thin axum shell over [`FolderService`]: `GET /` allocates, `POST /`
//! completes. TLS is expected to be terminated in front of this server.

pub mod handlers;
pub mod middleware;
pub mod routes;

use axum::{extract::DefaultBodyLimit, extract::Extension, Router};
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::{compression::CompressionLayer, cors::CorsLayer, trace::TraceLayer};
use tracing::{error, info};

use crate::allocation::FolderService;

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// HTTP server bind address
    pub http_addr: String,
    /// HTTP port
    pub http_port: u16,
    /// Allow cross-origin requests from any origin
    pub enable_cors: bool,
    /// Maximum request body size (bytes)
    pub max_body_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: "127.0.0.1".to_string(),
            http_port: 8000,
            enable_cors: true,
            max_body_size: 1024 * 1024, // 1MB
        }
    }
}

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<FolderService>,
    pub config: ServerConfig,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("config", &self.config)
            .finish()
    }
}

/// Router with all routes and layers
pub fn build_router(state: AppState) -> Router {
    let config = state.config.clone();

    let app = Router::new()
        .merge(routes::api_routes())
        .merge(routes::health_routes())
        .layer(axum::middleware::from_fn(middleware::log_request))
        .layer(DefaultBodyLimit::max(config.max_body_size))
        .layer(Extension(Arc::new(state)))
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new());

    if config.enable_cors {
        app.layer(CorsLayer::permissive())
    } else {
        app
    }
}

/// Start the HTTP server
pub async fn start_server(config: ServerConfig, service: Arc<FolderService>) -> anyhow::Result<()> {
    info!(
        addr = %config.http_addr,
        port = config.http_port,
        cors = config.enable_cors,
        "Starting slotkeeper HTTP server"
    );

    crate::metrics::init_metrics();

    let state = AppState {
        service,
        config: config.clone(),
    };
    let app = build_router(state);

    // Bind and serve
    let addr = format!("{}:{}", config.http_addr, config.http_port);
    let listener = TcpListener::bind(&addr).await?;

    info!("Server listening on http://{}", addr);
    info!("Status: http://{}/status", addr);
    info!("Metrics: http://{}/metrics", addr);

    axum::serve(listener, app).await.map_err(|e| {
        error!(error = %e, "Server error");
        anyhow::anyhow!("Server failed: {}", e)
    })
}
