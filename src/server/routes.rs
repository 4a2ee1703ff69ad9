//! HTTP routes definition

use axum::{routing::get, Router};

use super::handlers;

/// Allocation API
///
/// - GET  /?groupId=<n>  - allocate a folder, returns `{folderId, processId}`
/// - POST /              - complete `{folderId, processId, groupId}`
/// - GET  /status        - per-group usage summary
pub fn api_routes() -> Router {
    Router::new()
        .route("/", get(handlers::allocate).post(handlers::complete))
        .route("/status", get(handlers::status))
}

/// Health and metrics routes
pub fn health_routes() -> Router {
    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/metrics", get(handlers::metrics))
}
