//! HTTP middleware

use axum::{body::Body, http::Request, middleware::Next, response::Response};
use std::time::Instant;
use tracing::{debug, info_span, Instrument};

/// Request logging middleware
pub async fn log_request(req: Request<Body>, next: Next) -> Response {
    let span = info_span!("request", method = %req.method(), uri = %req.uri().path());

    async move {
        let started = Instant::now();
        debug!("Incoming request");

        let response = next.run(req).await;

        debug!(
            status = response.status().as_u16(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Request completed"
        );
        response
    }
    .instrument(span)
    .await
}
