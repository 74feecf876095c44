use axum::{extract::Request, middleware::Next, response::Response};
use std::time::Instant;

/// Log target routed to the daily request log file
pub const TARGET: &str = "request_log";

/// One line per request: method, path, status and latency
pub async fn request_log(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let started = Instant::now();

    let response = next.run(request).await;

    let status = response.status().as_u16();
    let latency_ms = started.elapsed().as_millis() as u64;
    if response.status().is_server_error() {
        tracing::error!(target: TARGET, %method, path = %path, status, latency_ms, "request failed");
    } else if response.status().is_client_error() {
        tracing::warn!(target: TARGET, %method, path = %path, status, latency_ms, "request rejected");
    } else {
        tracing::info!(target: TARGET, %method, path = %path, status, latency_ms, "request completed");
    }

    response
}
