//! Access logging middleware.
//!
//! Logs every API request with caller id, method, path, status and
//! latency. Header values other than the caller id are never logged.

use std::time::Instant;

use axum::http::Request;
use axum::middleware::Next;
use axum::response::Response;

use crate::api::types::{header_str, HEADER_CLIENT_ID, HEADER_CLIENT_TYPE};

pub async fn log_access(req: Request<axum::body::Body>, next: Next) -> Response {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let client_id = header_str(req.headers(), HEADER_CLIENT_ID)
        .unwrap_or("-")
        .to_string();
    let client_type = header_str(req.headers(), HEADER_CLIENT_TYPE)
        .unwrap_or("client")
        .to_string();
    let started = Instant::now();

    let response = next.run(req).await;

    let status = response.status().as_u16();
    let elapsed_ms = started.elapsed().as_millis() as u64;
    if response.status().is_server_error() {
        tracing::warn!(%method, path = %path, client_id = %client_id, client_type = %client_type, status, elapsed_ms, "API request failed");
    } else {
        tracing::info!(%method, path = %path, client_id = %client_id, client_type = %client_type, status, elapsed_ms, "API request");
    }

    response
}
