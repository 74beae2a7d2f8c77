//! Liveness and availability probes.

use axum::extract::State;
use axum::Json;
use serde::Serialize;

use crate::api::types::ApiContext;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

/// `GET /api/probe`: 200 while serving. The availability guard answers
/// 410 once shutdown began and 403 while disabled.
pub async fn probe() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: crate::config::APP_VERSION,
    })
}

/// `GET /health`: plaintext liveness, exempt from availability checks.
pub async fn check(State(ctx): State<ApiContext>) -> Json<HealthResponse> {
    let status = if ctx.core.is_shutting_down() {
        "stopping"
    } else if ctx.core.is_enabled() {
        "ok"
    } else {
        "disabled"
    };
    Json(HealthResponse {
        status,
        version: crate::config::APP_VERSION,
    })
}
