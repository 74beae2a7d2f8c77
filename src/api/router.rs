//! Gateway router.
//!
//! Returns a composable `Router` that can be served over TLS, plain HTTP
//! or driven in-process with `oneshot`.
//!
//! Middleware stack (outermost → innermost):
//! 1. Extension(ApiContext) → 2. Availability → 3. Audit logger
//! → 4. Pairing rate limiter (`/api/pair` only)

use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::http::{header, HeaderValue};
use axum::routing::{get, post};
use axum::Router;
use tower_http::set_header::SetResponseHeaderLayer;

use crate::api::endpoints;
use crate::api::gateway;
use crate::api::middleware;
use crate::api::types::{ApiContext, MAX_BODY_BYTES};
use crate::core_state::CoreState;
use crate::operations::OperationRegistry;

/// Build the gateway router over `core`, dispatching to `operations`.
pub fn gateway_router(core: Arc<CoreState>, operations: OperationRegistry) -> Router {
    build_router(ApiContext::new(core, operations))
}

/// Build the router from a pre-constructed `ApiContext`.
///
/// Middleware reads `Extension<ApiContext>` (outermost layer); handlers
/// take `State<ApiContext>`.
pub fn build_router(ctx: ApiContext) -> Router {
    let pairing = Router::new()
        .route("/api/pair", post(endpoints::pair::pair))
        .with_state(ctx.clone())
        .layer(axum::middleware::from_fn(middleware::rate::limit));

    Router::new()
        .route("/api/invoke", post(gateway::invoke))
        .route("/api/probe", get(endpoints::health::probe))
        .route("/health", get(endpoints::health::check))
        .with_state(ctx.clone())
        .merge(pairing)
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(SetResponseHeaderLayer::overriding(
            header::CACHE_CONTROL,
            HeaderValue::from_static("no-store"),
        ))
        .layer(axum::middleware::from_fn(middleware::audit::log_access))
        .layer(axum::middleware::from_fn(middleware::availability::guard))
        .layer(axum::Extension(ctx))
}
