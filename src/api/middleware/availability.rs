//! Refuses traffic once shutdown has begun (410) or while the owner has
//! switched remote access off (403). `/health` is exempt.

use axum::http::Request;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

use crate::api::error::ApiError;
use crate::api::types::ApiContext;

pub async fn guard(req: Request<axum::body::Body>, next: Next) -> Response {
    match guard_inner(req, next).await {
        Ok(response) => response,
        Err(err) => err.into_response(),
    }
}

async fn guard_inner(req: Request<axum::body::Body>, next: Next) -> Result<Response, ApiError> {
    let ctx: ApiContext = req
        .extensions()
        .get::<ApiContext>()
        .cloned()
        .ok_or(ApiError::Internal("missing API context".into()))?;

    if req.uri().path() != "/health" {
        if ctx.core.is_shutting_down() {
            return Err(ApiError::Gone);
        }
        if !ctx.core.is_enabled() {
            return Err(ApiError::Disabled);
        }
    }

    Ok(next.run(req).await)
}
