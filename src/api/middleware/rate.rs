//! Pairing rate limiting middleware.
//!
//! LAN callers are limited per remote address, and per `c-id` as well,
//! so rotating the client id does not buy more attempts. Loopback callers
//! are limited by `c-id` alone; without one they map to a blank key,
//! which the limiter never refuses.

use axum::http::Request;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

use crate::api::error::ApiError;
use crate::api::types::{header_str, remote_ip, ApiContext, HEADER_CLIENT_ID};
use crate::rate_limit::now_ms;

/// Rate-limit keys for the request, address first. Every key must
/// have budget left.
fn rate_keys(req: &Request<axum::body::Body>) -> Vec<String> {
    let mut keys = Vec::with_capacity(2);
    match remote_ip(req.extensions()) {
        Some(ip) if !ip.is_loopback() => keys.push(format!("ip:{ip}")),
        _ => {}
    }
    if let Some(client_id) = header_str(req.headers(), HEADER_CLIENT_ID) {
        keys.push(format!("client:{client_id}"));
    }
    if keys.is_empty() {
        keys.push(String::new());
    }
    keys
}

/// Returns 429 once the caller has used up its attempts for the window.
pub async fn limit(req: Request<axum::body::Body>, next: Next) -> Response {
    match limit_inner(req, next).await {
        Ok(response) => response,
        Err(err) => err.into_response(),
    }
}

async fn limit_inner(req: Request<axum::body::Body>, next: Next) -> Result<Response, ApiError> {
    let ctx: ApiContext = req
        .extensions()
        .get::<ApiContext>()
        .cloned()
        .ok_or(ApiError::Internal("missing API context".into()))?;

    let now = now_ms();
    for key in rate_keys(&req) {
        if !ctx.rate_limiter.try_acquire(&key, now) {
            tracing::warn!(key = %key, "Pairing rate limit tripped");
            return Err(ApiError::RateLimited {
                retry_after: ctx.core.config.rate_limit_window_secs,
            });
        }
    }

    Ok(next.run(req).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::ConnectInfo;
    use std::net::SocketAddr;

    fn request_from(addr: &str, client_id: Option<&str>) -> Request<axum::body::Body> {
        let mut builder = Request::builder().uri("/api/pair");
        if let Some(id) = client_id {
            builder = builder.header(HEADER_CLIENT_ID, id);
        }
        let mut req = builder.body(axum::body::Body::empty()).unwrap();
        let addr: SocketAddr = addr.parse().unwrap();
        req.extensions_mut().insert(ConnectInfo(addr));
        req
    }

    #[test]
    fn lan_caller_is_keyed_by_address_and_client() {
        assert_eq!(
            rate_keys(&request_from("192.168.1.9:5000", Some("c1"))),
            vec!["ip:192.168.1.9".to_string(), "client:c1".to_string()]
        );
    }

    #[test]
    fn lan_address_is_used_without_client_id() {
        assert_eq!(rate_keys(&request_from("192.168.1.9:5000", None)), vec!["ip:192.168.1.9"]);
    }

    #[test]
    fn loopback_is_keyed_by_client_only() {
        assert_eq!(rate_keys(&request_from("127.0.0.1:5000", Some("c1"))), vec!["client:c1"]);
    }

    #[test]
    fn anonymous_loopback_is_unlimited() {
        assert_eq!(rate_keys(&request_from("127.0.0.1:5000", None)), vec![String::new()]);
    }
}
