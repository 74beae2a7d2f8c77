//! Shared types for the gateway HTTP layer.

use std::sync::Arc;

use crate::cipher::SymmetricKey;
use crate::core_state::CoreState;
use crate::operations::{CallContext, OperationRegistry};
use crate::rate_limit::RateLimiter;

/// Client id header. Also the peer id for peer calls.
pub const HEADER_CLIENT_ID: &str = "c-id";
/// Caller type header; `peer` marks a peer-to-peer call.
pub const HEADER_CLIENT_TYPE: &str = "c-type";
/// Chat group id header for group-scoped peer calls.
pub const HEADER_GROUP_ID: &str = "c-gid";

pub const CLIENT_TYPE_PEER: &str = "peer";

/// Maximum accepted request body.
pub const MAX_BODY_BYTES: usize = 4 * 1024 * 1024;

// ═══════════════════════════════════════════════════════════
// API context
// ═══════════════════════════════════════════════════════════

/// Shared context for all API routes and middleware.
/// Wraps `CoreState` plus the pairing limiter and the operation table.
#[derive(Clone)]
pub struct ApiContext {
    pub core: Arc<CoreState>,
    pub rate_limiter: Arc<RateLimiter>,
    pub operations: Arc<OperationRegistry>,
}

impl ApiContext {
    pub fn new(core: Arc<CoreState>, operations: OperationRegistry) -> Self {
        let rate_limiter = RateLimiter::new(
            core.config.rate_limit_window(),
            core.config.rate_limit_max_attempts,
        );
        Self {
            core,
            rate_limiter: Arc::new(rate_limiter),
            operations: Arc::new(operations),
        }
    }
}

/// Caller identity and the key its traffic is encrypted with.
#[derive(Debug, Clone)]
pub struct ResolvedCaller {
    pub key: SymmetricKey,
    pub context: CallContext,
    /// Peer and group calls carry a signed `timestamp|signature|` prefix.
    pub signed: bool,
}

/// Remote address recorded by the server's connect-info layer.
/// Absent for in-process router calls.
pub fn remote_ip(extensions: &axum::http::Extensions) -> Option<std::net::IpAddr> {
    extensions
        .get::<axum::extract::ConnectInfo<std::net::SocketAddr>>()
        .map(|info| info.0.ip())
}

/// Non-empty header value as `&str`.
pub fn header_str<'a>(headers: &'a axum::http::HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}
