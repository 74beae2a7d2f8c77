//! HTTP surface of the gateway.
//!
//! `POST /api/invoke` carries every encrypted operation call; `/api/pair`
//! bootstraps a session under the root key. The router is composable:
//! `gateway_router()` returns a `Router` that the server module binds to
//! TLS and plain HTTP listeners.

pub mod endpoints;
pub mod error;
pub mod gateway;
pub mod middleware;
pub mod router;
pub mod server;
pub mod types;

pub use router::{build_router, gateway_router};
pub use server::{start_gateway, start_gateway_on, GatewayOptions, GatewayServer, GatewaySession, ServerError};
pub use types::ApiContext;
