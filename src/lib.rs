pub mod activity; // Session last-seen tracking + flush task
pub mod api; // HTTP gateway: invoke, pair, probe
pub mod cipher;
pub mod config;
pub mod core_state; // Composition root shared by every surface
pub mod credentials; // Root token, TLS keystore, QR payload
pub mod db;
pub mod models;
pub mod operations; // Domain operation registry
pub mod pairing; // Client pairing protocol
pub mod peer_trust; // Peer/group key caches
pub mod peer_verify; // Peer message timestamp + HMAC check
pub mod rate_limit;
pub mod session_store;
pub mod watcher; // Discovery re-registration on network change

use tracing_subscriber::EnvFilter;

/// Initialise the global tracing subscriber from `RUST_LOG`, falling back
/// to `config::default_log_filter()`. Calling it twice is harmless.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config::default_log_filter())),
        )
        .try_init();
}
