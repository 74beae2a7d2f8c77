//! Gateway server lifecycle: starts and stops the HTTPS (and optional
//! plain HTTP) listeners serving the gateway router.
//!
//! Load key caches → bind → spawn background tasks → return a handle
//! that owns every shutdown channel. `stop()` reverses it in order: refuse new traffic,
//! cancel pairing prompts, stop the activity flush and the watcher,
//! withdraw the discovery record, clear caches, then drain the listeners.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use axum_server::tls_rustls::RustlsConfig;
use rustls_pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::activity::FlushTask;
use crate::api::router::build_router;
use crate::api::types::ApiContext;
use crate::core_state::{CoreError, CoreState};
use crate::credentials::TlsMaterial;
use crate::operations::OperationRegistry;
use crate::watcher::{
    self, AdvertisedService, LoggingRegistrar, ServiceInfoSource, ServiceRegistrar, WatcherHandle,
    WatcherTiming,
};

/// Time in-flight requests get to finish once the listeners stop.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

// ═══════════════════════════════════════════════════════════
// Public types
// ═══════════════════════════════════════════════════════════

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("Cannot detect local IP: {0}")]
    LocalIp(String),
    #[error("{0} is not on a local network")]
    NotLocalNetwork(IpAddr),
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },
    #[error("TLS configuration rejected: {0}")]
    Tls(String),
    #[error("Cannot load key caches: {0}")]
    Caches(#[source] CoreError),
}

/// Metadata for a running gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewaySession {
    pub session_id: String,
    pub https_addr: SocketAddr,
    pub http_addr: Option<SocketAddr>,
    /// SHA-256 fingerprint of the served certificate.
    pub fingerprint: String,
    pub started_at: String,
}

/// Current LAN address, `None` when offline.
pub type AddressProbe = Arc<dyn Fn() -> Option<IpAddr> + Send + Sync>;

/// Pluggable collaborators for a gateway run.
pub struct GatewayOptions {
    pub registrar: Arc<dyn ServiceRegistrar>,
    pub watcher_timing: WatcherTiming,
    /// Poll the LAN address for changes; `None` when the host feeds
    /// network events itself.
    pub address_poll: Option<Duration>,
    /// Source of the advertised hostname.
    pub address_probe: AddressProbe,
}

impl Default for GatewayOptions {
    fn default() -> Self {
        Self {
            registrar: Arc::new(LoggingRegistrar),
            watcher_timing: WatcherTiming::default(),
            address_poll: Some(Duration::from_secs(5)),
            address_probe: Arc::new(watcher::local_ip_probe),
        }
    }
}

/// Handle to a running gateway.
pub struct GatewayServer {
    pub session: GatewaySession,
    core: Arc<CoreState>,
    tls_handle: axum_server::Handle,
    http_shutdown: Option<oneshot::Sender<()>>,
    listeners: Vec<JoinHandle<()>>,
    flush: Option<FlushTask>,
    watcher: WatcherHandle,
    address_monitor: Option<JoinHandle<()>>,
    registrar: Arc<dyn ServiceRegistrar>,
}

// ═══════════════════════════════════════════════════════════
// Address helpers
// ═══════════════════════════════════════════════════════════

/// Private IPv4 ranges only.
pub fn is_local_network(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_private(),
        IpAddr::V6(_) => false,
    }
}

/// The LAN address clients should be pointed at.
pub fn lan_address() -> Result<IpAddr, ServerError> {
    let ip = local_ip_address::local_ip().map_err(|e| ServerError::LocalIp(e.to_string()))?;
    if !is_local_network(&ip) {
        return Err(ServerError::NotLocalNetwork(ip));
    }
    Ok(ip)
}

fn rustls_config(tls: &TlsMaterial) -> Result<RustlsConfig, ServerError> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let cert = CertificateDer::from(tls.certificate_der.clone());
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(tls.private_key_der.to_vec()));

    let mut config = rustls::ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| ServerError::Tls(e.to_string()))?
        .with_no_client_auth()
        .with_single_cert(vec![cert], key)
        .map_err(|e| ServerError::Tls(e.to_string()))?;
    config.alpn_protocols = vec![b"http/1.1".to_vec()];

    Ok(RustlsConfig::from_config(Arc::new(config)))
}

// ═══════════════════════════════════════════════════════════
// Server lifecycle
// ═══════════════════════════════════════════════════════════

/// Start the gateway on the configured bind address and ports.
pub async fn start_gateway(
    core: Arc<CoreState>,
    operations: OperationRegistry,
    tls: &TlsMaterial,
    options: GatewayOptions,
) -> Result<GatewayServer, ServerError> {
    let ip = core.config.bind_ip;
    let https_port = core.config.https_port;
    let http_port = core.config.http_port;
    start_gateway_on(
        ApiContext::new(core, operations),
        ip,
        https_port,
        http_port,
        tls,
        options,
    )
    .await
}

/// Start the gateway on explicit address and ports. Port `0` binds an
/// ephemeral port; the session reports the actual addresses.
pub async fn start_gateway_on(
    ctx: ApiContext,
    ip: IpAddr,
    https_port: u16,
    http_port: Option<u16>,
    tls: &TlsMaterial,
    options: GatewayOptions,
) -> Result<GatewayServer, ServerError> {
    let core = ctx.core.clone();
    core.reset_shutdown();
    core.load_caches().map_err(ServerError::Caches)?;

    // 1. Bind listeners
    let https_addr = SocketAddr::new(ip, https_port);
    let https_listener =
        std::net::TcpListener::bind(https_addr).map_err(|source| ServerError::Bind {
            addr: https_addr,
            source,
        })?;
    https_listener
        .set_nonblocking(true)
        .map_err(|source| ServerError::Bind {
            addr: https_addr,
            source,
        })?;
    let https_addr = https_listener
        .local_addr()
        .map_err(|source| ServerError::Bind {
            addr: https_addr,
            source,
        })?;

    let http_listener = match http_port {
        Some(port) => {
            let addr = SocketAddr::new(ip, port);
            let listener = tokio::net::TcpListener::bind(addr)
                .await
                .map_err(|source| ServerError::Bind { addr, source })?;
            Some(listener)
        }
        None => None,
    };
    let http_addr = match &http_listener {
        Some(listener) => Some(listener.local_addr().map_err(|source| ServerError::Bind {
            addr: SocketAddr::new(ip, http_port.unwrap_or_default()),
            source,
        })?),
        None => None,
    };

    // 2. Build router + TLS config
    let app = build_router(ctx);
    let tls_config = rustls_config(tls)?;

    // 3. Spawn listeners
    let tls_handle = axum_server::Handle::new();
    let mut listeners = Vec::new();
    {
        let handle = tls_handle.clone();
        let app = app.clone();
        listeners.push(tokio::spawn(async move {
            tracing::info!(addr = %https_addr, "HTTPS gateway started");
            if let Err(e) = axum_server::from_tcp_rustls(https_listener, tls_config)
                .handle(handle)
                .serve(app.into_make_service_with_connect_info::<SocketAddr>())
                .await
            {
                tracing::error!(error = %e, "HTTPS gateway error");
            }
            tracing::info!("HTTPS gateway stopped");
        }));
    }

    let mut http_shutdown = None;
    if let Some(listener) = http_listener {
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        http_shutdown = Some(shutdown_tx);
        listeners.push(tokio::spawn(async move {
            let shutdown_signal = async move {
                let _ = shutdown_rx.await;
            };
            tracing::info!(addr = ?http_addr, "HTTP gateway started");
            if let Err(e) = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(shutdown_signal)
            .await
            {
                tracing::error!(error = %e, "HTTP gateway error");
            }
            tracing::info!("HTTP gateway stopped");
        }));
    }

    // 4. Background tasks
    let flush = FlushTask::spawn(core.activity.clone(), core.sessions.clone());

    let service_name = core.config.service_name.clone();
    let advertised_http = http_addr.map(|a| a.port());
    let advertised_https = https_addr.port();
    let probe = options.address_probe.clone();
    let source: ServiceInfoSource = Arc::new(move || AdvertisedService {
        name: service_name.clone(),
        hostname: probe().map(|ip| ip.to_string()).unwrap_or_default(),
        http_port: advertised_http,
        https_port: advertised_https,
    });

    let advertised = source();
    let registered = if !advertised.is_registrable() {
        tracing::warn!("No LAN address yet; registration deferred to the watcher");
        None
    } else if let Err(e) = options.registrar.register(&advertised) {
        tracing::warn!(error = %e, "Initial service registration failed");
        None
    } else {
        Some(advertised)
    };

    let watcher = watcher::spawn(
        options.registrar.clone(),
        source,
        options.watcher_timing,
        registered,
    );
    let address_monitor = options.address_poll.map(|every| {
        let probe = options.address_probe.clone();
        watcher::spawn_address_monitor(watcher.sender(), every, move || probe())
    });

    let session = GatewaySession {
        session_id: Uuid::new_v4().to_string(),
        https_addr,
        http_addr,
        fingerprint: tls.fingerprint.clone(),
        started_at: chrono::Utc::now().to_rfc3339(),
    };
    tracing::info!(
        session_id = %session.session_id,
        https = %https_addr,
        fingerprint = %session.fingerprint,
        "Gateway running"
    );

    Ok(GatewayServer {
        session,
        core,
        tls_handle,
        http_shutdown,
        listeners,
        flush: Some(flush),
        watcher,
        address_monitor,
        registrar: options.registrar,
    })
}

impl GatewayServer {
    pub fn watcher(&self) -> &WatcherHandle {
        &self.watcher
    }

    pub fn is_running(&self) -> bool {
        self.flush.is_some()
    }

    /// Stop the gateway. Safe to call more than once.
    pub async fn stop(&mut self) {
        let Some(flush) = self.flush.take() else {
            return;
        };
        tracing::info!(session_id = %self.session.session_id, "Gateway stopping");

        // 1. New requests get 410 from here on
        self.core.begin_shutdown();
        match self.core.lock_pairing() {
            Ok(mut pairing) => pairing.cancel_all(),
            Err(e) => tracing::warn!(error = %e, "Could not cancel pairing prompts"),
        }

        // 2. Background tasks
        flush.stop().await;
        self.watcher.stop().await;
        if let Some(monitor) = self.address_monitor.take() {
            monitor.abort();
        }

        // 3. Discovery + key material
        match self.watcher.registered() {
            Some(service) => {
                if let Err(e) = self.registrar.unregister(&service) {
                    tracing::warn!(error = %e, "Service unregistration failed");
                }
            }
            None => tracing::debug!("No live advertisement to withdraw"),
        }
        self.core.clear_caches();

        // 4. Listeners
        self.tls_handle.graceful_shutdown(Some(DRAIN_TIMEOUT));
        if let Some(tx) = self.http_shutdown.take() {
            let _ = tx.send(());
        }
        for listener in self.listeners.drain(..) {
            if let Err(e) = listener.await {
                tracing::warn!(error = %e, "Listener task ended abnormally");
            }
        }
        tracing::info!("Gateway stopped");
    }
}

// ═══════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════
