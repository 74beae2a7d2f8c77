//! Composition root for the gateway.
//!
//! `CoreState` owns the database handle, the credential store and every
//! in-memory cache. It is wrapped in `Arc` at startup and shared by the
//! HTTP layer, the activity flush task and the pairing prompt.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use subtle::ConstantTimeEq;
use tokio::sync::broadcast;

use crate::activity::ActivityTracker;
use crate::cipher::SymmetricKey;
use crate::config::GatewayConfig;
use crate::credentials::CredentialStore;
use crate::db::{Database, DatabaseError};
use crate::pairing::{PairingError, PairingEvent, PairingManager, PendingApproval};
use crate::peer_trust::{PeerTrustCache, TrustError, TrustService};
use crate::session_store::{SessionStore, SessionStoreError};

/// Buffered pairing events per subscriber.
const PAIRING_EVENT_CAPACITY: usize = 32;

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("Lock poisoned")]
    LockPoisoned,
    #[error(transparent)]
    Database(#[from] DatabaseError),
    #[error(transparent)]
    Session(#[from] SessionStoreError),
    #[error(transparent)]
    Trust(#[from] TrustError),
    #[error(transparent)]
    Pairing(#[from] PairingError),
}

pub struct CoreState {
    pub config: GatewayConfig,
    pub db: Database,
    pub credentials: CredentialStore,
    pub sessions: Arc<SessionStore>,
    pub trust: TrustService,
    pub activity: Arc<ActivityTracker>,
    pairing: Mutex<PairingManager>,
    pairing_events: broadcast::Sender<PairingEvent>,
    /// Cleared by the owner to refuse all API traffic (403).
    enabled: AtomicBool,
    /// Set once `stop()` begins (410).
    shutting_down: AtomicBool,
}

impl CoreState {
    pub fn new(config: GatewayConfig, db: Database) -> Self {
        let credentials = CredentialStore::new(config.password.clone());
        let sessions = Arc::new(SessionStore::new(db.clone()));
        let trust = TrustService::new(db.clone(), Arc::new(PeerTrustCache::new()));
        let (pairing_events, _) = broadcast::channel(PAIRING_EVENT_CAPACITY);

        Self {
            config,
            db,
            credentials,
            sessions,
            trust,
            activity: Arc::new(ActivityTracker::new()),
            pairing: Mutex::new(PairingManager::new()),
            pairing_events,
            enabled: AtomicBool::new(true),
            shutting_down: AtomicBool::new(false),
        }
    }

    /// Open the configured database file and build the state around it.
    pub fn open(config: GatewayConfig) -> Result<Self, CoreError> {
        let db = Database::open(&config.database_path())?;
        Ok(Self::new(config, db))
    }

    /// State over an in-memory database (tests, throwaway runs).
    pub fn in_memory(config: GatewayConfig) -> Result<Self, CoreError> {
        Ok(Self::new(config, Database::open_in_memory()?))
    }

    pub fn peer_trust(&self) -> &Arc<PeerTrustCache> {
        self.trust.cache()
    }

    // ── Caches ──────────────────────────────────────────────

    /// Rebuild every derived cache from the tables.
    pub fn load_caches(&self) -> Result<(), CoreError> {
        let sessions = self.sessions.load()?;
        self.trust.reload()?;
        tracing::info!(sessions, "Caches loaded");
        Ok(())
    }

    pub fn clear_caches(&self) {
        self.sessions.clear_cache();
        self.peer_trust().invalidate();
        self.activity.clear();
        tracing::debug!("Caches cleared");
    }

    /// Unpair a client: delete its session and reload the token cache.
    pub fn remove_session(&self, client_id: &str) -> Result<bool, CoreError> {
        let removed = self.sessions.delete(client_id)?;
        self.sessions.load()?;
        Ok(removed)
    }

    // ── Keys ────────────────────────────────────────────────

    pub fn root_token(&self) -> SymmetricKey {
        self.credentials.root_token()
    }

    /// Constant-time check of a presented developer bearer token.
    /// Always false while no developer token is configured.
    pub fn dev_token_matches(&self, presented: &str) -> bool {
        let expected = self.config.dev_token.as_bytes();
        !expected.is_empty() && bool::from(expected.ct_eq(presented.as_bytes()))
    }

    // ── Pairing ─────────────────────────────────────────────

    pub fn lock_pairing(&self) -> Result<MutexGuard<'_, PairingManager>, CoreError> {
        self.pairing.lock().map_err(|_| CoreError::LockPoisoned)
    }

    pub fn subscribe_pairing(&self) -> broadcast::Receiver<PairingEvent> {
        self.pairing_events.subscribe()
    }

    pub fn notify_pairing(&self, event: PairingEvent) {
        // No subscriber means nobody can answer; the request times out.
        if self.pairing_events.send(event).is_err() {
            tracing::warn!("Pairing event dropped: no prompt is listening");
        }
    }

    pub fn pending_pairings(&self) -> Result<Vec<PendingApproval>, CoreError> {
        Ok(self.lock_pairing()?.pending())
    }

    pub fn approve_pairing(&self, client_id: &str) -> Result<(), CoreError> {
        self.lock_pairing()?.approve(client_id)?;
        Ok(())
    }

    pub fn deny_pairing(&self, client_id: &str) -> Result<(), CoreError> {
        self.lock_pairing()?.deny(client_id)?;
        Ok(())
    }

    // ── Availability ────────────────────────────────────────

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
        tracing::info!(enabled, "Gateway availability changed");
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn begin_shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
    }

    /// Re-open for traffic after a completed stop.
    pub fn reset_shutdown(&self) {
        self.shutting_down.store(false, Ordering::SeqCst);
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for CoreState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoreState")
            .field("sessions", &self.sessions)
            .field("enabled", &self.is_enabled())
            .field("shutting_down", &self.is_shutting_down())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pairing::PairRequest;

    fn state() -> CoreState {
        let config = GatewayConfig {
            password: "owner-pass".into(),
            dev_token: "dev-token".into(),
            ..GatewayConfig::default()
        };
        CoreState::in_memory(config).unwrap()
    }

    #[test]
    fn dev_token_comparison() {
        let core = state();
        assert!(core.dev_token_matches("dev-token"));
        assert!(!core.dev_token_matches("dev-token2"));
        assert!(!core.dev_token_matches(""));
    }

    #[test]
    fn empty_dev_token_never_matches() {
        let core = CoreState::in_memory(GatewayConfig::default()).unwrap();
        assert!(!core.dev_token_matches(""));
    }

    #[test]
    fn root_token_follows_configured_password() {
        let core = state();
        assert!(core
            .root_token()
            .ct_eq(&crate::credentials::derive_root_token("owner-pass")));
    }

    #[test]
    fn clear_then_load_restores_sessions() {
        let core = state();
        let token = SymmetricKey::generate().as_bytes().to_vec();
        core.sessions.upsert("c1", |s| s.token = token).unwrap();

        core.clear_caches();
        assert!(core.sessions.token_for("c1").is_none());
        core.load_caches().unwrap();
        assert!(core.sessions.token_for("c1").is_some());
    }

    #[test]
    fn remove_session_forgets_token() {
        let core = state();
        let token = SymmetricKey::generate().as_bytes().to_vec();
        core.sessions.upsert("c1", |s| s.token = token).unwrap();
        assert!(core.remove_session("c1").unwrap());
        assert!(core.sessions.token_for("c1").is_none());
    }

    #[tokio::test]
    async fn approve_through_core() {
        let core = state();
        let rx = {
            let mut pairing = core.lock_pairing().unwrap();
            let request = PairRequest {
                client_id: "c1".into(),
                ..PairRequest::default()
            };
            pairing.submit(&request, "10.0.0.4").unwrap().0
        };
        assert_eq!(core.pending_pairings().unwrap().len(), 1);
        core.approve_pairing("c1").unwrap();
        assert!(rx.await.unwrap());
        assert!(matches!(
            core.deny_pairing("c1"),
            Err(CoreError::Pairing(PairingError::NoPendingApproval(_)))
        ));
    }

    #[test]
    fn availability_flags() {
        let core = state();
        assert!(core.is_enabled());
        core.set_enabled(false);
        assert!(!core.is_enabled());
        core.begin_shutdown();
        assert!(core.is_shutting_down());
        core.reset_shutdown();
        assert!(!core.is_shutting_down());
    }
}
