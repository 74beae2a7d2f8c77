//! Session store: persisted client sessions plus the in-memory token cache
//! the gateway resolves keys from.
//!
//! The `sessions` table is the source of truth. The token cache is a
//! derived view that [`SessionStore::load`] rebuilds from scratch and
//! [`SessionStore::upsert`] keeps in step with every write.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;

use crate::cipher::{CipherError, SymmetricKey, KEY_LENGTH};
use crate::db::repository::session as session_repo;
use crate::db::{Database, DatabaseError};
use crate::models::Session;

/// How long an observed client address stays authoritative.
pub const CLIENT_IP_TTL: Duration = Duration::from_secs(60 * 60);
const CLIENT_IP_PRUNE_THRESHOLD: usize = 256;

#[derive(Debug, thiserror::Error)]
pub enum SessionStoreError {
    #[error(transparent)]
    Database(#[from] DatabaseError),
    #[error("Session {0} has no token")]
    EmptyToken(String),
    #[error("Session {client_id} has an unusable token: {source}")]
    InvalidToken {
        client_id: String,
        source: CipherError,
    },
}

#[derive(Debug, Clone)]
struct CachedIp {
    ip: String,
    seen: Instant,
}

pub struct SessionStore {
    db: Database,
    tokens: RwLock<HashMap<String, SymmetricKey>>,
    client_ips: DashMap<String, CachedIp>,
    ip_ttl: Duration,
}

impl SessionStore {
    pub fn new(db: Database) -> Self {
        Self {
            db,
            tokens: RwLock::new(HashMap::new()),
            client_ips: DashMap::new(),
            ip_ttl: CLIENT_IP_TTL,
        }
    }

    /// Rebuild the token cache from every persisted session.
    ///
    /// Rows with a malformed token are skipped (and logged) so one bad row
    /// cannot lock every other client out.
    pub fn load(&self) -> Result<usize, SessionStoreError> {
        let sessions = self
            .db
            .with_conn(|conn| session_repo::get_all_sessions(conn))?;

        let mut fresh = HashMap::with_capacity(sessions.len());
        for session in &sessions {
            match SymmetricKey::from_bytes(&session.token) {
                Ok(key) => {
                    fresh.insert(session.client_id.clone(), key);
                }
                Err(e) => {
                    tracing::warn!(client_id = %session.client_id, error = %e, "Skipping session with bad token");
                }
            }
        }

        let count = fresh.len();
        *self.tokens.write().unwrap_or_else(PoisonError::into_inner) = fresh;
        tracing::debug!(count, "Session token cache loaded");
        Ok(count)
    }

    /// Find-or-create the session for `client_id`, apply `mutate`, persist
    /// it and refresh the cache. This is the only write path for sessions.
    ///
    /// The stored record must end up with a full-length token.
    pub fn upsert<F>(&self, client_id: &str, mutate: F) -> Result<Session, SessionStoreError>
    where
        F: FnOnce(&mut Session),
    {
        let session = self.db.with_conn(|conn| {
            let existing = session_repo::get_session(conn, client_id)?;
            let is_new = existing.is_none();
            let mut session = existing.unwrap_or_else(|| Session::new(client_id));

            mutate(&mut session);
            session.client_id = client_id.to_string();
            session.updated_at = Utc::now();

            if session.token.is_empty() {
                return Err(SessionStoreError::EmptyToken(client_id.to_string()));
            }
            if session.token.len() != KEY_LENGTH {
                return Err(SessionStoreError::InvalidToken {
                    client_id: client_id.to_string(),
                    source: CipherError::InvalidKeyLength(session.token.len()),
                });
            }

            let key = SymmetricKey::from_bytes(&session.token).map_err(|source| {
                SessionStoreError::InvalidToken {
                    client_id: client_id.to_string(),
                    source,
                }
            })?;

            if is_new {
                session_repo::insert_session(conn, &session)?;
            } else {
                session_repo::update_session(conn, &session)?;
            }
            // Still under the connection lock: the cache matches the last row written.
            self.tokens
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(client_id.to_string(), key);
            Ok(session)
        })?;

        if !session.client_ip.is_empty() {
            self.remember_ip(client_id, &session.client_ip);
        }

        tracing::info!(client_id, "Session stored");
        Ok(session)
    }

    /// Remove the persisted session. Callers reload afterwards.
    pub fn delete(&self, client_id: &str) -> Result<bool, SessionStoreError> {
        let deleted = self
            .db
            .with_conn(|conn| session_repo::delete_session(conn, client_id))?;
        if deleted {
            tracing::info!(client_id, "Session removed");
        }
        Ok(deleted)
    }

    /// Cached key for `client_id`, if the client is paired.
    pub fn token_for(&self, client_id: &str) -> Option<SymmetricKey> {
        self.tokens
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(client_id)
            .cloned()
    }

    /// The address we believe `client_id` is at.
    ///
    /// A cached address younger than the TTL wins over `observed_ip`;
    /// otherwise `observed_ip` is cached and returned.
    pub fn resolve_client_ip(&self, client_id: &str, observed_ip: &str) -> String {
        if self.client_ips.len() > CLIENT_IP_PRUNE_THRESHOLD {
            let ttl = self.ip_ttl;
            self.client_ips.retain(|_, cached| cached.seen.elapsed() < ttl);
        }

        let mut entry = self
            .client_ips
            .entry(client_id.to_string())
            .or_insert_with(|| CachedIp {
                ip: observed_ip.to_string(),
                seen: Instant::now(),
            });
        if entry.seen.elapsed() >= self.ip_ttl {
            entry.ip = observed_ip.to_string();
            entry.seen = Instant::now();
        }
        entry.ip.clone()
    }

    fn remember_ip(&self, client_id: &str, ip: &str) {
        self.client_ips.insert(
            client_id.to_string(),
            CachedIp {
                ip: ip.to_string(),
                seen: Instant::now(),
            },
        );
    }

    pub fn list(&self) -> Result<Vec<Session>, SessionStoreError> {
        Ok(self
            .db
            .with_conn(|conn| session_repo::get_all_sessions(conn))?)
    }

    pub fn record_last_seen(
        &self,
        client_id: &str,
        seen_at: DateTime<Utc>,
    ) -> Result<bool, SessionStoreError> {
        Ok(self
            .db
            .with_conn(|conn| session_repo::update_last_seen(conn, client_id, seen_at))?)
    }

    /// Drop every cached token and address. The table is untouched.
    pub fn clear_cache(&self) {
        self.tokens
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.client_ips.clear();
    }

    pub fn cached_count(&self) -> usize {
        self.tokens
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl std::fmt::Debug for SessionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionStore")
            .field("cached_tokens", &self.cached_count())
            .finish_non_exhaustive()
    }
}
