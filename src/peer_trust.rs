//! Peer trust cache and the write path that keeps it honest.
//!
//! The cache is a read-mostly snapshot of every paired peer's key, public
//! key and every chat group key. Reloads build a complete new snapshot and
//! swap it in under the write lock, so readers see either the old or the
//! new view and never a half-built one.
//!
//! [`TrustService`] owns every mutation of pairing status and group
//! membership and reloads the cache in the same call, so a revoked key is
//! gone before the next request is served.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use chrono::Utc;
use rusqlite::Connection;

use crate::cipher::SymmetricKey;
use crate::db::repository::{chat_group as group_repo, peer as peer_repo};
use crate::db::{Database, DatabaseError};
use crate::models::{ChatGroup, Peer, PeerStatus};

/// Which key table a lookup targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyScope {
    Peer,
    Group,
}

#[derive(Debug, Default)]
pub struct KeySnapshot {
    peer_keys: HashMap<String, SymmetricKey>,
    peer_public_keys: HashMap<String, Vec<u8>>,
    group_keys: HashMap<String, SymmetricKey>,
}

impl KeySnapshot {
    /// Build a snapshot from the persisted tables.
    pub fn read(conn: &Connection) -> Result<Self, DatabaseError> {
        let mut snapshot = Self::default();

        for peer in peer_repo::get_paired_peers(conn)? {
            if let Some(key) = peer.key.as_deref() {
                match SymmetricKey::from_bytes(key) {
                    Ok(key) => {
                        snapshot.peer_keys.insert(peer.id.clone(), key);
                    }
                    Err(e) => tracing::warn!(peer_id = %peer.id, error = %e, "Ignoring bad peer key"),
                }
            }
            if let Some(public_key) = peer.public_key {
                snapshot.peer_public_keys.insert(peer.id, public_key);
            }
        }

        for group in group_repo::get_all_groups(conn)? {
            match SymmetricKey::from_bytes(&group.key) {
                Ok(key) => {
                    snapshot.group_keys.insert(group.id, key);
                }
                Err(e) => tracing::warn!(group_id = %group.id, error = %e, "Ignoring bad group key"),
            }
        }

        Ok(snapshot)
    }
}

#[derive(Debug, Default)]
pub struct PeerTrustCache {
    snapshot: RwLock<Arc<KeySnapshot>>,
}

impl PeerTrustCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Re-read every paired peer and group and swap the snapshot.
    pub fn reload(&self, conn: &Connection) -> Result<(), DatabaseError> {
        let fresh = Arc::new(KeySnapshot::read(conn)?);
        tracing::debug!(
            peers = fresh.peer_keys.len(),
            groups = fresh.group_keys.len(),
            "Peer trust cache reloaded"
        );
        *self.snapshot.write().unwrap_or_else(PoisonError::into_inner) = fresh;
        Ok(())
    }

    fn current(&self) -> Arc<KeySnapshot> {
        Arc::clone(&self.snapshot.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// `None` means the caller is not authenticated for that scope.
    pub fn key_for(&self, scope: KeyScope, id: &str) -> Option<SymmetricKey> {
        let snapshot = self.current();
        match scope {
            KeyScope::Peer => snapshot.peer_keys.get(id).cloned(),
            KeyScope::Group => snapshot.group_keys.get(id).cloned(),
        }
    }

    pub fn public_key_for(&self, peer_id: &str) -> Option<Vec<u8>> {
        self.current().peer_public_keys.get(peer_id).cloned()
    }

    /// Forget every key until the next reload.
    pub fn invalidate(&self) {
        *self.snapshot.write().unwrap_or_else(PoisonError::into_inner) =
            Arc::new(KeySnapshot::default());
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TrustError {
    #[error(transparent)]
    Database(#[from] DatabaseError),
    #[error("Unknown peer: {0}")]
    UnknownPeer(String),
    #[error("Unknown group: {0}")]
    UnknownGroup(String),
    #[error("Group {group_id} references peers that are not paired: {missing:?}")]
    UnpairedMembers {
        group_id: String,
        missing: Vec<String>,
    },
}

/// Details recorded when a peer pairs with us.
#[derive(Debug, Clone)]
pub struct PeerPairing {
    pub id: String,
    pub name: String,
    pub ip: String,
    pub device_type: String,
    pub public_key: Option<Vec<u8>>,
}

/// Mutations of peer trust, each followed by a cache reload.
#[derive(Debug, Clone)]
pub struct TrustService {
    db: Database,
    cache: Arc<PeerTrustCache>,
}

impl TrustService {
    pub fn new(db: Database, cache: Arc<PeerTrustCache>) -> Self {
        Self { db, cache }
    }

    pub fn cache(&self) -> &Arc<PeerTrustCache> {
        &self.cache
    }

    pub fn reload(&self) -> Result<(), TrustError> {
        Ok(self.db.with_conn(|conn| self.cache.reload(conn))?)
    }

    /// Pair (or re-pair) a peer under a freshly generated shared key.
    pub fn pair_peer(&self, pairing: PeerPairing) -> Result<SymmetricKey, TrustError> {
        let key = SymmetricKey::generate();
        let peer = Peer {
            id: pairing.id.clone(),
            name: pairing.name,
            ip: pairing.ip,
            key: Some(key.as_bytes().to_vec()),
            public_key: pairing.public_key,
            status: PeerStatus::Paired,
            device_type: pairing.device_type,
            updated_at: Utc::now(),
        };

        self.db.with_conn(|conn| {
            if peer_repo::get_peer(conn, &peer.id)?.is_some() {
                peer_repo::update_peer(conn, &peer)?;
            } else {
                peer_repo::insert_peer(conn, &peer)?;
            }
            self.cache.reload(conn)?;
            Ok::<_, TrustError>(())
        })?;

        tracing::info!(peer_id = %pairing.id, "Peer paired");
        Ok(key)
    }

    /// Flip a peer to unpaired and purge its keys. The row is kept.
    ///
    /// The peer also leaves every group it belonged to, and each of those
    /// groups gets a new key, so the old group keys stop working too.
    pub fn unpair_peer(&self, peer_id: &str) -> Result<(), TrustError> {
        let rotated = self.db.with_conn(|conn| {
            let mut peer = peer_repo::get_peer(conn, peer_id)?
                .ok_or_else(|| TrustError::UnknownPeer(peer_id.to_string()))?;
            peer.status = PeerStatus::Unpaired;
            peer.key = None;
            peer.public_key = None;
            peer.updated_at = Utc::now();
            peer_repo::update_peer(conn, &peer)?;

            let mut rotated = 0;
            for mut group in group_repo::get_all_groups(conn)? {
                if !group.members.iter().any(|m| m == peer_id) {
                    continue;
                }
                group.members.retain(|m| m != peer_id);
                group.key = SymmetricKey::generate().as_bytes().to_vec();
                group.updated_at = Utc::now();
                group_repo::update_group(conn, &group)?;
                rotated += 1;
            }

            self.cache.reload(conn)?;
            Ok::<_, TrustError>(rotated)
        })?;

        tracing::info!(peer_id, groups_rotated = rotated, "Peer unpaired");
        Ok(())
    }

    /// A group as stored.
    pub fn group(&self, group_id: &str) -> Result<Option<ChatGroup>, TrustError> {
        Ok(self.db.with_conn(|conn| group_repo::get_group(conn, group_id))?)
    }

    pub fn peers(&self) -> Result<Vec<Peer>, TrustError> {
        Ok(self.db.with_conn(|conn| peer_repo::get_all_peers(conn))?)
    }

    pub fn create_group(
        &self,
        group_id: &str,
        members: Vec<String>,
    ) -> Result<SymmetricKey, TrustError> {
        self.write_group(group_id, members, true)
    }

    /// Replace a group's membership. The group key is rotated so removed
    /// members lose access immediately.
    pub fn set_group_members(
        &self,
        group_id: &str,
        members: Vec<String>,
    ) -> Result<SymmetricKey, TrustError> {
        self.write_group(group_id, members, false)
    }

    fn write_group(
        &self,
        group_id: &str,
        members: Vec<String>,
        create: bool,
    ) -> Result<SymmetricKey, TrustError> {
        let key = SymmetricKey::generate();
        let group = ChatGroup {
            id: group_id.to_string(),
            key: key.as_bytes().to_vec(),
            members,
            updated_at: Utc::now(),
        };

        self.db.with_conn(|conn| {
            let paired: Vec<String> = peer_repo::get_paired_peers(conn)?
                .into_iter()
                .map(|p| p.id)
                .collect();
            let missing: Vec<String> = group
                .members
                .iter()
                .filter(|m| !paired.contains(m))
                .cloned()
                .collect();
            if !missing.is_empty() {
                return Err(TrustError::UnpairedMembers {
                    group_id: group.id.clone(),
                    missing,
                });
            }

            if create {
                group_repo::insert_group(conn, &group)?;
            } else {
                match group_repo::update_group(conn, &group) {
                    Err(DatabaseError::NotFound { .. }) => {
                        return Err(TrustError::UnknownGroup(group.id.clone()))
                    }
                    other => other?,
                }
            }
            self.cache.reload(conn)?;
            Ok(())
        })?;

        tracing::info!(group_id, members = group.members.len(), "Group key rotated");
        Ok(key)
    }

    pub fn delete_group(&self, group_id: &str) -> Result<bool, TrustError> {
        let deleted = self.db.with_conn(|conn| {
            let deleted = group_repo::delete_group(conn, group_id)?;
            self.cache.reload(conn)?;
            Ok::<_, TrustError>(deleted)
        })?;
        if deleted {
            tracing::info!(group_id, "Group deleted");
        }
        Ok(deleted)
    }
}
