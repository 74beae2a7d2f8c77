//! Client pairing protocol.
//!
//! Pairing flow:
//! 1. Client POSTs to /api/pair, body encrypted with the root token
//! 2. Device owner is prompted (pairing event) and approves or denies
//! 3. On approval a fresh 32-byte session token is minted and stored
//! 4. Response (encrypted with the root token) carries the new token
//!
//! Decline or timeout leaves the client unpaired; no session is written.
//! At most one prompt is outstanding per client id.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::cipher::SymmetricKey;
use crate::models::Session;
use crate::session_store::{SessionStore, SessionStoreError};

// ═══════════════════════════════════════════════════════════
// Error type
// ═══════════════════════════════════════════════════════════

/// Errors from the pairing protocol.
#[derive(Debug, thiserror::Error)]
pub enum PairingError {
    #[error("Invalid pairing request: {0}")]
    InvalidRequest(String),
    #[error("A pairing prompt is already open for {0}")]
    AlreadyPending(String),
    #[error("No pending approval for {0}")]
    NoPendingApproval(String),
    #[error("Device owner denied the pairing request")]
    Denied,
    #[error("Approval timed out")]
    ApprovalTimeout,
    #[error(transparent)]
    Session(#[from] SessionStoreError),
}

// ═══════════════════════════════════════════════════════════
// Types
// ═══════════════════════════════════════════════════════════

/// Client's pairing request (decrypted body of `POST /api/pair`).
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct PairRequest {
    pub client_id: String,
    pub os_name: String,
    pub os_version: String,
    pub browser_name: String,
    pub browser_version: String,
}

/// What the device owner sees when asked to confirm.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct PendingApproval {
    pub client_id: String,
    pub client_ip: String,
    pub os_name: String,
    pub os_version: String,
    pub browser_name: String,
    pub browser_version: String,
    pub requested_at: DateTime<Utc>,
}

/// Broadcast to whoever renders the confirmation prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PairingEvent {
    Requested(PendingApproval),
    Resolved { client_id: String, approved: bool },
}

/// Where a client stands in the pairing handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PairingState {
    Unpaired,
    AwaitingUserConfirmation,
    Paired,
}

/// Successful pairing response (encrypted with the root token on the wire).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairResponse {
    pub client_id: String,
    /// Session token, base64.
    pub token: String,
}

struct PendingPairRequest {
    approval: PendingApproval,
    /// `None` once a decision has been sent.
    response_tx: Option<oneshot::Sender<bool>>,
}

// ═══════════════════════════════════════════════════════════
// PairingManager
// ═══════════════════════════════════════════════════════════

/// Tracks pairing prompts awaiting the device owner's decision.
///
/// Lives in `CoreState` behind a `Mutex`; never held across an `.await`.
#[derive(Default)]
pub struct PairingManager {
    pending: HashMap<String, PendingPairRequest>,
}

impl PairingManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a pairing request and return the receiver the HTTP handler
    /// awaits for the owner's decision.
    pub fn submit(
        &mut self,
        request: &PairRequest,
        client_ip: &str,
    ) -> Result<(oneshot::Receiver<bool>, PendingApproval), PairingError> {
        let client_id = request.client_id.trim();
        if client_id.is_empty() {
            return Err(PairingError::InvalidRequest("client_id is required".into()));
        }
        if self.pending.contains_key(client_id) {
            return Err(PairingError::AlreadyPending(client_id.to_string()));
        }

        let approval = PendingApproval {
            client_id: client_id.to_string(),
            client_ip: client_ip.to_string(),
            os_name: request.os_name.clone(),
            os_version: request.os_version.clone(),
            browser_name: request.browser_name.clone(),
            browser_version: request.browser_version.clone(),
            requested_at: Utc::now(),
        };

        let (tx, rx) = oneshot::channel();
        self.pending.insert(
            client_id.to_string(),
            PendingPairRequest {
                approval: approval.clone(),
                response_tx: Some(tx),
            },
        );
        tracing::info!(client_id, client_ip, "Pairing request awaiting confirmation");
        Ok((rx, approval))
    }

    /// Prompts currently awaiting a decision, oldest first.
    pub fn pending(&self) -> Vec<PendingApproval> {
        let mut list: Vec<PendingApproval> = self
            .pending
            .values()
            .filter(|p| p.response_tx.is_some())
            .map(|p| p.approval.clone())
            .collect();
        list.sort_by_key(|p| p.requested_at);
        list
    }

    pub fn is_pending(&self, client_id: &str) -> bool {
        self.pending.contains_key(client_id)
    }

    /// Signal approval to the waiting HTTP handler.
    pub fn approve(&mut self, client_id: &str) -> Result<(), PairingError> {
        self.decide(client_id, true)
    }

    /// Signal denial to the waiting HTTP handler.
    pub fn deny(&mut self, client_id: &str) -> Result<(), PairingError> {
        self.decide(client_id, false)
    }

    fn decide(&mut self, client_id: &str, approved: bool) -> Result<(), PairingError> {
        let tx = self
            .pending
            .get_mut(client_id)
            .and_then(|p| p.response_tx.take())
            .ok_or_else(|| PairingError::NoPendingApproval(client_id.to_string()))?;
        // The handler may have timed out already; the decision is moot then.
        let _ = tx.send(approved);
        tracing::info!(client_id, approved, "Pairing decision made");
        Ok(())
    }

    /// Forget the prompt for `client_id` once its handler is done with it.
    pub fn finish(&mut self, client_id: &str) -> Option<PendingApproval> {
        self.pending.remove(client_id).map(|p| p.approval)
    }

    /// Drop every open prompt. Waiting handlers observe a closed channel.
    pub fn cancel_all(&mut self) {
        if !self.pending.is_empty() {
            tracing::info!(count = self.pending.len(), "Cancelling open pairing prompts");
        }
        self.pending.clear();
    }

    /// Pairing state of `client_id`.
    pub fn state(&self, client_id: &str, sessions: &SessionStore) -> PairingState {
        if self.pending.contains_key(client_id) {
            PairingState::AwaitingUserConfirmation
        } else if sessions.token_for(client_id).is_some() {
            PairingState::Paired
        } else {
            PairingState::Unpaired
        }
    }
}

impl std::fmt::Debug for PairingManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PairingManager")
            .field("pending", &self.pending.len())
            .finish()
    }
}

/// Mint a fresh session token for an approved client and persist it with
/// the client's metadata. Re-pairing replaces the previous token.
pub fn complete_pairing(
    sessions: &SessionStore,
    approval: &PendingApproval,
) -> Result<(Session, SymmetricKey), PairingError> {
    let token = SymmetricKey::generate();
    let token_bytes = token.as_bytes().to_vec();

    let session = sessions.upsert(&approval.client_id, |s| {
        s.token = token_bytes;
        s.client_ip = approval.client_ip.clone();
        s.os_name = approval.os_name.clone();
        s.os_version = approval.os_version.clone();
        s.browser_name = approval.browser_name.clone();
        s.browser_version = approval.browser_version.clone();
    })?;

    tracing::info!(client_id = %approval.client_id, "Client paired");
    Ok((session, token))
}

// ═══════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════
