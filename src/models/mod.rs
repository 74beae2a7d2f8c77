//! Persisted records owned by the gateway: paired client sessions,
//! paired peer devices and the chat groups they share keys with.

pub mod enums;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use enums::PeerStatus;

/// A paired remote client and the symmetric key it talks to us with.
///
/// `client_id` is the primary key, so at most one row exists per client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub client_id: String,
    /// 32-byte session key. Never serialized towards clients.
    #[serde(skip_serializing, default)]
    pub token: Vec<u8>,
    pub client_ip: String,
    pub os_name: String,
    pub os_version: String,
    pub browser_name: String,
    pub browser_version: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_seen_at: Option<DateTime<Utc>>,
}

impl Session {
    /// A blank record for a client that has not been assigned a key yet.
    pub fn new(client_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            client_id: client_id.into(),
            token: Vec::new(),
            client_ip: String::new(),
            os_name: String::new(),
            os_version: String::new(),
            browser_name: String::new(),
            browser_version: String::new(),
            created_at: now,
            updated_at: now,
            last_seen_at: None,
        }
    }
}

/// A sibling device paired for direct peer-to-peer chat.
///
/// `key` and `public_key` are only populated while `status` is `Paired`;
/// unpairing clears them but keeps the row for history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    pub id: String,
    pub name: String,
    pub ip: String,
    #[serde(skip_serializing, default)]
    pub key: Option<Vec<u8>>,
    pub public_key: Option<Vec<u8>>,
    pub status: PeerStatus,
    pub device_type: String,
    pub updated_at: DateTime<Utc>,
}

/// A group of peers sharing one symmetric key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatGroup {
    pub id: String,
    #[serde(skip_serializing, default)]
    pub key: Vec<u8>,
    pub members: Vec<String>,
    pub updated_at: DateTime<Utc>,
}
