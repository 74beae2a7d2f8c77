//! Authentication of peer-to-peer messages.
//!
//! After decryption a peer body reads `timestamp|signature|json`, where
//! `timestamp` is Unix milliseconds and `signature` is
//! `base64(HMAC-SHA256(key, "<timestamp>|<json>"))`. Messages outside the
//! freshness window or with a mismatching signature never reach a handler.

use std::time::Duration;

use base64::Engine;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::cipher::SymmetricKey;

type HmacSha256 = Hmac<Sha256>;

pub const DEFAULT_FRESHNESS: Duration = Duration::from_secs(120);

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum VerifyError {
    #[error("Malformed peer message: {0}")]
    Malformed(&'static str),
    #[error("Peer message is stale ({age_ms} ms)")]
    Stale { age_ms: u64 },
    #[error("Peer signature mismatch")]
    SignatureMismatch,
}

/// The three parts of a peer envelope.
#[derive(Debug, PartialEq, Eq)]
pub struct PeerEnvelope<'a> {
    pub timestamp_ms: u64,
    pub signature: &'a str,
    pub payload: &'a str,
}

/// Split `timestamp|signature|json`. The JSON part may itself contain `|`.
pub fn split_envelope(plaintext: &str) -> Result<PeerEnvelope<'_>, VerifyError> {
    let mut parts = plaintext.splitn(3, '|');
    let timestamp = parts.next().ok_or(VerifyError::Malformed("missing timestamp"))?;
    let signature = parts.next().ok_or(VerifyError::Malformed("missing signature"))?;
    let payload = parts.next().ok_or(VerifyError::Malformed("missing payload"))?;

    let timestamp_ms = timestamp
        .trim()
        .parse::<u64>()
        .map_err(|_| VerifyError::Malformed("timestamp is not a number"))?;
    if signature.is_empty() {
        return Err(VerifyError::Malformed("empty signature"));
    }

    Ok(PeerEnvelope {
        timestamp_ms,
        signature,
        payload,
    })
}

fn mac_for(
    key: &SymmetricKey,
    timestamp_ms: u64,
    payload: &str,
) -> Result<HmacSha256, VerifyError> {
    let mut mac = HmacSha256::new_from_slice(key.as_bytes())
        .map_err(|_| VerifyError::Malformed("unusable key"))?;
    mac.update(timestamp_ms.to_string().as_bytes());
    mac.update(b"|");
    mac.update(payload.as_bytes());
    Ok(mac)
}

/// Base64 signature over `"<timestamp>|<payload>"`.
pub fn sign(key: &SymmetricKey, timestamp_ms: u64, payload: &str) -> Result<String, VerifyError> {
    let tag = mac_for(key, timestamp_ms, payload)?.finalize().into_bytes();
    Ok(base64::engine::general_purpose::STANDARD.encode(tag))
}

/// Build a complete `timestamp|signature|json` plaintext.
pub fn seal_peer_message(
    key: &SymmetricKey,
    timestamp_ms: u64,
    payload: &str,
) -> Result<String, VerifyError> {
    let signature = sign(key, timestamp_ms, payload)?;
    Ok(format!("{timestamp_ms}|{signature}|{payload}"))
}

/// Check freshness and signature, returning the JSON payload on success.
pub fn verify<'a>(
    key: &SymmetricKey,
    plaintext: &'a str,
    now_ms: u64,
    freshness: Duration,
) -> Result<&'a str, VerifyError> {
    let envelope = split_envelope(plaintext)?;

    let age_ms = now_ms.abs_diff(envelope.timestamp_ms);
    let window_ms = u64::try_from(freshness.as_millis()).unwrap_or(u64::MAX);
    if age_ms > window_ms {
        return Err(VerifyError::Stale { age_ms });
    }

    let presented = base64::engine::general_purpose::STANDARD
        .decode(envelope.signature.trim())
        .map_err(|_| VerifyError::SignatureMismatch)?;
    let expected = mac_for(key, envelope.timestamp_ms, envelope.payload)?
        .finalize()
        .into_bytes();

    if expected.as_slice().ct_eq(presented.as_slice()).into() {
        Ok(envelope.payload)
    } else {
        Err(VerifyError::SignatureMismatch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: u64 = 1_700_000_000_000;

    #[test]
    fn valid_message_passes() {
        let key = SymmetricKey::generate();
        let msg = seal_peer_message(&key, NOW, r#"{"operation":"ping"}"#).unwrap();
        assert_eq!(
            verify(&key, &msg, NOW + 1_000, DEFAULT_FRESHNESS),
            Ok(r#"{"operation":"ping"}"#)
        );
    }

    #[test]
    fn payload_may_contain_separator() {
        let key = SymmetricKey::generate();
        let payload = r#"{"text":"a|b|c"}"#;
        let msg = seal_peer_message(&key, NOW, payload).unwrap();
        assert_eq!(verify(&key, &msg, NOW, DEFAULT_FRESHNESS), Ok(payload));
    }

    #[test]
    fn stale_message_is_rejected() {
        let key = SymmetricKey::generate();
        let msg = seal_peer_message(&key, NOW - 300_000, "{}").unwrap();
        assert_eq!(
            verify(&key, &msg, NOW, DEFAULT_FRESHNESS),
            Err(VerifyError::Stale { age_ms: 300_000 })
        );
    }

    #[test]
    fn future_message_is_rejected() {
        let key = SymmetricKey::generate();
        let msg = seal_peer_message(&key, NOW + 121_000, "{}").unwrap();
        assert!(matches!(
            verify(&key, &msg, NOW, DEFAULT_FRESHNESS),
            Err(VerifyError::Stale { .. })
        ));
    }

    #[test]
    fn edge_of_window_is_accepted() {
        let key = SymmetricKey::generate();
        let msg = seal_peer_message(&key, NOW - 120_000, "{}").unwrap();
        assert!(verify(&key, &msg, NOW, DEFAULT_FRESHNESS).is_ok());
    }

    #[test]
    fn wrong_key_is_rejected() {
        let msg = seal_peer_message(&SymmetricKey::generate(), NOW, "{}").unwrap();
        assert_eq!(
            verify(&SymmetricKey::generate(), &msg, NOW, DEFAULT_FRESHNESS),
            Err(VerifyError::SignatureMismatch)
        );
    }

    #[test]
    fn altered_payload_is_rejected() {
        let key = SymmetricKey::generate();
        let msg = seal_peer_message(&key, NOW, r#"{"amount":1}"#).unwrap().replace("1}", "9}");
        assert_eq!(
            verify(&key, &msg, NOW, DEFAULT_FRESHNESS),
            Err(VerifyError::SignatureMismatch)
        );
    }

    #[test]
    fn altered_timestamp_is_rejected() {
        let key = SymmetricKey::generate();
        let msg = seal_peer_message(&key, NOW, "{}").unwrap();
        let forged = msg.replacen(&NOW.to_string(), &(NOW + 1).to_string(), 1);
        assert_eq!(
            verify(&key, &forged, NOW, DEFAULT_FRESHNESS),
            Err(VerifyError::SignatureMismatch)
        );
    }

    #[test]
    fn malformed_envelopes() {
        let key = SymmetricKey::generate();
        for bad in ["", "{}", "abc|sig|{}", "123|{}", "123||{}"] {
            assert!(
                matches!(verify(&key, bad, NOW, DEFAULT_FRESHNESS), Err(VerifyError::Malformed(_))),
                "{bad:?} should be malformed"
            );
        }
    }
}
