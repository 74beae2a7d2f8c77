//! Symmetric envelope cipher for request and response bodies.
//!
//! Every body on the wire is `base64(nonce || ciphertext || tag)` produced
//! by AES-256-GCM under a 32-byte key (a session token, the root token, or
//! a peer/group key). The tag makes tampering fail closed: a modified body
//! never decrypts to partial plaintext.

use aes_gcm::aead::rand_core::RngCore;
use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::Engine;
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, ZeroizeOnDrop};

pub const KEY_LENGTH: usize = 32;
const NONCE_LENGTH: usize = 12;
const TAG_LENGTH: usize = 16;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CipherError {
    #[error("Invalid key length: expected {KEY_LENGTH} bytes, got {0}")]
    InvalidKeyLength(usize),
    #[error("Encryption failed")]
    EncryptionFailed,
    #[error("Decryption failed: wrong key or corrupted data")]
    DecryptionFailed,
    #[error("Body is not valid base64")]
    InvalidEncoding,
}

/// A 32-byte symmetric key, zeroed on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SymmetricKey([u8; KEY_LENGTH]);

impl SymmetricKey {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CipherError> {
        let arr: [u8; KEY_LENGTH] = bytes
            .try_into()
            .map_err(|_| CipherError::InvalidKeyLength(bytes.len()))?;
        Ok(Self(arr))
    }

    /// Fresh random key from the OS RNG.
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_LENGTH];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LENGTH] {
        &self.0
    }

    pub fn to_base64(&self) -> String {
        base64::engine::general_purpose::STANDARD.encode(self.0)
    }

    /// Constant-time equality.
    pub fn ct_eq(&self, other: &SymmetricKey) -> bool {
        self.0.ct_eq(&other.0).into()
    }
}

impl From<[u8; KEY_LENGTH]> for SymmetricKey {
    fn from(bytes: [u8; KEY_LENGTH]) -> Self {
        Self(bytes)
    }
}

// Key bytes never end up in logs.
impl std::fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SymmetricKey(..)")
    }
}

/// Encrypt to raw bytes: `[12-byte nonce][ciphertext + tag]`.
pub fn encrypt(key: &SymmetricKey, plaintext: &[u8]) -> Result<Vec<u8>, CipherError> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_bytes()));

    let mut nonce_bytes = [0u8; NONCE_LENGTH];
    OsRng.fill_bytes(&mut nonce_bytes);

    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
        .map_err(|_| CipherError::EncryptionFailed)?;

    let mut output = Vec::with_capacity(NONCE_LENGTH + ciphertext.len());
    output.extend_from_slice(&nonce_bytes);
    output.extend_from_slice(&ciphertext);
    Ok(output)
}

/// Decrypt raw bytes produced by [`encrypt`].
pub fn decrypt(key: &SymmetricKey, data: &[u8]) -> Result<Vec<u8>, CipherError> {
    if data.len() < NONCE_LENGTH + TAG_LENGTH {
        return Err(CipherError::DecryptionFailed);
    }
    let (nonce_bytes, ciphertext) = data.split_at(NONCE_LENGTH);
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_bytes()));
    cipher
        .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
        .map_err(|_| CipherError::DecryptionFailed)
}

/// Encrypt and base64-encode, ready to be sent as an HTTP body.
pub fn seal(key: &SymmetricKey, plaintext: &[u8]) -> Result<String, CipherError> {
    let raw = encrypt(key, plaintext)?;
    Ok(base64::engine::general_purpose::STANDARD.encode(raw))
}

/// Decode a base64 HTTP body and decrypt it.
pub fn open(key: &SymmetricKey, body: &[u8]) -> Result<Vec<u8>, CipherError> {
    let trimmed = body.trim_ascii();
    let raw = base64::engine::general_purpose::STANDARD
        .decode(trimmed)
        .map_err(|_| CipherError::InvalidEncoding)?;
    decrypt(key, &raw)
}
