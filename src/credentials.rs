//! Credential & TLS store.
//!
//! Derives the root token from the owner's password and manages the
//! self-signed TLS keystore the gateway serves HTTPS with. The keystore
//! lives behind [`KeyStoreProvider`] so corruption recovery can be
//! exercised without touching disk.
//!
//! Keystore lifecycle:
//! - Loaded on server startup
//! - Regenerated (same alias) when missing or unreadable, then loaded once more
//! - A second failure aborts startup
//! - Certificate fingerprint and signature are shown out of band for pairing

use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};

use base64::Engine;
use pbkdf2::pbkdf2_hmac;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256, Sha512};
use zeroize::Zeroizing;

use crate::cipher::{self, SymmetricKey, KEY_LENGTH};

/// PBKDF2 rounds protecting the keystore private key.
pub const KEYSTORE_PBKDF2_ITERATIONS: u32 = 210_000;

const KEYSTORE_VERSION: u8 = 1;
const SALT_LENGTH: usize = 16;

/// Errors from credential and keystore operations.
#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    #[error("Keystore not found: {0}")]
    NotFound(String),
    #[error("Keystore corrupted: {0}")]
    Corrupted(String),
    #[error("Certificate generation failed: {0}")]
    Generation(String),
    #[error("Keystore I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Malformed certificate: {0}")]
    MalformedCertificate(&'static str),
    #[error("Keystore {alias} unusable after regeneration: {reason}")]
    KeystoreUnrecoverable { alias: String, reason: String },
}

// ═══════════════════════════════════════════════════════════
// Root token
// ═══════════════════════════════════════════════════════════

/// Derive the root token: SHA-512 of the password, truncated to the key length.
pub fn derive_root_token(password: &str) -> SymmetricKey {
    let digest = Sha512::digest(password.as_bytes());
    let mut key = [0u8; KEY_LENGTH];
    key.copy_from_slice(&digest[..KEY_LENGTH]);
    SymmetricKey::from(key)
}

/// Holds the owner's password and hands out the root token derived from it.
///
/// Changing the password changes every root token derived afterwards.
/// Per-client session tokens are independent random keys and are not
/// affected.
pub struct CredentialStore {
    password: RwLock<Zeroizing<String>>,
}

impl CredentialStore {
    pub fn new(password: impl Into<String>) -> Self {
        Self {
            password: RwLock::new(Zeroizing::new(password.into())),
        }
    }

    pub fn set_password(&self, password: impl Into<String>) {
        let mut guard = self.password.write().unwrap_or_else(PoisonError::into_inner);
        *guard = Zeroizing::new(password.into());
        tracing::info!("Root password changed; previously derived root tokens are void");
    }

    pub fn has_password(&self) -> bool {
        let guard = self.password.read().unwrap_or_else(PoisonError::into_inner);
        !guard.is_empty()
    }

    pub fn root_token(&self) -> SymmetricKey {
        let guard = self.password.read().unwrap_or_else(PoisonError::into_inner);
        derive_root_token(&guard)
    }
}

impl std::fmt::Debug for CredentialStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialStore")
            .field("has_password", &self.has_password())
            .finish()
    }
}

// ═══════════════════════════════════════════════════════════
// TLS material
// ═══════════════════════════════════════════════════════════

/// TLS certificate data (decrypted, in-memory).
#[derive(Clone)]
pub struct TlsMaterial {
    /// DER-encoded self-signed certificate.
    pub certificate_der: Vec<u8>,
    /// DER-encoded PKCS#8 private key (plaintext, only held in memory).
    pub private_key_der: Zeroizing<Vec<u8>>,
    /// SHA-256 fingerprint of the certificate (hex, colon-separated).
    pub fingerprint: String,
}

impl TlsMaterial {
    pub fn new(certificate_der: Vec<u8>, private_key_der: Vec<u8>) -> Self {
        let fingerprint = compute_fingerprint(&certificate_der);
        Self {
            certificate_der,
            private_key_der: Zeroizing::new(private_key_der),
            fingerprint,
        }
    }

    /// Signature bytes of the certificate, for out-of-band trust display.
    pub fn signature(&self) -> Result<Vec<u8>, CredentialError> {
        signature_of(&self.certificate_der)
    }
}

impl std::fmt::Debug for TlsMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsMaterial")
            .field("certificate_len", &self.certificate_der.len())
            .field("fingerprint", &self.fingerprint)
            .finish()
    }
}

/// Generate a new self-signed ECDSA-P256 certificate.
///
/// Subject alternative names are `<alias>.local` and `localhost`.
pub fn generate_self_signed(alias: &str) -> Result<TlsMaterial, CredentialError> {
    use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};

    let key_pair =
        KeyPair::generate().map_err(|e| CredentialError::Generation(e.to_string()))?;

    let mut params =
        CertificateParams::new(vec![format!("{alias}.local"), "localhost".to_string()])
            .map_err(|e| CredentialError::Generation(e.to_string()))?;
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, alias);
    params.distinguished_name = dn;
    let now = time::OffsetDateTime::now_utc();
    params.not_before = now - time::Duration::days(1);
    params.not_after = now + time::Duration::days(3650);

    let cert = params
        .self_signed(&key_pair)
        .map_err(|e| CredentialError::Generation(e.to_string()))?;

    Ok(TlsMaterial::new(cert.der().to_vec(), key_pair.serialize_der()))
}

/// Compute the SHA-256 fingerprint of a DER-encoded certificate.
///
/// Returns colon-separated hex like "AB:CD:EF:01:..."
pub fn compute_fingerprint(cert_der: &[u8]) -> String {
    let hash = Sha256::digest(cert_der);
    hash.iter()
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(":")
}

/// Payload embedded in the pairing QR code.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PairingQrPayload {
    pub v: u8,
    pub url: String,
    pub fp: String,
    pub sig: String,
}

/// Render an SVG QR code carrying the server URL, certificate fingerprint and
/// signature, so a companion client can pin the certificate while pairing.
pub fn pairing_qr_svg(url: &str, tls: &TlsMaterial) -> Result<String, CredentialError> {
    use qrcode::render::svg;
    use qrcode::QrCode;

    let payload = PairingQrPayload {
        v: 1,
        url: url.to_string(),
        fp: tls.fingerprint.clone(),
        sig: base64::engine::general_purpose::STANDARD.encode(tls.signature()?),
    };
    let json =
        serde_json::to_string(&payload).map_err(|e| CredentialError::Generation(e.to_string()))?;
    let code = QrCode::new(json.as_bytes())
        .map_err(|e| CredentialError::Generation(format!("QR generation failed: {e}")))?;

    Ok(code
        .render::<svg::Color>()
        .min_dimensions(200, 200)
        .max_dimensions(320, 320)
        .dark_color(svg::Color("#1c1917"))
        .light_color(svg::Color("#ffffff"))
        .quiet_zone(true)
        .build())
}

/// Extract the `signatureValue` bytes from a DER-encoded X.509 certificate.
///
/// `Certificate ::= SEQUENCE { tbsCertificate, signatureAlgorithm, signatureValue BIT STRING }`
pub fn signature_of(cert_der: &[u8]) -> Result<Vec<u8>, CredentialError> {
    let (tag, body, _) = read_tlv(cert_der).ok_or(CredentialError::MalformedCertificate("outer"))?;
    if tag != 0x30 {
        return Err(CredentialError::MalformedCertificate("outer is not a SEQUENCE"));
    }
    let (_, _, rest) = read_tlv(body).ok_or(CredentialError::MalformedCertificate("tbs"))?;
    let (_, _, rest) =
        read_tlv(rest).ok_or(CredentialError::MalformedCertificate("signatureAlgorithm"))?;
    let (tag, bits, _) =
        read_tlv(rest).ok_or(CredentialError::MalformedCertificate("signatureValue"))?;
    if tag != 0x03 || bits.is_empty() {
        return Err(CredentialError::MalformedCertificate("signatureValue is not a BIT STRING"));
    }
    // First content byte is the unused-bits count.
    Ok(bits[1..].to_vec())
}

/// Read one DER TLV. Returns (tag, content, remainder).
fn read_tlv(input: &[u8]) -> Option<(u8, &[u8], &[u8])> {
    let (&tag, rest) = input.split_first()?;
    let (&first, mut rest) = rest.split_first()?;
    let len = if first < 0x80 {
        usize::from(first)
    } else {
        let count = usize::from(first & 0x7F);
        if count == 0 || count > 4 || rest.len() < count {
            return None;
        }
        let (len_bytes, tail) = rest.split_at(count);
        rest = tail;
        len_bytes
            .iter()
            .fold(0usize, |acc, b| (acc << 8) | usize::from(*b))
    };
    if rest.len() < len {
        return None;
    }
    let (content, remainder) = rest.split_at(len);
    Some((tag, content, remainder))
}

// ═══════════════════════════════════════════════════════════
// Keystore providers
// ═══════════════════════════════════════════════════════════

/// Platform keystore abstraction.
pub trait KeyStoreProvider: Send + Sync {
    /// Load and decrypt the keystore stored under `alias`.
    fn load(&self, alias: &str, passphrase: &str) -> Result<TlsMaterial, CredentialError>;
    /// Create a fresh self-signed keystore under `alias`, replacing any existing one.
    fn generate(&self, alias: &str, passphrase: &str) -> Result<(), CredentialError>;
    /// Remove the keystore. Removing a missing keystore is not an error.
    fn delete(&self, alias: &str) -> Result<(), CredentialError>;

    fn signature(&self, alias: &str, passphrase: &str) -> Result<Vec<u8>, CredentialError> {
        self.load(alias, passphrase)?.signature()
    }
}

/// Load the keystore, regenerating it once if it is missing or corrupted.
///
/// A failure after the single regeneration is fatal for server startup.
pub fn ensure_tls_keystore(
    provider: &dyn KeyStoreProvider,
    alias: &str,
    passphrase: &str,
) -> Result<TlsMaterial, CredentialError> {
    let first_error = match provider.load(alias, passphrase) {
        Ok(material) => return Ok(material),
        Err(e) => e,
    };

    match &first_error {
        CredentialError::NotFound(_) => tracing::info!(alias, "No TLS keystore, generating"),
        other => tracing::warn!(alias, error = %other, "TLS keystore unreadable, regenerating"),
    }

    let unrecoverable = |reason: String| CredentialError::KeystoreUnrecoverable {
        alias: alias.to_string(),
        reason,
    };

    provider
        .delete(alias)
        .map_err(|e| unrecoverable(format!("delete failed: {e}")))?;
    provider
        .generate(alias, passphrase)
        .map_err(|e| unrecoverable(format!("generate failed: {e}")))?;
    let material = provider
        .load(alias, passphrase)
        .map_err(|e| unrecoverable(format!("reload failed: {e}")))?;

    tracing::info!(alias, fingerprint = %material.fingerprint, "TLS keystore regenerated");
    Ok(material)
}

/// On-disk JSON record. The private key is AES-256-GCM encrypted under a
/// PBKDF2-SHA256 key derived from the passphrase.
#[derive(Serialize, Deserialize)]
struct KeyStoreFile {
    version: u8,
    alias: String,
    certificate_der: String,
    private_key_encrypted: String,
    salt: String,
}

/// Keystore files under `<dir>/<alias>.ks`.
#[derive(Debug, Clone)]
pub struct FileKeyStore {
    dir: PathBuf,
    iterations: u32,
}

impl FileKeyStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self::with_iterations(dir, KEYSTORE_PBKDF2_ITERATIONS)
    }

    pub fn with_iterations(dir: impl Into<PathBuf>, iterations: u32) -> Self {
        Self {
            dir: dir.into(),
            iterations,
        }
    }

    pub fn path_for(&self, alias: &str) -> PathBuf {
        self.dir.join(format!("{alias}.ks"))
    }

    fn derive_file_key(&self, passphrase: &str, salt: &[u8]) -> SymmetricKey {
        let mut key = [0u8; KEY_LENGTH];
        pbkdf2_hmac::<Sha256>(passphrase.as_bytes(), salt, self.iterations, &mut key);
        SymmetricKey::from(key)
    }

    fn write_atomically(path: &Path, contents: &[u8]) -> Result<(), CredentialError> {
        let tmp = path.with_extension("ks.tmp");
        std::fs::write(&tmp, contents)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }
}

impl KeyStoreProvider for FileKeyStore {
    fn load(&self, alias: &str, passphrase: &str) -> Result<TlsMaterial, CredentialError> {
        let path = self.path_for(alias);
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(CredentialError::NotFound(path.display().to_string()))
            }
            Err(e) => return Err(e.into()),
        };

        let file: KeyStoreFile = serde_json::from_slice(&bytes)
            .map_err(|e| CredentialError::Corrupted(format!("parse: {e}")))?;
        if file.version != KEYSTORE_VERSION || file.alias != alias {
            return Err(CredentialError::Corrupted("alias or version mismatch".into()));
        }

        let b64 = base64::engine::general_purpose::STANDARD;
        let decode = |field: &str, value: &str| {
            b64.decode(value)
                .map_err(|e| CredentialError::Corrupted(format!("{field}: {e}")))
        };
        let certificate_der = decode("certificate_der", &file.certificate_der)?;
        let encrypted_key = decode("private_key_encrypted", &file.private_key_encrypted)?;
        let salt = decode("salt", &file.salt)?;

        let file_key = self.derive_file_key(passphrase, &salt);
        let private_key_der = cipher::decrypt(&file_key, &encrypted_key)
            .map_err(|e| CredentialError::Corrupted(format!("private key: {e}")))?;

        // Reject certificates we could not present.
        signature_of(&certificate_der)?;

        Ok(TlsMaterial::new(certificate_der, private_key_der))
    }

    fn generate(&self, alias: &str, passphrase: &str) -> Result<(), CredentialError> {
        std::fs::create_dir_all(&self.dir)?;
        let material = generate_self_signed(alias)?;

        let salt: [u8; SALT_LENGTH] = rand::random();
        let file_key = self.derive_file_key(passphrase, &salt);
        let encrypted_key = cipher::encrypt(&file_key, &material.private_key_der)
            .map_err(|e| CredentialError::Generation(e.to_string()))?;

        let b64 = base64::engine::general_purpose::STANDARD;
        let file = KeyStoreFile {
            version: KEYSTORE_VERSION,
            alias: alias.to_string(),
            certificate_der: b64.encode(&material.certificate_der),
            private_key_encrypted: b64.encode(encrypted_key),
            salt: b64.encode(salt),
        };
        let json = serde_json::to_vec_pretty(&file)
            .map_err(|e| CredentialError::Generation(e.to_string()))?;
        Self::write_atomically(&self.path_for(alias), &json)
    }

    fn delete(&self, alias: &str) -> Result<(), CredentialError> {
        match std::fs::remove_file(self.path_for(alias)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

// ═══════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════
