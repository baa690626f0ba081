//! File attachment encryption (spec §4.9). Modeled on `nostring-core/src/crypto.rs`'s
//! explicit key/nonce handling and `thiserror` error enum; AES-256-GCM is the only AEAD
//! wired in, but the module is shaped so a second algorithm is one more match arm away.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::Engine as _;
use rand::RngCore;
use sha2::{Digest, Sha256};
use thiserror::Error;

pub const KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 12;

const SUPPORTED: &[&str] = &["aes-gcm"];
/// Named so `UnsupportedAlgorithm` errors can point at real alternatives (spec §9 design
/// notes: "clearly reject others by name").
const KNOWN_UNSUPPORTED: &[&str] = &["aes-cbc", "chacha20-poly1305", "xchacha20-poly1305"];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AttachmentCryptoError {
    #[error("attachment encryption algorithm '{0}' is not supported; supported: aes-gcm")]
    UnsupportedAlgorithm(String),
    #[error("invalid key/nonce encoding: {0}")]
    InvalidEncoding(String),
    #[error("AEAD operation failed (wrong key, nonce, or corrupted ciphertext)")]
    AeadFailure,
    #[error("integrity check failed: expected sha256 {expected}, got {actual}")]
    IntegrityMismatch { expected: String, actual: String },
}

pub struct EncryptedAttachment {
    pub ciphertext: Vec<u8>,
    pub key_base64: String,
    pub nonce_base64: String,
    /// sha256(ciphertext), hex-encoded — goes in the `imeta` `x` field.
    pub ciphertext_sha256_hex: String,
}

/// Encrypt raw file bytes with a fresh random 256-bit key and 96-bit nonce (spec §4.9
/// "Attachment encryption").
pub fn encrypt_attachment(plaintext: &[u8]) -> Result<EncryptedAttachment, AttachmentCryptoError> {
    let mut key_bytes = [0u8; KEY_LEN];
    let mut nonce_bytes = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut key_bytes);
    rand::thread_rng().fill_bytes(&mut nonce_bytes);

    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key_bytes));
    let nonce = Nonce::from_slice(&nonce_bytes);
    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|_| AttachmentCryptoError::AeadFailure)?;

    let ciphertext_sha256_hex = hex::encode(Sha256::digest(&ciphertext));

    Ok(EncryptedAttachment {
        ciphertext,
        key_base64: base64::engine::general_purpose::STANDARD.encode(key_bytes),
        nonce_base64: base64::engine::general_purpose::STANDARD.encode(nonce_bytes),
        ciphertext_sha256_hex,
    })
}

/// Decrypt a downloaded ciphertext (spec §4.9 "Attachment decryption"). `algorithm` must
/// be `"aes-gcm"`; `key`/`nonce` may be hex or base64 (normalized internally);
/// `expected_sha256_hex`, when present, is checked before decryption is attempted.
pub fn decrypt_attachment(
    algorithm: &str,
    key: &str,
    nonce: &str,
    ciphertext: &[u8],
    expected_sha256_hex: Option<&str>,
) -> Result<Vec<u8>, AttachmentCryptoError> {
    if algorithm != "aes-gcm" {
        return Err(AttachmentCryptoError::UnsupportedAlgorithm(
            algorithm.to_string(),
        ));
    }

    if let Some(expected) = expected_sha256_hex {
        let actual = hex::encode(Sha256::digest(ciphertext));
        if !actual.eq_ignore_ascii_case(expected) {
            return Err(AttachmentCryptoError::IntegrityMismatch {
                expected: expected.to_string(),
                actual,
            });
        }
    }

    let key_bytes = normalize_to_bytes(key, KEY_LEN)?;
    let nonce_bytes = normalize_to_bytes(nonce, NONCE_LEN)?;

    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key_bytes));
    let nonce = Nonce::from_slice(&nonce_bytes);
    cipher
        .decrypt(nonce, ciphertext)
        .map_err(|_| AttachmentCryptoError::AeadFailure)
}

/// `true` if `algorithm` is one of the named-but-unsupported AEADs, used purely to enrich
/// the error message with "did you mean" context.
pub fn is_known_unsupported(algorithm: &str) -> bool {
    KNOWN_UNSUPPORTED.contains(&algorithm)
}

pub fn supported_algorithms() -> &'static [&'static str] {
    SUPPORTED
}

/// Accept hex or base64, reject anything else, always return `len` raw bytes.
fn normalize_to_bytes(raw: &str, len: usize) -> Result<Vec<u8>, AttachmentCryptoError> {
    if raw.len() == len * 2 && raw.chars().all(|c| c.is_ascii_hexdigit()) {
        return hex::decode(raw)
            .map_err(|e| AttachmentCryptoError::InvalidEncoding(e.to_string()));
    }
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(raw)
        .map_err(|e| AttachmentCryptoError::InvalidEncoding(e.to_string()))?;
    if decoded.len() != len {
        return Err(AttachmentCryptoError::InvalidEncoding(format!(
            "expected {len} bytes, got {}",
            decoded.len()
        )));
    }
    Ok(decoded)
}

/// Hex → base64 conversion used when caching keys/nonces that arrived hex-encoded on the
/// wire (spec §4.5 file-metadata parse).
pub fn hex_to_base64_if_hex(raw: &str) -> String {
    if raw.len() % 2 == 0 && !raw.is_empty() && raw.chars().all(|c| c.is_ascii_hexdigit()) {
        if let Ok(bytes) = hex::decode(raw) {
            return base64::engine::general_purpose::STANDARD.encode(bytes);
        }
    }
    raw.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_is_identical_and_integrity_checked() {
        let plaintext = b"a shiny new attachment".to_vec();
        let enc = encrypt_attachment(&plaintext).unwrap();

        let decrypted = decrypt_attachment(
            "aes-gcm",
            &enc.key_base64,
            &enc.nonce_base64,
            &enc.ciphertext,
            Some(&enc.ciphertext_sha256_hex),
        )
        .unwrap();

        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn integrity_mismatch_is_rejected_before_decrypting() {
        let enc = encrypt_attachment(b"hello").unwrap();
        let err = decrypt_attachment(
            "aes-gcm",
            &enc.key_base64,
            &enc.nonce_base64,
            &enc.ciphertext,
            Some("0000000000000000000000000000000000000000000000000000000000000000"),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            AttachmentCryptoError::IntegrityMismatch { .. }
        ));
    }

    #[test]
    fn unsupported_algorithm_is_named() {
        let err = decrypt_attachment("aes-cbc", "k", "n", b"x", None).unwrap_err();
        assert_eq!(
            err,
            AttachmentCryptoError::UnsupportedAlgorithm("aes-cbc".to_string())
        );
        assert!(is_known_unsupported("aes-cbc"));
        assert!(!is_known_unsupported("aes-gcm"));
    }

    #[test]
    fn hex_key_normalizes_to_base64() {
        let hex_key = hex::encode([7u8; 32]);
        let b64 = hex_to_base64_if_hex(&hex_key);
        assert_ne!(b64, hex_key);
        assert_eq!(
            base64::engine::general_purpose::STANDARD
                .decode(&b64)
                .unwrap(),
            vec![7u8; 32]
        );
    }
}
