//! Error taxonomy (spec §7). Per-event and per-relay errors are *tallied*, not bubbled —
//! see `RelayHealth` and `Message::error` — so most of these variants are constructed and
//! stored rather than propagated with `?`. `EngineError` is reserved for operations the
//! spec marks fatal: sends, cache corruption, and signer unavailability.

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("no recipient received the message (all gift-wraps failed to publish)")]
    NotDelivered,

    #[error("signer unavailable: {0}")]
    SignerUnavailable(String),

    #[error("cached state is corrupt: {0}")]
    CacheCorrupt(String),

    #[error("attachment encryption algorithm {found:?} is not supported, expected one of {supported:?}")]
    UnsupportedAttachmentAlgorithm {
        found: String,
        supported: Vec<&'static str>,
    },

    #[error("attachment integrity check failed: expected sha256 {expected}, got {actual}")]
    IntegrityMismatch { expected: String, actual: String },

    #[error("malformed event: {0}")]
    MalformedEvent(String),
}

/// Per-relay failure kinds recorded in `RelayHealth`, never bubbled to the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayErrorKind {
    Unreachable(String),
    Timeout,
}

impl std::fmt::Display for RelayErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unreachable(reason) => write!(f, "unreachable: {reason}"),
            Self::Timeout => write!(f, "query timed out"),
        }
    }
}

/// Per-message decryption failure kinds. Stored as `Message.error` (a plain string, per
/// spec §3) rather than propagated, but kept as a typed enum up until that point so the
/// decryption pipeline can log/branch on the specific cause.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecryptFailureKind {
    /// NIP-04 `signer.nip04.decrypt` failed.
    UnableToDecrypt,
    /// NIP-44 gift-wrap or seal layer failed to decrypt.
    GiftWrapUnwrapFailed(String),
    /// Decrypted JSON didn't parse, or the seal/rumor kind didn't match the expected one.
    MalformedEnvelope(String),
}

impl std::fmt::Display for DecryptFailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnableToDecrypt => write!(f, "Unable to decrypt"),
            Self::GiftWrapUnwrapFailed(reason) => write!(f, "Unable to decrypt: {reason}"),
            Self::MalformedEnvelope(reason) => write!(f, "Malformed message: {reason}"),
        }
    }
}
