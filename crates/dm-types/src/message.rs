use nostr::{EventId, PublicKey};
use serde::{Deserialize, Serialize};

/// Which of the two nested encryption schemes produced a `Message` (spec §3, §4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Protocol {
    /// Legacy `kind = 4` scheme: sender/recipient visible on the outer event.
    Nip04,
    /// Gift-wrap / seal / rumor scheme: outer envelope signed under a decoy ephemeral key.
    Nip17,
}

/// AEAD used to encrypt a file attachment (spec §4.9 design notes — "algorithm
/// negotiation"). Only `AesGcm` is implemented; other variants exist so rejection can name
/// the offending algorithm without losing type safety at the call site.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttachmentAlgorithm {
    AesGcm,
    Unknown,
}

impl AttachmentAlgorithm {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "aes-gcm" => Self::AesGcm,
            _ => Self::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AesGcm => "aes-gcm",
            Self::Unknown => "unknown",
        }
    }
}

/// Per-file encryption parameters, normalized to base64 regardless of how they arrived on
/// the wire (spec §4.5 "When decryption keys/nonces are encoded as even-length hex,
/// convert to base64 before storage").
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEncryption {
    pub algorithm: AttachmentAlgorithm,
    pub key_base64: String,
    pub nonce_base64: String,
}

/// NIP-92 `imeta` / legacy flat-tag attachment descriptor (spec §3, §4.5).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMetadata {
    pub url: Option<String>,
    pub mime_type: Option<String>,
    pub size: Option<u64>,
    pub name: Option<String>,
    pub dim: Option<String>,
    pub blurhash: Option<String>,
    pub thumb: Option<String>,
    pub fallback: Vec<String>,
    pub hash: Option<String>,
    pub encryption: Option<FileEncryption>,
}

impl FileMetadata {
    pub fn has_url(&self) -> bool {
        self.url.as_deref().is_some_and(|u| !u.is_empty())
    }
}

/// Canonical internal message representation (spec §3 `Message`).
///
/// Invariant: `sender_pubkey` is always the *real* author — for NIP-04 the outer
/// `event.pubkey`, for NIP-17 the seal's `pubkey` (never the gift-wrap's ephemeral
/// decoy key).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// For NIP-04: `event.id`. For NIP-17: the outer gift-wrap's id — the only stable,
    /// signed identifier, since the inner rumor is never signed.
    pub id: EventId,
    pub event: nostr::UnsignedEvent,
    pub conversation_id: String,
    pub protocol: Protocol,
    pub sender_pubkey: PublicKey,
    pub subject: Option<String>,
    pub error: Option<String>,
    pub gift_wrap_id: Option<EventId>,
    pub seal_event: Option<nostr::UnsignedEvent>,
    pub gift_wrap_event: Option<nostr::Event>,
    pub file_metadata: Vec<FileMetadata>,
}

impl Message {
    pub fn has_attachments(&self) -> bool {
        !self.file_metadata.is_empty()
    }

    /// Dedup predicate (spec §3): two messages collide iff they share `id`, or both carry
    /// a `gift_wrap_id` and those match.
    pub fn collides_with(&self, other: &Message) -> bool {
        if self.id == other.id {
            return true;
        }
        matches!((self.gift_wrap_id, other.gift_wrap_id), (Some(a), Some(b)) if a == b)
    }
}
