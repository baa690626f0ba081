//! Data model (spec §3) and error taxonomy (spec §7) for the encrypted direct-messaging
//! engine. Deliberately free of I/O: every type here is a plain value that the `engine`
//! and `dm-store` crates construct, merge, and persist.

pub mod conversation;
pub mod error;
pub mod message;
pub mod participant;
pub mod state;

pub use conversation::{Conversation, LastMessageSummary};
pub use error::{DecryptFailureKind, EngineError, RelayErrorKind};
pub use message::{AttachmentAlgorithm, FileEncryption, FileMetadata, Message, Protocol};
pub use participant::{Participant, ParticipantRegistry, RelayListsResult, RelayMode};
pub use state::{MessagingState, RelayHealth, SyncState};

/// Nostr event kinds the engine cares about (spec glossary). Represented with
/// `Kind::Custom` throughout rather than named constants, since the protocol numbers are
/// the load-bearing contract and this keeps every callsite explicit about which NIP it's
/// touching.
pub mod kinds {
    use nostr::Kind;

    pub const NIP04_DM: u16 = 4;
    pub const SEAL: u16 = 13;
    pub const RUMOR_TEXT: u16 = 14;
    pub const RUMOR_FILE: u16 = 15;
    pub const GIFT_WRAP: u16 = 1059;
    pub const RELAY_LIST: u16 = 10002;
    pub const DM_INBOX: u16 = 10050;
    pub const BLOCKED_RELAYS: u16 = 10006;

    pub fn nip04_dm() -> Kind {
        Kind::Custom(NIP04_DM)
    }
    pub fn seal() -> Kind {
        Kind::Custom(SEAL)
    }
    pub fn rumor_text() -> Kind {
        Kind::Custom(RUMOR_TEXT)
    }
    pub fn rumor_file() -> Kind {
        Kind::Custom(RUMOR_FILE)
    }
    pub fn gift_wrap() -> Kind {
        Kind::Custom(GIFT_WRAP)
    }
    pub fn relay_list() -> Kind {
        Kind::Custom(RELAY_LIST)
    }
    pub fn dm_inbox() -> Kind {
        Kind::Custom(DM_INBOX)
    }
    pub fn blocked_relays() -> Kind {
        Kind::Custom(BLOCKED_RELAYS)
    }
}
