use nostr::PublicKey;
use serde::{Deserialize, Serialize};

/// Summary of the newest message in a conversation (spec §3 `Conversation.lastMessage`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LastMessageSummary {
    pub snippet: Option<String>,
    pub error: Option<String>,
    pub has_attachments: bool,
}

/// A group of participants exchanging messages (spec §3 `Conversation`).
///
/// Invariant: `id = "group:" + sorted_unique(participant_pubkeys).join(",")`. `subject` is
/// mutable metadata, never part of identity — see spec §9 "Subject is not identity".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub participant_pubkeys: Vec<PublicKey>,
    pub subject: String,
    pub last_activity_ms: u64,
    pub last_read_at_ms: u64,
    pub has_nip04: bool,
    pub has_nip17: bool,
    /// True once we've sent at least one message into this conversation. Monotone across
    /// merges (spec §9 "Monotone `isKnown`") — never demoted back to `false`.
    pub is_known: bool,
    pub is_request: bool,
    pub last_message: LastMessageSummary,
    pub has_decryption_errors: bool,
}

impl Conversation {
    pub fn new(id: String, participant_pubkeys: Vec<PublicKey>) -> Self {
        Self {
            id,
            participant_pubkeys,
            subject: String::new(),
            last_activity_ms: 0,
            last_read_at_ms: 0,
            has_nip04: false,
            has_nip17: false,
            is_known: false,
            is_request: true,
            last_message: LastMessageSummary::default(),
            has_decryption_errors: false,
        }
    }
}
