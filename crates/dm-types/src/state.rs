use std::collections::{HashMap, HashSet};

use nostr::RelayUrl;
use serde::{Deserialize, Serialize};

use crate::conversation::Conversation;
use crate::message::Message;
use crate::participant::ParticipantRegistry;

/// Bootstrap/pagination progress (spec §3 `SyncState`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncState {
    pub last_cache_time_ms: Option<u64>,
    pub queried_relays: HashSet<RelayUrl>,
    pub query_limit_reached: bool,
}

/// Per-relay observed health (spec §3 `RelayHealth`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RelayHealth {
    pub last_query_succeeded: bool,
    pub last_query_error: Option<String>,
    pub is_blocked: bool,
}

/// The single root state owned by the messaging runtime (spec §3 `MessagingState`).
///
/// Global invariants (enforced by the conversation grouper C6 and the merge logic C7, not
/// by this struct's constructors):
/// - Every `conv_id` in `conversation_messages` also appears in `conversation_metadata`,
///   and vice versa.
/// - `conversation_messages[c]` is sorted ascending by `created_at`, tie-broken by `id`.
/// - No two messages in the same conversation collide per `Message::collides_with`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MessagingState {
    pub participants: ParticipantRegistry,
    pub conversation_metadata: HashMap<String, Conversation>,
    pub conversation_messages: HashMap<String, Vec<Message>>,
    pub sync_state: SyncState,
    pub relay_info: HashMap<RelayUrl, RelayHealth>,
}

impl MessagingState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spec §8: "For every `c` in `conversation_metadata`, `c` ∈ `conversation_messages`
    /// (and vice versa)." Used by tests and by cache load-validation.
    pub fn conversation_maps_are_consistent(&self) -> bool {
        let meta_keys: HashSet<&String> = self.conversation_metadata.keys().collect();
        let msg_keys: HashSet<&String> = self.conversation_messages.keys().collect();
        meta_keys == msg_keys
    }
}
