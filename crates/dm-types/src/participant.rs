use std::collections::HashMap;

use nostr::{PublicKey, RelayUrl};
use serde::{Deserialize, Serialize};

/// One participant's derived relay picture (spec §3 `Participant`).
///
/// Created when first referenced by a decrypted message or as a conversation peer;
/// mutated only by a relay-list refresh (C2); never destroyed during a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub pubkey: PublicKey,
    pub derived_relays: Vec<RelayUrl>,
    pub blocked_relays: Vec<RelayUrl>,
    pub last_fetched_ms: u64,
}

impl Participant {
    pub fn new(pubkey: PublicKey, last_fetched_ms: u64) -> Self {
        Self {
            pubkey,
            derived_relays: Vec::new(),
            blocked_relays: Vec::new(),
            last_fetched_ms,
        }
    }
}

/// `map<pubkey, Participant>` — owned by the runtime, never by a UI.
pub type ParticipantRegistry = HashMap<PublicKey, Participant>;

/// Relay discovery mode (spec §4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelayMode {
    /// Ignore the participant's published relay lists entirely; use only the caller's
    /// static discovery relay set.
    Discovery,
    /// Prefer the participant's NIP-65/NIP-17 lists but fall back to / augment with the
    /// discovery set.
    #[default]
    Hybrid,
    /// Use only the participant's own published relay lists.
    StrictOutbox,
}

/// The three raw relay-list events for one participant (spec §3 `RelayListsResult`).
/// At most one event per kind — the highest `created_at` observed, per NIP-01 replaceable
/// event semantics.
#[derive(Debug, Clone, Default)]
pub struct RelayListsResult {
    pub outbox: Option<nostr::Event>,
    pub dm_inbox: Option<nostr::Event>,
    pub blocked: Option<nostr::Event>,
}

impl RelayListsResult {
    /// Replace a stored event with `candidate` only if it is newer (or there was none).
    pub fn offer(existing: &mut Option<nostr::Event>, candidate: nostr::Event) {
        match existing {
            Some(current) if current.created_at >= candidate.created_at => {}
            _ => *existing = Some(candidate),
        }
    }
}
