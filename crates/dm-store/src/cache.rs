//! Per-identity state cache (spec §4.7). Modeled on the load/validate/merge flow of
//! `rust/src/core/storage.rs`'s `refresh_*_from_storage` methods, but specialised to a
//! single serialized `MessagingState` record rather than a SQL-normalized schema.

use std::collections::HashMap;

use dm_types::{Message, MessagingState, Protocol};
use nostr::PublicKey;

use crate::kv::{KvError, KvStore, DM_CACHE_STORE};

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("cached state is corrupt: {0}")]
    Corrupt(String),
    #[error(transparent)]
    Kv(#[from] KvError),
}

const REQUIRED_KEYS: &[&str] = &[
    "participants",
    "conversation_metadata",
    "conversation_messages",
    "sync_state",
    "relay_info",
];

pub fn record_key(pubkey: &PublicKey) -> String {
    format!("dm-cache:{}", pubkey.to_hex())
}

pub fn save_to_cache(kv: &KvStore, pubkey: &PublicKey, state: &MessagingState) -> Result<(), CacheError> {
    let bytes = serde_json::to_vec(state)
        .map_err(|e| CacheError::Corrupt(format!("failed to serialize state: {e}")))?;
    kv.put(DM_CACHE_STORE, &record_key(pubkey), &bytes)?;
    Ok(())
}

/// `Ok(None)` = no prior cache (cold start). `Err(CacheError::Corrupt)` = a record exists
/// but isn't repairable; spec §7 `CacheCorrupt` says this degrades gracefully, the caller
/// treats it exactly like a cold start but keeps the error around for logging.
pub fn load_from_cache(kv: &KvStore, pubkey: &PublicKey) -> Result<Option<MessagingState>, CacheError> {
    let Some(bytes) = kv.get(DM_CACHE_STORE, &record_key(pubkey))? else {
        return Ok(None);
    };

    if let Ok(state) = serde_json::from_slice::<MessagingState>(&bytes) {
        return Ok(Some(state));
    }

    let mut value: serde_json::Value = serde_json::from_slice(&bytes)
        .map_err(|e| CacheError::Corrupt(format!("not valid JSON: {e}")))?;

    validate_shape(&value)?;
    migrate_in_place(&mut value);

    serde_json::from_value(value)
        .map(Some)
        .map_err(|e| CacheError::Corrupt(format!("unrepairable after migration: {e}")))
}

fn validate_shape(value: &serde_json::Value) -> Result<(), CacheError> {
    let obj = value
        .as_object()
        .ok_or_else(|| CacheError::Corrupt("top-level value is not an object".to_string()))?;
    for key in REQUIRED_KEYS {
        if !obj.contains_key(*key) {
            return Err(CacheError::Corrupt(format!("missing required key {key:?}")));
        }
    }
    Ok(())
}

/// Best-effort forward-migration (spec §4.7): repair a missing `sender_pubkey` by
/// deriving it from the outer event (NIP-04) or the seal (NIP-17), and normalize
/// `file_metadata` from a bare object to a list.
fn migrate_in_place(value: &mut serde_json::Value) {
    let Some(conversations) = value
        .get_mut("conversation_messages")
        .and_then(|v| v.as_object_mut())
    else {
        return;
    };

    for (_conv_id, messages) in conversations.iter_mut() {
        let Some(list) = messages.as_array_mut() else {
            continue;
        };
        for message in list.iter_mut() {
            migrate_message(message);
        }
    }
}

fn migrate_message(message: &mut serde_json::Value) {
    let Some(obj) = message.as_object_mut() else {
        return;
    };

    if !obj.contains_key("sender_pubkey") || obj.get("sender_pubkey").is_some_and(|v| v.is_null()) {
        let protocol = obj.get("protocol").and_then(|v| v.as_str()).unwrap_or("");
        let derived = if protocol == "Nip17" {
            obj.get("seal_event")
                .and_then(|s| s.get("pubkey"))
                .cloned()
        } else {
            obj.get("event").and_then(|e| e.get("pubkey")).cloned()
        };
        if let Some(pk) = derived {
            obj.insert("sender_pubkey".to_string(), pk);
        }
    }

    match obj.get("file_metadata") {
        None => {
            obj.insert("file_metadata".to_string(), serde_json::Value::Array(vec![]));
        }
        Some(v) if v.is_object() => {
            let single = v.clone();
            obj.insert(
                "file_metadata".to_string(),
                serde_json::Value::Array(vec![single]),
            );
        }
        _ => {}
    }
}

/// Settings fingerprint (spec §4.7): a change invalidates the query plan, not the cached
/// messages — the caller still loads the cache but runs a full bootstrap over it.
pub fn settings_fingerprint(discovery_relays: &[nostr::RelayUrl], mode: dm_types::RelayMode) -> String {
    use sha2::{Digest, Sha256};

    let mut sorted: Vec<String> = discovery_relays.iter().map(|r| r.to_string()).collect();
    sorted.sort();
    let mode_tag = match mode {
        dm_types::RelayMode::Discovery => "discovery",
        dm_types::RelayMode::Hybrid => "hybrid",
        dm_types::RelayMode::StrictOutbox => "strict_outbox",
    };
    let mut hasher = Sha256::new();
    hasher.update(sorted.join(",").as_bytes());
    hasher.update(b"|");
    hasher.update(mode_tag.as_bytes());
    hex::encode(hasher.finalize())
}

/// Merge freshly-fetched data on top of a prior cached/in-memory state (spec §4.7
/// "Merge").
pub fn merge_messaging_state(old: &MessagingState, incoming: &MessagingState) -> MessagingState {
    let mut merged = old.clone();

    for (pk, participant) in &incoming.participants {
        merged.participants.insert(*pk, participant.clone());
    }

    for (conv_id, new_messages) in &incoming.conversation_messages {
        let entry = merged
            .conversation_messages
            .entry(conv_id.clone())
            .or_default();
        merge_message_list(entry, new_messages);
    }

    for (conv_id, new_meta) in &incoming.conversation_metadata {
        merged
            .conversation_metadata
            .entry(conv_id.clone())
            .and_modify(|existing| {
                existing.last_read_at_ms = existing.last_read_at_ms.max(new_meta.last_read_at_ms);
                existing.is_known = existing.is_known || new_meta.is_known;
                existing.subject = new_meta.subject.clone();
                existing.last_activity_ms = new_meta.last_activity_ms;
                existing.has_nip04 = existing.has_nip04 || new_meta.has_nip04;
                existing.has_nip17 = existing.has_nip17 || new_meta.has_nip17;
                existing.is_request = !existing.is_known;
                existing.last_message = new_meta.last_message.clone();
                existing.has_decryption_errors =
                    existing.has_decryption_errors || new_meta.has_decryption_errors;
            })
            .or_insert_with(|| new_meta.clone());
    }

    for (relay, new_health) in &incoming.relay_info {
        merged.relay_info.insert(relay.clone(), new_health.clone());
    }

    merged.sync_state.last_cache_time_ms = incoming
        .sync_state
        .last_cache_time_ms
        .max(old.sync_state.last_cache_time_ms);
    merged
        .sync_state
        .queried_relays
        .extend(incoming.sync_state.queried_relays.iter().cloned());
    merged.sync_state.query_limit_reached =
        old.sync_state.query_limit_reached || incoming.sync_state.query_limit_reached;

    merged
}

/// Dedup-and-sort union used both by the full-state merge above and by the real-time
/// subscriber's incremental fold (spec §3 dedup rule, §4.8).
pub fn merge_message_list(existing: &mut Vec<Message>, incoming: &[Message]) {
    for candidate in incoming {
        if existing.iter().any(|m| m.collides_with(candidate)) {
            continue;
        }
        existing.push(candidate.clone());
    }
    existing.sort_by(|a, b| {
        a.event
            .created_at
            .cmp(&b.event.created_at)
            .then_with(|| a.id.cmp(&b.id))
    });
}

#[allow(dead_code)]
fn protocol_label(p: Protocol) -> &'static str {
    match p {
        Protocol::Nip04 => "Nip04",
        Protocol::Nip17 => "Nip17",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pubkey(byte: u8) -> PublicKey {
        let bytes = [byte; 32];
        PublicKey::from_slice(&bytes).unwrap()
    }

    #[test]
    fn save_then_load_round_trips_an_empty_state() {
        let kv = KvStore::in_memory().unwrap();
        let pk = pubkey(1);
        let state = MessagingState::new();
        save_to_cache(&kv, &pk, &state).unwrap();
        let loaded = load_from_cache(&kv, &pk).unwrap().unwrap();
        assert!(loaded.conversation_maps_are_consistent());
    }

    #[test]
    fn missing_record_is_cold_start() {
        let kv = KvStore::in_memory().unwrap();
        assert!(load_from_cache(&kv, &pubkey(2)).unwrap().is_none());
    }

    #[test]
    fn shape_missing_required_key_is_corrupt() {
        let kv = KvStore::in_memory().unwrap();
        let pk = pubkey(3);
        kv.put(DM_CACHE_STORE, &record_key(&pk), br#"{"participants":{}}"#)
            .unwrap();
        assert!(matches!(
            load_from_cache(&kv, &pk),
            Err(CacheError::Corrupt(_))
        ));
    }

    #[test]
    fn fingerprint_changes_when_relay_set_changes() {
        let a = vec![nostr::RelayUrl::parse("wss://a.example").unwrap()];
        let b = vec![nostr::RelayUrl::parse("wss://b.example").unwrap()];
        assert_ne!(
            settings_fingerprint(&a, dm_types::RelayMode::Hybrid),
            settings_fingerprint(&b, dm_types::RelayMode::Hybrid)
        );
    }

    #[test]
    fn fingerprint_is_order_independent() {
        let a = vec![
            nostr::RelayUrl::parse("wss://a.example").unwrap(),
            nostr::RelayUrl::parse("wss://b.example").unwrap(),
        ];
        let b = vec![
            nostr::RelayUrl::parse("wss://b.example").unwrap(),
            nostr::RelayUrl::parse("wss://a.example").unwrap(),
        ];
        assert_eq!(
            settings_fingerprint(&a, dm_types::RelayMode::Hybrid),
            settings_fingerprint(&b, dm_types::RelayMode::Hybrid)
        );
    }

    #[test]
    fn merge_participants_is_idempotent() {
        let mut base = MessagingState::new();
        base.participants.insert(
            pubkey(4),
            dm_types::Participant::new(pubkey(4), 1000),
        );
        let merged_twice = merge_messaging_state(&merge_messaging_state(&base, &base), &base);
        assert_eq!(merged_twice.participants.len(), 1);
    }
}
