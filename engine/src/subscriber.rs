//! Real-time subscriber (C8, spec §4.8). After bootstrap, a long-lived subscription with
//! the same three filter families but `since = now`; each arriving event is decrypted and
//! incrementally folded into state.

use dm_types::{Conversation, Message, MessagingState};
use nostr::PublicKey;

use crate::conversations::{build_conversation_metadata, compute_conversation_id, parse_conversation_id};

/// `addMessageToState` (spec §4.8): fold one freshly decrypted message into state.
/// Returns `true` if the message was novel and applied, `false` if it was a dedup hit.
pub fn add_message_to_state(state: &mut MessagingState, message: Message, my_pubkey: PublicKey) -> bool {
    let conv_id = message.conversation_id.clone();
    let existing = state.conversation_messages.entry(conv_id.clone()).or_default();

    if existing.iter().any(|m| m.collides_with(&message)) {
        return false;
    }

    let insert_at = existing
        .partition_point(|m| (m.event.created_at, m.id) <= (message.event.created_at, message.id));
    existing.insert(insert_at, message);

    recompute_conversation_metadata_incrementally(state, &conv_id, my_pubkey);
    true
}

/// Recompute just one conversation's metadata from its (already up to date) message list,
/// without re-scanning any other conversation (spec §4.8 "do not re-scan other
/// conversations").
fn recompute_conversation_metadata_incrementally(
    state: &mut MessagingState,
    conv_id: &str,
    my_pubkey: PublicKey,
) {
    let messages = state
        .conversation_messages
        .get(conv_id)
        .cloned()
        .unwrap_or_default();
    let previous = state.conversation_metadata.get(conv_id).cloned();
    let participants = previous
        .as_ref()
        .map(|c| c.participant_pubkeys.clone())
        .unwrap_or_else(|| parse_conversation_id(conv_id));

    debug_assert_eq!(compute_conversation_id(&participants), conv_id);

    let metadata = build_conversation_metadata(conv_id, &participants, &messages, my_pubkey, previous.as_ref());
    state.conversation_metadata.insert(conv_id.to_string(), metadata);
}

/// Ensure a conversation entry exists even before any message lands in it (e.g. when a
/// peer's relay-list refresh surfaces a new group before its first message arrives).
pub fn ensure_conversation_exists(state: &mut MessagingState, conv_id: &str, participants: &[PublicKey]) {
    state
        .conversation_metadata
        .entry(conv_id.to_string())
        .or_insert_with(|| Conversation::new(conv_id.to_string(), {
            let mut v = participants.to_vec();
            v.sort();
            v.dedup();
            v
        }));
    state.conversation_messages.entry(conv_id.to_string()).or_default();
}

#[cfg(test)]
mod tests {
    use super::*;
    use dm_types::Protocol;
    use nostr::{EventId, Timestamp, UnsignedEvent};

    fn pk(n: u8) -> PublicKey {
        PublicKey::from_slice(&[n; 32]).unwrap()
    }

    fn message(id_byte: u8, conv_id: String, sender: PublicKey, created_at: u64) -> Message {
        Message {
            id: EventId::from_slice(&[id_byte; 32]).unwrap(),
            event: UnsignedEvent::new(sender, Timestamp::from(created_at), dm_types::kinds::rumor_text(), vec![], "hi".to_string()),
            conversation_id: conv_id,
            protocol: Protocol::Nip17,
            sender_pubkey: sender,
            subject: None,
            error: None,
            gift_wrap_id: Some(EventId::from_slice(&[id_byte; 32]).unwrap()),
            seal_event: None,
            gift_wrap_event: None,
            file_metadata: vec![],
        }
    }

    #[test]
    fn novel_message_is_inserted_and_flips_is_known_when_from_self() {
        let me = pk(1);
        let peer = pk(2);
        let conv_id = compute_conversation_id(&[me, peer]);
        let mut state = MessagingState::new();

        let applied = add_message_to_state(&mut state, message(1, conv_id.clone(), me, 100), me);
        assert!(applied);
        assert!(state.conversation_metadata[&conv_id].is_known);
    }

    #[test]
    fn duplicate_gift_wrap_id_is_rejected() {
        let me = pk(1);
        let peer = pk(2);
        let conv_id = compute_conversation_id(&[me, peer]);
        let mut state = MessagingState::new();
        add_message_to_state(&mut state, message(5, conv_id.clone(), peer, 100), me);
        let applied = add_message_to_state(&mut state, message(5, conv_id.clone(), peer, 100), me);
        assert!(!applied);
        assert_eq!(state.conversation_messages[&conv_id].len(), 1);
    }

    #[test]
    fn insertion_preserves_created_at_order() {
        let me = pk(1);
        let peer = pk(2);
        let conv_id = compute_conversation_id(&[me, peer]);
        let mut state = MessagingState::new();
        add_message_to_state(&mut state, message(1, conv_id.clone(), peer, 200), me);
        add_message_to_state(&mut state, message(2, conv_id.clone(), peer, 100), me);
        let timestamps: Vec<u64> = state.conversation_messages[&conv_id]
            .iter()
            .map(|m| m.event.created_at.as_u64())
            .collect();
        assert_eq!(timestamps, vec![100, 200]);
    }
}
