//! Conversation grouper (C6, spec §4.6).

use std::collections::HashMap;

use dm_types::{Conversation, LastMessageSummary, Message};
use nostr::PublicKey;

/// `computeConversationId` (spec §4.6): `"group:" + sorted_unique(participants).join(",")`,
/// deterministic regardless of input order.
pub fn compute_conversation_id(participants: &[PublicKey]) -> String {
    let mut hexes: Vec<String> = participants.iter().map(|pk| pk.to_hex()).collect();
    hexes.sort();
    hexes.dedup();
    format!("group:{}", hexes.join(","))
}

/// `parseConversationId` (spec §4.6): inverse of `compute_conversation_id`. Tolerates a
/// legacy `"group:pks:subject"` trailing segment from older caches by stripping everything
/// after the second colon.
pub fn parse_conversation_id(id: &str) -> Vec<PublicKey> {
    let Some(rest) = id.strip_prefix("group:") else {
        return Vec::new();
    };
    let pks_segment = rest.split(':').next().unwrap_or("");
    pks_segment
        .split(',')
        .filter(|s| !s.is_empty())
        .filter_map(|hex| PublicKey::from_hex(hex).ok())
        .collect()
}

/// `groupMessagesIntoConversations` (spec §4.6): bucket messages by `conversation_id`.
pub fn group_messages_into_conversations(messages: &[Message]) -> HashMap<String, Vec<Message>> {
    let mut buckets: HashMap<String, Vec<Message>> = HashMap::new();
    for message in messages {
        buckets
            .entry(message.conversation_id.clone())
            .or_default()
            .push(message.clone());
    }
    buckets
}

/// Newest-subject-wins rule (spec §4.6): iterate by `created_at` descending, the first
/// non-empty `subject` wins.
fn pick_subject(messages: &[Message]) -> String {
    let mut by_recency: Vec<&Message> = messages.iter().collect();
    by_recency.sort_by(|a, b| b.event.created_at.cmp(&a.event.created_at));
    by_recency
        .into_iter()
        .find_map(|m| m.subject.clone().filter(|s| !s.is_empty()))
        .unwrap_or_default()
}

/// Build (or rebuild) a conversation's metadata from its full, already-sorted message list
/// and the previous record (if any, to preserve `last_read_at_ms` and honour the
/// monotone-`is_known` rule across merges).
pub fn build_conversation_metadata(
    conv_id: &str,
    participant_pubkeys: &[PublicKey],
    messages: &[Message],
    my_pubkey: PublicKey,
    previous: Option<&Conversation>,
) -> Conversation {
    let is_known_now = messages.iter().any(|m| m.sender_pubkey == my_pubkey);
    let is_known = previous.map(|p| p.is_known).unwrap_or(false) || is_known_now;

    let last_activity_ms = messages
        .last()
        .map(|m| m.event.created_at.as_u64() * 1000)
        .unwrap_or(0);

    let last_message = messages
        .last()
        .map(|m| LastMessageSummary {
            snippet: if m.error.is_some() {
                None
            } else {
                Some(m.event.content.clone())
            },
            error: m.error.clone(),
            has_attachments: m.has_attachments(),
        })
        .unwrap_or_default();

    Conversation {
        id: conv_id.to_string(),
        participant_pubkeys: {
            let mut v: Vec<PublicKey> = participant_pubkeys.to_vec();
            v.sort();
            v.dedup();
            v
        },
        subject: pick_subject(messages),
        last_activity_ms,
        last_read_at_ms: previous.map(|p| p.last_read_at_ms).unwrap_or(0),
        has_nip04: messages
            .iter()
            .any(|m| m.protocol == dm_types::Protocol::Nip04),
        has_nip17: messages
            .iter()
            .any(|m| m.protocol == dm_types::Protocol::Nip17),
        is_known,
        is_request: !is_known,
        last_message,
        has_decryption_errors: messages.iter().any(|m| m.error.is_some()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pk(n: u8) -> PublicKey {
        PublicKey::from_slice(&[n; 32]).unwrap()
    }

    #[test]
    fn conversation_id_is_order_independent() {
        let a = compute_conversation_id(&[pk(1), pk(2), pk(3)]);
        let b = compute_conversation_id(&[pk(3), pk(1), pk(2)]);
        assert_eq!(a, b);
    }

    #[test]
    fn conversation_id_dedupes_participants() {
        let a = compute_conversation_id(&[pk(1), pk(1), pk(2)]);
        let b = compute_conversation_id(&[pk(1), pk(2)]);
        assert_eq!(a, b);
    }

    #[test]
    fn parse_conversation_id_round_trips() {
        let id = compute_conversation_id(&[pk(2), pk(1)]);
        let parsed = parse_conversation_id(&id);
        assert_eq!(parsed.len(), 2);
        assert!(parsed.contains(&pk(1)));
        assert!(parsed.contains(&pk(2)));
    }

    #[test]
    fn parse_conversation_id_tolerates_legacy_subject_suffix() {
        let id = compute_conversation_id(&[pk(1), pk(2)]);
        let legacy = format!("{id}:old subject");
        assert_eq!(parse_conversation_id(&legacy), parse_conversation_id(&id));
    }
}
