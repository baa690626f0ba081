//! Participant registry (C2, spec §4.2).

use std::collections::HashMap;

use dm_types::participant::{Participant, ParticipantRegistry, RelayListsResult, RelayMode};
use nostr::{PublicKey, RelayUrl};

use crate::relay_sets::resolve_relays;

/// `buildParticipant` (spec §4.2): apply C1 to one participant's raw relay lists.
pub fn build_participant(
    pubkey: PublicKey,
    lists: &RelayListsResult,
    mode: RelayMode,
    discovery: &[RelayUrl],
    now_ms: u64,
) -> Participant {
    let resolved = resolve_relays(
        mode,
        discovery,
        lists.outbox.as_ref(),
        lists.dm_inbox.as_ref(),
        lists.blocked.as_ref(),
    );
    Participant {
        pubkey,
        derived_relays: resolved.derived,
        blocked_relays: resolved.blocked,
        last_fetched_ms: now_ms,
    }
}

/// `buildParticipantsMap` (spec §4.2): bulk form of `build_participant`.
pub fn build_participants_map(
    pubkeys: &[PublicKey],
    lists_by_pubkey: &HashMap<PublicKey, RelayListsResult>,
    mode: RelayMode,
    discovery: &[RelayUrl],
    now_ms: u64,
) -> ParticipantRegistry {
    let empty = RelayListsResult::default();
    pubkeys
        .iter()
        .map(|pk| {
            let lists = lists_by_pubkey.get(pk).unwrap_or(&empty);
            (*pk, build_participant(*pk, lists, mode, discovery, now_ms))
        })
        .collect()
}

/// `mergeParticipants` (spec §4.2): shallow merge, `incoming` wins per key, whole-record
/// replacement rather than a field-by-field merge.
pub fn merge_participants(
    base: &ParticipantRegistry,
    incoming: &ParticipantRegistry,
) -> ParticipantRegistry {
    let mut merged = base.clone();
    for (pk, participant) in incoming {
        merged.insert(*pk, participant.clone());
    }
    merged
}

/// `getStaleParticipants` (spec §4.2): pubkeys whose `lastFetched` is older than `ttl_ms`.
pub fn get_stale_participants(
    registry: &ParticipantRegistry,
    ttl_ms: u64,
    now_ms: u64,
) -> Vec<PublicKey> {
    if registry.is_empty() {
        return Vec::new();
    }
    registry
        .values()
        .filter(|p| now_ms.saturating_sub(p.last_fetched_ms) > ttl_ms)
        .map(|p| p.pubkey)
        .collect()
}

/// `getNewPubkeys` (spec §4.2): set-difference of `found` against `existing`, preserving
/// the order of `found` and deduplicating.
pub fn get_new_pubkeys(found: &[PublicKey], existing: &ParticipantRegistry) -> Vec<PublicKey> {
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::new();
    for pk in found {
        if existing.contains_key(pk) || !seen.insert(*pk) {
            continue;
        }
        out.push(*pk);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pk(n: u8) -> PublicKey {
        let bytes = [n; 32];
        PublicKey::from_slice(&bytes).unwrap()
    }

    #[test]
    fn build_participants_map_stamps_last_fetched() {
        let pubkeys = vec![pk(1), pk(2)];
        let lists = HashMap::new();
        let registry = build_participants_map(&pubkeys, &lists, RelayMode::Discovery, &[], 42);
        assert_eq!(registry.len(), 2);
        assert!(registry.values().all(|p| p.last_fetched_ms == 42));
    }

    #[test]
    fn merge_participants_lets_incoming_win_whole_record() {
        let mut base = ParticipantRegistry::new();
        base.insert(
            pk(1),
            Participant {
                pubkey: pk(1),
                derived_relays: vec![RelayUrl::parse("wss://old.example").unwrap()],
                blocked_relays: vec![],
                last_fetched_ms: 1,
            },
        );
        let mut incoming = ParticipantRegistry::new();
        incoming.insert(pk(1), Participant::new(pk(1), 99));

        let merged = merge_participants(&base, &incoming);
        let p = &merged[&pk(1)];
        assert_eq!(p.last_fetched_ms, 99);
        assert!(p.derived_relays.is_empty());
    }

    #[test]
    fn stale_participants_respects_ttl() {
        let mut reg = ParticipantRegistry::new();
        reg.insert(pk(1), Participant::new(pk(1), 0));
        reg.insert(pk(2), Participant::new(pk(2), 900));
        let stale = get_stale_participants(&reg, 500, 1000);
        assert_eq!(stale, vec![pk(1)]);
    }

    #[test]
    fn stale_participants_early_exit_on_empty_registry() {
        let reg = ParticipantRegistry::new();
        assert!(get_stale_participants(&reg, 500, 1000).is_empty());
    }

    #[test]
    fn new_pubkeys_excludes_existing_and_dedupes_preserving_order() {
        let mut existing = ParticipantRegistry::new();
        existing.insert(pk(1), Participant::new(pk(1), 0));
        let found = vec![pk(2), pk(1), pk(3), pk(2)];
        assert_eq!(get_new_pubkeys(&found, &existing), vec![pk(2), pk(3)]);
    }
}
