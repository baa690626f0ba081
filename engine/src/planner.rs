//! Fetch planner (C3, spec §4.3). Pure functions deciding *what* to ask *where*, consulting
//! only the current state — no I/O.

use std::collections::{HashMap, HashSet};

use dm_types::participant::{ParticipantRegistry, RelayMode};
use nostr::{PublicKey, RelayUrl};

/// `computeSinceTimestamp` (spec §4.3): for a warm start, pull `since` back by the NIP-17
/// fuzz window so messages backdated by the sender's timestamp fuzzing aren't missed.
/// Cold start (`last_cache_time == None`) fetches from the epoch.
pub fn compute_since_timestamp(last_cache_time_ms: Option<u64>, fuzz_days: u64) -> Option<u64> {
    let last_cache_time_ms = last_cache_time_ms?;
    let fuzz_seconds = fuzz_days * 86_400;
    Some(last_cache_time_ms.saturating_sub(fuzz_seconds))
}

/// `buildRelayToUsersMap` (spec §4.3): invert the participant registry.
pub fn build_relay_to_users_map(
    participants: &ParticipantRegistry,
) -> HashMap<RelayUrl, Vec<PublicKey>> {
    let mut map: HashMap<RelayUrl, Vec<PublicKey>> = HashMap::new();
    for participant in participants.values() {
        for relay in &participant.derived_relays {
            let users = map.entry(relay.clone()).or_default();
            if !users.contains(&participant.pubkey) {
                users.push(participant.pubkey);
            }
        }
    }
    map
}

/// `filterNewRelayUserCombos` (spec §4.3): relays not already queried this session.
pub fn filter_new_relay_user_combos(
    relay_to_users: &HashMap<RelayUrl, Vec<PublicKey>>,
    already_queried: &HashSet<RelayUrl>,
) -> Vec<RelayUrl> {
    relay_to_users
        .keys()
        .filter(|url| !already_queried.contains(*url))
        .cloned()
        .collect()
}

/// `computeAllQueriedRelays` (spec §4.3): union of everything queried so far this session
/// (prior cache, the initial derived set, and any newly discovered relays). `mode` is
/// accepted for parity with the spec signature; the union itself doesn't depend on it.
pub fn compute_all_queried_relays(
    _mode: RelayMode,
    prior_cache: &HashSet<RelayUrl>,
    initial_relays: &[RelayUrl],
    new_relays: &[RelayUrl],
) -> HashSet<RelayUrl> {
    let mut all: HashSet<RelayUrl> = prior_cache.clone();
    all.extend(initial_relays.iter().cloned());
    all.extend(new_relays.iter().cloned());
    all
}

/// `extractNewPubkeys` (spec §4.3): participants referenced by decrypted messages that
/// aren't yet in the registry, excluding self, preserving first-seen order.
pub fn extract_new_pubkeys(
    decrypted_participant_refs: &[PublicKey],
    existing: &ParticipantRegistry,
    my_pubkey: PublicKey,
) -> Vec<PublicKey> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for pk in decrypted_participant_refs {
        if *pk == my_pubkey || existing.contains_key(pk) || !seen.insert(*pk) {
            continue;
        }
        out.push(*pk);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use dm_types::participant::Participant;

    fn pk(n: u8) -> PublicKey {
        PublicKey::from_slice(&[n; 32]).unwrap()
    }

    fn relay(s: &str) -> RelayUrl {
        RelayUrl::parse(s).unwrap()
    }

    #[test]
    fn cold_start_has_no_since() {
        assert_eq!(compute_since_timestamp(None, 2), None);
    }

    #[test]
    fn warm_start_pulls_back_by_fuzz_window() {
        let since = compute_since_timestamp(Some(1_700_000_000), 2).unwrap();
        assert_eq!(since, 1_699_827_200);
    }

    #[test]
    fn relay_to_users_map_inverts_registry() {
        let mut reg = ParticipantRegistry::new();
        let mut p = Participant::new(pk(1), 0);
        p.derived_relays = vec![relay("wss://a.example"), relay("wss://b.example")];
        reg.insert(pk(1), p);
        let map = build_relay_to_users_map(&reg);
        assert_eq!(map.len(), 2);
        assert_eq!(map[&relay("wss://a.example")], vec![pk(1)]);
    }

    #[test]
    fn filter_new_relay_user_combos_excludes_already_queried() {
        let mut map = HashMap::new();
        map.insert(relay("wss://a.example"), vec![pk(1)]);
        map.insert(relay("wss://b.example"), vec![pk(2)]);
        let mut already = HashSet::new();
        already.insert(relay("wss://a.example"));
        let new = filter_new_relay_user_combos(&map, &already);
        assert_eq!(new, vec![relay("wss://b.example")]);
    }

    #[test]
    fn extract_new_pubkeys_excludes_self_and_existing() {
        let me = pk(0);
        let mut existing = ParticipantRegistry::new();
        existing.insert(pk(1), Participant::new(pk(1), 0));
        let refs = vec![pk(1), pk(2), me, pk(2)];
        assert_eq!(extract_new_pubkeys(&refs, &existing, me), vec![pk(2)]);
    }
}
