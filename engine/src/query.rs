//! Query executor (C4, spec §4.4). Three filter families paginated independently,
//! backwards in time, against the relay fan-out.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use dm_types::RelayHealth;
use nostr::nips::nip01::Alphabet;
use nostr::{Event, EventId, Filter, PublicKey, RelayUrl, SingleLetterTag};

use crate::traits::RelayPool;

/// Spec §5 "Backpressure": bounded batch size per filter per relay per round.
pub const BATCH_SIZE: usize = 1000;
/// Spec §5: per-relay timeout for message queries.
pub const MESSAGE_QUERY_TIMEOUT: Duration = Duration::from_secs(8);
/// Spec §5: per-relay timeout for relay-list queries.
pub const RELAY_LIST_QUERY_TIMEOUT: Duration = Duration::from_secs(5);
/// Spec §4.4 "Majority early-exit": fraction of discovery relays that must answer before
/// a relay-list query round continues without the stragglers.
pub const MAJORITY_FRACTION: f64 = 0.6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FilterFamily {
    /// F1: NIP-04 to-me.
    Nip04ToMe,
    /// F2: NIP-04 from-me.
    Nip04FromMe,
    /// F3: NIP-17 gift-wraps to-me.
    GiftWrapsToMe,
}

impl FilterFamily {
    /// `since` is Unix seconds, matching both `nostr::Timestamp` and the `created_at` values
    /// pagination re-derives `current_since` from round over round (spec §4.4).
    fn build(self, my_pubkey: PublicKey, since: Option<u64>, limit: usize) -> Filter {
        // `Filter::author` matches the event's signing key; a `#p` tag match (who a
        // gift-wrap or NIP-04 event is addressed to) needs the tag filter instead, since
        // the event's author and its addressee are unrelated fields.
        let my_hex = my_pubkey.to_hex();
        let mut filter = match self {
            FilterFamily::Nip04ToMe => Filter::new()
                .kind(dm_types::kinds::nip04_dm())
                .custom_tags(SingleLetterTag::lowercase(Alphabet::P), vec![my_hex]),
            FilterFamily::Nip04FromMe => Filter::new()
                .kind(dm_types::kinds::nip04_dm())
                .author(my_pubkey),
            FilterFamily::GiftWrapsToMe => Filter::new()
                .kind(dm_types::kinds::gift_wrap())
                .custom_tags(SingleLetterTag::lowercase(Alphabet::P), vec![my_hex]),
        };
        if let Some(since) = since {
            filter = filter.since(nostr::Timestamp::from(since));
        }
        filter = filter.limit(limit);
        filter
    }
}

#[derive(Debug, Clone, Default)]
struct FamilyProgress {
    current_since: Option<u64>,
    collected: usize,
    exhausted: bool,
}

/// Outcome of running the full batch loop (spec §4.4).
#[derive(Debug, Clone, Default)]
pub struct QueryResult {
    pub messages: Vec<Event>,
    pub limit_reached: bool,
    pub per_relay_health: HashMap<RelayUrl, RelayHealth>,
}

fn merge_relay_health(
    accum: &mut HashMap<RelayUrl, RelayHealth>,
    relay: RelayUrl,
    succeeded: bool,
    error: Option<String>,
) {
    let entry = accum.entry(relay).or_default();
    entry.last_query_succeeded = entry.last_query_succeeded || succeeded;
    if error.is_some() {
        entry.last_query_error = error;
    }
}

/// Run the batch loop (spec §4.4) across the three filter families against `relays`, for
/// `my_pubkey`, starting at `since` (None = cold start from epoch) and stopping once
/// `query_limit` total events have been collected or all families are exhausted.
pub async fn run_query_batches(
    pool: &Arc<dyn RelayPool>,
    relays: &[RelayUrl],
    my_pubkey: PublicKey,
    since: Option<u64>,
    query_limit: usize,
) -> QueryResult {
    let families = [
        FilterFamily::Nip04ToMe,
        FilterFamily::Nip04FromMe,
        FilterFamily::GiftWrapsToMe,
    ];
    let mut progress: HashMap<FilterFamily, FamilyProgress> = families
        .iter()
        .map(|f| {
            (
                *f,
                FamilyProgress {
                    current_since: since,
                    ..Default::default()
                },
            )
        })
        .collect();

    let mut seen_ids: HashSet<EventId> = HashSet::new();
    let mut collected_events: Vec<Event> = Vec::new();
    let mut per_relay_health: HashMap<RelayUrl, RelayHealth> = HashMap::new();
    let mut limit_reached = false;

    loop {
        let collected_total: usize = progress.values().map(|p| p.collected).sum();
        if collected_total >= query_limit {
            limit_reached = true;
            break;
        }
        if progress.values().all(|p| p.exhausted) {
            break;
        }

        let mut round_min_created_at: HashMap<FilterFamily, u64> = HashMap::new();
        let mut round_counts: HashMap<FilterFamily, usize> = HashMap::new();
        let mut round_limits: HashMap<FilterFamily, usize> = HashMap::new();

        for family in families {
            let state = progress.get(&family).unwrap().clone();
            if state.exhausted {
                continue;
            }
            let remaining = query_limit.saturating_sub(collected_total);
            if remaining == 0 {
                continue;
            }
            let per_relay_limit = remaining.min(BATCH_SIZE);
            round_limits.insert(family, per_relay_limit);
            let filter = family.build(my_pubkey, state.current_since, per_relay_limit);

            let futures = relays.iter().map(|relay| {
                let pool = Arc::clone(pool);
                let relay = relay.clone();
                let filter = filter.clone();
                async move {
                    let result = pool
                        .query(std::slice::from_ref(&relay), filter, MESSAGE_QUERY_TIMEOUT)
                        .await;
                    (relay, result)
                }
            });
            let results: Vec<_> = futures::future::join_all(futures).await;

            for (relay, result) in results {
                match result {
                    Ok(events) => {
                        merge_relay_health(&mut per_relay_health, relay, true, None);
                        for event in events {
                            if seen_ids.insert(event.id) {
                                let created_at = event.created_at.as_u64();
                                let min = round_min_created_at.entry(family).or_insert(created_at);
                                if created_at < *min {
                                    *min = created_at;
                                }
                                *round_counts.entry(family).or_insert(0) += 1;
                                collected_events.push(event);
                            }
                        }
                    }
                    Err(e) => {
                        merge_relay_health(&mut per_relay_health, relay, false, Some(e.to_string()));
                    }
                }
            }
        }

        for family in families {
            let entry = progress.get_mut(&family).unwrap();
            if entry.exhausted {
                continue;
            }
            let Some(&limit) = round_limits.get(&family) else {
                // Nothing left to ask for this family this round (global limit hit).
                continue;
            };
            let got = *round_counts.get(&family).unwrap_or(&0);
            entry.collected += got;
            if got < limit {
                entry.exhausted = true;
            } else if let Some(min) = round_min_created_at.get(&family) {
                entry.current_since = Some(*min);
            } else {
                entry.exhausted = true;
            }
        }
    }

    QueryResult {
        messages: collected_events,
        limit_reached,
        per_relay_health,
    }
}

/// Majority early-exit helper (spec §4.4): true once at least `MAJORITY_FRACTION` of
/// `total_relays` have reported in (success or failure).
pub fn majority_has_reported(responded: usize, total_relays: usize) -> bool {
    if total_relays == 0 {
        return true;
    }
    (responded as f64) / (total_relays as f64) >= MAJORITY_FRACTION
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn majority_threshold_is_sixty_percent() {
        assert!(!majority_has_reported(2, 5));
        assert!(majority_has_reported(3, 5));
    }

    #[test]
    fn majority_with_zero_relays_is_vacuously_true() {
        assert!(majority_has_reported(0, 0));
    }
}
