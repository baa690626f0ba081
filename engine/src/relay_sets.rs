//! Relay-set resolver (C1, spec §4.1). Pure and deterministic: given one participant's
//! three relay-list events and a mode, derive the relays we should query for them.

use dm_types::participant::RelayMode;
use nostr::{Event, RelayUrl};

/// Output of resolving one participant's relay lists.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedRelays {
    pub derived: Vec<RelayUrl>,
    pub blocked: Vec<RelayUrl>,
}

fn blocked_relays(blocked_list: Option<&Event>) -> Vec<RelayUrl> {
    let Some(event) = blocked_list else {
        return Vec::new();
    };
    let mut out = Vec::new();
    for tag in event.tags.iter() {
        let values = tag.clone().to_vec();
        if values.len() < 2 || values[0] != "r" {
            continue;
        }
        let trimmed = values[1].trim();
        if trimmed.is_empty() {
            continue;
        }
        let Ok(url) = RelayUrl::parse(trimmed) else {
            continue;
        };
        if !out.contains(&url) {
            out.push(url);
        }
    }
    out
}

/// Priority-1 entries: every `("relay", url)` tag on the DM inbox list (kind 10050).
fn dm_inbox_relays(dm_inbox: Option<&Event>) -> Vec<RelayUrl> {
    let Some(event) = dm_inbox else {
        return Vec::new();
    };
    let mut out = Vec::new();
    for tag in event.tags.iter() {
        let values = tag.clone().to_vec();
        if values.len() < 2 || values[0] != "relay" {
            continue;
        }
        let Ok(url) = RelayUrl::parse(values[1].trim()) else {
            continue;
        };
        if !out.contains(&url) {
            out.push(url);
        }
    }
    out
}

/// Priority-2 entries: `("r", url, marker?)` tags on the outbox list (kind 10002) that are
/// inbox-capable, i.e. marker is absent or `"read"`.
fn outbox_read_relays(outbox: Option<&Event>) -> Vec<RelayUrl> {
    let Some(event) = outbox else {
        return Vec::new();
    };
    let mut out = Vec::new();
    for tag in event.tags.iter() {
        let values = tag.clone().to_vec();
        if values.len() < 2 || values[0] != "r" {
            continue;
        }
        let marker = values.get(2).map(|s| s.as_str());
        if !matches!(marker, None | Some("read")) {
            continue;
        }
        let Ok(url) = RelayUrl::parse(values[1].trim()) else {
            continue;
        };
        if !out.contains(&url) {
            out.push(url);
        }
    }
    out
}

/// Resolve one participant's derived and blocked relay sets (spec §4.1). `discovery` is
/// the caller's global discovery relay list, consulted only outside `discovery` mode or
/// as a hybrid fallback.
pub fn resolve_relays(
    mode: RelayMode,
    discovery: &[RelayUrl],
    outbox: Option<&Event>,
    dm_inbox: Option<&Event>,
    blocked_list: Option<&Event>,
) -> ResolvedRelays {
    let blocked = blocked_relays(blocked_list);

    if mode == RelayMode::Discovery {
        return ResolvedRelays {
            derived: discovery.to_vec(),
            blocked,
        };
    }

    let mut derived = Vec::new();
    let priority1 = dm_inbox_relays(dm_inbox);
    let used_priority1 = !priority1.is_empty();
    for url in priority1 {
        if !derived.contains(&url) {
            derived.push(url);
        }
    }

    if !used_priority1 || mode == RelayMode::Hybrid {
        for url in outbox_read_relays(outbox) {
            if !derived.contains(&url) {
                derived.push(url);
            }
        }
    }

    if mode == RelayMode::Hybrid {
        for url in discovery {
            if !derived.contains(url) {
                derived.push(url.clone());
            }
        }
    }

    ResolvedRelays { derived, blocked }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nostr::{EventBuilder, Keys, Tag, TagKind};

    fn relay_list_event(keys: &Keys, kind: u16, tags: Vec<Tag>) -> Event {
        EventBuilder::new(nostr::Kind::Custom(kind), "")
            .tags(tags)
            .sign_with_keys(keys)
            .unwrap()
    }

    fn r_tag(url: &str, marker: Option<&str>) -> Tag {
        let mut values = vec!["r".to_string(), url.to_string()];
        if let Some(m) = marker {
            values.push(m.to_string());
        }
        Tag::custom(TagKind::Custom("r".into()), values)
    }

    fn relay_tag(url: &str) -> Tag {
        Tag::custom(TagKind::Custom("relay".into()), vec![url.to_string()])
    }

    #[test]
    fn discovery_mode_returns_discovery_list_unchanged() {
        let discovery = vec![RelayUrl::parse("wss://d.example").unwrap()];
        let resolved = resolve_relays(RelayMode::Discovery, &discovery, None, None, None);
        assert_eq!(resolved.derived, discovery);
        assert!(resolved.blocked.is_empty());
    }

    #[test]
    fn hybrid_prefers_dm_inbox_then_appends_outbox_and_discovery() {
        let keys = Keys::generate();
        let dm_inbox = relay_list_event(&keys, 10050, vec![relay_tag("wss://inbox.example")]);
        let outbox = relay_list_event(
            &keys,
            10002,
            vec![r_tag("wss://out-read.example", None), r_tag("wss://out-write.example", Some("write"))],
        );
        let discovery = vec![RelayUrl::parse("wss://disco.example").unwrap()];

        let resolved = resolve_relays(
            RelayMode::Hybrid,
            &discovery,
            Some(&outbox),
            Some(&dm_inbox),
            None,
        );

        assert_eq!(
            resolved.derived,
            vec![
                RelayUrl::parse("wss://inbox.example").unwrap(),
                RelayUrl::parse("wss://out-read.example").unwrap(),
                RelayUrl::parse("wss://disco.example").unwrap(),
            ]
        );
    }

    #[test]
    fn strict_outbox_falls_back_to_outbox_when_dm_inbox_is_empty() {
        let keys = Keys::generate();
        let outbox = relay_list_event(&keys, 10002, vec![r_tag("wss://out-read.example", None)]);
        let discovery = vec![RelayUrl::parse("wss://disco.example").unwrap()];

        let resolved =
            resolve_relays(RelayMode::StrictOutbox, &discovery, Some(&outbox), None, None);

        assert_eq!(resolved.derived, vec![RelayUrl::parse("wss://out-read.example").unwrap()]);
    }

    #[test]
    fn strict_outbox_skips_outbox_when_dm_inbox_present() {
        let keys = Keys::generate();
        let dm_inbox = relay_list_event(&keys, 10050, vec![relay_tag("wss://inbox.example")]);
        let outbox = relay_list_event(&keys, 10002, vec![r_tag("wss://out-read.example", None)]);

        let resolved = resolve_relays(
            RelayMode::StrictOutbox,
            &[],
            Some(&outbox),
            Some(&dm_inbox),
            None,
        );

        assert_eq!(resolved.derived, vec![RelayUrl::parse("wss://inbox.example").unwrap()]);
    }

    #[test]
    fn blocked_relays_are_reported_but_not_subtracted() {
        let keys = Keys::generate();
        let dm_inbox = relay_list_event(&keys, 10050, vec![relay_tag("wss://inbox.example")]);
        let blocked = relay_list_event(&keys, 10006, vec![r_tag("wss://inbox.example", None)]);

        let resolved = resolve_relays(
            RelayMode::Hybrid,
            &[],
            None,
            Some(&dm_inbox),
            Some(&blocked),
        );

        assert!(resolved.derived.contains(&RelayUrl::parse("wss://inbox.example").unwrap()));
        assert_eq!(resolved.blocked, vec![RelayUrl::parse("wss://inbox.example").unwrap()]);
    }

    #[test]
    fn malformed_tags_are_silently_skipped() {
        let keys = Keys::generate();
        let dm_inbox = relay_list_event(
            &keys,
            10050,
            vec![Tag::custom(TagKind::Custom("relay".into()), vec!["not a url".to_string()])],
        );
        let resolved = resolve_relays(RelayMode::Hybrid, &[], None, Some(&dm_inbox), None);
        assert!(resolved.derived.is_empty());
    }
}
