//! Decryption pipeline (C5, spec §4.5). Dispatches on event kind; a failure on one event
//! never aborts the batch — it is folded into a placeholder `Message` carrying `error`.

use std::sync::Arc;

use dm_crypto::{parse_imeta_tags, parse_legacy_flat_tags};
use dm_types::{kinds, Message, Protocol};
use nostr::{Event, JsonUtil, PublicKey, UnsignedEvent};

use crate::conversations::compute_conversation_id;
use crate::traits::Signer;

const UNABLE_TO_DECRYPT: &str = "Unable to decrypt";

fn p_tag_values(event: &Event) -> Vec<PublicKey> {
    event
        .tags
        .iter()
        .filter_map(|t| {
            let v = t.clone().to_vec();
            if v.len() >= 2 && v[0] == "p" {
                PublicKey::from_hex(&v[1]).ok()
            } else {
                None
            }
        })
        .collect()
}

fn first_subject(tags: &nostr::Tags) -> Option<String> {
    tags.iter().find_map(|t| {
        let v = t.clone().to_vec();
        if v.len() >= 2 && v[0] == "subject" {
            Some(v[1].clone())
        } else {
            None
        }
    })
}

fn error_message(raw: &Event, conversation_id: String, protocol: Protocol, error: &str) -> Message {
    Message {
        id: raw.id,
        event: UnsignedEvent::new(raw.pubkey, raw.created_at, raw.kind, raw.tags.to_vec(), raw.content.clone()),
        conversation_id,
        protocol,
        sender_pubkey: raw.pubkey,
        subject: None,
        error: Some(error.to_string()),
        gift_wrap_id: None,
        seal_event: None,
        gift_wrap_event: Some(raw.clone()),
        file_metadata: Vec::new(),
    }
}

/// Decrypt a single `kind = 4` NIP-04 event (spec §4.5). Peer is the `p`-tag when self is
/// the author, else the outer event's author.
pub async fn decrypt_nip04(signer: &Arc<dyn Signer>, raw: &Event) -> Message {
    let my_pubkey = signer.public_key();
    let p_tags = p_tag_values(raw);
    let peer = if raw.pubkey == my_pubkey {
        p_tags.first().copied()
    } else {
        Some(raw.pubkey)
    };

    let participants: Vec<PublicKey> = std::iter::once(raw.pubkey).chain(p_tags.iter().copied()).collect();
    let conversation_id = compute_conversation_id(&participants);

    let Some(peer) = peer else {
        return error_message(raw, conversation_id, Protocol::Nip04, UNABLE_TO_DECRYPT);
    };

    match signer.nip04_decrypt(&peer, &raw.content).await {
        Ok(plaintext) => Message {
            id: raw.id,
            event: UnsignedEvent::new(raw.pubkey, raw.created_at, raw.kind, raw.tags.to_vec(), plaintext),
            conversation_id,
            protocol: Protocol::Nip04,
            sender_pubkey: raw.pubkey,
            subject: None,
            error: None,
            gift_wrap_id: None,
            seal_event: None,
            gift_wrap_event: Some(raw.clone()),
            file_metadata: Vec::new(),
        },
        Err(_) => error_message(raw, conversation_id, Protocol::Nip04, UNABLE_TO_DECRYPT),
    }
}

/// Decrypt a single `kind = 1059` NIP-17 gift-wrap (spec §4.5). Unwraps gift-wrap → seal
/// → rumor, verifying the kind at each layer, and parses attached file metadata for
/// kind-15 rumors.
pub async fn decrypt_nip17(signer: &Arc<dyn Signer>, gift_wrap: &Event) -> Message {
    let fallback_conversation_id = compute_conversation_id(&[gift_wrap.pubkey]);

    let seal_json = match signer.nip44_decrypt(&gift_wrap.pubkey, &gift_wrap.content).await {
        Ok(s) => s,
        Err(_) => return error_message(gift_wrap, fallback_conversation_id, Protocol::Nip17, UNABLE_TO_DECRYPT),
    };
    let seal: Event = match Event::from_json(&seal_json) {
        Ok(e) if e.kind == kinds::seal() => e,
        _ => {
            return error_message(
                gift_wrap,
                fallback_conversation_id,
                Protocol::Nip17,
                "malformed seal envelope",
            )
        }
    };

    let rumor_json = match signer.nip44_decrypt(&seal.pubkey, &seal.content).await {
        Ok(r) => r,
        Err(_) => {
            return with_envelopes(
                error_message(gift_wrap, fallback_conversation_id, Protocol::Nip17, UNABLE_TO_DECRYPT),
                Some(seal),
                gift_wrap,
            )
        }
    };
    let rumor: UnsignedEvent = match UnsignedEvent::from_json(&rumor_json) {
        Ok(u) if u.kind == kinds::rumor_text() || u.kind == kinds::rumor_file() => u,
        _ => {
            return with_envelopes(
                error_message(
                    gift_wrap,
                    fallback_conversation_id,
                    Protocol::Nip17,
                    "malformed rumor envelope",
                ),
                Some(seal),
                gift_wrap,
            )
        }
    };

    let p_tags = p_tag_values_unsigned(&rumor);
    let participants: Vec<PublicKey> = std::iter::once(seal.pubkey).chain(p_tags.into_iter()).collect();
    let conversation_id = compute_conversation_id(&participants);
    let subject = first_subject(&rumor.tags);

    let file_metadata = if rumor.kind == kinds::rumor_file() {
        let from_imeta = parse_imeta_tags(&rumor.tags.to_vec());
        if !from_imeta.is_empty() {
            from_imeta
        } else {
            parse_legacy_flat_tags(&rumor.tags.to_vec()).into_iter().collect()
        }
    } else {
        Vec::new()
    };

    Message {
        id: gift_wrap.id,
        event: rumor,
        conversation_id,
        protocol: Protocol::Nip17,
        sender_pubkey: seal.pubkey,
        subject,
        error: None,
        gift_wrap_id: Some(gift_wrap.id),
        seal_event: Some(UnsignedEvent::new(
            seal.pubkey,
            seal.created_at,
            seal.kind,
            seal.tags.to_vec(),
            seal.content.clone(),
        )),
        gift_wrap_event: Some(gift_wrap.clone()),
        file_metadata,
    }
}

fn p_tag_values_unsigned(event: &UnsignedEvent) -> Vec<PublicKey> {
    event
        .tags
        .iter()
        .filter_map(|t| {
            let v = t.clone().to_vec();
            if v.len() >= 2 && v[0] == "p" {
                PublicKey::from_hex(&v[1]).ok()
            } else {
                None
            }
        })
        .collect()
}

fn with_envelopes(mut message: Message, seal: Option<Event>, gift_wrap: &Event) -> Message {
    message.seal_event = seal.map(|s| {
        UnsignedEvent::new(s.pubkey, s.created_at, s.kind, s.tags.to_vec(), s.content.clone())
    });
    message.gift_wrap_event = Some(gift_wrap.clone());
    message.gift_wrap_id = Some(gift_wrap.id);
    message.id = gift_wrap.id;
    message
}

/// Dispatch a raw relay event to the NIP-04 or NIP-17 pipeline by kind. Events of any
/// other kind are dropped by the caller before reaching here (spec §7 `MalformedEvent`).
pub async fn decrypt_event(signer: &Arc<dyn Signer>, raw: &Event) -> Option<Message> {
    if raw.kind == kinds::nip04_dm() {
        Some(decrypt_nip04(signer, raw).await)
    } else if raw.kind == kinds::gift_wrap() {
        Some(decrypt_nip17(signer, raw).await)
    } else {
        None
    }
}
