//! Send pipeline (C9, spec §4.9). NIP-04 and NIP-17 sends, attachment encryption, and the
//! outbound state machine.

use std::sync::Arc;

use dm_crypto::build_imeta_tag;
use dm_types::{kinds, EngineError, FileMetadata, Protocol};
use nostr::{Event, EventBuilder, EventId, JsonUtil, Keys, PublicKey, RelayUrl, Tag, TagKind, Timestamp};
use rand::Rng;
use tracing::warn;

use crate::traits::{PublishOutcome, RelayPool, Signer};

/// `draft → composed → encrypted → signed → publishing → published` or `→ failed`
/// (spec §4.9 "State machine: outbound message"). A `failed` message restarts from
/// `Composed` when retried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundState {
    Draft,
    Composed,
    Encrypted,
    Signed,
    Publishing,
    Published { message_id: EventId },
    Failed { reason: String },
}

/// Uniform in `[0, 2 days)`, the NIP-17 gift-wrap timestamp fuzz (spec §4.9 step 2c, §9).
fn fuzzed_created_at(now: Timestamp, fuzz_days: u64) -> Timestamp {
    let max_backdate_secs = fuzz_days * 86_400;
    let backdate = rand::thread_rng().gen_range(0..=max_backdate_secs);
    Timestamp::from(now.as_u64().saturating_sub(backdate))
}

fn imeta_tags(attachments: &[FileMetadata]) -> Vec<Tag> {
    attachments.iter().map(build_imeta_tag).collect()
}

/// NIP-04 send (spec §4.9 "NIP-04 send"). Publishes to the union of sender and recipient
/// inbox relays; the caller supplies that already-resolved relay set.
pub async fn send_nip04(
    signer: &Arc<dyn Signer>,
    pool: &Arc<dyn RelayPool>,
    recipient: PublicKey,
    plaintext: &str,
    attachments: &[FileMetadata],
    relays: &[RelayUrl],
) -> Result<(EventId, Vec<PublishOutcome>), EngineError> {
    let ciphertext = signer
        .nip04_encrypt(&recipient, plaintext)
        .await
        .map_err(|e| EngineError::SignerUnavailable(e.to_string()))?;

    let mut tags = vec![Tag::public_key(recipient)];
    tags.extend(imeta_tags(attachments));

    let unsigned = EventBuilder::new(kinds::nip04_dm(), ciphertext)
        .tags(tags)
        .build(signer.public_key());

    let signed = signer
        .sign_event(unsigned)
        .await
        .map_err(|e| EngineError::SignerUnavailable(e.to_string()))?;

    let outcomes = pool.publish(relays, &signed).await;
    Ok((signed.id, outcomes))
}

/// Build one recipient's seal + gift-wrap pair for a NIP-17 send (spec §4.9 steps 2a–2c).
/// The seal is authored by the real signer; the gift-wrap is signed by a freshly generated
/// ephemeral key so the outer envelope never reveals who sent it.
async fn build_gift_wrap_for_recipient(
    signer: &Arc<dyn Signer>,
    rumor_json: &str,
    recipient: PublicKey,
    now: Timestamp,
    fuzz_days: u64,
) -> Result<Event, EngineError> {
    let seal_content = signer
        .nip44_encrypt(&recipient, rumor_json)
        .await
        .map_err(|e| EngineError::SignerUnavailable(e.to_string()))?;
    let seal_unsigned = EventBuilder::new(kinds::seal(), seal_content)
        .custom_created_at(now)
        .build(signer.public_key());
    let seal = signer
        .sign_event(seal_unsigned)
        .await
        .map_err(|e| EngineError::SignerUnavailable(e.to_string()))?;
    let seal_json = seal.as_json();

    let ephemeral = Keys::generate();
    let wrap_content = nostr::nips::nip44::encrypt(
        ephemeral.secret_key(),
        &recipient,
        seal_json.as_str(),
        nostr::nips::nip44::Version::V2,
    )
    .map_err(|e| EngineError::MalformedEvent(e.to_string()))?;

    let gift_wrap_created_at = fuzzed_created_at(now, fuzz_days);
    let gift_wrap = EventBuilder::new(kinds::gift_wrap(), wrap_content)
        .tags(vec![Tag::public_key(recipient)])
        .custom_created_at(gift_wrap_created_at)
        .sign_with_keys(&ephemeral)
        .map_err(|e| EngineError::MalformedEvent(e.to_string()))?;

    Ok(gift_wrap)
}

/// NIP-17 send (spec §4.9 "NIP-17 send"). Supports group chats: one seal + gift-wrap pair
/// per distinct recipient, including self so the sender's own client can sync the sent
/// message. `kind` is 15 (file) if `attachments` is non-empty, else 14 (text).
pub async fn send_nip17(
    signer: &Arc<dyn Signer>,
    pool: &Arc<dyn RelayPool>,
    recipients: &[PublicKey],
    plaintext: &str,
    subject: Option<&str>,
    attachments: &[FileMetadata],
    relays_by_recipient: &std::collections::HashMap<PublicKey, Vec<RelayUrl>>,
    fuzz_days: u64,
) -> Result<EventId, EngineError> {
    let my_pubkey = signer.public_key();
    let kind = if attachments.is_empty() {
        kinds::rumor_text()
    } else {
        kinds::rumor_file()
    };

    let mut distinct_recipients: Vec<PublicKey> = recipients.to_vec();
    if !distinct_recipients.contains(&my_pubkey) {
        distinct_recipients.push(my_pubkey);
    }
    distinct_recipients.sort();
    distinct_recipients.dedup();

    let mut tags: Vec<Tag> = distinct_recipients
        .iter()
        .filter(|pk| **pk != my_pubkey)
        .map(|pk| Tag::public_key(*pk))
        .collect();
    if let Some(subject) = subject {
        if !subject.is_empty() {
            tags.push(Tag::custom(TagKind::custom("subject"), vec![subject.to_string()]));
        }
    }
    tags.extend(imeta_tags(attachments));

    let now = Timestamp::now();
    let rumor = EventBuilder::new(kind, plaintext)
        .tags(tags)
        .custom_created_at(now)
        .build(my_pubkey);
    let rumor_json = rumor.as_json();

    let mut self_gift_wrap_id: Option<EventId> = None;
    let mut any_other_succeeded = false;
    let mut any_other_attempted = false;
    let empty_relays: Vec<RelayUrl> = Vec::new();

    for recipient in &distinct_recipients {
        let gift_wrap = match build_gift_wrap_for_recipient(signer, &rumor_json, *recipient, now, fuzz_days).await {
            Ok(g) => g,
            Err(e) => {
                warn!(recipient = %recipient, error = %e, "failed to build gift-wrap");
                if *recipient != my_pubkey {
                    any_other_attempted = true;
                }
                continue;
            }
        };

        let recipient_relays = relays_by_recipient.get(recipient).unwrap_or(&empty_relays);
        let outcomes = pool.publish(recipient_relays, &gift_wrap).await;
        let succeeded = outcomes.iter().any(|o| o.ok);

        if *recipient == my_pubkey {
            self_gift_wrap_id = Some(gift_wrap.id);
        } else {
            any_other_attempted = true;
            any_other_succeeded = any_other_succeeded || succeeded;
        }
    }

    if any_other_attempted && !any_other_succeeded {
        return Err(EngineError::NotDelivered);
    }

    self_gift_wrap_id.ok_or(EngineError::NotDelivered)
}

/// Track one message through the outbound state machine, driving the send functions above
/// and translating failures into `OutboundState::Failed`.
pub struct OutboundMessage {
    pub state: OutboundState,
    pub conversation_id: String,
    pub protocol: Protocol,
}

impl OutboundMessage {
    pub fn new_draft(conversation_id: String, protocol: Protocol) -> Self {
        Self {
            state: OutboundState::Draft,
            conversation_id,
            protocol,
        }
    }

    pub fn mark_composed(&mut self) {
        self.state = OutboundState::Composed;
    }

    pub fn mark_encrypted(&mut self) {
        self.state = OutboundState::Encrypted;
    }

    pub fn mark_signed(&mut self) {
        self.state = OutboundState::Signed;
    }

    pub fn mark_publishing(&mut self) {
        self.state = OutboundState::Publishing;
    }

    pub fn mark_published(&mut self, message_id: EventId) {
        self.state = OutboundState::Published { message_id };
    }

    pub fn mark_failed(&mut self, reason: String) {
        self.state = OutboundState::Failed { reason };
    }

    /// Restart a failed send from `Composed` (spec §4.9 "may be retried by user, which
    /// restarts from `composed`").
    pub fn retry(&mut self) {
        if matches!(self.state, OutboundState::Failed { .. }) {
            self.state = OutboundState::Composed;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fuzzed_created_at_never_exceeds_window_or_now() {
        let now = Timestamp::from(1_000_000u64);
        for _ in 0..100 {
            let t = fuzzed_created_at(now, 2);
            assert!(t.as_u64() <= now.as_u64());
            assert!(t.as_u64() >= now.as_u64() - 2 * 86_400);
        }
    }

    #[test]
    fn retry_only_transitions_from_failed() {
        let mut msg = OutboundMessage::new_draft("group:abc".to_string(), Protocol::Nip17);
        msg.retry();
        assert_eq!(msg.state, OutboundState::Draft);
        msg.mark_failed("boom".to_string());
        msg.retry();
        assert_eq!(msg.state, OutboundState::Composed);
    }
}
