//! End-to-end encrypted direct-messaging engine core. Ties together the relay-set
//! resolver (C1), participant registry (C2), fetch planner (C3), query executor (C4),
//! decryption pipeline (C5), conversation grouper (C6), state store (C7), real-time
//! subscriber (C8), send pipeline (C9) and media blob cache (C10) behind one
//! `MessagingEngine` facade (spec §2, §6).

pub mod config;
pub mod conversations;
pub mod decrypt;
pub mod planner;
pub mod query;
pub mod registry;
pub mod relay_sets;
pub mod send;
pub mod subscriber;
pub mod traits;

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use dm_crypto::{decrypt_attachment, encrypt_attachment};
use dm_store::{
    load_from_cache, merge_messaging_state, save_to_cache, settings_fingerprint, CacheError,
    KvStore, MediaBlobCache, DM_CACHE_STORE,
};
use dm_types::{
    kinds, participant::RelayListsResult, EngineError, FileEncryption, FileMetadata,
    MessagingState, Protocol,
};
use nostr::{Filter, PublicKey, RelayUrl};
use tokio::sync::{watch, Mutex};
use tracing::{info, warn};

pub use config::EngineConfig;
pub use traits::{BlobHost, BlobHostError, PublishOutcome, RelayPool, RelayPoolError, Signer, SignerError};

fn fingerprint_key(pubkey: &PublicKey) -> String {
    format!("dm-settings-fingerprint:{}", pubkey.to_hex())
}

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// One relay's resolved user list for a conversation, as surfaced to the UI (spec §6
/// `getConversationRelays`).
#[derive(Debug, Clone)]
pub struct RelayUserEntry {
    pub pubkey: PublicKey,
    pub is_current_user: bool,
    pub source: &'static str,
}

#[derive(Debug, Clone)]
pub struct ConversationRelay {
    pub relay: RelayUrl,
    pub users: Vec<RelayUserEntry>,
}

/// A composed outbound send request (spec §6 `send`).
pub struct SendRequest<'a> {
    pub conversation_id: &'a str,
    pub plaintext: &'a str,
    pub protocol: Protocol,
    pub subject: Option<&'a str>,
    pub attachments: Vec<PlaintextAttachment>,
}

/// Caller-supplied raw bytes for an outbound attachment; the engine encrypts and uploads
/// it (spec §4.9 "Attachment encryption").
pub struct PlaintextAttachment {
    pub bytes: Vec<u8>,
    pub mime_type: String,
    pub name: Option<String>,
}

/// The messaging runtime: owns the single `MessagingState`, the embedded KV store, and the
/// collaborators injected by the host application (spec §5 "single-writer").
pub struct MessagingEngine {
    my_pubkey: PublicKey,
    config: EngineConfig,
    kv: KvStore,
    signer: Arc<dyn Signer>,
    pool: Arc<dyn RelayPool>,
    blob_host: Arc<dyn BlobHost>,
    state: Mutex<MessagingState>,
    state_tx: watch::Sender<MessagingState>,
}

impl MessagingEngine {
    /// Open (or create) the per-identity KV store at `kv_path` and construct the runtime.
    /// Does not run bootstrap — call `bootstrap()` once the host is ready to go online.
    pub fn open(
        kv_path: &Path,
        config: EngineConfig,
        signer: Arc<dyn Signer>,
        pool: Arc<dyn RelayPool>,
        blob_host: Arc<dyn BlobHost>,
    ) -> Result<Self, EngineError> {
        let kv = KvStore::open_or_create(kv_path)
            .map_err(|e| EngineError::CacheCorrupt(e.to_string()))?;
        let my_pubkey = signer.public_key();
        let (state_tx, _rx) = watch::channel(MessagingState::new());
        Ok(Self {
            my_pubkey,
            config,
            kv,
            signer,
            pool,
            blob_host,
            state: Mutex::new(MessagingState::new()),
            state_tx,
        })
    }

    /// `getState` (spec §6): a snapshot of the current state.
    pub async fn get_state(&self) -> MessagingState {
        self.state.lock().await.clone()
    }

    /// `subscribeState` (spec §6): fires on every state transition.
    pub fn subscribe_state(&self) -> watch::Receiver<MessagingState> {
        self.state_tx.subscribe()
    }

    async fn publish_state(&self, state: &MessagingState) {
        let _ = self.state_tx.send(state.clone());
    }

    /// `getConversationRelays` (spec §6): the relay fan-out for one conversation, with the
    /// participant(s) reachable at each relay.
    pub async fn get_conversation_relays(&self, conv_id: &str) -> Vec<ConversationRelay> {
        let state = self.state.lock().await;
        let Some(conv) = state.conversation_metadata.get(conv_id) else {
            return Vec::new();
        };
        let mut by_relay: HashMap<RelayUrl, Vec<RelayUserEntry>> = HashMap::new();
        for pk in &conv.participant_pubkeys {
            let is_current_user = *pk == self.my_pubkey;
            if let Some(participant) = state.participants.get(pk) {
                for relay in &participant.derived_relays {
                    by_relay.entry(relay.clone()).or_default().push(RelayUserEntry {
                        pubkey: *pk,
                        is_current_user,
                        source: "derived",
                    });
                }
            }
        }
        by_relay
            .into_iter()
            .map(|(relay, users)| ConversationRelay { relay, users })
            .collect()
    }

    /// `markConversationAsRead` (spec §6).
    pub async fn mark_conversation_as_read(&self, conv_id: &str) {
        let mut state = self.state.lock().await;
        if let Some(conv) = state.conversation_metadata.get_mut(conv_id) {
            conv.last_read_at_ms = now_ms();
        }
        self.publish_and_persist(&mut state).await;
    }

    async fn publish_and_persist(&self, state: &mut MessagingState) {
        self.publish_state(state).await;
        if let Err(e) = save_to_cache(&self.kv, &self.my_pubkey, state) {
            warn!(error = %e, "failed to persist state to cache");
        }
    }

    /// Fetch one participant's three relay-list events (spec §4.2, §4.4). Queries each
    /// discovery relay independently so the majority early-exit (spec §4.4) can stop
    /// waiting on stragglers once `MAJORITY_FRACTION` of relays have reported in, rather
    /// than blocking on every relay's full timeout.
    async fn fetch_relay_lists(&self, pubkey: PublicKey) -> RelayListsResult {
        use futures::stream::FuturesUnordered;
        use futures::StreamExt;

        let mut result = RelayListsResult::default();
        let filter = Filter::new()
            .kinds([kinds::relay_list(), kinds::dm_inbox(), kinds::blocked_relays()])
            .author(pubkey)
            .limit(3);

        let total_relays = self.config.discovery_relays.len();
        let mut pending: FuturesUnordered<_> = self
            .config
            .discovery_relays
            .iter()
            .map(|relay| {
                let pool = Arc::clone(&self.pool);
                let relay = relay.clone();
                let filter = filter.clone();
                async move {
                    let outcome = pool
                        .query(std::slice::from_ref(&relay), filter, query::RELAY_LIST_QUERY_TIMEOUT)
                        .await;
                    (relay, outcome)
                }
            })
            .collect();

        let mut responded = 0usize;
        while let Some((relay, outcome)) = pending.next().await {
            responded += 1;
            match outcome {
                Ok(events) => {
                    for event in events {
                        if event.kind == kinds::relay_list() {
                            RelayListsResult::offer(&mut result.outbox, event);
                        } else if event.kind == kinds::dm_inbox() {
                            RelayListsResult::offer(&mut result.dm_inbox, event);
                        } else if event.kind == kinds::blocked_relays() {
                            RelayListsResult::offer(&mut result.blocked, event);
                        }
                    }
                }
                Err(e) => warn!(pubkey = %pubkey, relay = %relay, error = %e, "relay-list query failed"),
            }
            if query::majority_has_reported(responded, total_relays) {
                break;
            }
        }
        result
    }

    /// Bootstrap (spec §2 data flow): load cache → refresh stale relay lists → initial
    /// fetch → decrypt → extract new participants → fetch their relay lists → gap-fill
    /// fetch → group conversations → save.
    pub async fn bootstrap(&self) -> Result<(), EngineError> {
        let cached = match load_from_cache(&self.kv, &self.my_pubkey) {
            Ok(state) => state,
            Err(CacheError::Corrupt(reason)) => {
                warn!(reason, "cache corrupt, forcing cold start");
                None
            }
            Err(CacheError::Kv(e)) => return Err(EngineError::CacheCorrupt(e.to_string())),
        };

        // Settings fingerprint (spec §4.7): a changed discovery-relay set or relay mode
        // still loads the cached messages/participants, but forces a full query-plan
        // re-run rather than trusting `queried_relays`/`last_cache_time_ms`.
        let fingerprint = settings_fingerprint(&self.config.discovery_relays, self.config.relay_mode);
        let previous_fingerprint = self
            .kv
            .get(DM_CACHE_STORE, &fingerprint_key(&self.my_pubkey))
            .ok()
            .flatten()
            .and_then(|bytes| String::from_utf8(bytes).ok());
        let settings_changed = previous_fingerprint.as_deref() != Some(fingerprint.as_str());
        if let Err(e) = self.kv.put(DM_CACHE_STORE, &fingerprint_key(&self.my_pubkey), fingerprint.as_bytes()) {
            warn!(error = %e, "failed to persist settings fingerprint");
        }

        let mut working = cached.clone().unwrap_or_default();

        // Refresh our own relay lists, then any stale participants.
        let my_lists = self.fetch_relay_lists(self.my_pubkey).await;
        let me = registry::build_participant(
            self.my_pubkey,
            &my_lists,
            self.config.relay_mode,
            &self.config.discovery_relays,
            now_ms(),
        );
        working.participants.insert(self.my_pubkey, me.clone());

        let stale = registry::get_stale_participants(&working.participants, self.config.relay_ttl_ms, now_ms());
        for pk in stale {
            if pk == self.my_pubkey {
                continue;
            }
            let lists = self.fetch_relay_lists(pk).await;
            let participant = registry::build_participant(
                pk,
                &lists,
                self.config.relay_mode,
                &self.config.discovery_relays,
                now_ms(),
            );
            working.participants.insert(pk, participant);
        }

        // `compute_since_timestamp` operates in `last_cache_time_ms`'s own unit
        // (milliseconds); the query executor and `nostr::Timestamp` are Unix seconds, so the
        // conversion happens once, here, at the boundary between the two.
        let since = if settings_changed {
            None
        } else {
            planner::compute_since_timestamp(
                working.sync_state.last_cache_time_ms,
                self.config.nip17_fuzz_days,
            )
            .map(|since_ms| since_ms / 1000)
        };

        let relay_to_users = planner::build_relay_to_users_map(&working.participants);
        let mut relays_to_query: Vec<RelayUrl> = relay_to_users.keys().cloned().collect();
        relays_to_query.extend(me.derived_relays.iter().cloned());
        relays_to_query.sort();
        relays_to_query.dedup();

        let already_queried: HashSet<RelayUrl> = if settings_changed {
            HashSet::new()
        } else {
            working.sync_state.queried_relays.clone()
        };
        let new_relays = planner::filter_new_relay_user_combos(&relay_to_users, &already_queried);

        let result = query::run_query_batches(
            &self.pool,
            &relays_to_query,
            self.my_pubkey,
            since,
            self.config.query_limit,
        )
        .await;

        let mut decrypted = Vec::with_capacity(result.messages.len());
        for raw in &result.messages {
            if let Some(message) = decrypt::decrypt_event(&self.signer, raw).await {
                decrypted.push(message);
            }
        }

        let participant_refs: Vec<PublicKey> = decrypted
            .iter()
            .flat_map(|m| conversations::parse_conversation_id(&m.conversation_id))
            .collect();
        let new_pubkeys = planner::extract_new_pubkeys(&participant_refs, &working.participants, self.my_pubkey);
        for pk in new_pubkeys {
            let lists = self.fetch_relay_lists(pk).await;
            let participant = registry::build_participant(
                pk,
                &lists,
                self.config.relay_mode,
                &self.config.discovery_relays,
                now_ms(),
            );
            working.participants.insert(pk, participant);
        }

        let grouped = conversations::group_messages_into_conversations(&decrypted);
        let mut fresh_state = MessagingState {
            participants: working.participants.clone(),
            ..MessagingState::new()
        };
        for (conv_id, mut messages) in grouped {
            messages.sort_by(|a, b| {
                a.event
                    .created_at
                    .cmp(&b.event.created_at)
                    .then_with(|| a.id.cmp(&b.id))
            });
            let participants = conversations::parse_conversation_id(&conv_id);
            let metadata = conversations::build_conversation_metadata(
                &conv_id,
                &participants,
                &messages,
                self.my_pubkey,
                working.conversation_metadata.get(&conv_id),
            );
            fresh_state.conversation_metadata.insert(conv_id.clone(), metadata);
            fresh_state.conversation_messages.insert(conv_id, messages);
        }

        fresh_state.sync_state.last_cache_time_ms = Some(now_ms());
        fresh_state.sync_state.queried_relays = relays_to_query.iter().cloned().collect();
        fresh_state.sync_state.queried_relays.extend(new_relays);
        fresh_state.sync_state.query_limit_reached = result.limit_reached;
        for (relay, health) in result.per_relay_health {
            fresh_state.relay_info.insert(relay, health);
        }

        // Spec §9: blocked relays are surfaced via `relayInfo.isBlocked`, never filtered
        // from query targets. A relay is blocked if any participant's NIP-10006 list names it.
        let blocked_relays: HashSet<RelayUrl> = fresh_state
            .participants
            .values()
            .flat_map(|p| p.blocked_relays.iter().cloned())
            .collect();
        for relay in blocked_relays {
            fresh_state.relay_info.entry(relay).or_default().is_blocked = true;
        }

        let merged = merge_messaging_state(&working, &fresh_state);
        let mut state = self.state.lock().await;
        *state = merged;
        self.publish_and_persist(&mut state).await;
        info!(conversations = state.conversation_metadata.len(), "bootstrap complete");
        Ok(())
    }

    /// Apply one freshly arrived real-time event (spec §4.8) to state.
    pub async fn handle_live_event(&self, raw: &nostr::Event) {
        let Some(message) = decrypt::decrypt_event(&self.signer, raw).await else {
            return;
        };
        let mut state = self.state.lock().await;
        let applied = subscriber::add_message_to_state(&mut state, message, self.my_pubkey);
        if applied {
            self.publish_and_persist(&mut state).await;
        }
    }

    /// `loadEarlierMessages` (spec §6): a backwards-paginated gap-fill fetch for one
    /// conversation's relay set, merged into state.
    pub async fn load_earlier_messages(&self, conv_id: &str) {
        let participants = conversations::parse_conversation_id(conv_id);
        let state_snapshot = self.state.lock().await.clone();

        let mut relays: Vec<RelayUrl> = Vec::new();
        for pk in &participants {
            if let Some(participant) = state_snapshot.participants.get(pk) {
                relays.extend(participant.derived_relays.iter().cloned());
            }
        }
        relays.sort();
        relays.dedup();

        let earliest = state_snapshot
            .conversation_messages
            .get(conv_id)
            .and_then(|msgs| msgs.first())
            .map(|m| m.event.created_at.as_u64());

        let result = query::run_query_batches(
            &self.pool,
            &relays,
            self.my_pubkey,
            earliest.map(|t| t.saturating_sub(1)),
            self.config.query_limit,
        )
        .await;

        let mut state = self.state.lock().await;
        for raw in &result.messages {
            if let Some(message) = decrypt::decrypt_event(&self.signer, raw).await {
                subscriber::add_message_to_state(&mut state, message, self.my_pubkey);
            }
        }
        self.publish_and_persist(&mut state).await;
    }

    /// Encrypt and upload an attachment, producing its `FileMetadata` descriptor (spec
    /// §4.9 "Attachment encryption").
    async fn prepare_attachment(&self, attachment: PlaintextAttachment) -> Result<FileMetadata, EngineError> {
        let encrypted = encrypt_attachment(&attachment.bytes)
            .map_err(|e| EngineError::MalformedEvent(e.to_string()))?;
        let url = self
            .blob_host
            .upload(encrypted.ciphertext.clone(), &attachment.mime_type)
            .await
            .map_err(|e| EngineError::MalformedEvent(e.to_string()))?;

        Ok(FileMetadata {
            url: Some(url),
            mime_type: Some(attachment.mime_type),
            size: Some(attachment.bytes.len() as u64),
            name: attachment.name,
            dim: None,
            blurhash: None,
            thumb: None,
            fallback: Vec::new(),
            hash: Some(encrypted.ciphertext_sha256_hex),
            encryption: Some(FileEncryption {
                algorithm: dm_types::AttachmentAlgorithm::AesGcm,
                key_base64: encrypted.key_base64,
                nonce_base64: encrypted.nonce_base64,
            }),
        })
    }

    /// Download and decrypt one attachment for display (spec §4.9 "Attachment
    /// decryption"), using the media blob cache to avoid re-fetching (spec §4.10).
    pub async fn fetch_attachment(&self, meta: &FileMetadata) -> Result<Vec<u8>, EngineError> {
        let (Some(url), Some(enc)) = (&meta.url, &meta.encryption) else {
            return Err(EngineError::MalformedEvent("attachment missing url or encryption".to_string()));
        };

        let cache = MediaBlobCache::new(&self.kv, self.config.media_cache_byte_budget);
        let key = dm_store::blob_key(url, &enc.nonce_base64);
        if let Ok(Some(record)) = cache.get(&key, now_ms()) {
            return Ok(record.bytes);
        }

        let ciphertext = self
            .blob_host
            .download(url)
            .await
            .map_err(|e| EngineError::MalformedEvent(e.to_string()))?;

        let plaintext = decrypt_attachment(
            enc.algorithm.as_str(),
            &enc.key_base64,
            &enc.nonce_base64,
            &ciphertext,
            meta.hash.as_deref(),
        )
        .map_err(|e| EngineError::MalformedEvent(e.to_string()))?;

        let mime_type = meta.mime_type.clone().unwrap_or_default();
        if let Err(e) = cache.put(&key, plaintext.clone(), mime_type, now_ms()) {
            warn!(error = %e, "failed to cache decrypted attachment");
        }
        Ok(plaintext)
    }

    /// `send` (spec §6): compose, encrypt, sign and publish a message into an existing or
    /// brand-new conversation.
    pub async fn send(&self, request: SendRequest<'_>) -> Result<nostr::EventId, EngineError> {
        let mut file_metadata = Vec::with_capacity(request.attachments.len());
        for attachment in request.attachments {
            file_metadata.push(self.prepare_attachment(attachment).await?);
        }

        let state_snapshot = self.state.lock().await.clone();
        let participants = conversations::parse_conversation_id(request.conversation_id);
        let recipients: Vec<PublicKey> = participants
            .into_iter()
            .filter(|pk| *pk != self.my_pubkey)
            .collect();

        let message_id = match request.protocol {
            Protocol::Nip04 => {
                let Some(recipient) = recipients.first().copied() else {
                    return Err(EngineError::MalformedEvent("NIP-04 requires exactly one recipient".to_string()));
                };
                let mut relays: Vec<RelayUrl> = Vec::new();
                if let Some(p) = state_snapshot.participants.get(&recipient) {
                    relays.extend(p.derived_relays.iter().cloned());
                }
                if let Some(me) = state_snapshot.participants.get(&self.my_pubkey) {
                    relays.extend(me.derived_relays.iter().cloned());
                }
                relays.sort();
                relays.dedup();
                let (id, _outcomes) = send::send_nip04(
                    &self.signer,
                    &self.pool,
                    recipient,
                    request.plaintext,
                    &file_metadata,
                    &relays,
                )
                .await?;
                id
            }
            Protocol::Nip17 => {
                let mut relays_by_recipient: HashMap<PublicKey, Vec<RelayUrl>> = HashMap::new();
                for pk in recipients.iter().chain(std::iter::once(&self.my_pubkey)) {
                    if let Some(p) = state_snapshot.participants.get(pk) {
                        relays_by_recipient.insert(*pk, p.derived_relays.clone());
                    }
                }
                send::send_nip17(
                    &self.signer,
                    &self.pool,
                    &recipients,
                    request.plaintext,
                    request.subject,
                    &file_metadata,
                    &relays_by_recipient,
                    self.config.nip17_fuzz_days,
                )
                .await?
            }
        };

        Ok(message_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn now_ms_is_nonzero() {
        assert!(now_ms() > 0);
    }
}
