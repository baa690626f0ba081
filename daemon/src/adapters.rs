//! Bridges from `dm-engine`'s consumed interfaces (`Signer`, `RelayPool`, `BlobHost`) onto
//! real `nostr-sdk`/Blossom implementations. The teacher's `marmotd/src/daemon.rs` talks to
//! `nostr_sdk::Client` directly; here the same calls sit behind the engine's trait objects
//! so the engine stays host-agnostic.

use std::time::Duration;

use async_trait::async_trait;
use dm_engine::{BlobHost, BlobHostError, PublishOutcome, RelayPool, RelayPoolError, Signer, SignerError};
use nostr::nips::{nip04, nip44};
use nostr::{Event, Filter, Keys, PublicKey, RelayUrl, UnsignedEvent};
use nostr_sdk::Client;
use tokio::sync::mpsc::UnboundedSender;
use tracing::warn;
use url::Url;

/// In-process signer backed by a locally held keypair (spec §6 `Signer` — "a remote
/// signer... may serialize internally"; this one never queues).
pub struct LocalSigner {
    keys: Keys,
}

impl LocalSigner {
    pub fn new(keys: Keys) -> Self {
        Self { keys }
    }
}

#[async_trait]
impl Signer for LocalSigner {
    fn public_key(&self) -> PublicKey {
        self.keys.public_key()
    }

    async fn nip04_encrypt(&self, peer: &PublicKey, plaintext: &str) -> Result<String, SignerError> {
        nip04::encrypt(self.keys.secret_key(), peer, plaintext)
            .map_err(|e| SignerError::Unavailable(e.to_string()))
    }

    async fn nip04_decrypt(&self, peer: &PublicKey, ciphertext: &str) -> Result<String, SignerError> {
        nip04::decrypt(self.keys.secret_key(), peer, ciphertext).map_err(|_| SignerError::UnableToDecrypt)
    }

    async fn nip44_encrypt(&self, peer: &PublicKey, plaintext: &str) -> Result<String, SignerError> {
        nip44::encrypt(self.keys.secret_key(), peer, plaintext, nip44::Version::V2)
            .map_err(|e| SignerError::Unavailable(e.to_string()))
    }

    async fn nip44_decrypt(&self, peer: &PublicKey, ciphertext: &str) -> Result<String, SignerError> {
        nip44::decrypt(self.keys.secret_key(), peer, ciphertext).map_err(|_| SignerError::UnableToDecrypt)
    }

    async fn sign_event(&self, unsigned: UnsignedEvent) -> Result<Event, SignerError> {
        unsigned
            .sign_with_keys(&self.keys)
            .map_err(|e| SignerError::SigningFailed(e.to_string()))
    }
}

/// `RelayPool` backed by a live `nostr-sdk` `Client` (spec §6 `RelayPool`). The engine never
/// touches the client directly (spec §5 "Shared resources").
pub struct NostrRelayPool {
    client: Client,
}

impl NostrRelayPool {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }
}

fn representative_relay(relays: &[RelayUrl]) -> RelayUrl {
    relays
        .first()
        .cloned()
        .unwrap_or_else(|| RelayUrl::parse("wss://unknown.invalid").expect("static url parses"))
}

#[async_trait]
impl RelayPool for NostrRelayPool {
    async fn query(
        &self,
        relays: &[RelayUrl],
        filter: Filter,
        timeout: Duration,
    ) -> Result<Vec<Event>, RelayPoolError> {
        if relays.is_empty() {
            return Ok(Vec::new());
        }
        let events = self
            .client
            .fetch_events_from(relays.to_vec(), filter, timeout)
            .await
            .map_err(|e| RelayPoolError::Unreachable(representative_relay(relays), e.to_string()))?;
        Ok(events.into_iter().collect())
    }

    async fn publish(&self, relays: &[RelayUrl], event: &Event) -> Vec<PublishOutcome> {
        if relays.is_empty() {
            return Vec::new();
        }
        match self.client.send_event_to(relays.to_vec(), event).await {
            Ok(output) => relays
                .iter()
                .map(|relay| {
                    let ok = output.success.contains(relay);
                    let error = output.failed.get(relay).cloned();
                    PublishOutcome {
                        relay: relay.clone(),
                        ok,
                        error,
                    }
                })
                .collect(),
            Err(e) => relays
                .iter()
                .map(|relay| PublishOutcome {
                    relay: relay.clone(),
                    ok: false,
                    error: Some(e.to_string()),
                })
                .collect(),
        }
    }

    async fn subscribe(&self, relays: &[RelayUrl], filter: Filter, sender: UnboundedSender<Event>) {
        if relays.is_empty() {
            return;
        }
        let sub = match self.client.subscribe_to(relays.to_vec(), filter, None).await {
            Ok(output) => output.val,
            Err(e) => {
                warn!(error = %e, "failed to open live subscription");
                return;
            }
        };

        let mut notifications = self.client.notifications();
        tokio::spawn(async move {
            loop {
                let notification = match notifications.recv().await {
                    Ok(n) => n,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(_) => break,
                };
                let nostr_sdk::RelayPoolNotification::Event {
                    subscription_id,
                    event,
                    ..
                } = notification
                else {
                    continue;
                };
                if subscription_id != sub {
                    continue;
                }
                if sender.send(*event).is_err() {
                    break;
                }
            }
        });
    }
}

/// `BlobHost` over the Blossom protocol (spec §6 `BlobHost`). Upload tries each configured
/// server in turn; download is a plain authenticated-free GET, matching
/// `rust/src/core/profile_pics.rs`'s `download_image`.
pub struct BlossomBlobHost {
    http: reqwest::Client,
    keys: Keys,
    servers: Vec<Url>,
}

impl BlossomBlobHost {
    pub fn new(keys: Keys, servers: Vec<Url>) -> Self {
        Self {
            http: reqwest::Client::new(),
            keys,
            servers,
        }
    }
}

#[async_trait]
impl BlobHost for BlossomBlobHost {
    async fn upload(&self, bytes: Vec<u8>, mime_type: &str) -> Result<String, BlobHostError> {
        let mut last_error: Option<String> = None;
        for server in &self.servers {
            let blossom = nostr_blossom::client::BlossomClient::new(server.clone());
            match blossom
                .upload_blob(bytes.clone(), Some(mime_type.to_string()), None, Some(&self.keys))
                .await
            {
                Ok(descriptor) => return Ok(descriptor.url.to_string()),
                Err(e) => last_error = Some(format!("{server}: {e}")),
            }
        }
        Err(BlobHostError::UploadFailed(
            last_error.unwrap_or_else(|| "no blossom servers configured".to_string()),
        ))
    }

    async fn download(&self, url: &str) -> Result<Vec<u8>, BlobHostError> {
        let resp = self
            .http
            .get(url)
            .timeout(Duration::from_secs(30))
            .send()
            .await
            .map_err(|e| BlobHostError::DownloadFailed(e.to_string()))?
            .error_for_status()
            .map_err(|e| BlobHostError::DownloadFailed(e.to_string()))?;
        let bytes = resp.bytes().await.map_err(|e| BlobHostError::DownloadFailed(e.to_string()))?;
        Ok(bytes.to_vec())
    }
}
