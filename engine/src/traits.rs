//! Consumed interfaces (spec §6). These are the external collaborators the spec says are
//! out of scope — a relay transport, a signer capability, a file host — expressed as
//! traits so the engine can be driven by a test double in unit tests and by the real
//! `nostr-sdk` `Client`/browser-extension signer/Blossom host in production.

use async_trait::async_trait;
use nostr::{Event, PublicKey, RelayUrl};
use thiserror::Error;

#[derive(Debug, Error, Clone)]
pub enum SignerError {
    #[error("unable to decrypt")]
    UnableToDecrypt,
    #[error("signer unavailable: {0}")]
    Unavailable(String),
    #[error("signing failed: {0}")]
    SigningFailed(String),
}

/// NIP-04/NIP-44 encryption plus event signing (spec §6 `Signer`). A remote signer
/// (hardware device, browser extension) may serialize internally — callers must tolerate
/// queued latency (spec §5 "Shared resources").
#[async_trait]
pub trait Signer: Send + Sync {
    fn public_key(&self) -> PublicKey;
    async fn nip04_encrypt(&self, peer: &PublicKey, plaintext: &str) -> Result<String, SignerError>;
    async fn nip04_decrypt(&self, peer: &PublicKey, ciphertext: &str) -> Result<String, SignerError>;
    async fn nip44_encrypt(&self, peer: &PublicKey, plaintext: &str) -> Result<String, SignerError>;
    async fn nip44_decrypt(&self, peer: &PublicKey, ciphertext: &str) -> Result<String, SignerError>;
    async fn sign_event(&self, unsigned: nostr::UnsignedEvent) -> Result<Event, SignerError>;
}

#[derive(Debug, Error, Clone)]
pub enum RelayPoolError {
    #[error("relay {0} unreachable: {1}")]
    Unreachable(RelayUrl, String),
    #[error("relay {0} query timed out")]
    Timeout(RelayUrl),
}

/// Per-relay outcome of a publish attempt (spec §4.9 "a per-recipient failure is logged
/// but not fatal").
#[derive(Debug, Clone)]
pub struct PublishOutcome {
    pub relay: RelayUrl,
    pub ok: bool,
    pub error: Option<String>,
}

/// The relay transport (spec §6 `RelayPool`). The engine holds no relay sockets directly
/// (spec §5 "Shared resources") — every query/publish/subscribe call is routed through
/// this trait.
#[async_trait]
pub trait RelayPool: Send + Sync {
    async fn query(
        &self,
        relays: &[RelayUrl],
        filter: nostr::Filter,
        timeout: std::time::Duration,
    ) -> Result<Vec<Event>, RelayPoolError>;

    async fn publish(&self, relays: &[RelayUrl], event: &Event) -> Vec<PublishOutcome>;

    /// A live subscription delivering events as they arrive, until `cancel` observes a
    /// generation bump (see `engine::cancel`).
    async fn subscribe(
        &self,
        relays: &[RelayUrl],
        filter: nostr::Filter,
        sender: tokio::sync::mpsc::UnboundedSender<Event>,
    );
}

#[derive(Debug, Error, Clone)]
pub enum BlobHostError {
    #[error("upload failed: {0}")]
    UploadFailed(String),
    #[error("download failed: {0}")]
    DownloadFailed(String),
}

/// The external file host (spec §6 `BlobHost`).
#[async_trait]
pub trait BlobHost: Send + Sync {
    async fn upload(&self, bytes: Vec<u8>, mime_type: &str) -> Result<String, BlobHostError>;
    async fn download(&self, url: &str) -> Result<Vec<u8>, BlobHostError>;
}
