//! Newline-delimited JSON stdio protocol driving a `MessagingEngine` (spec §6). Modeled
//! 1:1 on `marmotd/src/daemon.rs`'s `InCmd`/`OutMsg`/`stdout_writer` pattern, retargeted at
//! this engine's produced interfaces instead of MLS group-chat commands.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context};
use base64::Engine;
use dm_engine::{BlobHost, EngineConfig, MessagingEngine, PlaintextAttachment, RelayPool, SendRequest, Signer};
use dm_types::{kinds, FileMetadata, Protocol, RelayMode};
use nostr::nips::nip01::Alphabet;
use nostr::{Filter, RelayUrl, SingleLetterTag};
use nostr_sdk::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::warn;
use url::Url;

use crate::adapters::{BlossomBlobHost, LocalSigner, NostrRelayPool};
use crate::identity;

const PROTOCOL_VERSION: u32 = 1;

pub struct Args {
    pub state_dir: PathBuf,
    pub relays: Vec<String>,
    pub blossom_servers: Vec<String>,
    pub relay_mode: RelayMode,
    pub nip17_fuzz_days: u64,
}

#[derive(Debug, Deserialize)]
struct InAttachment {
    content_base64: String,
    mime_type: String,
    #[serde(default)]
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
enum InCmd {
    Bootstrap {
        #[serde(default)]
        request_id: Option<String>,
    },
    GetState {
        #[serde(default)]
        request_id: Option<String>,
    },
    GetConversationRelays {
        #[serde(default)]
        request_id: Option<String>,
        conversation_id: String,
    },
    MarkConversationAsRead {
        #[serde(default)]
        request_id: Option<String>,
        conversation_id: String,
    },
    LoadEarlierMessages {
        #[serde(default)]
        request_id: Option<String>,
        conversation_id: String,
    },
    Send {
        #[serde(default)]
        request_id: Option<String>,
        conversation_id: String,
        plaintext: String,
        protocol: String,
        #[serde(default)]
        subject: Option<String>,
        #[serde(default)]
        attachments: Vec<InAttachment>,
    },
    FetchAttachment {
        #[serde(default)]
        request_id: Option<String>,
        file_metadata: FileMetadata,
    },
    Shutdown {
        #[serde(default)]
        request_id: Option<String>,
    },
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum OutMsg {
    Ready {
        protocol_version: u32,
        pubkey: String,
        npub: String,
    },
    Ok {
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        result: Option<serde_json::Value>,
    },
    Error {
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        code: String,
        message: String,
    },
    /// Pushed on every `subscribeState` transition (spec §6) — the full current snapshot,
    /// since the daemon has no partial-diff wire format.
    StateChanged {
        state: dm_types::MessagingState,
    },
}

fn out_error(request_id: Option<String>, code: &str, message: impl Into<String>) -> OutMsg {
    OutMsg::Error {
        request_id,
        code: code.to_string(),
        message: message.into(),
    }
}

fn out_ok(request_id: Option<String>, result: Option<serde_json::Value>) -> OutMsg {
    OutMsg::Ok { request_id, result }
}

async fn stdout_writer(mut rx: mpsc::UnboundedReceiver<OutMsg>) -> anyhow::Result<()> {
    let mut stdout = tokio::io::stdout();
    while let Some(msg) = rx.recv().await {
        let line = serde_json::to_string(&msg).context("encode out msg")?;
        stdout.write_all(line.as_bytes()).await?;
        stdout.write_all(b"\n").await?;
        stdout.flush().await?;
    }
    Ok(())
}

fn parse_protocol(raw: &str) -> Option<Protocol> {
    match raw {
        "nip04" => Some(Protocol::Nip04),
        "nip17" => Some(Protocol::Nip17),
        _ => None,
    }
}

pub async fn run(args: Args) -> anyhow::Result<()> {
    identity::ensure_dir(&args.state_dir).context("create state dir")?;
    let keys = identity::load_or_create_keys(&args.state_dir.join("identity.json"))?;
    let pubkey_hex = keys.public_key().to_hex();
    let npub = keys.public_key().to_bech32().unwrap_or_else(|_| pubkey_hex.clone());

    let mut discovery_relays: Vec<RelayUrl> = Vec::new();
    for r in &args.relays {
        discovery_relays.push(RelayUrl::parse(r.trim()).with_context(|| format!("parse relay url: {r}"))?);
    }
    if discovery_relays.is_empty() {
        discovery_relays.push(RelayUrl::parse("wss://relay.damus.io").context("parse default relay url")?);
    }

    let client = Client::new(keys.clone());
    for r in &discovery_relays {
        let _ = client.add_relay(r.clone()).await;
    }
    client.connect().await;

    let blossom_servers: Vec<Url> = args.blossom_servers.iter().filter_map(|s| Url::parse(s).ok()).collect();

    let pool: Arc<dyn RelayPool> = Arc::new(NostrRelayPool::new(client.clone()));
    let signer: Arc<dyn Signer> = Arc::new(LocalSigner::new(keys.clone()));
    let blob_host: Arc<dyn BlobHost> = Arc::new(BlossomBlobHost::new(keys.clone(), blossom_servers));

    let config = EngineConfig {
        discovery_relays: discovery_relays.clone(),
        relay_mode: args.relay_mode,
        nip17_fuzz_days: args.nip17_fuzz_days,
        ..EngineConfig::default()
    };

    let engine = Arc::new(
        MessagingEngine::open(&args.state_dir.join("state.sqlite3"), config, signer, pool.clone(), blob_host)
            .map_err(|e| anyhow!("open engine: {e}"))?,
    );

    let (out_tx, out_rx) = mpsc::unbounded_channel::<OutMsg>();
    tokio::spawn(async move {
        if let Err(err) = stdout_writer(out_rx).await {
            eprintln!("[dm-daemon] stdout writer failed: {err:#}");
        }
    });

    out_tx
        .send(OutMsg::Ready {
            protocol_version: PROTOCOL_VERSION,
            pubkey: pubkey_hex.clone(),
            npub,
        })
        .ok();

    // Forward every `subscribeState` transition to the host as an unsolicited push.
    {
        let mut state_rx = engine.subscribe_state();
        let out_tx = out_tx.clone();
        tokio::spawn(async move {
            while state_rx.changed().await.is_ok() {
                let state = state_rx.borrow_and_update().clone();
                if out_tx.send(OutMsg::StateChanged { state }).is_err() {
                    break;
                }
            }
        });
    }

    // Live subscription: the same three filter families as bootstrap (C8, spec §4.8) — F1
    // NIP-04 to-me and F3 gift-wraps to-me via the `p` tag (`pubkey()` filters match the
    // event's author, not the recipient, and gift-wraps are authored under ephemeral decoy
    // keys), plus F2 NIP-04 sent by this identity from another session.
    {
        let to_me_filter = Filter::new()
            .kinds([kinds::nip04_dm(), kinds::gift_wrap()])
            .custom_tag(SingleLetterTag::lowercase(Alphabet::P), pubkey_hex.clone());
        let from_me_filter = Filter::new().kind(kinds::nip04_dm()).author(keys.public_key());

        let (live_tx, mut live_rx) = mpsc::unbounded_channel();
        pool.subscribe(&discovery_relays, to_me_filter, live_tx.clone()).await;
        pool.subscribe(&discovery_relays, from_me_filter, live_tx).await;
        let engine = engine.clone();
        tokio::spawn(async move {
            while let Some(event) = live_rx.recv().await {
                engine.handle_live_event(&event).await;
            }
        });
    }

    {
        let engine = engine.clone();
        let out_tx = out_tx.clone();
        tokio::spawn(async move {
            if let Err(e) = engine.bootstrap().await {
                warn!(error = %e, "bootstrap failed");
                out_tx.send(out_error(None, "bootstrap_failed", e.to_string())).ok();
            }
        });
    }

    let (cmd_tx, mut cmd_rx) = mpsc::unbounded_channel::<InCmd>();
    tokio::spawn(async move {
        let stdin = tokio::io::stdin();
        let mut lines = tokio::io::BufReader::new(stdin).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            match serde_json::from_str::<InCmd>(trimmed) {
                Ok(cmd) => {
                    cmd_tx.send(cmd).ok();
                }
                Err(err) => eprintln!("[dm-daemon] invalid cmd json: {err} line={trimmed}"),
            }
        }
    });

    while let Some(cmd) = cmd_rx.recv().await {
        match cmd {
            InCmd::Bootstrap { request_id } => match engine.bootstrap().await {
                Ok(()) => {
                    out_tx.send(out_ok(request_id, None)).ok();
                }
                Err(e) => {
                    out_tx.send(out_error(request_id, "bootstrap_failed", e.to_string())).ok();
                }
            },
            InCmd::GetState { request_id } => {
                let state = engine.get_state().await;
                match serde_json::to_value(&state) {
                    Ok(value) => {
                        out_tx.send(out_ok(request_id, Some(value))).ok();
                    }
                    Err(e) => {
                        out_tx.send(out_error(request_id, "encode_failed", e.to_string())).ok();
                    }
                }
            }
            InCmd::GetConversationRelays {
                request_id,
                conversation_id,
            } => {
                let relays = engine.get_conversation_relays(&conversation_id).await;
                let out = relays
                    .iter()
                    .map(|r| {
                        json!({
                            "relay": r.relay.to_string(),
                            "users": r.users.iter().map(|u| json!({
                                "pubkey": u.pubkey.to_hex(),
                                "is_current_user": u.is_current_user,
                                "source": u.source,
                            })).collect::<Vec<_>>(),
                        })
                    })
                    .collect::<Vec<_>>();
                out_tx.send(out_ok(request_id, Some(json!({ "relays": out })))).ok();
            }
            InCmd::MarkConversationAsRead {
                request_id,
                conversation_id,
            } => {
                engine.mark_conversation_as_read(&conversation_id).await;
                out_tx.send(out_ok(request_id, None)).ok();
            }
            InCmd::LoadEarlierMessages {
                request_id,
                conversation_id,
            } => {
                engine.load_earlier_messages(&conversation_id).await;
                out_tx.send(out_ok(request_id, None)).ok();
            }
            InCmd::Send {
                request_id,
                conversation_id,
                plaintext,
                protocol,
                subject,
                attachments,
            } => {
                let Some(protocol) = parse_protocol(&protocol) else {
                    out_tx
                        .send(out_error(request_id, "bad_protocol", "protocol must be nip04 or nip17"))
                        .ok();
                    continue;
                };

                let mut decoded_attachments = Vec::with_capacity(attachments.len());
                let mut bad_attachment = None;
                for attachment in attachments {
                    match base64::engine::general_purpose::STANDARD.decode(&attachment.content_base64) {
                        Ok(bytes) => decoded_attachments.push(PlaintextAttachment {
                            bytes,
                            mime_type: attachment.mime_type,
                            name: attachment.name,
                        }),
                        Err(e) => {
                            bad_attachment = Some(e.to_string());
                            break;
                        }
                    }
                }
                if let Some(reason) = bad_attachment {
                    out_tx.send(out_error(request_id, "bad_attachment", reason)).ok();
                    continue;
                }

                let request = SendRequest {
                    conversation_id: &conversation_id,
                    plaintext: &plaintext,
                    protocol,
                    subject: subject.as_deref(),
                    attachments: decoded_attachments,
                };
                match engine.send(request).await {
                    Ok(event_id) => {
                        out_tx
                            .send(out_ok(request_id, Some(json!({ "event_id": event_id.to_hex() }))))
                            .ok();
                    }
                    Err(e) => {
                        out_tx.send(out_error(request_id, "send_failed", e.to_string())).ok();
                    }
                }
            }
            InCmd::FetchAttachment {
                request_id,
                file_metadata,
            } => match engine.fetch_attachment(&file_metadata).await {
                Ok(plaintext) => {
                    let encoded = base64::engine::general_purpose::STANDARD.encode(plaintext);
                    out_tx
                        .send(out_ok(request_id, Some(json!({ "content_base64": encoded }))))
                        .ok();
                }
                Err(e) => {
                    out_tx.send(out_error(request_id, "fetch_failed", e.to_string())).ok();
                }
            },
            InCmd::Shutdown { request_id } => {
                out_tx.send(out_ok(request_id, None)).ok();
                break;
            }
        }
    }

    // Give the stdout writer a moment to flush the final ack before the process exits.
    tokio::time::sleep(Duration::from_millis(50)).await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_send_cmd_with_attachments() {
        let raw = r#"{
            "cmd": "send",
            "request_id": "r1",
            "conversation_id": "conv1",
            "plaintext": "hi",
            "protocol": "nip17",
            "attachments": [
                {"content_base64": "aGVsbG8=", "mime_type": "text/plain", "name": "a.txt"}
            ]
        }"#;
        let cmd: InCmd = serde_json::from_str(raw).unwrap();
        match cmd {
            InCmd::Send {
                request_id,
                conversation_id,
                plaintext,
                protocol,
                attachments,
                ..
            } => {
                assert_eq!(request_id.as_deref(), Some("r1"));
                assert_eq!(conversation_id, "conv1");
                assert_eq!(plaintext, "hi");
                assert_eq!(protocol, "nip17");
                assert_eq!(attachments.len(), 1);
                assert_eq!(attachments[0].mime_type, "text/plain");
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn parses_shutdown_without_request_id() {
        let cmd: InCmd = serde_json::from_str(r#"{"cmd": "shutdown"}"#).unwrap();
        assert!(matches!(cmd, InCmd::Shutdown { request_id: None }));
    }

    #[test]
    fn rejects_unknown_cmd() {
        let result: Result<InCmd, _> = serde_json::from_str(r#"{"cmd": "nonsense"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn out_msg_tags_are_snake_case() {
        let msg = out_error(Some("r1".to_string()), "bad_protocol", "nope");
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], "error");
        assert_eq!(value["code"], "bad_protocol");
        assert_eq!(value["request_id"], "r1");

        let ok = out_ok(None, None);
        let value = serde_json::to_value(&ok).unwrap();
        assert_eq!(value["type"], "ok");
        assert!(value.get("request_id").is_none());
    }

    #[test]
    fn parse_protocol_recognizes_known_values() {
        assert_eq!(parse_protocol("nip04"), Some(Protocol::Nip04));
        assert_eq!(parse_protocol("nip17"), Some(Protocol::Nip17));
        assert_eq!(parse_protocol("nip99"), None);
    }
}
