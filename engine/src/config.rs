//! Runtime configuration (spec §6 "CLI / environment" — "runtime configuration is a value
//! struct").

use dm_types::RelayMode;
use nostr::RelayUrl;
use serde::{Deserialize, Serialize};

fn default_relay_ttl_ms() -> u64 {
    6 * 60 * 60 * 1000
}

fn default_query_limit() -> usize {
    5000
}

fn default_fuzz_days() -> u64 {
    2
}

fn default_media_byte_budget() -> u64 {
    200 * 1024 * 1024
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub discovery_relays: Vec<RelayUrl>,
    #[serde(default)]
    pub relay_mode: RelayMode,
    #[serde(default = "default_relay_ttl_ms")]
    pub relay_ttl_ms: u64,
    #[serde(default = "default_query_limit")]
    pub query_limit: usize,
    /// NIP-17 gift-wrap timestamp fuzz window in days (spec §4.9, §9). Default 2.
    #[serde(default = "default_fuzz_days")]
    pub nip17_fuzz_days: u64,
    #[serde(default = "default_media_byte_budget")]
    pub media_cache_byte_budget: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            discovery_relays: Vec::new(),
            relay_mode: RelayMode::default(),
            relay_ttl_ms: default_relay_ttl_ms(),
            query_limit: default_query_limit(),
            nip17_fuzz_days: default_fuzz_days(),
            media_cache_byte_budget: default_media_byte_budget(),
        }
    }
}
