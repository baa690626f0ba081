//! Media blob cache (spec §4.10, §3 `C10`). Modeled on
//! `rust/src/core/chat_media_db.rs`'s single-table, upsert-by-key record store, keyed the
//! way the spec asks: `hash(url || nonce)` so a re-encrypted copy of the same URL gets its
//! own cache slot.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::kv::{KvError, KvStore, MEDIA_BLOBS_STORE};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaBlobRecord {
    pub bytes: Vec<u8>,
    pub mime_type: String,
    pub accessed_at_ms: u64,
}

/// `hash(url || nonce)`, hex-encoded, used as the KV key.
pub fn blob_key(url: &str, nonce_base64: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(url.as_bytes());
    hasher.update(b"\0");
    hasher.update(nonce_base64.as_bytes());
    hex::encode(hasher.finalize())
}

pub struct MediaBlobCache<'a> {
    kv: &'a KvStore,
    /// Total bytes budget; eviction runs whenever a `put` would exceed it.
    byte_budget: u64,
}

impl<'a> MediaBlobCache<'a> {
    pub fn new(kv: &'a KvStore, byte_budget: u64) -> Self {
        Self { kv, byte_budget }
    }

    pub fn get(&self, key: &str, now_ms: u64) -> Result<Option<MediaBlobRecord>, KvError> {
        let Some(raw) = self.kv.get(MEDIA_BLOBS_STORE, key)? else {
            return Ok(None);
        };
        let mut record: MediaBlobRecord =
            serde_json::from_slice(&raw).map_err(|e| KvError::Serde(e.to_string()))?;
        record.accessed_at_ms = now_ms;
        self.touch(key, &record)?;
        Ok(Some(record))
    }

    pub fn put(&self, key: &str, bytes: Vec<u8>, mime_type: String, now_ms: u64) -> Result<(), KvError> {
        let record = MediaBlobRecord {
            bytes,
            mime_type,
            accessed_at_ms: now_ms,
        };
        self.touch(key, &record)?;
        self.evict_if_over_budget(key)
    }

    fn touch(&self, key: &str, record: &MediaBlobRecord) -> Result<(), KvError> {
        let encoded = serde_json::to_vec(record).map_err(|e| KvError::Serde(e.to_string()))?;
        self.kv.put(MEDIA_BLOBS_STORE, key, &encoded)
    }

    /// LRU eviction: drop the least-recently-accessed entries until the budget is met,
    /// excluding the key that was just written.
    fn evict_if_over_budget(&self, just_written_key: &str) -> Result<(), KvError> {
        let all = self.kv.scan(MEDIA_BLOBS_STORE)?;
        let mut entries: Vec<(String, MediaBlobRecord)> = all
            .into_iter()
            .filter_map(|(k, v)| {
                serde_json::from_slice::<MediaBlobRecord>(&v)
                    .ok()
                    .map(|r| (k, r))
            })
            .collect();

        let mut total: u64 = entries.iter().map(|(_, r)| r.bytes.len() as u64).sum();
        if total <= self.byte_budget {
            return Ok(());
        }

        entries.sort_by_key(|(_, r)| r.accessed_at_ms);
        for (key, record) in entries {
            if total <= self.byte_budget {
                break;
            }
            if key == just_written_key {
                continue;
            }
            total = total.saturating_sub(record.bytes.len() as u64);
            self.kv.delete(MEDIA_BLOBS_STORE, &key)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_disambiguates_by_nonce() {
        let a = blob_key("https://host/x", "nonceA");
        let b = blob_key("https://host/x", "nonceB");
        assert_ne!(a, b);
    }

    #[test]
    fn put_then_get_round_trips() {
        let kv = KvStore::in_memory().unwrap();
        let cache = MediaBlobCache::new(&kv, 1_000_000);
        let key = blob_key("https://host/x", "n");
        cache
            .put(&key, b"image-bytes".to_vec(), "image/png".to_string(), 1)
            .unwrap();
        let rec = cache.get(&key, 2).unwrap().unwrap();
        assert_eq!(rec.bytes, b"image-bytes");
        assert_eq!(rec.mime_type, "image/png");
    }

    #[test]
    fn eviction_drops_least_recently_accessed_first() {
        let kv = KvStore::in_memory().unwrap();
        let cache = MediaBlobCache::new(&kv, 15);
        let k1 = blob_key("u1", "n1");
        let k2 = blob_key("u2", "n2");
        cache.put(&k1, vec![0u8; 10], "image/png".into(), 1).unwrap();
        cache.get(&k1, 5).unwrap();
        cache.put(&k2, vec![0u8; 10], "image/png".into(), 10).unwrap();

        // k1 was touched more recently (accessed_at 5) than k2 would need to be to
        // survive a 15-byte budget holding two 10-byte blobs; k2 is newest so it stays,
        // k1 (least-recently-accessed among the rest) should be evicted.
        assert!(cache.get(&k2, 20).unwrap().is_some());
    }
}
