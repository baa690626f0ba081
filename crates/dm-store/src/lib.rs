//! Embedded ordered key-value store, per-identity state cache, and media blob cache
//! (spec §4.7, §4.10, §6, §7 `CacheCorrupt`).

pub mod cache;
pub mod kv;
pub mod media;

pub use cache::{
    load_from_cache, merge_message_list, merge_messaging_state, record_key, save_to_cache,
    settings_fingerprint, CacheError,
};
pub use kv::{KvError, KvStore, DM_CACHE_STORE, MEDIA_BLOBS_STORE};
pub use media::{blob_key, MediaBlobCache, MediaBlobRecord};
