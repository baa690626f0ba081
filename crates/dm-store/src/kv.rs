//! Embedded ordered key-value store (spec §6 `KeyValueStore`, §7 "KV store schema
//! version 2"). Modeled on `rust/src/core/chat_media_db.rs`: one sqlite table per logical
//! store, `key` as the primary key (sqlite orders a TEXT primary key lexicographically, so
//! range scans over a store come back ordered for free), upsert via `ON CONFLICT`.

use std::path::Path;

use rusqlite::{params, Connection, OptionalExtension};

pub const DM_CACHE_STORE: &str = "dm_cache";
pub const MEDIA_BLOBS_STORE: &str = "media_blobs";

const KNOWN_STORES: &[&str] = &[DM_CACHE_STORE, MEDIA_BLOBS_STORE];

#[derive(Debug, thiserror::Error)]
pub enum KvError {
    #[error("unknown store {0:?}; schema upgrade must create it first")]
    UnknownStore(String),
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
    #[error("failed to (de)serialize stored value: {0}")]
    Serde(String),
}

/// `KeyValueStore` (spec §6): `openOrCreate`, `get`, `put`, `delete`, `clear`.
pub struct KvStore {
    conn: Connection,
}

impl KvStore {
    /// Schema upgrade: every call creates whichever of the known stores don't exist yet,
    /// so opening an older database also creates the sibling `media_blobs` store for C10
    /// (spec §4.7 "run a schema upgrade that also creates a sibling media-blobs store").
    pub fn open_or_create(path: &Path) -> Result<Self, KvError> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        for store in KNOWN_STORES {
            conn.execute_batch(&format!(
                "CREATE TABLE IF NOT EXISTS {store} (
                    key TEXT PRIMARY KEY,
                    value BLOB NOT NULL
                );"
            ))?;
        }
        Ok(Self { conn })
    }

    pub fn in_memory() -> Result<Self, KvError> {
        let conn = Connection::open_in_memory()?;
        for store in KNOWN_STORES {
            conn.execute_batch(&format!(
                "CREATE TABLE IF NOT EXISTS {store} (key TEXT PRIMARY KEY, value BLOB NOT NULL);"
            ))?;
        }
        Ok(Self { conn })
    }

    fn check_store(store: &str) -> Result<(), KvError> {
        if KNOWN_STORES.contains(&store) {
            Ok(())
        } else {
            Err(KvError::UnknownStore(store.to_string()))
        }
    }

    pub fn get(&self, store: &str, key: &str) -> Result<Option<Vec<u8>>, KvError> {
        Self::check_store(store)?;
        let value = self
            .conn
            .query_row(
                &format!("SELECT value FROM {store} WHERE key = ?1"),
                params![key],
                |row| row.get::<_, Vec<u8>>(0),
            )
            .optional()?;
        Ok(value)
    }

    pub fn put(&self, store: &str, key: &str, value: &[u8]) -> Result<(), KvError> {
        Self::check_store(store)?;
        self.conn.execute(
            &format!(
                "INSERT INTO {store} (key, value) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value"
            ),
            params![key, value],
        )?;
        Ok(())
    }

    pub fn delete(&self, store: &str, key: &str) -> Result<(), KvError> {
        Self::check_store(store)?;
        self.conn
            .execute(&format!("DELETE FROM {store} WHERE key = ?1"), params![key])?;
        Ok(())
    }

    pub fn clear(&self, store: &str) -> Result<(), KvError> {
        Self::check_store(store)?;
        self.conn.execute(&format!("DELETE FROM {store}"), [])?;
        Ok(())
    }

    /// Ordered range scan over every key in a store, ascending. Used by the media blob
    /// cache's LRU eviction to walk entries by access time key prefix.
    pub fn scan(&self, store: &str) -> Result<Vec<(String, Vec<u8>)>, KvError> {
        Self::check_store(store)?;
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT key, value FROM {store} ORDER BY key ASC"))?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, Vec<u8>>(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_get_delete_round_trip() {
        let kv = KvStore::in_memory().unwrap();
        kv.put(DM_CACHE_STORE, "dm-cache:abc", b"hello").unwrap();
        assert_eq!(
            kv.get(DM_CACHE_STORE, "dm-cache:abc").unwrap(),
            Some(b"hello".to_vec())
        );
        kv.delete(DM_CACHE_STORE, "dm-cache:abc").unwrap();
        assert_eq!(kv.get(DM_CACHE_STORE, "dm-cache:abc").unwrap(), None);
    }

    #[test]
    fn put_overwrites_existing_key() {
        let kv = KvStore::in_memory().unwrap();
        kv.put(MEDIA_BLOBS_STORE, "k", b"one").unwrap();
        kv.put(MEDIA_BLOBS_STORE, "k", b"two").unwrap();
        assert_eq!(
            kv.get(MEDIA_BLOBS_STORE, "k").unwrap(),
            Some(b"two".to_vec())
        );
    }

    #[test]
    fn unknown_store_is_rejected() {
        let kv = KvStore::in_memory().unwrap();
        assert!(matches!(
            kv.get("not_a_real_store", "k"),
            Err(KvError::UnknownStore(_))
        ));
    }

    #[test]
    fn clear_empties_only_the_named_store() {
        let kv = KvStore::in_memory().unwrap();
        kv.put(DM_CACHE_STORE, "a", b"1").unwrap();
        kv.put(MEDIA_BLOBS_STORE, "b", b"2").unwrap();
        kv.clear(DM_CACHE_STORE).unwrap();
        assert_eq!(kv.get(DM_CACHE_STORE, "a").unwrap(), None);
        assert_eq!(kv.get(MEDIA_BLOBS_STORE, "b").unwrap(), Some(b"2".to_vec()));
    }
}
