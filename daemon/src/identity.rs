//! Per-identity on-disk key material and state-dir bootstrapping.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use nostr_sdk::Keys;
use serde::{Deserialize, Serialize};

pub fn ensure_dir(dir: &Path) -> Result<()> {
    std::fs::create_dir_all(dir).with_context(|| format!("create dir {}", dir.display()))
}

#[derive(Serialize, Deserialize)]
struct StoredIdentity {
    secret_key_hex: String,
}

/// Load the daemon's nostr identity from `path`, generating and persisting a fresh keypair
/// on first run.
pub fn load_or_create_keys(path: &PathBuf) -> Result<Keys> {
    if let Ok(raw) = std::fs::read_to_string(path) {
        let stored: StoredIdentity =
            serde_json::from_str(&raw).with_context(|| format!("parse identity file {}", path.display()))?;
        let keys = Keys::parse(&stored.secret_key_hex).context("parse stored secret key")?;
        return Ok(keys);
    }

    let keys = Keys::generate();
    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }
    let stored = StoredIdentity {
        secret_key_hex: keys.secret_key().to_secret_hex(),
    };
    let json = serde_json::to_string_pretty(&stored).context("encode identity")?;
    std::fs::write(path, json).with_context(|| format!("write identity file {}", path.display()))?;
    Ok(keys)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generates_and_persists_on_first_run() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("identity.json");
        assert!(!path.exists());

        let keys = load_or_create_keys(&path).unwrap();
        assert!(path.exists());

        let reloaded = load_or_create_keys(&path).unwrap();
        assert_eq!(keys.public_key(), reloaded.public_key());
    }

    #[test]
    fn rejects_corrupt_identity_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("identity.json");
        std::fs::write(&path, "not json").unwrap();
        assert!(load_or_create_keys(&path).is_err());
    }
}
