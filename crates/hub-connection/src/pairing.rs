//! Persistent store of paired Agents (bearer tokens) for the Hub side.
//!
//! Mirrors `agent-server`'s peer store but keyed by Agent id rather than
//! Hub id.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Errors from auth store operations.
#[derive(Debug, thiserror::Error)]
pub enum PairingError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// A paired Agent's persisted record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerRecord {
    pub peer_id: String,
    pub peer_name: String,
    pub platform: String,
    pub token: String,
    pub paired_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

/// Persistent store of paired Agents, keyed by `peer_id` (the Agent id).
///
/// Writes are atomic: a new file is written alongside the real path, then
/// renamed over it, so a crash mid-write never leaves a truncated or
/// partially-written token file behind. The file is created with `0600`
/// permissions on Unix, since it holds bearer tokens.
pub struct TokenStore {
    path: PathBuf,
    peers: RwLock<HashMap<String, PeerRecord>>,
}

impl TokenStore {
    /// Creates a new store, loading existing peers from disk.
    pub fn new(path: PathBuf) -> Result<Self, PairingError> {
        let peers = load_peers(&path)?;
        Ok(Self {
            path,
            peers: RwLock::new(peers),
        })
    }

    /// Returns the peer record for an Agent, if paired.
    pub fn get(&self, peer_id: &str) -> Option<PeerRecord> {
        self.peers.read().unwrap().get(peer_id).cloned()
    }

    /// Returns all paired peer records.
    pub fn list(&self) -> Vec<PeerRecord> {
        self.peers.read().unwrap().values().cloned().collect()
    }

    /// Returns the token for an Agent, if any.
    pub fn get_token(&self, peer_id: &str) -> Option<String> {
        self.peers.read().unwrap().get(peer_id).map(|p| p.token.clone())
    }

    /// Inserts or replaces a peer's full record and persists it.
    pub fn upsert(&self, record: PeerRecord) -> Result<(), PairingError> {
        {
            let mut map = self.peers.write().unwrap();
            map.insert(record.peer_id.clone(), record);
        }
        self.persist()
    }

    /// Saves a freshly issued token for an Agent, stamping `paired_at` and
    /// `last_seen` to now. Convenience wrapper around [`upsert`](Self::upsert)
    /// for completing a pairing handshake.
    pub fn save_token(
        &self,
        peer_id: &str,
        peer_name: &str,
        platform: &str,
        token: &str,
    ) -> Result<(), PairingError> {
        let now = Utc::now();
        self.upsert(PeerRecord {
            peer_id: peer_id.to_string(),
            peer_name: peer_name.to_string(),
            platform: platform.to_string(),
            token: token.to_string(),
            paired_at: now,
            last_seen: now,
        })
    }

    /// Updates `last_seen` for a peer to `when` and persists. A no-op if
    /// the peer is not (or no longer) paired.
    pub fn touch(&self, peer_id: &str, when: DateTime<Utc>) -> Result<(), PairingError> {
        {
            let mut map = self.peers.write().unwrap();
            match map.get_mut(peer_id) {
                Some(peer) => peer.last_seen = when,
                None => return Ok(()),
            }
        }
        self.persist()
    }

    /// Removes a peer's token, e.g. on revoke.
    pub fn remove_token(&self, peer_id: &str) -> Result<(), PairingError> {
        {
            let mut map = self.peers.write().unwrap();
            map.remove(peer_id);
        }
        self.persist()
    }

    /// Returns all stored Agent ids.
    pub fn agent_ids(&self) -> Vec<String> {
        self.peers.read().unwrap().keys().cloned().collect()
    }

    fn persist(&self) -> Result<(), PairingError> {
        let map = self.peers.read().unwrap();
        let records: Vec<&PeerRecord> = map.values().collect();
        let json = serde_json::to_string_pretty(&records)?;

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let tmp_path = self.path.with_extension("json.tmp");
        std::fs::write(&tmp_path, json)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&tmp_path, std::fs::Permissions::from_mode(0o600))?;
        }

        std::fs::rename(&tmp_path, &self.path)?;
        debug!(count = map.len(), path = %self.path.display(), "persisted peer store");
        Ok(())
    }
}

/// Loads peers from a JSON file on disk.
fn load_peers(path: &Path) -> Result<HashMap<String, PeerRecord>, PairingError> {
    if !path.exists() {
        return Ok(HashMap::new());
    }
    let data = std::fs::read_to_string(path)?;
    let records: Vec<PeerRecord> = serde_json::from_str(&data)?;
    Ok(records.into_iter().map(|r| (r.peer_id.clone(), r)).collect())
}

/// Returns the default token store path.
pub fn default_token_path() -> Option<PathBuf> {
    config_dir().map(|d| d.join("capydeploy").join("hub").join("peers.json"))
}

/// Returns the platform-specific config directory.
fn config_dir() -> Option<PathBuf> {
    #[cfg(target_os = "linux")]
    {
        std::env::var("XDG_CONFIG_HOME")
            .ok()
            .map(PathBuf::from)
            .or_else(|| {
                std::env::var("HOME")
                    .ok()
                    .map(|h| PathBuf::from(h).join(".config"))
            })
    }

    #[cfg(target_os = "windows")]
    {
        std::env::var("APPDATA").ok().map(PathBuf::from)
    }

    #[cfg(not(any(target_os = "linux", target_os = "windows")))]
    {
        std::env::var("HOME")
            .ok()
            .map(|h| PathBuf::from(h).join(".config"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_store() -> (tempfile::TempDir, TokenStore) {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("peers.json");
        let store = TokenStore::new(path).unwrap();
        (tmp, store)
    }

    #[test]
    fn new_store_empty() {
        let (_tmp, store) = test_store();
        assert!(store.agent_ids().is_empty());
        assert!(store.get_token("agent-1").is_none());
    }

    #[test]
    fn save_and_get_token() {
        let (_tmp, store) = test_store();
        store
            .save_token("agent-1", "Steam Deck", "linux", "token-abc")
            .unwrap();
        assert_eq!(store.get_token("agent-1").unwrap(), "token-abc");
        let record = store.get("agent-1").unwrap();
        assert_eq!(record.peer_name, "Steam Deck");
        assert_eq!(record.platform, "linux");
        assert_eq!(record.paired_at, record.last_seen);
    }

    #[test]
    fn remove_token() {
        let (_tmp, store) = test_store();
        store
            .save_token("agent-1", "Deck", "linux", "token-abc")
            .unwrap();
        store.remove_token("agent-1").unwrap();
        assert!(store.get_token("agent-1").is_none());
        assert!(store.get("agent-1").is_none());
    }

    #[test]
    fn touch_updates_last_seen() {
        let (_tmp, store) = test_store();
        store.save_token("agent-1", "Deck", "linux", "tok").unwrap();
        let later: DateTime<Utc> = "2030-01-01T00:00:00Z".parse().unwrap();
        store.touch("agent-1", later).unwrap();
        assert_eq!(store.get("agent-1").unwrap().last_seen, later);
    }

    #[test]
    fn touch_unknown_peer_is_noop() {
        let (_tmp, store) = test_store();
        let now: DateTime<Utc> = "2026-01-01T00:00:00Z".parse().unwrap();
        assert!(store.touch("nope", now).is_ok());
    }

    #[test]
    fn persist_and_reload() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("peers.json");

        {
            let store = TokenStore::new(path.clone()).unwrap();
            store.save_token("agent-1", "Deck A", "linux", "tok-1").unwrap();
            store.save_token("agent-2", "Deck B", "linux", "tok-2").unwrap();
        }

        // Reload from disk.
        let store2 = TokenStore::new(path).unwrap();
        assert_eq!(store2.get_token("agent-1").unwrap(), "tok-1");
        assert_eq!(store2.get_token("agent-2").unwrap(), "tok-2");
        assert_eq!(store2.agent_ids().len(), 2);
    }

    #[test]
    fn overwrite_token() {
        let (_tmp, store) = test_store();
        store
            .save_token("agent-1", "Deck", "linux", "old-token")
            .unwrap();
        store
            .save_token("agent-1", "Deck", "linux", "new-token")
            .unwrap();
        assert_eq!(store.get_token("agent-1").unwrap(), "new-token");
    }

    #[test]
    fn agent_ids_returns_all() {
        let (_tmp, store) = test_store();
        store.save_token("a", "A", "linux", "1").unwrap();
        store.save_token("b", "B", "linux", "2").unwrap();
        store.save_token("c", "C", "linux", "3").unwrap();

        let mut ids = store.agent_ids();
        ids.sort();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    #[test]
    fn load_missing_file_returns_empty() {
        let path = PathBuf::from("/tmp/nonexistent_capydeploy_test_tokens.json");
        let peers = load_peers(&path).unwrap();
        assert!(peers.is_empty());
    }

    #[test]
    fn no_tmp_file_left_behind_after_persist() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("peers.json");
        let store = TokenStore::new(path.clone()).unwrap();
        store.save_token("agent-1", "Deck", "linux", "tok-1").unwrap();
        assert!(!path.with_extension("json.tmp").exists());
        assert!(path.exists());
    }
}
