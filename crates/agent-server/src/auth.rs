//! Persistent store of paired Hubs (bearer tokens) for the Agent side.
//!
//! Mirrors `hub-connection`'s peer store but keyed by Hub id rather than
//! Agent id.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Errors from auth store operations.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// A paired Hub's persisted record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerRecord {
    pub peer_id: String,
    pub peer_name: String,
    pub platform: String,
    pub token: String,
    pub paired_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

/// Persistent store of paired Hubs, keyed by `peer_id`.
///
/// Writes are atomic: a new file is written alongside the real path, then
/// renamed over it, so a crash mid-write never leaves a truncated or
/// partially-written token file behind. The file is created with `0600`
/// permissions on Unix, since it holds bearer tokens.
pub struct AuthStore {
    path: PathBuf,
    peers: RwLock<HashMap<String, PeerRecord>>,
}

impl AuthStore {
    /// Creates a new store, loading existing peers from disk.
    pub fn new(path: PathBuf) -> Result<Self, AuthError> {
        let peers = load_peers(&path)?;
        Ok(Self {
            path,
            peers: RwLock::new(peers),
        })
    }

    /// Returns the peer record for a Hub, if paired.
    pub fn get(&self, peer_id: &str) -> Option<PeerRecord> {
        self.peers.read().unwrap().get(peer_id).cloned()
    }

    /// Returns all paired peer records.
    pub fn list(&self) -> Vec<PeerRecord> {
        self.peers.read().unwrap().values().cloned().collect()
    }

    /// Returns `true` if `token` is the current token for `peer_id`.
    ///
    /// Uses constant-time comparison to avoid leaking token contents
    /// through response-timing side channels.
    pub fn verify_token(&self, peer_id: &str, token: &str) -> bool {
        match self.get(peer_id) {
            Some(peer) => constant_time_eq(peer.token.as_bytes(), token.as_bytes()),
            None => false,
        }
    }

    /// Returns the current token for a peer, if paired.
    pub fn find_token(&self, peer_id: &str) -> Option<String> {
        self.peers.read().unwrap().get(peer_id).map(|p| p.token.clone())
    }

    /// Inserts or replaces a peer's record and persists it.
    pub fn upsert(&self, record: PeerRecord) -> Result<(), AuthError> {
        {
            let mut map = self.peers.write().unwrap();
            map.insert(record.peer_id.clone(), record);
        }
        self.persist()
    }

    /// Updates `last_seen` for a peer to `when` and persists. A no-op if
    /// the peer is not (or no longer) paired.
    pub fn touch(&self, peer_id: &str, when: DateTime<Utc>) -> Result<(), AuthError> {
        {
            let mut map = self.peers.write().unwrap();
            match map.get_mut(peer_id) {
                Some(peer) => peer.last_seen = when,
                None => return Ok(()),
            }
        }
        self.persist()
    }

    /// Revokes a paired Hub, removing its token.
    pub fn remove(&self, peer_id: &str) -> Result<(), AuthError> {
        {
            let mut map = self.peers.write().unwrap();
            map.remove(peer_id);
        }
        self.persist()
    }

    /// Returns all paired Hub ids.
    pub fn peer_ids(&self) -> Vec<String> {
        self.peers.read().unwrap().keys().cloned().collect()
    }

    fn persist(&self) -> Result<(), AuthError> {
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
        tracing::debug!(count = map.len(), path = %self.path.display(), "persisted peer store");
        Ok(())
    }
}

fn load_peers(path: &Path) -> Result<HashMap<String, PeerRecord>, AuthError> {
    if !path.exists() {
        return Ok(HashMap::new());
    }
    let data = std::fs::read_to_string(path)?;
    let records: Vec<PeerRecord> = serde_json::from_str(&data)?;
    Ok(records.into_iter().map(|r| (r.peer_id.clone(), r)).collect())
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

/// Generates a CSPRNG bearer token (32 random bytes, base64url without padding).
pub fn generate_token() -> String {
    use base64::Engine;
    use rand::RngCore;

    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

/// Returns the default auth store path for the Agent.
pub fn default_auth_path() -> Option<PathBuf> {
    config_dir().map(|d| d.join("capydeploy").join("agent").join("peers.json"))
}

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
