//! Persisted address books.
//!
//! Two small JSON files survive restarts: `peerstore.json` tracks dialable
//! addresses, `dhtstore.json` tracks addresses keyed by routing id. Both
//! are written atomically (temp file + rename, mode 0600) so a crash never
//! leaves a torn file, and both rank candidates by recency of success.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::dht::now_unix;

fn atomic_write(path: &Path, data: &[u8]) -> io::Result<()> {
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, data)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&tmp, fs::Permissions::from_mode(0o600))?;
    }
    fs::rename(&tmp, path)
}

// ============================================================================
// PeerStore — dialable addresses
// ============================================================================

#[derive(Clone, Debug, Serialize, Deserialize)]
struct PeerRecord {
    addr: String,
    #[serde(default)]
    last_seen: i64,
    #[serde(default)]
    last_success: i64,
    #[serde(default)]
    failures: u32,
}

pub struct PeerStore {
    path: PathBuf,
    peers: RwLock<HashMap<String, PeerRecord>>,
}

impl PeerStore {
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let store = Self {
            path,
            peers: RwLock::new(HashMap::new()),
        };
        store.load();
        store
    }

    fn load(&self) {
        let Ok(data) = fs::read(&self.path) else {
            return;
        };
        let Ok(records) = serde_json::from_slice::<Vec<PeerRecord>>(&data) else {
            debug!(path = %self.path.display(), "peerstore decode failed; starting empty");
            return;
        };
        let mut peers = self.peers.write().unwrap_or_else(|e| e.into_inner());
        for r in records {
            if !r.addr.is_empty() {
                peers.insert(r.addr.clone(), r);
            }
        }
    }

    fn save(&self) {
        let records: Vec<PeerRecord> = {
            let peers = self.peers.read().unwrap_or_else(|e| e.into_inner());
            peers.values().cloned().collect()
        };
        match serde_json::to_vec_pretty(&records) {
            Ok(data) => {
                if let Err(e) = atomic_write(&self.path, &data) {
                    debug!(path = %self.path.display(), error = %e, "peerstore save failed");
                }
            }
            Err(e) => debug!(error = %e, "peerstore encode failed"),
        }
    }

    pub fn note_success(&self, addr: &str) {
        let now = now_unix();
        {
            let mut peers = self.peers.write().unwrap_or_else(|e| e.into_inner());
            let r = peers.entry(addr.to_string()).or_insert_with(|| PeerRecord {
                addr: addr.to_string(),
                last_seen: 0,
                last_success: 0,
                failures: 0,
            });
            r.last_seen = now;
            r.last_success = now;
            r.failures = 0;
        }
        self.save();
    }

    pub fn note_failure(&self, addr: &str) {
        {
            let mut peers = self.peers.write().unwrap_or_else(|e| e.into_inner());
            let r = peers.entry(addr.to_string()).or_insert_with(|| PeerRecord {
                addr: addr.to_string(),
                last_seen: 0,
                last_success: 0,
                failures: 0,
            });
            r.last_seen = now_unix();
            r.failures += 1;
        }
        self.save();
    }

    /// Addresses worth dialing, best first.
    pub fn candidates(&self, max_failures: u32) -> Vec<String> {
        let peers = self.peers.read().unwrap_or_else(|e| e.into_inner());
        let mut out: Vec<&PeerRecord> = peers
            .values()
            .filter(|r| r.failures <= max_failures)
            .collect();
        out.sort_by(|a, b| {
            b.last_success
                .cmp(&a.last_success)
                .then(a.failures.cmp(&b.failures))
        });
        out.into_iter().map(|r| r.addr.clone()).collect()
    }
}

// ============================================================================
// DhtStore — addresses keyed by routing id
// ============================================================================

#[derive(Clone, Debug, Serialize, Deserialize)]
struct NodeRecord {
    node_id: String,
    addr: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    name: String,
    #[serde(default)]
    last_seen: i64,
    #[serde(default)]
    last_success: i64,
    #[serde(default)]
    failures: u32,
}

pub struct DhtStore {
    path: PathBuf,
    nodes: RwLock<HashMap<String, NodeRecord>>,
}

impl DhtStore {
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let store = Self {
            path,
            nodes: RwLock::new(HashMap::new()),
        };
        store.load();
        store
    }

    fn load(&self) {
        let Ok(data) = fs::read(&self.path) else {
            return;
        };
        let Ok(records) = serde_json::from_slice::<Vec<NodeRecord>>(&data) else {
            debug!(path = %self.path.display(), "dhtstore decode failed; starting empty");
            return;
        };
        let mut nodes = self.nodes.write().unwrap_or_else(|e| e.into_inner());
        for r in records {
            if !r.node_id.is_empty() && !r.addr.is_empty() {
                nodes.insert(r.node_id.clone(), r);
            }
        }
    }

    fn save(&self) {
        let mut records: Vec<NodeRecord> = {
            let nodes = self.nodes.read().unwrap_or_else(|e| e.into_inner());
            nodes.values().cloned().collect()
        };
        // Stable output helps with diffs.
        records.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        match serde_json::to_vec_pretty(&records) {
            Ok(data) => {
                if let Err(e) = atomic_write(&self.path, &data) {
                    debug!(path = %self.path.display(), error = %e, "dhtstore save failed");
                }
            }
            Err(e) => debug!(error = %e, "dhtstore encode failed"),
        }
    }

    pub fn note_success(&self, node_id: &str, addr: &str, name: &str) {
        let now = now_unix();
        {
            let mut nodes = self.nodes.write().unwrap_or_else(|e| e.into_inner());
            let r = nodes
                .entry(node_id.to_string())
                .or_insert_with(|| NodeRecord {
                    node_id: node_id.to_string(),
                    addr: String::new(),
                    name: String::new(),
                    last_seen: 0,
                    last_success: 0,
                    failures: 0,
                });
            r.addr = addr.to_string();
            if !name.is_empty() {
                r.name = name.to_string();
            }
            r.last_seen = now;
            r.last_success = now;
            r.failures = 0;
        }
        self.save();
    }

    pub fn note_failure(&self, node_id: &str) {
        {
            let mut nodes = self.nodes.write().unwrap_or_else(|e| e.into_inner());
            let r = nodes
                .entry(node_id.to_string())
                .or_insert_with(|| NodeRecord {
                    node_id: node_id.to_string(),
                    addr: String::new(),
                    name: String::new(),
                    last_seen: 0,
                    last_success: 0,
                    failures: 0,
                });
            r.last_seen = now_unix();
            r.failures += 1;
        }
        self.save();
    }

    /// Best addresses to try first: most recent success, fewest failures,
    /// deduplicated.
    pub fn candidates(&self, max_failures: u32, limit: usize) -> Vec<String> {
        let nodes = self.nodes.read().unwrap_or_else(|e| e.into_inner());
        let mut rows: Vec<&NodeRecord> = nodes
            .values()
            .filter(|r| !r.addr.is_empty() && r.failures <= max_failures)
            .collect();
        rows.sort_by(|a, b| {
            b.last_success
                .cmp(&a.last_success)
                .then(a.failures.cmp(&b.failures))
        });

        let mut seen = std::collections::HashSet::new();
        let mut out = Vec::new();
        for r in rows {
            if !seen.insert(r.addr.clone()) {
                continue;
            }
            out.push(r.addr.clone());
            if limit > 0 && out.len() >= limit {
                break;
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peerstore_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("peerstore.json");

        let store = PeerStore::open(&path);
        store.note_success("10.0.0.1:9000");
        store.note_failure("10.0.0.2:9000");

        let again = PeerStore::open(&path);
        let cands = again.candidates(5);
        assert_eq!(cands[0], "10.0.0.1:9000");
        assert_eq!(cands.len(), 2);

        // Failure-heavy rows drop out under a strict cap.
        assert_eq!(again.candidates(0), vec!["10.0.0.1:9000".to_string()]);
    }

    #[test]
    fn peerstore_file_is_private_and_atomic() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("peerstore.json");
        let store = PeerStore::open(&path);
        store.note_success("10.0.0.1:9000");

        assert!(path.exists());
        assert!(!path.with_extension("tmp").exists());
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[test]
    fn dhtstore_ranks_and_dedups_candidates() {
        let dir = tempfile::tempdir().unwrap();
        let store = DhtStore::open(dir.path().join("dhtstore.json"));

        store.note_success("aa", "10.0.0.1:9000", "old");
        std::thread::sleep(std::time::Duration::from_millis(1100));
        store.note_success("bb", "10.0.0.2:9000", "new");
        // Same addr under a second id must not appear twice.
        store.note_success("cc", "10.0.0.2:9000", "dup");
        store.note_failure("dd");

        let cands = store.candidates(5, 8);
        assert_eq!(cands.len(), 2);
        assert_eq!(cands[0], "10.0.0.2:9000");
        assert_eq!(cands[1], "10.0.0.1:9000");

        assert_eq!(store.candidates(5, 1).len(), 1);
    }

    #[test]
    fn corrupt_store_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dhtstore.json");
        fs::write(&path, b"{ not json").unwrap();

        let store = DhtStore::open(&path);
        assert!(store.candidates(5, 8).is_empty());
    }
}
