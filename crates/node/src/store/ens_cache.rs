//! Persistent ENS contenthash cache.
//!
//! A process-wide map `ens name -> raw contenthash bytes` with load-on-start
//! and write-through-on-insert semantics. There is no TTL and no automatic
//! eviction; removing the backing file is the only way to force a refresh.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;
use std::sync::RwLock;

use crate::store::fs;

/// On-disk shape: an array of `[name, contenthash-hex]` pairs.
type Snapshot = Vec<(String, String)>;

/// See the module docs.
pub struct EnsCache {
    path: PathBuf,
    map: RwLock<HashMap<String, Vec<u8>>>,
    // Serializes flushes; lookups never take it.
    flush_lock: Mutex<()>,
}

impl EnsCache {
    /// Load the cache from `path`, starting empty when the file is missing.
    pub fn load(path: PathBuf) -> Self {
        let snapshot: Snapshot = fs::read_json_or(&path, vec![]);
        let mut map = HashMap::with_capacity(snapshot.len());
        for (name, hex_bytes) in snapshot {
            match hex::decode(&hex_bytes) {
                Ok(bytes) => {
                    map.insert(name, bytes);
                }
                Err(e) => tracing::warn!("Dropping undecodable cache entry {name}: {e}"),
            }
        }
        tracing::debug!("Loaded {} ENS cache entries", map.len());
        Self {
            path,
            map: RwLock::new(map),
            flush_lock: Mutex::new(()),
        }
    }

    /// Cached contenthash bytes for `name`, if any.
    pub fn get(&self, name: &str) -> Option<Vec<u8>> {
        self.map.read().ok()?.get(name).cloned()
    }

    /// Insert and flush. Persistence failures are logged and do not fail the
    /// lookup that triggered the insert.
    pub fn insert(&self, name: &str, contenthash: Vec<u8>) {
        if let Ok(mut map) = self.map.write() {
            map.insert(name.to_string(), contenthash);
        }
        self.flush();
    }

    /// Number of cached names.
    pub fn len(&self) -> usize {
        self.map.read().map(|m| m.len()).unwrap_or(0)
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn flush(&self) {
        let _guard = self.flush_lock.lock();
        let snapshot: Snapshot = match self.map.read() {
            Ok(map) => map
                .iter()
                .map(|(name, bytes)| (name.clone(), hex::encode(bytes)))
                .collect(),
            Err(_) => return,
        };
        if let Err(e) = fs::write_json_atomic(&self.path, &snapshot) {
            tracing::warn!("Persisting ENS cache failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_then_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ensCache.json");

        let cache = EnsCache::load(path.clone());
        cache.insert("vitalik.eth", vec![0xe3, 0x01, 0x01]);
        cache.insert("ens.eth", vec![0xe5, 0x01]);

        let reloaded = EnsCache::load(path);
        assert_eq!(reloaded.get("vitalik.eth"), Some(vec![0xe3, 0x01, 0x01]));
        assert_eq!(reloaded.get("ens.eth"), Some(vec![0xe5, 0x01]));
        assert_eq!(reloaded.len(), 2);
    }

    #[test]
    fn test_missing_entry_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let cache = EnsCache::load(dir.path().join("ensCache.json"));
        assert!(cache.get("unknown.eth").is_none());
    }
}
