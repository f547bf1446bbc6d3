//! Persistent log of hyper drives created through the gateway.
//!
//! Append-only within a process; used only to reconstruct a user-visible
//! list of created drives.

use std::path::PathBuf;
use std::sync::Mutex;

use serde::Deserialize;
use serde::Serialize;

use crate::store::fs;

/// One created drive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HyperCacheEntry {
    /// Name the drive was requested under (`?key=<name>`).
    pub name: String,
    /// Drive key extracted from the creation response.
    pub key: String,
    /// Creation time, milliseconds since the epoch.
    pub timestamp: i64,
    /// Always `"drive"`.
    #[serde(rename = "type")]
    pub kind: String,
}

impl HyperCacheEntry {
    /// A drive entry stamped with the current wall time.
    pub fn drive(name: &str, key: &str) -> Self {
        Self {
            name: name.to_string(),
            key: key.to_string(),
            timestamp: chrono::Utc::now().timestamp_millis(),
            kind: "drive".to_string(),
        }
    }
}

/// See the module docs.
pub struct HyperCache {
    path: PathBuf,
    entries: Mutex<Vec<HyperCacheEntry>>,
}

impl HyperCache {
    /// Load the log from `path`, starting empty when the file is missing.
    pub fn load(path: PathBuf) -> Self {
        let entries = fs::read_json_or(&path, vec![]);
        Self {
            path,
            entries: Mutex::new(entries),
        }
    }

    /// Whether a drive with `key` is already logged.
    pub fn contains_key(&self, key: &str) -> bool {
        self.entries
            .lock()
            .map(|entries| entries.iter().any(|e| e.key == key))
            .unwrap_or(false)
    }

    /// Append and flush. Persistence failures are logged and do not
    /// propagate.
    pub fn append(&self, entry: HyperCacheEntry) {
        let snapshot = {
            let Ok(mut entries) = self.entries.lock() else {
                return;
            };
            entries.push(entry);
            entries.clone()
        };
        if let Err(e) = fs::write_json_atomic(&self.path, &snapshot) {
            tracing::warn!("Persisting hyper cache failed: {e}");
        }
    }

    /// All logged entries, oldest first.
    pub fn entries(&self) -> Vec<HyperCacheEntry> {
        self.entries.lock().map(|e| e.clone()).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hyper-cache.json");

        let cache = HyperCache::load(path.clone());
        cache.append(HyperCacheEntry::drive("notes", &"a".repeat(64)));
        assert!(cache.contains_key(&"a".repeat(64)));

        let reloaded = HyperCache::load(path);
        let entries = reloaded.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "notes");
        assert_eq!(entries[0].kind, "drive");
    }
}
