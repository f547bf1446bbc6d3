//! Persistent room-key to port/seed table.
//!
//! The table is what lets the creator of a room re-host it under the same
//! public key after a restart: the stored `seed` is replayed into the tunnel
//! server before `ready()`.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

use serde::Deserialize;
use serde::Serialize;

use crate::error::Error;
use crate::error::Result;
use crate::store::fs;

/// Port and optional keypair material recorded for one room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomPortRecord {
    /// Local port the room's HTTP server was bound to.
    pub port: u16,
    /// Hex-encoded tunnel-server keypair material, when this node created
    /// the room.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<String>,
}

/// Older snapshots stored a bare port number per key.
#[derive(Deserialize)]
#[serde(untagged)]
enum RecordCompat {
    Record(RoomPortRecord),
    Legacy(u16),
}

impl From<RecordCompat> for RoomPortRecord {
    fn from(compat: RecordCompat) -> Self {
        match compat {
            RecordCompat::Record(record) => record,
            RecordCompat::Legacy(port) => RoomPortRecord { port, seed: None },
        }
    }
}

/// Canonical form of a room key: the unprefixed lowercase hex. Scheme
/// prefixes like `hyper://` are treated as equivalent spellings.
pub fn canonical_key(key: &str) -> String {
    let key = match key.rsplit_once("://") {
        Some((_, rest)) => rest,
        None => key,
    };
    key.trim_matches('/').to_ascii_lowercase()
}

/// See the module docs.
pub struct RoomPortTable {
    path: PathBuf,
    map: Mutex<HashMap<String, RoomPortRecord>>,
}

impl RoomPortTable {
    /// Load the table from `path`, starting empty when the file is missing.
    pub fn load(path: PathBuf) -> Self {
        let snapshot: HashMap<String, RecordCompat> = fs::read_json_or(&path, HashMap::new());
        let map = snapshot
            .into_iter()
            .map(|(key, record)| (canonical_key(&key), record.into()))
            .collect();
        Self {
            path,
            map: Mutex::new(map),
        }
    }

    /// Record for `key`, if any.
    pub fn get(&self, key: &str) -> Option<RoomPortRecord> {
        let map = self.map.lock().ok()?;
        map.get(&canonical_key(key)).cloned()
    }

    /// Insert and flush. Unlike the caches, a failed flush is an error:
    /// `create`/`rehost` must not report success before the record is at
    /// rest.
    pub fn insert(&self, key: &str, record: RoomPortRecord) -> Result<()> {
        let snapshot = {
            let mut map = self.map.lock().map_err(|_| Error::Lock)?;
            map.insert(canonical_key(key), record);
            map.clone()
        };
        fs::write_json_atomic(&self.path, &snapshot)
    }
}
