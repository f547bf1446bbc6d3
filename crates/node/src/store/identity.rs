//! Long-lived swarm identity for legacy hyper integrations.

use std::path::Path;

use serde::Deserialize;
use serde::Serialize;

use crate::error::Result;
use crate::store::fs;

/// The keypair stored in `swarm-keypair.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwarmKeypair {
    /// Public key, hex encoded.
    #[serde(rename = "publicKey")]
    pub public_key: String,
    /// Secret key, hex encoded.
    #[serde(rename = "secretKey")]
    pub secret_key: String,
}

impl SwarmKeypair {
    /// Load the keypair from `path`, generating and persisting a fresh one
    /// through `tunnel` when the file is missing.
    pub fn load_or_create(
        path: &Path,
        tunnel: &dyn peersky_transport::core::tunnel::SwarmTunnel,
    ) -> Result<Self> {
        if let Some(existing) = fs::read_json_or::<Option<Self>, _>(path, None) {
            return Ok(existing);
        }
        let keypair = tunnel.generate_keypair();
        let keypair = Self {
            public_key: keypair.public_key,
            secret_key: keypair.secret_key,
        };
        fs::write_json_atomic(path, &keypair)?;
        Ok(keypair)
    }
}
