//! Gateway configuration, serialized as YAML on disk.

use std::env;
use std::fs;
use std::io;
use std::path::PathBuf;

use serde::Deserialize;
use serde::Serialize;

use crate::error::Error;
use crate::error::Result;
use crate::util::ensure_parent_dir;
use crate::util::expand_home;

/// Default Ethereum JSON-RPC endpoint for ENS lookups.
pub const DEFAULT_ETH_RPC_URL: &str = "https://ethereum-rpc.publicnode.com";

/// Where the user data directory lives when `HOME` is not set.
fn get_data_location<P>(prefix: P) -> String
where P: AsRef<std::path::Path> {
    let home_dir = env::var_os("HOME").map(PathBuf::from);
    let expect = match home_dir {
        Some(dir) => dir.join(prefix),
        None => std::path::Path::new("data").join(prefix),
    };
    expect.to_string_lossy().to_string()
}

/// Options forwarded to the content-network stack at startup.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct IpfsOptions {
    /// Bootstrap peer multiaddrs.
    #[serde(default)]
    pub bootstrap: Vec<String>,
    /// Listen multiaddrs.
    #[serde(default)]
    pub listen: Vec<String>,
}

/// Options forwarded to the hyper/swarm stack at startup.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct HyperOptions {
    /// Whether drives created via `?key=` are persisted across restarts.
    #[serde(default)]
    pub persist: bool,
}

/// Gateway configuration. All paths may start with `~`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Directory holding every persistent JSON snapshot.
    pub user_data_dir: String,
    /// Root of installed extension bundles.
    pub extensions_dir: String,
    /// Bundled static assets served under `peersky://`.
    pub assets_dir: String,
    /// Ethereum JSON-RPC endpoint for ENS lookups.
    pub eth_rpc_url: String,
    /// When there is no configuration in the YAML file,
    /// its deserialization is equivalent to `IpfsOptions::default()` in Rust.
    #[serde(default)]
    pub ipfs: IpfsOptions,
    /// When there is no configuration in the YAML file,
    /// its deserialization is equivalent to `HyperOptions::default()` in Rust.
    #[serde(default)]
    pub hyper: HyperOptions,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            user_data_dir: get_data_location(".peersky"),
            extensions_dir: get_data_location(".peersky/extensions"),
            assets_dir: get_data_location(".peersky/assets"),
            eth_rpc_url: DEFAULT_ETH_RPC_URL.to_string(),
            ipfs: IpfsOptions::default(),
            hyper: HyperOptions::default(),
        }
    }
}

impl Config {
    /// Expanded user data directory.
    pub fn user_data_dir(&self) -> Result<PathBuf> {
        expand_home(&self.user_data_dir)
    }

    /// Expanded extensions directory.
    pub fn extensions_dir(&self) -> Result<PathBuf> {
        expand_home(&self.extensions_dir)
    }

    /// Expanded assets directory.
    pub fn assets_dir(&self) -> Result<PathBuf> {
        expand_home(&self.assets_dir)
    }

    /// Write the config to `path` as YAML.
    pub fn write_fs<P>(&self, path: P) -> Result<String>
    where P: AsRef<std::path::Path> {
        let path = expand_home(path)?;
        ensure_parent_dir(&path)?;
        let f =
            fs::File::create(path.as_path()).map_err(|e| Error::CreateFileError(e.to_string()))?;
        let f_writer = io::BufWriter::new(f);
        serde_yaml::to_writer(f_writer, self)?;
        Ok(path.to_string_lossy().to_string())
    }

    /// Read a config from `path`.
    pub fn read_fs<P>(path: P) -> Result<Config>
    where P: AsRef<std::path::Path> {
        let path = expand_home(path)?;
        tracing::debug!("Read config from: {:?}", path);
        let f = fs::File::open(path).map_err(|e| Error::OpenFileError(e.to_string()))?;
        let f_rdr = io::BufReader::new(f);
        Ok(serde_yaml::from_reader(f_rdr)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deserialization_with_missed_field() {
        let yaml = r#"
user_data_dir: /tmp/peersky
extensions_dir: /tmp/peersky/extensions
assets_dir: /tmp/peersky/assets
eth_rpc_url: https://ethereum-rpc.publicnode.com
"#;
        let cfg: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(cfg.ipfs, IpfsOptions::default());
        assert_eq!(cfg.hyper, HyperOptions::default());
    }
}
