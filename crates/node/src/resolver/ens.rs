//! The ENS resolver.
//!
//! `.eth` hostnames are resolved to an EIP-1577 contenthash over plain
//! Ethereum JSON-RPC (`eth_call` against the registry, then the name's
//! resolver), with a persistent write-through cache in front of the RPC.

use std::sync::Arc;

use tiny_keccak::Hasher;
use tiny_keccak::Keccak;

use crate::error::Error;
use crate::error::Result;
use crate::store::EnsCache;

/// The ENS registry, same address on every network.
const ENS_REGISTRY: &str = "0x00000000000C2E074eC69A0dFb2997BA6C7d2e1e";
/// Selector of `resolver(bytes32)`.
const SELECTOR_RESOLVER: &str = "0178b8bf";
/// Selector of `contenthash(bytes32)`.
const SELECTOR_CONTENTHASH: &str = "bc1c58d1";

/// Multicodec `ipfs-ns`.
const IPFS_NS: u64 = 0xe3;
/// Multicodec `ipns-ns`.
const IPNS_NS: u64 = 0xe5;

/// A decoded contenthash, validated once at the boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Contenthash {
    /// Points at immutable content.
    Ipfs(cid::Cid),
    /// Points at a mutable IPNS name (peer id string or DNSLink name).
    Ipns(String),
}

/// See the module docs.
pub struct EnsResolver {
    rpc_url: String,
    client: reqwest::Client,
    cache: Arc<EnsCache>,
}

/// EIP-137 namehash.
pub fn namehash(name: &str) -> [u8; 32] {
    let mut node = [0u8; 32];
    for label in name.split('.').rev() {
        if label.is_empty() {
            continue;
        }
        let mut label_hash = [0u8; 32];
        let mut keccak = Keccak::v256();
        keccak.update(label.as_bytes());
        keccak.finalize(&mut label_hash);

        let mut next = [0u8; 32];
        let mut keccak = Keccak::v256();
        keccak.update(&node);
        keccak.update(&label_hash);
        keccak.finalize(&mut next);
        node = next;
    }
    node
}

/// Decode EIP-1577 contenthash bytes.
///
/// The multicodec-tagged form is tried first; raw `ipfs://` / `ipns://`
/// string payloads are accepted as a fallback. Any other codec fails with
/// [Error::EnsUnsupportedCodec].
pub fn decode_contenthash(bytes: &[u8]) -> Result<Contenthash> {
    if bytes.is_empty() {
        return Err(Error::EnsUnresolvable("empty contenthash".to_string()));
    }

    if let Ok((codec, rest)) = unsigned_varint::decode::u64(bytes) {
        match codec {
            IPFS_NS => {
                if let Ok(cid) = cid::Cid::read_bytes(rest) {
                    return Ok(Contenthash::Ipfs(cid));
                }
            }
            IPNS_NS => {
                if let Ok(cid) = cid::Cid::read_bytes(rest) {
                    return Ok(Contenthash::Ipns(cid.to_string()));
                }
                if let Ok(name) = std::str::from_utf8(rest) {
                    return Ok(Contenthash::Ipns(name.to_string()));
                }
            }
            _ => {}
        }

        // Raw string payloads predate EIP-1577 in some resolvers.
        if let Ok(text) = std::str::from_utf8(bytes) {
            if let Some(rest) = text.strip_prefix("ipfs://") {
                let cid = cid::Cid::try_from(rest)
                    .map_err(|e| Error::MalformedCid(format!("{rest}: {e}")))?;
                return Ok(Contenthash::Ipfs(cid));
            }
            if let Some(rest) = text.strip_prefix("ipns://") {
                return Ok(Contenthash::Ipns(rest.trim_matches('/').to_string()));
            }
        }

        return Err(Error::EnsUnsupportedCodec(codec));
    }

    Err(Error::EnsUnresolvable("undecodable contenthash".to_string()))
}

impl EnsResolver {
    /// Create a resolver talking to `rpc_url`, fronted by `cache`.
    pub fn new(rpc_url: String, cache: Arc<EnsCache>) -> Self {
        Self {
            rpc_url,
            client: reqwest::Client::new(),
            cache,
        }
    }

    /// Resolve `name` to its decoded [Contenthash].
    ///
    /// The cache is consulted first; a miss queries RPC and inserts into the
    /// cache only when the resolver returned a non-empty value, so failures
    /// never pollute the cache.
    pub async fn resolve(&self, name: &str) -> Result<Contenthash> {
        let name = name.to_lowercase();

        if let Some(cached) = self.cache.get(&name) {
            tracing::debug!("ENS cache hit for {name}");
            return decode_contenthash(&cached);
        }

        let raw = self.query_contenthash(&name).await?;
        if raw.is_empty() {
            return Err(Error::EnsUnresolvable(name));
        }
        let decoded = decode_contenthash(&raw)?;
        self.cache.insert(&name, raw);
        Ok(decoded)
    }

    async fn query_contenthash(&self, name: &str) -> Result<Vec<u8>> {
        let node = namehash(name);
        let node_hex = hex::encode(node);

        let resolver = self
            .eth_call(ENS_REGISTRY, &format!("0x{SELECTOR_RESOLVER}{node_hex}"))
            .await?;
        let resolver = decode_address(&resolver)
            .ok_or_else(|| Error::EnsUnresolvable(name.to_string()))?;

        let raw = self
            .eth_call(&resolver, &format!("0x{SELECTOR_CONTENTHASH}{node_hex}"))
            .await?;
        Ok(decode_abi_bytes(&raw))
    }

    async fn eth_call(&self, to: &str, data: &str) -> Result<Vec<u8>> {
        let request = serde_json::json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "eth_call",
            "params": [{ "to": to, "data": data }, "latest"],
        });
        let response: serde_json::Value = self
            .client
            .post(&self.rpc_url)
            .json(&request)
            .send()
            .await
            .map_err(|e| Error::EnsRpcError(e.to_string()))?
            .json()
            .await
            .map_err(|e| Error::EnsRpcError(e.to_string()))?;

        if let Some(err) = response.get("error") {
            return Err(Error::EnsRpcError(err.to_string()));
        }
        let result = response
            .get("result")
            .and_then(|r| r.as_str())
            .ok_or_else(|| Error::EnsRpcError("missing result".to_string()))?;
        hex::decode(result.trim_start_matches("0x"))
            .map_err(|e| Error::EnsRpcError(format!("undecodable result: {e}")))
    }
}

/// Extract the address from a 32-byte ABI word; `None` when unset.
fn decode_address(word: &[u8]) -> Option<String> {
    if word.len() < 32 {
        return None;
    }
    let address = &word[12..32];
    if address.iter().all(|b| *b == 0) {
        return None;
    }
    Some(format!("0x{}", hex::encode(address)))
}

/// Decode an ABI-encoded dynamic `bytes` return value.
fn decode_abi_bytes(data: &[u8]) -> Vec<u8> {
    if data.len() < 64 {
        return vec![];
    }
    let offset = u64::from_be_bytes(data[24..32].try_into().unwrap_or_default()) as usize;
    let Some(len_word) = data.get(offset..offset + 32) else {
        return vec![];
    };
    let len = u64::from_be_bytes(len_word[24..32].try_into().unwrap_or_default()) as usize;
    data.get(offset + 32..offset + 32 + len)
        .map(|b| b.to_vec())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_namehash_known_vectors() {
        assert_eq!(namehash(""), [0u8; 32]);
        assert_eq!(
            hex::encode(namehash("eth")),
            "93cdeb708b7545dc668eb9280176169d1c33cfd8ed6f04690a0bcc88a93fc4ae"
        );
    }

    #[test]
    fn test_decode_multicodec_ipfs() {
        let cid =
            cid::Cid::try_from("QmdfTbBqBPQ7VNxZEYEj14VmRuZBkqFbiwReogJgS1zR1n").unwrap();
        let mut bytes = vec![0xe3, 0x01];
        bytes.extend(cid.to_bytes());
        let decoded = decode_contenthash(&bytes).unwrap();
        assert_eq!(decoded, Contenthash::Ipfs(cid));
    }

    #[test]
    fn test_decode_raw_string_fallback() {
        let cid_str = "QmdfTbBqBPQ7VNxZEYEj14VmRuZBkqFbiwReogJgS1zR1n";
        let bytes = format!("ipfs://{cid_str}").into_bytes();
        let decoded = decode_contenthash(&bytes).unwrap();
        assert_eq!(
            decoded,
            Contenthash::Ipfs(cid::Cid::try_from(cid_str).unwrap())
        );
    }

    #[test]
    fn test_unknown_codec_is_rejected() {
        // swarm-ns (0xe4) is not supported.
        let err = decode_contenthash(&[0xe4, 0x01, 0x00]).err().unwrap();
        assert!(matches!(err, Error::EnsUnsupportedCodec(0xe4)));
    }

    #[test]
    fn test_empty_contenthash_is_unresolvable() {
        let err = decode_contenthash(&[]).err().unwrap();
        assert!(matches!(err, Error::EnsUnresolvable(_)));
    }

    #[test]
    fn test_decode_abi_bytes() {
        let mut data = vec![0u8; 32];
        data[31] = 0x20; // offset 32
        let mut len_word = vec![0u8; 32];
        len_word[31] = 3;
        data.extend(len_word);
        data.extend(b"abc");
        data.extend([0u8; 29]); // padding
        assert_eq!(decode_abi_bytes(&data), b"abc");
    }

    #[tokio::test]
    async fn test_cache_hit_skips_rpc() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(EnsCache::load(dir.path().join("ensCache.json")));

        let cid =
            cid::Cid::try_from("QmdfTbBqBPQ7VNxZEYEj14VmRuZBkqFbiwReogJgS1zR1n").unwrap();
        let mut raw = vec![0xe3, 0x01];
        raw.extend(cid.to_bytes());
        cache.insert("vitalik.eth", raw);

        // The RPC endpoint is unroutable; a cache hit must not touch it.
        let resolver = EnsResolver::new("http://127.0.0.1:1".to_string(), cache);
        let decoded = resolver.resolve("Vitalik.ETH").await.unwrap();
        assert_eq!(decoded, Contenthash::Ipfs(cid));
    }
}
