//! The [ContentNetwork] trait and its value types.
//!
//! A `ContentNetwork` is the gateway's view of a libp2p/Helia-style stack:
//! content is addressed by [Cid] and laid out as a UnixFS-like tree below a
//! root. The trait says nothing about bitswap, providers, or record formats;
//! those belong to the implementation.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use cid::Cid;
use futures::stream::BoxStream;

use crate::error::Result;

/// A lazy, possibly unbounded sequence of body chunks.
pub type ByteStream = BoxStream<'static, Result<Bytes>>;

/// What kind of entry a path points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    /// A regular file with byte content.
    File,
    /// A directory with named children.
    Directory,
}

/// Result of a [ContentNetwork::stat] call.
#[derive(Debug, Clone)]
pub struct EntryStat {
    /// Entry kind.
    pub kind: EntryKind,
    /// File size in bytes, when the implementation knows it.
    pub size: Option<u64>,
}

/// One entry of a directory listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    /// Name of the child, without any path separator.
    pub name: String,
    /// Entry kind.
    pub kind: EntryKind,
}

/// Result of a DNSLink resolution: a root plus the path stored inside the
/// TXT record, if any.
#[derive(Debug, Clone)]
pub struct DnsLinkTarget {
    /// Resolved content root.
    pub cid: Cid,
    /// Path inside the record, `/`-separated, possibly empty.
    pub path: String,
}

/// Content of one entry passed to [ContentNetwork::add].
#[derive(Debug, Clone)]
pub enum AddSource {
    /// Literal bytes.
    Bytes(Bytes),
    /// A file on the local filesystem, read lazily by the implementation.
    LocalFile(PathBuf),
}

/// One entry passed to [ContentNetwork::add].
#[derive(Debug, Clone)]
pub struct AddEntry {
    /// Relative path under the uploaded root.
    pub path: String,
    /// Where the bytes come from.
    pub source: AddSource,
}

/// Abstract content-addressed network.
///
/// Implementations must be safe for concurrent use; the gateway issues
/// parallel fetches without external locking.
#[async_trait]
pub trait ContentNetwork: Send + Sync {
    /// Stat `path` below `root`. `path` is `/`-separated and already
    /// percent-decoded; an empty path means the root itself.
    async fn stat(&self, root: &Cid, path: &str) -> Result<EntryStat>;

    /// Stream the bytes of the file at `path` below `root`.
    async fn cat(&self, root: &Cid, path: &str) -> Result<ByteStream>;

    /// List the directory at `path` below `root`. Order is whatever the
    /// underlying iterator yields; callers must not rely on it.
    async fn ls(&self, root: &Cid, path: &str) -> Result<Vec<DirEntry>>;

    /// Add `entries` to the network. With `wrap_with_directory` the returned
    /// [Cid] names a directory containing every entry under its relative
    /// path; otherwise it names the single entry added.
    async fn add(&self, entries: Vec<AddEntry>, wrap_with_directory: bool) -> Result<Cid>;

    /// Pin `root` and everything below it.
    async fn pin_recursive(&self, root: &Cid) -> Result<()>;

    /// Announce `root` to the DHT so other peers can find this node as a
    /// provider.
    async fn provide(&self, root: &Cid) -> Result<()>;

    /// Resolve an IPNS record published under `peer` to its current [Cid],
    /// giving up after `timeout`.
    async fn resolve_ipns(&self, peer: &Cid, timeout: Duration) -> Result<Cid>;

    /// Resolve a DNSLink TXT record for `name`, giving up after `timeout`.
    async fn resolve_dnslink(&self, name: &str, timeout: Duration) -> Result<DnsLinkTarget>;
}
