use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use cid::Cid;
use dashmap::DashMap;
use futures::stream;
use futures::StreamExt;
use lazy_static::lazy_static;
use rand::RngCore;
use sha2::Digest;
use sha2::Sha256;
use tokio::net::TcpListener;
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::core::fetcher::FetchRequest;
use crate::core::fetcher::FetchResponse;
use crate::core::fetcher::HyperFetcher;
use crate::core::network::AddEntry;
use crate::core::network::AddSource;
use crate::core::network::ByteStream;
use crate::core::network::ContentNetwork;
use crate::core::network::DirEntry;
use crate::core::network::DnsLinkTarget;
use crate::core::network::EntryKind;
use crate::core::network::EntryStat;
use crate::core::tunnel::SwarmEvent;
use crate::core::tunnel::SwarmTopic;
use crate::core::tunnel::SwarmTunnel;
use crate::core::tunnel::TunnelClient;
use crate::core::tunnel::TunnelClientConfig;
use crate::core::tunnel::TunnelInfo;
use crate::core::tunnel::TunnelKeypair;
use crate::core::tunnel::TunnelServer;
use crate::core::tunnel::TunnelServerConfig;
use crate::error::Error;
use crate::error::Result;

/// Chunk size for streamed file bodies.
const CAT_CHUNK_SIZE: usize = 64 * 1024;

const SHA2_256: u64 = 0x12;
const DAG_PB: u64 = 0x70;

lazy_static! {
    /// Published tunnel endpoints, key -> forward target.
    static ref SERVERS: DashMap<String, (String, u16)> = DashMap::new();
    /// Live gossip topics.
    static ref TOPICS: DashMap<String, Arc<TopicHub>> = DashMap::new();
}

/// A tree below one content root: relative path -> bytes. A lone empty path
/// marks a root that is a file rather than a directory.
type Tree = BTreeMap<String, Bytes>;

/// In-memory [ContentNetwork] for local testing.
///
/// CIDs are derived deterministically from the added content, so adding the
/// same tree twice yields the same root.
#[derive(Default)]
pub struct MemoryNetwork {
    trees: DashMap<Cid, Arc<Tree>>,
    ipns: DashMap<String, Cid>,
    dnslink: DashMap<String, (Cid, String)>,
    pinned: DashMap<Cid, ()>,
    provided: DashMap<Cid, ()>,
}

impl MemoryNetwork {
    /// Create an empty network.
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a single file and return its root [Cid].
    pub fn put_file(&self, content: impl Into<Bytes>) -> Cid {
        let mut tree = Tree::new();
        tree.insert(String::new(), content.into());
        self.put_tree_inner(tree)
    }

    /// Store a directory tree and return its root [Cid].
    pub fn put_tree(&self, entries: Vec<(&str, &[u8])>) -> Cid {
        let mut tree = Tree::new();
        for (path, content) in entries {
            tree.insert(
                path.trim_matches('/').to_string(),
                Bytes::copy_from_slice(content),
            );
        }
        self.put_tree_inner(tree)
    }

    /// Publish an IPNS record mapping `peer` to `target`.
    pub fn publish_ipns(&self, peer: &Cid, target: Cid) {
        self.ipns.insert(peer.to_string(), target);
    }

    /// Publish a DNSLink record for `name`.
    pub fn publish_dnslink(&self, name: &str, target: Cid, path: &str) {
        self.dnslink
            .insert(name.to_string(), (target, path.to_string()));
    }

    /// Whether `root` has been pinned.
    pub fn is_pinned(&self, root: &Cid) -> bool {
        self.pinned.contains_key(root)
    }

    /// Whether `root` has been announced to the DHT.
    pub fn is_provided(&self, root: &Cid) -> bool {
        self.provided.contains_key(root)
    }

    fn put_tree_inner(&self, tree: Tree) -> Cid {
        let cid = tree_cid(&tree);
        self.trees.insert(cid, Arc::new(tree));
        cid
    }

    fn tree(&self, root: &Cid) -> Result<Arc<Tree>> {
        self.trees
            .get(root)
            .map(|t| t.value().clone())
            .ok_or_else(|| Error::PathNotFound(root.to_string()))
    }
}

fn tree_cid(tree: &Tree) -> Cid {
    let mut hasher = Sha256::new();
    for (path, content) in tree {
        hasher.update(path.as_bytes());
        hasher.update([0u8]);
        hasher.update(content);
        hasher.update([1u8]);
    }
    let digest = hasher.finalize();
    let hash = cid::multihash::Multihash::wrap(SHA2_256, &digest).expect("digest fits multihash");
    Cid::new_v1(DAG_PB, hash)
}

fn stat_tree(tree: &Tree, path: &str) -> Option<EntryStat> {
    let path = path.trim_matches('/');
    if let Some(content) = tree.get(path) {
        return Some(EntryStat {
            kind: EntryKind::File,
            size: Some(content.len() as u64),
        });
    }
    let prefix = if path.is_empty() {
        String::new()
    } else {
        format!("{path}/")
    };
    if tree.keys().any(|k| k.starts_with(&prefix)) {
        return Some(EntryStat {
            kind: EntryKind::Directory,
            size: None,
        });
    }
    None
}

#[async_trait]
impl ContentNetwork for MemoryNetwork {
    async fn stat(&self, root: &Cid, path: &str) -> Result<EntryStat> {
        let tree = self.tree(root)?;
        stat_tree(&tree, path).ok_or_else(|| Error::PathNotFound(path.to_string()))
    }

    async fn cat(&self, root: &Cid, path: &str) -> Result<ByteStream> {
        let tree = self.tree(root)?;
        let path = path.trim_matches('/');
        let Some(content) = tree.get(path) else {
            return match stat_tree(&tree, path) {
                Some(_) => Err(Error::NotAFile(path.to_string())),
                None => Err(Error::PathNotFound(path.to_string())),
            };
        };
        let chunks: Vec<Result<Bytes>> = content
            .chunks(CAT_CHUNK_SIZE)
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();
        Ok(stream::iter(chunks).boxed())
    }

    async fn ls(&self, root: &Cid, path: &str) -> Result<Vec<DirEntry>> {
        let tree = self.tree(root)?;
        let path = path.trim_matches('/');
        match stat_tree(&tree, path) {
            Some(stat) if stat.kind == EntryKind::Directory => {}
            Some(_) => return Err(Error::NotADirectory(path.to_string())),
            None => return Err(Error::PathNotFound(path.to_string())),
        }
        let prefix = if path.is_empty() {
            String::new()
        } else {
            format!("{path}/")
        };
        let mut seen: Vec<DirEntry> = vec![];
        for key in tree.keys() {
            let Some(rest) = key.strip_prefix(&prefix) else {
                continue;
            };
            let (name, kind) = match rest.split_once('/') {
                Some((dir, _)) => (dir, EntryKind::Directory),
                None => (rest, EntryKind::File),
            };
            if !seen.iter().any(|e| e.name == name) {
                seen.push(DirEntry {
                    name: name.to_string(),
                    kind,
                });
            }
        }
        Ok(seen)
    }

    async fn add(&self, entries: Vec<AddEntry>, wrap_with_directory: bool) -> Result<Cid> {
        let mut tree = Tree::new();
        for entry in entries {
            let content = match entry.source {
                AddSource::Bytes(b) => b,
                AddSource::LocalFile(path) => Bytes::from(tokio::fs::read(path).await?),
            };
            let path = if wrap_with_directory {
                entry.path.trim_matches('/').to_string()
            } else {
                String::new()
            };
            tree.insert(path, content);
        }
        Ok(self.put_tree_inner(tree))
    }

    async fn pin_recursive(&self, root: &Cid) -> Result<()> {
        self.pinned.insert(*root, ());
        Ok(())
    }

    async fn provide(&self, root: &Cid) -> Result<()> {
        self.provided.insert(*root, ());
        Ok(())
    }

    async fn resolve_ipns(&self, peer: &Cid, _timeout: Duration) -> Result<Cid> {
        self.ipns
            .get(&peer.to_string())
            .map(|c| *c)
            .ok_or_else(|| Error::IpnsNotFound(peer.to_string()))
    }

    async fn resolve_dnslink(&self, name: &str, _timeout: Duration) -> Result<DnsLinkTarget> {
        self.dnslink
            .get(name)
            .map(|entry| DnsLinkTarget {
                cid: entry.0,
                path: entry.1.clone(),
            })
            .ok_or_else(|| Error::DnsLinkNotFound(name.to_string()))
    }
}

/// In-memory [SwarmTunnel] for local testing.
///
/// Endpoints are "published" into a process-global registry; clients forward
/// local TCP connections to the registered target. Keys are derived as
/// `hex(sha256(seed))`, so replaying a seed regenerates the same key.
#[derive(Default)]
pub struct MemoryTunnel;

impl MemoryTunnel {
    /// Create a tunnel stack.
    pub fn new() -> Self {
        Self
    }
}

fn keypair_from_seed(seed: &[u8]) -> TunnelKeypair {
    let public = Sha256::digest(seed);
    TunnelKeypair {
        public_key: hex::encode(public),
        secret_key: hex::encode(seed),
    }
}

fn random_seed() -> Vec<u8> {
    let mut seed = vec![0u8; 32];
    rand::thread_rng().fill_bytes(&mut seed);
    seed
}

struct MemoryTunnelServer {
    info: TunnelInfo,
    seed: Vec<u8>,
    host: String,
    port: u16,
    published: bool,
}

#[async_trait]
impl TunnelServer for MemoryTunnelServer {
    async fn ready(&mut self) -> Result<()> {
        SERVERS.insert(self.info.key.clone(), (self.host.clone(), self.port));
        self.published = true;
        tracing::debug!("tunnel server {} -> {}:{}", self.info.key, self.host, self.port);
        Ok(())
    }

    fn info(&self) -> TunnelInfo {
        self.info.clone()
    }

    fn seed(&self) -> Option<Vec<u8>> {
        Some(self.seed.clone())
    }

    async fn close(&mut self) -> Result<()> {
        if self.published {
            SERVERS.remove(&self.info.key);
            self.published = false;
        }
        Ok(())
    }
}

struct MemoryTunnelClient {
    key: String,
    host: String,
    port: u16,
    local_port: u16,
    cancel: CancellationToken,
}

#[async_trait]
impl TunnelClient for MemoryTunnelClient {
    async fn ready(&mut self) -> Result<()> {
        let target = SERVERS
            .get(&self.key)
            .map(|t| t.value().clone())
            .ok_or_else(|| Error::TunnelKeyNotFound(self.key.clone()))?;

        let listener = TcpListener::bind((self.host.as_str(), self.port)).await?;
        self.local_port = listener.local_addr()?.port();

        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    accepted = listener.accept() => {
                        let Ok((mut inbound, _)) = accepted else { break };
                        let (host, port) = target.clone();
                        tokio::spawn(async move {
                            let Ok(mut outbound) = TcpStream::connect((host.as_str(), port)).await
                            else {
                                return;
                            };
                            let _ =
                                tokio::io::copy_bidirectional(&mut inbound, &mut outbound).await;
                        });
                    }
                }
            }
        });

        Ok(())
    }

    fn local_port(&self) -> u16 {
        self.local_port
    }

    async fn close(&mut self) -> Result<()> {
        self.cancel.cancel();
        Ok(())
    }
}

#[derive(Clone)]
enum HubEvent {
    Joined { peer: String, conn: u64 },
    Left { peer: String, conn: u64 },
    Message { conn: u64, peer: String, data: Bytes },
}

struct TopicHub {
    tx: broadcast::Sender<HubEvent>,
    members: Mutex<HashMap<String, u64>>,
    next_conn: AtomicU64,
}

impl TopicHub {
    fn new() -> Self {
        let (tx, _) = broadcast::channel(1024);
        Self {
            tx,
            members: Mutex::new(HashMap::new()),
            next_conn: AtomicU64::new(1),
        }
    }
}

struct MemoryTopic {
    peer: String,
    conn: u64,
    hub: Arc<TopicHub>,
    events_rx: Option<mpsc::Receiver<SwarmEvent>>,
    closed: Arc<AtomicBool>,
    cancel: CancellationToken,
}

#[async_trait]
impl SwarmTopic for MemoryTopic {
    async fn broadcast(&self, data: Bytes) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::TunnelClosed);
        }
        let _ = self.hub.tx.send(HubEvent::Message {
            conn: self.conn,
            peer: self.peer.clone(),
            data,
        });
        Ok(())
    }

    fn events(&mut self) -> Option<mpsc::Receiver<SwarmEvent>> {
        self.events_rx.take()
    }

    fn local_peer(&self) -> String {
        self.peer.clone()
    }

    async fn close(&mut self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.cancel.cancel();
        let mut members = self.hub.members.lock().unwrap();
        if members.get(&self.peer) == Some(&self.conn) {
            members.remove(&self.peer);
            let _ = self.hub.tx.send(HubEvent::Left {
                peer: self.peer.clone(),
                conn: self.conn,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl SwarmTunnel for MemoryTunnel {
    async fn server(&self, config: TunnelServerConfig) -> Result<Box<dyn TunnelServer>> {
        let seed = config.seed.unwrap_or_else(random_seed);
        if seed.len() != 32 {
            return Err(Error::InvalidSeed);
        }
        let keypair = keypair_from_seed(&seed);
        Ok(Box::new(MemoryTunnelServer {
            info: TunnelInfo {
                key: keypair.public_key,
                secure: config.secure,
                udp: config.udp,
            },
            seed,
            host: config.host,
            port: config.port,
            published: false,
        }))
    }

    async fn client(&self, config: TunnelClientConfig) -> Result<Box<dyn TunnelClient>> {
        Ok(Box::new(MemoryTunnelClient {
            key: config.key,
            host: config.host,
            port: config.port,
            local_port: 0,
            cancel: CancellationToken::new(),
        }))
    }

    async fn join_topic(&self, key: &str) -> Result<Box<dyn SwarmTopic>> {
        let hub = TOPICS
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(TopicHub::new()))
            .clone();

        let keypair = keypair_from_seed(&random_seed());
        let peer = keypair.public_key;
        let conn = hub.next_conn.fetch_add(1, Ordering::SeqCst);

        let mut hub_rx = hub.tx.subscribe();
        {
            let mut members = hub.members.lock().unwrap();
            if let Some(old_conn) = members.insert(peer.clone(), conn) {
                // Same public key joined again: drop the older connection.
                let _ = hub.tx.send(HubEvent::Left {
                    peer: peer.clone(),
                    conn: old_conn,
                });
            }
            let _ = hub.tx.send(HubEvent::Joined {
                peer: peer.clone(),
                conn,
            });
        }

        let (events_tx, events_rx) = mpsc::channel(1024);
        let closed = Arc::new(AtomicBool::new(false));
        let cancel = CancellationToken::new();

        let pump_closed = closed.clone();
        let pump_cancel = cancel.clone();
        let self_conn = conn;
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = pump_cancel.cancelled() => break,
                    event = hub_rx.recv() => match event {
                        Ok(event) => event,
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                };
                let mapped = match event {
                    HubEvent::Joined { conn, .. } if conn == self_conn => continue,
                    HubEvent::Left { conn, peer } if conn == self_conn => {
                        // Replaced by a newer connection with the same key.
                        pump_closed.store(true, Ordering::SeqCst);
                        let _ = events_tx.send(SwarmEvent::PeerLeft { peer }).await;
                        break;
                    }
                    HubEvent::Message { conn, .. } if conn == self_conn => continue,
                    HubEvent::Joined { peer, .. } => SwarmEvent::PeerJoined { peer },
                    HubEvent::Left { peer, .. } => SwarmEvent::PeerLeft { peer },
                    HubEvent::Message { peer, data, .. } => SwarmEvent::Message { peer, data },
                };
                if events_tx.send(mapped).await.is_err() {
                    break;
                }
            }
        });

        Ok(Box::new(MemoryTopic {
            peer,
            conn,
            hub,
            events_rx: Some(events_rx),
            closed,
            cancel,
        }))
    }

    fn generate_keypair(&self) -> TunnelKeypair {
        keypair_from_seed(&random_seed())
    }
}

/// Canned-response [HyperFetcher] for local testing.
#[derive(Default)]
pub struct MemoryFetcher {
    responses: DashMap<(String, String), (u16, Vec<(String, String)>, Bytes)>,
    requests: Mutex<Vec<(String, String)>>,
}

impl MemoryFetcher {
    /// Create a fetcher with no canned responses.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a canned response for `method` + `url`.
    pub fn register(
        &self,
        method: &str,
        url: &str,
        status: u16,
        headers: Vec<(String, String)>,
        body: impl Into<Bytes>,
    ) {
        self.responses.insert(
            (method.to_uppercase(), url.to_string()),
            (status, headers, body.into()),
        );
    }

    /// Method + URL pairs seen so far.
    pub fn seen_requests(&self) -> Vec<(String, String)> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl HyperFetcher for MemoryFetcher {
    async fn fetch(&self, request: FetchRequest) -> Result<FetchResponse> {
        self.requests
            .lock()
            .unwrap()
            .push((request.method.clone(), request.url.clone()));

        let key = (request.method.to_uppercase(), request.url.clone());
        let Some(canned) = self.responses.get(&key) else {
            return Err(Error::Fetch(format!("no route for {}", request.url)));
        };
        let (status, headers, body) = canned.value().clone();
        Ok(FetchResponse {
            status,
            headers,
            body: stream::once(async move { Ok(body) }).boxed(),
        })
    }
}

#[cfg(test)]
mod tests {
    use futures::TryStreamExt;

    use super::*;

    #[tokio::test]
    async fn test_tree_cid_is_deterministic() {
        let network = MemoryNetwork::new();
        let a = network.put_tree(vec![("index.html", b"<html>" as &[u8])]);
        let b = network.put_tree(vec![("index.html", b"<html>" as &[u8])]);
        assert_eq!(a, b);
        assert_eq!(a.version(), cid::Version::V1);
    }

    #[tokio::test]
    async fn test_stat_and_ls() {
        let network = MemoryNetwork::new();
        let root = network.put_tree(vec![
            ("index.html", b"hi" as &[u8]),
            ("wiki/Foo", b"foo" as &[u8]),
        ]);

        let stat = network.stat(&root, "").await.unwrap();
        assert_eq!(stat.kind, EntryKind::Directory);

        let stat = network.stat(&root, "wiki/Foo").await.unwrap();
        assert_eq!(stat.kind, EntryKind::File);

        let entries = network.ls(&root, "").await.unwrap();
        let names: Vec<_> = entries.iter().map(|e| e.name.as_str()).collect();
        assert!(names.contains(&"index.html"));
        assert!(names.contains(&"wiki"));
    }

    #[tokio::test]
    async fn test_cat_directory_is_not_a_file() {
        let network = MemoryNetwork::new();
        let root = network.put_tree(vec![("wiki/Foo", b"foo" as &[u8])]);
        let err = network.cat(&root, "wiki").await.err().unwrap();
        assert!(matches!(err, Error::NotAFile(_)));
    }

    #[tokio::test]
    async fn test_seed_regenerates_same_key() {
        let tunnel = MemoryTunnel::new();
        let mut first = tunnel
            .server(TunnelServerConfig {
                host: "127.0.0.1".to_string(),
                port: 9000,
                ..Default::default()
            })
            .await
            .unwrap();
        let seed = first.seed().unwrap();
        let key = first.info().key;
        first.close().await.unwrap();

        let second = tunnel
            .server(TunnelServerConfig {
                host: "127.0.0.1".to_string(),
                port: 9001,
                seed: Some(seed),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(second.info().key, key);
    }

    #[tokio::test]
    async fn test_topic_peer_replacement() {
        let tunnel = MemoryTunnel::new();
        let mut a = tunnel.join_topic("room-replacement").await.unwrap();
        let mut b = tunnel.join_topic("room-replacement").await.unwrap();
        let mut b_events = b.events().unwrap();

        a.broadcast(Bytes::from_static(b"hello")).await.unwrap();

        let mut saw_message = false;
        while let Ok(Some(event)) =
            tokio::time::timeout(Duration::from_secs(1), b_events.recv()).await
        {
            if let SwarmEvent::Message { data, .. } = event {
                assert_eq!(&data[..], b"hello");
                saw_message = true;
                break;
            }
        }
        assert!(saw_message);

        a.close().await.unwrap();
        b.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_memory_fetcher_roundtrip() {
        let fetcher = MemoryFetcher::new();
        fetcher.register("GET", "hyper://example/", 200, vec![], "ok");
        let response = fetcher
            .fetch(FetchRequest {
                url: "hyper://example/".to_string(),
                method: "GET".to_string(),
                headers: vec![],
                body: None,
            })
            .await
            .unwrap();
        assert_eq!(response.status, 200);
        let body: Vec<Bytes> = response.body.try_collect().await.unwrap();
        assert_eq!(&body[0][..], b"ok");
    }
}
