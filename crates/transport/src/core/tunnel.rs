//! The [SwarmTunnel] trait and its value types.
//!
//! A tunnel endpoint is published under an opaque public key. Anyone holding
//! the key can complete a handshake and have bytes forwarded to the host
//! that published it. A stored seed regenerates the same keypair, and thus
//! the same public key, deterministically.

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::error::Result;

/// Configuration for publishing a tunnel server.
#[derive(Debug, Clone, Default)]
pub struct TunnelServerConfig {
    /// Require an encrypted handshake.
    pub secure: bool,
    /// Forward UDP instead of TCP.
    pub udp: bool,
    /// Local host traffic is forwarded to.
    pub host: String,
    /// Local port traffic is forwarded to.
    pub port: u16,
    /// Keypair material to replay. `None` generates a fresh keypair.
    pub seed: Option<Vec<u8>>,
}

/// Configuration for dialing a published tunnel.
#[derive(Debug, Clone, Default)]
pub struct TunnelClientConfig {
    /// Public key of the remote endpoint.
    pub key: String,
    /// Local host to expose the remote endpoint on.
    pub host: String,
    /// Local port to expose the remote endpoint on. `0` picks a free port.
    pub port: u16,
    /// Require an encrypted handshake.
    pub secure: bool,
    /// Forward UDP instead of TCP.
    pub udp: bool,
}

/// Public description of a live tunnel server.
#[derive(Debug, Clone)]
pub struct TunnelInfo {
    /// Public key the endpoint is published under (unprefixed hex).
    pub key: String,
    /// Whether the handshake is encrypted.
    pub secure: bool,
    /// Whether UDP is forwarded.
    pub udp: bool,
}

/// A keypair generated by the tunnel implementation.
#[derive(Debug, Clone)]
pub struct TunnelKeypair {
    /// Public key, hex encoded.
    pub public_key: String,
    /// Secret key, hex encoded.
    pub secret_key: String,
}

/// Server side of a tunnel. Created by [SwarmTunnel::server].
#[async_trait]
pub trait TunnelServer: Send + Sync {
    /// Publish the endpoint. After this returns, traffic for the public key
    /// is forwarded to the configured host and port.
    async fn ready(&mut self) -> Result<()>;

    /// Public description of the endpoint.
    fn info(&self) -> TunnelInfo;

    /// Keypair material that regenerates the same public key when passed
    /// back via [TunnelServerConfig::seed].
    fn seed(&self) -> Option<Vec<u8>>;

    /// Unpublish the endpoint and drop all connections. Idempotent.
    async fn close(&mut self) -> Result<()>;
}

/// Client side of a tunnel. Created by [SwarmTunnel::client].
#[async_trait]
pub trait TunnelClient: Send + Sync {
    /// Dial the remote endpoint. After this returns, connecting to the local
    /// port forwards to the remote endpoint.
    async fn ready(&mut self) -> Result<()>;

    /// Local port the remote endpoint is exposed on.
    fn local_port(&self) -> u16;

    /// Stop forwarding and drop all connections. Idempotent.
    async fn close(&mut self) -> Result<()>;
}

/// Event delivered to a topic subscriber.
#[derive(Debug, Clone)]
pub enum SwarmEvent {
    /// A remote peer joined the topic.
    PeerJoined {
        /// Public key of the peer.
        peer: String,
    },
    /// A remote peer left the topic, or its connection was replaced.
    PeerLeft {
        /// Public key of the peer.
        peer: String,
    },
    /// A remote peer broadcast a message.
    Message {
        /// Public key of the sender.
        peer: String,
        /// Raw message bytes.
        data: Bytes,
    },
}

/// A joined gossip topic. Created by [SwarmTunnel::join_topic].
///
/// When a joining peer presents a public key that is already present, the
/// implementation drops the older connection and reports it as [SwarmEvent::PeerLeft]
/// before the new [SwarmEvent::PeerJoined].
#[async_trait]
pub trait SwarmTopic: Send + Sync {
    /// Broadcast `data` to every other member of the topic.
    async fn broadcast(&self, data: Bytes) -> Result<()>;

    /// Take the event receiver. Returns `None` after the first call.
    fn events(&mut self) -> Option<mpsc::Receiver<SwarmEvent>>;

    /// This node's public key on the topic.
    fn local_peer(&self) -> String;

    /// Leave the topic. Idempotent.
    async fn close(&mut self) -> Result<()>;
}

/// Abstract swarm stack: tunnels plus topics.
#[async_trait]
pub trait SwarmTunnel: Send + Sync {
    /// Publish a tunnel server.
    async fn server(&self, config: TunnelServerConfig) -> Result<Box<dyn TunnelServer>>;

    /// Dial a published tunnel.
    async fn client(&self, config: TunnelClientConfig) -> Result<Box<dyn TunnelClient>>;

    /// Join the gossip topic identified by `key`.
    async fn join_topic(&self, key: &str) -> Result<Box<dyn SwarmTopic>>;

    /// Generate a fresh keypair with the implementation's key scheme.
    fn generate_keypair(&self) -> TunnelKeypair;
}
