//! The main concepts of this mod are:
//!
//! The [ContentNetwork](network::ContentNetwork) trait defines how to reach a
//! content-addressed store over a DHT: stat/cat/ls/add a path below a root
//! [Cid](cid::Cid), and resolve mutable IPNS and DNSLink names. See the
//! [network] module.
//!
//! The [SwarmTunnel](tunnel::SwarmTunnel) trait defines how to publish and
//! dial NAT-piercing tunnels identified by an opaque public key, and how to
//! join gossip-style topics. See the [tunnel] module.
//!
//! The [HyperFetcher](fetcher::HyperFetcher) trait is a generic fetcher for
//! `hyper://` URLs. See the [fetcher] module.

pub mod fetcher;
pub mod network;
pub mod tunnel;
