//! A prelude is provided which imports all the important data types and traits of the gateway.
/// Use this when you want to quickly bootstrap a new embedding.
pub use peersky_transport;

pub use self::peersky_transport::core::fetcher::FetchRequest;
pub use self::peersky_transport::core::fetcher::FetchResponse;
pub use self::peersky_transport::core::fetcher::HyperFetcher;
pub use self::peersky_transport::core::network::ContentNetwork;
pub use self::peersky_transport::core::tunnel::SwarmTopic;
pub use self::peersky_transport::core::tunnel::SwarmTunnel;
pub use self::peersky_transport::core::tunnel::TunnelClient;
pub use self::peersky_transport::core::tunnel::TunnelServer;
pub use async_trait::async_trait;

pub use crate::config::Config;
pub use crate::dispatcher::Dispatcher;
pub use crate::envelope::BlobStore;
pub use crate::envelope::Request;
pub use crate::envelope::Response;
pub use crate::envelope::UploadSource;
pub use crate::installer::ExtensionPackage;
pub use crate::installer::Installer;
pub use crate::resolver::ens::EnsResolver;
pub use crate::resolver::hyper::HyperResolver;
pub use crate::resolver::ipfs::IpfsResolver;
pub use crate::rooms::ChatService;
pub use crate::rooms::RoomService;
pub use crate::store::EnsCache;
pub use crate::store::HyperCache;
pub use crate::store::RoomPortTable;
pub use crate::store::SwarmKeypair;
