#![allow(missing_docs)]

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Cid error: {0}")]
    Cid(#[from] cid::Error),

    #[error("Path {0} not found under content root")]
    PathNotFound(String),

    #[error("Path {0} is not a file")]
    NotAFile(String),

    #[error("Path {0} is not a directory")]
    NotADirectory(String),

    #[error("No IPNS record found for {0}")]
    IpnsNotFound(String),

    #[error("No DNSLink record found for {0}")]
    DnsLinkNotFound(String),

    #[error("Resolution timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("No tunnel endpoint published under key {0}")]
    TunnelKeyNotFound(String),

    #[error("Tunnel seed is not valid keypair material")]
    InvalidSeed,

    #[error("Tunnel is closed")]
    TunnelClosed,

    #[error("Fetch failed: {0}")]
    Fetch(String),
}
