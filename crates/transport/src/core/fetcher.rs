//! The [HyperFetcher] trait.
//!
//! `hyper://` URLs are fetched through whatever drive/swarm stack the host
//! application provides. The gateway only shapes requests and responses.

use async_trait::async_trait;
use bytes::Bytes;

use crate::core::network::ByteStream;
use crate::error::Result;

/// A request forwarded to the hyper stack.
#[derive(Debug)]
pub struct FetchRequest {
    /// Full `hyper://` URL, query string included.
    pub url: String,
    /// HTTP method name, uppercase.
    pub method: String,
    /// Request headers in arrival order.
    pub headers: Vec<(String, String)>,
    /// Request body, already materialized.
    pub body: Option<Bytes>,
}

/// A response from the hyper stack.
pub struct FetchResponse {
    /// Status code.
    pub status: u16,
    /// Response headers in arrival order.
    pub headers: Vec<(String, String)>,
    /// Lazy response body.
    pub body: ByteStream,
}

/// Abstract fetcher for `hyper://` URLs.
#[async_trait]
pub trait HyperFetcher: Send + Sync {
    /// Perform the fetch. Implementations map transport failures to
    /// [Error::Fetch](crate::error::Error::Fetch).
    async fn fetch(&self, request: FetchRequest) -> Result<FetchResponse>;
}
