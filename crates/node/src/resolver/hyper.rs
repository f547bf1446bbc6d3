//! The `hyper://` resolver.
//!
//! Fetching is delegated to the host-provided
//! [HyperFetcher](peersky_transport::core::fetcher::HyperFetcher); this
//! module shapes envelopes and watches drive creation responses so newly
//! created drives land in the persistent drive log.

use std::sync::Arc;

use bytes::Bytes;
use futures::StreamExt;
use futures::TryStreamExt;
use lazy_static::lazy_static;
use peersky_transport::core::fetcher::FetchRequest;
use peersky_transport::core::fetcher::FetchResponse;
use peersky_transport::core::fetcher::HyperFetcher;

use crate::envelope::body_from_bytes;
use crate::envelope::BlobStore;
use crate::envelope::Request;
use crate::envelope::Response;
use crate::envelope::UploadSource;
use crate::error::Error;
use crate::error::Result;
use crate::store::HyperCache;
use crate::store::HyperCacheEntry;

lazy_static! {
    // Drive keys are z-base-32 or hex depending on the stack, so match the
    // alphanumeric run length rather than one alphabet.
    static ref DRIVE_KEY: regex::Regex =
        regex::Regex::new("[0-9A-Za-z]{52,64}").unwrap();
}

/// See the module docs.
pub struct HyperResolver {
    fetcher: Arc<dyn HyperFetcher>,
    cache: Arc<HyperCache>,
    blobs: Option<Arc<dyn BlobStore>>,
}

impl HyperResolver {
    /// Create a resolver over `fetcher`, logging created drives to `cache`.
    pub fn new(fetcher: Arc<dyn HyperFetcher>, cache: Arc<HyperCache>) -> Self {
        Self {
            fetcher,
            cache,
            blobs: None,
        }
    }

    /// Attach a blob store for shell-held upload payloads.
    pub fn with_blob_store(mut self, blobs: Arc<dyn BlobStore>) -> Self {
        self.blobs = Some(blobs);
        self
    }

    /// Handle one `hyper://` request.
    pub async fn fetch(&self, request: &Request) -> Result<Response> {
        let url = request.parse_url()?;
        let creation_name = drive_creation_name(&url, &request.method);

        let body = match &request.upload {
            Some(upload) => Some(self.materialize(upload).await?),
            None => None,
        };

        let fetched = self
            .fetcher
            .fetch(FetchRequest {
                url: request.url.clone(),
                method: request.method.clone(),
                headers: request.headers.clone(),
                body,
            })
            .await?;

        match creation_name {
            Some(name) => self.intercept_creation(&name, fetched).await,
            None => Ok(pass_through(fetched)),
        }
    }

    /// Buffer the creation response, record the drive key it names, and
    /// replay the response to the caller unchanged.
    async fn intercept_creation(&self, name: &str, fetched: FetchResponse) -> Result<Response> {
        let chunks: Vec<Bytes> = fetched
            .body
            .map_err(Error::Transport)
            .try_collect()
            .await?;
        let buffered: Vec<u8> = chunks.iter().flat_map(|c| c.iter().copied()).collect();

        let text = String::from_utf8_lossy(&buffered);
        if let Some(found) = DRIVE_KEY.find(&text) {
            let key = found.as_str();
            if !self.cache.contains_key(key) {
                tracing::info!("Recording created hyper drive {name} -> {key}");
                self.cache.append(HyperCacheEntry::drive(name, key));
            }
        } else {
            tracing::warn!("Drive creation response for {name} carried no key");
        }

        let mut response = pass_through_headers(fetched.status, fetched.headers);
        response.body = body_from_bytes(buffered);
        Ok(response)
    }

    async fn materialize(&self, upload: &UploadSource) -> Result<Bytes> {
        match upload {
            UploadSource::Bytes(bytes) => Ok(bytes.clone()),
            UploadSource::File(path) => {
                let bytes = tokio::fs::read(path).await.map_err(|e| {
                    Error::OpenFileError(format!("{}: {e}", path.display()))
                })?;
                Ok(Bytes::from(bytes))
            }
            UploadSource::Blob(uuid) => {
                let blobs = self
                    .blobs
                    .as_ref()
                    .ok_or_else(|| Error::MalformedInput("no blob store attached".to_string()))?;
                blobs.get(uuid).await
            }
            UploadSource::MultipartForm(_) => Err(Error::MalformedInput(
                "multipart uploads are not supported on hyper://".to_string(),
            )),
        }
    }
}

/// The `?key=<name>` creation interceptor applies to POST requests only.
fn drive_creation_name(url: &url::Url, method: &str) -> Option<String> {
    if method != "POST" {
        return None;
    }
    url.query_pairs()
        .find(|(k, _)| k == "key")
        .map(|(_, v)| v.into_owned())
}

fn pass_through(fetched: FetchResponse) -> Response {
    let mut response = pass_through_headers(fetched.status, fetched.headers);
    response.body = fetched.body.map(|c| c.map_err(Error::Transport)).boxed();
    response
}

fn pass_through_headers(status: u16, headers: Vec<(String, String)>) -> Response {
    let content_type = headers
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case("content-type"))
        .map(|(_, v)| v.clone())
        .unwrap_or_else(|| "application/octet-stream".to_string());
    let mut response = Response::stream(status, &content_type, crate::envelope::empty_body());
    for (name, value) in headers {
        if name.eq_ignore_ascii_case("content-type") {
            continue;
        }
        response.headers.push((name, value));
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use peersky_transport::connections::memory::MemoryFetcher;

    fn hex_key() -> String {
        "f".repeat(64)
    }

    #[tokio::test]
    async fn test_plain_fetch_passes_through() {
        let fetcher = Arc::new(MemoryFetcher::new());
        fetcher.register("GET", "hyper://example/index.html", 200, vec![], b"hello".to_vec());

        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(HyperCache::load(dir.path().join("hyper-cache.json")));
        let resolver = HyperResolver::new(fetcher, cache.clone());

        let response = resolver
            .fetch(&Request::get("hyper://example/index.html"))
            .await
            .unwrap();
        assert_eq!(response.status, 200);
        assert!(cache.entries().is_empty());
    }

    #[tokio::test]
    async fn test_creation_response_records_drive_key() {
        let key = hex_key();
        let fetcher = Arc::new(MemoryFetcher::new());
        fetcher.register(
            "POST",
            "hyper://localhost/?key=notes",
            200,
            vec![("Content-Type".to_string(), "application/json".to_string())],
            format!("{{\"key\":\"{key}\"}}").into_bytes(),
        );

        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(HyperCache::load(dir.path().join("hyper-cache.json")));
        let resolver = HyperResolver::new(fetcher, cache.clone());

        let mut request = Request::get("hyper://localhost/?key=notes");
        request.method = "POST".to_string();
        let response = resolver.fetch(&request).await.unwrap();
        assert_eq!(response.status, 200);

        let entries = cache.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "notes");
        assert_eq!(entries[0].key, key);

        // The response body reaches the caller untouched.
        let body: Vec<Bytes> = response.body.try_collect().await.unwrap();
        let body: Vec<u8> = body.concat();
        assert!(String::from_utf8_lossy(&body).contains(&key));
    }

    #[tokio::test]
    async fn test_repeated_creation_is_logged_once() {
        let key = hex_key();
        let fetcher = Arc::new(MemoryFetcher::new());
        fetcher.register(
            "POST",
            "hyper://localhost/?key=notes",
            200,
            vec![],
            key.clone().into_bytes(),
        );

        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(HyperCache::load(dir.path().join("hyper-cache.json")));
        let resolver = HyperResolver::new(fetcher, cache.clone());

        let mut request = Request::get("hyper://localhost/?key=notes");
        request.method = "POST".to_string();
        resolver.fetch(&request).await.unwrap();

        let mut request = Request::get("hyper://localhost/?key=notes");
        request.method = "POST".to_string();
        resolver.fetch(&request).await.unwrap();

        assert_eq!(cache.entries().len(), 1);
    }

    #[tokio::test]
    async fn test_get_with_key_query_is_not_intercepted() {
        let fetcher = Arc::new(MemoryFetcher::new());
        fetcher.register("GET", "hyper://localhost/?key=notes", 200, vec![], hex_key().into_bytes());

        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(HyperCache::load(dir.path().join("hyper-cache.json")));
        let resolver = HyperResolver::new(fetcher, cache.clone());

        resolver
            .fetch(&Request::get("hyper://localhost/?key=notes"))
            .await
            .unwrap();
        assert!(cache.entries().is_empty());
    }
}
