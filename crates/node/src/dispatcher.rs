//! The protocol dispatcher.
//!
//! The single entry point the shell invokes for request handling. Routes by
//! scheme, owns the resolvers and the room services, and guarantees exactly
//! one response envelope per request: typed failures become their mapped
//! status, panics become a 500 with a textual backtrace.

use std::panic::AssertUnwindSafe;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

use futures::FutureExt;
use url::Url;

use crate::envelope::body_from_bytes;
use crate::envelope::Request;
use crate::envelope::Response;
use crate::error::Error;
use crate::error::Result;
use crate::installer::archive::safe_join;
use crate::resolver::ens::Contenthash;
use crate::resolver::ens::EnsResolver;
use crate::resolver::hyper::HyperResolver;
use crate::resolver::ipfs::decode_path;
use crate::resolver::ipfs::to_v1;
use crate::resolver::ipfs::IpfsPath;
use crate::resolver::ipfs::IpfsResolver;
use crate::rooms::ChatService;
use crate::rooms::RoomService;

/// See the module docs.
pub struct Dispatcher {
    ipfs: IpfsResolver,
    ens: EnsResolver,
    hyper: HyperResolver,
    rooms: Arc<RoomService>,
    chat: Arc<ChatService>,
    assets_dir: Option<PathBuf>,
    extensions_dir: Option<PathBuf>,
}

impl Dispatcher {
    /// Assemble a dispatcher from its resolvers and services.
    pub fn new(
        ipfs: IpfsResolver,
        ens: EnsResolver,
        hyper: HyperResolver,
        rooms: Arc<RoomService>,
        chat: Arc<ChatService>,
    ) -> Self {
        Self {
            ipfs,
            ens,
            hyper,
            rooms,
            chat,
            assets_dir: None,
            extensions_dir: None,
        }
    }

    /// Serve bundled `peersky://` assets from `dir`.
    pub fn with_assets_dir(mut self, dir: PathBuf) -> Self {
        self.assets_dir = Some(dir);
        self
    }

    /// Serve `peersky://extension-icon/` from installed bundles under `dir`.
    pub fn with_extensions_dir(mut self, dir: PathBuf) -> Self {
        self.extensions_dir = Some(dir);
        self
    }

    /// Handle one request. Always produces exactly one response.
    pub async fn handle(&self, request: Request) -> Response {
        match AssertUnwindSafe(self.dispatch(&request)).catch_unwind().await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                tracing::warn!("Request for {} failed: {e}", request.url);
                Response::from_error(&e)
            }
            Err(panic) => {
                let reason = panic
                    .downcast_ref::<String>()
                    .map(String::as_str)
                    .or_else(|| panic.downcast_ref::<&str>().copied())
                    .unwrap_or("unknown panic");
                let trace = backtrace::Backtrace::new();
                tracing::error!("Handler for {} panicked: {reason}\n{trace:?}", request.url);
                Response::text(500, format!("internal error: {reason}\n{trace:?}"))
            }
        }
    }

    async fn dispatch(&self, request: &Request) -> Result<Response> {
        let url = request.parse_url()?;
        let host = url.host_str().unwrap_or("").to_string();

        // ENS hostnames re-enter IPFS/IPNS resolution whatever the scheme.
        if host.ends_with(".eth") {
            return self.fetch_ens(&host, &url).await;
        }

        match url.scheme() {
            "ipfs" => {
                if request.upload.is_some() {
                    return self.ipfs.upload(request, &url).await;
                }
                let path = self.ipfs.resolve_cid(&url)?;
                self.ipfs.fetch(&path).await
            }
            "ipns" => {
                if host.is_empty() {
                    return Err(Error::MalformedUrl(request.url.clone()));
                }
                let segments = decode_path(url.path())?;
                let path = self.ipfs.resolve_ipns(&host, segments).await?;
                self.ipfs.fetch(&path).await
            }
            "hyper" => {
                if host == "chat" || url.path().starts_with("/chat") {
                    return self.chat.handle(request).await;
                }
                self.hyper.fetch(request).await
            }
            "hs" => self.rooms.handle(request).await,
            "peersky" => self.serve_internal(&host, &url).await,
            other => Err(Error::UnsupportedScheme(other.to_string())),
        }
    }

    async fn fetch_ens(&self, host: &str, url: &Url) -> Result<Response> {
        let segments = decode_path(url.path())?;
        match self.ens.resolve(host).await? {
            Contenthash::Ipfs(cid) => {
                let path = IpfsPath {
                    root: to_v1(cid),
                    segments,
                };
                self.ipfs.fetch(&path).await
            }
            Contenthash::Ipns(name) => {
                let path = self.ipfs.resolve_ipns(&name, segments).await?;
                self.ipfs.fetch(&path).await
            }
        }
    }

    async fn serve_internal(&self, host: &str, url: &Url) -> Result<Response> {
        if host == "extension-icon" {
            return self.serve_extension_icon(url).await;
        }
        let Some(assets) = &self.assets_dir else {
            return Err(Error::NotFound(url.to_string()));
        };
        let relative = format!("{host}{}", url.path());
        let mut target = safe_join(assets, relative.trim_matches('/'))
            .map_err(|_| Error::NotFound(url.to_string()))?;
        if target.is_dir() {
            target = target.join("index.html");
        }
        serve_file(&target, url).await
    }

    /// `peersky://extension-icon/<id>/<size>` resolves through the installed
    /// bundle's manifest.
    async fn serve_extension_icon(&self, url: &Url) -> Result<Response> {
        let Some(extensions) = &self.extensions_dir else {
            return Err(Error::NotFound(url.to_string()));
        };
        let mut segments = url.path().trim_matches('/').split('/');
        let (Some(id), Some(size)) = (segments.next(), segments.next()) else {
            return Err(Error::MalformedPath(url.path().to_string()));
        };

        let bundle_root = safe_join(extensions, id)
            .map_err(|_| Error::NotFound(url.to_string()))?;
        let version_dir = std::fs::read_dir(&bundle_root)
            .ok()
            .and_then(|mut entries| entries.find_map(|e| e.ok()).map(|e| e.path()))
            .ok_or_else(|| Error::NotFound(url.to_string()))?;

        let manifest: serde_json::Value = serde_json::from_slice(
            &std::fs::read(version_dir.join("manifest.json"))
                .map_err(|_| Error::NotFound(url.to_string()))?,
        )?;
        let icon = manifest
            .get("icons")
            .and_then(|icons| icons.get(size))
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::NotFound(url.to_string()))?;
        let target = safe_join(&version_dir, icon.trim_start_matches('/'))
            .map_err(|_| Error::NotFound(url.to_string()))?;
        serve_file(&target, url).await
    }
}

async fn serve_file(target: &Path, url: &Url) -> Result<Response> {
    let bytes = tokio::fs::read(target)
        .await
        .map_err(|_| Error::NotFound(url.to_string()))?;
    let mime = mime_guess::from_path(target)
        .first_or_octet_stream()
        .to_string();
    Ok(Response::stream(200, &mime, body_from_bytes(bytes)))
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use futures::TryStreamExt;
    use peersky_transport::connections::memory::MemoryFetcher;
    use peersky_transport::connections::memory::MemoryNetwork;
    use peersky_transport::connections::memory::MemoryTunnel;

    use super::*;
    use crate::store::EnsCache;
    use crate::store::HyperCache;
    use crate::store::RoomPortTable;

    struct Fixture {
        dispatcher: Dispatcher,
        network: Arc<MemoryNetwork>,
        #[allow(dead_code)]
        dir: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let network = Arc::new(MemoryNetwork::new());
        let tunnel = Arc::new(MemoryTunnel::new());

        let ens_cache = Arc::new(EnsCache::load(dir.path().join("ensCache.json")));
        let hyper_cache = Arc::new(HyperCache::load(dir.path().join("hyper-cache.json")));
        let ports = Arc::new(RoomPortTable::load(dir.path().join("peersky-ports.json")));

        let dispatcher = Dispatcher::new(
            IpfsResolver::new(network.clone()),
            // Unroutable RPC endpoint: anything not in the cache must fail
            // fast rather than hit the network.
            EnsResolver::new("http://127.0.0.1:1".to_string(), ens_cache.clone()),
            HyperResolver::new(Arc::new(MemoryFetcher::new()), hyper_cache),
            Arc::new(RoomService::new(tunnel.clone(), ports)),
            Arc::new(ChatService::new(tunnel)),
        )
        .with_assets_dir(dir.path().join("assets"));

        // Pre-seed the ENS cache for the .eth tests.
        let tree = network.put_tree(vec![("readme.md", b"# peersky".as_slice())]);
        let mut contenthash = vec![0xe3, 0x01];
        contenthash.extend(tree.to_bytes());
        ens_cache.insert("vitalik.eth", contenthash);

        Fixture {
            dispatcher,
            network,
            dir,
        }
    }

    async fn body_text(response: Response) -> String {
        let chunks: Vec<Bytes> = response.body.try_collect().await.unwrap();
        String::from_utf8_lossy(&chunks.concat()).to_string()
    }

    fn header<'a>(response: &'a Response, name: &str) -> Option<&'a str> {
        response
            .headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    #[tokio::test]
    async fn test_ipfs_file_fetch() {
        let fixture = fixture();
        let root = fixture
            .network
            .put_tree(vec![("index.html", b"<html>hi</html>".as_slice())]);

        let response = fixture
            .dispatcher
            .handle(Request::get(format!("ipfs://{root}/index.html")))
            .await;
        assert_eq!(response.status, 200);
        assert_eq!(
            header(&response, "Content-Type"),
            Some("text/html; charset=utf-8")
        );
        assert_eq!(header(&response, "Access-Control-Allow-Origin"), Some("*"));
        assert_eq!(body_text(response).await, "<html>hi</html>");
    }

    #[tokio::test]
    async fn test_ipns_dnslink_fetch() {
        let fixture = fixture();
        let root = fixture
            .network
            .put_tree(vec![("wiki/Foo", b"article".as_slice())]);
        fixture
            .network
            .publish_dnslink("en.wikipedia-on-ipfs.org", root, "");

        let response = fixture
            .dispatcher
            .handle(Request::get("ipns://en.wikipedia-on-ipfs.org/wiki/Foo"))
            .await;
        assert_eq!(response.status, 200);
        assert_eq!(body_text(response).await, "article");
    }

    #[tokio::test]
    async fn test_ens_cached_hit_serves_listing() {
        let fixture = fixture();
        let response = fixture
            .dispatcher
            .handle(Request::get("ipfs://vitalik.eth/"))
            .await;
        assert_eq!(response.status, 200);
        let body = body_text(response).await;
        assert!(body.contains("readme.md"));
    }

    #[tokio::test]
    async fn test_unknown_scheme_is_an_envelope() {
        let fixture = fixture();
        let response = fixture
            .dispatcher
            .handle(Request::get("gopher://example/"))
            .await;
        assert_eq!(response.status, 400);
        assert!(body_text(response).await.contains("error"));
    }

    #[tokio::test]
    async fn test_unknown_room_action_is_404() {
        let fixture = fixture();
        let response = fixture
            .dispatcher
            .handle(Request::get("hs://p2pmd?action=explode"))
            .await;
        assert_eq!(response.status, 404);
    }

    #[tokio::test]
    async fn test_ipfs_upload_roundtrip() {
        let fixture = fixture();
        let mut request = Request::get("ipfs://localhost/notes.txt");
        request.method = "PUT".to_string();
        request.upload = Some(crate::envelope::UploadSource::Bytes(Bytes::from_static(
            b"remember this",
        )));

        let response = fixture.dispatcher.handle(request).await;
        assert_eq!(response.status, 201);
        let location = header(&response, "Location").unwrap().to_string();
        assert!(location.starts_with("ipfs://"));
        assert!(location.ends_with('/'));

        let fetched = fixture
            .dispatcher
            .handle(Request::get(format!("{location}notes.txt")))
            .await;
        assert_eq!(fetched.status, 200);
        assert_eq!(body_text(fetched).await, "remember this");
    }

    #[tokio::test]
    async fn test_peersky_asset_responder() {
        let fixture = fixture();
        let assets = fixture.dir.path().join("assets/static");
        std::fs::create_dir_all(&assets).unwrap();
        std::fs::write(assets.join("app.css"), b"body {}").unwrap();

        let response = fixture
            .dispatcher
            .handle(Request::get("peersky://static/app.css"))
            .await;
        assert_eq!(response.status, 200);
        assert_eq!(header(&response, "Content-Type"), Some("text/css"));

        let missing = fixture
            .dispatcher
            .handle(Request::get("peersky://static/nope.css"))
            .await;
        assert_eq!(missing.status, 404);
    }
}
