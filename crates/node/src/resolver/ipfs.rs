//! The IPFS/IPNS resolver.
//!
//! Turns `ipfs://` and `ipns://` URLs into byte streams over the abstract
//! [ContentNetwork], and handles uploads back into the network.

use std::sync::Arc;

use bytes::Bytes;
use cid::Cid;
use futures::stream;
use futures::StreamExt;
use percent_encoding::percent_decode_str;
use percent_encoding::utf8_percent_encode;
use percent_encoding::AsciiSet;
use percent_encoding::CONTROLS;
use peersky_transport::core::network::AddEntry;
use peersky_transport::core::network::AddSource;
use peersky_transport::core::network::ContentNetwork;
use peersky_transport::core::network::EntryKind;
use peersky_transport::error::Error as TransportError;
use url::Url;

use crate::consts::NAME_RESOLUTION_TIMEOUT;
use crate::consts::SNIFF_WINDOW;
use crate::envelope::BlobStore;
use crate::envelope::MultipartPart;
use crate::envelope::PartBody;
use crate::envelope::Request;
use crate::envelope::Response;
use crate::envelope::UploadSource;
use crate::error::Error;
use crate::error::Result;

/// Multicodec for libp2p peer keys.
pub const LIBP2P_KEY: u64 = 0x72;

/// Characters escaped in directory-listing hrefs.
const HREF_ENCODE: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'<')
    .add(b'>')
    .add(b'#')
    .add(b'?')
    .add(b'%');

/// A resolved content root plus the decoded path below it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpfsPath {
    /// Content root, always CIDv1.
    pub root: Cid,
    /// URL-decoded path segments, empty segments discarded.
    pub segments: Vec<String>,
}

impl IpfsPath {
    /// The `/`-joined path below the root.
    pub fn joined(&self) -> String {
        self.segments.join("/")
    }
}

/// Coerce any parsed CID to version 1. Every CID emitted externally is v1.
pub fn to_v1(cid: Cid) -> Cid {
    match cid.version() {
        cid::Version::V1 => cid,
        cid::Version::V0 => Cid::new_v1(cid.codec(), *cid.hash()),
    }
}

/// Percent-decode one path segment.
fn decode_segment(segment: &str) -> Result<String> {
    percent_decode_str(segment)
        .decode_utf8()
        .map(|s| s.to_string())
        .map_err(|e| Error::MalformedPath(format!("{segment}: {e}")))
}

/// Split and decode a URL path, discarding empty segments.
pub fn decode_path(path: &str) -> Result<Vec<String>> {
    path.split('/')
        .filter(|s| !s.is_empty())
        .map(decode_segment)
        .collect()
}

/// See the module docs.
pub struct IpfsResolver {
    network: Arc<dyn ContentNetwork>,
    blobs: Option<Arc<dyn BlobStore>>,
}

impl IpfsResolver {
    /// Create a resolver over `network`.
    pub fn new(network: Arc<dyn ContentNetwork>) -> Self {
        Self {
            network,
            blobs: None,
        }
    }

    /// Attach a blob store for shell-held upload payloads.
    pub fn with_blob_store(mut self, blobs: Arc<dyn BlobStore>) -> Self {
        self.blobs = Some(blobs);
        self
    }

    /// Parse an `ipfs://<cid>/<path>` URL into an [IpfsPath].
    pub fn resolve_cid(&self, url: &Url) -> Result<IpfsPath> {
        let host = url
            .host_str()
            .ok_or_else(|| Error::MalformedCid("empty host".to_string()))?;
        let cid =
            Cid::try_from(host).map_err(|e| Error::MalformedCid(format!("{host}: {e}")))?;
        Ok(IpfsPath {
            root: to_v1(cid),
            segments: decode_path(url.path())?,
        })
    }

    /// Resolve an IPNS name (peer id or DNSLink) to an [IpfsPath].
    pub async fn resolve_ipns(&self, name: &str, segments: Vec<String>) -> Result<IpfsPath> {
        if let Some(peer) = parse_peer_id(name) {
            let cid = self
                .network
                .resolve_ipns(&peer, NAME_RESOLUTION_TIMEOUT)
                .await
                .map_err(|e| Error::IpnsUnresolved(format!("{name}: {e}")))?;
            return Ok(IpfsPath {
                root: to_v1(cid),
                segments,
            });
        }

        if name.contains('.') {
            let target = self
                .network
                .resolve_dnslink(name, NAME_RESOLUTION_TIMEOUT)
                .await
                .map_err(|e| Error::IpnsUnresolved(format!("{name}: {e}")))?;
            let mut joined = decode_path(&target.path)?;
            joined.extend(segments);
            return Ok(IpfsPath {
                root: to_v1(target.cid),
                segments: joined,
            });
        }

        Err(Error::IpnsUnresolved(name.to_string()))
    }

    /// Fetch the content at `path` and shape a response.
    pub async fn fetch(&self, path: &IpfsPath) -> Result<Response> {
        let joined = path.joined();
        let stat = self
            .network
            .stat(&path.root, &joined)
            .await
            .map_err(|e| match e {
                TransportError::PathNotFound(p) => Error::NotFound(p),
                other => Error::Transport(other),
            })?;

        match stat.kind {
            EntryKind::File => match self.stream_file(path, &joined).await {
                Ok(response) => Ok(response),
                // Transport disagreed mid-flight: retry as a listing.
                Err(Error::Transport(TransportError::NotAFile(_))) => {
                    self.directory_response(path, &joined).await
                }
                Err(e) => Err(e),
            },
            EntryKind::Directory => self.directory_response(path, &joined).await,
        }
    }

    async fn stream_file(&self, path: &IpfsPath, joined: &str) -> Result<Response> {
        let body = self.network.cat(&path.root, joined).await?;
        let filename = path.segments.last().map(|s| s.as_str()).unwrap_or("");
        let (content_type, body) = negotiate_content_type(filename, body).await?;
        Ok(Response::stream(200, &content_type, body))
    }

    async fn directory_response(&self, path: &IpfsPath, joined: &str) -> Result<Response> {
        // Prefer an index.html inside the directory.
        let index_path = if joined.is_empty() {
            "index.html".to_string()
        } else {
            format!("{}/index.html", joined.trim_end_matches('/'))
        };
        if let Ok(stat) = self.network.stat(&path.root, &index_path).await {
            if stat.kind == EntryKind::File {
                let body = self.network.cat(&path.root, &index_path).await?;
                let body = body.map(|chunk| chunk.map_err(Error::Transport)).boxed();
                return Ok(Response::stream(200, "text/html; charset=utf-8", body));
            }
        }

        let entries = self.network.ls(&path.root, joined).await?;
        let mut items = String::new();
        if !path.segments.is_empty() {
            items.push_str("<li><a href=\"../\">../</a></li>\n");
        }
        for entry in entries {
            let encoded = utf8_percent_encode(&entry.name, HREF_ENCODE).to_string();
            let escaped = escape_html(&entry.name);
            let (href, label) = match entry.kind {
                EntryKind::Directory => (format!("{encoded}/"), format!("{escaped}/")),
                EntryKind::File => (encoded, escaped),
            };
            items.push_str(&format!("<li><a href=\"{href}\">{label}</a></li>\n"));
        }
        let title = escape_html(&format!("/{joined}"));
        let page = format!(
            "<!DOCTYPE html>\n<html>\n<head><meta charset=\"utf-8\"><title>Index of {title}</title></head>\n<body>\n<h1>Index of {title}</h1>\n<ul>\n{items}</ul>\n</body>\n</html>\n"
        );
        Ok(Response::html(200, page))
    }

    /// Handle a PUT/POST upload to an `ipfs://` URL.
    pub async fn upload(&self, request: &Request, url: &Url) -> Result<Response> {
        if request.method != "PUT" && request.method != "POST" {
            return Err(Error::MethodNotAllowed(request.method.clone()));
        }
        let Some(upload) = &request.upload else {
            return Err(Error::MalformedInput("upload body missing".to_string()));
        };

        let fallback_name = url
            .path()
            .rsplit('/')
            .find(|s| !s.is_empty())
            .unwrap_or("file")
            .to_string();
        let entries = self.materialize(upload, &fallback_name).await?;
        if entries.is_empty() {
            return Err(Error::MalformedInput("upload is empty".to_string()));
        }

        let root = to_v1(self.network.add(entries, true).await?);
        let location = format!("ipfs://{root}/");

        // The pin must land before success is reported; the provide is
        // fire-and-forget.
        if let Err(e) = self.network.pin_recursive(&root).await {
            tracing::warn!("Pinning {root} failed: {e}");
        }
        let network = self.network.clone();
        let provide_root = root;
        tokio::spawn(async move {
            if let Err(e) = network.provide(&provide_root).await {
                tracing::warn!("DHT provide for {provide_root} failed: {e}");
            }
        });

        Ok(Response::text(201, location.clone()).with_header("Location", &location))
    }

    async fn materialize(
        &self,
        upload: &UploadSource,
        fallback_name: &str,
    ) -> Result<Vec<AddEntry>> {
        match upload {
            UploadSource::Bytes(bytes) => Ok(vec![AddEntry {
                path: fallback_name.to_string(),
                source: AddSource::Bytes(bytes.clone()),
            }]),
            UploadSource::File(path) => {
                if path.is_dir() {
                    let mut entries = vec![];
                    for entry in walkdir::WalkDir::new(path).follow_links(false) {
                        let entry = entry.map_err(|e| Error::OpenFileError(e.to_string()))?;
                        if !entry.file_type().is_file() {
                            continue;
                        }
                        let relative = entry
                            .path()
                            .strip_prefix(path)
                            .map_err(|e| Error::OpenFileError(e.to_string()))?;
                        entries.push(AddEntry {
                            path: relative.to_string_lossy().replace('\\', "/"),
                            source: AddSource::LocalFile(entry.path().to_path_buf()),
                        });
                    }
                    Ok(entries)
                } else {
                    let basename = path
                        .file_name()
                        .map(|n| n.to_string_lossy().to_string())
                        .unwrap_or_else(|| fallback_name.to_string());
                    Ok(vec![AddEntry {
                        path: basename,
                        source: AddSource::LocalFile(path.clone()),
                    }])
                }
            }
            UploadSource::Blob(uuid) => {
                let bytes = self.fetch_blob(uuid).await?;
                Ok(vec![AddEntry {
                    path: fallback_name.to_string(),
                    source: AddSource::Bytes(bytes),
                }])
            }
            UploadSource::MultipartForm(parts) => self.materialize_multipart(parts).await,
        }
    }

    async fn materialize_multipart(&self, parts: &[MultipartPart]) -> Result<Vec<AddEntry>> {
        let mut entries = vec![];
        // Some transports split a part into a metadata entry followed by a
        // blob entry carrying the payload.
        let mut pending_name: Option<String> = None;
        for (index, part) in parts.iter().enumerate() {
            let name = part
                .filename
                .clone()
                .or_else(|| pending_name.take())
                .unwrap_or_else(|| format!("file-{index}"));
            let Some(body) = &part.body else {
                pending_name = Some(name);
                continue;
            };
            let source = match body {
                PartBody::Bytes(bytes) => AddSource::Bytes(bytes.clone()),
                PartBody::File(path) => AddSource::LocalFile(path.clone()),
                PartBody::Blob(uuid) => AddSource::Bytes(self.fetch_blob(uuid).await?),
            };
            entries.push(AddEntry { path: name, source });
        }
        Ok(entries)
    }

    async fn fetch_blob(&self, uuid: &str) -> Result<Bytes> {
        let Some(blobs) = &self.blobs else {
            return Err(Error::MalformedInput(format!(
                "no blob store to resolve {uuid}"
            )));
        };
        blobs.get(uuid).await
    }
}

/// Entity-escape text interpolated into listing HTML.
fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            other => out.push(other),
        }
    }
    out
}

/// Parse an IPNS name as a peer id: base58btc multihash (leading `1`/`Q`)
/// or a CID-encoded key.
fn parse_peer_id(name: &str) -> Option<Cid> {
    if name.starts_with('1') || name.starts_with('Q') {
        let bytes = multibase::Base::Base58Btc.decode(name).ok()?;
        let hash = cid::multihash::Multihash::from_bytes(&bytes).ok()?;
        return Some(Cid::new_v1(LIBP2P_KEY, hash));
    }
    Cid::try_from(name).ok().map(to_v1)
}

/// Decide a content type for `filename`, sniffing the head of `body` when
/// the extension is absent or says octet-stream.
async fn negotiate_content_type(
    filename: &str,
    body: peersky_transport::core::network::ByteStream,
) -> Result<(String, crate::envelope::Body)> {
    let guess = mime_guess::from_path(filename).first();
    let needs_sniff = match &guess {
        None => true,
        Some(mime) => *mime == mime_guess::mime::APPLICATION_OCTET_STREAM,
    };

    let mut body = body;
    if !needs_sniff {
        let mime = guess.map(|m| m.to_string()).unwrap_or_default();
        // Text types get an explicit charset, same as the sniffed branch.
        let mime = if mime.starts_with("text/") {
            format!("{mime}; charset=utf-8")
        } else {
            mime
        };
        let mapped = body.map(|chunk| chunk.map_err(Error::Transport)).boxed();
        return Ok((mime, mapped));
    }

    // Buffer up to the sniff window, then stitch the stream back together.
    let mut head: Vec<Bytes> = vec![];
    let mut seen = 0usize;
    while seen < SNIFF_WINDOW {
        match body.next().await {
            Some(chunk) => {
                let chunk = chunk?;
                seen += chunk.len();
                head.push(chunk);
            }
            None => break,
        }
    }

    let window: Vec<u8> = head
        .iter()
        .flat_map(|c| c.iter().copied())
        .take(SNIFF_WINDOW)
        .collect();
    let window = String::from_utf8_lossy(&window).to_lowercase();
    let content_type = if ["<html", "<!doctype html", "<head>", "<body>"]
        .iter()
        .any(|marker| window.contains(marker))
    {
        "text/html; charset=utf-8".to_string()
    } else {
        "application/octet-stream".to_string()
    };

    let restored = stream::iter(head.into_iter().map(Ok))
        .chain(body.map(|chunk| chunk.map_err(Error::Transport)))
        .boxed();
    Ok((content_type, restored))
}

#[cfg(test)]
mod tests {
    use futures::TryStreamExt;
    use peersky_transport::connections::memory::MemoryNetwork;

    use super::*;

    #[tokio::test]
    async fn test_extension_guess_carries_charset() {
        let body = stream::once(async { Ok::<_, TransportError>(Bytes::from_static(b"hello")) })
            .boxed();
        let (mime, _) = negotiate_content_type("notes.txt", body).await.unwrap();
        assert_eq!(mime, "text/plain; charset=utf-8");

        let body =
            stream::once(async { Ok::<_, TransportError>(Bytes::from_static(b"png")) }).boxed();
        let (mime, _) = negotiate_content_type("icon.png", body).await.unwrap();
        assert_eq!(mime, "image/png");
    }

    #[tokio::test]
    async fn test_listing_escapes_entry_names() {
        let network = Arc::new(MemoryNetwork::new());
        let root = network.put_tree(vec![("<script>alert(1)</script>.txt", b"x".as_slice())]);
        let resolver = IpfsResolver::new(network);
        let path = IpfsPath {
            root: to_v1(root),
            segments: vec![],
        };

        let response = resolver.fetch(&path).await.unwrap();
        let chunks: Vec<Bytes> = response.body.try_collect().await.unwrap();
        let page = String::from_utf8_lossy(&chunks.concat()).to_string();
        assert!(page.contains("&lt;script&gt;alert(1)&lt;/script&gt;.txt"));
        assert!(!page.contains("<script>"));
    }

    #[test]
    fn test_v0_cid_is_coerced_to_v1() {
        let v0 = Cid::try_from("QmdfTbBqBPQ7VNxZEYEj14VmRuZBkqFbiwReogJgS1zR1n").unwrap();
        assert_eq!(v0.version(), cid::Version::V0);
        let v1 = to_v1(v0);
        assert_eq!(v1.version(), cid::Version::V1);
        assert_eq!(v1.hash(), v0.hash());
        // Idempotent on v1.
        assert_eq!(to_v1(v1), v1);
    }

    #[test]
    fn test_decode_path_discards_empty_segments() {
        let segments = decode_path("/wiki//Foo%20Bar/").unwrap();
        assert_eq!(segments, vec!["wiki".to_string(), "Foo Bar".to_string()]);
    }

    #[test]
    fn test_invalid_cid_is_rejected() {
        let url = Url::parse("ipfs://not-a-cid/").unwrap();
        let resolver = noop_resolver();
        let err = resolver.resolve_cid(&url).err().unwrap();
        assert!(matches!(err, Error::MalformedCid(_)));
    }

    #[test]
    fn test_peer_id_base58_parses() {
        // A base58btc-encoded identity multihash.
        let peer = parse_peer_id("QmdfTbBqBPQ7VNxZEYEj14VmRuZBkqFbiwReogJgS1zR1n");
        assert!(peer.is_some());
        assert_eq!(peer.unwrap().version(), cid::Version::V1);
    }

    fn noop_resolver() -> IpfsResolver {
        struct Noop;
        #[async_trait::async_trait]
        impl ContentNetwork for Noop {
            async fn stat(
                &self,
                _: &Cid,
                path: &str,
            ) -> peersky_transport::error::Result<peersky_transport::core::network::EntryStat>
            {
                Err(TransportError::PathNotFound(path.to_string()))
            }
            async fn cat(
                &self,
                _: &Cid,
                path: &str,
            ) -> peersky_transport::error::Result<peersky_transport::core::network::ByteStream>
            {
                Err(TransportError::PathNotFound(path.to_string()))
            }
            async fn ls(
                &self,
                _: &Cid,
                path: &str,
            ) -> peersky_transport::error::Result<Vec<peersky_transport::core::network::DirEntry>>
            {
                Err(TransportError::PathNotFound(path.to_string()))
            }
            async fn add(
                &self,
                _: Vec<AddEntry>,
                _: bool,
            ) -> peersky_transport::error::Result<Cid> {
                Err(TransportError::PathNotFound("add".to_string()))
            }
            async fn pin_recursive(&self, _: &Cid) -> peersky_transport::error::Result<()> {
                Ok(())
            }
            async fn provide(&self, _: &Cid) -> peersky_transport::error::Result<()> {
                Ok(())
            }
            async fn resolve_ipns(
                &self,
                peer: &Cid,
                _: std::time::Duration,
            ) -> peersky_transport::error::Result<Cid> {
                Err(TransportError::IpnsNotFound(peer.to_string()))
            }
            async fn resolve_dnslink(
                &self,
                name: &str,
                _: std::time::Duration,
            ) -> peersky_transport::error::Result<peersky_transport::core::network::DnsLinkTarget>
            {
                Err(TransportError::DnsLinkNotFound(name.to_string()))
            }
        }
        IpfsResolver::new(Arc::new(Noop))
    }
}
