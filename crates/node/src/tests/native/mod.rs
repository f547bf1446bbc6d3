use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::TryStreamExt;
use peersky_transport::connections::memory::MemoryFetcher;
use peersky_transport::connections::memory::MemoryNetwork;
use peersky_transport::connections::memory::MemoryTunnel;

use crate::dispatcher::Dispatcher;
use crate::envelope::Request;
use crate::envelope::Response;
use crate::envelope::UploadSource;
use crate::installer::Installer;
use crate::resolver::ens::EnsResolver;
use crate::resolver::hyper::HyperResolver;
use crate::resolver::ipfs::IpfsResolver;
use crate::rooms::ChatService;
use crate::rooms::RoomService;
use crate::store::EnsCache;
use crate::store::HyperCache;
use crate::store::RoomPortTable;

pub struct Gateway {
    pub dispatcher: Dispatcher,
    pub network: Arc<MemoryNetwork>,
    pub fetcher: Arc<MemoryFetcher>,
    pub ens_cache: Arc<EnsCache>,
    pub dir: tempfile::TempDir,
}

impl Gateway {
    pub fn hyper_cache_path(&self) -> std::path::PathBuf {
        self.dir.path().join("hyper-cache.json")
    }

    pub fn extensions_dir(&self) -> std::path::PathBuf {
        self.dir.path().join("extensions")
    }
}

/// A full gateway over the in-memory transports, persisting into a
/// temporary directory.
pub fn prepare_gateway() -> Gateway {
    let dir = tempfile::tempdir().unwrap();
    let network = Arc::new(MemoryNetwork::new());
    let tunnel = Arc::new(MemoryTunnel::new());
    let fetcher = Arc::new(MemoryFetcher::new());

    let ens_cache = Arc::new(EnsCache::load(dir.path().join("ensCache.json")));
    let hyper_cache = Arc::new(HyperCache::load(dir.path().join("hyper-cache.json")));
    let ports = Arc::new(RoomPortTable::load(dir.path().join("peersky-ports.json")));

    let dispatcher = Dispatcher::new(
        IpfsResolver::new(network.clone()),
        // Unroutable endpoint so uncached names fail fast.
        EnsResolver::new("http://127.0.0.1:1".to_string(), ens_cache.clone()),
        HyperResolver::new(fetcher.clone(), hyper_cache),
        Arc::new(RoomService::new(tunnel.clone(), ports)),
        Arc::new(ChatService::new(tunnel)),
    )
    .with_assets_dir(dir.path().join("assets"))
    .with_extensions_dir(dir.path().join("extensions"));

    Gateway {
        dispatcher,
        network,
        fetcher,
        ens_cache,
        dir,
    }
}

fn post(url: impl Into<String>, body: serde_json::Value) -> Request {
    let mut request = Request::get(url);
    request.method = "POST".to_string();
    request.upload = Some(UploadSource::Bytes(Bytes::from(
        serde_json::to_vec(&body).unwrap(),
    )));
    request
}

async fn json_of(response: Response) -> serde_json::Value {
    let chunks: Vec<Bytes> = response.body.try_collect().await.unwrap();
    serde_json::from_slice(&chunks.concat()).unwrap()
}

async fn text_of(response: Response) -> String {
    let chunks: Vec<Bytes> = response.body.try_collect().await.unwrap();
    String::from_utf8_lossy(&chunks.concat()).to_string()
}

/// Read SSE chunks off `response` until `needle` shows up.
async fn read_sse_until(response: &mut reqwest::Response, needle: &str) -> String {
    let mut collected = String::new();
    while !collected.contains(needle) {
        let chunk = tokio::time::timeout(Duration::from_secs(5), response.chunk())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        collected.push_str(&String::from_utf8_lossy(&chunk));
    }
    collected
}

#[tokio::test]
async fn test_room_document_sync_end_to_end() {
    let gateway = prepare_gateway();

    let created = gateway
        .dispatcher
        .handle(post("hs://p2pmd?action=create", serde_json::json!({})))
        .await;
    assert_eq!(created.status, 200);
    let created = json_of(created).await;
    let base = created["localUrl"].as_str().unwrap().trim_end_matches('/').to_string();

    let client = reqwest::Client::new();
    let mut first = client
        .get(format!("{base}/events"))
        .send()
        .await
        .unwrap();
    read_sse_until(&mut first, "event:update").await;
    let mut second = client
        .get(format!("{base}/events"))
        .send()
        .await
        .unwrap();
    read_sse_until(&mut second, "event:update").await;

    // Both subscribers registered as clients.
    let status: serde_json::Value = client
        .get(format!("{base}/status"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(status["peers"], 2);

    let posted: serde_json::Value = client
        .post(format!("{base}/doc"))
        .json(&serde_json::json!({ "content": "synced text" }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(posted["ok"], true);

    let seen = read_sse_until(&mut second, "synced text").await;
    // axum's Sse writer emits no space after the field colon.
    assert!(seen.contains("event:update"));
    read_sse_until(&mut first, "synced text").await;

    let closed = gateway
        .dispatcher
        .handle(post("hs://p2pmd?action=close", serde_json::json!({})))
        .await;
    let closed = json_of(closed).await;
    assert_eq!(closed["ok"], true);
    assert_eq!(closed["closed"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_room_survives_service_restart() {
    let first = prepare_gateway();
    let created = json_of(
        first
            .dispatcher
            .handle(post("hs://p2pmd?action=create", serde_json::json!({})))
            .await,
    )
    .await;
    let key = created["key"].as_str().unwrap().to_string();

    // Same data directory, fresh services: join must regenerate the room
    // under the same key and port from the stored seed.
    let ports = Arc::new(RoomPortTable::load(first.dir.path().join("peersky-ports.json")));
    let tunnel = Arc::new(MemoryTunnel::new());
    let rooms = RoomService::new(tunnel, ports);

    first
        .dispatcher
        .handle(post("hs://p2pmd?action=close", serde_json::json!({})))
        .await;

    let mut join = Request::get("hs://p2pmd?action=join");
    join.method = "POST".to_string();
    join.upload = Some(UploadSource::Bytes(Bytes::from(
        serde_json::to_vec(&serde_json::json!({ "key": key })).unwrap(),
    )));
    let rejoined = json_of(rooms.handle(&join).await.unwrap()).await;
    assert_eq!(rejoined["key"].as_str().unwrap(), key);
    assert_eq!(rejoined["localPort"], created["localPort"]);

    rooms.close_all().await;
}

#[tokio::test]
async fn test_hyper_drive_creation_is_logged_and_persisted() {
    let gateway = prepare_gateway();
    let key = "e".repeat(64);
    gateway.fetcher.register(
        "POST",
        "hyper://localhost/?key=journal",
        200,
        vec![("Content-Type".to_string(), "application/json".to_string())],
        format!("{{\"key\":\"{key}\"}}").into_bytes(),
    );

    let mut request = Request::get("hyper://localhost/?key=journal");
    request.method = "POST".to_string();
    let response = gateway.dispatcher.handle(request).await;
    assert_eq!(response.status, 200);
    assert!(text_of(response).await.contains(&key));

    // The drive log survives a reload from disk.
    let reloaded = HyperCache::load(gateway.hyper_cache_path());
    let entries = reloaded.entries();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].name, "journal");
    assert_eq!(entries[0].key, key);
}

#[tokio::test]
async fn test_installed_extension_icon_is_served() {
    let gateway = prepare_gateway();

    let source = gateway.dir.path().join("src");
    std::fs::create_dir_all(&source).unwrap();
    std::fs::write(
        source.join("manifest.json"),
        br#"{"name": "Icons", "version": "1.0", "icons": {"128": "icon128.png"}}"#,
    )
    .unwrap();
    std::fs::write(source.join("icon128.png"), b"PNGDATA").unwrap();

    let installer = Installer::new(gateway.extensions_dir(), "en-US");
    let package = installer.install_from_directory(&source).await.unwrap();
    let icon_url = package.icon_path.clone().unwrap();
    assert!(icon_url.starts_with("peersky://extension-icon/"));

    let response = gateway.dispatcher.handle(Request::get(icon_url)).await;
    assert_eq!(response.status, 200);
    let content_type = response
        .headers
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case("content-type"))
        .map(|(_, v)| v.clone())
        .unwrap();
    assert_eq!(content_type, "image/png");
    assert_eq!(text_of(response).await, "PNGDATA");
}

#[tokio::test]
async fn test_eth_host_reroutes_any_scheme() {
    let gateway = prepare_gateway();
    let tree = gateway
        .network
        .put_tree(vec![("index.html", b"<html>ens</html>".as_slice())]);
    let mut contenthash = vec![0xe3, 0x01];
    contenthash.extend(tree.to_bytes());
    gateway.ens_cache.insert("peersky.eth", contenthash);

    for url in ["https://peersky.eth/", "ipfs://peersky.eth/"] {
        let response = gateway.dispatcher.handle(Request::get(url)).await;
        assert_eq!(response.status, 200);
        assert_eq!(text_of(response).await, "<html>ens</html>");
    }
}

#[tokio::test]
async fn test_chat_roundtrip_through_dispatcher() {
    let gateway = prepare_gateway();

    let mut request = Request::get("hyper://chat?action=create-key");
    request.method = "POST".to_string();
    let created = json_of(gateway.dispatcher.handle(request).await).await;
    let key = created["key"].as_str().unwrap().to_string();

    let joined = json_of(
        gateway
            .dispatcher
            .handle(post(
                format!("hyper://chat?action=join&roomKey={key}"),
                serde_json::json!({}),
            ))
            .await,
    )
    .await;
    assert_eq!(joined["ok"], true);

    let receive = gateway
        .dispatcher
        .handle(Request::get(format!(
            "hyper://chat?action=receive&roomKey={key}"
        )))
        .await;
    assert_eq!(receive.status, 200);

    let sent = json_of(
        gateway
            .dispatcher
            .handle(post(
                format!("hyper://chat?action=send&roomKey={key}"),
                serde_json::json!({ "sender": "me", "message": "first" }),
            ))
            .await,
    )
    .await;
    assert_eq!(sent["ok"], true);

    use futures::StreamExt;
    let mut body = receive.body;
    let mut collected = String::new();
    while !collected.contains("first") {
        let chunk = tokio::time::timeout(Duration::from_secs(5), body.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        collected.push_str(&String::from_utf8_lossy(&chunk));
    }
    assert!(collected.contains("event: message"));
}
