//! hs:// action handling and room lifecycle.
//!
//! Actions arrive as `hs://p2pmd?action=<a>` requests with a JSON body of
//! options. The service owns every live room; resolvers and the dispatcher
//! only hold a reference to it.

use std::collections::HashMap;
use std::sync::Arc;

use peersky_transport::core::tunnel::SwarmTunnel;
use peersky_transport::core::tunnel::TunnelClient;
use peersky_transport::core::tunnel::TunnelClientConfig;
use peersky_transport::core::tunnel::TunnelServer;
use peersky_transport::core::tunnel::TunnelServerConfig;
use serde::Deserialize;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::consts::ROOM_HOST;
use crate::consts::ROOM_TARGET;
use crate::envelope::Request;
use crate::envelope::Response;
use crate::envelope::UploadSource;
use crate::error::Error;
use crate::error::Result;
use crate::rooms::http::start_http;
use crate::rooms::session::RoomShared;
use crate::store::room_ports::canonical_key;
use crate::store::RoomPortRecord;
use crate::store::RoomPortTable;

/// Options carried in the action body. All fields optional; absent body
/// means all defaults.
#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct ActionOptions {
    key: Option<String>,
    secure: bool,
    udp: bool,
    host: Option<String>,
    port: Option<u16>,
    initial_content: Option<String>,
}

/// One live room.
struct LiveRoom {
    key: String,
    local_host: String,
    local_port: u16,
    secure: bool,
    udp: bool,
    /// Present when this node hosts the room's HTTP surface.
    #[allow(dead_code)]
    shared: Option<Arc<RoomShared>>,
    server: Option<Box<dyn TunnelServer>>,
    client: Option<Box<dyn TunnelClient>>,
    http_token: Option<CancellationToken>,
}

impl LiveRoom {
    fn info_json(&self) -> serde_json::Value {
        serde_json::json!({
            "key": self.key,
            "localHost": self.local_host,
            "localPort": self.local_port,
            "localUrl": format!("http://{}:{}/", self.local_host, self.local_port),
            "secure": self.secure,
            "udp": self.udp,
        })
    }

    async fn teardown(&mut self) {
        if let Some(token) = self.http_token.take() {
            token.cancel();
        }
        if let Some(mut server) = self.server.take() {
            if let Err(e) = server.close().await {
                tracing::warn!("Closing tunnel server for {} failed: {e}", self.key);
            }
        }
        if let Some(mut client) = self.client.take() {
            if let Err(e) = client.close().await {
                tracing::warn!("Closing tunnel client for {} failed: {e}", self.key);
            }
        }
    }
}

/// See the module docs.
pub struct RoomService {
    tunnel: Arc<dyn SwarmTunnel>,
    ports: Arc<RoomPortTable>,
    rooms: Mutex<HashMap<String, LiveRoom>>,
    active: Mutex<Option<String>>,
}

impl RoomService {
    /// Create a service over `tunnel`, persisting port records to `ports`.
    pub fn new(tunnel: Arc<dyn SwarmTunnel>, ports: Arc<RoomPortTable>) -> Self {
        Self {
            tunnel,
            ports,
            rooms: Mutex::new(HashMap::new()),
            active: Mutex::new(None),
        }
    }

    /// Handle one hs:// action request.
    pub async fn handle(&self, request: &Request) -> Result<Response> {
        let url = request.parse_url()?;
        if url.host_str() != Some(ROOM_TARGET) {
            return Err(Error::NotFound(request.url.clone()));
        }
        let action = url
            .query_pairs()
            .find(|(k, _)| k == "action")
            .map(|(_, v)| v.into_owned())
            .ok_or_else(|| Error::MalformedInput("missing action parameter".to_string()))?;
        let options = parse_options(request)?;

        let value = match action.as_str() {
            "create" => self.create(options).await?,
            "join" => self.join(options).await?,
            "rehost" => self.rehost(options).await?,
            "resume" => self.resume(options).await?,
            "close" => self.close(options).await?,
            other => return Err(Error::UnknownRoomAction(other.to_string())),
        };
        Ok(Response::json(200, &value))
    }

    /// Tear down every live room. Used at shutdown.
    pub async fn close_all(&self) {
        let mut rooms = self.rooms.lock().await;
        for (_, mut room) in rooms.drain() {
            room.teardown().await;
        }
        *self.active.lock().await = None;
    }

    async fn create(&self, options: ActionOptions) -> Result<serde_json::Value> {
        self.host_room(options, None, None).await
    }

    async fn join(&self, options: ActionOptions) -> Result<serde_json::Value> {
        let key = required_key(&options)?;

        {
            let rooms = self.rooms.lock().await;
            if let Some(room) = rooms.get(&key) {
                return Ok(room.info_json());
            }
        }

        // A stored seed means this node created the room: regenerate the
        // server under the same key instead of dialing ourselves.
        if let Some(record) = self.ports.get(&key) {
            if let Some(seed_hex) = &record.seed {
                let seed = hex::decode(seed_hex)
                    .map_err(|e| Error::MalformedInput(format!("stored seed: {e}")))?;
                tracing::info!("Auto-rehosting room {key} from stored seed");
                let mut options = options;
                options.port = Some(record.port);
                return self.host_room(options, Some(seed), None).await;
            }
        }

        self.dial_room(key, options).await
    }

    async fn rehost(&self, options: ActionOptions) -> Result<serde_json::Value> {
        let key = required_key(&options)?;

        {
            let mut rooms = self.rooms.lock().await;
            if let Some(mut room) = rooms.remove(&key) {
                room.teardown().await;
            }
        }

        let mut seed = None;
        let mut options = options;
        if let Some(record) = self.ports.get(&key) {
            if let Some(seed_hex) = &record.seed {
                seed = Some(
                    hex::decode(seed_hex)
                        .map_err(|e| Error::MalformedInput(format!("stored seed: {e}")))?,
                );
            }
            if options.port.is_none() {
                options.port = Some(record.port);
            }
        }
        let content = options.initial_content.take();
        self.host_room(options, seed, content).await
    }

    async fn resume(&self, options: ActionOptions) -> Result<serde_json::Value> {
        let rooms = self.rooms.lock().await;
        if let Some(key) = &options.key {
            let key = canonical_key(key);
            return rooms
                .get(&key)
                .map(|room| room.info_json())
                .ok_or(Error::RoomNotFound(key));
        }
        let active = self.active.lock().await;
        active
            .as_ref()
            .and_then(|key| rooms.get(key))
            .map(|room| room.info_json())
            .ok_or(Error::NoActiveRoom)
    }

    async fn close(&self, options: ActionOptions) -> Result<serde_json::Value> {
        let mut rooms = self.rooms.lock().await;
        let mut closed = vec![];
        match &options.key {
            Some(key) => {
                let key = canonical_key(key);
                if let Some(mut room) = rooms.remove(&key) {
                    room.teardown().await;
                    closed.push(key.clone());
                }
                let mut active = self.active.lock().await;
                if active.as_deref() == Some(&key) {
                    *active = None;
                }
            }
            None => {
                for (key, mut room) in rooms.drain() {
                    room.teardown().await;
                    closed.push(key);
                }
                *self.active.lock().await = None;
            }
        }
        Ok(serde_json::json!({ "ok": true, "closed": closed }))
    }

    /// Bind the HTTP surface, publish the tunnel server, persist the port
    /// record and register the live room. Shared by `create`, `rehost` and
    /// seed-based `join`.
    async fn host_room(
        &self,
        options: ActionOptions,
        seed: Option<Vec<u8>>,
        initial_content: Option<String>,
    ) -> Result<serde_json::Value> {
        let host = options.host.unwrap_or_else(|| ROOM_HOST.to_string());
        let shared = Arc::new(RoomShared::new(initial_content.unwrap_or_default()));
        let token = CancellationToken::new();
        let (port, _task) = start_http(
            &host,
            options.port.unwrap_or(0),
            shared.clone(),
            token.clone(),
        )
        .await?;

        let published = async {
            let mut server = self
                .tunnel
                .server(TunnelServerConfig {
                    secure: options.secure,
                    udp: options.udp,
                    host: host.clone(),
                    port,
                    seed,
                })
                .await?;
            server.ready().await?;
            Ok::<_, Error>(server)
        }
        .await;
        let server = match published {
            Ok(server) => server,
            Err(e) => {
                token.cancel();
                return Err(e);
            }
        };

        let info = server.info();
        let key = canonical_key(&info.key);

        // The record must be at rest before the action reports success.
        let record = RoomPortRecord {
            port,
            seed: server.seed().map(hex::encode),
        };
        if let Err(e) = self.ports.insert(&key, record) {
            token.cancel();
            let mut server = server;
            let _ = server.close().await;
            return Err(e);
        }

        let room = LiveRoom {
            key: key.clone(),
            local_host: host,
            local_port: port,
            secure: info.secure,
            udp: info.udp,
            shared: Some(shared),
            server: Some(server),
            client: None,
            http_token: Some(token),
        };
        let value = room.info_json();
        self.rooms.lock().await.insert(key.clone(), room);
        *self.active.lock().await = Some(key);
        Ok(value)
    }

    /// Dial a room someone else hosts.
    async fn dial_room(&self, key: String, options: ActionOptions) -> Result<serde_json::Value> {
        let host = options.host.unwrap_or_else(|| ROOM_HOST.to_string());
        let mut client = self
            .tunnel
            .client(TunnelClientConfig {
                key: key.clone(),
                host: host.clone(),
                port: options.port.unwrap_or(0),
                secure: options.secure,
                udp: options.udp,
            })
            .await?;
        client.ready().await?;
        let port = client.local_port();

        let room = LiveRoom {
            key: key.clone(),
            local_host: host,
            local_port: port,
            secure: options.secure,
            udp: options.udp,
            shared: None,
            server: None,
            client: Some(client),
            http_token: None,
        };
        let value = room.info_json();
        self.rooms.lock().await.insert(key.clone(), room);
        *self.active.lock().await = Some(key);
        Ok(value)
    }
}

fn required_key(options: &ActionOptions) -> Result<String> {
    options
        .key
        .as_deref()
        .map(canonical_key)
        .filter(|key| !key.is_empty())
        .ok_or_else(|| Error::MalformedInput("missing key".to_string()))
}

fn parse_options(request: &Request) -> Result<ActionOptions> {
    match &request.upload {
        None => Ok(ActionOptions::default()),
        Some(UploadSource::Bytes(bytes)) if bytes.is_empty() => Ok(ActionOptions::default()),
        Some(UploadSource::Bytes(bytes)) => serde_json::from_slice(bytes)
            .map_err(|e| Error::MalformedInput(format!("action body: {e}"))),
        Some(_) => Err(Error::MalformedInput(
            "action body must be inline JSON".to_string(),
        )),
    }
}
