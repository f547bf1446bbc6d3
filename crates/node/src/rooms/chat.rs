//! hyper-chat: append-only message rooms over swarm gossip topics.
//!
//! A chat room is a gossip topic keyed by 64 hex chars. Messages appended
//! locally or received over the swarm land once in the room log and are
//! fanned out to `receive` subscribers as SSE.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;

use bytes::Bytes;
use futures::StreamExt;
use lazy_static::lazy_static;
use peersky_transport::core::tunnel::SwarmEvent;
use peersky_transport::core::tunnel::SwarmTopic;
use peersky_transport::core::tunnel::SwarmTunnel;
use serde::Deserialize;
use serde::Serialize;
use tokio::sync::broadcast;

use crate::consts::CHAT_MESSAGE_MAX;
use crate::consts::CHAT_SENDER_MAX;
use crate::envelope::Request;
use crate::envelope::Response;
use crate::envelope::UploadSource;
use crate::error::Error;
use crate::error::Result;

lazy_static! {
    static ref CHAT_KEY: regex::Regex = regex::Regex::new("^[a-f0-9]{64}$").unwrap();
}

/// One chat record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Display name of the sender.
    pub sender: String,
    /// Message text.
    pub message: String,
    /// Milliseconds since the epoch at append time.
    pub timestamp: i64,
}

struct ChatRoom {
    log: Mutex<Vec<ChatMessage>>,
    fanout: broadcast::Sender<ChatMessage>,
    topic: tokio::sync::Mutex<Box<dyn SwarmTopic>>,
    local_peer: String,
}

impl ChatRoom {
    /// Append once and fan out.
    fn append(&self, message: ChatMessage) {
        if let Ok(mut log) = self.log.lock() {
            log.push(message.clone());
        }
        let _ = self.fanout.send(message);
    }

    fn snapshot(&self) -> Vec<ChatMessage> {
        self.log.lock().map(|log| log.clone()).unwrap_or_default()
    }
}

/// See the module docs.
pub struct ChatService {
    tunnel: Arc<dyn SwarmTunnel>,
    rooms: tokio::sync::Mutex<HashMap<String, Arc<ChatRoom>>>,
}

impl ChatService {
    /// Create a chat service over `tunnel`.
    pub fn new(tunnel: Arc<dyn SwarmTunnel>) -> Self {
        Self {
            tunnel,
            rooms: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Handle one `hyper://chat` request.
    pub async fn handle(&self, request: &Request) -> Result<Response> {
        let url = request.parse_url()?;
        let action = chat_action(&url)?;

        match action.as_str() {
            "create-key" => {
                require_method(request, "POST")?;
                let keypair = self.tunnel.generate_keypair();
                Ok(Response::json(
                    200,
                    &serde_json::json!({ "key": keypair.public_key }),
                ))
            }
            "join" => {
                require_method(request, "POST")?;
                let key = room_key(&url)?;
                let room = self.room_or_join(&key).await?;
                Ok(Response::json(
                    200,
                    &serde_json::json!({ "ok": true, "peer": room.local_peer }),
                ))
            }
            "send" => {
                require_method(request, "POST")?;
                let key = room_key(&url)?;
                let room = self.room(&key).await?;
                let message = parse_outgoing(request)?;
                room.append(message.clone());
                let payload = serde_json::to_vec(&message)?;
                let topic = room.topic.lock().await;
                topic.broadcast(Bytes::from(payload)).await?;
                Ok(Response::json(200, &serde_json::json!({ "ok": true })))
            }
            "receive" => {
                require_method(request, "GET")?;
                let key = room_key(&url)?;
                let room = self.room(&key).await?;
                Ok(sse_response(room))
            }
            other => Err(Error::UnknownRoomAction(other.to_string())),
        }
    }

    /// Leave every joined room. Used at shutdown.
    pub async fn close_all(&self) {
        let mut rooms = self.rooms.lock().await;
        for (_, room) in rooms.drain() {
            let mut topic = room.topic.lock().await;
            if let Err(e) = topic.close().await {
                tracing::warn!("Leaving chat topic failed: {e}");
            }
        }
    }

    async fn room(&self, key: &str) -> Result<Arc<ChatRoom>> {
        self.rooms
            .lock()
            .await
            .get(key)
            .cloned()
            .ok_or_else(|| Error::RoomNotFound(key.to_string()))
    }

    async fn room_or_join(&self, key: &str) -> Result<Arc<ChatRoom>> {
        let mut rooms = self.rooms.lock().await;
        if let Some(room) = rooms.get(key) {
            return Ok(room.clone());
        }

        let mut topic = self.tunnel.join_topic(key).await?;
        let events = topic
            .events()
            .ok_or_else(|| Error::Internal("topic events already taken".to_string()))?;
        let local_peer = topic.local_peer();

        let (fanout, _) = broadcast::channel(256);
        let room = Arc::new(ChatRoom {
            log: Mutex::new(vec![]),
            fanout,
            topic: tokio::sync::Mutex::new(topic),
            local_peer,
        });
        rooms.insert(key.to_string(), room.clone());

        // Pump swarm messages into the room log.
        let pump_room = Arc::downgrade(&room);
        let pump_key = key.to_string();
        tokio::spawn(async move {
            let mut events = events;
            while let Some(event) = events.recv().await {
                let Some(room) = pump_room.upgrade() else { break };
                match event {
                    SwarmEvent::Message { peer, data } => {
                        match serde_json::from_slice::<ChatMessage>(&data) {
                            Ok(message) if validate(&message.sender, &message.message).is_ok() => {
                                room.append(message);
                            }
                            Ok(_) => {
                                tracing::warn!("Dropping oversized chat message from {peer}");
                            }
                            Err(e) => {
                                tracing::warn!("Dropping undecodable chat message from {peer}: {e}");
                            }
                        }
                    }
                    SwarmEvent::PeerJoined { peer } => {
                        tracing::debug!("Chat peer {peer} joined {pump_key}");
                    }
                    SwarmEvent::PeerLeft { peer } => {
                        tracing::debug!("Chat peer {peer} left {pump_key}");
                    }
                }
            }
        });

        Ok(room)
    }
}

fn chat_action(url: &url::Url) -> Result<String> {
    if let Some(action) = url
        .query_pairs()
        .find(|(k, _)| k == "action")
        .map(|(_, v)| v.into_owned())
    {
        return Ok(action);
    }
    // hyper://chat/<action> spelling.
    let segment = url
        .path()
        .trim_matches('/')
        .split('/')
        .find(|s| !s.is_empty() && *s != "chat")
        .map(str::to_string);
    segment.ok_or_else(|| Error::MalformedInput("missing chat action".to_string()))
}

fn room_key(url: &url::Url) -> Result<String> {
    let key = url
        .query_pairs()
        .find(|(k, _)| k == "roomKey")
        .map(|(_, v)| v.to_lowercase())
        .ok_or_else(|| Error::MalformedInput("missing roomKey".to_string()))?;
    if !CHAT_KEY.is_match(&key) {
        return Err(Error::MalformedInput(format!(
            "room key must be 64 hex chars, got {key:?}"
        )));
    }
    Ok(key)
}

fn require_method(request: &Request, expected: &str) -> Result<()> {
    if request.method != expected {
        return Err(Error::MethodNotAllowed(request.method.clone()));
    }
    Ok(())
}

fn validate(sender: &str, message: &str) -> Result<()> {
    if sender.len() > CHAT_SENDER_MAX {
        return Err(Error::MalformedInput(format!(
            "sender exceeds {CHAT_SENDER_MAX} bytes"
        )));
    }
    if message.len() > CHAT_MESSAGE_MAX {
        return Err(Error::MalformedInput(format!(
            "message exceeds {CHAT_MESSAGE_MAX} bytes"
        )));
    }
    Ok(())
}

fn parse_outgoing(request: &Request) -> Result<ChatMessage> {
    #[derive(Deserialize)]
    struct Outgoing {
        sender: String,
        message: String,
    }
    let Some(UploadSource::Bytes(bytes)) = &request.upload else {
        return Err(Error::MalformedInput("missing message body".to_string()));
    };
    let outgoing: Outgoing = serde_json::from_slice(bytes)
        .map_err(|e| Error::MalformedInput(format!("message body: {e}")))?;
    validate(&outgoing.sender, &outgoing.message)?;
    Ok(ChatMessage {
        sender: outgoing.sender,
        message: outgoing.message,
        timestamp: crate::store::fs::epoch_millis() as i64,
    })
}

/// SSE stream: the room log so far, then live messages.
fn sse_response(room: Arc<ChatRoom>) -> Response {
    let mut rx = room.fanout.subscribe();
    let backlog = room.snapshot();
    let body = async_stream::stream! {
        for message in backlog {
            yield Ok(sse_frame(&message));
        }
        loop {
            match rx.recv().await {
                Ok(message) => yield Ok(sse_frame(&message)),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!("Chat subscriber lagged, dropped {n} messages");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }
    .boxed();
    Response::stream(200, "text/event-stream", body)
}

fn sse_frame(message: &ChatMessage) -> Bytes {
    let data = serde_json::to_string(message).unwrap_or_else(|_| "{}".to_string());
    Bytes::from(format!("event: message\ndata: {data}\n\n"))
}
