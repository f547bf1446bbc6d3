//! In-memory state shared between a room's HTTP surface and the service.

use std::collections::HashMap;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Mutex;
use std::sync::RwLock;

use serde::Deserialize;
use serde::Serialize;
use tokio::sync::broadcast;

/// Subscriber role, from the `role` query parameter on `/events`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// The room creator's own editor window. Excluded from the peer count.
    Host,
    /// Anyone else.
    Client,
}

/// The shared document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocState {
    /// Document text.
    pub content: String,
    /// Milliseconds since the epoch of the last accepted write. Strictly
    /// monotonic per room.
    #[serde(rename = "updatedAt")]
    pub updated_at: i64,
}

/// One `/events` subscriber as reported on `/status` and `peerlist`.
#[derive(Debug, Clone, Serialize)]
pub struct PeerEntry {
    /// Subscriber id, unique within the room.
    pub id: u64,
    /// Subscriber role.
    pub role: Role,
}

/// Event fanned out to SSE subscribers.
#[derive(Debug, Clone)]
pub enum RoomEvent {
    /// The document changed.
    Update(DocState),
    /// The subscriber set changed.
    Peers,
}

/// State shared between the HTTP handlers and the service. One per room.
pub struct RoomShared {
    doc: RwLock<DocState>,
    clients: Mutex<HashMap<u64, Role>>,
    next_client: AtomicU64,
    events: broadcast::Sender<RoomEvent>,
}

impl RoomShared {
    /// Fresh state with `content` as the initial document.
    pub fn new(content: String) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            doc: RwLock::new(DocState {
                content,
                updated_at: crate::store::fs::epoch_millis() as i64,
            }),
            clients: Mutex::new(HashMap::new()),
            next_client: AtomicU64::new(1),
            events,
        }
    }

    /// Snapshot of the current document.
    pub fn doc(&self) -> DocState {
        self.doc
            .read()
            .map(|doc| doc.clone())
            .unwrap_or_else(|_| DocState {
                content: String::new(),
                updated_at: 0,
            })
    }

    /// Replace the document content and broadcast an update. `updated_at`
    /// advances by at least one millisecond per accepted write.
    pub fn set_content(&self, content: String) -> DocState {
        let snapshot = {
            let mut doc = match self.doc.write() {
                Ok(doc) => doc,
                Err(poisoned) => poisoned.into_inner(),
            };
            doc.content = content;
            doc.updated_at = (crate::store::fs::epoch_millis() as i64).max(doc.updated_at + 1);
            doc.clone()
        };
        let _ = self.events.send(RoomEvent::Update(snapshot.clone()));
        snapshot
    }

    /// Register a subscriber and broadcast the peer change. Returns its id.
    pub fn add_client(&self, role: Role) -> u64 {
        let id = self.next_client.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut clients) = self.clients.lock() {
            clients.insert(id, role);
        }
        let _ = self.events.send(RoomEvent::Peers);
        id
    }

    /// Drop a subscriber and broadcast the peer change.
    pub fn remove_client(&self, id: u64) {
        if let Ok(mut clients) = self.clients.lock() {
            clients.remove(&id);
        }
        let _ = self.events.send(RoomEvent::Peers);
    }

    /// Subscriber count excluding hosts.
    pub fn peer_count(&self) -> usize {
        self.clients
            .lock()
            .map(|clients| clients.values().filter(|r| **r != Role::Host).count())
            .unwrap_or(0)
    }

    /// All subscribers, id order.
    pub fn peer_list(&self) -> Vec<PeerEntry> {
        let mut peers: Vec<PeerEntry> = self
            .clients
            .lock()
            .map(|clients| {
                clients
                    .iter()
                    .map(|(id, role)| PeerEntry { id: *id, role: *role })
                    .collect()
            })
            .unwrap_or_default();
        peers.sort_by_key(|p| p.id);
        peers
    }

    /// Subscribe to the event fanout.
    pub fn subscribe(&self) -> broadcast::Receiver<RoomEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_updated_at_is_strictly_monotonic() {
        let shared = RoomShared::new(String::new());
        let a = shared.set_content("a".to_string());
        let b = shared.set_content("b".to_string());
        let c = shared.set_content("c".to_string());
        assert!(b.updated_at > a.updated_at);
        assert!(c.updated_at > b.updated_at);
    }

    #[test]
    fn test_peer_count_excludes_hosts() {
        let shared = RoomShared::new(String::new());
        shared.add_client(Role::Host);
        let a = shared.add_client(Role::Client);
        shared.add_client(Role::Client);
        assert_eq!(shared.peer_count(), 2);

        shared.remove_client(a);
        assert_eq!(shared.peer_count(), 1);
        assert_eq!(shared.peer_list().len(), 2);
    }

    #[tokio::test]
    async fn test_updates_reach_subscribers_in_order() {
        let shared = RoomShared::new(String::new());
        let mut rx = shared.subscribe();
        shared.set_content("one".to_string());
        shared.set_content("two".to_string());

        let RoomEvent::Update(first) = rx.recv().await.unwrap() else {
            panic!("expected update");
        };
        let RoomEvent::Update(second) = rx.recv().await.unwrap() else {
            panic!("expected update");
        };
        assert_eq!(first.content, "one");
        assert_eq!(second.content, "two");
        assert!(second.updated_at > first.updated_at);
    }
}
