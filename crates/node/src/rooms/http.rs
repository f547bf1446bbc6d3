//! Per-room local HTTP surface.
//!
//! Every room runs one of these on a loopback port; the published tunnel
//! forwards remote traffic to it. Endpoints: the editor page, `/doc`
//! (GET/POST), `/events` (SSE), `/status`, permissive CORS preflight and a
//! JSON 404 for everything else.

use std::collections::HashMap;
use std::net::TcpListener;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::DefaultBodyLimit;
use axum::extract::Query;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::sse::Event;
use axum::response::sse::KeepAlive;
use axum::response::sse::Sse;
use axum::response::Html;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Json;
use axum::Router;
use bytes::Bytes;
use futures::Stream;
use serde::Deserialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::cors::Any;
use tower_http::cors::CorsLayer;

use crate::consts::BIND_RETRIES;
use crate::consts::BIND_RETRY_DELAY_MS;
use crate::consts::DOC_BODY_LIMIT;
use crate::consts::SSE_KEEPALIVE_SECS;
use crate::error::Error;
use crate::error::Result;
use crate::rooms::session::DocState;
use crate::rooms::session::Role;
use crate::rooms::session::RoomEvent;
use crate::rooms::session::RoomShared;

/// Bind the room's listener and serve until `token` is cancelled.
///
/// Binding retries a few times with a short delay; ports released by a
/// just-closed room may take a moment to become available again. Returns
/// the bound port and the serve task.
pub async fn start_http(
    host: &str,
    port: u16,
    shared: Arc<RoomShared>,
    token: CancellationToken,
) -> Result<(u16, JoinHandle<()>)> {
    let listener = bind_with_retry(host, port).await?;
    let bound_port = listener
        .local_addr()
        .map_err(|e| Error::BindFailed(e.to_string()))?
        .port();
    listener
        .set_nonblocking(true)
        .map_err(|e| Error::BindFailed(e.to_string()))?;

    let server = axum::Server::from_tcp(listener)
        .map_err(|e| Error::BindFailed(e.to_string()))?
        .serve(room_router(shared).into_make_service());
    let task = tokio::spawn(async move {
        let graceful = server.with_graceful_shutdown(token.cancelled_owned());
        if let Err(e) = graceful.await {
            tracing::error!("Room HTTP server stopped with error: {e}");
        }
    });
    Ok((bound_port, task))
}

async fn bind_with_retry(host: &str, port: u16) -> Result<TcpListener> {
    let mut last_error = None;
    for attempt in 0..BIND_RETRIES {
        if attempt > 0 {
            tokio::time::sleep(Duration::from_millis(BIND_RETRY_DELAY_MS)).await;
        }
        match TcpListener::bind((host, port)) {
            Ok(listener) => return Ok(listener),
            Err(e) => {
                tracing::warn!("Bind attempt {} on {host}:{port} failed: {e}", attempt + 1);
                last_error = Some(e);
            }
        }
    }
    Err(Error::BindFailed(
        last_error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "no bind attempt made".to_string()),
    ))
}

/// The room router over its shared state.
pub fn room_router(shared: Arc<RoomShared>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);
    Router::new()
        .route("/", get(editor_page))
        .route("/index.html", get(editor_page))
        .route(
            "/doc",
            get(get_doc)
                .post(post_doc)
                // One extra KiB so the exact-cap case reaches the handler
                // and overflow is answered with the JSON envelope.
                .layer(DefaultBodyLimit::max(DOC_BODY_LIMIT + 1024)),
        )
        .route("/events", get(events))
        .route("/status", get(status))
        .fallback(not_found)
        .layer(cors)
        .with_state(shared)
}

async fn editor_page() -> Html<&'static str> {
    Html(EDITOR_PAGE)
}

async fn get_doc(State(shared): State<Arc<RoomShared>>) -> Json<DocState> {
    Json(shared.doc())
}

#[derive(Deserialize)]
struct DocUpdate {
    content: String,
}

async fn post_doc(
    State(shared): State<Arc<RoomShared>>,
    body: Bytes,
) -> axum::response::Response {
    if body.len() > DOC_BODY_LIMIT {
        return (
            StatusCode::PAYLOAD_TOO_LARGE,
            Json(serde_json::json!({ "ok": false, "error": "document exceeds 10 MiB" })),
        )
            .into_response();
    }
    let update: DocUpdate = match serde_json::from_slice(&body) {
        Ok(update) => update,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({ "ok": false, "error": format!("invalid JSON: {e}") })),
            )
                .into_response();
        }
    };
    let doc = shared.set_content(update.content);
    Json(serde_json::json!({ "ok": true, "updatedAt": doc.updated_at })).into_response()
}

async fn status(State(shared): State<Arc<RoomShared>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "peers": shared.peer_count(),
        "peerList": shared.peer_list(),
    }))
}

async fn events(
    State(shared): State<Arc<RoomShared>>,
    Query(params): Query<HashMap<String, String>>,
) -> Sse<impl Stream<Item = std::result::Result<Event, std::convert::Infallible>>> {
    let role = match params.get("role").map(String::as_str) {
        Some("host") => Role::Host,
        _ => Role::Client,
    };

    // Subscribe before registering so our own join is observed too.
    let mut rx = shared.subscribe();
    let id = shared.add_client(role);
    let guard = Subscription {
        shared: shared.clone(),
        id,
    };

    let stream = async_stream::stream! {
        let guard = guard;
        yield Ok(peers_event(&guard.shared));
        yield Ok(peerlist_event(&guard.shared));
        yield Ok(update_event(&guard.shared.doc()));
        loop {
            match rx.recv().await {
                Ok(RoomEvent::Update(doc)) => yield Ok(update_event(&doc)),
                Ok(RoomEvent::Peers) => {
                    yield Ok(peers_event(&guard.shared));
                    yield Ok(peerlist_event(&guard.shared));
                }
                // A slow subscriber resynchronizes from the snapshot.
                Err(broadcast::error::RecvError::Lagged(_)) => {
                    yield Ok(update_event(&guard.shared.doc()));
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    };
    Sse::new(stream).keep_alive(
        KeepAlive::new().interval(Duration::from_secs(SSE_KEEPALIVE_SECS)),
    )
}

/// Removes the subscriber when the SSE stream is dropped.
struct Subscription {
    shared: Arc<RoomShared>,
    id: u64,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.shared.remove_client(self.id);
    }
}

fn update_event(doc: &DocState) -> Event {
    Event::default()
        .event("update")
        .data(serde_json::to_string(doc).unwrap_or_else(|_| "{}".to_string()))
}

fn peers_event(shared: &RoomShared) -> Event {
    Event::default()
        .event("peers")
        .data(shared.peer_count().to_string())
}

fn peerlist_event(shared: &RoomShared) -> Event {
    Event::default().event("peerlist").data(
        serde_json::to_string(&shared.peer_list()).unwrap_or_else(|_| "[]".to_string()),
    )
}

async fn not_found() -> impl IntoResponse {
    (
        StatusCode::NOT_FOUND,
        Json(serde_json::json!({ "error": "not found" })),
    )
}

/// Minimal collaborative editor page. Styling follows the viewer's color
/// scheme.
const EDITOR_PAGE: &str = r#"<!doctype html>
<html>
<head>
<meta charset="utf-8">
<title>Shared document</title>
<style>
  :root { color-scheme: light dark; }
  body { margin: 0; font-family: system-ui, sans-serif; background: #fff; color: #111; }
  @media (prefers-color-scheme: dark) { body { background: #1b1b1d; color: #eee; } }
  header { padding: 0.5rem 1rem; font-size: 0.85rem; opacity: 0.7; }
  textarea {
    width: 100%; height: calc(100vh - 3rem); box-sizing: border-box;
    border: none; outline: none; resize: none; padding: 1rem;
    font: 14px/1.5 ui-monospace, monospace; background: inherit; color: inherit;
  }
</style>
</head>
<body>
<header><span id="peers">0</span> peer(s) connected</header>
<textarea id="doc" spellcheck="false"></textarea>
<script>
  const area = document.getElementById('doc');
  const peers = document.getElementById('peers');
  let lastSeen = 0;
  fetch('/doc').then(r => r.json()).then(d => { area.value = d.content; lastSeen = d.updatedAt; });
  const source = new EventSource('/events?role=client');
  source.addEventListener('update', e => {
    const d = JSON.parse(e.data);
    if (d.updatedAt > lastSeen) { area.value = d.content; lastSeen = d.updatedAt; }
  });
  source.addEventListener('peers', e => { peers.textContent = e.data; });
  let pending = null;
  area.addEventListener('input', () => {
    clearTimeout(pending);
    pending = setTimeout(() => {
      fetch('/doc', {
        method: 'POST',
        headers: { 'Content-Type': 'application/json' },
        body: JSON.stringify({ content: area.value }),
      }).then(r => r.json()).then(d => { if (d.ok) lastSeen = d.updatedAt; });
    }, 200);
  });
</script>
</body>
</html>
"#;
