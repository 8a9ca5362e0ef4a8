#![allow(dead_code)]

//! In-process stand-in for a PeerJS-style signaling server: id issuing, peer
//! listing, streamed long-poll delivery, one-shot posts and a websocket path.

use std::collections::{HashMap, HashSet};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Json;
use futures_util::{SinkExt, StreamExt, stream};
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep};
use tracing::debug;
use tracing_subscriber::{EnvFilter, fmt::SubscriberBuilder};

use tidepool::config::PeerOptions;

pub const KEY: &str = "lobby";

pub fn init_tracing() {
    let _ = SubscriberBuilder::default()
        .with_test_writer()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}

#[derive(Debug, Clone, Copy)]
pub struct FakeOptions {
    /// Accept websocket upgrades; when false only the streamed path works.
    pub socket: bool,
    pub discovery: bool,
}

impl Default for FakeOptions {
    fn default() -> Self {
        Self {
            socket: true,
            discovery: true,
        }
    }
}

enum Outgoing {
    Text(String),
    Close,
}

#[derive(Default)]
struct Client {
    streams: Vec<mpsc::UnboundedSender<String>>,
    socket: Option<mpsc::UnboundedSender<Outgoing>>,
    greeted: bool,
}

pub struct Hub {
    options: FakeOptions,
    next_id: AtomicU32,
    clients: Mutex<HashMap<String, Client>>,
    taken: Mutex<HashSet<String>>,
    stream_requests: Mutex<Vec<(String, u32)>>,
    posts: Mutex<Vec<Value>>,
    socket_frames: Mutex<Vec<Value>>,
}

impl Hub {
    /// Answer the next registration of `id` with ID-TAKEN instead of OPEN.
    pub fn reserve(&self, id: &str) {
        self.taken.lock().insert(id.to_string());
    }

    pub fn stream_requests(&self) -> Vec<(String, u32)> {
        self.stream_requests.lock().clone()
    }

    pub fn posts(&self) -> Vec<Value> {
        self.posts.lock().clone()
    }

    pub fn socket_frames(&self) -> Vec<Value> {
        self.socket_frames.lock().clone()
    }

    pub fn has_socket(&self, id: &str) -> bool {
        self.clients
            .lock()
            .get(id)
            .is_some_and(|client| client.socket.is_some())
    }

    /// Push a raw envelope to `id` over whichever path is live.
    pub fn push(&self, id: &str, envelope: Value) -> bool {
        let text = envelope.to_string();
        let mut clients = self.clients.lock();
        let Some(client) = clients.get_mut(id) else {
            return false;
        };
        if let Some(socket) = client.socket.as_ref() {
            if socket.send(Outgoing::Text(text.clone())).is_ok() {
                return true;
            }
        }
        client.streams.retain(|stream| !stream.is_closed());
        match client.streams.last() {
            Some(stream) => stream.send(format!("{text}\n")).is_ok(),
            None => false,
        }
    }

    /// Close the websocket to `id` from the server side.
    pub fn drop_socket(&self, id: &str) {
        if let Some(socket) = self
            .clients
            .lock()
            .get_mut(id)
            .and_then(|client| client.socket.take())
        {
            let _ = socket.send(Outgoing::Close);
        }
    }

    fn greet(&self, id: &str) {
        let first = {
            let mut clients = self.clients.lock();
            let client = clients.entry(id.to_string()).or_default();
            !std::mem::replace(&mut client.greeted, true)
        };
        if first {
            let kind = if self.taken.lock().contains(id) {
                "ID-TAKEN"
            } else {
                "OPEN"
            };
            self.push(id, json!({ "type": kind }));
        }
    }

    fn relay(&self, from: &str, mut envelope: Value) {
        let Some(dst) = envelope.get("dst").and_then(Value::as_str).map(str::to_string) else {
            return;
        };
        envelope["src"] = Value::String(from.to_string());
        if !self.push(&dst, envelope) {
            debug!("fake server: {dst} unknown; expiring message from {from}");
            self.push(from, json!({ "type": "EXPIRE", "src": dst }));
        }
    }
}

pub struct FakeServer {
    pub addr: SocketAddr,
    pub hub: Arc<Hub>,
    task: JoinHandle<()>,
}

impl FakeServer {
    pub async fn start(options: FakeOptions) -> Self {
        let hub = Arc::new(Hub {
            options,
            next_id: AtomicU32::new(1),
            clients: Mutex::new(HashMap::new()),
            taken: Mutex::new(HashSet::new()),
            stream_requests: Mutex::new(Vec::new()),
            posts: Mutex::new(Vec::new()),
            socket_frames: Mutex::new(Vec::new()),
        });
        let router = Router::new()
            .route("/peerjs", get(socket_upgrade))
            .route("/:key/id", get(issue_id))
            .route("/:key/peers", get(list_peers))
            .route("/:key/:id/:token/:kind", post(signal_post))
            .with_state(hub.clone());
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind fake server");
        let addr = listener.local_addr().expect("local addr");
        let task = tokio::spawn(async move {
            axum::serve(listener, router).await.ok();
        });
        Self { addr, hub, task }
    }

    pub fn peer_options(&self) -> PeerOptions {
        PeerOptions {
            host: "127.0.0.1".into(),
            port: self.addr.port(),
            key: KEY.into(),
            ice_servers: Vec::new(),
            ..PeerOptions::default()
        }
    }
}

impl Drop for FakeServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Poll `check` until it holds, failing the test after ten seconds.
pub async fn wait_for(what: &str, check: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !check() {
        if Instant::now() >= deadline {
            panic!("timed out waiting for {what}");
        }
        sleep(Duration::from_millis(10)).await;
    }
}

async fn issue_id(State(hub): State<Arc<Hub>>, Path(key): Path<String>) -> Response {
    if key != KEY {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    let n = hub.next_id.fetch_add(1, Ordering::SeqCst);
    format!("peer{n}").into_response()
}

async fn list_peers(State(hub): State<Arc<Hub>>, Path(key): Path<String>) -> Response {
    if key != KEY || !hub.options.discovery {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    let mut ids: Vec<String> = hub.clients.lock().keys().cloned().collect();
    ids.sort();
    Json(ids).into_response()
}

async fn signal_post(
    State(hub): State<Arc<Hub>>,
    Path((key, id, _token, kind)): Path<(String, String, String, String)>,
    Query(query): Query<HashMap<String, String>>,
    body: String,
) -> Response {
    if key != KEY {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    if kind == "id" {
        let index = query
            .get("i")
            .and_then(|i| i.parse::<u32>().ok())
            .unwrap_or(0);
        hub.stream_requests.lock().push((id.clone(), index));
        let (tx, rx) = mpsc::unbounded_channel::<String>();
        hub.clients
            .lock()
            .entry(id.clone())
            .or_default()
            .streams
            .push(tx);
        hub.greet(&id);
        let preamble = stream::once(async { Ok::<_, Infallible>(format!("{}\n", "0".repeat(2048))) });
        let lines = stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|line| (Ok::<_, Infallible>(line), rx))
        });
        return Body::from_stream(preamble.chain(lines)).into_response();
    }

    let Ok(envelope) = serde_json::from_str::<Value>(&body) else {
        return StatusCode::BAD_REQUEST.into_response();
    };
    hub.posts.lock().push(envelope.clone());
    hub.relay(&id, envelope);
    StatusCode::OK.into_response()
}

async fn socket_upgrade(
    State(hub): State<Arc<Hub>>,
    Query(query): Query<HashMap<String, String>>,
    ws: WebSocketUpgrade,
) -> Response {
    if !hub.options.socket || query.get("key").map(String::as_str) != Some(KEY) {
        return StatusCode::NOT_FOUND.into_response();
    }
    let Some(id) = query.get("id").cloned() else {
        return StatusCode::BAD_REQUEST.into_response();
    };
    ws.on_upgrade(move |socket| handle_socket(socket, hub, id))
}

async fn handle_socket(socket: WebSocket, hub: Arc<Hub>, id: String) {
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Outgoing>();
    let writer = tokio::spawn(async move {
        while let Some(outgoing) = rx.recv().await {
            match outgoing {
                Outgoing::Text(text) => {
                    if sender.send(WsMessage::Text(text)).await.is_err() {
                        break;
                    }
                }
                Outgoing::Close => {
                    let _ = sender.send(WsMessage::Close(None)).await;
                    break;
                }
            }
        }
    });
    hub.clients.lock().entry(id.clone()).or_default().socket = Some(tx);
    hub.greet(&id);

    while let Some(Ok(message)) = receiver.next().await {
        match message {
            WsMessage::Text(text) => {
                if let Ok(envelope) = serde_json::from_str::<Value>(&text) {
                    hub.socket_frames.lock().push(envelope.clone());
                    hub.relay(&id, envelope);
                }
            }
            WsMessage::Close(_) => break,
            _ => {}
        }
    }
    if let Some(client) = hub.clients.lock().get_mut(&id) {
        client.socket = None;
    }
    writer.abort();
}
