//! Application-facing data connections riding on a negotiated peer link.
//!
//! A connection is created either locally (`Peer::connect`) or from an
//! inbound OFFER. It becomes open once its data channel reports ready and is
//! closed exactly once, whichever side tears it down first.

pub mod buffer;
pub mod chunk;
pub mod registry;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::config::{DEFAULT_CHUNK_MTU, DEFAULT_SEND_RETRY, PeerOptions};
use crate::error::{ChannelError, ConnectionError};
use crate::link::{ChannelEvent, DataChannel, Frame, PeerLink};
use crate::negotiation::Negotiator;
use crate::protocol::{Envelope, LinkKind, OfferPayload, Serialization, Signal};
use crate::random_token;

use buffer::SendBuffer;
use chunk::{ChunkConfig, ChunkError, Reassembler, decode_chunk, encode_chunk, split_message};
pub use registry::ConnectionRegistry;

/// Per-peer knobs every connection shares.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    pub chunk_mtu: usize,
    pub chunked_browsers: Vec<String>,
    pub send_retry: Duration,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self::from(&PeerOptions::default())
    }
}

impl From<&PeerOptions> for ConnectionSettings {
    fn from(options: &PeerOptions) -> Self {
        Self {
            chunk_mtu: if options.chunk_mtu == 0 {
                DEFAULT_CHUNK_MTU
            } else {
                options.chunk_mtu
            },
            chunked_browsers: options.chunked_browsers.clone(),
            send_retry: if options.tuning.send_retry.is_zero() {
                DEFAULT_SEND_RETRY
            } else {
                options.tuning.send_retry
            },
        }
    }
}

/// Collaborators handed to each connection by its owning peer.
#[derive(Clone)]
pub struct ConnectionContext {
    pub negotiator: Arc<Negotiator>,
    pub registry: Weak<ConnectionRegistry>,
    pub settings: Arc<ConnectionSettings>,
}

#[derive(Debug, Clone, Default)]
pub struct ConnectOptions {
    pub label: Option<String>,
    pub metadata: Option<Value>,
    pub serialization: Serialization,
    pub reliable: bool,
    /// Fixed connection id; generated when absent.
    pub connection_id: Option<String>,
    /// Pooled link to reuse when it is idle.
    pub link_id: Option<String>,
}

/// Payload accepted by [`DataConnection::send`].
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Binary(Bytes),
    Json(Value),
}

impl From<Bytes> for Outbound {
    fn from(bytes: Bytes) -> Self {
        Outbound::Binary(bytes)
    }
}

impl From<Vec<u8>> for Outbound {
    fn from(bytes: Vec<u8>) -> Self {
        Outbound::Binary(Bytes::from(bytes))
    }
}

impl From<Value> for Outbound {
    fn from(value: Value) -> Self {
        Outbound::Json(value)
    }
}

impl From<String> for Outbound {
    fn from(text: String) -> Self {
        Outbound::Json(Value::String(text))
    }
}

impl From<&str> for Outbound {
    fn from(text: &str) -> Self {
        Outbound::Json(Value::String(text.to_string()))
    }
}

/// Payload delivered to the application.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Binary(Bytes),
    Json(Value),
    /// Text that did not decode as JSON, passed through untouched.
    Raw(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    Open,
    Data(Inbound),
    Close,
    Error(ConnectionError),
}

#[derive(Default)]
struct ConnectionState {
    open: bool,
    closed: bool,
    peer_browser: Option<String>,
    channel: Option<Arc<dyn DataChannel>>,
    link: Option<Arc<dyn PeerLink>>,
    channel_task: Option<JoinHandle<()>>,
}

pub struct DataConnection {
    id: String,
    peer: String,
    label: String,
    metadata: Option<Value>,
    serialization: Serialization,
    reliable: bool,
    ctx: ConnectionContext,
    state: Mutex<ConnectionState>,
    buffer: Mutex<SendBuffer>,
    send_gate: tokio::sync::Mutex<()>,
    events_tx: mpsc::UnboundedSender<ConnectionEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<ConnectionEvent>>>,
    reassembler: Mutex<Reassembler>,
    next_batch: AtomicU32,
}

impl DataConnection {
    /// A locally initiated connection to `peer`.
    pub fn new(peer: impl Into<String>, options: ConnectOptions, ctx: ConnectionContext) -> Arc<Self> {
        let id = options
            .connection_id
            .unwrap_or_else(|| format!("dc_{}", random_token()));
        let label = options.label.unwrap_or_else(|| id.clone());
        Self::build(
            id,
            peer.into(),
            label,
            options.metadata,
            options.serialization,
            options.reliable,
            None,
            ctx,
        )
    }

    /// The answering side of a remote OFFER.
    pub fn from_offer(peer: impl Into<String>, offer: &OfferPayload, ctx: ConnectionContext) -> Arc<Self> {
        let label = offer
            .label
            .clone()
            .unwrap_or_else(|| offer.connection_id.clone());
        Self::build(
            offer.connection_id.clone(),
            peer.into(),
            label,
            offer.metadata.clone(),
            offer.serialization,
            offer.reliable,
            offer.browser.clone(),
            ctx,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn build(
        id: String,
        peer: String,
        label: String,
        metadata: Option<Value>,
        serialization: Serialization,
        reliable: bool,
        peer_browser: Option<String>,
        ctx: ConnectionContext,
    ) -> Arc<Self> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let reassembler = Reassembler::new(ChunkConfig::inbound(ctx.settings.chunk_mtu));
        Arc::new(Self {
            id,
            peer,
            label,
            metadata,
            serialization,
            reliable,
            ctx,
            state: Mutex::new(ConnectionState {
                peer_browser,
                ..ConnectionState::default()
            }),
            buffer: Mutex::new(SendBuffer::default()),
            send_gate: tokio::sync::Mutex::new(()),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            reassembler: Mutex::new(reassembler),
            next_batch: AtomicU32::new(1),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn kind(&self) -> LinkKind {
        LinkKind::Data
    }

    pub fn reliable(&self) -> bool {
        self.reliable
    }

    pub fn serialization(&self) -> Serialization {
        self.serialization
    }

    pub fn metadata(&self) -> Option<&Value> {
        self.metadata.as_ref()
    }

    /// Browser hint the remote advertised in its OFFER or ANSWER.
    pub fn peer_browser(&self) -> Option<String> {
        self.state.lock().peer_browser.clone()
    }

    pub fn is_open(&self) -> bool {
        self.state.lock().open
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn has_link(&self) -> bool {
        self.state.lock().link.is_some()
    }

    /// Frames waiting for the data channel to accept them.
    pub fn buffer_size(&self) -> usize {
        self.buffer.lock().len()
    }

    pub fn link(&self) -> Option<Arc<dyn PeerLink>> {
        self.state.lock().link.clone()
    }

    pub fn attach_link(&self, link: Arc<dyn PeerLink>) {
        self.state.lock().link = Some(link);
    }

    pub fn take_link(&self) -> Option<Arc<dyn PeerLink>> {
        self.state.lock().link.take()
    }

    /// Take the event stream. Only the first caller receives it.
    pub fn take_events(&self) -> Option<mpsc::UnboundedReceiver<ConnectionEvent>> {
        self.events_rx.lock().take()
    }

    /// Bind the data channel and start consuming its events.
    pub fn initialize(self: &Arc<Self>, channel: Arc<dyn DataChannel>) {
        if self.is_closed() {
            debug!(
                target = "tidepool::connection",
                connection_id = %self.id,
                "channel arrived after close; ignoring"
            );
            return;
        }
        let (tx, mut rx) = mpsc::unbounded_channel();
        channel.subscribe(tx);
        let weak = Arc::downgrade(self);
        let connection_id = self.id.clone();
        let task = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let Some(connection) = weak.upgrade() else {
                    break;
                };
                if connection.is_closed() {
                    break;
                }
                match event {
                    ChannelEvent::Open => connection.mark_open(),
                    ChannelEvent::Message(frame) => connection.on_frame(frame),
                    ChannelEvent::Closed => {
                        debug!(
                            target = "tidepool::connection",
                            connection_id = %connection_id,
                            "data channel closed by remote"
                        );
                        connection.close().await;
                        break;
                    }
                }
            }
        });
        let mut state = self.state.lock();
        state.channel = Some(channel);
        if let Some(previous) = state.channel_task.replace(task) {
            previous.abort();
        }
    }

    fn mark_open(&self) {
        let first = {
            let mut state = self.state.lock();
            if state.open || state.closed {
                false
            } else {
                state.open = true;
                true
            }
        };
        if first {
            info!(
                target = "tidepool::connection",
                connection_id = %self.id,
                peer = %self.peer,
                label = %self.label,
                "connection open"
            );
            self.emit(ConnectionEvent::Open);
        }
    }

    pub fn report_error(&self, err: ConnectionError) {
        warn!(
            target = "tidepool::connection",
            connection_id = %self.id,
            error = %err,
            "connection error"
        );
        self.emit(ConnectionEvent::Error(err));
    }

    fn emit(&self, event: ConnectionEvent) {
        let _ = self.events_tx.send(event);
    }

    /// Queue `message` for delivery. Fails fast, with an error event, when
    /// the connection is not open.
    pub async fn send(self: &Arc<Self>, message: impl Into<Outbound>) -> Result<(), ConnectionError> {
        if !self.is_open() {
            let err = ConnectionError::NotOpen;
            self.report_error(err.clone());
            return Err(err);
        }
        match message.into() {
            Outbound::Json(value) => {
                let text = serde_json::to_string(&value)?;
                self.buffered_send(Frame::Text(text)).await;
            }
            Outbound::Binary(bytes) if self.chunk_framed() => {
                let batch = self.next_batch.fetch_add(1, Ordering::SeqCst);
                let config = ChunkConfig::for_mtu(self.ctx.settings.chunk_mtu);
                let frames = split_message(&bytes, batch, &config)?;
                if frames.len() > 1 {
                    debug!(
                        target = "tidepool::connection",
                        connection_id = %self.id,
                        batch,
                        frames = frames.len(),
                        bytes = bytes.len(),
                        "sending chunked message"
                    );
                }
                for frame in &frames {
                    self.buffered_send(Frame::Binary(encode_chunk(frame))).await;
                }
            }
            Outbound::Binary(bytes) => self.buffered_send(Frame::Binary(bytes)).await,
        }
        Ok(())
    }

    /// Whether binary frames on this connection carry the chunk header.
    /// Decided once both hints are known: binary serialization and a remote
    /// whose browser hint is in `chunked_browsers`. Both ends apply the same
    /// rule, so no frame is ever classified by its contents.
    pub fn chunk_framed(&self) -> bool {
        if self.serialization != Serialization::Binary {
            return false;
        }
        let state = self.state.lock();
        state.peer_browser.as_ref().is_some_and(|browser| {
            self.ctx
                .settings
                .chunked_browsers
                .iter()
                .any(|candidate| candidate == browser)
        })
    }

    async fn buffered_send(self: &Arc<Self>, frame: Frame) {
        let _gate = self.send_gate.lock().await;
        if self.is_closed() {
            return;
        }
        let must_queue = self.buffer.lock().must_queue();
        if must_queue {
            self.buffer.lock().push(frame);
            return;
        }
        if !self.try_send(&frame).await && !self.is_closed() {
            self.buffer.lock().push(frame);
        }
    }

    /// One transmission attempt. A failure switches the buffer into retry
    /// mode and reports `false`.
    async fn try_send(self: &Arc<Self>, frame: &Frame) -> bool {
        let channel = self.state.lock().channel.clone();
        let result = match channel {
            Some(channel) => channel.send(frame).await,
            None => Err(ChannelError::NotReady),
        };
        match result {
            Ok(()) => true,
            Err(err) => {
                debug!(
                    target = "tidepool::connection",
                    connection_id = %self.id,
                    error = %err,
                    bytes = frame.len(),
                    "send failed; buffering"
                );
                self.schedule_retry();
                false
            }
        }
    }

    fn schedule_retry(self: &Arc<Self>) {
        // `close` marks the state closed before cancelling the buffer, so
        // checking under the buffer lock cannot miss a concurrent close.
        let mut buffer = self.buffer.lock();
        if self.is_closed() {
            return;
        }
        let weak = Arc::downgrade(self);
        let delay = self.ctx.settings.send_retry;
        let retry = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(connection) = weak.upgrade() {
                connection.drain().await;
            }
        });
        buffer.start_retry(retry);
    }

    #[cfg(test)]
    fn retry_pending(&self) -> bool {
        self.buffer.lock().has_retry()
    }

    /// Flush the backlog head first, stopping at the first failure.
    async fn drain(self: &Arc<Self>) {
        let _gate = self.send_gate.lock().await;
        self.buffer.lock().end_retry();
        loop {
            if self.is_closed() {
                return;
            }
            let next = self.buffer.lock().front().cloned();
            let Some(frame) = next else {
                return;
            };
            if !self.try_send(&frame).await {
                return;
            }
            self.buffer.lock().pop_front();
            trace!(
                target = "tidepool::connection",
                connection_id = %self.id,
                remaining = self.buffer_size(),
                "buffered frame sent"
            );
        }
    }

    fn on_frame(&self, frame: Frame) {
        let inbound = match frame {
            Frame::Binary(bytes) if self.chunk_framed() => match self.reassemble(&bytes) {
                Ok(Some(message)) => Inbound::Binary(message),
                Ok(None) => return,
                Err(err) => {
                    self.report_error(err.into());
                    return;
                }
            },
            Frame::Binary(bytes) => Inbound::Binary(bytes),
            Frame::Text(text) => match serde_json::from_str::<Value>(&text) {
                Ok(value) => Inbound::Json(value),
                Err(_) => Inbound::Raw(text),
            },
        };
        self.emit(ConnectionEvent::Data(inbound));
    }

    /// `Ok(None)` while the frame's message is still incomplete.
    fn reassemble(&self, bytes: &[u8]) -> Result<Option<Bytes>, ChunkError> {
        let mut reassembler = self.reassembler.lock();
        let frame = decode_chunk(bytes, reassembler.config())?;
        let now = Instant::now();
        let mut outcome = reassembler.ingest(frame, now)?;
        outcome.gc_events.extend(reassembler.gc(now));
        for event in outcome.gc_events {
            warn!(
                target = "tidepool::connection",
                connection_id = %self.id,
                batch = event.batch,
                reason = ?event.reason,
                "dropped incomplete chunked message"
            );
        }
        Ok(outcome.completed)
    }

    /// Route a signaling envelope addressed to this connection.
    pub async fn handle_message(&self, envelope: Envelope) {
        match envelope.signal {
            Signal::Answer(answer) => {
                self.state.lock().peer_browser = answer.browser.clone();
                self.ctx.negotiator.handle_sdp(self, answer.sdp).await;
            }
            Signal::Candidate(candidate) => {
                self.ctx
                    .negotiator
                    .handle_candidate(self, candidate.candidate)
                    .await;
            }
            other => warn!(
                target = "tidepool::connection",
                connection_id = %self.id,
                kind = other.type_name(),
                "unrecognized message for connection"
            ),
        }
    }

    /// Tear down the channel and link. Safe to call repeatedly; only the
    /// first call notifies.
    pub async fn close(&self) {
        let channel = {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state.open = false;
            state.channel.take()
        };
        let dropped = self.buffer.lock().cancel();
        self.ctx.negotiator.cleanup(self).await;
        if let Some(channel) = channel {
            channel.close().await;
        }
        if let Some(registry) = self.ctx.registry.upgrade() {
            registry.remove(self);
        }
        info!(
            target = "tidepool::connection",
            connection_id = %self.id,
            peer = %self.peer,
            dropped_frames = dropped,
            "connection closed"
        );
        self.emit(ConnectionEvent::Close);
    }
}

impl std::fmt::Debug for DataConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataConnection")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("label", &self.label)
            .field("open", &self.is_open())
            .finish()
    }
}

impl Drop for DataConnection {
    fn drop(&mut self) {
        if let Some(task) = self.state.get_mut().channel_task.take() {
            task.abort();
        }
    }
}
