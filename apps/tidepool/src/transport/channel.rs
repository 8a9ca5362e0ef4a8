use std::collections::VecDeque;
use std::sync::{Arc, Weak};

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use reqwest::header::CONTENT_TYPE;
use tokio::sync::mpsc;
use tokio::task::{AbortHandle, JoinHandle};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{Error as WsError, Message, error::ProtocolError},
};
use tracing::{debug, info, trace, warn};
use url::Url;

use super::lines::StreamDecoder;
use super::{Endpoints, SessionIdentity, SignalSink, TransportEvent};
use crate::config::TransportTuning;
use crate::error::TransportError;
use crate::protocol::Envelope;
use crate::random_token;

struct OneShotPost {
    url: String,
    body: String,
}

struct StreamSlot {
    index: u32,
    handle: JoinHandle<()>,
}

enum SocketOutcome {
    ClosedLocally,
    ClosedRemotely,
    Failed(String),
}

#[derive(Default)]
struct TransportState {
    session: Option<SessionIdentity>,
    queue: VecDeque<Envelope>,
    closed: bool,
    closed_notified: bool,
    socket_open: bool,
    socket_tx: Option<mpsc::UnboundedSender<Message>>,
    socket_task: Option<JoinHandle<()>>,
    stream: Option<StreamSlot>,
    retiring: Vec<AbortHandle>,
    watchdog: Option<JoinHandle<()>>,
    grace: Option<JoinHandle<()>>,
    poster_tx: Option<mpsc::UnboundedSender<OneShotPost>>,
    poster_task: Option<JoinHandle<()>>,
}

/// Bidirectional link to the signaling service.
///
/// Inbound traffic arrives over a long-lived streamed HTTP response and, once
/// it connects, a websocket. The stream request is restarted with the next
/// index whenever the watchdog fires before the socket is ready; the previous
/// request stays up until its replacement has answered so nothing in flight is
/// lost. Outbound envelopes queue until `start` binds an identity, then go
/// over the socket when open and as one-shot POSTs otherwise.
pub struct SignalingTransport {
    endpoints: Endpoints,
    tuning: TransportTuning,
    http: reqwest::Client,
    events: mpsc::UnboundedSender<TransportEvent>,
    state: Mutex<TransportState>,
}

impl SignalingTransport {
    pub fn new(
        endpoints: Endpoints,
        tuning: TransportTuning,
    ) -> Result<(Arc<Self>, mpsc::UnboundedReceiver<TransportEvent>), TransportError> {
        let http = reqwest::Client::builder().build()?;
        let (events, events_rx) = mpsc::unbounded_channel();
        let transport = Arc::new(Self {
            endpoints,
            tuning,
            http,
            events,
            state: Mutex::new(TransportState::default()),
        });
        Ok((transport, events_rx))
    }

    pub fn endpoints(&self) -> &Endpoints {
        &self.endpoints
    }

    /// Bind the local identity, open both inbound paths and flush anything
    /// queued so far in order.
    pub fn start(self: &Arc<Self>, id: &str) {
        let mut state = self.state.lock();
        if state.closed {
            warn!(
                target = "tidepool::transport",
                peer_id = %id,
                "start ignored; transport already closed"
            );
            return;
        }
        if state.session.is_some() {
            debug!(target = "tidepool::transport", "transport already started");
            return;
        }
        let session = SessionIdentity {
            id: id.to_string(),
            token: random_token(),
        };
        info!(
            target = "tidepool::transport",
            peer_id = %session.id,
            queued = state.queue.len(),
            "signaling transport starting"
        );
        state.session = Some(session.clone());

        let (poster_tx, poster_rx) = mpsc::unbounded_channel();
        state.poster_tx = Some(poster_tx);
        state.poster_task = Some(tokio::spawn(run_poster(self.http.clone(), poster_rx)));

        self.start_stream(&mut state, &session, 0, None);
        state.socket_task = Some(self.spawn_socket(&session));
        self.flush_queue(&mut state);
    }

    /// Idempotent: tears down both paths and reports `Closed` exactly once.
    pub fn close(&self) {
        let mut state = self.state.lock();
        if state.closed {
            return;
        }
        state.closed = true;
        if let Some(watchdog) = state.watchdog.take() {
            watchdog.abort();
        }
        if let Some(grace) = state.grace.take() {
            grace.abort();
        }
        if let Some(slot) = state.stream.take() {
            slot.handle.abort();
        }
        for handle in state.retiring.drain(..) {
            handle.abort();
        }
        match state.socket_tx.take() {
            Some(tx) => {
                let _ = tx.send(Message::Close(None));
            }
            None => {
                if let Some(task) = state.socket_task.take() {
                    task.abort();
                }
            }
        }
        state.socket_open = false;
        state.poster_tx = None;
        let dropped = state.queue.len();
        state.queue.clear();
        info!(
            target = "tidepool::transport",
            dropped_queued = dropped,
            "signaling transport closed"
        );
        self.notify_closed(&mut state, true);
    }

    pub fn is_started(&self) -> bool {
        self.state.lock().session.is_some()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn is_socket_open(&self) -> bool {
        self.state.lock().socket_open
    }

    /// Index of the stream request currently considered live.
    pub fn stream_index(&self) -> Option<u32> {
        self.state.lock().stream.as_ref().map(|slot| slot.index)
    }

    pub fn queued_len(&self) -> usize {
        self.state.lock().queue.len()
    }

    pub fn session(&self) -> Option<SessionIdentity> {
        self.state.lock().session.clone()
    }

    fn flush_queue(&self, state: &mut TransportState) {
        while let Some(envelope) = state.queue.pop_front() {
            self.dispatch(state, envelope);
        }
    }

    fn dispatch(&self, state: &mut TransportState, envelope: Envelope) {
        let text = match envelope.encode() {
            Ok(text) => text,
            Err(err) => {
                warn!(
                    target = "tidepool::transport",
                    kind = envelope.type_name(),
                    error = %err,
                    "dropping unencodable envelope"
                );
                return;
            }
        };

        if state.socket_open {
            if let Some(tx) = state.socket_tx.as_ref().filter(|tx| !tx.is_closed()) {
                trace!(
                    target = "tidepool::transport",
                    kind = envelope.type_name(),
                    path = "socket",
                    "signal out"
                );
                let _ = tx.send(Message::Text(text));
                return;
            }
        }

        let (Some(session), Some(poster)) = (state.session.as_ref(), state.poster_tx.as_ref())
        else {
            return;
        };
        let url = self
            .endpoints
            .post_url(session, &envelope.signal.post_path());
        trace!(
            target = "tidepool::transport",
            kind = envelope.type_name(),
            path = "post",
            "signal out"
        );
        let _ = poster.send(OneShotPost { url, body: text });
    }

    fn start_stream(
        self: &Arc<Self>,
        state: &mut TransportState,
        session: &SessionIdentity,
        index: u32,
        previous: Option<AbortHandle>,
    ) {
        let url = self.endpoints.stream_url(session, index);
        debug!(target = "tidepool::transport", index, "opening stream request");
        let handle = tokio::spawn(run_stream(
            Arc::downgrade(self),
            self.http.clone(),
            url,
            index,
            previous,
        ));
        state.stream = Some(StreamSlot { index, handle });
        self.arm_watchdog(state);
    }

    fn arm_watchdog(self: &Arc<Self>, state: &mut TransportState) {
        if let Some(watchdog) = state.watchdog.take() {
            watchdog.abort();
        }
        let transport = Arc::downgrade(self);
        let delay = self.tuning.stream_watchdog;
        state.watchdog = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(transport) = transport.upgrade() {
                transport.on_watchdog();
            }
        }));
    }

    fn on_watchdog(self: &Arc<Self>) {
        let mut state = self.state.lock();
        // The firing timer is this task; detach rather than abort it.
        state.watchdog = None;
        if state.closed {
            return;
        }
        let Some(slot) = state.stream.take() else {
            return;
        };
        if state.socket_open {
            slot.handle.abort();
            debug!(
                target = "tidepool::transport",
                index = slot.index,
                "socket ready; stream request dropped"
            );
            return;
        }
        let Some(session) = state.session.clone() else {
            return;
        };
        let next = slot.index.wrapping_add(1);
        info!(
            target = "tidepool::transport",
            index = next,
            "socket path not ready; restarting stream request"
        );
        state.retiring.retain(|handle| !handle.is_finished());
        state.retiring.push(slot.handle.abort_handle());
        let previous = slot.handle.abort_handle();
        self.start_stream(&mut state, &session, next, Some(previous));
    }

    fn spawn_socket(self: &Arc<Self>, session: &SessionIdentity) -> JoinHandle<()> {
        let url = self.endpoints.socket_url(session);
        tokio::spawn(run_socket(Arc::downgrade(self), url))
    }

    fn on_socket_open(self: &Arc<Self>, tx: mpsc::UnboundedSender<Message>) -> bool {
        let mut state = self.state.lock();
        if state.closed {
            return false;
        }
        state.socket_open = true;
        state.socket_tx = Some(tx);
        if let Some(watchdog) = state.watchdog.take() {
            watchdog.abort();
        }
        let transport = Arc::downgrade(self);
        let grace = self.tuning.socket_grace;
        state.grace = Some(tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            if let Some(transport) = transport.upgrade() {
                transport.retire_streams();
            }
        }));
        info!(target = "tidepool::transport", "socket path open");
        self.flush_queue(&mut state);
        true
    }

    fn retire_streams(&self) {
        let mut state = self.state.lock();
        state.grace = None;
        if let Some(slot) = state.stream.take() {
            slot.handle.abort();
            debug!(
                target = "tidepool::transport",
                index = slot.index,
                "stream request torn down after grace period"
            );
        }
        for handle in state.retiring.drain(..) {
            handle.abort();
        }
    }

    fn on_socket_finished(&self, outcome: SocketOutcome) {
        let mut state = self.state.lock();
        state.socket_open = false;
        state.socket_tx = None;
        if state.closed {
            return;
        }
        match outcome {
            SocketOutcome::ClosedLocally => {}
            SocketOutcome::ClosedRemotely => {
                warn!(target = "tidepool::transport", "socket closed unexpectedly");
                self.notify_closed(&mut state, false);
            }
            SocketOutcome::Failed(message) => {
                warn!(
                    target = "tidepool::transport",
                    error = %message,
                    "socket path failed"
                );
                let _ = self
                    .events
                    .send(TransportEvent::Error(TransportError::Socket(message)));
            }
        }
    }

    fn deliver_text(&self, text: &str, path: &'static str) {
        match Envelope::decode(text) {
            Ok(envelope) => {
                if self.state.lock().closed {
                    return;
                }
                trace!(
                    target = "tidepool::transport",
                    kind = envelope.type_name(),
                    path,
                    "signal in"
                );
                let _ = self.events.send(TransportEvent::Message(envelope));
            }
            Err(err) => {
                warn!(
                    target = "tidepool::transport",
                    path,
                    error = %err,
                    "dropping malformed signaling message"
                );
            }
        }
    }

    fn notify_closed(&self, state: &mut TransportState, explicit: bool) {
        if state.closed_notified {
            return;
        }
        state.closed_notified = true;
        let _ = self.events.send(TransportEvent::Closed { explicit });
    }
}

impl SignalSink for SignalingTransport {
    fn send(&self, envelope: Envelope) {
        let mut state = self.state.lock();
        if state.closed {
            debug!(
                target = "tidepool::transport",
                kind = envelope.type_name(),
                "transport closed; dropping outbound envelope"
            );
            return;
        }
        if state.session.is_none() {
            state.queue.push_back(envelope);
            return;
        }
        self.dispatch(&mut state, envelope);
    }
}

impl Drop for SignalingTransport {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        let handles = [
            state.watchdog.take(),
            state.grace.take(),
            state.stream.take().map(|slot| slot.handle),
            state.socket_task.take(),
            state.poster_task.take(),
        ];
        for handle in handles.into_iter().flatten() {
            handle.abort();
        }
        for handle in state.retiring.drain(..) {
            handle.abort();
        }
    }
}

async fn run_poster(http: reqwest::Client, mut posts: mpsc::UnboundedReceiver<OneShotPost>) {
    while let Some(post) = posts.recv().await {
        match http
            .post(&post.url)
            .header(CONTENT_TYPE, "application/json")
            .body(post.body)
            .send()
            .await
        {
            Ok(response) if !response.status().is_success() => {
                warn!(
                    target = "tidepool::transport",
                    url = %post.url,
                    status = %response.status(),
                    "signaling post rejected"
                );
            }
            Ok(_) => {}
            Err(err) => {
                warn!(
                    target = "tidepool::transport",
                    url = %post.url,
                    error = %err,
                    "signaling post failed"
                );
            }
        }
    }
}

async fn run_stream(
    transport: Weak<SignalingTransport>,
    http: reqwest::Client,
    url: String,
    index: u32,
    previous: Option<AbortHandle>,
) {
    let mut response = match http.post(&url).send().await {
        Ok(response) if response.status().is_success() => response,
        Ok(response) => {
            warn!(
                target = "tidepool::transport",
                index,
                status = %response.status(),
                "stream request rejected"
            );
            return;
        }
        Err(err) => {
            warn!(
                target = "tidepool::transport",
                index,
                error = %err,
                "stream request failed"
            );
            return;
        }
    };
    if let Some(previous) = previous {
        previous.abort();
        debug!(target = "tidepool::transport", index, "previous stream request retired");
    }

    let mut decoder = StreamDecoder::new();
    loop {
        match response.chunk().await {
            Ok(Some(bytes)) => {
                let Some(transport) = transport.upgrade() else {
                    return;
                };
                for record in decoder.push(&bytes) {
                    transport.deliver_text(&record, "stream");
                }
            }
            Ok(None) => {
                debug!(target = "tidepool::transport", index, "stream request ended");
                return;
            }
            Err(err) => {
                debug!(
                    target = "tidepool::transport",
                    index,
                    error = %err,
                    "stream read failed"
                );
                return;
            }
        }
    }
}

async fn run_socket(transport: Weak<SignalingTransport>, url: Url) {
    let ws = match connect_async(url.as_str()).await {
        Ok((ws, _)) => ws,
        Err(err) => {
            warn!(
                target = "tidepool::transport",
                url = %url,
                error = %err,
                "socket path unavailable; staying on stream"
            );
            return;
        }
    };
    let (mut write, mut read) = ws.split();
    let (tx, mut outbound) = mpsc::unbounded_channel::<Message>();
    let opened = match transport.upgrade() {
        Some(transport) => transport.on_socket_open(tx),
        None => false,
    };
    if !opened {
        let _ = write.send(Message::Close(None)).await;
        return;
    }

    let outcome = loop {
        tokio::select! {
            message = outbound.recv() => match message {
                Some(message) => {
                    let closing = matches!(message, Message::Close(_));
                    if let Err(err) = write.send(message).await {
                        break SocketOutcome::Failed(err.to_string());
                    }
                    if closing {
                        break SocketOutcome::ClosedLocally;
                    }
                }
                None => break SocketOutcome::ClosedLocally,
            },
            incoming = read.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    if let Some(transport) = transport.upgrade() {
                        transport.deliver_text(&text, "socket");
                    }
                }
                Some(Ok(Message::Binary(data))) => match String::from_utf8(data) {
                    Ok(text) => {
                        if let Some(transport) = transport.upgrade() {
                            transport.deliver_text(&text, "socket");
                        }
                    }
                    Err(_) => {
                        warn!(target = "tidepool::transport", "dropping non utf-8 socket frame");
                    }
                },
                Some(Ok(Message::Close(_))) | None => break SocketOutcome::ClosedRemotely,
                Some(Ok(_)) => {}
                Some(Err(err)) => match err {
                    WsError::ConnectionClosed
                    | WsError::AlreadyClosed
                    | WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake) => {
                        break SocketOutcome::ClosedRemotely;
                    }
                    other => break SocketOutcome::Failed(other.to_string()),
                },
            },
        }
    };

    if let Some(transport) = transport.upgrade() {
        transport.on_socket_finished(outcome);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PeerOptions;
    use crate::protocol::Signal;

    fn transport() -> (
        Arc<SignalingTransport>,
        mpsc::UnboundedReceiver<TransportEvent>,
    ) {
        let options = PeerOptions {
            host: "127.0.0.1".into(),
            port: 1,
            ..PeerOptions::default()
        };
        let endpoints = Endpoints::from_options(&options).expect("endpoints");
        SignalingTransport::new(endpoints, TransportTuning::default()).expect("transport")
    }

    #[tokio::test]
    async fn sends_queue_until_started() {
        let (transport, _events) = transport();
        transport.send(Envelope::to("bob", Signal::Leave));
        transport.send(Envelope::to("carol", Signal::Leave));
        assert_eq!(transport.queued_len(), 2);
        assert!(!transport.is_started());
    }

    #[tokio::test]
    async fn close_is_reported_once() {
        let (transport, mut events) = transport();
        transport.send(Envelope::to("bob", Signal::Leave));
        transport.close();
        transport.close();
        assert_eq!(transport.queued_len(), 0);
        assert!(matches!(
            events.try_recv(),
            Ok(TransportEvent::Closed { explicit: true })
        ));
        assert!(events.try_recv().is_err());

        transport.send(Envelope::to("bob", Signal::Leave));
        assert_eq!(transport.queued_len(), 0);
        transport.start("alice");
        assert!(!transport.is_started());
    }
}
