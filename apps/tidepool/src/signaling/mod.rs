//! Routes inbound signaling envelopes to the peer and its connections.

pub mod pending;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::connection::{ConnectionContext, ConnectionRegistry, DataConnection};
use crate::error::{ErrorKind, PeerError};
use crate::negotiation::SessionOptions;
use crate::peer::PeerEvent;
use crate::protocol::{Envelope, LinkKind, OfferPayload, Signal};

pub use pending::{MAX_PENDING_PER_SESSION, PendingMessageStore};

pub struct SignalingRouter {
    id: String,
    ctx: ConnectionContext,
    registry: Arc<ConnectionRegistry>,
    pending: Mutex<PendingMessageStore>,
    events: mpsc::UnboundedSender<PeerEvent>,
    opened: AtomicBool,
}

impl SignalingRouter {
    pub fn new(
        id: impl Into<String>,
        ctx: ConnectionContext,
        registry: Arc<ConnectionRegistry>,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Self {
        Self {
            id: id.into(),
            ctx,
            registry,
            pending: Mutex::new(PendingMessageStore::default()),
            events,
            opened: AtomicBool::new(false),
        }
    }

    /// True once the service has acknowledged our id.
    pub fn is_open(&self) -> bool {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn pending_len(&self, connection_id: &str) -> usize {
        self.pending.lock().len(connection_id)
    }

    /// Handle one envelope. An `Err` is fatal for the whole peer.
    pub async fn dispatch(&self, envelope: Envelope) -> Result<(), PeerError> {
        debug!(
            target = "tidepool::signaling",
            kind = envelope.type_name(),
            src = ?envelope.src,
            "signal received"
        );
        match &envelope.signal {
            Signal::Open => {
                if !self.opened.swap(true, Ordering::SeqCst) {
                    info!(target = "tidepool::signaling", id = %self.id, "signaling open");
                    self.emit(PeerEvent::Open(self.id.clone()));
                }
                Ok(())
            }
            Signal::Error(payload) => Err(PeerError::new(ErrorKind::ServerError, payload.msg.clone())),
            Signal::IdTaken => Err(PeerError::new(
                ErrorKind::UnavailableId,
                format!("ID `{}` is taken", self.id),
            )),
            Signal::InvalidKey => Err(PeerError::new(
                ErrorKind::InvalidKey,
                "API key is invalid",
            )),
            Signal::Leave => {
                let Some(remote) = envelope.src.as_deref() else {
                    warn!(target = "tidepool::signaling", "LEAVE without source; dropped");
                    return Ok(());
                };
                self.handle_leave(remote).await;
                Ok(())
            }
            Signal::Expire => {
                let remote = envelope.src.as_deref().unwrap_or("unknown");
                self.emit(PeerEvent::Error(PeerError::new(
                    ErrorKind::PeerUnavailable,
                    format!("could not connect to peer {remote}"),
                )));
                Ok(())
            }
            Signal::Offer(offer) => {
                let Some(remote) = envelope.src.as_deref() else {
                    warn!(target = "tidepool::signaling", "OFFER without source; dropped");
                    return Ok(());
                };
                self.handle_offer(remote, offer).await;
                Ok(())
            }
            Signal::Answer(_) | Signal::Candidate(_) => {
                self.route_to_connection(envelope).await;
                Ok(())
            }
        }
    }

    async fn handle_leave(&self, remote: &str) {
        info!(target = "tidepool::signaling", remote, "remote left; closing its connections");
        for connection in self.registry.for_peer(remote) {
            connection.close().await;
        }
        let discarded = self.pending.lock().discard_from(remote);
        if discarded > 0 {
            debug!(
                target = "tidepool::signaling",
                remote,
                discarded,
                "discarded pending messages"
            );
        }
    }

    async fn handle_offer(&self, remote: &str, offer: &OfferPayload) {
        if self.registry.get(remote, &offer.connection_id).is_some() {
            warn!(
                target = "tidepool::signaling",
                remote,
                connection_id = %offer.connection_id,
                "offer for existing connection; ignored"
            );
            return;
        }
        if offer.kind == LinkKind::Media {
            warn!(
                target = "tidepool::signaling",
                remote,
                connection_id = %offer.connection_id,
                "media offers are not supported; dropped"
            );
            return;
        }

        let connection = DataConnection::from_offer(remote, offer, self.ctx.clone());
        self.registry.add(connection.clone());
        info!(
            target = "tidepool::signaling",
            remote,
            connection_id = %connection.id(),
            label = %connection.label(),
            "inbound connection"
        );
        self.emit(PeerEvent::Connection(connection.clone()));
        self.ctx
            .negotiator
            .start_connection(&connection, SessionOptions {
                originator: false,
                link_id: None,
                remote_offer: Some(offer.sdp.clone()),
            })
            .await;

        self.replay_pending(&connection).await;
    }

    /// Deliver what queued for `connection` before it had a link. A no-op
    /// until the link is attached.
    pub async fn replay_pending(&self, connection: &DataConnection) {
        if !connection.has_link() {
            return;
        }
        let queued = self.pending.lock().take(connection.id());
        if queued.is_empty() {
            return;
        }
        debug!(
            target = "tidepool::signaling",
            connection_id = %connection.id(),
            count = queued.len(),
            "replaying pending messages"
        );
        for envelope in queued {
            connection.handle_message(envelope).await;
        }
    }

    async fn route_to_connection(&self, envelope: Envelope) {
        let Some(remote) = envelope.src.clone() else {
            warn!(
                target = "tidepool::signaling",
                kind = envelope.type_name(),
                "signal without source; dropped"
            );
            return;
        };
        let Some(connection_id) = envelope.signal.connection_id().map(str::to_string) else {
            return;
        };
        match self.registry.get(&remote, &connection_id) {
            Some(connection) if connection.is_closed() => {
                debug!(
                    target = "tidepool::signaling",
                    connection_id = %connection_id,
                    kind = envelope.type_name(),
                    "signal for closed connection; dropped"
                );
            }
            Some(connection) if connection.has_link() => {
                self.replay_pending(&connection).await;
                connection.handle_message(envelope).await;
            }
            None if self.registry.was_closed(&remote, &connection_id) => {
                let stale = self.pending.lock().take(&connection_id).len();
                debug!(
                    target = "tidepool::signaling",
                    connection_id = %connection_id,
                    kind = envelope.type_name(),
                    stale,
                    "signal for closed connection; dropped"
                );
            }
            _ => {
                debug!(
                    target = "tidepool::signaling",
                    connection_id = %connection_id,
                    kind = envelope.type_name(),
                    "no ready connection; queued"
                );
                self.pending.lock().store(&connection_id, envelope);
            }
        }
    }

    fn emit(&self, event: PeerEvent) {
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::mock::MockLinkFactory;
    use crate::connection::ConnectOptions;
    use crate::link::{LinkCapabilities, PeerLink, SignalingState};
    use crate::negotiation::Negotiator;
    use crate::protocol::{
        AnswerPayload, CandidatePayload, ErrorPayload, IceCandidate, Serialization,
        SessionDescription,
    };
    use crate::testing::{RecordingSink, context_with};

    struct Harness {
        factory: Arc<MockLinkFactory>,
        sink: Arc<RecordingSink>,
        negotiator: Arc<Negotiator>,
        registry: Arc<ConnectionRegistry>,
        router: SignalingRouter,
        events: mpsc::UnboundedReceiver<PeerEvent>,
    }

    fn harness() -> Harness {
        harness_with(MockLinkFactory::new(LinkCapabilities {
            sctp: true,
            negotiation_needed: true,
        }))
    }

    fn harness_with(factory: Arc<MockLinkFactory>) -> Harness {
        let sink = RecordingSink::new();
        let negotiator = Negotiator::new(factory.clone(), sink.clone(), "tidepool");
        let registry = ConnectionRegistry::new();
        let (tx, events) = mpsc::unbounded_channel();
        let router = SignalingRouter::new(
            "me",
            context_with(&negotiator, &registry),
            registry.clone(),
            tx,
        );
        Harness {
            factory,
            sink,
            negotiator,
            registry,
            router,
            events,
        }
    }

    fn offer(connection_id: &str) -> Envelope {
        Envelope::new(Signal::Offer(OfferPayload {
            connection_id: connection_id.into(),
            kind: LinkKind::Data,
            sdp: SessionDescription::offer("v=0 offer"),
            label: Some("chat".into()),
            serialization: Serialization::Json,
            reliable: true,
            metadata: Some(serde_json::json!({"hello": "world"})),
            browser: Some("Chrome".into()),
        }))
        .with_src("alice")
    }

    fn candidate(connection_id: &str, n: u16) -> Envelope {
        Envelope::new(Signal::Candidate(CandidatePayload {
            connection_id: connection_id.into(),
            kind: LinkKind::Data,
            candidate: IceCandidate {
                candidate: format!("candidate:{n} 1 udp 1 10.0.0.{n} 9 typ host"),
                sdp_mid: Some("0".into()),
                sdp_mline_index: Some(0),
            },
        }))
        .with_src("alice")
    }

    fn connection_events(events: &mut mpsc::UnboundedReceiver<PeerEvent>) -> usize {
        let mut count = 0;
        while let Ok(event) = events.try_recv() {
            if matches!(event, PeerEvent::Connection(_)) {
                count += 1;
            }
        }
        count
    }

    #[tokio::test]
    async fn open_is_reported_once() {
        let mut h = harness();
        h.router.dispatch(Envelope::new(Signal::Open)).await.expect("open");
        h.router.dispatch(Envelope::new(Signal::Open)).await.expect("open again");
        assert!(h.router.is_open());
        assert!(matches!(h.events.try_recv(), Ok(PeerEvent::Open(id)) if id == "me"));
        assert!(h.events.try_recv().is_err());
    }

    #[tokio::test]
    async fn server_rejections_are_fatal_with_reason_codes() {
        let h = harness();
        let err = h
            .router
            .dispatch(Envelope::new(Signal::Error(ErrorPayload { msg: "nope".into() })))
            .await
            .expect_err("error");
        assert_eq!(err, PeerError::new(ErrorKind::ServerError, "nope"));

        let err = h
            .router
            .dispatch(Envelope::new(Signal::IdTaken))
            .await
            .expect_err("taken");
        assert_eq!(err.kind, ErrorKind::UnavailableId);
        assert!(err.is_fatal());

        let err = h
            .router
            .dispatch(Envelope::new(Signal::InvalidKey))
            .await
            .expect_err("invalid key");
        assert_eq!(err.kind, ErrorKind::InvalidKey);
    }

    #[tokio::test]
    async fn offer_creates_one_connection_and_answers() {
        let mut h = harness();
        h.router.dispatch(offer("dc_1")).await.expect("offer");
        h.router.dispatch(offer("dc_1")).await.expect("duplicate offer");

        assert_eq!(h.registry.len(), 1);
        assert_eq!(h.factory.links().len(), 1);
        assert_eq!(connection_events(&mut h.events), 1);

        let connection = h.registry.get("alice", "dc_1").expect("connection");
        assert_eq!(connection.label(), "chat");
        assert_eq!(connection.serialization(), Serialization::Json);
        assert!(connection.reliable());
        assert_eq!(connection.peer_browser().as_deref(), Some("Chrome"));
        assert_eq!(
            connection.metadata(),
            Some(&serde_json::json!({"hello": "world"}))
        );

        let sent = h.sink.take();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].type_name(), "ANSWER");
        assert_eq!(sent[0].dst.as_deref(), Some("alice"));
        assert_eq!(sent[0].signal.connection_id(), Some("dc_1"));
    }

    #[tokio::test]
    async fn candidates_before_offer_are_replayed_in_order() {
        let h = harness();
        h.router.dispatch(candidate("dc_2", 1)).await.expect("candidate 1");
        h.router.dispatch(candidate("dc_2", 2)).await.expect("candidate 2");
        assert_eq!(h.router.pending_len("dc_2"), 2);
        assert!(h.factory.links().is_empty());

        h.router.dispatch(offer("dc_2")).await.expect("offer");

        let link = h.factory.last_link().expect("link");
        let added: Vec<String> = link
            .candidates()
            .into_iter()
            .map(|candidate| candidate.candidate)
            .collect();
        assert_eq!(added.len(), 2);
        assert!(added[0].starts_with("candidate:1 "));
        assert!(added[1].starts_with("candidate:2 "));
        assert_eq!(h.router.pending_len("dc_2"), 0);
    }

    #[tokio::test]
    async fn live_connection_receives_candidates_directly() {
        let h = harness();
        h.router.dispatch(offer("dc_3")).await.expect("offer");
        h.router.dispatch(candidate("dc_3", 7)).await.expect("candidate");

        let link = h.factory.last_link().expect("link");
        assert_eq!(link.candidates().len(), 1);
        assert_eq!(h.router.pending_len("dc_3"), 0);
    }

    #[tokio::test]
    async fn unknown_answer_is_queued() {
        let h = harness();
        let answer = Envelope::new(Signal::Answer(AnswerPayload {
            connection_id: "dc_9".into(),
            kind: LinkKind::Data,
            sdp: SessionDescription::answer("v=0"),
            browser: None,
        }))
        .with_src("alice");
        h.router.dispatch(answer).await.expect("answer");
        assert_eq!(h.router.pending_len("dc_9"), 1);
    }

    #[tokio::test]
    async fn leave_closes_connections_and_forgets_pending() {
        let h = harness();
        h.router.dispatch(offer("dc_1")).await.expect("offer");
        h.router.dispatch(candidate("dc_5", 1)).await.expect("candidate");
        let connection = h.registry.get("alice", "dc_1").expect("connection");

        h.router
            .dispatch(Envelope::new(Signal::Leave).with_src("alice"))
            .await
            .expect("leave");

        assert!(connection.is_closed());
        assert!(h.registry.is_empty());
        assert_eq!(h.router.pending_len("dc_5"), 0);
        let link = h.factory.last_link().expect("link");
        assert_eq!(link.signaling_state(), SignalingState::Closed);
    }

    #[tokio::test]
    async fn expire_is_reported_without_aborting() {
        let mut h = harness();
        h.router
            .dispatch(Envelope::new(Signal::Expire).with_src("ghost"))
            .await
            .expect("expire is not fatal");
        match h.events.try_recv() {
            Ok(PeerEvent::Error(err)) => {
                assert_eq!(err.kind, ErrorKind::PeerUnavailable);
                assert!(err.message.contains("ghost"));
            }
            other => panic!("expected peer-unavailable, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn media_offers_and_sourceless_signals_are_dropped() {
        let mut h = harness();
        let mut media = offer("mc_1");
        if let Signal::Offer(payload) = &mut media.signal {
            payload.kind = LinkKind::Media;
        }
        h.router.dispatch(media).await.expect("media offer");

        let mut orphan = candidate("dc_4", 1);
        orphan.src = None;
        h.router.dispatch(orphan).await.expect("orphan candidate");

        assert!(h.registry.is_empty());
        assert!(h.factory.links().is_empty());
        assert_eq!(h.router.pending_len("dc_4"), 0);
        assert_eq!(connection_events(&mut h.events), 0);
    }

    #[tokio::test]
    async fn late_signals_for_closed_connection_are_dropped() {
        let h = harness();
        h.router.dispatch(offer("dc_1")).await.expect("offer");
        let connection = h.registry.get("alice", "dc_1").expect("connection");
        connection.close().await;
        assert!(h.registry.get("alice", "dc_1").is_none());

        for n in 1..=5 {
            h.router.dispatch(candidate("dc_1", n)).await.expect("candidate");
        }
        let answer = Envelope::new(Signal::Answer(AnswerPayload {
            connection_id: "dc_1".into(),
            kind: LinkKind::Data,
            sdp: SessionDescription::answer("v=0"),
            browser: None,
        }))
        .with_src("alice");
        h.router.dispatch(answer).await.expect("answer");

        assert_eq!(h.router.pending_len("dc_1"), 0);
        let link = h.factory.last_link().expect("link");
        assert!(link.candidates().is_empty());
    }

    #[tokio::test]
    async fn reoffered_connection_id_is_live_again() {
        let h = harness();
        h.router.dispatch(offer("dc_1")).await.expect("offer");
        h.registry.get("alice", "dc_1").expect("connection").close().await;

        h.router.dispatch(offer("dc_1")).await.expect("second offer");
        h.router.dispatch(candidate("dc_1", 4)).await.expect("candidate");

        assert_eq!(h.registry.len(), 1);
        let link = h.factory.last_link().expect("link");
        assert_eq!(link.candidates().len(), 1);
    }

    #[tokio::test]
    async fn signals_queued_before_link_replay_once_attached() {
        let h = harness_with(MockLinkFactory::legacy());
        let connection = DataConnection::new(
            "alice",
            ConnectOptions {
                connection_id: Some("dc_out".into()),
                ..ConnectOptions::default()
            },
            context_with(&h.negotiator, &h.registry),
        );
        h.registry.add(connection.clone());

        let answer = Envelope::new(Signal::Answer(AnswerPayload {
            connection_id: "dc_out".into(),
            kind: LinkKind::Data,
            sdp: SessionDescription::answer("v=0 answer"),
            browser: Some("tidepool".into()),
        }))
        .with_src("alice");
        h.router.dispatch(answer).await.expect("answer");
        h.router.dispatch(candidate("dc_out", 1)).await.expect("candidate 1");
        assert_eq!(h.router.pending_len("dc_out"), 2);

        h.router.replay_pending(&connection).await;
        assert_eq!(h.router.pending_len("dc_out"), 2);

        h.negotiator
            .start_connection(&connection, SessionOptions {
                originator: true,
                ..SessionOptions::default()
            })
            .await;
        let link = h.factory.last_link().expect("link");
        assert_eq!(link.signaling_state(), SignalingState::HaveLocalOffer);

        h.router.dispatch(candidate("dc_out", 2)).await.expect("candidate 2");

        assert_eq!(h.router.pending_len("dc_out"), 0);
        assert_eq!(link.signaling_state(), SignalingState::Stable);
        assert_eq!(connection.peer_browser().as_deref(), Some("tidepool"));
        let added: Vec<String> = link
            .candidates()
            .into_iter()
            .map(|candidate| candidate.candidate)
            .collect();
        assert_eq!(added.len(), 2);
        assert!(added[0].starts_with("candidate:1 "));
        assert!(added[1].starts_with("candidate:2 "));
    }
}
