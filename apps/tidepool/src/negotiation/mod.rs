//! Offer/answer/candidate engine driving peer links on behalf of connections.

pub mod pool;
pub mod sdp;

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use crate::connection::DataConnection;
use crate::error::NegotiationError;
use crate::link::{IceConnectionState, LinkEvent, LinkFactory, PeerLink, SignalingState};
use crate::protocol::{
    AnswerPayload, CandidatePayload, Envelope, IceCandidate, LinkKind, OfferPayload, SdpKind,
    SessionDescription, Signal,
};
use crate::random_token;
use crate::transport::SignalSink;

pub use pool::{LinkPool, PoolKey};
pub use sdp::higher_bandwidth_sdp;

#[derive(Debug, Clone, Default)]
pub struct SessionOptions {
    pub originator: bool,
    /// Pooled link to reuse, honoured only while that link is stable.
    pub link_id: Option<String>,
    pub remote_offer: Option<SessionDescription>,
}

pub struct Negotiator {
    factory: Arc<dyn LinkFactory>,
    signals: Arc<dyn SignalSink>,
    pool: Mutex<LinkPool>,
    browser: String,
}

impl Negotiator {
    pub fn new(
        factory: Arc<dyn LinkFactory>,
        signals: Arc<dyn SignalSink>,
        browser: impl Into<String>,
    ) -> Arc<Self> {
        Arc::new(Self {
            factory,
            signals,
            pool: Mutex::new(LinkPool::default()),
            browser: browser.into(),
        })
    }

    /// Obtain a link for `connection`, then either open a data channel and
    /// offer (originator) or apply the remote offer and answer.
    pub async fn start_connection(
        self: &Arc<Self>,
        connection: &Arc<DataConnection>,
        options: SessionOptions,
    ) {
        let link = match self
            .obtain_session(connection, options.link_id.as_deref())
            .await
        {
            Ok(link) => link,
            Err(err) => {
                connection.report_error(err.into());
                return;
            }
        };
        connection.attach_link(link.clone());

        if options.originator {
            let channel = match link
                .create_data_channel(connection.label(), connection.reliable())
                .await
            {
                Ok(channel) => channel,
                Err(err) => {
                    connection.report_error(err.into());
                    return;
                }
            };
            connection.initialize(channel);
            if !self.factory.capabilities().negotiation_needed {
                self.make_offer(connection).await;
            }
        } else if let Some(offer) = options.remote_offer {
            self.handle_sdp(connection, offer).await;
        }
    }

    pub async fn obtain_session(
        self: &Arc<Self>,
        connection: &Arc<DataConnection>,
        link_id: Option<&str>,
    ) -> Result<Arc<dyn PeerLink>, NegotiationError> {
        let key = PoolKey::new(connection.kind(), connection.peer());
        if let Some(link_id) = link_id {
            let pooled = self.pool.lock().get(&key, link_id);
            match pooled {
                Some(link) if link.signaling_state() == SignalingState::Stable => {
                    debug!(
                        target = "tidepool::negotiation",
                        link_id,
                        remote = %key.remote,
                        "reusing pooled link"
                    );
                    return Ok(link);
                }
                Some(link) => {
                    debug!(
                        target = "tidepool::negotiation",
                        link_id,
                        state = ?link.signaling_state(),
                        "pooled link busy; starting a new one"
                    );
                }
                None => {
                    debug!(
                        target = "tidepool::negotiation",
                        link_id,
                        "requested link not pooled; starting a new one"
                    );
                }
            }
        }
        self.start_link(connection, key).await
    }

    async fn start_link(
        self: &Arc<Self>,
        connection: &Arc<DataConnection>,
        key: PoolKey,
    ) -> Result<Arc<dyn PeerLink>, NegotiationError> {
        let link_id = format!("pc_{}", random_token());
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let link = self.factory.create(&link_id, events_tx).await?;
        info!(
            target = "tidepool::negotiation",
            link_id = %link_id,
            remote = %key.remote,
            connection_id = %connection.id(),
            "peer link created"
        );
        self.pool.lock().insert(key, link.clone());
        self.spawn_listener(connection, &link, events_rx);
        Ok(link)
    }

    fn spawn_listener(
        self: &Arc<Self>,
        connection: &Arc<DataConnection>,
        link: &Arc<dyn PeerLink>,
        mut events: mpsc::UnboundedReceiver<LinkEvent>,
    ) {
        let negotiator = Arc::downgrade(self);
        let connection = Arc::downgrade(connection);
        let link_ref = Arc::downgrade(link);
        let link_id = link.id().to_string();
        tokio::spawn(async move {
            let mut candidates_complete = false;
            while let Some(event) = events.recv().await {
                if matches!(event, LinkEvent::Closed) {
                    break;
                }
                let (Some(negotiator), Some(connection)) =
                    (negotiator.upgrade(), connection.upgrade())
                else {
                    break;
                };
                match event {
                    LinkEvent::IceCandidate(candidate) => {
                        if candidates_complete {
                            trace!(
                                target = "tidepool::negotiation",
                                link_id = %link_id,
                                "candidate after ice completed; not signaled"
                            );
                            continue;
                        }
                        negotiator.signals.send(Envelope::to(
                            connection.peer(),
                            Signal::Candidate(CandidatePayload {
                                connection_id: connection.id().to_string(),
                                kind: connection.kind(),
                                candidate,
                            }),
                        ));
                    }
                    LinkEvent::IceConnectionState(state) => match state {
                        IceConnectionState::Disconnected | IceConnectionState::Failed => {
                            info!(
                                target = "tidepool::negotiation",
                                link_id = %link_id,
                                state = ?state,
                                connection_id = %connection.id(),
                                "link lost; closing connection"
                            );
                            connection.close().await;
                        }
                        IceConnectionState::Completed => {
                            candidates_complete = true;
                        }
                        other => {
                            debug!(
                                target = "tidepool::negotiation",
                                link_id = %link_id,
                                state = ?other,
                                "ice state changed"
                            );
                        }
                    },
                    LinkEvent::NegotiationNeeded => {
                        let Some(link) = link_ref.upgrade() else {
                            break;
                        };
                        let state = link.signaling_state();
                        if state == SignalingState::Stable {
                            negotiator.make_offer(&connection).await;
                        } else {
                            debug!(
                                target = "tidepool::negotiation",
                                link_id = %link_id,
                                state = ?state,
                                "negotiation needed mid-exchange; ignored"
                            );
                        }
                    }
                    LinkEvent::DataChannel(channel) => {
                        debug!(
                            target = "tidepool::negotiation",
                            link_id = %link_id,
                            label = %channel.label(),
                            "inbound data channel"
                        );
                        connection.initialize(channel);
                    }
                    LinkEvent::Closed => break,
                }
            }
            trace!(target = "tidepool::negotiation", link_id = %link_id, "link listener done");
        });
    }

    pub async fn make_offer(&self, connection: &DataConnection) {
        if let Err(err) = self.try_make_offer(connection).await {
            connection.report_error(err.into());
        }
    }

    async fn try_make_offer(&self, connection: &DataConnection) -> Result<(), NegotiationError> {
        let link = connection.link().ok_or(NegotiationError::NoLink)?;
        let mut offer = link.create_offer().await?;
        if !self.factory.capabilities().sctp && connection.reliable() {
            offer.sdp = higher_bandwidth_sdp(&offer.sdp);
        }
        link.set_local_description(offer.clone()).await?;
        debug!(
            target = "tidepool::negotiation",
            connection_id = %connection.id(),
            "local offer applied"
        );
        self.signals.send(Envelope::to(
            connection.peer(),
            Signal::Offer(OfferPayload {
                connection_id: connection.id().to_string(),
                kind: connection.kind(),
                sdp: offer,
                label: Some(connection.label().to_string()),
                serialization: connection.serialization(),
                reliable: connection.reliable(),
                metadata: connection.metadata().cloned(),
                browser: Some(self.browser.clone()),
            }),
        ));
        Ok(())
    }

    pub async fn make_answer(&self, connection: &DataConnection) {
        if let Err(err) = self.try_make_answer(connection).await {
            connection.report_error(err.into());
        }
    }

    async fn try_make_answer(&self, connection: &DataConnection) -> Result<(), NegotiationError> {
        let link = connection.link().ok_or(NegotiationError::NoLink)?;
        let mut answer = link.create_answer().await?;
        if !self.factory.capabilities().sctp && connection.reliable() {
            answer.sdp = higher_bandwidth_sdp(&answer.sdp);
        }
        link.set_local_description(answer.clone()).await?;
        debug!(
            target = "tidepool::negotiation",
            connection_id = %connection.id(),
            "local answer applied"
        );
        self.signals.send(Envelope::to(
            connection.peer(),
            Signal::Answer(AnswerPayload {
                connection_id: connection.id().to_string(),
                kind: connection.kind(),
                sdp: answer,
                browser: Some(self.browser.clone()),
            }),
        ));
        Ok(())
    }

    /// Apply a remote description; an offer is answered straight away.
    pub async fn handle_sdp(&self, connection: &DataConnection, description: SessionDescription) {
        if let Err(err) = self.try_handle_sdp(connection, description).await {
            connection.report_error(err.into());
        }
    }

    async fn try_handle_sdp(
        &self,
        connection: &DataConnection,
        description: SessionDescription,
    ) -> Result<(), NegotiationError> {
        let link = connection.link().ok_or(NegotiationError::NoLink)?;
        let kind = description.kind;
        link.set_remote_description(description).await?;
        debug!(
            target = "tidepool::negotiation",
            connection_id = %connection.id(),
            kind = ?kind,
            "remote description applied"
        );
        if kind == SdpKind::Offer {
            self.try_make_answer(connection).await?;
        }
        Ok(())
    }

    pub async fn handle_candidate(&self, connection: &DataConnection, candidate: IceCandidate) {
        let Some(link) = connection.link() else {
            warn!(
                target = "tidepool::negotiation",
                connection_id = %connection.id(),
                "candidate for connection without a link"
            );
            return;
        };
        match link.add_ice_candidate(candidate).await {
            Ok(()) => trace!(
                target = "tidepool::negotiation",
                connection_id = %connection.id(),
                "remote candidate added"
            ),
            Err(err) => warn!(
                target = "tidepool::negotiation",
                connection_id = %connection.id(),
                error = %err,
                "remote candidate rejected"
            ),
        }
    }

    /// Detach and close the connection's link and drop it from the pool.
    pub async fn cleanup(&self, connection: &DataConnection) {
        let Some(link) = connection.take_link() else {
            return;
        };
        let key = PoolKey::new(connection.kind(), connection.peer());
        self.pool.lock().remove(&key, link.id());
        if link.signaling_state() != SignalingState::Closed {
            link.close().await;
        }
        debug!(
            target = "tidepool::negotiation",
            link_id = %link.id(),
            connection_id = %connection.id(),
            "link released"
        );
    }

    pub fn pool_len(&self, kind: LinkKind, remote: &str) -> usize {
        self.pool.lock().len(&PoolKey::new(kind, remote))
    }

    pub fn pooled_link(
        &self,
        kind: LinkKind,
        remote: &str,
        link_id: &str,
    ) -> Option<Arc<dyn PeerLink>> {
        self.pool.lock().get(&PoolKey::new(kind, remote), link_id)
    }
}
