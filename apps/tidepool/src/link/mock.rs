//! In-memory links for exercising negotiation without a network stack.
//!
//! The mock follows the offer/answer state machine closely enough for the
//! engine's ordering guarantees to be observable: answers require a remote
//! offer, candidates require a remote description, and every call is
//! recorded.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};

use super::{
    ChannelEvent, DataChannel, Frame, LinkCapabilities, LinkEvent, LinkFactory, PeerLink,
    SignalingState,
};
use crate::error::{ChannelError, NegotiationError};
use crate::protocol::{IceCandidate, SdpKind, SessionDescription};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkOp {
    Create,
    CreateOffer,
    CreateAnswer,
    SetLocalDescription,
    SetRemoteDescription,
    AddCandidate,
    CreateDataChannel,
}

pub struct MockLinkFactory {
    capabilities: LinkCapabilities,
    links: Mutex<Vec<Arc<MockPeerLink>>>,
    failing: Mutex<HashSet<LinkOp>>,
}

impl MockLinkFactory {
    pub fn new(capabilities: LinkCapabilities) -> Arc<Self> {
        Arc::new(Self {
            capabilities,
            links: Mutex::new(Vec::new()),
            failing: Mutex::new(HashSet::new()),
        })
    }

    /// Links without SCTP that rely on the engine to start offers.
    pub fn legacy() -> Arc<Self> {
        Self::new(LinkCapabilities {
            sctp: false,
            negotiation_needed: false,
        })
    }

    /// Every link created from now on fails `op`.
    pub fn fail(&self, op: LinkOp) {
        self.failing.lock().insert(op);
    }

    pub fn links(&self) -> Vec<Arc<MockPeerLink>> {
        self.links.lock().clone()
    }

    pub fn last_link(&self) -> Option<Arc<MockPeerLink>> {
        self.links.lock().last().cloned()
    }
}

#[async_trait]
impl LinkFactory for MockLinkFactory {
    fn capabilities(&self) -> LinkCapabilities {
        self.capabilities
    }

    async fn create(
        &self,
        link_id: &str,
        events: mpsc::UnboundedSender<LinkEvent>,
    ) -> Result<Arc<dyn PeerLink>, NegotiationError> {
        let failing = self.failing.lock().clone();
        if failing.contains(&LinkOp::Create) {
            return Err(NegotiationError::CreateLink("injected failure".into()));
        }
        let link = Arc::new(MockPeerLink {
            id: link_id.to_string(),
            events,
            state: Mutex::new(SignalingState::Stable),
            local: Mutex::new(None),
            remote: Mutex::new(None),
            candidates: Mutex::new(Vec::new()),
            channels: Mutex::new(Vec::new()),
            failing: Mutex::new(failing),
            offers_created: AtomicUsize::new(0),
            closes: AtomicUsize::new(0),
        });
        self.links.lock().push(link.clone());
        Ok(link)
    }
}

pub struct MockPeerLink {
    id: String,
    events: mpsc::UnboundedSender<LinkEvent>,
    state: Mutex<SignalingState>,
    local: Mutex<Option<SessionDescription>>,
    remote: Mutex<Option<SessionDescription>>,
    candidates: Mutex<Vec<IceCandidate>>,
    channels: Mutex<Vec<Arc<MockDataChannel>>>,
    failing: Mutex<HashSet<LinkOp>>,
    offers_created: AtomicUsize,
    closes: AtomicUsize,
}

impl MockPeerLink {
    /// Inject an event as if the stack had raised it.
    pub fn emit(&self, event: LinkEvent) {
        let _ = self.events.send(event);
    }

    pub fn set_state(&self, state: SignalingState) {
        *self.state.lock() = state;
    }

    pub fn fail(&self, op: LinkOp) {
        self.failing.lock().insert(op);
    }

    pub fn local_description(&self) -> Option<SessionDescription> {
        self.local.lock().clone()
    }

    pub fn remote_description(&self) -> Option<SessionDescription> {
        self.remote.lock().clone()
    }

    pub fn candidates(&self) -> Vec<IceCandidate> {
        self.candidates.lock().clone()
    }

    pub fn channels(&self) -> Vec<Arc<MockDataChannel>> {
        self.channels.lock().clone()
    }

    pub fn offers_created(&self) -> usize {
        self.offers_created.load(Ordering::SeqCst)
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    fn check(&self, op: LinkOp) -> Result<(), String> {
        if self.failing.lock().contains(&op) {
            Err("injected failure".into())
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl PeerLink for MockPeerLink {
    fn id(&self) -> &str {
        &self.id
    }

    fn signaling_state(&self) -> SignalingState {
        *self.state.lock()
    }

    async fn create_offer(&self) -> Result<SessionDescription, NegotiationError> {
        self.check(LinkOp::CreateOffer)
            .map_err(NegotiationError::CreateOffer)?;
        let serial = self.offers_created.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(SessionDescription::offer(format!(
            "v=0\r\no=mock {} {serial}\r\nb=AS:30\r\n",
            self.id
        )))
    }

    async fn create_answer(&self) -> Result<SessionDescription, NegotiationError> {
        self.check(LinkOp::CreateAnswer)
            .map_err(NegotiationError::CreateAnswer)?;
        if self.signaling_state() != SignalingState::HaveRemoteOffer {
            return Err(NegotiationError::CreateAnswer("no remote offer".into()));
        }
        Ok(SessionDescription::answer(format!(
            "v=0\r\no=mock {} answer\r\nb=AS:30\r\n",
            self.id
        )))
    }

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), NegotiationError> {
        self.check(LinkOp::SetLocalDescription)
            .map_err(NegotiationError::SetLocalDescription)?;
        let mut state = self.state.lock();
        let next = match (description.kind, *state) {
            (SdpKind::Offer, SignalingState::New | SignalingState::Stable) => {
                SignalingState::HaveLocalOffer
            }
            (SdpKind::Answer, SignalingState::HaveRemoteOffer) => SignalingState::Stable,
            (kind, current) => {
                return Err(NegotiationError::SetLocalDescription(format!(
                    "cannot apply local {kind:?} in {current:?}"
                )));
            }
        };
        *state = next;
        *self.local.lock() = Some(description);
        Ok(())
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), NegotiationError> {
        self.check(LinkOp::SetRemoteDescription)
            .map_err(NegotiationError::SetRemoteDescription)?;
        let mut state = self.state.lock();
        let next = match (description.kind, *state) {
            (SdpKind::Offer, SignalingState::New | SignalingState::Stable) => {
                SignalingState::HaveRemoteOffer
            }
            (SdpKind::Answer, SignalingState::HaveLocalOffer) => SignalingState::Stable,
            (kind, current) => {
                return Err(NegotiationError::SetRemoteDescription(format!(
                    "cannot apply remote {kind:?} in {current:?}"
                )));
            }
        };
        *state = next;
        *self.remote.lock() = Some(description);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), NegotiationError> {
        self.check(LinkOp::AddCandidate)
            .map_err(NegotiationError::AddCandidate)?;
        if self.remote.lock().is_none() {
            return Err(NegotiationError::AddCandidate(
                "remote description not set".into(),
            ));
        }
        self.candidates.lock().push(candidate);
        Ok(())
    }

    async fn create_data_channel(
        &self,
        label: &str,
        _reliable: bool,
    ) -> Result<Arc<dyn DataChannel>, NegotiationError> {
        self.check(LinkOp::CreateDataChannel)
            .map_err(NegotiationError::DataChannel)?;
        let channel = MockDataChannel::new(label);
        self.channels.lock().push(channel.clone());
        Ok(channel)
    }

    async fn close(&self) {
        *self.state.lock() = SignalingState::Closed;
        self.closes.fetch_add(1, Ordering::SeqCst);
        let _ = self.events.send(LinkEvent::Closed);
    }
}

pub struct MockDataChannel {
    label: String,
    open: AtomicBool,
    closed: AtomicBool,
    subscriber: Mutex<Option<mpsc::UnboundedSender<ChannelEvent>>>,
    sent: Mutex<Vec<Frame>>,
    failures_remaining: Mutex<usize>,
    attempts: AtomicUsize,
    held: watch::Sender<bool>,
}

impl MockDataChannel {
    pub fn new(label: &str) -> Arc<Self> {
        Arc::new(Self {
            label: label.to_string(),
            open: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            subscriber: Mutex::new(None),
            sent: Mutex::new(Vec::new()),
            failures_remaining: Mutex::new(0),
            attempts: AtomicUsize::new(0),
            held: watch::channel(false).0,
        })
    }

    /// Transition to open and notify the subscriber.
    pub fn open(&self) {
        self.open.store(true, Ordering::SeqCst);
        self.notify(ChannelEvent::Open);
    }

    /// Deliver an inbound frame as if the remote had sent it.
    pub fn deliver(&self, frame: Frame) {
        self.notify(ChannelEvent::Message(frame));
    }

    pub fn remote_close(&self) {
        self.open.store(false, Ordering::SeqCst);
        self.notify(ChannelEvent::Closed);
    }

    /// Reject the next `count` sends with a transient error.
    pub fn fail_next_sends(&self, count: usize) {
        *self.failures_remaining.lock() = count;
    }

    /// Park every send after it is counted until [`release_sends`] runs.
    ///
    /// [`release_sends`]: MockDataChannel::release_sends
    pub fn hold_sends(&self) {
        self.held.send_replace(true);
    }

    pub fn release_sends(&self) {
        self.held.send_replace(false);
    }

    pub fn sent(&self) -> Vec<Frame> {
        self.sent.lock().clone()
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn notify(&self, event: ChannelEvent) {
        if let Some(tx) = self.subscriber.lock().as_ref() {
            let _ = tx.send(event);
        }
    }
}

#[async_trait]
impl DataChannel for MockDataChannel {
    fn label(&self) -> &str {
        &self.label
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn subscribe(&self, events: mpsc::UnboundedSender<ChannelEvent>) {
        if self.is_open() {
            let _ = events.send(ChannelEvent::Open);
        }
        *self.subscriber.lock() = Some(events);
    }

    async fn send(&self, frame: &Frame) -> Result<(), ChannelError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let mut gate = self.held.subscribe();
        let _ = gate.wait_for(|held| !*held).await;
        if self.is_closed() {
            return Err(ChannelError::Closed);
        }
        if !self.is_open() {
            return Err(ChannelError::NotReady);
        }
        {
            let mut remaining = self.failures_remaining.lock();
            if *remaining > 0 {
                *remaining -= 1;
                return Err(ChannelError::Send("injected failure".into()));
            }
        }
        self.sent.lock().push(frame.clone());
        Ok(())
    }

    async fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
        self.closed.store(true, Ordering::SeqCst);
    }
}
