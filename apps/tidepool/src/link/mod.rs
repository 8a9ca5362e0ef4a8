//! Seams between the negotiation engine and the WebRTC stack.

pub mod mock;
pub mod rtc;

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::error::{ChannelError, NegotiationError};
use crate::protocol::{IceCandidate, SessionDescription};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingState {
    New,
    HaveLocalOffer,
    HaveRemoteOffer,
    Stable,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceConnectionState {
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

/// One message on a data channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Bytes),
}

impl Frame {
    pub fn len(&self) -> usize {
        match self {
            Frame::Text(text) => text.len(),
            Frame::Binary(bytes) => bytes.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub enum LinkEvent {
    IceCandidate(IceCandidate),
    IceConnectionState(IceConnectionState),
    NegotiationNeeded,
    DataChannel(Arc<dyn DataChannel>),
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Open,
    Message(Frame),
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkCapabilities {
    /// Data channels run over SCTP (reliable by default, no bandwidth shim).
    pub sctp: bool,
    /// The link raises [`LinkEvent::NegotiationNeeded`] after a channel is
    /// added, so offers need not be started by hand.
    pub negotiation_needed: bool,
}

/// A single peer-to-peer session: one SDP exchange plus ICE.
#[async_trait]
pub trait PeerLink: Send + Sync {
    fn id(&self) -> &str;
    fn signaling_state(&self) -> SignalingState;
    async fn create_offer(&self) -> Result<SessionDescription, NegotiationError>;
    async fn create_answer(&self) -> Result<SessionDescription, NegotiationError>;
    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), NegotiationError>;
    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), NegotiationError>;
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), NegotiationError>;
    async fn create_data_channel(
        &self,
        label: &str,
        reliable: bool,
    ) -> Result<Arc<dyn DataChannel>, NegotiationError>;
    async fn close(&self);
}

#[async_trait]
pub trait DataChannel: Send + Sync {
    fn label(&self) -> &str;
    fn is_open(&self) -> bool;
    /// Route channel events to `events`. When the channel is already open an
    /// `Open` event is delivered right away.
    fn subscribe(&self, events: mpsc::UnboundedSender<ChannelEvent>);
    async fn send(&self, frame: &Frame) -> Result<(), ChannelError>;
    async fn close(&self);
}

#[async_trait]
pub trait LinkFactory: Send + Sync {
    fn capabilities(&self) -> LinkCapabilities;
    async fn create(
        &self,
        link_id: &str,
        events: mpsc::UnboundedSender<LinkEvent>,
    ) -> Result<Arc<dyn PeerLink>, NegotiationError>;
}
