use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{API, APIBuilder};
use webrtc::data_channel::RTCDataChannel;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;

use super::{
    ChannelEvent, DataChannel, Frame, IceConnectionState, LinkCapabilities, LinkEvent,
    LinkFactory, PeerLink, SignalingState,
};
use crate::config::IceServer;
use crate::error::{ChannelError, NegotiationError};
use crate::protocol::{IceCandidate, SdpKind, SessionDescription};

fn build_api() -> Result<API, NegotiationError> {
    let mut media_engine = MediaEngine::default();
    media_engine
        .register_default_codecs()
        .map_err(|err| NegotiationError::CreateLink(err.to_string()))?;

    let mut registry = Registry::new();
    registry = register_default_interceptors(registry, &mut media_engine)
        .map_err(|err| NegotiationError::CreateLink(err.to_string()))?;

    Ok(APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build())
}

/// Creates `webrtc` peer connections sharing one API instance.
pub struct RtcLinkFactory {
    api: API,
    config: RTCConfiguration,
}

impl RtcLinkFactory {
    pub fn new(ice_servers: &[IceServer]) -> Result<Self, NegotiationError> {
        let config = RTCConfiguration {
            ice_servers: ice_servers
                .iter()
                .map(|server| RTCIceServer {
                    urls: server.urls.clone(),
                    username: server.username.clone().unwrap_or_default(),
                    credential: server.credential.clone().unwrap_or_default(),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        };
        Ok(Self {
            api: build_api()?,
            config,
        })
    }
}

#[async_trait]
impl LinkFactory for RtcLinkFactory {
    fn capabilities(&self) -> LinkCapabilities {
        LinkCapabilities {
            sctp: true,
            negotiation_needed: true,
        }
    }

    async fn create(
        &self,
        link_id: &str,
        events: mpsc::UnboundedSender<LinkEvent>,
    ) -> Result<Arc<dyn PeerLink>, NegotiationError> {
        let pc = Arc::new(
            self.api
                .new_peer_connection(self.config.clone())
                .await
                .map_err(|err| NegotiationError::CreateLink(err.to_string()))?,
        );

        let candidate_tx = events.clone();
        let candidate_link = link_id.to_string();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let tx = candidate_tx.clone();
            let link_id = candidate_link.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    trace!(target = "tidepool::link", link_id = %link_id, "ice gathering complete");
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = tx.send(LinkEvent::IceCandidate(IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                        }));
                    }
                    Err(err) => {
                        warn!(
                            target = "tidepool::link",
                            link_id = %link_id,
                            error = %err,
                            "failed to serialize local candidate"
                        );
                    }
                }
            })
        }));

        let state_tx = events.clone();
        pc.on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
            let tx = state_tx.clone();
            Box::pin(async move {
                if let Some(state) = map_ice_state(state) {
                    let _ = tx.send(LinkEvent::IceConnectionState(state));
                }
            })
        }));

        let negotiation_tx = events.clone();
        pc.on_negotiation_needed(Box::new(move || {
            let tx = negotiation_tx.clone();
            Box::pin(async move {
                let _ = tx.send(LinkEvent::NegotiationNeeded);
            })
        }));

        let channel_tx = events.clone();
        pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
            let tx = channel_tx.clone();
            Box::pin(async move {
                debug!(target = "tidepool::link", label = %dc.label(), "remote data channel announced");
                let channel: Arc<dyn DataChannel> = Arc::new(RtcDataChannel::new(dc));
                let _ = tx.send(LinkEvent::DataChannel(channel));
            })
        }));

        Ok(Arc::new(RtcPeerLink {
            id: link_id.to_string(),
            pc,
            events,
        }))
    }
}

fn map_ice_state(state: RTCIceConnectionState) -> Option<IceConnectionState> {
    Some(match state {
        RTCIceConnectionState::New => IceConnectionState::New,
        RTCIceConnectionState::Checking => IceConnectionState::Checking,
        RTCIceConnectionState::Connected => IceConnectionState::Connected,
        RTCIceConnectionState::Completed => IceConnectionState::Completed,
        RTCIceConnectionState::Disconnected => IceConnectionState::Disconnected,
        RTCIceConnectionState::Failed => IceConnectionState::Failed,
        RTCIceConnectionState::Closed => IceConnectionState::Closed,
        _ => return None,
    })
}

fn to_rtc_description(
    description: SessionDescription,
) -> Result<RTCSessionDescription, webrtc::Error> {
    match description.kind {
        SdpKind::Offer => RTCSessionDescription::offer(description.sdp),
        SdpKind::Answer => RTCSessionDescription::answer(description.sdp),
        SdpKind::Pranswer => RTCSessionDescription::pranswer(description.sdp),
        SdpKind::Rollback => {
            let mut rollback = RTCSessionDescription::default();
            rollback.sdp_type = RTCSdpType::Rollback;
            Ok(rollback)
        }
    }
}

fn from_rtc_description(description: RTCSessionDescription) -> SessionDescription {
    let kind = match description.sdp_type {
        RTCSdpType::Answer => SdpKind::Answer,
        RTCSdpType::Pranswer => SdpKind::Pranswer,
        RTCSdpType::Rollback => SdpKind::Rollback,
        _ => SdpKind::Offer,
    };
    SessionDescription {
        kind,
        sdp: description.sdp,
    }
}

struct RtcPeerLink {
    id: String,
    pc: Arc<RTCPeerConnection>,
    events: mpsc::UnboundedSender<LinkEvent>,
}

#[async_trait]
impl PeerLink for RtcPeerLink {
    fn id(&self) -> &str {
        &self.id
    }

    fn signaling_state(&self) -> SignalingState {
        match self.pc.signaling_state() {
            RTCSignalingState::Stable => SignalingState::Stable,
            RTCSignalingState::HaveLocalOffer | RTCSignalingState::HaveRemotePranswer => {
                SignalingState::HaveLocalOffer
            }
            RTCSignalingState::HaveRemoteOffer | RTCSignalingState::HaveLocalPranswer => {
                SignalingState::HaveRemoteOffer
            }
            RTCSignalingState::Closed => SignalingState::Closed,
            _ => SignalingState::New,
        }
    }

    async fn create_offer(&self) -> Result<SessionDescription, NegotiationError> {
        self.pc
            .create_offer(None)
            .await
            .map(from_rtc_description)
            .map_err(|err| NegotiationError::CreateOffer(err.to_string()))
    }

    async fn create_answer(&self) -> Result<SessionDescription, NegotiationError> {
        self.pc
            .create_answer(None)
            .await
            .map(from_rtc_description)
            .map_err(|err| NegotiationError::CreateAnswer(err.to_string()))
    }

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), NegotiationError> {
        let description = to_rtc_description(description)
            .map_err(|err| NegotiationError::SetLocalDescription(err.to_string()))?;
        self.pc
            .set_local_description(description)
            .await
            .map_err(|err| NegotiationError::SetLocalDescription(err.to_string()))
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), NegotiationError> {
        let description = to_rtc_description(description)
            .map_err(|err| NegotiationError::SetRemoteDescription(err.to_string()))?;
        self.pc
            .set_remote_description(description)
            .await
            .map_err(|err| NegotiationError::SetRemoteDescription(err.to_string()))
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), NegotiationError> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: None,
            })
            .await
            .map_err(|err| NegotiationError::AddCandidate(err.to_string()))
    }

    async fn create_data_channel(
        &self,
        label: &str,
        reliable: bool,
    ) -> Result<Arc<dyn DataChannel>, NegotiationError> {
        let init = if reliable {
            RTCDataChannelInit {
                ordered: Some(true),
                ..Default::default()
            }
        } else {
            RTCDataChannelInit {
                ordered: Some(false),
                max_retransmits: Some(0),
                ..Default::default()
            }
        };
        let dc = self
            .pc
            .create_data_channel(label, Some(init))
            .await
            .map_err(|err| NegotiationError::DataChannel(err.to_string()))?;
        Ok(Arc::new(RtcDataChannel::new(dc)))
    }

    async fn close(&self) {
        if let Err(err) = self.pc.close().await {
            debug!(
                target = "tidepool::link",
                link_id = %self.id,
                error = %err,
                "peer connection close reported error"
            );
        }
        let _ = self.events.send(LinkEvent::Closed);
    }
}

struct RtcDataChannel {
    label: String,
    inner: Arc<RTCDataChannel>,
}

impl RtcDataChannel {
    fn new(inner: Arc<RTCDataChannel>) -> Self {
        Self {
            label: inner.label().to_string(),
            inner,
        }
    }
}

#[async_trait]
impl DataChannel for RtcDataChannel {
    fn label(&self) -> &str {
        &self.label
    }

    fn is_open(&self) -> bool {
        self.inner.ready_state() == RTCDataChannelState::Open
    }

    fn subscribe(&self, events: mpsc::UnboundedSender<ChannelEvent>) {
        let open_tx = events.clone();
        self.inner.on_open(Box::new(move || {
            Box::pin(async move {
                let _ = open_tx.send(ChannelEvent::Open);
            })
        }));

        let message_tx = events.clone();
        self.inner
            .on_message(Box::new(move |message: DataChannelMessage| {
                let tx = message_tx.clone();
                Box::pin(async move {
                    let frame = if message.is_string {
                        match String::from_utf8(message.data.to_vec()) {
                            Ok(text) => Frame::Text(text),
                            Err(_) => Frame::Binary(message.data),
                        }
                    } else {
                        Frame::Binary(message.data)
                    };
                    let _ = tx.send(ChannelEvent::Message(frame));
                })
            }));

        let close_tx = events.clone();
        self.inner.on_close(Box::new(move || {
            let tx = close_tx.clone();
            Box::pin(async move {
                let _ = tx.send(ChannelEvent::Closed);
            })
        }));

        if self.is_open() {
            let _ = events.send(ChannelEvent::Open);
        }
    }

    async fn send(&self, frame: &Frame) -> Result<(), ChannelError> {
        match self.inner.ready_state() {
            RTCDataChannelState::Open => {}
            RTCDataChannelState::Closing | RTCDataChannelState::Closed => {
                return Err(ChannelError::Closed);
            }
            _ => return Err(ChannelError::NotReady),
        }
        let sent = match frame {
            Frame::Text(text) => self.inner.send_text(text.clone()).await,
            Frame::Binary(bytes) => self.inner.send(bytes).await,
        };
        sent.map(|_| ())
            .map_err(|err| ChannelError::Send(err.to_string()))
    }

    async fn close(&self) {
        if let Err(err) = self.inner.close().await {
            debug!(
                target = "tidepool::link",
                label = %self.label,
                error = %err,
                "data channel close reported error"
            );
        }
    }
}
