use std::fmt;

use thiserror::Error;

/// Stable reason codes surfaced to applications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidId,
    InvalidKey,
    UnavailableId,
    SslUnavailable,
    ServerError,
    SocketError,
    SocketClosed,
    PeerUnavailable,
    Disconnected,
}

impl ErrorKind {
    pub fn code(self) -> &'static str {
        match self {
            ErrorKind::InvalidId => "invalid-id",
            ErrorKind::InvalidKey => "invalid-key",
            ErrorKind::UnavailableId => "unavailable-id",
            ErrorKind::SslUnavailable => "ssl-unavailable",
            ErrorKind::ServerError => "server-error",
            ErrorKind::SocketError => "socket-error",
            ErrorKind::SocketClosed => "socket-closed",
            ErrorKind::PeerUnavailable => "peer-unavailable",
            ErrorKind::Disconnected => "disconnected",
        }
    }

    /// Fatal kinds tear down the whole peer context.
    pub fn is_fatal(self) -> bool {
        !matches!(self, ErrorKind::PeerUnavailable | ErrorKind::Disconnected)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}: {message}")]
pub struct PeerError {
    pub kind: ErrorKind,
    pub message: String,
}

impl PeerError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.kind.is_fatal()
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("websocket error: {0}")]
    Socket(String),
    #[error("invalid endpoint: {0}")]
    Endpoint(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NegotiationError {
    #[error("failed to create peer link: {0}")]
    CreateLink(String),
    #[error("failed to create offer: {0}")]
    CreateOffer(String),
    #[error("failed to create answer: {0}")]
    CreateAnswer(String),
    #[error("failed to set local description: {0}")]
    SetLocalDescription(String),
    #[error("failed to set remote description: {0}")]
    SetRemoteDescription(String),
    #[error("failed to add ice candidate: {0}")]
    AddCandidate(String),
    #[error("failed to create data channel: {0}")]
    DataChannel(String),
    #[error("connection has no peer link")]
    NoLink,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChannelError {
    #[error("data channel not ready")]
    NotReady,
    #[error("data channel send failed: {0}")]
    Send(String),
    /// Closed locally or by the remote; the channel will not reopen.
    #[error("data channel closed")]
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectionError {
    #[error("connection is not open; wait for the open event before sending")]
    NotOpen,
    #[error("failed to encode message: {0}")]
    Encode(String),
    #[error(transparent)]
    Negotiation(#[from] NegotiationError),
    #[error(transparent)]
    Chunk(#[from] crate::connection::chunk::ChunkError),
}

impl From<serde_json::Error> for ConnectionError {
    fn from(err: serde_json::Error) -> Self {
        ConnectionError::Encode(err.to_string())
    }
}
