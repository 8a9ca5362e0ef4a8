pub mod api;
pub mod channel;
pub mod lines;

use url::Url;

use crate::config::PeerOptions;
use crate::error::TransportError;
use crate::protocol::Envelope;

pub use api::SignalingApi;
pub use channel::SignalingTransport;

/// Outbound seam used by the negotiation engine. Delivery is best effort:
/// implementations queue, route or drop, but never block the caller.
pub trait SignalSink: Send + Sync {
    fn send(&self, envelope: Envelope);
}

#[derive(Debug)]
pub enum TransportEvent {
    Message(Envelope),
    Error(TransportError),
    /// Emitted once. `explicit` is false when the socket went away on its own.
    Closed { explicit: bool },
}

/// Local identity bound to the transport by `start`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionIdentity {
    pub id: String,
    pub token: String,
}

#[derive(Debug, Clone)]
pub struct Endpoints {
    http_base: String,
    socket_base: Url,
}

impl Endpoints {
    pub fn from_options(options: &PeerOptions) -> Result<Self, TransportError> {
        let http_base = options.http_base();
        Url::parse(&http_base)
            .map_err(|err| TransportError::Endpoint(format!("{http_base}: {err}")))?;
        let socket = options.socket_base();
        let socket_base = Url::parse(&socket)
            .map_err(|err| TransportError::Endpoint(format!("{socket}: {err}")))?;
        Ok(Self {
            http_base,
            socket_base,
        })
    }

    /// `http(s)://host:port{path}{key}`
    pub fn http_base(&self) -> &str {
        &self.http_base
    }

    pub fn stream_url(&self, session: &SessionIdentity, index: u32) -> String {
        format!(
            "{}/{}/{}/id?i={index}",
            self.http_base, session.id, session.token
        )
    }

    pub fn post_url(&self, session: &SessionIdentity, path: &str) -> String {
        format!(
            "{}/{}/{}/{path}",
            self.http_base, session.id, session.token
        )
    }

    pub fn socket_url(&self, session: &SessionIdentity) -> Url {
        let mut url = self.socket_base.clone();
        url.query_pairs_mut()
            .append_pair("id", &session.id)
            .append_pair("token", &session.token);
        url
    }
}
