//! Top-level context: one identity on the signaling service plus every
//! connection made through it.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::{PeerOptions, validate_id, validate_key};
use crate::connection::{
    ConnectOptions, ConnectionContext, ConnectionRegistry, ConnectionSettings, DataConnection,
};
use crate::error::{ErrorKind, NegotiationError, PeerError};
use crate::link::LinkFactory;
use crate::link::rtc::RtcLinkFactory;
use crate::negotiation::{Negotiator, SessionOptions};
use crate::signaling::SignalingRouter;
use crate::transport::{Endpoints, SignalingApi, SignalingTransport, TransportEvent};

#[derive(Debug, Clone)]
pub enum PeerEvent {
    /// The service acknowledged our id.
    Open(String),
    /// A remote peer opened a connection to us.
    Connection(Arc<DataConnection>),
    Error(PeerError),
    Close,
    Disconnected,
}

struct Wiring {
    transport: Arc<SignalingTransport>,
    negotiator: Arc<Negotiator>,
    api: SignalingApi,
    ctx: ConnectionContext,
}

#[derive(Default)]
struct PeerState {
    id: Option<String>,
    last_id: Option<String>,
    router: Option<Arc<SignalingRouter>>,
    disconnected: bool,
    destroyed: bool,
    aborted: bool,
}

pub struct Peer {
    options: PeerOptions,
    wiring: Option<Wiring>,
    registry: Arc<ConnectionRegistry>,
    state: Mutex<PeerState>,
    events_tx: mpsc::UnboundedSender<PeerEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<PeerEvent>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Peer {
    /// Create a peer and start connecting in the background. Configuration
    /// problems surface as a single `PeerEvent::Error` after this returns.
    pub fn new(
        id: Option<String>,
        options: PeerOptions,
        factory: Arc<dyn LinkFactory>,
    ) -> Arc<Self> {
        let options = options.normalized();
        let registry = ConnectionRegistry::new();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let mut precheck = sanity_check(id.as_deref(), &options).err();
        let (wiring, transport_rx) = match wire(&options, factory, &registry) {
            Ok((wiring, rx)) => (Some(wiring), Some(rx)),
            Err(err) => {
                precheck.get_or_insert(err);
                (None, None)
            }
        };

        let peer = Arc::new(Self {
            options,
            wiring,
            registry,
            state: Mutex::new(PeerState::default()),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            task: Mutex::new(None),
        });
        let task = tokio::spawn(run(Arc::downgrade(&peer), id, precheck, transport_rx));
        *peer.task.lock() = Some(task);
        peer
    }

    /// A peer backed by real WebRTC links configured from `options`.
    pub fn with_rtc(id: Option<String>, options: PeerOptions) -> Result<Arc<Self>, NegotiationError> {
        let factory = RtcLinkFactory::new(&options.ice_servers)?;
        Ok(Self::new(id, options, Arc::new(factory)))
    }

    /// Take the event stream. Only the first caller receives it.
    pub fn take_events(&self) -> Option<mpsc::UnboundedReceiver<PeerEvent>> {
        self.events_rx.lock().take()
    }

    pub fn options(&self) -> &PeerOptions {
        &self.options
    }

    /// Our id on the service; cleared by `disconnect`.
    pub fn id(&self) -> Option<String> {
        self.state.lock().id.clone()
    }

    pub fn is_open(&self) -> bool {
        let state = self.state.lock();
        !state.disconnected
            && state
                .router
                .as_ref()
                .is_some_and(|router| router.is_open())
    }

    pub fn is_destroyed(&self) -> bool {
        self.state.lock().destroyed
    }

    pub fn is_disconnected(&self) -> bool {
        self.state.lock().disconnected
    }

    /// Open a data connection to `remote`. Allowed before the service has
    /// acknowledged us; outbound signals queue until then.
    pub async fn connect(
        &self,
        remote: &str,
        options: ConnectOptions,
    ) -> Result<Arc<DataConnection>, PeerError> {
        let refused = {
            let state = self.state.lock();
            state.disconnected || state.destroyed
        };
        let Some(wiring) = self.wiring.as_ref().filter(|_| !refused) else {
            let err = PeerError::new(
                ErrorKind::Disconnected,
                "cannot connect to a new peer after disconnecting from the server",
            );
            warn!(target = "tidepool::peer", remote, "connect refused; disconnected");
            self.emit(PeerEvent::Error(err.clone()));
            return Err(err);
        };

        let link_id = options.link_id.clone();
        let connection = DataConnection::new(remote, options, wiring.ctx.clone());
        self.registry.add(connection.clone());
        info!(
            target = "tidepool::peer",
            remote,
            connection_id = %connection.id(),
            "connecting"
        );
        wiring
            .negotiator
            .start_connection(&connection, SessionOptions {
                originator: true,
                link_id,
                remote_offer: None,
            })
            .await;
        let router = self.state.lock().router.clone();
        if let Some(router) = router {
            router.replay_pending(&connection).await;
        }
        Ok(connection)
    }

    pub fn get_connection(&self, remote: &str, connection_id: &str) -> Option<Arc<DataConnection>> {
        self.registry.get(remote, connection_id)
    }

    pub fn connections(&self, remote: &str) -> Vec<Arc<DataConnection>> {
        self.registry.for_peer(remote)
    }

    pub fn all_connections(&self) -> Vec<Arc<DataConnection>> {
        self.registry.all()
    }

    /// Peers the service knows about. Requires discovery server side.
    pub async fn list_peers(&self) -> Result<Vec<String>, PeerError> {
        match self.wiring.as_ref() {
            Some(wiring) => wiring.api.list_peers().await,
            None => Err(PeerError::new(
                ErrorKind::ServerError,
                "signaling service is not configured",
            )),
        }
    }

    /// Close every connection and leave the service. Idempotent.
    pub async fn destroy(&self) {
        {
            let mut state = self.state.lock();
            if state.destroyed {
                return;
            }
            state.destroyed = true;
        }
        let connections = self.registry.all();
        info!(
            target = "tidepool::peer",
            connections = connections.len(),
            "destroying peer"
        );
        for connection in connections {
            connection.close().await;
        }
        self.emit(PeerEvent::Close);
        self.disconnect();
    }

    /// Leave the signaling service; established connections stay up, but no
    /// new ones can be made. Idempotent.
    pub fn disconnect(&self) {
        {
            let mut state = self.state.lock();
            if state.disconnected {
                return;
            }
            state.disconnected = true;
            state.last_id = state.id.take();
        }
        if let Some(wiring) = self.wiring.as_ref() {
            wiring.transport.close();
        }
        info!(target = "tidepool::peer", "disconnected from signaling service");
        self.emit(PeerEvent::Disconnected);
    }

    /// Fatal: tear everything down and report `err` exactly once.
    async fn abort(&self, err: PeerError) {
        {
            let mut state = self.state.lock();
            if state.aborted {
                debug!(target = "tidepool::peer", error = %err, "already aborted");
                return;
            }
            state.aborted = true;
        }
        error!(target = "tidepool::peer", error = %err, "aborting peer");
        self.destroy().await;
        self.emit(PeerEvent::Error(err));
    }

    fn bind(&self, id: &str) -> Option<Arc<SignalingRouter>> {
        let wiring = self.wiring.as_ref()?;
        let router = Arc::new(SignalingRouter::new(
            id,
            wiring.ctx.clone(),
            self.registry.clone(),
            self.events_tx.clone(),
        ));
        {
            let mut state = self.state.lock();
            if state.disconnected || state.destroyed {
                return None;
            }
            state.id = Some(id.to_string());
            state.router = Some(router.clone());
        }
        wiring.transport.start(id);
        Some(router)
    }

    async fn on_transport_event(&self, router: &SignalingRouter, event: TransportEvent) {
        match event {
            TransportEvent::Message(envelope) => {
                if let Err(err) = router.dispatch(envelope).await {
                    self.abort(err).await;
                }
            }
            TransportEvent::Error(err) => {
                self.abort(PeerError::new(
                    ErrorKind::SocketError,
                    format!("lost connection to server: {err}"),
                ))
                .await;
            }
            TransportEvent::Closed { explicit } => {
                if explicit || self.is_disconnected() {
                    debug!(target = "tidepool::peer", "signaling transport closed");
                } else {
                    self.abort(PeerError::new(
                        ErrorKind::SocketClosed,
                        "underlying socket is already closed",
                    ))
                    .await;
                }
            }
        }
    }

    fn emit(&self, event: PeerEvent) {
        let _ = self.events_tx.send(event);
    }
}

impl Drop for Peer {
    fn drop(&mut self) {
        if let Some(task) = self.task.get_mut().take() {
            task.abort();
        }
        if let Some(wiring) = self.wiring.as_ref() {
            wiring.transport.close();
        }
    }
}

fn sanity_check(id: Option<&str>, options: &PeerOptions) -> Result<(), PeerError> {
    if let Some(id) = id {
        validate_id(id)
            .map_err(|_| PeerError::new(ErrorKind::InvalidId, format!("ID \"{id}\" is invalid")))?;
    }
    validate_key(&options.key).map_err(|_| {
        PeerError::new(
            ErrorKind::InvalidKey,
            format!("API key \"{}\" is invalid", options.key),
        )
    })?;
    if options.secure && options.is_cloud_host() {
        return Err(PeerError::new(
            ErrorKind::SslUnavailable,
            "the cloud server currently does not support HTTPS; use your own server",
        ));
    }
    Ok(())
}

fn wire(
    options: &PeerOptions,
    factory: Arc<dyn LinkFactory>,
    registry: &Arc<ConnectionRegistry>,
) -> Result<(Wiring, mpsc::UnboundedReceiver<TransportEvent>), PeerError> {
    let endpoints = Endpoints::from_options(options)
        .map_err(|err| PeerError::new(ErrorKind::ServerError, err.to_string()))?;
    let (transport, transport_rx) = SignalingTransport::new(endpoints.clone(), options.tuning)
        .map_err(|err| PeerError::new(ErrorKind::ServerError, err.to_string()))?;
    let api = SignalingApi::new(reqwest::Client::new(), endpoints);
    let negotiator = Negotiator::new(factory, transport.clone(), options.browser_hint.clone());
    let ctx = ConnectionContext {
        negotiator: negotiator.clone(),
        registry: Arc::downgrade(registry),
        settings: Arc::new(ConnectionSettings::from(options)),
    };
    Ok((
        Wiring {
            transport,
            negotiator,
            api,
            ctx,
        },
        transport_rx,
    ))
}

/// Resolve an id, start the transport, then feed transport events through
/// the router in arrival order.
async fn run(
    peer: Weak<Peer>,
    requested_id: Option<String>,
    precheck: Option<PeerError>,
    transport_rx: Option<mpsc::UnboundedReceiver<TransportEvent>>,
) {
    let router = {
        let Some(this) = peer.upgrade() else {
            return;
        };
        if let Some(err) = precheck {
            this.abort(err).await;
            return;
        }
        let api = match this.wiring.as_ref() {
            Some(wiring) => wiring.api.clone(),
            None => return,
        };
        let id = match requested_id {
            Some(id) => id,
            None => match api.retrieve_id().await {
                Ok(id) => id,
                Err(err) => {
                    this.abort(err).await;
                    return;
                }
            },
        };
        match this.bind(&id) {
            Some(router) => router,
            None => return,
        }
    };

    let Some(mut events) = transport_rx else {
        return;
    };
    while let Some(event) = events.recv().await {
        let Some(this) = peer.upgrade() else {
            break;
        };
        this.on_transport_event(&router, event).await;
    }
    debug!(target = "tidepool::peer", "peer event loop finished");
}
