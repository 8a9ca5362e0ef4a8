//! Shared doubles for unit tests.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::connection::{
    ConnectOptions, ConnectionContext, ConnectionRegistry, ConnectionSettings, DataConnection,
};
use crate::negotiation::Negotiator;
use crate::protocol::Envelope;
use crate::transport::SignalSink;

/// Captures outbound envelopes instead of sending them.
#[derive(Default)]
pub struct RecordingSink {
    sent: Mutex<Vec<Envelope>>,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn take(&self) -> Vec<Envelope> {
        std::mem::take(&mut *self.sent.lock())
    }
}

impl SignalSink for RecordingSink {
    fn send(&self, envelope: Envelope) {
        self.sent.lock().push(envelope);
    }
}

pub fn context_for(negotiator: &Arc<Negotiator>) -> ConnectionContext {
    ConnectionContext {
        negotiator: negotiator.clone(),
        registry: Weak::new(),
        settings: Arc::new(ConnectionSettings::default()),
    }
}

pub fn context_with(
    negotiator: &Arc<Negotiator>,
    registry: &Arc<ConnectionRegistry>,
) -> ConnectionContext {
    ConnectionContext {
        registry: Arc::downgrade(registry),
        ..context_for(negotiator)
    }
}

pub fn connection_for(
    negotiator: &Arc<Negotiator>,
    peer: &str,
    options: ConnectOptions,
) -> Arc<DataConnection> {
    DataConnection::new(peer, options, context_for(negotiator))
}

/// Let spawned listeners and channel tasks catch up.
pub async fn settle() {
    for _ in 0..32 {
        tokio::task::yield_now().await;
    }
}
