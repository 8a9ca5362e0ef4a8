pub mod config;
pub mod connection;
pub mod error;
pub mod link;
pub mod negotiation;
pub mod peer;
pub mod protocol;
pub mod signaling;
pub mod telemetry;
pub mod transport;

#[cfg(test)]
mod testing;

use rand::Rng;
use rand::distributions::Alphanumeric;

pub use config::PeerOptions;
pub use connection::{ConnectOptions, ConnectionEvent, DataConnection, Inbound, Outbound};
pub use error::{ErrorKind, PeerError};
pub use peer::{Peer, PeerEvent};

/// Short lowercase token used for connection, link and session ids.
pub(crate) fn random_token() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(11)
        .map(|byte| char::from(byte).to_ascii_lowercase())
        .collect()
}
