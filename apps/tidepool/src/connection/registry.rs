use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;

use super::DataConnection;

/// How many removed connections are remembered as closed.
pub const CLOSED_MEMORY: usize = 256;

/// Connections owned by a peer context, grouped by remote id.
///
/// Removed connections leave a bounded tombstone behind so signals that
/// trail in after a close can be recognised and dropped.
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: Mutex<HashMap<String, Vec<Arc<DataConnection>>>>,
    closed: Mutex<VecDeque<(String, String)>>,
}

impl ConnectionRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add(&self, connection: Arc<DataConnection>) {
        self.closed
            .lock()
            .retain(|(peer, id)| peer != connection.peer() || id != connection.id());
        self.connections
            .lock()
            .entry(connection.peer().to_string())
            .or_default()
            .push(connection);
    }

    pub fn get(&self, peer: &str, id: &str) -> Option<Arc<DataConnection>> {
        self.connections
            .lock()
            .get(peer)?
            .iter()
            .find(|connection| connection.id() == id)
            .cloned()
    }

    pub fn remove(&self, connection: &DataConnection) {
        {
            let mut connections = self.connections.lock();
            if let Some(list) = connections.get_mut(connection.peer()) {
                list.retain(|candidate| candidate.id() != connection.id());
                if list.is_empty() {
                    connections.remove(connection.peer());
                }
            }
        }
        let mut closed = self.closed.lock();
        if closed.len() >= CLOSED_MEMORY {
            closed.pop_front();
        }
        closed.push_back((connection.peer().to_string(), connection.id().to_string()));
    }

    /// True when `id` from `peer` was removed recently and not re-added.
    pub fn was_closed(&self, peer: &str, id: &str) -> bool {
        self.closed
            .lock()
            .iter()
            .any(|(closed_peer, closed_id)| closed_peer == peer && closed_id == id)
    }

    pub fn for_peer(&self, peer: &str) -> Vec<Arc<DataConnection>> {
        self.connections
            .lock()
            .get(peer)
            .cloned()
            .unwrap_or_default()
    }

    pub fn all(&self) -> Vec<Arc<DataConnection>> {
        self.connections
            .lock()
            .values()
            .flat_map(|list| list.iter().cloned())
            .collect()
    }

    pub fn peers(&self) -> Vec<String> {
        self.connections.lock().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.connections.lock().values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
