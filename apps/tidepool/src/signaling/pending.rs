use std::collections::{HashMap, VecDeque};

use tracing::warn;

use crate::protocol::Envelope;

/// Oldest entries beyond this are discarded for a single connection id.
pub const MAX_PENDING_PER_SESSION: usize = 256;

/// Envelopes that arrived before the connection they address existed.
/// Each connection id keeps its own arrival-ordered queue.
#[derive(Debug, Default)]
pub struct PendingMessageStore {
    sessions: HashMap<String, VecDeque<Envelope>>,
}

impl PendingMessageStore {
    pub fn store(&mut self, connection_id: &str, envelope: Envelope) {
        let queue = self.sessions.entry(connection_id.to_string()).or_default();
        if queue.len() >= MAX_PENDING_PER_SESSION {
            if let Some(dropped) = queue.pop_front() {
                warn!(
                    target = "tidepool::signaling",
                    connection_id,
                    kind = dropped.type_name(),
                    "pending queue full; dropping oldest message"
                );
            }
        }
        queue.push_back(envelope);
    }

    /// Remove and return every message for `connection_id`, oldest first.
    pub fn take(&mut self, connection_id: &str) -> Vec<Envelope> {
        self.sessions
            .remove(connection_id)
            .map(Vec::from)
            .unwrap_or_default()
    }

    pub fn len(&self, connection_id: &str) -> usize {
        self.sessions.get(connection_id).map_or(0, VecDeque::len)
    }

    pub fn total(&self) -> usize {
        self.sessions.values().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Forget everything `remote` sent; returns how many messages went.
    pub fn discard_from(&mut self, remote: &str) -> usize {
        let mut discarded = 0;
        self.sessions.retain(|_, queue| {
            let before = queue.len();
            queue.retain(|envelope| envelope.src.as_deref() != Some(remote));
            discarded += before - queue.len();
            !queue.is_empty()
        });
        discarded
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{CandidatePayload, IceCandidate, LinkKind, Signal};

    fn candidate(from: &str, connection_id: &str, n: u16) -> Envelope {
        Envelope::new(Signal::Candidate(CandidatePayload {
            connection_id: connection_id.into(),
            kind: LinkKind::Data,
            candidate: IceCandidate {
                candidate: format!("candidate:{n}"),
                sdp_mid: None,
                sdp_mline_index: Some(n),
            },
        }))
        .with_src(from)
    }

    #[test]
    fn take_returns_arrival_order_once() {
        let mut store = PendingMessageStore::default();
        store.store("dc_1", candidate("alice", "dc_1", 1));
        store.store("dc_2", candidate("alice", "dc_2", 9));
        store.store("dc_1", candidate("alice", "dc_1", 2));

        let taken = store.take("dc_1");
        assert_eq!(taken, vec![candidate("alice", "dc_1", 1), candidate("alice", "dc_1", 2)]);
        assert!(store.take("dc_1").is_empty());
        assert_eq!(store.len("dc_2"), 1);
    }

    #[test]
    fn discard_from_only_touches_that_remote() {
        let mut store = PendingMessageStore::default();
        store.store("dc_1", candidate("alice", "dc_1", 1));
        store.store("dc_1", candidate("bob", "dc_1", 2));
        store.store("dc_3", candidate("alice", "dc_3", 3));

        assert_eq!(store.discard_from("alice"), 2);
        assert_eq!(store.take("dc_1"), vec![candidate("bob", "dc_1", 2)]);
        assert!(store.is_empty());
    }

    #[test]
    fn overflow_drops_oldest() {
        let mut store = PendingMessageStore::default();
        for n in 0..(MAX_PENDING_PER_SESSION as u16 + 2) {
            store.store("dc_1", candidate("alice", "dc_1", n));
        }
        let taken = store.take("dc_1");
        assert_eq!(taken.len(), MAX_PENDING_PER_SESSION);
        assert_eq!(taken[0], candidate("alice", "dc_1", 2));
    }
}
