use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use meridian_common::NodeId;
use util::task::TaskGroup;

use crate::queue::SendQueue;

pub(crate) struct Peer {
    pub connected_at: Instant,
    pub queue: Arc<SendQueue>,
    /// The send and receive routines of the connection.
    pub tasks: TaskGroup,
}

#[derive(Default)]
pub(crate) struct PeerSet {
    connected: HashMap<NodeId, Peer>,
    /// When each evicted peer was evicted.
    evicted: HashMap<NodeId, Instant>,
}

impl PeerSet {
    pub fn get(&self, node_id: &NodeId) -> Option<&Peer> {
        self.connected.get(node_id)
    }

    pub fn contains(&self, node_id: &NodeId) -> bool {
        self.connected.contains_key(node_id)
    }

    pub fn insert(&mut self, node_id: NodeId, peer: Peer) {
        self.connected.insert(node_id, peer);
    }

    /// Removes a peer, cancelling its routines.
    pub fn remove(&mut self, node_id: &NodeId) -> Option<Peer> {
        let peer = self.connected.remove(node_id)?;
        peer.tasks.cancel();
        Some(peer)
    }

    pub fn mark_evicted(&mut self, node_id: NodeId) {
        self.evicted.insert(node_id, Instant::now());
    }

    /// Whether the peer was evicted less than `timeout` ago.
    pub fn is_evicted(&mut self, node_id: &NodeId, timeout: Duration) -> bool {
        self.evicted
            .retain(|_, evicted_at| evicted_at.elapsed() < timeout);
        self.evicted.contains_key(node_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&NodeId, &Peer)> {
        self.connected.iter()
    }

    pub fn ids(&self) -> Vec<NodeId> {
        self.connected.keys().cloned().collect()
    }
}
