//! In-process connections between routers.

use bytes::Bytes;
use meridian_common::NodeId;
use tokio::sync::mpsc;

use crate::{ChannelId, Router, RouterError};

/// One message on the wire: the channel it belongs to and its encoding.
#[derive(Clone, Debug)]
pub struct Frame {
    pub channel_id: ChannelId,
    pub payload: Bytes,
}

/// One side of an established connection. Dropping it closes the
/// connection for the remote side.
#[derive(Debug)]
pub struct Connection {
    pub remote: NodeId,
    pub sender: mpsc::Sender<Frame>,
    pub receiver: mpsc::Receiver<Frame>,
}

/// Two connected ends: the first is `a`'s view of `b`, the second `b`'s view
/// of `a`.
pub fn memory_pair(a: &NodeId, b: &NodeId, buffer: usize) -> (Connection, Connection) {
    let (a_tx, b_rx) = mpsc::channel(buffer);
    let (b_tx, a_rx) = mpsc::channel(buffer);
    (
        Connection {
            remote: b.clone(),
            sender: a_tx,
            receiver: a_rx,
        },
        Connection {
            remote: a.clone(),
            sender: b_tx,
            receiver: b_rx,
        },
    )
}

/// Connects two routers in memory.
pub fn connect(a: &Router, b: &Router) -> Result<(), RouterError> {
    let buffer = a.config().connection_buffer;
    let (a_side, b_side) = memory_pair(a.node_id(), b.node_id(), buffer);
    a.add_peer(a_side)?;
    if let Err(e) = b.add_peer(b_side) {
        a.disconnect(b.node_id());
        return Err(e);
    }
    Ok(())
}

/// Connects every pair of routers.
pub fn connect_all(routers: &[Router]) -> Result<(), RouterError> {
    for (i, a) in routers.iter().enumerate() {
        for b in &routers[i + 1..] {
            connect(a, b)?;
        }
    }
    Ok(())
}
