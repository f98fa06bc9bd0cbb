#![deny(rust_2018_idioms)]
//! Typed, prioritised message channels between already connected peers.
//!
//! A [`Router`] owns the connections to peers. Reactors open one [`Channel`]
//! per [`ChannelDescriptor`] and exchange protobuf messages over it; the
//! router multiplexes all channels onto each peer connection, scheduling
//! outbound messages by channel priority. Dialing and peer discovery are
//! outside of this crate: connections are handed to the router ready made,
//! see [`transport`].

use std::time::Duration;

use meridian_common::NodeId;

mod channel;
mod peers;
mod queue;
mod router;
#[cfg(test)]
mod tests;
pub mod transport;

pub use channel::{Channel, ChannelReceiver, ChannelSender};
pub use router::{Router, RouterError};

pub type ChannelId = u8;

/// Static description of a channel, shared by both ends of a connection.
#[derive(Clone, Debug)]
pub struct ChannelDescriptor {
    pub id: ChannelId,
    pub name: &'static str,
    /// Relative share of the outbound bandwidth when several channels have
    /// messages queued.
    pub priority: u32,
    /// Outbound messages queued per peer before new ones are dropped.
    pub send_queue_capacity: usize,
    /// Inbound messages buffered before the router stops reading.
    pub recv_buffer_capacity: usize,
    /// Largest accepted encoded message. Peers sending more are evicted.
    pub recv_message_capacity: usize,
}

/// A message received on a channel.
#[derive(Clone, Debug)]
pub struct Envelope<M> {
    pub from: NodeId,
    pub channel_id: ChannelId,
    pub message: M,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PeerStatus {
    Up,
    Down,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerUpdate {
    pub node_id: NodeId,
    pub status: PeerStatus,
}

/// A protocol violation by a peer, reported by a reactor. The router
/// disconnects the peer.
#[derive(Debug)]
pub struct PeerError {
    pub node_id: NodeId,
    pub err: anyhow::Error,
}

/// Router limits.
#[derive(Debug, Clone)]
pub struct Config {
    /// How long to prevent evicted peers from reconnecting.
    pub eviction_timeout: Duration,
    /// How often the per-channel send statistics decay.
    pub stats_decay_interval: Duration,
    /// Frames buffered in each direction of an in-memory connection.
    pub connection_buffer: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            eviction_timeout: Duration::from_secs(15 * 60),
            stats_decay_interval: Duration::from_secs(2),
            connection_buffer: 1024,
        }
    }
}
