use std::marker::PhantomData;

use bytes::Bytes;
use meridian_common::NodeId;
use tokio::sync::mpsc;

use crate::{ChannelId, Envelope, PeerError, Router};

/// A bidirectional, typed channel opened on a [`Router`].
pub struct Channel<M> {
    sender: ChannelSender<M>,
    receiver: ChannelReceiver<M>,
}

impl<M> Channel<M>
where
    M: prost::Message + Default,
{
    pub(crate) fn new(id: ChannelId, router: Router, inbound: mpsc::Receiver<(NodeId, Bytes)>) -> Self {
        Self {
            sender: ChannelSender {
                id,
                router: router.clone(),
                _message: PhantomData,
            },
            receiver: ChannelReceiver {
                id,
                router,
                inbound,
                _message: PhantomData,
            },
        }
    }

    pub fn id(&self) -> ChannelId {
        self.sender.id
    }

    pub fn sender(&self) -> ChannelSender<M> {
        self.sender.clone()
    }

    pub fn split(self) -> (ChannelSender<M>, ChannelReceiver<M>) {
        (self.sender, self.receiver)
    }

    pub async fn recv(&mut self) -> Option<Envelope<M>> {
        self.receiver.recv().await
    }
}

/// The sending half of a [`Channel`]. Cheap to clone.
pub struct ChannelSender<M> {
    id: ChannelId,
    router: Router,
    _message: PhantomData<fn(M)>,
}

impl<M> Clone for ChannelSender<M> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            router: self.router.clone(),
            _message: PhantomData,
        }
    }
}

impl<M> ChannelSender<M>
where
    M: prost::Message,
{
    pub fn id(&self) -> ChannelId {
        self.id
    }

    /// Queues a message for one peer. Returns `false` if the peer is not
    /// connected or its queue for this channel is full, in which case the
    /// message is dropped.
    pub fn send(&self, to: &NodeId, message: &M) -> bool {
        let payload = Bytes::from(message.encode_to_vec());
        self.router.send(self.id, to, payload)
    }

    /// Queues a message for every connected peer.
    pub fn broadcast(&self, message: &M) {
        let payload = Bytes::from(message.encode_to_vec());
        self.router.broadcast(self.id, payload);
    }

    /// Reports a misbehaving peer, which gets disconnected.
    pub fn send_error(&self, error: PeerError) {
        self.router.evict(&error.node_id, error.err);
    }
}

/// The receiving half of a [`Channel`].
pub struct ChannelReceiver<M> {
    id: ChannelId,
    router: Router,
    inbound: mpsc::Receiver<(NodeId, Bytes)>,
    _message: PhantomData<fn() -> M>,
}

impl<M> ChannelReceiver<M>
where
    M: prost::Message + Default,
{
    /// The next message from any peer. Peers sending undecodable messages
    /// are evicted and their messages skipped. Returns `None` once the
    /// router is stopped.
    pub async fn recv(&mut self) -> Option<Envelope<M>> {
        loop {
            let (from, payload) = self.inbound.recv().await?;
            match M::decode(payload) {
                Ok(message) => {
                    return Some(Envelope {
                        from,
                        channel_id: self.id,
                        message,
                    })
                }
                Err(e) => {
                    self.router.evict(
                        &from,
                        anyhow::Error::new(e).context(format!("decoding message on channel {:#04x}", self.id)),
                    );
                }
            }
        }
    }
}
