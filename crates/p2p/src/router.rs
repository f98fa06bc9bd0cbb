use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use meridian_common::NodeId;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use util::task::TaskGroup;

use crate::peers::{Peer, PeerSet};
use crate::queue::SendQueue;
use crate::transport::{Connection, Frame};
use crate::{Channel, ChannelDescriptor, ChannelId, Config, PeerStatus, PeerUpdate};

#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    #[error("channel {0:#04x} is already open")]
    DuplicateChannel(ChannelId),
    #[error("peer {0} is already connected")]
    DuplicatePeer(NodeId),
    #[error("refusing to connect to ourselves")]
    SelfConnection,
    #[error("peer {0} was evicted recently")]
    Evicted(NodeId),
    #[error("router is stopped")]
    Stopped,
}

struct ChannelState {
    descriptor: ChannelDescriptor,
    inbound: mpsc::Sender<(NodeId, Bytes)>,
}

struct Inner {
    node_id: NodeId,
    config: Config,
    channels: RwLock<HashMap<ChannelId, ChannelState>>,
    /// Lock order: `subscribers` before `peers`.
    subscribers: Mutex<Vec<mpsc::UnboundedSender<PeerUpdate>>>,
    peers: RwLock<PeerSet>,
    stopped: AtomicBool,
}

/// Routes messages between the local channels and the connected peers.
#[derive(Clone)]
pub struct Router {
    inner: Arc<Inner>,
}

impl Router {
    pub fn new(node_id: NodeId, config: Config) -> Self {
        Self {
            inner: Arc::new(Inner {
                node_id,
                config,
                channels: Default::default(),
                subscribers: Default::default(),
                peers: Default::default(),
                stopped: AtomicBool::new(false),
            }),
        }
    }

    pub fn node_id(&self) -> &NodeId {
        &self.inner.node_id
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Opens a channel. Each channel id can be opened once.
    pub fn open_channel<M>(&self, descriptor: ChannelDescriptor) -> Result<Channel<M>, RouterError>
    where
        M: prost::Message + Default,
    {
        if self.inner.stopped.load(Ordering::Acquire) {
            return Err(RouterError::Stopped);
        }
        let id = descriptor.id;
        let (tx, rx) = mpsc::channel(descriptor.recv_buffer_capacity.max(1));
        {
            let mut channels = self.inner.channels.write();
            if channels.contains_key(&id) {
                return Err(RouterError::DuplicateChannel(id));
            }
            for (_, peer) in self.inner.peers.read().iter() {
                peer.queue.add_channel(&descriptor);
            }
            tracing::debug!(channel = %descriptor.name, id = %format!("{id:#04x}"), "Opened channel");
            channels.insert(
                id,
                ChannelState {
                    descriptor,
                    inbound: tx,
                },
            );
        }
        Ok(Channel::new(id, self.clone(), rx))
    }

    /// Subscribes to peers going up and down. The subscriber first receives
    /// an `Up` update for every peer that is already connected.
    pub fn subscribe_peer_updates(&self) -> mpsc::UnboundedReceiver<PeerUpdate> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut subscribers = self.inner.subscribers.lock();
        if self.inner.stopped.load(Ordering::Acquire) {
            return rx;
        }
        for node_id in self.inner.peers.read().ids() {
            let _ = tx.send(PeerUpdate {
                node_id,
                status: PeerStatus::Up,
            });
        }
        subscribers.push(tx);
        rx
    }

    pub fn peers(&self) -> Vec<NodeId> {
        self.inner.peers.read().ids()
    }

    pub fn is_connected(&self, node_id: &NodeId) -> bool {
        self.inner.peers.read().contains(node_id)
    }

    /// Takes over an established connection and starts routing its messages.
    pub fn add_peer(&self, connection: Connection) -> Result<(), RouterError> {
        let Connection {
            remote,
            sender,
            receiver,
        } = connection;

        let subscribers = self.inner.subscribers.lock();
        let mut peers = self.inner.peers.write();
        if self.inner.stopped.load(Ordering::Acquire) {
            return Err(RouterError::Stopped);
        }
        if remote == self.inner.node_id {
            return Err(RouterError::SelfConnection);
        }
        if peers.contains(&remote) {
            return Err(RouterError::DuplicatePeer(remote));
        }
        if peers.is_evicted(&remote, self.inner.config.eviction_timeout) {
            return Err(RouterError::Evicted(remote));
        }

        let descriptors: Vec<ChannelDescriptor> = self
            .inner
            .channels
            .read()
            .values()
            .map(|c| c.descriptor.clone())
            .collect();
        let queue = Arc::new(SendQueue::new(&descriptors));
        let tasks = TaskGroup::new(format!("peer {remote}"));
        tasks.spawn(self.clone().send_routine(remote.clone(), queue.clone(), sender));
        tasks.spawn(self.clone().recv_routine(remote.clone(), receiver));

        peers.insert(
            remote.clone(),
            Peer {
                connected_at: Instant::now(),
                queue,
                tasks,
            },
        );
        drop(peers);

        tracing::debug!(peer = %remote, "Peer connected");
        Self::publish(subscribers, PeerUpdate {
            node_id: remote,
            status: PeerStatus::Up,
        });
        Ok(())
    }

    /// Closes the connection to a peer.
    pub fn disconnect(&self, node_id: &NodeId) {
        self.remove_peer(node_id, false);
    }

    /// Disconnects a peer for misbehaving and refuses new connections from
    /// it for the configured eviction timeout.
    pub fn evict(&self, node_id: &NodeId, err: anyhow::Error) {
        if self.remove_peer(node_id, true) {
            tracing::warn!(peer = %node_id, error = %format!("{err:#}"), "Evicted peer");
        }
    }

    /// Disconnects all peers and closes all channels.
    pub fn stop(&self) {
        self.inner.stopped.store(true, Ordering::Release);
        for node_id in self.peers() {
            self.remove_peer(&node_id, false);
        }
        self.inner.channels.write().clear();
        self.inner.subscribers.lock().clear();
    }

    fn remove_peer(&self, node_id: &NodeId, evicted: bool) -> bool {
        let subscribers = self.inner.subscribers.lock();
        let mut peers = self.inner.peers.write();
        if evicted {
            peers.mark_evicted(node_id.clone());
        }
        let Some(peer) = peers.remove(node_id) else {
            return false;
        };
        drop(peers);

        tracing::debug!(peer = %node_id, connected_for = ?peer.connected_at.elapsed(), "Peer disconnected");
        Self::publish(subscribers, PeerUpdate {
            node_id: node_id.clone(),
            status: PeerStatus::Down,
        });
        true
    }

    fn publish(
        mut subscribers: parking_lot::MutexGuard<'_, Vec<mpsc::UnboundedSender<PeerUpdate>>>,
        update: PeerUpdate,
    ) {
        subscribers.retain(|s| s.send(update.clone()).is_ok());
    }

    pub(crate) fn send(&self, channel_id: ChannelId, to: &NodeId, payload: Bytes) -> bool {
        let peers = self.inner.peers.read();
        let Some(peer) = peers.get(to) else {
            return false;
        };
        let queued = peer.queue.push(channel_id, payload);
        if !queued {
            tracing::debug!(peer = %to, channel = %format!("{channel_id:#04x}"), "Send queue full, dropping message");
        }
        queued
    }

    pub(crate) fn broadcast(&self, channel_id: ChannelId, payload: Bytes) {
        for (node_id, peer) in self.inner.peers.read().iter() {
            if !peer.queue.push(channel_id, payload.clone()) {
                tracing::debug!(peer = %node_id, channel = %format!("{channel_id:#04x}"), "Send queue full, dropping message");
            }
        }
    }

    async fn send_routine(self, remote: NodeId, queue: Arc<SendQueue>, sender: mpsc::Sender<Frame>) {
        let mut decay = tokio::time::interval(self.inner.config.stats_decay_interval);
        decay.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                (channel_id, payload) = queue.next() => {
                    if sender.send(Frame { channel_id, payload }).await.is_err() {
                        break;
                    }
                }
                _ = decay.tick() => queue.decay(),
            }
        }
        self.disconnect(&remote);
    }

    async fn recv_routine(self, remote: NodeId, mut receiver: mpsc::Receiver<Frame>) {
        while let Some(Frame {
            channel_id,
            payload,
        }) = receiver.recv().await
        {
            let target = self
                .inner
                .channels
                .read()
                .get(&channel_id)
                .map(|c| (c.inbound.clone(), c.descriptor.recv_message_capacity));
            let Some((inbound, capacity)) = target else {
                self.evict(&remote, anyhow::anyhow!("message on unknown channel {channel_id:#04x}"));
                return;
            };
            if payload.len() > capacity {
                self.evict(
                    &remote,
                    anyhow::anyhow!(
                        "message of {} bytes on channel {channel_id:#04x} exceeds the limit of {capacity}",
                        payload.len()
                    ),
                );
                return;
            }
            if inbound.send((remote.clone(), payload)).await.is_err() {
                tracing::debug!(channel = %format!("{channel_id:#04x}"), "Channel closed, dropping message");
            }
        }
        self.disconnect(&remote);
    }
}
