//! Per-peer outbound queues.
//!
//! Each channel has its own bounded queue. The next message comes from the
//! non-empty channel with the lowest `recently_sent / priority`, so channels
//! share the connection in proportion to their priority and a busy channel
//! cannot starve the others.

use std::collections::VecDeque;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::{ChannelDescriptor, ChannelId};

/// Factor applied to `recently_sent` at every decay tick.
const DECAY_FACTOR: f64 = 0.8;

struct ChannelQueue {
    id: ChannelId,
    priority: u32,
    capacity: usize,
    messages: VecDeque<Bytes>,
    recently_sent: f64,
}

impl ChannelQueue {
    fn ratio(&self) -> f64 {
        self.recently_sent / f64::from(self.priority.max(1))
    }
}

#[derive(Default)]
pub(crate) struct SendQueue {
    channels: Mutex<Vec<ChannelQueue>>,
    notify: Notify,
}

impl SendQueue {
    pub fn new<'a>(descriptors: impl IntoIterator<Item = &'a ChannelDescriptor>) -> Self {
        let queue = Self::default();
        for descriptor in descriptors {
            queue.add_channel(descriptor);
        }
        queue
    }

    pub fn add_channel(&self, descriptor: &ChannelDescriptor) {
        let mut channels = self.channels.lock();
        if channels.iter().any(|c| c.id == descriptor.id) {
            return;
        }
        channels.push(ChannelQueue {
            id: descriptor.id,
            priority: descriptor.priority,
            capacity: descriptor.send_queue_capacity,
            messages: VecDeque::new(),
            recently_sent: 0.0,
        });
    }

    /// Queues a message. Returns `false` if the channel queue is full or the
    /// channel is unknown.
    pub fn push(&self, channel_id: ChannelId, message: Bytes) -> bool {
        let mut channels = self.channels.lock();
        let Some(channel) = channels.iter_mut().find(|c| c.id == channel_id) else {
            return false;
        };
        if channel.messages.len() >= channel.capacity {
            return false;
        }
        channel.messages.push_back(message);
        drop(channels);
        self.notify.notify_one();
        true
    }

    pub fn pop(&self) -> Option<(ChannelId, Bytes)> {
        let mut channels = self.channels.lock();
        let channel = channels
            .iter_mut()
            .filter(|c| !c.messages.is_empty())
            .min_by(|a, b| a.ratio().total_cmp(&b.ratio()))?;
        let message = channel.messages.pop_front()?;
        channel.recently_sent += message.len() as f64;
        Some((channel.id, message))
    }

    /// Waits for the next message to send.
    pub async fn next(&self) -> (ChannelId, Bytes) {
        loop {
            if let Some(next) = self.pop() {
                return next;
            }
            self.notify.notified().await;
        }
    }

    pub fn decay(&self) {
        for channel in self.channels.lock().iter_mut() {
            channel.recently_sent *= DECAY_FACTOR;
        }
    }

    #[cfg(test)]
    pub fn len(&self, channel_id: ChannelId) -> usize {
        self.channels
            .lock()
            .iter()
            .find(|c| c.id == channel_id)
            .map_or(0, |c| c.messages.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(id: ChannelId, priority: u32, capacity: usize) -> ChannelDescriptor {
        ChannelDescriptor {
            id,
            name: "test",
            priority,
            send_queue_capacity: capacity,
            recv_buffer_capacity: 8,
            recv_message_capacity: 1024,
        }
    }

    #[test]
    fn full_channel_queue_drops_new_messages() {
        let queue = SendQueue::new(&[descriptor(1, 1, 2)]);
        assert!(queue.push(1, Bytes::from_static(b"a")));
        assert!(queue.push(1, Bytes::from_static(b"b")));
        assert!(!queue.push(1, Bytes::from_static(b"c")));
        assert!(!queue.push(9, Bytes::from_static(b"x")));
        assert_eq!(queue.len(1), 2);
    }

    #[test]
    fn higher_priority_channel_gets_proportionally_more() {
        let queue = SendQueue::new(&[descriptor(1, 1, 100), descriptor(2, 4, 100)]);
        for _ in 0..50 {
            queue.push(1, Bytes::from_static(&[0; 10]));
            queue.push(2, Bytes::from_static(&[0; 10]));
        }
        let mut sent = [0usize; 3];
        for _ in 0..50 {
            let (id, _) = queue.pop().unwrap();
            sent[id as usize] += 1;
        }
        assert_eq!(sent[1], 10);
        assert_eq!(sent[2], 40);
    }

    #[test]
    fn decay_lets_a_busy_channel_recover() {
        let queue = SendQueue::new(&[descriptor(1, 1, 100), descriptor(2, 1, 100)]);
        queue.push(1, Bytes::from_static(&[0; 100]));
        queue.pop();
        queue.push(2, Bytes::from_static(&[0; 50]));
        queue.pop();
        for _ in 0..10 {
            queue.decay();
        }
        queue.push(2, Bytes::from_static(&[0; 10]));
        assert_eq!(queue.pop().unwrap().0, 2);

        // Without the decay channel 2 would still be preferred here.
        queue.push(1, Bytes::from_static(&[0; 1]));
        queue.push(2, Bytes::from_static(&[0; 1]));
        assert_eq!(queue.pop().unwrap().0, 1);
    }
}
