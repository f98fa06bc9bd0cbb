use std::time::Duration;

use meridian_common::NodeId;
use p2p_proto::consensus::{message, EndHeight, HasVote, Message};
use tokio::sync::mpsc;

use crate::transport::{connect, connect_all};
use crate::*;

const TIMEOUT: Duration = Duration::from_secs(5);

fn descriptor(id: ChannelId) -> ChannelDescriptor {
    ChannelDescriptor {
        id,
        name: "test",
        priority: 1,
        send_queue_capacity: 16,
        recv_buffer_capacity: 16,
        recv_message_capacity: 1024,
    }
}

fn router(name: &str) -> Router {
    Router::new(NodeId::from(name), Config::default())
}

fn has_vote(index: i32) -> Message {
    Message {
        sum: Some(message::Sum::HasVote(HasVote {
            height: 1,
            round: 0,
            r#type: 1,
            index,
        })),
    }
}

async fn next_update(updates: &mut mpsc::UnboundedReceiver<PeerUpdate>) -> PeerUpdate {
    tokio::time::timeout(TIMEOUT, updates.recv())
        .await
        .expect("peer update in time")
        .expect("router is running")
}

fn down(node: &str) -> PeerUpdate {
    PeerUpdate {
        node_id: NodeId::from(node),
        status: PeerStatus::Down,
    }
}

fn up(node: &str) -> PeerUpdate {
    PeerUpdate {
        node_id: NodeId::from(node),
        status: PeerStatus::Up,
    }
}

#[test_log::test(tokio::test)]
async fn messages_reach_the_addressed_peer() {
    let (a, b) = (router("a"), router("b"));
    let a_channel = a.open_channel::<Message>(descriptor(0x20)).unwrap();
    let mut b_channel = b.open_channel::<Message>(descriptor(0x20)).unwrap();
    connect(&a, &b).unwrap();

    assert!(a_channel.sender().send(&NodeId::from("b"), &has_vote(3)));
    assert!(!a_channel.sender().send(&NodeId::from("nobody"), &has_vote(4)));

    let envelope = tokio::time::timeout(TIMEOUT, b_channel.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(envelope.from, NodeId::from("a"));
    assert_eq!(envelope.channel_id, 0x20);
    assert_eq!(envelope.message, has_vote(3));
}

#[test_log::test(tokio::test)]
async fn broadcast_reaches_every_peer() {
    let routers = [router("a"), router("b"), router("c")];
    let mut channels = routers
        .iter()
        .map(|r| r.open_channel::<Message>(descriptor(0x22)).unwrap())
        .collect::<Vec<_>>();
    connect_all(&routers).unwrap();

    channels[0].sender().broadcast(&has_vote(1));
    for channel in &mut channels[1..] {
        let envelope = tokio::time::timeout(TIMEOUT, channel.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(envelope.from, NodeId::from("a"));
        assert_eq!(envelope.message, has_vote(1));
    }
}

#[test]
fn channel_ids_are_unique() {
    let a = router("a");
    let _channel = a.open_channel::<Message>(descriptor(0x21)).unwrap();
    assert!(matches!(
        a.open_channel::<Message>(descriptor(0x21)),
        Err(RouterError::DuplicateChannel(0x21))
    ));
}

#[test_log::test(tokio::test)]
async fn connections_are_validated() {
    let (a, b) = (router("a"), router("b"));
    connect(&a, &b).unwrap();
    assert!(matches!(connect(&a, &b), Err(RouterError::DuplicatePeer(_))));
    assert!(matches!(connect(&a, &a), Err(RouterError::SelfConnection)));
}

#[test_log::test(tokio::test)]
async fn late_subscribers_learn_about_connected_peers() {
    let (a, b) = (router("a"), router("b"));
    connect(&a, &b).unwrap();

    let mut a_updates = a.subscribe_peer_updates();
    let mut b_updates = b.subscribe_peer_updates();
    assert_eq!(next_update(&mut a_updates).await, up("b"));
    assert_eq!(next_update(&mut b_updates).await, up("a"));

    a.disconnect(&NodeId::from("b"));
    assert_eq!(next_update(&mut a_updates).await, down("b"));
    // The remote side notices the closed connection.
    assert_eq!(next_update(&mut b_updates).await, down("a"));
    assert!(b.peers().is_empty());
}

#[test_log::test(tokio::test)]
async fn oversized_messages_get_the_sender_evicted() {
    let (a, b) = (router("a"), router("b"));
    let a_channel = a.open_channel::<Message>(descriptor(0x20)).unwrap();
    let _b_channel = b
        .open_channel::<Message>(ChannelDescriptor {
            recv_message_capacity: 4,
            ..descriptor(0x20)
        })
        .unwrap();
    let mut b_updates = b.subscribe_peer_updates();
    connect(&a, &b).unwrap();
    assert_eq!(next_update(&mut b_updates).await, up("a"));

    a_channel.sender().send(&NodeId::from("b"), &has_vote(100));
    assert_eq!(next_update(&mut b_updates).await, down("a"));

    // Evicted peers cannot reconnect right away.
    assert!(matches!(connect(&a, &b), Err(RouterError::Evicted(_))));
}

#[test_log::test(tokio::test)]
async fn undecodable_messages_get_the_sender_evicted() {
    let (a, b) = (router("a"), router("b"));
    let a_channel = a.open_channel::<EndHeight>(descriptor(0x20)).unwrap();
    let mut b_channel = b.open_channel::<Message>(descriptor(0x20)).unwrap();
    let mut a_updates = a.subscribe_peer_updates();
    connect(&a, &b).unwrap();
    assert_eq!(next_update(&mut a_updates).await, up("b"));

    a_channel
        .sender()
        .send(&NodeId::from("b"), &EndHeight { height: 5 });

    // The receiver skips the message and evicts the sender, which then sees
    // its connection closed.
    let received = tokio::time::timeout(Duration::from_millis(200), b_channel.recv()).await;
    assert!(received.is_err());
    assert_eq!(next_update(&mut a_updates).await, down("b"));
    assert!(!b.is_connected(&NodeId::from("a")));
}

#[test_log::test(tokio::test)]
async fn messages_on_unknown_channels_get_the_sender_evicted() {
    let (a, b) = (router("a"), router("b"));
    let a_channel = a.open_channel::<Message>(descriptor(0x30)).unwrap();
    let mut b_updates = b.subscribe_peer_updates();
    connect(&a, &b).unwrap();
    assert_eq!(next_update(&mut b_updates).await, up("a"));

    a_channel.sender().send(&NodeId::from("b"), &has_vote(0));
    assert_eq!(next_update(&mut b_updates).await, down("a"));
}

#[test_log::test(tokio::test)]
async fn stopping_the_router_closes_channels() {
    let (a, b) = (router("a"), router("b"));
    let mut a_channel = a.open_channel::<Message>(descriptor(0x20)).unwrap();
    let mut b_updates = b.subscribe_peer_updates();
    connect(&a, &b).unwrap();
    assert_eq!(next_update(&mut b_updates).await, up("a"));

    a.stop();
    assert!(a_channel.recv().await.is_none());
    assert_eq!(next_update(&mut b_updates).await, down("a"));
    assert!(matches!(
        a.open_channel::<Message>(descriptor(0x21)),
        Err(RouterError::Stopped)
    ));
}
