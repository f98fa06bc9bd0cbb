use std::sync::Arc;
use std::time::Duration;

use meridian_abci::KvStoreApplication;
use meridian_consensus::wal::SearchOptions;
use meridian_consensus::{FileWal, Wal, WalMessage};
use meridian_state::BlockStore;

mod common;

use common::{genesis, start_network, wait_for_height, Storage, TestNode};

const TIMEOUT: Duration = Duration::from_secs(30);

async fn shut_down(node: &TestNode) {
    node.stop();
    node.reactor.stopped().await;
    assert!(node.reactor.take_fatal_error().is_none());
}

#[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn validator_resumes_after_restart() {
    let dir = tempfile::tempdir().unwrap();
    let genesis = genesis(1);
    let storage = Storage::new(dir.path().join("cs.wal"));

    let nodes = start_network(&genesis, vec![storage.clone()]).await;
    let mut events = nodes[0].event_bus.subscribe();
    let before = wait_for_height(&nodes[0], &mut events, 3, TIMEOUT).await;
    shut_down(&nodes[0]).await;
    drop(nodes);

    // The WAL closes every committed height with an end marker.
    let mut wal = FileWal::open(&storage.wal_dir).unwrap();
    let (last_height, _) = wal.read_last_height_msgs().unwrap();
    assert!(last_height >= 3, "last WAL height {last_height}");
    drop(wal);

    let nodes = start_network(&genesis, vec![storage.clone()]).await;
    assert_eq!(nodes[0].replayed_blocks, 0, "the app kept up with the store");
    let mut events = nodes[0].event_bus.subscribe();
    wait_for_height(&nodes[0], &mut events, 5, TIMEOUT).await;

    // History is untouched by the restart.
    assert_eq!(storage.block_store.load_block_meta(3).unwrap().block_id, before);
    shut_down(&nodes[0]).await;
}

#[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn handshake_replays_blocks_into_a_fresh_app() {
    let dir = tempfile::tempdir().unwrap();
    let genesis = genesis(1);
    let storage = Storage::new(dir.path().join("cs.wal"));

    let nodes = start_network(&genesis, vec![storage.clone()]).await;
    let mut events = nodes[0].event_bus.subscribe();
    wait_for_height(&nodes[0], &mut events, 3, TIMEOUT).await;
    shut_down(&nodes[0]).await;
    drop(nodes);

    let store_height = storage.block_store.height();
    let old_app_hash = storage.app.app_hash();

    // The application lost its state, the stores did not.
    let storage = Storage {
        app: Arc::new(KvStoreApplication::new()),
        ..storage
    };
    let node = TestNode::new(1, &genesis, storage.clone()).await;
    assert_eq!(node.replayed_blocks as i64, store_height);
    assert_eq!(storage.app.height(), store_height);
    assert_eq!(storage.app.app_hash(), old_app_hash);

    let mut events = node.event_bus.subscribe();
    p2p::transport::connect_all(&[node.router.clone()]).unwrap();
    node.reactor.start();
    wait_for_height(&node, &mut events, store_height + 1, TIMEOUT).await;
    shut_down(&node).await;
}

#[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn wal_records_own_votes_before_they_are_sent() {
    let dir = tempfile::tempdir().unwrap();
    let genesis = genesis(1);
    let storage = Storage::new(dir.path().join("cs.wal"));

    let nodes = start_network(&genesis, vec![storage.clone()]).await;
    let mut events = nodes[0].event_bus.subscribe();
    wait_for_height(&nodes[0], &mut events, 2, TIMEOUT).await;
    shut_down(&nodes[0]).await;

    let mut wal = FileWal::open(&storage.wal_dir).unwrap();
    let entries = wal
        .search_for_end_height(1, &SearchOptions::default())
        .unwrap()
        .expect("end marker of height 1");
    let mut own_messages = 0;
    for entry in entries {
        match entry.msg {
            WalMessage::EndHeight(height) => {
                assert_eq!(height, 2);
                break;
            }
            WalMessage::MsgInfo(mi) if mi.peer_id.is_empty() => own_messages += 1,
            _ => {}
        }
    }
    // Proposal, block part, prevote and precommit.
    assert!(own_messages >= 4, "only {own_messages} own messages logged");
}

#[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn recovers_from_a_crash_after_any_wal_entry_of_the_first_height() {
    let dir = tempfile::tempdir().unwrap();
    let genesis = genesis(1);
    let storage = Storage::new(dir.path().join("recorded"));

    let nodes = start_network(&genesis, vec![storage.clone()]).await;
    let mut events = nodes[0].event_bus.subscribe();
    wait_for_height(&nodes[0], &mut events, 1, TIMEOUT).await;
    shut_down(&nodes[0]).await;
    drop(nodes);

    let mut wal = FileWal::open(&storage.wal_dir).unwrap();
    let first_height: Vec<WalMessage> = wal
        .iter_from(0)
        .unwrap()
        .map(|entry| entry.unwrap().msg)
        .take_while(|msg| *msg != WalMessage::EndHeight(1))
        .collect();
    drop(wal);
    assert!(
        first_height
            .iter()
            .any(|msg| matches!(msg, WalMessage::MsgInfo(mi) if mi.peer_id.is_empty())),
        "no own messages recorded for height 1"
    );

    // Every prefix is a node that died right after that entry hit the disk,
    // before anything else of height 1 was stored.
    for crash_point in 0..=first_height.len() {
        let crashed = Storage::new(dir.path().join(format!("crash-{crash_point}")));
        let mut wal = FileWal::open(&crashed.wal_dir).unwrap();
        for msg in &first_height[..crash_point] {
            wal.write(msg.clone()).unwrap();
        }
        wal.flush_and_sync().unwrap();
        drop(wal);

        let nodes = start_network(&genesis, vec![crashed.clone()]).await;
        let mut events = nodes[0].event_bus.subscribe();
        wait_for_height(&nodes[0], &mut events, 2, TIMEOUT).await;
        shut_down(&nodes[0]).await;
    }
}
