//! A small in-process network of validators connected by in-memory routers.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use ed25519_consensus::SigningKey;
use meridian_abci::{Application, KvStoreApplication};
use meridian_common::{
    BlockId,
    Event,
    EventBus,
    GenesisDoc,
    GenesisValidator,
    MockPrivValidator,
    NodeId,
    PublicKey,
};
use meridian_consensus::{Config, ConsensusState, FileWal, Handshaker, Reactor, TimeoutValues};
use meridian_state::{BlockExecutor, BlockStore, EmptyEvidencePool, EmptyMempool, MemoryBlockStore, MemoryStore, State, Store};
use p2p::Router;
use tokio::sync::broadcast;

pub const CHAIN_ID: &str = "meridian-test";

pub fn signing_key(seed: u8) -> SigningKey {
    SigningKey::from([seed; 32])
}

pub fn genesis(validators: u8) -> GenesisDoc {
    let validators = (1..=validators)
        .map(|seed| GenesisValidator {
            address: Vec::new(),
            pub_key: PublicKey::from(signing_key(seed).verification_key()),
            power: 10,
            name: format!("validator-{seed}"),
        })
        .collect();
    let mut doc = GenesisDoc {
        genesis_time: SystemTime::now(),
        chain_id: CHAIN_ID.into(),
        initial_height: 1,
        consensus_params: Default::default(),
        validators,
        app_hash: Vec::new(),
        app_state: serde_json::Value::Null,
    };
    doc.validate_and_complete().expect("test genesis is valid");
    doc
}

/// Short timeouts so that a height takes milliseconds.
pub fn config(wal_dir: &Path) -> Config {
    Config::default()
        .with_wal_path(wal_dir)
        .with_timeout_values(TimeoutValues {
            propose: Duration::from_millis(800),
            propose_delta: Duration::from_millis(200),
            vote: Duration::from_millis(200),
            vote_delta: Duration::from_millis(100),
            commit: Duration::from_millis(50),
        })
        .with_skip_timeout_commit(true)
        .with_peer_gossip(Duration::from_millis(10), Duration::from_millis(200))
        .with_wal_flush_interval(Duration::from_millis(100))
}

/// What a node keeps across restarts.
#[derive(Clone)]
pub struct Storage {
    pub state_store: MemoryStore,
    pub block_store: MemoryBlockStore,
    pub app: Arc<KvStoreApplication>,
    pub wal_dir: PathBuf,
}

impl Storage {
    pub fn new(wal_dir: PathBuf) -> Self {
        Self {
            state_store: MemoryStore::new(),
            block_store: MemoryBlockStore::new(),
            app: Arc::new(KvStoreApplication::new()),
            wal_dir,
        }
    }
}

pub struct TestNode {
    pub id: NodeId,
    pub router: Router,
    pub reactor: Reactor,
    pub event_bus: EventBus,
    pub storage: Storage,
    /// Chain state after the handshake.
    pub state: State,
    /// Number of blocks the handshake replayed into the application.
    pub replayed_blocks: usize,
}

impl TestNode {
    /// Runs the handshake on `storage` and wires a reactor on a fresh
    /// router. The reactor is not started yet.
    pub async fn new(seed: u8, genesis: &GenesisDoc, storage: Storage) -> Self {
        Self::build(seed, genesis, storage, false).await
    }

    /// Like [`TestNode::new`], with consensus held back until
    /// `switch_to_consensus`.
    pub async fn waiting_for_sync(seed: u8, genesis: &GenesisDoc, storage: Storage) -> Self {
        Self::build(seed, genesis, storage, true).await
    }

    async fn build(seed: u8, genesis: &GenesisDoc, storage: Storage, wait_sync: bool) -> Self {
        let id = NodeId::new(format!("node-{seed}"));
        let event_bus = EventBus::new();
        let state_store: Arc<dyn Store> = Arc::new(storage.state_store.clone());
        let block_store: Arc<dyn BlockStore> = Arc::new(storage.block_store.clone());
        let app: Arc<dyn Application> = storage.app.clone();

        let initial_state = match state_store.load() {
            Some(state) => state,
            None => State::from_genesis(genesis).expect("state from genesis"),
        };
        let mut handshaker = Handshaker::new(
            state_store.clone(),
            initial_state.clone(),
            block_store.clone(),
            event_bus.clone(),
            genesis.clone(),
        );
        handshaker.handshake(app.clone()).await.expect("handshake");
        let state = state_store.load().unwrap_or(initial_state);

        let block_exec = BlockExecutor::new(
            state_store,
            block_store.clone(),
            app,
            Arc::new(EmptyMempool::default()),
            Arc::new(EmptyEvidencePool),
        )
        .with_event_bus(event_bus.clone());
        let wal = FileWal::open(&storage.wal_dir).expect("open WAL");
        let cs = ConsensusState::new(
            config(&storage.wal_dir),
            state.clone(),
            Arc::new(block_exec),
            block_store.clone(),
            Arc::new(EmptyEvidencePool),
            Box::new(wal),
            event_bus.clone(),
        )
        .expect("consensus state")
        .with_priv_validator(Arc::new(MockPrivValidator::new(signing_key(seed))));

        let router = Router::new(id.clone(), p2p::Config::default());
        let reactor = Reactor::new(cs, &router, block_store, event_bus.clone(), wait_sync).expect("open channels");
        Self {
            id,
            router,
            reactor,
            event_bus,
            storage,
            state,
            replayed_blocks: handshaker.n_blocks(),
        }
    }

    pub fn stop(&self) {
        self.reactor.stop();
        self.router.stop();
    }
}

/// `validators` nodes of `genesis`, fully connected and started.
pub async fn start_network(genesis: &GenesisDoc, storages: Vec<Storage>) -> Vec<TestNode> {
    let mut nodes = Vec::new();
    for (i, storage) in storages.into_iter().enumerate() {
        nodes.push(TestNode::new(i as u8 + 1, genesis, storage).await);
    }
    let routers: Vec<_> = nodes.iter().map(|node| node.router.clone()).collect();
    p2p::transport::connect_all(&routers).expect("connect routers");
    for node in &nodes {
        node.reactor.start();
    }
    nodes
}

/// Waits until `node` committed `height`, returning the committed block id.
pub async fn wait_for_height(
    node: &TestNode,
    events: &mut broadcast::Receiver<Event>,
    height: i64,
    timeout: Duration,
) -> BlockId {
    tokio::time::timeout(timeout, async {
        while node.storage.block_store.height() < height {
            match events.recv().await {
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => panic!("event bus closed"),
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("{} did not reach height {height} within {timeout:?}", node.id));

    node.storage
        .block_store
        .load_block_meta(height)
        .expect("meta of a committed height")
        .block_id
}
