//! Key generation, genesis and wiring of the validators.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use anyhow::Context;
use meridian_abci::{Application, KvStoreApplication};
use meridian_common::{EventBus, FilePrivValidator, GenesisDoc, GenesisValidator, NodeId, PrivValidator};
use meridian_consensus::{ConsensusState, FileWal, Handshaker, Reactor};
use meridian_state::{
    BlockExecutor,
    BlockStore,
    MemoryBlockStore,
    MemoryEvidencePool,
    MemoryStore,
    Mempool,
    State,
    Store,
    TxMempool,
};
use p2p::Router;

use crate::config::Config;

pub struct Validator {
    pub id: NodeId,
    pub router: Router,
    pub reactor: Reactor,
    pub event_bus: EventBus,
    pub block_store: Arc<dyn BlockStore>,
    pub mempool: Arc<dyn Mempool>,
}

fn node_dir(home: &Path, index: usize) -> PathBuf {
    home.join(format!("node{index}"))
}

/// Generates a key per validator under `home` and a genesis giving them
/// equal power, written to `home/genesis.json`.
pub fn init(home: &Path, config: &Config) -> anyhow::Result<(GenesisDoc, Vec<Arc<FilePrivValidator>>)> {
    let genesis_path = home.join("genesis.json");
    anyhow::ensure!(
        !genesis_path.exists(),
        "{} already holds a network, pick an empty home directory",
        home.display()
    );

    let mut signers = Vec::with_capacity(config.validators);
    let mut validators = Vec::with_capacity(config.validators);
    for index in 0..config.validators {
        let dir = node_dir(home, index);
        std::fs::create_dir_all(&dir).with_context(|| format!("Creating {}", dir.display()))?;
        let signer = FilePrivValidator::load_or_generate(
            &dir.join("priv_validator_key.json"),
            &dir.join("priv_validator_state.json"),
        )
        .with_context(|| format!("Loading validator key of node {index}"))?;
        validators.push(GenesisValidator {
            address: Vec::new(),
            pub_key: signer.pub_key(),
            power: 10,
            name: format!("node{index}"),
        });
        signers.push(Arc::new(signer));
    }

    let mut genesis = GenesisDoc {
        genesis_time: SystemTime::now(),
        chain_id: config.chain_id.clone(),
        initial_height: 1,
        consensus_params: Default::default(),
        validators,
        app_hash: Vec::new(),
        app_state: Default::default(),
    };
    genesis.validate_and_complete().context("Validating genesis")?;
    genesis
        .save(&genesis_path)
        .with_context(|| format!("Writing {}", genesis_path.display()))?;
    tracing::info!(path = %genesis_path.display(), validators = config.validators, chain_id = %genesis.chain_id, "Wrote genesis");
    Ok((genesis, signers))
}

/// Brings up one validator: handshake with a fresh application, then a
/// reactor on its own router. The reactor is not started.
pub async fn validator(
    index: usize,
    home: &Path,
    config: &Config,
    genesis: &GenesisDoc,
    signer: Arc<FilePrivValidator>,
) -> anyhow::Result<Validator> {
    let id = NodeId::new(format!("node{index}"));
    let event_bus = EventBus::new();
    let state_store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let block_store: Arc<dyn BlockStore> = Arc::new(MemoryBlockStore::new());
    let app: Arc<dyn Application> = Arc::new(KvStoreApplication::new());

    let initial_state = State::from_genesis(genesis).context("State from genesis")?;
    let mut handshaker = Handshaker::new(
        state_store.clone(),
        initial_state.clone(),
        block_store.clone(),
        event_bus.clone(),
        genesis.clone(),
    );
    handshaker
        .handshake(app.clone())
        .await
        .with_context(|| format!("Handshake of {id}"))?;
    let state = state_store.load().unwrap_or(initial_state);

    let mempool: Arc<dyn Mempool> = Arc::new(TxMempool::new(app.clone()));
    let evidence_pool = Arc::new(MemoryEvidencePool::new(state_store.clone(), block_store.clone()));
    let block_exec = BlockExecutor::new(
        state_store,
        block_store.clone(),
        app,
        mempool.clone(),
        evidence_pool.clone(),
    )
    .with_event_bus(event_bus.clone());

    let wal_dir = node_dir(home, index).join("data").join("cs.wal");
    let wal = FileWal::open(&wal_dir).with_context(|| format!("Opening WAL in {}", wal_dir.display()))?;
    let cs = ConsensusState::new(
        config.consensus.clone().with_wal_path(wal_dir),
        state,
        Arc::new(block_exec),
        block_store.clone(),
        evidence_pool,
        Box::new(wal),
        event_bus.clone(),
    )
    .with_context(|| format!("Consensus state of {id}"))?
    .with_priv_validator(signer);

    let router = Router::new(id.clone(), p2p::Config::default());
    let reactor = Reactor::new(cs, &router, block_store.clone(), event_bus.clone(), false)
        .context("Opening consensus channels")?;

    Ok(Validator {
        id,
        router,
        reactor,
        event_bus,
        block_store,
        mempool,
    })
}
