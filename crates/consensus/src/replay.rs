//! Crash recovery.
//!
//! Two independent things are recovered on startup. The [`Handshaker`] brings
//! the application, the block store and the state store back to the same
//! height, replaying committed blocks into the application as needed. Then
//! [`ConsensusState::catchup_replay`] feeds the WAL entries of the height in
//! progress back through the state machine.

use std::sync::Arc;

use meridian_abci::{
    Application,
    RequestFinalizeBlock,
    RequestInfo,
    RequestInitChain,
    ResponseCommit,
    ResponseFinalizeBlock,
    ResponseInfo,
    ResponseInitChain,
};
use meridian_common::block::BLOCK_PROTOCOL;
use meridian_common::{fmt_hex, merkle, Block, EventBus, GenesisDoc, Validator, ValidatorSet};
use meridian_state::{BlockExecutor, BlockStore, EmptyEvidencePool, EmptyMempool, State, Store};

use crate::error::{FatalError, HandshakeError};
use crate::messages::{Message, WalMessage};
use crate::state::ConsensusState;
use crate::wal::SearchOptions;

/// Software version reported to the application in `Info`.
pub const SOFTWARE_VERSION: &str = env!("CARGO_PKG_VERSION");

impl ConsensusState {
    /// Replays the WAL entries logged for `height` since the last committed
    /// height. Signing is held back until the replay is over.
    pub(crate) async fn catchup_replay(&mut self, height: i64) -> Result<(), FatalError> {
        self.replay_mode = true;
        let result = self.replay_wal(height).await;
        self.replay_mode = false;
        result?;
        self.resume_deferred_signing().await
    }

    async fn replay_wal(&mut self, height: i64) -> Result<(), FatalError> {
        // A marker for the height we are about to run means its block was
        // committed but the state never caught up. The handshake deals with
        // that, not the WAL.
        let ignore_corruption = SearchOptions {
            ignore_data_corruption: true,
        };
        match self.wal.search_for_end_height(height, &ignore_corruption) {
            Ok(Some(_)) => {
                tracing::error!(%height, "WAL already holds an end marker for the current height, skipping replay");
                return Ok(());
            }
            Ok(None) => {}
            Err(e) => {
                tracing::error!(%height, error = %e, "Failed to scan the WAL, skipping replay");
                return Ok(());
            }
        }

        let end_height = if height == self.state.initial_height {
            0
        } else {
            height - 1
        };
        let entries = match self.wal.search_for_end_height(end_height, &SearchOptions::default()) {
            Ok(Some(entries)) => entries,
            Ok(None) => {
                // Expected after state sync, or when the WAL was reset.
                tracing::info!(%height, %end_height, "No end marker for the previous height in the WAL, skipping replay");
                return Ok(());
            }
            Err(e) if e.is_data_corruption() => return Err(e.into()),
            Err(e) => {
                tracing::error!(%height, error = %e, "Failed to search the WAL, skipping replay");
                return Ok(());
            }
        };

        tracing::info!(%height, entries = entries.len(), "Catchup by replaying consensus messages");
        for entry in entries {
            match entry.msg {
                WalMessage::EndHeight(h) => {
                    tracing::debug!(height = h, "Replay: skipping end marker");
                }
                WalMessage::RoundState(event) => {
                    tracing::debug!(height = event.height, round = event.round, step = %event.step, "Replay: round state");
                }
                WalMessage::MsgInfo(mi) => {
                    match &mi.msg {
                        Message::Proposal(p) => {
                            tracing::info!(height = p.height, round = p.round, peer = %mi.peer_id, "Replay: Proposal");
                        }
                        Message::BlockPart(bp) => {
                            tracing::info!(height = bp.height, round = bp.round, peer = %mi.peer_id, "Replay: BlockPart");
                        }
                        Message::Vote(v) => {
                            tracing::info!(%v, peer = %mi.peer_id, "Replay: Vote");
                        }
                        other => tracing::debug!(msg_type = other.name(), "Replay: other message"),
                    }
                    self.handle_msg(mi).await?;
                }
                WalMessage::Timeout(ti) => {
                    tracing::debug!(timeout = ?ti, "Replay: timeout");
                    self.handle_timeout(ti).await?;
                }
            }
        }
        tracing::info!(%height, "Replay done");
        Ok(())
    }
}

/// Syncs the application with the block store and the state store on
/// startup.
///
/// The three are written at different moments while a block commits, so a
/// crash leaves them at slightly different heights: the block store is
/// saved first, then the application commits, then the state is saved.
pub struct Handshaker {
    state_store: Arc<dyn Store>,
    initial_state: State,
    block_store: Arc<dyn BlockStore>,
    event_bus: EventBus,
    genesis: GenesisDoc,
    n_blocks: usize,
}

impl Handshaker {
    pub fn new(
        state_store: Arc<dyn Store>,
        initial_state: State,
        block_store: Arc<dyn BlockStore>,
        event_bus: EventBus,
        genesis: GenesisDoc,
    ) -> Self {
        Self {
            state_store,
            initial_state,
            block_store,
            event_bus,
            genesis,
            n_blocks: 0,
        }
    }

    /// Blocks replayed into the application so far.
    pub fn n_blocks(&self) -> usize {
        self.n_blocks
    }

    /// Asks the application where it is and replays whatever it misses.
    /// Afterwards the stored state is the one to run consensus from.
    pub async fn handshake(&mut self, app: Arc<dyn Application>) -> Result<(), HandshakeError> {
        let info = app
            .info(RequestInfo {
                version: SOFTWARE_VERSION.to_string(),
                block_version: BLOCK_PROTOCOL,
            })
            .await
            .map_err(HandshakeError::App)?;
        let app_height = info.last_block_height;
        if app_height < 0 {
            return Err(HandshakeError::NegativeAppHeight(app_height));
        }
        let app_hash = info.last_block_app_hash;
        tracing::info!(
            height = app_height,
            hash = %fmt_hex(&app_hash),
            software_version = %info.version,
            protocol_version = info.app_version,
            "ABCI handshake app info"
        );

        if self.initial_state.last_block_height == 0 {
            self.initial_state.version.app = info.app_version;
        }

        let state = self.initial_state.clone();
        let app_hash = self.replay_blocks(state, app_hash, app_height, app).await?;

        tracing::info!(app_height, hash = %fmt_hex(&app_hash), "Completed ABCI handshake, app and node are synced");
        Ok(())
    }

    /// Replays every stored block above `app_height` and checks that the
    /// application ends up with the app hash the state expects. Returns the
    /// final app hash.
    pub async fn replay_blocks(
        &mut self,
        mut state: State,
        mut app_hash: Vec<u8>,
        app_height: i64,
        app: Arc<dyn Application>,
    ) -> Result<Vec<u8>, HandshakeError> {
        let store_base = self.block_store.base();
        let store_height = self.block_store.height();
        let state_height = state.last_block_height;
        tracing::info!(app_height, store_height, state_height, "ABCI replay blocks");

        if app_height == 0 {
            app_hash = self.init_chain(&mut state, app.as_ref()).await?;
        }

        if store_height == 0 {
            check_app_hash_against_state(&app_hash, &state)?;
            return Ok(app_hash);
        }
        if (app_height == 0 && state.initial_height < store_base)
            || (app_height > 0 && app_height < store_base - 1)
        {
            return Err(HandshakeError::AppBlockHeightTooLow { app_height, store_base });
        }
        if store_height < app_height {
            return Err(HandshakeError::AppBlockHeightTooHigh { app_height, store_height });
        }
        if store_height < state_height {
            return Err(HandshakeError::StateAheadOfStore { state_height, store_height });
        }
        if store_height > state_height + 1 {
            return Err(HandshakeError::StoreTooFarAhead { store_height, state_height });
        }

        if store_height == state_height {
            // The state was saved after the last commit.
            if app_height < store_height {
                return self
                    .replay_range(state, app, app_height, store_height, false)
                    .await;
            }
            self.replay_events(app_height)?;
            check_app_hash_against_state(&app_hash, &state)?;
            return Ok(app_hash);
        }

        // The last block is saved but the state was not updated with it.
        if app_height < state_height {
            self.replay_range(state, app, app_height, store_height, true).await
        } else if app_height == state_height {
            tracing::info!(height = store_height, "Replay last block using real app");
            let state = self.replay_block(state, store_height, app).await?;
            Ok(state.app_hash)
        } else {
            let response = self.state_store.load_finalize_block_response(store_height)?;
            let mock = Arc::new(MockApplication::new(app_hash, response));
            tracing::info!(height = store_height, "Replay last block using mock app");
            let state = self.replay_block(state, store_height, mock).await?;
            Ok(state.app_hash)
        }
    }

    /// Sends `InitChain` and, on a fresh state, adopts what the application
    /// answers.
    async fn init_chain(&self, state: &mut State, app: &dyn Application) -> Result<Vec<u8>, HandshakeError> {
        let validators = self
            .genesis
            .validators
            .iter()
            .map(|v| meridian_abci::ValidatorUpdate {
                pub_key: v.pub_key,
                power: v.power,
            })
            .collect();
        let app_state_bytes = match &self.genesis.app_state {
            serde_json::Value::Null => Vec::new(),
            value => serde_json::to_vec(value).map_err(|e| HandshakeError::InitChain(e.to_string()))?,
        };
        let response = app
            .init_chain(RequestInitChain {
                time: self.genesis.genesis_time,
                chain_id: self.genesis.chain_id.clone(),
                consensus_params: self.genesis.consensus_params.clone(),
                validators,
                app_state_bytes,
                initial_height: self.genesis.initial_height,
            })
            .await
            .map_err(HandshakeError::App)?;
        let ResponseInitChain {
            consensus_params,
            validators,
            app_hash,
        } = response;

        // Only a state that never moved takes the application's answer.
        if state.last_block_height == 0 {
            // The genesis app hash stays when the application has none, but
            // it is not what the application reported.
            if !app_hash.is_empty() {
                state.app_hash = app_hash.clone();
            }
            if !validators.is_empty() {
                let set = ValidatorSet::new(
                    validators
                        .iter()
                        .map(|v| Validator::new(v.pub_key, v.power))
                        .collect(),
                )
                .map_err(|e| HandshakeError::InitChain(e.to_string()))?;
                state.next_validators = set.copy_increment_proposer_priority(1);
                state.validators = set;
            } else if self.genesis.validators.is_empty() {
                return Err(HandshakeError::InitChain(
                    "validator set is empty in genesis and still empty after InitChain".into(),
                ));
            }
            if let Some(params) = consensus_params {
                state.version.app = params.version.app;
                state.consensus_params = params;
            }
            state.last_results_hash = merkle::hash_from_byte_slices::<&[u8]>(&[]);
            self.state_store.save(state);
        }
        Ok(app_hash)
    }

    /// Executes blocks `app_height + 1 ..= store_height` in the application
    /// without touching the state. With `mutate_state` the last one goes
    /// through [`Self::replay_block`] instead, which saves the new state.
    async fn replay_range(
        &mut self,
        state: State,
        app: Arc<dyn Application>,
        app_height: i64,
        store_height: i64,
        mutate_state: bool,
    ) -> Result<Vec<u8>, HandshakeError> {
        let final_block = if mutate_state { store_height - 1 } else { store_height };
        let first_block = if app_height == 0 {
            state.initial_height
        } else {
            app_height + 1
        };

        let executor = self.block_executor(app.clone());
        let mut app_hash = Vec::new();
        for height in first_block..=final_block {
            tracing::info!(%height, "Applying block");
            let block = self
                .block_store
                .load_block(height)
                .ok_or(HandshakeError::MissingBlock(height))?;
            if !app_hash.is_empty() {
                check_app_hash_against_block(&app_hash, &block)?;
            }
            app_hash = executor.exec_commit_block(&block, self.genesis.initial_height).await?;
            if height == final_block && !mutate_state {
                // Indexers may have missed the events of the block that was
                // committing when the node stopped.
                let meta = self
                    .block_store
                    .load_block_meta(height)
                    .ok_or(HandshakeError::MissingBlockMeta(height))?;
                executor.replay_events(&block, meta.block_id)?;
            }
            self.n_blocks += 1;
        }

        let state = if mutate_state {
            let state = self.replay_block(state, store_height, app).await?;
            app_hash = state.app_hash.clone();
            state
        } else {
            state
        };
        check_app_hash_against_state(&app_hash, &state)?;
        Ok(app_hash)
    }

    /// Applies the block at `height` the way consensus would have, saving
    /// the resulting state.
    async fn replay_block(
        &mut self,
        state: State,
        height: i64,
        app: Arc<dyn Application>,
    ) -> Result<State, HandshakeError> {
        let block = self
            .block_store
            .load_block(height)
            .ok_or(HandshakeError::MissingBlock(height))?;
        let meta = self
            .block_store
            .load_block_meta(height)
            .ok_or(HandshakeError::MissingBlockMeta(height))?;
        let (state, _) = self
            .block_executor(app)
            .apply_block(state, meta.block_id, &block)
            .await?;
        self.n_blocks += 1;
        Ok(state)
    }

    /// Re-publishes the events of the committed block at `height`.
    pub fn replay_events(&self, height: i64) -> Result<(), HandshakeError> {
        let block = self
            .block_store
            .load_block(height)
            .ok_or(HandshakeError::MissingBlock(height))?;
        let meta = self
            .block_store
            .load_block_meta(height)
            .ok_or(HandshakeError::MissingBlockMeta(height))?;
        self.block_executor(Arc::new(MockApplication::default()))
            .replay_events(&block, meta.block_id)?;
        Ok(())
    }

    // Replayed blocks need neither transactions nor evidence.
    fn block_executor(&self, app: Arc<dyn Application>) -> BlockExecutor {
        BlockExecutor::new(
            self.state_store.clone(),
            self.block_store.clone(),
            app,
            Arc::new(EmptyMempool::default()),
            Arc::new(EmptyEvidencePool),
        )
        .with_event_bus(self.event_bus.clone())
    }
}

fn check_app_hash_against_state(app_hash: &[u8], state: &State) -> Result<(), HandshakeError> {
    if app_hash != state.app_hash.as_slice() {
        return Err(HandshakeError::AppHashMismatch {
            height: state.last_block_height,
            expected: fmt_hex(&state.app_hash),
            actual: fmt_hex(app_hash),
        });
    }
    Ok(())
}

fn check_app_hash_against_block(app_hash: &[u8], block: &Block) -> Result<(), HandshakeError> {
    if app_hash != block.header.app_hash.as_slice() {
        return Err(HandshakeError::AppHashMismatch {
            height: block.height(),
            expected: fmt_hex(&block.header.app_hash),
            actual: fmt_hex(app_hash),
        });
    }
    Ok(())
}

/// Stands in for an application that already committed a block the state
/// never recorded: it answers `FinalizeBlock` with the response stored at
/// the time.
#[derive(Debug, Default)]
struct MockApplication {
    app_hash: Vec<u8>,
    response: ResponseFinalizeBlock,
}

impl MockApplication {
    fn new(app_hash: Vec<u8>, response: ResponseFinalizeBlock) -> Self {
        Self { app_hash, response }
    }
}

#[async_trait::async_trait]
impl Application for MockApplication {
    async fn info(&self, _request: RequestInfo) -> anyhow::Result<ResponseInfo> {
        Ok(ResponseInfo::default())
    }

    async fn init_chain(&self, _request: RequestInitChain) -> anyhow::Result<ResponseInitChain> {
        Ok(ResponseInitChain::default())
    }

    async fn finalize_block(&self, _request: RequestFinalizeBlock) -> anyhow::Result<ResponseFinalizeBlock> {
        Ok(ResponseFinalizeBlock {
            app_hash: self.app_hash.clone(),
            ..self.response.clone()
        })
    }

    async fn commit(&self) -> anyhow::Result<ResponseCommit> {
        Ok(ResponseCommit::default())
    }
}
