use std::sync::Arc;
use std::time::SystemTime;

use meridian_abci::{
    Application,
    CommitInfo,
    ExecTxResult,
    Misbehavior,
    RequestFinalizeBlock,
    RequestPrepareProposal,
    RequestProcessProposal,
    ResponseFinalizeBlock,
    VoteInfo,
};
use meridian_common::block::BlockError;
use meridian_common::params::ParamsError;
use meridian_common::part_set::MAX_BLOCK_SIZE_BYTES;
use meridian_common::validator::ValidatorSetError;
use meridian_common::{
    fmt_hex,
    merkle,
    Block,
    BlockId,
    Commit,
    DuplicateVoteEvidence,
    Event,
    EventBus,
    Validator,
};

use crate::evidence::InvalidEvidenceError;
use crate::{BlockStore, EvidencePool, Mempool, State, Store, StoreError};

/// Bytes of a block that are not header, commit, evidence or data.
const MAX_OVERHEAD_FOR_BLOCK: i64 = 11;
const MAX_HEADER_BYTES: i64 = 626;
const MAX_COMMIT_OVERHEAD_BYTES: i64 = 94;
const MAX_COMMIT_SIG_BYTES: i64 = 109;

#[derive(Debug, thiserror::Error)]
pub enum BlockExecError {
    #[error("invalid block: {0}")]
    InvalidBlock(String),
    #[error(transparent)]
    Block(#[from] BlockError),
    #[error(transparent)]
    Validators(#[from] ValidatorSetError),
    #[error(transparent)]
    Evidence(#[from] InvalidEvidenceError),
    #[error(transparent)]
    App(#[from] anyhow::Error),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("invalid validator update: {0}")]
    ValidatorUpdate(String),
    #[error(transparent)]
    Params(#[from] ParamsError),
    #[error("prepared proposal has {size} bytes of transactions, limit is {max}")]
    ProposalTooBig { size: i64, max: i64 },
}

/// The largest total size of transactions that still fits in a block.
pub fn max_data_bytes(max_bytes: i64, evidence_bytes: i64, validators: usize) -> i64 {
    let max_bytes = if max_bytes == -1 {
        MAX_BLOCK_SIZE_BYTES
    } else {
        max_bytes
    };
    max_bytes
        - MAX_OVERHEAD_FOR_BLOCK
        - MAX_HEADER_BYTES
        - (MAX_COMMIT_OVERHEAD_BYTES + MAX_COMMIT_SIG_BYTES * validators as i64)
        - evidence_bytes
}

/// Merkle root over the deterministic part of each transaction result.
pub fn tx_results_hash(results: &[ExecTxResult]) -> Vec<u8> {
    let leaves: Vec<Vec<u8>> = results
        .iter()
        .map(|result| {
            let mut leaf = Vec::with_capacity(20 + result.data.len());
            leaf.extend_from_slice(&result.code.to_be_bytes());
            leaf.extend_from_slice(&result.gas_wanted.to_be_bytes());
            leaf.extend_from_slice(&result.gas_used.to_be_bytes());
            leaf.extend_from_slice(&result.data);
            leaf
        })
        .collect();
    merkle::hash_from_byte_slices(&leaves)
}

/// Validates blocks against the chain state, runs them through the
/// application and produces the next state.
pub struct BlockExecutor {
    store: Arc<dyn Store>,
    block_store: Arc<dyn BlockStore>,
    app: Arc<dyn Application>,
    mempool: Arc<dyn Mempool>,
    evidence_pool: Arc<dyn EvidencePool>,
    event_bus: Option<EventBus>,
}

impl BlockExecutor {
    pub fn new(
        store: Arc<dyn Store>,
        block_store: Arc<dyn BlockStore>,
        app: Arc<dyn Application>,
        mempool: Arc<dyn Mempool>,
        evidence_pool: Arc<dyn EvidencePool>,
    ) -> Self {
        Self {
            store,
            block_store,
            app,
            mempool,
            evidence_pool,
            event_bus: None,
        }
    }

    pub fn with_event_bus(mut self, event_bus: EventBus) -> Self {
        self.event_bus = Some(event_bus);
        self
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn block_store(&self) -> &Arc<dyn BlockStore> {
        &self.block_store
    }

    pub fn app(&self) -> &Arc<dyn Application> {
        &self.app
    }

    pub fn mempool(&self) -> &Arc<dyn Mempool> {
        &self.mempool
    }

    pub fn evidence_pool(&self) -> &Arc<dyn EvidencePool> {
        &self.evidence_pool
    }

    /// Builds the block this node proposes at `height`: pending evidence,
    /// then as many mempool transactions as the application keeps after
    /// `PrepareProposal`.
    pub async fn create_proposal_block(
        &self,
        height: i64,
        state: &State,
        last_commit: Commit,
        proposer_address: Vec<u8>,
        time: SystemTime,
    ) -> Result<Block, BlockExecError> {
        let params = &state.consensus_params;
        let (evidence, evidence_size) = self
            .evidence_pool
            .pending_evidence(params.evidence.max_bytes);
        let max_data_bytes = max_data_bytes(params.block.max_bytes, evidence_size, state.validators.size());
        let txs = self
            .mempool
            .reap_max_bytes_max_gas(max_data_bytes, params.block.max_gas);

        let local_last_commit = self.build_last_commit_info(height, state.initial_height, &last_commit)?;
        let response = self
            .app
            .prepare_proposal(RequestPrepareProposal {
                max_tx_bytes: max_data_bytes,
                txs,
                local_last_commit,
                misbehavior: misbehavior(&evidence),
                height,
                time,
                next_validators_hash: state.next_validators.hash(),
                proposer_address: proposer_address.clone(),
            })
            .await?;

        let size: i64 = response.txs.iter().map(|tx| tx.len() as i64).sum();
        if size > max_data_bytes {
            return Err(BlockExecError::ProposalTooBig {
                size,
                max: max_data_bytes,
            });
        }
        Ok(state.make_block(height, time, response.txs, last_commit, evidence, proposer_address))
    }

    /// Asks the application whether a proposed block may be voted for.
    pub async fn process_proposal(&self, block: &Block, state: &State) -> Result<bool, BlockExecError> {
        let proposed_last_commit =
            self.build_last_commit_info(block.height(), state.initial_height, &block.last_commit)?;
        let response = self
            .app
            .process_proposal(RequestProcessProposal {
                txs: block.data.txs.clone(),
                proposed_last_commit,
                misbehavior: misbehavior(&block.evidence.0),
                hash: block.hash(),
                height: block.height(),
                time: block.header.time,
                next_validators_hash: block.header.next_validators_hash.clone(),
                proposer_address: block.header.proposer_address.clone(),
            })
            .await?;
        Ok(response.is_accepted())
    }

    /// Checks a block against the state it is supposed to extend.
    pub fn validate_block(&self, state: &State, block: &Block) -> Result<(), BlockExecError> {
        block.validate_basic()?;
        let header = &block.header;

        let invalid = |what: &str, expected: &[u8], actual: &[u8]| {
            BlockExecError::InvalidBlock(format!(
                "wrong {what}: expected {}, got {}",
                fmt_hex(expected),
                fmt_hex(actual)
            ))
        };

        if header.version != state.version {
            return Err(BlockExecError::InvalidBlock(format!(
                "wrong version: expected {:?}, got {:?}",
                state.version, header.version
            )));
        }
        if header.chain_id != state.chain_id {
            return Err(BlockExecError::InvalidBlock(format!(
                "wrong chain id: expected {}, got {}",
                state.chain_id, header.chain_id
            )));
        }
        if header.height != state.next_height() {
            return Err(BlockExecError::InvalidBlock(format!(
                "wrong height: expected {}, got {}",
                state.next_height(),
                header.height
            )));
        }
        if header.last_block_id != state.last_block_id {
            return Err(BlockExecError::InvalidBlock(format!(
                "wrong last block id: expected {}, got {}",
                state.last_block_id, header.last_block_id
            )));
        }
        if header.app_hash != state.app_hash {
            return Err(invalid("app hash", &state.app_hash, &header.app_hash));
        }
        let consensus_hash = state.consensus_params.hash();
        if header.consensus_hash != consensus_hash {
            return Err(invalid("consensus hash", &consensus_hash, &header.consensus_hash));
        }
        if header.last_results_hash != state.last_results_hash {
            return Err(invalid("last results hash", &state.last_results_hash, &header.last_results_hash));
        }
        let validators_hash = state.validators.hash();
        if header.validators_hash != validators_hash {
            return Err(invalid("validators hash", &validators_hash, &header.validators_hash));
        }
        let next_validators_hash = state.next_validators.hash();
        if header.next_validators_hash != next_validators_hash {
            return Err(invalid(
                "next validators hash",
                &next_validators_hash,
                &header.next_validators_hash,
            ));
        }

        if header.height == state.initial_height {
            if !block.last_commit.signatures.is_empty() {
                return Err(BlockExecError::InvalidBlock(
                    "initial block cannot have last commit signatures".into(),
                ));
            }
        } else {
            state.last_validators.verify_commit(
                &state.chain_id,
                &state.last_block_id,
                header.height - 1,
                &block.last_commit,
            )?;
            if header.time <= state.last_block_time {
                return Err(BlockExecError::InvalidBlock(
                    "block time is not after the last block time".into(),
                ));
            }
        }

        if !state.validators.has_address(&header.proposer_address) {
            return Err(BlockExecError::InvalidBlock(format!(
                "proposer {} is not a validator",
                fmt_hex(&header.proposer_address)
            )));
        }

        self.evidence_pool.check_evidence(&block.evidence.0)?;
        Ok(())
    }

    /// Validates and executes `block`, commits it in the application and
    /// saves the resulting state. Returns the new state and the height below
    /// which blocks were pruned, if any.
    pub async fn apply_block(
        &self,
        state: State,
        block_id: BlockId,
        block: &Arc<Block>,
    ) -> Result<(State, i64), BlockExecError> {
        self.validate_block(&state, block)?;

        let height = block.height();
        let response = self.finalize_block(block, state.initial_height).await?;
        tracing::info!(
            %height,
            num_txs = block.data.txs.len(),
            app_hash = %fmt_hex(&response.app_hash),
            "Finalized block"
        );
        self.store.save_finalize_block_response(height, &response);

        let validator_updates = validate_validator_updates(&response)?;
        let state = update_state(state, block_id.clone(), block, &response, validator_updates.clone())?;

        let retain_height = self.commit(&state, block, &response.tx_results).await?;
        self.evidence_pool.update(&state, &block.evidence.0);
        self.store.save(&state);

        let mut pruned_to = 0;
        if retain_height > 0 && retain_height > self.block_store.base() {
            let pruned = self.block_store.prune_blocks(retain_height);
            self.store.prune_states(retain_height);
            tracing::debug!(%retain_height, %pruned, "Pruned blocks");
            pruned_to = retain_height;
        }

        self.fire_events(block, block_id, validator_updates);
        Ok((state, pruned_to))
    }

    /// Executes and commits a block without touching the stored state. Used
    /// while replaying blocks the state has already moved past. Returns the
    /// application hash.
    pub async fn exec_commit_block(&self, block: &Block, initial_height: i64) -> Result<Vec<u8>, BlockExecError> {
        let response = self.finalize_block(block, initial_height).await?;
        validate_validator_updates(&response)?;
        self.app.commit().await?;
        Ok(response.app_hash)
    }

    async fn finalize_block(&self, block: &Block, initial_height: i64) -> Result<ResponseFinalizeBlock, BlockExecError> {
        let decided_last_commit = self.build_last_commit_info(block.height(), initial_height, &block.last_commit)?;
        let response = self
            .app
            .finalize_block(RequestFinalizeBlock {
                txs: block.data.txs.clone(),
                decided_last_commit,
                misbehavior: misbehavior(&block.evidence.0),
                hash: block.hash(),
                height: block.height(),
                time: block.header.time,
                next_validators_hash: block.header.next_validators_hash.clone(),
                proposer_address: block.header.proposer_address.clone(),
            })
            .await?;
        if response.tx_results.len() != block.data.txs.len() {
            return Err(BlockExecError::App(anyhow::anyhow!(
                "expected {} tx results, got {}",
                block.data.txs.len(),
                response.tx_results.len()
            )));
        }
        Ok(response)
    }

    /// Commits the application state and updates the mempool while holding
    /// the mempool lock. Returns the retain height the application asked for.
    async fn commit(&self, state: &State, block: &Block, results: &[ExecTxResult]) -> Result<i64, BlockExecError> {
        let _guard = self.mempool.lock().await;
        let response = self.app.commit().await?;
        tracing::debug!(
            height = %block.height(),
            app_hash = %fmt_hex(&state.app_hash),
            "Committed state"
        );
        self.mempool
            .update(block.height(), &block.data.txs, results)
            .await?;
        Ok(response.retain_height)
    }

    /// The votes of the previous height, as seen in `last_commit`.
    pub fn build_last_commit_info(
        &self,
        height: i64,
        initial_height: i64,
        last_commit: &Commit,
    ) -> Result<CommitInfo, BlockExecError> {
        if height == initial_height {
            return Ok(CommitInfo::default());
        }
        let validators = self.store.load_validators(height - 1)?;
        if last_commit.signatures.len() != validators.size() {
            return Err(BlockExecError::InvalidBlock(format!(
                "last commit has {} signatures, the validator set at height {} has {} members",
                last_commit.signatures.len(),
                height - 1,
                validators.size()
            )));
        }
        let votes = validators
            .validators()
            .iter()
            .zip(&last_commit.signatures)
            .map(|(validator, sig)| VoteInfo {
                validator_address: validator.address.clone(),
                power: validator.voting_power,
                block_id_flag: sig.block_id_flag,
            })
            .collect();
        Ok(CommitInfo {
            round: last_commit.round,
            votes,
        })
    }

    fn fire_events(&self, block: &Arc<Block>, block_id: BlockId, validator_updates: Vec<Validator>) {
        let Some(event_bus) = &self.event_bus else {
            return;
        };
        event_bus.publish(Event::NewBlock {
            block: block.clone(),
            block_id,
        });
        for evidence in &block.evidence.0 {
            event_bus.publish(Event::NewEvidence {
                evidence: evidence.clone(),
                height: block.height(),
            });
        }
        if !validator_updates.is_empty() {
            event_bus.publish(Event::ValidatorSetUpdates(validator_updates));
        }
    }

    /// Re-publishes the events of an already committed block.
    pub fn replay_events(&self, block: &Arc<Block>, block_id: BlockId) -> Result<(), BlockExecError> {
        let response = self.store.load_finalize_block_response(block.height())?;
        let updates = validate_validator_updates(&response)?;
        self.fire_events(block, block_id, updates);
        Ok(())
    }
}

fn misbehavior(evidence: &[DuplicateVoteEvidence]) -> Vec<Misbehavior> {
    evidence
        .iter()
        .map(|ev| Misbehavior {
            validator_address: ev.vote_a.validator_address.clone(),
            validator_power: ev.validator_power,
            height: ev.height(),
            time: ev.timestamp,
            total_voting_power: ev.total_voting_power,
        })
        .collect()
}

fn validate_validator_updates(response: &ResponseFinalizeBlock) -> Result<Vec<Validator>, BlockExecError> {
    response
        .validator_updates
        .iter()
        .map(|update| {
            if update.power < 0 {
                return Err(BlockExecError::ValidatorUpdate(format!(
                    "voting power cannot be negative, got {}",
                    update.power
                )));
            }
            Ok(Validator::new(update.pub_key, update.power))
        })
        .collect()
}

/// Computes the state after `block`. Validator updates take effect two
/// heights later, parameter updates at the next height.
pub fn update_state(
    state: State,
    block_id: BlockId,
    block: &Block,
    response: &ResponseFinalizeBlock,
    validator_updates: Vec<Validator>,
) -> Result<State, BlockExecError> {
    let height = block.height();

    let mut next_validators = state.next_validators.clone();
    let mut last_height_validators_changed = state.last_height_validators_changed;
    if !validator_updates.is_empty() {
        next_validators.update_with_change_set(validator_updates, true)?;
        last_height_validators_changed = height + 2;
    }
    next_validators.increment_proposer_priority(1);

    let mut consensus_params = state.consensus_params.clone();
    let mut last_height_consensus_params_changed = state.last_height_consensus_params_changed;
    let mut version = state.version;
    if let Some(update) = &response.consensus_param_updates {
        consensus_params = state.consensus_params.update(update);
        consensus_params.validate_basic()?;
        version.app = consensus_params.version.app;
        last_height_consensus_params_changed = height + 1;
    }

    Ok(State {
        version,
        chain_id: state.chain_id,
        initial_height: state.initial_height,
        last_block_height: height,
        last_block_id: block_id,
        last_block_time: block.header.time,
        next_validators,
        validators: state.next_validators,
        last_validators: state.validators,
        last_height_validators_changed,
        consensus_params,
        last_height_consensus_params_changed,
        last_results_hash: tx_results_hash(&response.tx_results),
        app_hash: response.app_hash.clone(),
    })
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use assert_matches::assert_matches;
    use meridian_abci::KvStoreApplication;
    use meridian_common::{PartSet, Vote, VoteSet, VoteType, BLOCK_PART_SIZE_BYTES};

    use super::*;
    use crate::test_utils::{genesis, signing_key};
    use crate::{EmptyEvidencePool, MemoryBlockStore, MemoryStore, TxMempool};

    struct Fixture {
        state: State,
        executor: BlockExecutor,
        app: Arc<KvStoreApplication>,
        mempool: Arc<TxMempool>,
        block_store: MemoryBlockStore,
        last_commit: Commit,
    }

    fn fixture(validators: u8) -> Fixture {
        let state = State::from_genesis(&genesis(validators)).unwrap();
        let store = MemoryStore::new();
        store.save(&state);
        let block_store = MemoryBlockStore::new();
        let app = Arc::new(KvStoreApplication::new());
        let mempool = Arc::new(TxMempool::new(app.clone()));
        let executor = BlockExecutor::new(
            Arc::new(store),
            Arc::new(block_store.clone()),
            app.clone(),
            mempool.clone(),
            Arc::new(EmptyEvidencePool),
        );
        Fixture {
            state,
            executor,
            app,
            mempool,
            block_store,
            last_commit: Commit::default(),
        }
    }

    fn commit_for(state: &State, block_id: &BlockId, height: i64, validators: u8) -> Commit {
        let mut votes = VoteSet::new(
            state.chain_id.clone(),
            height,
            0,
            VoteType::Precommit,
            Arc::new(state.validators.clone()),
        );
        for seed in 1..=validators {
            let key = signing_key(seed);
            let address = meridian_common::PublicKey::from(key.verification_key()).address();
            let (index, _) = state.validators.get_by_address(&address).unwrap();
            let mut vote = Vote {
                vote_type: VoteType::Precommit,
                height,
                round: 0,
                block_id: block_id.clone(),
                timestamp: meridian_common::time::now(),
                validator_address: address,
                validator_index: index,
                signature: Vec::new(),
            };
            vote.signature = key.sign(&vote.sign_bytes(&state.chain_id)).to_bytes().to_vec();
            votes.add_vote(vote).unwrap();
        }
        votes.make_commit().unwrap()
    }

    impl Fixture {
        async fn next_block(&self, txs: Vec<Vec<u8>>) -> (Arc<Block>, PartSet, BlockId) {
            let height = self.state.next_height();
            let proposer = self.state.validators.get_proposer().unwrap().address.clone();
            let time = self.state.last_block_time + Duration::from_millis(1);
            let mut block = self
                .executor
                .create_proposal_block(height, &self.state, self.last_commit.clone(), proposer, time)
                .await
                .unwrap();
            if !txs.is_empty() {
                block.data.txs = txs;
                block.fill_header();
            }
            let parts = block.make_part_set(BLOCK_PART_SIZE_BYTES);
            let block_id = BlockId::new(block.hash(), parts.header());
            (Arc::new(block), parts, block_id)
        }

        async fn commit_block(&mut self, txs: Vec<Vec<u8>>, validators: u8) -> Arc<Block> {
            let (block, parts, block_id) = self.next_block(txs).await;
            let seen_commit = commit_for(&self.state, &block_id, block.height(), validators);
            self.block_store.save_block(block.clone(), &parts, seen_commit.clone());
            let (state, _) = self
                .executor
                .apply_block(self.state.clone(), block_id, &block)
                .await
                .unwrap();
            self.state = state;
            self.last_commit = seen_commit;
            block
        }
    }

    #[tokio::test]
    async fn applies_consecutive_blocks() {
        let mut f = fixture(2);
        f.commit_block(vec![b"a=1".to_vec()], 2).await;
        assert_eq!(f.state.last_block_height, 1);
        assert_eq!(f.state.app_hash, f.app.app_hash());
        assert_eq!(f.app.get(b"a"), Some(b"1".to_vec()));

        let block = f.commit_block(Vec::new(), 2).await;
        assert_eq!(f.state.last_block_height, 2);
        assert_eq!(block.last_commit.height, 1);
        assert_eq!(f.state.last_validators, f.state.validators);
    }

    #[tokio::test]
    async fn proposal_block_reaps_mempool() {
        let f = fixture(1);
        f.mempool.check_tx(b"k=v".to_vec()).await.unwrap();
        let (block, ..) = f.next_block(Vec::new()).await;
        assert_eq!(block.data.txs, vec![b"k=v".to_vec()]);
        assert!(f.executor.process_proposal(&block, &f.state).await.unwrap());
    }

    #[tokio::test]
    async fn committed_txs_leave_the_mempool() {
        let mut f = fixture(1);
        f.mempool.check_tx(b"k=v".to_vec()).await.unwrap();
        f.commit_block(Vec::new(), 1).await;
        assert_eq!(f.mempool.size(), 0);
    }

    #[tokio::test]
    async fn rejects_block_with_wrong_app_hash() {
        let f = fixture(1);
        let (block, ..) = f.next_block(Vec::new()).await;
        let mut block = (*block).clone();
        block.header.app_hash = vec![1; 32];
        assert_matches!(
            f.executor.validate_block(&f.state, &block),
            Err(BlockExecError::InvalidBlock(msg)) if msg.contains("app hash")
        );
    }

    #[tokio::test]
    async fn rejects_last_commit_without_quorum() {
        let mut f = fixture(3);
        f.commit_block(Vec::new(), 3).await;
        let (block, ..) = f.next_block(Vec::new()).await;
        let mut block = (*block).clone();
        block.last_commit.signatures[0] = meridian_common::CommitSig::absent();
        block.last_commit.signatures[1] = meridian_common::CommitSig::absent();
        block.fill_header();
        assert_matches!(
            f.executor.validate_block(&f.state, &block),
            Err(BlockExecError::Validators(ValidatorSetError::NotEnoughVotingPower { .. }))
        );
    }

    #[tokio::test]
    async fn validator_tx_changes_validators_two_heights_later() {
        let mut f = fixture(1);
        let new_key = signing_key(9);
        let tx = format!("val:{}!5", hex_key(&new_key)).into_bytes();
        f.commit_block(vec![tx], 1).await;
        assert_eq!(f.state.validators.size(), 1);
        assert_eq!(f.state.next_validators.size(), 2);
        assert_eq!(f.state.last_height_validators_changed, 3);

        f.commit_block(Vec::new(), 1).await;
        assert_eq!(f.state.validators.size(), 2);
    }

    fn hex_key(key: &ed25519_consensus::SigningKey) -> String {
        key.verification_key()
            .as_bytes()
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect()
    }

    #[tokio::test]
    async fn exec_commit_block_matches_apply_block() {
        let mut f = fixture(1);
        let block = f.commit_block(vec![b"x=y".to_vec()], 1).await;

        let other = fixture(1);
        let app_hash = other.executor.exec_commit_block(&block, 1).await.unwrap();
        assert_eq!(app_hash, f.state.app_hash);
    }

    #[test]
    fn max_data_bytes_accounts_for_overhead() {
        assert_eq!(max_data_bytes(1000, 0, 1), 1000 - 11 - 626 - 94 - 109);
        assert_eq!(max_data_bytes(-1, 0, 0), MAX_BLOCK_SIZE_BYTES - 11 - 626 - 94);
    }
}
