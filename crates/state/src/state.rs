use std::time::SystemTime;

use meridian_common::block::Version;
use meridian_common::genesis::GenesisError;
use meridian_common::{
    Block,
    BlockId,
    Commit,
    ConsensusParams,
    Data,
    DuplicateVoteEvidence,
    GenesisDoc,
    Header,
    Tx,
    ValidatorSet,
};

/// The chain state after the last committed block: everything needed to
/// validate and execute the next one.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct State {
    pub version: Version,
    pub chain_id: String,
    pub initial_height: i64,

    /// Zero at genesis.
    pub last_block_height: i64,
    pub last_block_id: BlockId,
    pub last_block_time: SystemTime,

    /// Validators for `last_block_height + 2`.
    pub next_validators: ValidatorSet,
    /// Validators for `last_block_height + 1`.
    pub validators: ValidatorSet,
    /// Validators that signed the last block. Empty at genesis.
    pub last_validators: ValidatorSet,
    pub last_height_validators_changed: i64,

    pub consensus_params: ConsensusParams,
    pub last_height_consensus_params_changed: i64,

    pub last_results_hash: Vec<u8>,
    pub app_hash: Vec<u8>,
}

impl Default for State {
    fn default() -> Self {
        Self {
            version: Version::default(),
            chain_id: String::new(),
            initial_height: 0,
            last_block_height: 0,
            last_block_id: BlockId::default(),
            last_block_time: SystemTime::UNIX_EPOCH,
            next_validators: ValidatorSet::default(),
            validators: ValidatorSet::default(),
            last_validators: ValidatorSet::default(),
            last_height_validators_changed: 0,
            consensus_params: ConsensusParams::default(),
            last_height_consensus_params_changed: 0,
            last_results_hash: Vec::new(),
            app_hash: Vec::new(),
        }
    }
}

impl State {
    pub fn from_genesis(genesis: &GenesisDoc) -> Result<Self, GenesisError> {
        let validators = genesis.validator_set()?;
        let next_validators = if validators.is_empty() {
            validators.clone()
        } else {
            validators.copy_increment_proposer_priority(1)
        };
        Ok(Self {
            version: Version {
                app: genesis.consensus_params.version.app,
                ..Version::default()
            },
            chain_id: genesis.chain_id.clone(),
            initial_height: genesis.initial_height,
            last_block_height: 0,
            last_block_id: BlockId::default(),
            last_block_time: genesis.genesis_time,
            next_validators,
            validators,
            last_validators: ValidatorSet::default(),
            last_height_validators_changed: genesis.initial_height,
            consensus_params: genesis.consensus_params.clone(),
            last_height_consensus_params_changed: genesis.initial_height,
            last_results_hash: Vec::new(),
            app_hash: genesis.app_hash.clone(),
        })
    }

    pub fn is_empty(&self) -> bool {
        self.validators.is_empty()
    }

    /// The height of the next block to be committed.
    pub fn next_height(&self) -> i64 {
        if self.last_block_height == 0 {
            self.initial_height
        } else {
            self.last_block_height + 1
        }
    }

    /// Builds the next block from its contents, filling in every header
    /// field this state determines.
    pub fn make_block(
        &self,
        height: i64,
        time: SystemTime,
        txs: Vec<Tx>,
        last_commit: Commit,
        evidence: Vec<DuplicateVoteEvidence>,
        proposer_address: Vec<u8>,
    ) -> Block {
        let mut block = Block {
            header: Header {
                version: self.version,
                chain_id: self.chain_id.clone(),
                height,
                time,
                last_block_id: self.last_block_id.clone(),
                last_commit_hash: Vec::new(),
                data_hash: Vec::new(),
                validators_hash: self.validators.hash(),
                next_validators_hash: self.next_validators.hash(),
                consensus_hash: self.consensus_params.hash(),
                app_hash: self.app_hash.clone(),
                last_results_hash: self.last_results_hash.clone(),
                evidence_hash: Vec::new(),
                proposer_address,
            },
            data: Data { txs },
            evidence: meridian_common::evidence::EvidenceList(evidence),
            last_commit,
        };
        block.fill_header();
        block
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::genesis;

    #[test]
    fn genesis_state_starts_at_initial_height() {
        let mut doc = genesis(2);
        doc.initial_height = 5;
        let state = State::from_genesis(&doc).unwrap();
        assert_eq!(state.last_block_height, 0);
        assert_eq!(state.next_height(), 5);
        assert_eq!(state.validators.size(), 2);
        assert!(state.last_validators.is_empty());
    }

    #[test]
    fn made_block_passes_basic_validation() {
        let state = State::from_genesis(&genesis(1)).unwrap();
        let proposer = state.validators.get_proposer().unwrap().address.clone();
        let block = state.make_block(
            1,
            SystemTime::now(),
            vec![b"tx".to_vec()],
            Commit::default(),
            Vec::new(),
            proposer,
        );
        block.validate_basic().unwrap();
        assert_eq!(block.header.validators_hash, state.validators.hash());
    }
}
