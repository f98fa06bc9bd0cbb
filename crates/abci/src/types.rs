use std::time::SystemTime;

use meridian_common::params::ConsensusParamsUpdate;
use meridian_common::{BlockIdFlag, ConsensusParams, PublicKey, Tx};

/// A change to the validator set. Zero power removes the validator.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ValidatorUpdate {
    pub pub_key: PublicKey,
    pub power: i64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VoteInfo {
    pub validator_address: Vec<u8>,
    pub power: i64,
    pub block_id_flag: BlockIdFlag,
}

/// Who signed the previous block.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CommitInfo {
    pub round: i32,
    pub votes: Vec<VoteInfo>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Misbehavior {
    pub validator_address: Vec<u8>,
    pub validator_power: i64,
    pub height: i64,
    pub time: SystemTime,
    pub total_voting_power: i64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Event {
    pub kind: String,
    pub attributes: Vec<(String, String)>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExecTxResult {
    pub code: u32,
    pub data: Vec<u8>,
    pub log: String,
    pub gas_wanted: i64,
    pub gas_used: i64,
    pub events: Vec<Event>,
}

impl ExecTxResult {
    pub fn is_ok(&self) -> bool {
        self.code == 0
    }
}

#[derive(Clone, Debug, Default)]
pub struct RequestInfo {
    pub version: String,
    pub block_version: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ResponseInfo {
    pub data: String,
    pub version: String,
    pub app_version: u64,
    pub last_block_height: i64,
    pub last_block_app_hash: Vec<u8>,
}

#[derive(Clone, Debug)]
pub struct RequestInitChain {
    pub time: SystemTime,
    pub chain_id: String,
    pub consensus_params: ConsensusParams,
    pub validators: Vec<ValidatorUpdate>,
    pub app_state_bytes: Vec<u8>,
    pub initial_height: i64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ResponseInitChain {
    /// Replaces the genesis parameters if set.
    pub consensus_params: Option<ConsensusParams>,
    /// Replaces the genesis validators if non-empty.
    pub validators: Vec<ValidatorUpdate>,
    pub app_hash: Vec<u8>,
}

#[derive(Clone, Debug)]
pub struct RequestPrepareProposal {
    pub max_tx_bytes: i64,
    pub txs: Vec<Tx>,
    pub local_last_commit: CommitInfo,
    pub misbehavior: Vec<Misbehavior>,
    pub height: i64,
    pub time: SystemTime,
    pub next_validators_hash: Vec<u8>,
    pub proposer_address: Vec<u8>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ResponsePrepareProposal {
    pub txs: Vec<Tx>,
}

#[derive(Clone, Debug)]
pub struct RequestProcessProposal {
    pub txs: Vec<Tx>,
    pub proposed_last_commit: CommitInfo,
    pub misbehavior: Vec<Misbehavior>,
    pub hash: Vec<u8>,
    pub height: i64,
    pub time: SystemTime,
    pub next_validators_hash: Vec<u8>,
    pub proposer_address: Vec<u8>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProposalStatus {
    Accept,
    Reject,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResponseProcessProposal {
    pub status: ProposalStatus,
}

impl ResponseProcessProposal {
    pub fn is_accepted(&self) -> bool {
        self.status == ProposalStatus::Accept
    }
}

#[derive(Clone, Debug)]
pub struct RequestFinalizeBlock {
    pub txs: Vec<Tx>,
    pub decided_last_commit: CommitInfo,
    pub misbehavior: Vec<Misbehavior>,
    pub hash: Vec<u8>,
    pub height: i64,
    pub time: SystemTime,
    pub next_validators_hash: Vec<u8>,
    pub proposer_address: Vec<u8>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ResponseFinalizeBlock {
    pub events: Vec<Event>,
    pub tx_results: Vec<ExecTxResult>,
    pub validator_updates: Vec<ValidatorUpdate>,
    pub consensus_param_updates: Option<ConsensusParamsUpdate>,
    pub app_hash: Vec<u8>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ResponseCommit {
    /// Blocks below this height may be pruned. Zero retains everything.
    pub retain_height: i64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CheckTxKind {
    New,
    Recheck,
}

#[derive(Clone, Debug)]
pub struct RequestCheckTx {
    pub tx: Tx,
    pub kind: CheckTxKind,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ResponseCheckTx {
    pub code: u32,
    pub log: String,
    pub gas_wanted: i64,
}

impl ResponseCheckTx {
    pub fn is_ok(&self) -> bool {
        self.code == 0
    }
}
