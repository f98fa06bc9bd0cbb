//! Error types for the consensus engine.
//!
//! [`ConsensusError`] covers inputs the state machine rejects and then keeps
//! running. [`FatalError`] stops the node: continuing after one of these could
//! break safety.

use meridian_common::{ProposalError, VoteSetError};
use meridian_state::{BlockExecError, StoreError};

use crate::height_vote_set::HeightVoteSetError;
use crate::messages::MessageError;
use crate::wal::WalError;

/// An input the state machine rejected. Logged and dropped.
#[derive(Debug, thiserror::Error)]
pub enum ConsensusError {
    #[error("invalid proposal POL round {pol_round} for round {round}")]
    InvalidProposalPolRound { pol_round: i32, round: i32 },
    #[error("invalid proposal signature: {0}")]
    InvalidProposalSignature(#[source] ProposalError),
    #[error("proposal claims {0} block parts, more than allowed")]
    TooManyBlockParts(u32),
    #[error("block parts exceed the maximum block size: {size} > {max}")]
    BlockTooBig { size: usize, max: i64 },
    #[error("vote from unknown validator index {0}")]
    UnknownValidator(i32),
    #[error(transparent)]
    VoteSet(#[from] VoteSetError),
    #[error(transparent)]
    HeightVoteSet(#[from] HeightVoteSetError),
    #[error(transparent)]
    Message(#[from] MessageError),
    #[error("failed to add block part: {0}")]
    BlockPart(#[from] meridian_common::part_set::PartSetError),
    #[error("failed to decode block: {0}")]
    BlockDecode(#[from] meridian_common::block::BlockError),
    #[error("failed to sign: {0}")]
    Sign(#[source] anyhow::Error),
    #[error("failed to create proposal block: {0}")]
    CreateBlock(#[source] BlockExecError),
    #[error("panicked while creating proposal block: {0}")]
    CreateBlockPanicked(String),
}

/// A safety violation or an unrecoverable failure. The node stops.
#[derive(Debug, thiserror::Error)]
pub enum FatalError {
    #[error("write-ahead log failure: {0}")]
    Wal(#[from] WalError),
    #[error("failed to apply block {height}: {source}")]
    ApplyBlock {
        height: i64,
        #[source]
        source: BlockExecError,
    },
    #[error("+2/3 committed an invalid block at height {height}: {source}")]
    InvalidCommittedBlock {
        height: i64,
        #[source]
        source: BlockExecError,
    },
    #[error("+2/3 prevoted for an invalid block at height {height}: {source}")]
    InvalidPolkaBlock {
        height: i64,
        #[source]
        source: BlockExecError,
    },
    #[error("application failed to process a proposal: {0}")]
    ProcessProposal(#[source] BlockExecError),
    #[error("found our own signature in the commit of height {0}, refusing to double sign")]
    DoubleSignRisk(i64),
    #[error("failed to rebuild the last commit: {0}")]
    LastCommit(#[source] VoteSetError),
    #[error("{0}")]
    Inconsistent(String),
}

/// The message of a caught panic, when it has one.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_owned()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_owned()
    }
}

/// Startup reconciliation between the application and the local stores
/// failed.
#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    #[error("application returned a negative last block height {0}")]
    NegativeAppHeight(i64),
    #[error("application height {app_height} is below the block store base {store_base}")]
    AppBlockHeightTooLow { app_height: i64, store_base: i64 },
    #[error("application height {app_height} is above the block store height {store_height}")]
    AppBlockHeightTooHigh { app_height: i64, store_height: i64 },
    #[error("state height {state_height} is above the block store height {store_height}")]
    StateAheadOfStore { state_height: i64, store_height: i64 },
    #[error("block store height {store_height} is more than one above the state height {state_height}")]
    StoreTooFarAhead { store_height: i64, state_height: i64 },
    #[error("app hash mismatch at height {height}: expected {expected}, got {actual}")]
    AppHashMismatch {
        height: i64,
        expected: String,
        actual: String,
    },
    #[error("block {0} is missing from the block store")]
    MissingBlock(i64),
    #[error("block meta {0} is missing from the block store")]
    MissingBlockMeta(i64),
    #[error("application failed: {0}")]
    App(#[source] anyhow::Error),
    #[error(transparent)]
    BlockExec(#[from] BlockExecError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("invalid genesis or InitChain response: {0}")]
    InitChain(String),
}
