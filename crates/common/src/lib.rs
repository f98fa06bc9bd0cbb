//! Core domain types of the meridian consensus engine: bit arrays, Merkle
//! proofs, blocks and their part sets, votes, proposals, validator sets, vote
//! sets, signers, genesis documents and the event bus.

use std::fmt;

use serde::{Deserialize, Serialize};

pub mod bits;
pub mod block;
pub mod events;
pub mod evidence;
pub mod genesis;
pub mod merkle;
pub mod params;
pub mod part_set;
pub mod priv_validator;
pub mod proposal;
pub mod time;
pub mod validator;
pub mod vote;
pub mod vote_set;

pub use bits::BitArray;
pub use block::{Block, BlockId, BlockIdFlag, BlockMeta, Commit, CommitSig, Data, Header, PartSetHeader};
pub use events::{Event, EventBus, RoundStateEvent};
pub use evidence::DuplicateVoteEvidence;
pub use genesis::{GenesisDoc, GenesisValidator};
pub use params::{ConsensusParams, ConsensusParamsUpdate};
pub use part_set::{Part, PartSet, BLOCK_PART_SIZE_BYTES, MAX_BLOCK_PARTS_COUNT};
pub use priv_validator::{FilePrivValidator, MockPrivValidator, PrivValidator};
pub use proposal::{Proposal, ProposalError};
pub use validator::{PublicKey, Validator, ValidatorSet};
pub use vote::{Vote, VoteError, VoteType};
pub use vote_set::{VoteSet, VoteSetError, VoteSetReader};

/// A single transaction, opaque to consensus.
pub type Tx = Vec<u8>;

/// Identifier of a connected peer.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(id: &str) -> Self {
        Self(id.to_owned())
    }
}

/// Uppercase hex, the way hashes and addresses show up in logs.
pub fn fmt_hex(bytes: &[u8]) -> String {
    hex::encode_upper(bytes)
}
