use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::bits::BitArray;
use crate::block::{BlockId, Commit, CommitSig};
use crate::validator::ValidatorSet;
use crate::vote::{Vote, VoteError, VoteType};
use crate::NodeId;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum VoteSetError {
    #[error("expected {expected_height}/{expected_round}/{expected_type}, got {height}/{round}/{vote_type}")]
    UnexpectedStep {
        expected_height: i64,
        expected_round: i32,
        expected_type: VoteType,
        height: i64,
        round: i32,
        vote_type: VoteType,
    },
    #[error("invalid validator index {0}")]
    InvalidValidatorIndex(i32),
    #[error("vote address does not match validator at index {0}")]
    InvalidValidatorAddress(i32),
    #[error("existing vote from the same validator has a different signature")]
    NonDeterministicSignature,
    #[error("failed to verify vote: {0}")]
    InvalidSignature(#[from] VoteError),
    #[error("conflicting votes from validator {}", .existing.validator_index)]
    ConflictingVote {
        existing: Box<Vote>,
        new: Box<Vote>,
        /// Whether the new vote was still tracked under its block.
        added: bool,
    },
    #[error("peer {peer} already claimed +2/3 for {existing}, now claims {new}")]
    ConflictingPeerMaj23 {
        peer: NodeId,
        existing: BlockId,
        new: BlockId,
    },
    #[error("commits can only be made from precommits")]
    NotPrecommits,
    #[error("no +2/3 majority to make a commit from")]
    NoMajority,
    #[error("vote {index} of the commit was not accepted")]
    Reconstruct { index: usize },
}

/// Read access shared by vote sets and commits, enough to pick votes to
/// gossip to a peer.
pub trait VoteSetReader {
    fn height(&self) -> i64;
    fn round(&self) -> i32;
    fn vote_type(&self) -> VoteType;
    fn size(&self) -> usize;
    fn bit_array(&self) -> BitArray;
    fn get_by_index(&self, index: i32) -> Option<Vote>;
    fn is_commit(&self) -> bool;
}

#[derive(Clone, Debug)]
struct BlockVotes {
    peer_maj23: bool,
    bit_array: BitArray,
    votes: Vec<Option<Vote>>,
    sum: i64,
}

impl BlockVotes {
    fn new(peer_maj23: bool, size: usize) -> Self {
        Self {
            peer_maj23,
            bit_array: BitArray::new(size),
            votes: vec![None; size],
            sum: 0,
        }
    }

    fn add_verified_vote(&mut self, vote: &Vote, power: i64) {
        let index = vote.validator_index as usize;
        if self.votes[index].is_none() {
            self.bit_array.set_index(index, true);
            self.votes[index] = Some(vote.clone());
            self.sum += power;
        }
    }
}

/// All votes of one type for one height and round.
///
/// The first vote seen from each validator counts towards `sum`. A later,
/// conflicting vote from the same validator is only tracked under its block
/// if some peer claimed +2/3 for that block, so that the set can still reach
/// the majority other nodes observed.
#[derive(Clone, Debug)]
pub struct VoteSet {
    chain_id: String,
    height: i64,
    round: i32,
    vote_type: VoteType,
    validators: Arc<ValidatorSet>,
    votes_bit_array: BitArray,
    votes: Vec<Option<Vote>>,
    sum: i64,
    maj23: Option<BlockId>,
    votes_by_block: HashMap<BlockId, BlockVotes>,
    peer_maj23s: HashMap<NodeId, BlockId>,
}

impl VoteSet {
    pub fn new(
        chain_id: impl Into<String>,
        height: i64,
        round: i32,
        vote_type: VoteType,
        validators: Arc<ValidatorSet>,
    ) -> Self {
        let size = validators.size();
        Self {
            chain_id: chain_id.into(),
            height,
            round,
            vote_type,
            validators,
            votes_bit_array: BitArray::new(size),
            votes: vec![None; size],
            sum: 0,
            maj23: None,
            votes_by_block: HashMap::new(),
            peer_maj23s: HashMap::new(),
        }
    }

    /// Rebuilds the precommit set a commit was made from.
    pub fn from_commit(
        chain_id: impl Into<String>,
        commit: &Commit,
        validators: Arc<ValidatorSet>,
    ) -> Result<Self, VoteSetError> {
        let mut set = Self::new(
            chain_id,
            commit.height,
            commit.round,
            VoteType::Precommit,
            validators,
        );
        for (index, sig) in commit.signatures.iter().enumerate() {
            if sig.is_absent() {
                continue;
            }
            let added = set.add_vote(commit.get_vote(index as i32))?;
            if !added {
                return Err(VoteSetError::Reconstruct { index });
            }
        }
        Ok(set)
    }

    pub fn chain_id(&self) -> &str {
        &self.chain_id
    }

    pub fn validators(&self) -> &Arc<ValidatorSet> {
        &self.validators
    }

    /// Returns `Ok(true)` if the vote was added, `Ok(false)` if it was a
    /// duplicate. A conflicting vote is reported as
    /// [`VoteSetError::ConflictingVote`] even if it was tracked.
    pub fn add_vote(&mut self, vote: Vote) -> Result<bool, VoteSetError> {
        let index = vote.validator_index;
        if vote.height != self.height || vote.round != self.round || vote.vote_type != self.vote_type {
            return Err(VoteSetError::UnexpectedStep {
                expected_height: self.height,
                expected_round: self.round,
                expected_type: self.vote_type,
                height: vote.height,
                round: vote.round,
                vote_type: vote.vote_type,
            });
        }
        let validator = self
            .validators
            .get_by_index(index)
            .ok_or(VoteSetError::InvalidValidatorIndex(index))?;
        if validator.address != vote.validator_address {
            return Err(VoteSetError::InvalidValidatorAddress(index));
        }
        let power = validator.voting_power;

        if let Some(existing) = self.get_vote(index as usize, &vote.block_id) {
            if existing.signature == vote.signature {
                return Ok(false);
            }
            return Err(VoteSetError::NonDeterministicSignature);
        }

        vote.verify(&self.chain_id, &validator.pub_key)?;

        let (added, conflicting) = self.add_verified_vote(vote.clone(), power);
        if let Some(existing) = conflicting {
            return Err(VoteSetError::ConflictingVote {
                existing: Box::new(existing),
                new: Box::new(vote),
                added,
            });
        }
        debug_assert!(added, "non-conflicting vote must be added");
        Ok(added)
    }

    fn get_vote(&self, index: usize, block_id: &BlockId) -> Option<&Vote> {
        if let Some(existing) = self.votes.get(index).and_then(Option::as_ref) {
            if &existing.block_id == block_id {
                return Some(existing);
            }
        }
        self.votes_by_block
            .get(block_id)
            .and_then(|block_votes| block_votes.votes.get(index))
            .and_then(Option::as_ref)
    }

    fn add_verified_vote(&mut self, vote: Vote, power: i64) -> (bool, Option<Vote>) {
        let index = vote.validator_index as usize;
        let mut conflicting = None;

        match &self.votes[index] {
            Some(existing) => {
                conflicting = Some(existing.clone());
                // Replace the vote if it is for the block the set has +2/3 for.
                if self.maj23.as_ref() == Some(&vote.block_id) {
                    self.votes[index] = Some(vote.clone());
                    self.votes_bit_array.set_index(index, true);
                }
            }
            None => {
                self.votes[index] = Some(vote.clone());
                self.votes_bit_array.set_index(index, true);
                self.sum += power;
            }
        }

        let size = self.validators.size();
        let block_votes = match self.votes_by_block.get_mut(&vote.block_id) {
            Some(block_votes) => {
                if conflicting.is_some() && !block_votes.peer_maj23 {
                    return (false, conflicting);
                }
                block_votes
            }
            None => {
                if conflicting.is_some() {
                    return (false, conflicting);
                }
                self.votes_by_block
                    .entry(vote.block_id.clone())
                    .or_insert_with(|| BlockVotes::new(false, size))
            }
        };

        let quorum = self.validators.total_voting_power() * 2 / 3 + 1;
        let orig_sum = block_votes.sum;
        block_votes.add_verified_vote(&vote, power);

        if orig_sum < quorum && quorum <= block_votes.sum && self.maj23.is_none() {
            self.maj23 = Some(vote.block_id.clone());
            for (i, block_vote) in block_votes.votes.iter().enumerate() {
                if let Some(block_vote) = block_vote {
                    self.votes[i] = Some(block_vote.clone());
                }
            }
        }
        (true, conflicting)
    }

    /// Records that `peer` claims to have seen +2/3 for `block_id`. Votes for
    /// that block are then tracked even when they conflict.
    pub fn set_peer_maj23(&mut self, peer: NodeId, block_id: BlockId) -> Result<(), VoteSetError> {
        if let Some(existing) = self.peer_maj23s.get(&peer) {
            if existing == &block_id {
                return Ok(());
            }
            return Err(VoteSetError::ConflictingPeerMaj23 {
                peer,
                existing: existing.clone(),
                new: block_id,
            });
        }
        self.peer_maj23s.insert(peer, block_id.clone());

        let size = self.validators.size();
        self.votes_by_block
            .entry(block_id)
            .and_modify(|block_votes| block_votes.peer_maj23 = true)
            .or_insert_with(|| BlockVotes::new(true, size));
        Ok(())
    }

    pub fn bit_array_by_block_id(&self, block_id: &BlockId) -> Option<BitArray> {
        self.votes_by_block
            .get(block_id)
            .map(|block_votes| block_votes.bit_array.clone())
    }

    pub fn get_by_address(&self, address: &[u8]) -> Option<&Vote> {
        let (index, _) = self.validators.get_by_address(address)?;
        self.votes.get(index as usize).and_then(Option::as_ref)
    }

    pub fn votes(&self) -> impl Iterator<Item = &Vote> {
        self.votes.iter().flatten()
    }

    pub fn sum(&self) -> i64 {
        self.sum
    }

    pub fn has_two_thirds_majority(&self) -> bool {
        self.maj23.is_some()
    }

    /// The block (possibly nil) that +2/3 voted for, if any.
    pub fn two_thirds_majority(&self) -> Option<&BlockId> {
        self.maj23.as_ref()
    }

    /// Whether +2/3 voted for anything, not necessarily the same block.
    pub fn has_two_thirds_any(&self) -> bool {
        self.sum > self.validators.total_voting_power() * 2 / 3
    }

    pub fn has_all(&self) -> bool {
        self.sum == self.validators.total_voting_power()
    }

    pub fn make_commit(&self) -> Result<Commit, VoteSetError> {
        if self.vote_type != VoteType::Precommit {
            return Err(VoteSetError::NotPrecommits);
        }
        let maj23 = self.maj23.clone().ok_or(VoteSetError::NoMajority)?;
        let signatures = self
            .votes
            .iter()
            .map(|vote| match vote {
                // Precommits for other blocks are left out of the commit.
                Some(vote) if vote.block_id.is_nil() || vote.block_id == maj23 => vote.commit_sig(),
                _ => CommitSig::absent(),
            })
            .collect();
        Ok(Commit {
            height: self.height,
            round: self.round,
            block_id: maj23,
            signatures,
        })
    }
}

impl VoteSetReader for VoteSet {
    fn height(&self) -> i64 {
        self.height
    }

    fn round(&self) -> i32 {
        self.round
    }

    fn vote_type(&self) -> VoteType {
        self.vote_type
    }

    fn size(&self) -> usize {
        self.validators.size()
    }

    fn bit_array(&self) -> BitArray {
        self.votes_bit_array.clone()
    }

    fn get_by_index(&self, index: i32) -> Option<Vote> {
        usize::try_from(index)
            .ok()
            .and_then(|index| self.votes.get(index))
            .cloned()
            .flatten()
    }

    fn is_commit(&self) -> bool {
        self.vote_type == VoteType::Precommit && self.maj23.is_some()
    }
}

impl VoteSetReader for Commit {
    fn height(&self) -> i64 {
        self.height
    }

    fn round(&self) -> i32 {
        self.round
    }

    fn vote_type(&self) -> VoteType {
        VoteType::Precommit
    }

    fn size(&self) -> usize {
        self.signatures.len()
    }

    fn bit_array(&self) -> BitArray {
        let mut bits = BitArray::new(self.signatures.len());
        for (index, sig) in self.signatures.iter().enumerate() {
            bits.set_index(index, !sig.is_absent());
        }
        bits
    }

    fn get_by_index(&self, index: i32) -> Option<Vote> {
        let sig = self.signatures.get(usize::try_from(index).ok()?)?;
        if sig.is_absent() {
            return None;
        }
        Some(self.get_vote(index))
    }

    fn is_commit(&self) -> bool {
        !self.signatures.is_empty()
    }
}

impl fmt::Display for VoteSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let maj23 = match &self.maj23 {
            Some(block_id) => block_id.to_string(),
            None => "none".to_owned(),
        };
        write!(
            f,
            "VoteSet{{H:{} R:{} T:{} +2/3:{} {}}}",
            self.height, self.round, self.vote_type, maj23, self.votes_bit_array
        )
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use ed25519_consensus::SigningKey;

    use super::*;
    use crate::block::PartSetHeader;
    use crate::time;
    use crate::validator::Validator;

    const CHAIN_ID: &str = "test-chain";

    struct Fixture {
        keys: Vec<SigningKey>,
        validators: Arc<ValidatorSet>,
    }

    impl Fixture {
        fn new(n: u8) -> Self {
            let keys: Vec<SigningKey> = (1..=n).map(|i| SigningKey::from([i; 32])).collect();
            let validators = ValidatorSet::new(
                keys.iter()
                    .map(|k| Validator::new(k.verification_key().into(), 10))
                    .collect(),
            )
            .unwrap();
            Self {
                keys,
                validators: Arc::new(validators),
            }
        }

        fn vote(&self, index: i32, vote_type: VoteType, block_id: BlockId) -> Vote {
            let validator = self.validators.get_by_index(index).unwrap();
            let key = self
                .keys
                .iter()
                .find(|k| crate::PublicKey::from(k.verification_key()) == validator.pub_key)
                .unwrap();
            let mut vote = Vote {
                vote_type,
                height: 1,
                round: 0,
                block_id,
                timestamp: time::now(),
                validator_address: validator.address.clone(),
                validator_index: index,
                signature: Vec::new(),
            };
            vote.signature = key.sign(&vote.sign_bytes(CHAIN_ID)).to_bytes().to_vec();
            vote
        }

        fn set(&self, vote_type: VoteType) -> VoteSet {
            VoteSet::new(CHAIN_ID, 1, 0, vote_type, self.validators.clone())
        }
    }

    fn block_id(seed: u8) -> BlockId {
        BlockId::new(
            vec![seed; 32],
            PartSetHeader {
                total: 1,
                hash: vec![seed; 32],
            },
        )
    }

    #[test]
    fn two_thirds_majority_needs_more_than_two_thirds() {
        let f = Fixture::new(4);
        let mut set = f.set(VoteType::Prevote);

        for index in 0..2 {
            assert!(set.add_vote(f.vote(index, VoteType::Prevote, block_id(1))).unwrap());
        }
        assert!(!set.has_two_thirds_majority());
        assert!(!set.has_two_thirds_any());

        assert!(set.add_vote(f.vote(2, VoteType::Prevote, BlockId::default())).unwrap());
        assert!(set.has_two_thirds_any());
        assert!(!set.has_two_thirds_majority());

        assert!(set.add_vote(f.vote(3, VoteType::Prevote, block_id(1))).unwrap());
        assert_eq!(set.two_thirds_majority(), Some(&block_id(1)));
        assert!(set.has_all());
    }

    #[test]
    fn duplicate_vote_is_not_added() {
        let f = Fixture::new(2);
        let mut set = f.set(VoteType::Prevote);
        let vote = f.vote(0, VoteType::Prevote, block_id(1));
        assert!(set.add_vote(vote.clone()).unwrap());
        assert!(!set.add_vote(vote).unwrap());
    }

    #[test]
    fn wrong_step_and_index_are_rejected() {
        let f = Fixture::new(2);
        let mut set = f.set(VoteType::Prevote);
        assert_matches!(
            set.add_vote(f.vote(0, VoteType::Precommit, block_id(1))),
            Err(VoteSetError::UnexpectedStep { .. })
        );

        let mut vote = f.vote(0, VoteType::Prevote, block_id(1));
        vote.validator_index = 2;
        assert_matches!(set.add_vote(vote), Err(VoteSetError::InvalidValidatorIndex(2)));

        let mut vote = f.vote(0, VoteType::Prevote, block_id(1));
        vote.validator_index = 1;
        assert_matches!(set.add_vote(vote), Err(VoteSetError::InvalidValidatorAddress(1)));

        let mut vote = f.vote(0, VoteType::Prevote, block_id(1));
        vote.signature[0] ^= 1;
        assert_matches!(set.add_vote(vote), Err(VoteSetError::InvalidSignature(_)));
    }

    #[test]
    fn conflicting_vote_is_reported_and_tracked_only_with_peer_claim() {
        let f = Fixture::new(4);
        let mut set = f.set(VoteType::Prevote);
        set.add_vote(f.vote(0, VoteType::Prevote, block_id(1))).unwrap();

        let conflicting = f.vote(0, VoteType::Prevote, block_id(2));
        assert_matches!(
            set.add_vote(conflicting.clone()),
            Err(VoteSetError::ConflictingVote { added: false, .. })
        );
        assert_eq!(set.bit_array_by_block_id(&block_id(2)), None);

        set.set_peer_maj23(NodeId::from("peer"), block_id(2)).unwrap();
        assert_matches!(
            set.add_vote(conflicting),
            Err(VoteSetError::ConflictingVote { added: true, .. })
        );
        let tracked = set.bit_array_by_block_id(&block_id(2)).unwrap();
        assert!(tracked.get_index(0));
        assert_eq!(set.sum(), 10);

        assert_matches!(
            set.set_peer_maj23(NodeId::from("peer"), block_id(3)),
            Err(VoteSetError::ConflictingPeerMaj23 { .. })
        );
    }

    #[test]
    fn commit_round_trip() {
        let f = Fixture::new(4);
        let mut set = f.set(VoteType::Precommit);
        for index in 0..3 {
            set.add_vote(f.vote(index, VoteType::Precommit, block_id(1))).unwrap();
        }
        set.add_vote(f.vote(3, VoteType::Precommit, BlockId::default())).unwrap();

        let commit = set.make_commit().unwrap();
        assert_eq!(commit.block_id, block_id(1));
        assert_eq!(commit.size(), 4);
        f.validators
            .verify_commit(CHAIN_ID, &block_id(1), 1, &commit)
            .unwrap();

        let rebuilt = VoteSet::from_commit(CHAIN_ID, &commit, f.validators.clone()).unwrap();
        assert_eq!(rebuilt.two_thirds_majority(), Some(&block_id(1)));
        assert_eq!(rebuilt.bit_array(), set.bit_array());
        assert!(rebuilt.is_commit());
        assert_eq!(commit.bit_array().count_ones(), 4);
    }

    #[test]
    fn make_commit_requires_majority() {
        let f = Fixture::new(2);
        assert_matches!(
            f.set(VoteType::Prevote).make_commit(),
            Err(VoteSetError::NotPrecommits)
        );
        assert_matches!(
            f.set(VoteType::Precommit).make_commit(),
            Err(VoteSetError::NoMajority)
        );
    }
}
