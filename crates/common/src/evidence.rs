use std::time::SystemTime;

use prost::Message;

use crate::vote::{Vote, VoteError};
use crate::{merkle, time};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum EvidenceError {
    #[error("missing vote in duplicate vote evidence")]
    MissingVote,
    #[error("invalid vote in evidence: {0}")]
    InvalidVote(#[from] VoteError),
    #[error("votes in evidence do not conflict: {0}")]
    NotConflicting(String),
    #[error("unknown evidence type")]
    UnknownType,
}

/// Two conflicting votes signed by the same validator for the same height,
/// round and step.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DuplicateVoteEvidence {
    pub vote_a: Vote,
    pub vote_b: Vote,
    pub total_voting_power: i64,
    pub validator_power: i64,
    pub timestamp: SystemTime,
}

impl DuplicateVoteEvidence {
    /// Orders the two votes by block id so that the same pair always yields
    /// the same evidence.
    pub fn new(
        vote_a: Vote,
        vote_b: Vote,
        timestamp: SystemTime,
        total_voting_power: i64,
        validator_power: i64,
    ) -> Self {
        let (vote_a, vote_b) = if vote_a.block_id <= vote_b.block_id {
            (vote_a, vote_b)
        } else {
            (vote_b, vote_a)
        };
        Self {
            vote_a,
            vote_b,
            total_voting_power,
            validator_power,
            timestamp,
        }
    }

    pub fn height(&self) -> i64 {
        self.vote_a.height
    }

    pub fn validate_basic(&self) -> Result<(), EvidenceError> {
        self.vote_a.validate_basic()?;
        self.vote_b.validate_basic()?;
        let (a, b) = (&self.vote_a, &self.vote_b);
        if a.height != b.height || a.round != b.round || a.vote_type != b.vote_type {
            return Err(EvidenceError::NotConflicting(
                "votes are for different height, round or step".into(),
            ));
        }
        if a.validator_address != b.validator_address {
            return Err(EvidenceError::NotConflicting(
                "votes are from different validators".into(),
            ));
        }
        if a.block_id == b.block_id {
            return Err(EvidenceError::NotConflicting(
                "votes are for the same block".into(),
            ));
        }
        Ok(())
    }

    pub fn to_proto(&self) -> p2p_proto::types::Evidence {
        p2p_proto::types::Evidence {
            sum: Some(p2p_proto::types::evidence::Sum::DuplicateVoteEvidence(
                p2p_proto::types::DuplicateVoteEvidence {
                    vote_a: Some(self.vote_a.to_proto()),
                    vote_b: Some(self.vote_b.to_proto()),
                    total_voting_power: self.total_voting_power,
                    validator_power: self.validator_power,
                    timestamp: Some(time::to_proto(self.timestamp)),
                },
            )),
        }
    }

    pub fn from_proto(proto: p2p_proto::types::Evidence) -> Result<Self, EvidenceError> {
        let Some(p2p_proto::types::evidence::Sum::DuplicateVoteEvidence(ev)) = proto.sum else {
            return Err(EvidenceError::UnknownType);
        };
        Ok(Self {
            vote_a: Vote::from_proto(ev.vote_a.ok_or(EvidenceError::MissingVote)?)?,
            vote_b: Vote::from_proto(ev.vote_b.ok_or(EvidenceError::MissingVote)?)?,
            total_voting_power: ev.total_voting_power,
            validator_power: ev.validator_power,
            timestamp: time::from_proto(ev.timestamp.as_ref()),
        })
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EvidenceList(pub Vec<DuplicateVoteEvidence>);

impl EvidenceList {
    pub fn hash(&self) -> Vec<u8> {
        let encoded: Vec<Vec<u8>> = self
            .0
            .iter()
            .map(|ev| ev.to_proto().encode_to_vec())
            .collect();
        merkle::hash_from_byte_slices(&encoded)
    }

    pub fn to_proto(&self) -> p2p_proto::types::EvidenceList {
        p2p_proto::types::EvidenceList {
            evidence: self.0.iter().map(DuplicateVoteEvidence::to_proto).collect(),
        }
    }

    pub fn from_proto(proto: p2p_proto::types::EvidenceList) -> Result<Self, EvidenceError> {
        proto
            .evidence
            .into_iter()
            .map(DuplicateVoteEvidence::from_proto)
            .collect::<Result<_, _>>()
            .map(Self)
    }
}
