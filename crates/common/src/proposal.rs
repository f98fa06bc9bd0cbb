use std::fmt;
use std::time::SystemTime;

use p2p_proto::types::SignedMsgType;
use prost::Message;

use crate::block::{BlockError, BlockId};
use crate::validator::{PublicKey, SignatureError};
use crate::vote::MAX_SIGNATURE_SIZE;
use crate::{fmt_hex, time};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ProposalError {
    #[error("invalid proposal type {0}")]
    InvalidType(i32),
    #[error("negative height")]
    NegativeHeight,
    #[error("negative round")]
    NegativeRound,
    #[error("invalid POL round {pol_round} for round {round}")]
    InvalidPolRound { pol_round: i32, round: i32 },
    #[error("wrong block id: {0}")]
    InvalidBlockId(#[from] BlockError),
    #[error("expected a complete, non-empty block id, got {0}")]
    IncompleteBlockId(BlockId),
    #[error("signature is missing")]
    MissingSignature,
    #[error("signature is too big: {0} bytes")]
    SignatureTooBig(usize),
    #[error("invalid signature: {0}")]
    InvalidSignature(#[from] SignatureError),
}

/// A block proposal for a height and round. `pol_round` is -1 unless the
/// proposer is re-proposing a block it saw +2/3 prevotes for.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Proposal {
    pub height: i64,
    pub round: i32,
    pub pol_round: i32,
    pub block_id: BlockId,
    pub timestamp: SystemTime,
    pub signature: Vec<u8>,
}

impl Proposal {
    pub fn new(height: i64, round: i32, pol_round: i32, block_id: BlockId) -> Self {
        Self {
            height,
            round,
            pol_round,
            block_id,
            timestamp: time::now(),
            signature: Vec::new(),
        }
    }

    pub fn validate_basic(&self) -> Result<(), ProposalError> {
        if self.height < 0 {
            return Err(ProposalError::NegativeHeight);
        }
        if self.round < 0 {
            return Err(ProposalError::NegativeRound);
        }
        if self.pol_round < -1 || (self.pol_round >= 0 && self.pol_round >= self.round) {
            return Err(ProposalError::InvalidPolRound {
                pol_round: self.pol_round,
                round: self.round,
            });
        }
        self.block_id.validate_basic()?;
        if !self.block_id.is_complete() {
            return Err(ProposalError::IncompleteBlockId(self.block_id.clone()));
        }
        if self.signature.is_empty() {
            return Err(ProposalError::MissingSignature);
        }
        if self.signature.len() > MAX_SIGNATURE_SIZE {
            return Err(ProposalError::SignatureTooBig(self.signature.len()));
        }
        Ok(())
    }

    pub fn sign_bytes(&self, chain_id: &str) -> Vec<u8> {
        p2p_proto::types::CanonicalProposal {
            r#type: SignedMsgType::Proposal as i32,
            height: self.height,
            round: self.round as i64,
            pol_round: self.pol_round as i64,
            block_id: self.block_id.to_canonical(),
            timestamp: Some(time::to_proto(self.timestamp)),
            chain_id: chain_id.to_owned(),
        }
        .encode_length_delimited_to_vec()
    }

    pub fn verify(&self, chain_id: &str, pub_key: &PublicKey) -> Result<(), ProposalError> {
        pub_key.verify(&self.sign_bytes(chain_id), &self.signature)?;
        Ok(())
    }

    pub fn to_proto(&self) -> p2p_proto::types::Proposal {
        p2p_proto::types::Proposal {
            r#type: SignedMsgType::Proposal as i32,
            height: self.height,
            round: self.round,
            pol_round: self.pol_round,
            block_id: Some(self.block_id.to_proto()),
            timestamp: Some(time::to_proto(self.timestamp)),
            signature: self.signature.clone(),
        }
    }

    pub fn from_proto(proto: p2p_proto::types::Proposal) -> Result<Self, ProposalError> {
        if proto.r#type != SignedMsgType::Proposal as i32 {
            return Err(ProposalError::InvalidType(proto.r#type));
        }
        Ok(Self {
            height: proto.height,
            round: proto.round,
            pol_round: proto.pol_round,
            block_id: BlockId::from_proto(proto.block_id),
            timestamp: time::from_proto(proto.timestamp.as_ref()),
            signature: proto.signature,
        })
    }
}

impl fmt::Display for Proposal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let signature = fmt_hex(&self.signature);
        write!(
            f,
            "Proposal{{{}/{} ({}, {}) {}}}",
            self.height,
            self.round,
            self.block_id,
            self.pol_round,
            &signature[..signature.len().min(12)],
        )
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use rstest::rstest;

    use super::*;
    use crate::block::PartSetHeader;
    use crate::part_set::MAX_BLOCK_PARTS_COUNT;

    fn proposal() -> Proposal {
        let mut p = Proposal::new(
            4,
            2,
            -1,
            BlockId::new(
                vec![1; 32],
                PartSetHeader {
                    total: 111,
                    hash: vec![2; 32],
                },
            ),
        );
        p.signature = vec![3; 64];
        p
    }

    #[rstest]
    #[case::no_pol(-1, true)]
    #[case::earlier_pol(1, true)]
    #[case::same_round_pol(2, false)]
    #[case::future_pol(3, false)]
    #[case::below_minus_one(-2, false)]
    fn pol_round_bounds(#[case] pol_round: i32, #[case] valid: bool) {
        let mut p = proposal();
        p.pol_round = pol_round;
        assert_eq!(p.validate_basic().is_ok(), valid);
    }

    #[test]
    fn too_many_parts_is_rejected() {
        let mut p = proposal();
        p.block_id.part_set_header.total = MAX_BLOCK_PARTS_COUNT + 1;
        assert_matches!(
            p.validate_basic(),
            Err(ProposalError::InvalidBlockId(BlockError::TooManyParts(_)))
        );
    }

    #[test]
    fn signature_round_trip() {
        let key = ed25519_consensus::SigningKey::from([7; 32]);
        let pub_key = PublicKey::from(key.verification_key());
        let mut p = proposal();
        p.signature = key.sign(&p.sign_bytes("test-chain")).to_bytes().to_vec();
        assert_eq!(p.verify("test-chain", &pub_key), Ok(()));

        p.round = 3;
        assert_matches!(
            p.verify("test-chain", &pub_key),
            Err(ProposalError::InvalidSignature(_))
        );
    }
}
