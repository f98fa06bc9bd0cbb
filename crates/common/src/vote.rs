use std::fmt;
use std::time::SystemTime;

use p2p_proto::types::SignedMsgType;
use prost::Message;

use crate::block::{BlockError, BlockId, BlockIdFlag, Commit, CommitSig};
use crate::validator::{PublicKey, SignatureError, ADDRESS_SIZE};
use crate::{fmt_hex, time};

pub const MAX_SIGNATURE_SIZE: usize = 64;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum VoteType {
    Prevote,
    Precommit,
}

impl VoteType {
    pub fn to_proto(self) -> SignedMsgType {
        match self {
            VoteType::Prevote => SignedMsgType::Prevote,
            VoteType::Precommit => SignedMsgType::Precommit,
        }
    }

    pub fn from_proto(value: i32) -> Result<Self, VoteError> {
        match SignedMsgType::try_from(value) {
            Ok(SignedMsgType::Prevote) => Ok(VoteType::Prevote),
            Ok(SignedMsgType::Precommit) => Ok(VoteType::Precommit),
            _ => Err(VoteError::InvalidType(value)),
        }
    }
}

impl fmt::Display for VoteType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VoteType::Prevote => f.write_str("Prevote"),
            VoteType::Precommit => f.write_str("Precommit"),
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum VoteError {
    #[error("invalid vote type {0}")]
    InvalidType(i32),
    #[error("negative height")]
    NegativeHeight,
    #[error("negative round")]
    NegativeRound,
    #[error("negative validator index")]
    NegativeValidatorIndex,
    #[error("wrong block id: {0}")]
    InvalidBlockId(#[from] BlockError),
    #[error("block id must be either empty or complete, got {0}")]
    IncompleteBlockId(BlockId),
    #[error("validator address has {0} bytes, expected {ADDRESS_SIZE}")]
    InvalidValidatorAddress(usize),
    #[error("signature is missing")]
    MissingSignature,
    #[error("signature is too big: {0} bytes, max {MAX_SIGNATURE_SIZE}")]
    SignatureTooBig(usize),
    #[error("validator address does not match public key")]
    ValidatorAddressMismatch,
    #[error("invalid signature: {0}")]
    InvalidSignature(#[from] SignatureError),
}

/// A signed prevote or precommit from one validator.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Vote {
    pub vote_type: VoteType,
    pub height: i64,
    pub round: i32,
    pub block_id: BlockId,
    pub timestamp: SystemTime,
    pub validator_address: Vec<u8>,
    pub validator_index: i32,
    pub signature: Vec<u8>,
}

impl Vote {
    pub fn sign_bytes(&self, chain_id: &str) -> Vec<u8> {
        p2p_proto::types::CanonicalVote {
            r#type: self.vote_type.to_proto() as i32,
            height: self.height,
            round: self.round as i64,
            block_id: self.block_id.to_canonical(),
            timestamp: Some(time::to_proto(self.timestamp)),
            chain_id: chain_id.to_owned(),
        }
        .encode_length_delimited_to_vec()
    }

    pub fn verify(&self, chain_id: &str, pub_key: &PublicKey) -> Result<(), VoteError> {
        if pub_key.address() != self.validator_address {
            return Err(VoteError::ValidatorAddressMismatch);
        }
        pub_key.verify(&self.sign_bytes(chain_id), &self.signature)?;
        Ok(())
    }

    pub fn validate_basic(&self) -> Result<(), VoteError> {
        if self.height < 0 {
            return Err(VoteError::NegativeHeight);
        }
        if self.round < 0 {
            return Err(VoteError::NegativeRound);
        }
        self.block_id.validate_basic()?;
        if !self.block_id.is_nil() && !self.block_id.is_complete() {
            return Err(VoteError::IncompleteBlockId(self.block_id.clone()));
        }
        if self.validator_address.len() != ADDRESS_SIZE {
            return Err(VoteError::InvalidValidatorAddress(
                self.validator_address.len(),
            ));
        }
        if self.validator_index < 0 {
            return Err(VoteError::NegativeValidatorIndex);
        }
        if self.signature.is_empty() {
            return Err(VoteError::MissingSignature);
        }
        if self.signature.len() > MAX_SIGNATURE_SIZE {
            return Err(VoteError::SignatureTooBig(self.signature.len()));
        }
        Ok(())
    }

    pub fn commit_sig(&self) -> CommitSig {
        let block_id_flag = if self.block_id.is_complete() {
            BlockIdFlag::Commit
        } else {
            BlockIdFlag::Nil
        };
        CommitSig {
            block_id_flag,
            validator_address: self.validator_address.clone(),
            timestamp: self.timestamp,
            signature: self.signature.clone(),
        }
    }

    pub fn to_proto(&self) -> p2p_proto::types::Vote {
        p2p_proto::types::Vote {
            r#type: self.vote_type.to_proto() as i32,
            height: self.height,
            round: self.round,
            block_id: Some(self.block_id.to_proto()),
            timestamp: Some(time::to_proto(self.timestamp)),
            validator_address: self.validator_address.clone(),
            validator_index: self.validator_index,
            signature: self.signature.clone(),
        }
    }

    pub fn from_proto(proto: p2p_proto::types::Vote) -> Result<Self, VoteError> {
        Ok(Self {
            vote_type: VoteType::from_proto(proto.r#type)?,
            height: proto.height,
            round: proto.round,
            block_id: BlockId::from_proto(proto.block_id),
            timestamp: time::from_proto(proto.timestamp.as_ref()),
            validator_address: proto.validator_address,
            validator_index: proto.validator_index,
            signature: proto.signature,
        })
    }
}

impl fmt::Display for Vote {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let address = fmt_hex(&self.validator_address);
        let signature = fmt_hex(&self.signature);
        write!(
            f,
            "Vote{{{}:{} {}/{:02}/{}({}) {}}}",
            self.validator_index,
            &address[..address.len().min(12)],
            self.height,
            self.round,
            self.vote_type,
            self.block_id,
            &signature[..signature.len().min(12)],
        )
    }
}

impl Commit {
    /// Rebuilds the precommit of the validator at `index` from the commit.
    pub fn get_vote(&self, index: i32) -> Vote {
        let sig = usize::try_from(index)
            .ok()
            .and_then(|i| self.signatures.get(i))
            .cloned()
            .unwrap_or_else(CommitSig::absent);
        Vote {
            vote_type: VoteType::Precommit,
            height: self.height,
            round: self.round,
            block_id: sig.block_id(&self.block_id),
            timestamp: sig.timestamp,
            validator_address: sig.validator_address,
            validator_index: index,
            signature: sig.signature,
        }
    }
}
