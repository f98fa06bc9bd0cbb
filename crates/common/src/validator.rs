use std::cmp::Ordering;
use std::fmt;

use ed25519_consensus::{Signature, VerificationKey, VerificationKeyBytes};
use prost::Message;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};

use crate::block::{BlockId, BlockIdFlag, Commit};
use crate::{fmt_hex, merkle};

pub const ADDRESS_SIZE: usize = 20;

/// Bounded so that sums of priorities and powers never overflow.
pub const MAX_TOTAL_VOTING_POWER: i64 = i64::MAX / 8;

/// Priorities are kept within this multiple of the total voting power.
const PRIORITY_WINDOW_SIZE_FACTOR: i64 = 2;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SignatureError {
    #[error("malformed public key")]
    MalformedKey,
    #[error("signature must be 64 bytes, got {0}")]
    MalformedSignature(usize),
    #[error("signature does not verify")]
    Invalid,
}

/// An ed25519 public key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PublicKey([u8; 32]);

impl PublicKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// The first 20 bytes of the SHA-256 of the key.
    pub fn address(&self) -> Vec<u8> {
        Sha256::digest(self.0)[..ADDRESS_SIZE].to_vec()
    }

    pub fn verify(&self, message: &[u8], signature: &[u8]) -> Result<(), SignatureError> {
        let key = VerificationKey::try_from(VerificationKeyBytes::from(self.0))
            .map_err(|_| SignatureError::MalformedKey)?;
        let bytes: [u8; 64] = signature
            .try_into()
            .map_err(|_| SignatureError::MalformedSignature(signature.len()))?;
        key.verify(&Signature::from(bytes), message)
            .map_err(|_| SignatureError::Invalid)
    }

    pub fn to_proto(&self) -> p2p_proto::crypto::PublicKey {
        p2p_proto::crypto::PublicKey {
            sum: Some(p2p_proto::crypto::public_key::Sum::Ed25519(self.0.to_vec())),
        }
    }
}

impl From<VerificationKey> for PublicKey {
    fn from(key: VerificationKey) -> Self {
        Self(key.to_bytes())
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PubKeyEd25519{{{}}}", fmt_hex(&self.0))
    }
}

impl Serialize for PublicKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(self.0))
    }
}

impl<'de> Deserialize<'de> for PublicKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        let bytes = hex::decode(s).map_err(serde::de::Error::custom)?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("public key must be 32 bytes"))?;
        Ok(Self(bytes))
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Validator {
    pub address: Vec<u8>,
    pub pub_key: PublicKey,
    pub voting_power: i64,
    pub proposer_priority: i64,
}

impl Validator {
    pub fn new(pub_key: PublicKey, voting_power: i64) -> Self {
        Self {
            address: pub_key.address(),
            pub_key,
            voting_power,
            proposer_priority: 0,
        }
    }

    /// Higher priority wins; ties go to the lower address.
    fn compare_proposer_priority(&self, other: &Validator) -> Ordering {
        self.proposer_priority
            .cmp(&other.proposer_priority)
            .then_with(|| other.address.cmp(&self.address))
    }

    fn hash_bytes(&self) -> Vec<u8> {
        p2p_proto::types::SimpleValidator {
            pub_key: Some(self.pub_key.to_proto()),
            voting_power: self.voting_power,
        }
        .encode_to_vec()
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ValidatorSetError {
    #[error("validator {0} has negative voting power")]
    NegativePower(String),
    #[error("duplicate validator {0} in change set")]
    Duplicate(String),
    #[error("cannot remove unknown validator {0}")]
    RemoveUnknown(String),
    #[error("total voting power {0} exceeds the maximum")]
    TotalPowerTooHigh(i64),
    #[error("applying changes would leave the validator set empty")]
    Empty,
    #[error("invalid commit: expected {expected} signatures, got {actual}")]
    CommitSize { expected: usize, actual: usize },
    #[error("invalid commit: {0}")]
    InvalidCommit(String),
    #[error("invalid commit signature from {address}: {source}")]
    InvalidCommitSignature {
        address: String,
        source: SignatureError,
    },
    #[error("not enough voting power signed: got {got}, needed more than {needed}")]
    NotEnoughVotingPower { got: i64, needed: i64 },
}

/// The validators of one height, ordered by voting power (descending) and
/// then address, with the proposer for the current round.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ValidatorSet {
    validators: Vec<Validator>,
    proposer: Option<Validator>,
    total_voting_power: i64,
}

impl ValidatorSet {
    pub fn new(validators: Vec<Validator>) -> Result<Self, ValidatorSetError> {
        let mut set = Self::default();
        if validators.is_empty() {
            return Ok(set);
        }
        set.update_with_change_set(validators, false)?;
        set.increment_proposer_priority(1);
        Ok(set)
    }

    pub fn validators(&self) -> &[Validator] {
        &self.validators
    }

    pub fn size(&self) -> usize {
        self.validators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.validators.is_empty()
    }

    pub fn total_voting_power(&self) -> i64 {
        self.total_voting_power
    }

    pub fn get_by_index(&self, index: i32) -> Option<&Validator> {
        usize::try_from(index)
            .ok()
            .and_then(|index| self.validators.get(index))
    }

    pub fn get_by_address(&self, address: &[u8]) -> Option<(i32, &Validator)> {
        self.validators
            .iter()
            .enumerate()
            .find(|(_, val)| val.address == address)
            .map(|(index, val)| (index as i32, val))
    }

    pub fn has_address(&self, address: &[u8]) -> bool {
        self.get_by_address(address).is_some()
    }

    pub fn get_proposer(&self) -> Option<&Validator> {
        self.proposer.as_ref()
    }

    pub fn hash(&self) -> Vec<u8> {
        let encoded: Vec<Vec<u8>> = self.validators.iter().map(Validator::hash_bytes).collect();
        merkle::hash_from_byte_slices(&encoded)
    }

    pub fn copy_increment_proposer_priority(&self, times: i32) -> Self {
        let mut copy = self.clone();
        copy.increment_proposer_priority(times);
        copy
    }

    /// Advances proposer selection by `times` rounds.
    pub fn increment_proposer_priority(&mut self, times: i32) {
        if self.validators.is_empty() {
            return;
        }
        assert!(times > 0, "cannot increment proposer priority by {times}");

        self.rescale_priorities(PRIORITY_WINDOW_SIZE_FACTOR * self.total_voting_power);
        self.shift_by_average_proposer_priority();

        let mut proposer = None;
        for _ in 0..times {
            proposer = self.increment_proposer_priority_once();
        }
        self.proposer = proposer;
    }

    fn increment_proposer_priority_once(&mut self) -> Option<Validator> {
        for val in self.validators.iter_mut() {
            val.proposer_priority = val.proposer_priority.saturating_add(val.voting_power);
        }
        let total = self.total_voting_power;
        let mostest = self
            .validators
            .iter_mut()
            .max_by(|a, b| a.compare_proposer_priority(b))?;
        mostest.proposer_priority = mostest.proposer_priority.saturating_sub(total);
        Some(mostest.clone())
    }

    fn rescale_priorities(&mut self, diff_max: i64) {
        if self.validators.is_empty() || diff_max <= 0 {
            return;
        }
        let max = self.validators.iter().map(|v| v.proposer_priority).max().unwrap_or(0);
        let min = self.validators.iter().map(|v| v.proposer_priority).min().unwrap_or(0);
        let diff = max.saturating_sub(min);
        if diff > diff_max {
            let ratio = (diff + diff_max - 1) / diff_max;
            for val in self.validators.iter_mut() {
                val.proposer_priority /= ratio;
            }
        }
    }

    fn shift_by_average_proposer_priority(&mut self) {
        if self.validators.is_empty() {
            return;
        }
        let sum: i128 = self
            .validators
            .iter()
            .map(|v| v.proposer_priority as i128)
            .sum();
        let average = (sum / self.validators.len() as i128) as i64;
        for val in self.validators.iter_mut() {
            val.proposer_priority = val.proposer_priority.saturating_sub(average);
        }
    }

    /// Applies validator updates: zero power removes a validator, anything
    /// else adds or updates it.
    pub fn update_with_change_set(
        &mut self,
        changes: Vec<Validator>,
        allow_deletes: bool,
    ) -> Result<(), ValidatorSetError> {
        let mut seen = std::collections::HashSet::new();
        for change in &changes {
            if change.voting_power < 0 {
                return Err(ValidatorSetError::NegativePower(fmt_hex(&change.address)));
            }
            if !seen.insert(change.address.clone()) {
                return Err(ValidatorSetError::Duplicate(fmt_hex(&change.address)));
            }
            if change.voting_power == 0 && (!allow_deletes || !self.has_address(&change.address)) {
                return Err(ValidatorSetError::RemoveUnknown(fmt_hex(&change.address)));
            }
        }

        let mut validators = self.validators.clone();
        let total_before = self.total_voting_power;
        for change in changes {
            match validators.iter_mut().find(|v| v.address == change.address) {
                Some(existing) if change.voting_power == 0 => {
                    existing.voting_power = 0;
                }
                Some(existing) => {
                    existing.voting_power = change.voting_power;
                    existing.pub_key = change.pub_key;
                }
                None => {
                    let mut added = change;
                    // Newcomers start behind everyone so they cannot propose
                    // right after joining.
                    let total = total_before.max(1);
                    added.proposer_priority = -(total + (total >> 3));
                    validators.push(added);
                }
            }
        }
        validators.retain(|v| v.voting_power > 0);
        if validators.is_empty() {
            return Err(ValidatorSetError::Empty);
        }

        let total: i64 = validators.iter().map(|v| v.voting_power).sum();
        if total > MAX_TOTAL_VOTING_POWER {
            return Err(ValidatorSetError::TotalPowerTooHigh(total));
        }
        validators.sort_by(|a, b| {
            b.voting_power
                .cmp(&a.voting_power)
                .then_with(|| a.address.cmp(&b.address))
        });

        self.validators = validators;
        self.total_voting_power = total;
        self.rescale_priorities(PRIORITY_WINDOW_SIZE_FACTOR * total);
        self.shift_by_average_proposer_priority();
        if let Some(proposer) = &self.proposer {
            self.proposer = self
                .validators
                .iter()
                .find(|v| v.address == proposer.address)
                .cloned();
        }
        Ok(())
    }

    /// Checks that +2/3 of this set signed `commit` for `block_id` at
    /// `height`.
    pub fn verify_commit(
        &self,
        chain_id: &str,
        block_id: &BlockId,
        height: i64,
        commit: &Commit,
    ) -> Result<(), ValidatorSetError> {
        if commit.signatures.len() != self.size() {
            return Err(ValidatorSetError::CommitSize {
                expected: self.size(),
                actual: commit.signatures.len(),
            });
        }
        if commit.height != height {
            return Err(ValidatorSetError::InvalidCommit(format!(
                "commit is for height {}, expected {height}",
                commit.height
            )));
        }
        if &commit.block_id != block_id {
            return Err(ValidatorSetError::InvalidCommit(format!(
                "commit is for block {}, expected {block_id}",
                commit.block_id
            )));
        }

        let mut tallied = 0i64;
        let needed = self.total_voting_power * 2 / 3;
        for (index, sig) in commit.signatures.iter().enumerate() {
            if sig.block_id_flag == BlockIdFlag::Absent {
                continue;
            }
            let val = &self.validators[index];
            let vote = commit.get_vote(index as i32);
            val.pub_key
                .verify(&vote.sign_bytes(chain_id), &sig.signature)
                .map_err(|source| ValidatorSetError::InvalidCommitSignature {
                    address: fmt_hex(&val.address),
                    source,
                })?;
            if sig.block_id_flag == BlockIdFlag::Commit {
                tallied += val.voting_power;
            }
        }
        if tallied <= needed {
            return Err(ValidatorSetError::NotEnoughVotingPower {
                got: tallied,
                needed,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use assert_matches::assert_matches;

    use super::*;

    fn validator(seed: u8, power: i64) -> Validator {
        let key = ed25519_consensus::SigningKey::from([seed; 32]);
        Validator::new(key.verification_key().into(), power)
    }

    #[test]
    fn validators_are_sorted_by_power_then_address() {
        let set = ValidatorSet::new(vec![validator(1, 1), validator(2, 5), validator(3, 1)]).unwrap();
        assert_eq!(set.validators()[0].voting_power, 5);
        assert!(set.validators()[1].address < set.validators()[2].address);
        assert_eq!(set.total_voting_power(), 7);
    }

    #[test]
    fn proposer_rotation_is_proportional_to_power() {
        let mut set = ValidatorSet::new(vec![validator(1, 1), validator(2, 2), validator(3, 3)]).unwrap();
        let mut counts: HashMap<Vec<u8>, usize> = HashMap::new();
        for _ in 0..600 {
            let proposer = set.get_proposer().unwrap().address.clone();
            *counts.entry(proposer).or_default() += 1;
            set.increment_proposer_priority(1);
        }
        let mut seen: Vec<usize> = counts.values().copied().collect();
        seen.sort();
        assert_eq!(seen, vec![100, 200, 300]);
    }

    #[test]
    fn zero_power_update_removes_validator() {
        let a = validator(1, 1);
        let b = validator(2, 1);
        let mut set = ValidatorSet::new(vec![a.clone(), b.clone()]).unwrap();
        set.update_with_change_set(vec![Validator::new(a.pub_key, 0)], true)
            .unwrap();
        assert_eq!(set.size(), 1);
        assert!(set.has_address(&b.address));

        assert_matches!(
            set.update_with_change_set(vec![Validator::new(b.pub_key, 0)], true),
            Err(ValidatorSetError::Empty)
        );
    }
}
