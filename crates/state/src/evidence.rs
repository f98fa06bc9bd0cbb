use std::collections::HashSet;
use std::sync::Arc;
use std::time::SystemTime;

use meridian_common::evidence::EvidenceError;
use meridian_common::{DuplicateVoteEvidence, Vote, VoteError, VoteType};
use parking_lot::Mutex;

use crate::{BlockStore, State, Store, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum InvalidEvidenceError {
    #[error(transparent)]
    Malformed(#[from] EvidenceError),
    #[error("evidence at height {0} was already committed")]
    Committed(i64),
    #[error("evidence listed twice in the same block")]
    Duplicate,
    #[error("evidence from height {height} is too old, last block is {last_height}")]
    Expired { height: i64, last_height: i64 },
    #[error("evidence is from height {height} which is above the last block {last_height}")]
    FromFuture { height: i64, last_height: i64 },
    #[error("validator {0} was not in the set at the evidence height")]
    UnknownValidator(String),
    #[error("evidence reports power {reported}, validator had {actual}")]
    PowerMismatch { reported: i64, actual: i64 },
    #[error("evidence reports total power {reported}, set had {actual}")]
    TotalPowerMismatch { reported: i64, actual: i64 },
    #[error("evidence vote has an invalid signature: {0}")]
    Signature(#[from] VoteError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Collects and verifies evidence of validator misbehaviour.
pub trait EvidencePool: Send + Sync {
    /// Verified evidence not yet committed, up to `max_bytes` in total
    /// encoded size (approximated per item). Returns the evidence and its
    /// size.
    fn pending_evidence(&self, max_bytes: i64) -> (Vec<DuplicateVoteEvidence>, i64);

    /// Verifies the evidence included in a proposed block.
    fn check_evidence(&self, evidence: &[DuplicateVoteEvidence]) -> Result<(), InvalidEvidenceError>;

    /// Called after each commit with the new state and the evidence the
    /// committed block included.
    fn update(&self, state: &State, committed: &[DuplicateVoteEvidence]);

    /// Records two conflicting votes seen by consensus. Evidence is built
    /// from them at the next [`EvidencePool::update`], once the block time of
    /// their height is known.
    fn report_conflicting_votes(&self, vote_a: Vote, vote_b: Vote);
}

#[derive(Clone, Copy, Debug, Default)]
pub struct EmptyEvidencePool;

impl EvidencePool for EmptyEvidencePool {
    fn pending_evidence(&self, _max_bytes: i64) -> (Vec<DuplicateVoteEvidence>, i64) {
        (Vec::new(), 0)
    }

    fn check_evidence(&self, _evidence: &[DuplicateVoteEvidence]) -> Result<(), InvalidEvidenceError> {
        Ok(())
    }

    fn update(&self, _state: &State, _committed: &[DuplicateVoteEvidence]) {}

    fn report_conflicting_votes(&self, _vote_a: Vote, _vote_b: Vote) {}
}

/// Misbehaviour is identified by who misbehaved and where, not by the exact
/// pair of votes.
type EvidenceKey = (i64, i32, VoteType, Vec<u8>);

fn key(evidence: &DuplicateVoteEvidence) -> EvidenceKey {
    let vote = &evidence.vote_a;
    (
        vote.height,
        vote.round,
        vote.vote_type,
        vote.validator_address.clone(),
    )
}

/// Rough encoded size: two votes with signatures plus the fixed fields.
const EVIDENCE_SIZE_ESTIMATE: i64 = 2 * 200 + 40;

#[derive(Default)]
struct Inner {
    pending: Vec<DuplicateVoteEvidence>,
    committed: HashSet<EvidenceKey>,
    buffer: Vec<(Vote, Vote)>,
    state: Option<State>,
}

/// An in-memory evidence pool. Committed evidence is remembered for as long
/// as it could still be replayed, bounded by the evidence max age.
pub struct MemoryEvidencePool {
    state_store: Arc<dyn Store>,
    block_store: Arc<dyn BlockStore>,
    inner: Mutex<Inner>,
}

impl MemoryEvidencePool {
    pub fn new(state_store: Arc<dyn Store>, block_store: Arc<dyn BlockStore>) -> Self {
        let state = state_store.load();
        Self {
            state_store,
            block_store,
            inner: Mutex::new(Inner {
                state,
                ..Default::default()
            }),
        }
    }

    fn is_expired(state: &State, height: i64, time: SystemTime) -> bool {
        let params = &state.consensus_params.evidence;
        let too_many_blocks = state.last_block_height - height > params.max_age_num_blocks;
        let too_much_time = state
            .last_block_time
            .duration_since(time)
            .map(|age| age > params.max_age_duration)
            .unwrap_or(false);
        too_many_blocks && too_much_time
    }

    fn verify(&self, state: &State, evidence: &DuplicateVoteEvidence) -> Result<(), InvalidEvidenceError> {
        evidence.validate_basic()?;
        let height = evidence.height();
        if height > state.last_block_height {
            return Err(InvalidEvidenceError::FromFuture {
                height,
                last_height: state.last_block_height,
            });
        }
        if Self::is_expired(state, height, evidence.timestamp) {
            return Err(InvalidEvidenceError::Expired {
                height,
                last_height: state.last_block_height,
            });
        }

        let validators = self.state_store.load_validators(height)?;
        let address = &evidence.vote_a.validator_address;
        let (_, validator) = validators
            .get_by_address(address)
            .ok_or_else(|| InvalidEvidenceError::UnknownValidator(meridian_common::fmt_hex(address)))?;
        if validator.voting_power != evidence.validator_power {
            return Err(InvalidEvidenceError::PowerMismatch {
                reported: evidence.validator_power,
                actual: validator.voting_power,
            });
        }
        if validators.total_voting_power() != evidence.total_voting_power {
            return Err(InvalidEvidenceError::TotalPowerMismatch {
                reported: evidence.total_voting_power,
                actual: validators.total_voting_power(),
            });
        }
        evidence.vote_a.verify(&state.chain_id, &validator.pub_key)?;
        evidence.vote_b.verify(&state.chain_id, &validator.pub_key)?;
        Ok(())
    }

    fn process_buffer(&self, inner: &mut Inner, state: &State) {
        let buffer = std::mem::take(&mut inner.buffer);
        for (vote_a, vote_b) in buffer {
            let height = vote_a.height;
            let Some(meta) = self.block_store.load_block_meta(height) else {
                if height > state.last_block_height {
                    inner.buffer.push((vote_a, vote_b));
                }
                continue;
            };
            let validators = match self.state_store.load_validators(height) {
                Ok(validators) => validators,
                Err(error) => {
                    tracing::debug!(%height, %error, "Dropping conflicting votes");
                    continue;
                }
            };
            let Some((_, validator)) = validators.get_by_address(&vote_a.validator_address) else {
                continue;
            };
            let evidence = DuplicateVoteEvidence::new(
                vote_a,
                vote_b,
                meta.header.time,
                validators.total_voting_power(),
                validator.voting_power,
            );
            let key = key(&evidence);
            if inner.committed.contains(&key) || inner.pending.iter().any(|ev| self::key(ev) == key) {
                continue;
            }
            match self.verify(state, &evidence) {
                Ok(()) => {
                    tracing::info!(%height, validator = %meridian_common::fmt_hex(&key.3), "Verified new evidence of byzantine behaviour");
                    inner.pending.push(evidence);
                }
                Err(error) => tracing::debug!(%height, %error, "Built invalid evidence from conflicting votes"),
            }
        }
    }

    pub fn size(&self) -> usize {
        self.inner.lock().pending.len()
    }
}

impl EvidencePool for MemoryEvidencePool {
    fn pending_evidence(&self, max_bytes: i64) -> (Vec<DuplicateVoteEvidence>, i64) {
        let inner = self.inner.lock();
        let mut size = 0;
        let mut evidence = Vec::new();
        for ev in &inner.pending {
            if max_bytes > -1 && size + EVIDENCE_SIZE_ESTIMATE > max_bytes {
                break;
            }
            size += EVIDENCE_SIZE_ESTIMATE;
            evidence.push(ev.clone());
        }
        (evidence, size)
    }

    fn check_evidence(&self, evidence: &[DuplicateVoteEvidence]) -> Result<(), InvalidEvidenceError> {
        let inner = self.inner.lock();
        let mut seen = HashSet::new();
        for ev in evidence {
            let key = key(ev);
            if !seen.insert(key.clone()) {
                return Err(InvalidEvidenceError::Duplicate);
            }
            if inner.committed.contains(&key) {
                return Err(InvalidEvidenceError::Committed(ev.height()));
            }
            if inner.pending.contains(ev) {
                continue;
            }
            let state = inner
                .state
                .clone()
                .or_else(|| self.state_store.load())
                .unwrap_or_default();
            self.verify(&state, ev)?;
        }
        Ok(())
    }

    fn update(&self, state: &State, committed: &[DuplicateVoteEvidence]) {
        let mut inner = self.inner.lock();
        for ev in committed {
            let key = key(ev);
            inner.pending.retain(|pending| self::key(pending) != key);
            inner.committed.insert(key);
        }
        inner
            .pending
            .retain(|ev| !Self::is_expired(state, ev.height(), ev.timestamp));
        let max_age = state.consensus_params.evidence.max_age_num_blocks;
        inner
            .committed
            .retain(|(height, ..)| state.last_block_height - height <= max_age);
        inner.state = Some(state.clone());
        self.process_buffer(&mut inner, state);
    }

    fn report_conflicting_votes(&self, vote_a: Vote, vote_b: Vote) {
        self.inner.lock().buffer.push((vote_a, vote_b));
    }
}

#[cfg(test)]
mod tests {
    use std::time::SystemTime;

    use assert_matches::assert_matches;
    use meridian_common::{Block, BlockId, Commit, PartSetHeader, BLOCK_PART_SIZE_BYTES};

    use super::*;
    use crate::test_utils::{genesis, signing_key};
    use crate::{MemoryBlockStore, MemoryStore};

    fn signed_vote(state: &State, seed: u8, hash: u8) -> Vote {
        let key = signing_key(seed);
        let address = meridian_common::PublicKey::from(key.verification_key()).address();
        let (index, _) = state.validators.get_by_address(&address).unwrap();
        let mut vote = Vote {
            vote_type: VoteType::Prevote,
            height: 1,
            round: 0,
            block_id: BlockId::new(
                vec![hash; 32],
                PartSetHeader {
                    total: 1,
                    hash: vec![hash; 32],
                },
            ),
            timestamp: SystemTime::UNIX_EPOCH,
            validator_address: address,
            validator_index: index,
            signature: Vec::new(),
        };
        vote.signature = key.sign(&vote.sign_bytes(&state.chain_id)).to_bytes().to_vec();
        vote
    }

    fn committed_block(state: &State, store: &MemoryBlockStore) -> Block {
        let proposer = state.validators.validators()[0].address.clone();
        let block = state.make_block(1, SystemTime::now(), Vec::new(), Commit::default(), Vec::new(), proposer);
        let parts = block.make_part_set(BLOCK_PART_SIZE_BYTES);
        store.save_block(Arc::new(block.clone()), &parts, Commit::default());
        block
    }

    #[test]
    fn conflicting_votes_become_pending_evidence() {
        let genesis_state = State::from_genesis(&genesis(2)).unwrap();
        let state_store = MemoryStore::new();
        state_store.save(&genesis_state);
        let block_store = MemoryBlockStore::new();
        let pool = MemoryEvidencePool::new(Arc::new(state_store), Arc::new(block_store.clone()));

        pool.report_conflicting_votes(signed_vote(&genesis_state, 1, 1), signed_vote(&genesis_state, 1, 2));
        let block = committed_block(&genesis_state, &block_store);

        let mut state = genesis_state.clone();
        state.last_block_height = 1;
        state.last_block_time = block.header.time;
        pool.update(&state, &[]);

        let (pending, size) = pool.pending_evidence(-1);
        assert_eq!(pending.len(), 1);
        assert!(size > 0);
        pool.check_evidence(&pending).unwrap();
        assert_matches!(
            pool.check_evidence(&[pending[0].clone(), pending[0].clone()]),
            Err(InvalidEvidenceError::Duplicate)
        );

        state.last_block_height = 2;
        pool.update(&state, &pending);
        assert_eq!(pool.size(), 0);
        assert_matches!(pool.check_evidence(&pending), Err(InvalidEvidenceError::Committed(1)));
    }

    #[test]
    fn forged_evidence_is_rejected() {
        let genesis_state = State::from_genesis(&genesis(2)).unwrap();
        let state_store = MemoryStore::new();
        state_store.save(&genesis_state);
        let pool = MemoryEvidencePool::new(Arc::new(state_store), Arc::new(MemoryBlockStore::new()));
        let mut state = genesis_state.clone();
        state.last_block_height = 1;
        pool.update(&state, &[]);

        let vote_a = signed_vote(&genesis_state, 1, 1);
        let mut vote_b = signed_vote(&genesis_state, 1, 2);
        vote_b.signature = vec![0; 64];
        let total = genesis_state.validators.total_voting_power();
        let evidence = DuplicateVoteEvidence::new(vote_a, vote_b, SystemTime::now(), total, 10);
        assert_matches!(pool.check_evidence(&[evidence]), Err(InvalidEvidenceError::Signature(_)));
    }
}
