use std::collections::BTreeMap;
use std::sync::Arc;

use meridian_abci::ResponseFinalizeBlock;
use meridian_common::{ConsensusParams, ValidatorSet};
use parking_lot::RwLock;

use crate::State;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("no validator set stored for height {0}")]
    NoValidatorsForHeight(i64),
    #[error("no consensus params stored for height {0}")]
    NoParamsForHeight(i64),
    #[error("no FinalizeBlock response stored for height {0}")]
    NoFinalizeBlockResponse(i64),
}

/// Persistence of the chain [`State`] and of the per-height data derived
/// from it.
pub trait Store: Send + Sync {
    /// The last saved state, if any.
    fn load(&self) -> Option<State>;

    /// Saves the state together with the validators and params it fixes
    /// for the next heights.
    fn save(&self, state: &State);

    /// Saves a state that was not reached by executing blocks, such as one
    /// obtained from a snapshot. Also records the last validators.
    fn bootstrap(&self, state: &State);

    fn load_validators(&self, height: i64) -> Result<ValidatorSet, StoreError>;

    fn load_consensus_params(&self, height: i64) -> Result<ConsensusParams, StoreError>;

    fn save_finalize_block_response(&self, height: i64, response: &ResponseFinalizeBlock);

    fn load_finalize_block_response(&self, height: i64) -> Result<ResponseFinalizeBlock, StoreError>;

    /// Drops per-height data below `retain_height`.
    fn prune_states(&self, retain_height: i64);
}

#[derive(Default)]
struct Inner {
    state: Option<State>,
    validators: BTreeMap<i64, ValidatorSet>,
    params: BTreeMap<i64, ConsensusParams>,
    responses: BTreeMap<i64, ResponseFinalizeBlock>,
}

/// A [`Store`] kept in memory. Clones share the same data, so a store
/// outlives any one consumer.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<RwLock<Inner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Store for MemoryStore {
    fn load(&self) -> Option<State> {
        self.inner.read().state.clone()
    }

    fn save(&self, state: &State) {
        let next_height = state.next_height();
        let mut inner = self.inner.write();
        inner.validators.insert(next_height, state.validators.clone());
        inner
            .validators
            .insert(next_height + 1, state.next_validators.clone());
        inner
            .params
            .insert(next_height, state.consensus_params.clone());
        inner.state = Some(state.clone());
    }

    fn bootstrap(&self, state: &State) {
        if state.last_block_height > 0 {
            self.inner
                .write()
                .validators
                .insert(state.last_block_height, state.last_validators.clone());
        }
        self.save(state);
    }

    fn load_validators(&self, height: i64) -> Result<ValidatorSet, StoreError> {
        self.inner
            .read()
            .validators
            .get(&height)
            .cloned()
            .ok_or(StoreError::NoValidatorsForHeight(height))
    }

    fn load_consensus_params(&self, height: i64) -> Result<ConsensusParams, StoreError> {
        let inner = self.inner.read();
        // Params are only written when they change, so fall back to the
        // latest ones at or below `height`.
        inner
            .params
            .range(..=height)
            .next_back()
            .map(|(_, params)| params.clone())
            .ok_or(StoreError::NoParamsForHeight(height))
    }

    fn save_finalize_block_response(&self, height: i64, response: &ResponseFinalizeBlock) {
        self.inner.write().responses.insert(height, response.clone());
    }

    fn load_finalize_block_response(&self, height: i64) -> Result<ResponseFinalizeBlock, StoreError> {
        self.inner
            .read()
            .responses
            .get(&height)
            .cloned()
            .ok_or(StoreError::NoFinalizeBlockResponse(height))
    }

    fn prune_states(&self, retain_height: i64) {
        let mut inner = self.inner.write();
        inner.validators = inner.validators.split_off(&retain_height);
        inner.responses = inner.responses.split_off(&retain_height);
        // Keep the params in effect at the retain height.
        if let Some(keep) = inner.params.range(..=retain_height).next_back().map(|(h, _)| *h) {
            inner.params = inner.params.split_off(&keep);
        }
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;
    use crate::test_utils::genesis;

    #[test]
    fn save_records_validators_for_next_two_heights() {
        let store = MemoryStore::new();
        assert_eq!(store.load(), None);

        let state = State::from_genesis(&genesis(2)).unwrap();
        store.save(&state);
        assert_eq!(store.load().as_ref(), Some(&state));
        assert_eq!(store.load_validators(1).unwrap(), state.validators);
        assert_eq!(store.load_validators(2).unwrap(), state.next_validators);
        assert_matches!(store.load_validators(3), Err(StoreError::NoValidatorsForHeight(3)));
        assert_eq!(store.load_consensus_params(7).unwrap(), state.consensus_params);
    }

    #[test]
    fn clones_share_data() {
        let store = MemoryStore::new();
        let clone = store.clone();
        store.save_finalize_block_response(3, &ResponseFinalizeBlock::default());
        assert!(clone.load_finalize_block_response(3).is_ok());

        clone.prune_states(4);
        assert_matches!(
            store.load_finalize_block_response(3),
            Err(StoreError::NoFinalizeBlockResponse(3))
        );
    }
}
