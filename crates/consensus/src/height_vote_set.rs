use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use meridian_common::{BlockId, NodeId, ValidatorSet, Vote, VoteSet, VoteSetError, VoteSetReader, VoteType};

/// How many rounds beyond the ones we track a single peer may make us
/// allocate vote sets for.
pub const MAX_CATCHUP_ROUNDS: usize = 2;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum HeightVoteSetError {
    #[error("peer has sent a vote that does not match our round for more than one round")]
    GotVoteFromUnwantedRound,
    #[error(transparent)]
    VoteSet(#[from] VoteSetError),
}

#[derive(Clone, Debug)]
struct RoundVoteSet {
    prevotes: VoteSet,
    precommits: VoteSet,
}

/// The prevotes and precommits of every round of one height.
///
/// Rounds up to the current one plus the previous are always tracked. Peers
/// may introduce votes of other rounds, to help us catch up, but each peer
/// only for [`MAX_CATCHUP_ROUNDS`] rounds.
#[derive(Clone, Debug, Default)]
pub struct HeightVoteSet {
    chain_id: String,
    height: i64,
    validators: Arc<ValidatorSet>,
    /// Highest round tracked because of our own progress.
    round: i32,
    round_vote_sets: BTreeMap<i32, RoundVoteSet>,
    peer_catchup_rounds: HashMap<NodeId, Vec<i32>>,
    /// Bumped on every change; never goes back.
    changes: u64,
}

impl HeightVoteSet {
    pub fn new(chain_id: impl Into<String>, height: i64, validators: Arc<ValidatorSet>) -> Self {
        let mut set = Self {
            chain_id: chain_id.into(),
            ..Default::default()
        };
        set.reset(height, validators);
        set
    }

    /// Drops all votes and starts over at round 0 of `height`.
    pub fn reset(&mut self, height: i64, validators: Arc<ValidatorSet>) {
        self.height = height;
        self.validators = validators;
        self.round_vote_sets.clear();
        self.peer_catchup_rounds.clear();
        self.add_round(0);
        self.round = 0;
        self.changes += 1;
    }

    pub fn height(&self) -> i64 {
        self.height
    }

    pub fn round(&self) -> i32 {
        self.round
    }

    /// Differs whenever votes, tracked rounds or +2/3 claims changed.
    pub fn changes(&self) -> u64 {
        self.changes
    }

    /// Tracks every round up to `round`. Rounds only move forward.
    pub fn set_round(&mut self, round: i32) {
        debug_assert!(
            self.round == 0 || round >= self.round - 1,
            "set_round must not go back"
        );
        for r in (self.round - 1).max(0)..=round {
            if !self.round_vote_sets.contains_key(&r) {
                self.add_round(r);
            }
        }
        self.round = round;
        self.changes += 1;
    }

    fn add_round(&mut self, round: i32) {
        let new_set = |vote_type| {
            VoteSet::new(
                self.chain_id.clone(),
                self.height,
                round,
                vote_type,
                self.validators.clone(),
            )
        };
        let round_vote_set = RoundVoteSet {
            prevotes: new_set(VoteType::Prevote),
            precommits: new_set(VoteType::Precommit),
        };
        self.round_vote_sets.insert(round, round_vote_set);
    }

    /// Adds a vote, from `peer` or from ourselves when `peer` is empty.
    /// Returns whether the vote was new.
    pub fn add_vote(&mut self, vote: Vote, peer: &NodeId) -> Result<bool, HeightVoteSetError> {
        if !self.round_vote_sets.contains_key(&vote.round) {
            let rounds = self.peer_catchup_rounds.entry(peer.clone()).or_default();
            if rounds.len() >= MAX_CATCHUP_ROUNDS {
                return Err(HeightVoteSetError::GotVoteFromUnwantedRound);
            }
            rounds.push(vote.round);
            self.add_round(vote.round);
        }
        let vote_set = self
            .vote_set_mut(vote.round, vote.vote_type)
            .expect("round was just added");
        let added = vote_set.add_vote(vote);
        if matches!(added, Ok(true) | Err(VoteSetError::ConflictingVote { added: true, .. })) {
            self.changes += 1;
        }
        Ok(added?)
    }

    pub fn prevotes(&self, round: i32) -> Option<&VoteSet> {
        self.vote_set(round, VoteType::Prevote)
    }

    pub fn precommits(&self, round: i32) -> Option<&VoteSet> {
        self.vote_set(round, VoteType::Precommit)
    }

    pub fn vote_set(&self, round: i32, vote_type: VoteType) -> Option<&VoteSet> {
        let round_vote_set = self.round_vote_sets.get(&round)?;
        Some(match vote_type {
            VoteType::Prevote => &round_vote_set.prevotes,
            VoteType::Precommit => &round_vote_set.precommits,
        })
    }

    fn vote_set_mut(&mut self, round: i32, vote_type: VoteType) -> Option<&mut VoteSet> {
        let round_vote_set = self.round_vote_sets.get_mut(&round)?;
        Some(match vote_type {
            VoteType::Prevote => &mut round_vote_set.prevotes,
            VoteType::Precommit => &mut round_vote_set.precommits,
        })
    }

    /// The last round, up to the current one, with +2/3 prevotes for a
    /// single block (possibly nil), and that block.
    pub fn pol_info(&self) -> Option<(i32, BlockId)> {
        (0..=self.round).rev().find_map(|round| {
            let block_id = self.prevotes(round)?.two_thirds_majority()?;
            Some((round, block_id.clone()))
        })
    }

    /// Records that `peer` claims +2/3 for `block_id`. Claims for rounds we
    /// do not track are ignored.
    pub fn set_peer_maj23(
        &mut self,
        round: i32,
        vote_type: VoteType,
        peer: NodeId,
        block_id: BlockId,
    ) -> Result<(), HeightVoteSetError> {
        let Some(vote_set) = self.vote_set_mut(round, vote_type) else {
            return Ok(());
        };
        vote_set.set_peer_maj23(peer, block_id)?;
        self.changes += 1;
        Ok(())
    }

    /// Rounds with votes, ascending.
    pub fn rounds(&self) -> impl Iterator<Item = i32> + '_ {
        self.round_vote_sets.keys().copied()
    }
}

impl std::fmt::Display for HeightVoteSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "HeightVoteSet{{H:{} R:0~{}", self.height, self.round)?;
        for (round, set) in &self.round_vote_sets {
            write!(
                f,
                " {round}:[{} {}]",
                set.prevotes.bit_array(),
                set.precommits.bit_array()
            )?;
        }
        f.write_str("}")
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;
    use crate::test_utils::{block_id, Validators, CHAIN_ID};

    #[test]
    fn peers_may_only_introduce_a_few_catchup_rounds() {
        let validators = Validators::new(4);
        let mut votes = HeightVoteSet::new(CHAIN_ID, 1, validators.set());
        let peer = NodeId::from("peer1");

        for round in [999, 1000] {
            let vote = validators.vote(0, 1, round, VoteType::Prevote, block_id(1));
            assert_eq!(votes.add_vote(vote, &peer), Ok(true));
        }

        let vote = validators.vote(0, 1, 1001, VoteType::Prevote, block_id(1));
        assert_matches!(
            votes.add_vote(vote.clone(), &peer),
            Err(HeightVoteSetError::GotVoteFromUnwantedRound)
        );
        assert!(votes.prevotes(1001).is_none());

        // Another peer still has its own allowance.
        assert_eq!(votes.add_vote(vote, &NodeId::from("peer2")), Ok(true));
        assert!(votes.prevotes(1001).is_some());
    }

    #[test]
    fn votes_of_tracked_rounds_do_not_count_as_catchup() {
        let validators = Validators::new(4);
        let mut votes = HeightVoteSet::new(CHAIN_ID, 1, validators.set());
        votes.set_round(3);
        let peer = NodeId::from("peer");
        for round in 0..=3 {
            let vote = validators.vote(1, 1, round, VoteType::Precommit, block_id(2));
            assert_eq!(votes.add_vote(vote, &peer), Ok(true));
        }
        assert_eq!(votes.rounds().collect::<Vec<_>>(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn pol_info_finds_the_latest_polka() {
        let validators = Validators::new(4);
        let mut votes = HeightVoteSet::new(CHAIN_ID, 1, validators.set());
        votes.set_round(2);
        assert_eq!(votes.pol_info(), None);

        let own = NodeId::default();
        for index in 0..3 {
            let vote = validators.vote(index, 1, 0, VoteType::Prevote, block_id(1));
            votes.add_vote(vote, &own).unwrap();
        }
        assert_eq!(votes.pol_info(), Some((0, block_id(1))));

        for index in 0..3 {
            let vote = validators.vote(index, 1, 1, VoteType::Prevote, BlockId::default());
            votes.add_vote(vote, &own).unwrap();
        }
        assert_eq!(votes.pol_info(), Some((1, BlockId::default())));
    }

    #[test]
    fn peer_majority_claims_for_unknown_rounds_are_ignored() {
        let validators = Validators::new(2);
        let mut votes = HeightVoteSet::new(CHAIN_ID, 1, validators.set());
        let peer = NodeId::from("peer");
        assert!(votes
            .set_peer_maj23(7, VoteType::Prevote, peer.clone(), block_id(1))
            .is_ok());
        assert!(votes
            .set_peer_maj23(0, VoteType::Prevote, peer.clone(), block_id(1))
            .is_ok());
        assert_matches!(
            votes.set_peer_maj23(0, VoteType::Prevote, peer, block_id(2)),
            Err(HeightVoteSetError::VoteSet(VoteSetError::ConflictingPeerMaj23 { .. }))
        );
    }

    #[test]
    fn reset_forgets_everything() {
        let validators = Validators::new(2);
        let mut votes = HeightVoteSet::new(CHAIN_ID, 1, validators.set());
        votes.set_round(5);
        votes.reset(2, validators.set());
        assert_eq!(votes.height(), 2);
        assert_eq!(votes.round(), 0);
        assert_eq!(votes.rounds().collect::<Vec<_>>(), vec![0]);
    }

    #[test]
    fn changes_only_move_when_something_was_recorded() {
        let validators = Validators::new(4);
        let mut votes = HeightVoteSet::new(CHAIN_ID, 1, validators.set());
        let peer = NodeId::from("peer1");
        let vote = validators.vote(0, 1, 0, VoteType::Prevote, block_id(1));

        let before = votes.changes();
        assert_eq!(votes.add_vote(vote.clone(), &peer), Ok(true));
        let after_vote = votes.changes();
        assert!(after_vote > before);

        assert_eq!(votes.add_vote(vote, &peer), Ok(false));
        assert_eq!(votes.changes(), after_vote);

        votes
            .set_peer_maj23(0, VoteType::Prevote, peer, block_id(1))
            .unwrap();
        assert!(votes.changes() > after_vote);
    }
}
