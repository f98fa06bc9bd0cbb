//! What we know about a connected peer's progress.
//!
//! Each peer reports its height, round and step, and which proposal parts and
//! votes it has. The gossip routines use this to pick what to send next. All
//! inputs come from the peer itself, so every size it claims is bounded
//! before anything proportional to it is allocated.

use std::time::{Duration, SystemTime};

use meridian_common::{BitArray, NodeId, PartSetHeader, Proposal, Vote, VoteSetReader, VoteType, MAX_BLOCK_PARTS_COUNT};
use parking_lot::Mutex;

use crate::messages::{HasVote, NewRoundStep, NewValidBlock, ProposalPol, VoteSetBits};
use crate::round_state::Step;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PeerStateError {
    #[error("invalid vote index {index} for {size} validators")]
    InvalidVoteIndex { index: i32, size: usize },
}

/// A peer's reported position in consensus and what it already has.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerRoundState {
    pub height: i64,
    pub round: i32,
    pub step: Step,
    pub start_time: SystemTime,
    /// Whether the peer has the proposal of its current round.
    pub proposal: bool,
    pub proposal_block_part_set_header: PartSetHeader,
    pub proposal_block_parts: Option<BitArray>,
    pub proposal_pol_round: i32,
    /// Nil until a `ProposalPol` message arrives.
    pub proposal_pol: Option<BitArray>,
    pub prevotes: Option<BitArray>,
    pub precommits: Option<BitArray>,
    pub last_commit_round: i32,
    pub last_commit: Option<BitArray>,
    /// A round we hold a commit for, which the peer may not have seen yet.
    pub catchup_commit_round: i32,
    pub catchup_commit: Option<BitArray>,
}

impl Default for PeerRoundState {
    fn default() -> Self {
        Self {
            height: 0,
            round: -1,
            step: Step::NewHeight,
            start_time: SystemTime::UNIX_EPOCH,
            proposal: false,
            proposal_block_part_set_header: PartSetHeader::default(),
            proposal_block_parts: None,
            proposal_pol_round: -1,
            proposal_pol: None,
            prevotes: None,
            precommits: None,
            last_commit_round: -1,
            last_commit: None,
            catchup_commit_round: -1,
            catchup_commit: None,
        }
    }
}

impl PeerRoundState {
    fn vote_bit_array(&mut self, height: i64, round: i32, vote_type: VoteType) -> Option<&mut BitArray> {
        if self.height == height {
            if self.round == round {
                return match vote_type {
                    VoteType::Prevote => self.prevotes.as_mut(),
                    VoteType::Precommit => self.precommits.as_mut(),
                };
            }
            if self.catchup_commit_round == round {
                return match vote_type {
                    VoteType::Prevote => None,
                    VoteType::Precommit => self.catchup_commit.as_mut(),
                };
            }
            if self.proposal_pol_round == round {
                return match vote_type {
                    VoteType::Prevote => self.proposal_pol.as_mut(),
                    VoteType::Precommit => None,
                };
            }
            return None;
        }
        if self.height == height + 1 && self.last_commit_round == round {
            return match vote_type {
                VoteType::Prevote => None,
                VoteType::Precommit => self.last_commit.as_mut(),
            };
        }
        None
    }

    fn set_has_vote(&mut self, height: i64, round: i32, vote_type: VoteType, index: i32) -> Result<(), PeerStateError> {
        let Some(votes) = self.vote_bit_array(height, round, vote_type) else {
            return Ok(());
        };
        let size = votes.size();
        match usize::try_from(index) {
            Ok(i) if i < size => {
                votes.set_index(i, true);
                Ok(())
            }
            _ => Err(PeerStateError::InvalidVoteIndex { index, size }),
        }
    }

    fn ensure_vote_bit_arrays(&mut self, height: i64, validators: usize) {
        if self.height == height {
            for votes in [
                &mut self.prevotes,
                &mut self.precommits,
                &mut self.catchup_commit,
                &mut self.proposal_pol,
            ] {
                votes.get_or_insert_with(|| BitArray::new(validators));
            }
        } else if self.height == height + 1 {
            self.last_commit
                .get_or_insert_with(|| BitArray::new(validators));
        }
    }

    fn ensure_catchup_commit_round(&mut self, height: i64, round: i32, validators: usize) {
        if self.height != height || self.catchup_commit_round == round {
            return;
        }
        self.catchup_commit_round = round;
        self.catchup_commit = if round == self.round {
            self.precommits.clone()
        } else {
            Some(BitArray::new(validators))
        };
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
struct Stats {
    votes: usize,
    block_parts: usize,
}

/// The shared, lock protected view of one peer. Handlers of the peer's
/// messages and its gossip routines update it concurrently.
#[derive(Debug)]
pub struct PeerState {
    node_id: NodeId,
    inner: Mutex<(PeerRoundState, Stats)>,
}

impl PeerState {
    pub fn new(node_id: NodeId) -> Self {
        Self {
            node_id,
            inner: Mutex::new((PeerRoundState::default(), Stats::default())),
        }
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    /// A copy of the peer's round state.
    pub fn get_round_state(&self) -> PeerRoundState {
        self.inner.lock().0.clone()
    }

    pub fn height(&self) -> i64 {
        self.inner.lock().0.height
    }

    /// Records that the peer has the proposal. Claims of more block parts
    /// than a block can have are ignored.
    pub fn set_has_proposal(&self, proposal: &Proposal) {
        let header = &proposal.block_id.part_set_header;
        if header.total > MAX_BLOCK_PARTS_COUNT {
            return;
        }
        let mut inner = self.inner.lock();
        let prs = &mut inner.0;
        if prs.height != proposal.height || prs.round != proposal.round || prs.proposal {
            return;
        }
        prs.proposal = true;
        // Already set by a NewValidBlock message.
        if prs.proposal_block_parts.is_some() {
            return;
        }
        prs.proposal_block_part_set_header = header.clone();
        prs.proposal_block_parts = Some(BitArray::new(header.total as usize));
        prs.proposal_pol_round = proposal.pol_round;
        prs.proposal_pol = None;
    }

    /// Prepares tracking of the parts of a block the peer is catching up on.
    /// The first header wins.
    pub fn init_proposal_block_parts(&self, header: &PartSetHeader) {
        if header.total > MAX_BLOCK_PARTS_COUNT {
            return;
        }
        let mut inner = self.inner.lock();
        let prs = &mut inner.0;
        if prs.proposal_block_parts.is_some() {
            return;
        }
        prs.proposal_block_part_set_header = header.clone();
        prs.proposal_block_parts = Some(BitArray::new(header.total as usize));
    }

    pub fn set_has_proposal_block_part(&self, height: i64, round: i32, index: usize) {
        let mut inner = self.inner.lock();
        let prs = &mut inner.0;
        if prs.height != height || prs.round != round {
            return;
        }
        if let Some(parts) = prs.proposal_block_parts.as_mut() {
            parts.set_index(index, true);
        }
    }

    /// Picks a vote from `votes` the peer does not have yet.
    pub fn pick_vote_to_send(&self, votes: &impl VoteSetReader) -> Option<Vote> {
        let size = votes.size();
        if size == 0 {
            return None;
        }
        let (height, round, vote_type) = (votes.height(), votes.round(), votes.vote_type());

        let mut inner = self.inner.lock();
        let prs = &mut inner.0;
        if votes.is_commit() {
            prs.ensure_catchup_commit_round(height, round, size);
        }
        prs.ensure_vote_bit_arrays(height, size);
        let peer_votes = prs.vote_bit_array(height, round, vote_type)?;
        let index = votes.bit_array().sub(peer_votes).pick_random()?;
        votes.get_by_index(index as i32)
    }

    /// Allocates the vote bit arrays of `height` if missing, sized to its
    /// validator set.
    pub fn ensure_vote_bit_arrays(&self, height: i64, validators: usize) {
        self.inner.lock().0.ensure_vote_bit_arrays(height, validators);
    }

    pub fn ensure_catchup_commit_round(&self, height: i64, round: i32, validators: usize) {
        self.inner
            .lock()
            .0
            .ensure_catchup_commit_round(height, round, validators);
    }

    /// Marks the vote as known to the peer. Fails if the index does not fit
    /// the validator set the bit array was allocated for.
    pub fn set_has_vote(&self, vote: &Vote) -> Result<(), PeerStateError> {
        self.inner
            .lock()
            .0
            .set_has_vote(vote.height, vote.round, vote.vote_type, vote.validator_index)
    }

    pub fn apply_new_round_step_message(&self, msg: &NewRoundStep) {
        let mut inner = self.inner.lock();
        let prs = &mut inner.0;
        if (msg.height, msg.round, msg.step) <= (prs.height, prs.round, prs.step) {
            return;
        }

        let (ps_height, ps_round) = (prs.height, prs.round);
        let ps_catchup_commit_round = prs.catchup_commit_round;
        let ps_catchup_commit = prs.catchup_commit.take();
        let last_precommits = prs.precommits.clone();

        prs.height = msg.height;
        prs.round = msg.round;
        prs.step = msg.step;
        prs.start_time = start_time(msg.seconds_since_start_time);

        if ps_height != msg.height || ps_round != msg.round {
            prs.proposal = false;
            prs.proposal_block_part_set_header = PartSetHeader::default();
            prs.proposal_block_parts = None;
            prs.proposal_pol_round = -1;
            prs.proposal_pol = None;
            // Sized later, once we know the validator set.
            prs.prevotes = None;
            prs.precommits = None;
        }
        if ps_height == msg.height && ps_round != msg.round && msg.round == ps_catchup_commit_round {
            // The peer caught up to the round we have a commit for.
            prs.precommits = ps_catchup_commit.clone();
        }
        if ps_height == msg.height {
            prs.catchup_commit = ps_catchup_commit;
        } else {
            prs.last_commit_round = msg.last_commit_round;
            prs.last_commit = if ps_height + 1 == msg.height && ps_round == msg.last_commit_round {
                last_precommits
            } else {
                None
            };
            prs.catchup_commit_round = -1;
            prs.catchup_commit = None;
        }
    }

    pub fn apply_new_valid_block_message(&self, msg: &NewValidBlock) {
        let mut inner = self.inner.lock();
        let prs = &mut inner.0;
        if prs.height != msg.height {
            return;
        }
        if prs.round != msg.round && !msg.is_commit {
            return;
        }
        prs.proposal_block_part_set_header = msg.block_part_set_header.clone();
        prs.proposal_block_parts = Some(msg.block_parts.clone());
    }

    pub fn apply_proposal_pol_message(&self, msg: &ProposalPol) {
        let mut inner = self.inner.lock();
        let prs = &mut inner.0;
        if prs.height != msg.height || prs.proposal_pol_round != msg.proposal_pol_round {
            return;
        }
        prs.proposal_pol = Some(msg.proposal_pol.clone());
    }

    pub fn apply_has_vote_message(&self, msg: &HasVote) -> Result<(), PeerStateError> {
        let mut inner = self.inner.lock();
        let prs = &mut inner.0;
        if prs.height != msg.height {
            return Ok(());
        }
        prs.set_has_vote(msg.height, msg.round, msg.vote_type, msg.index)
    }

    /// Merges the votes the peer says it has for a claimed majority.
    /// `our_votes` are our votes for that block: the peer keeps what we
    /// attributed to it beyond those, plus everything it now reports.
    pub fn apply_vote_set_bits_message(&self, msg: &VoteSetBits, our_votes: Option<&BitArray>) {
        let mut inner = self.inner.lock();
        let Some(votes) = inner.0.vote_bit_array(msg.height, msg.round, msg.vote_type) else {
            return;
        };
        match our_votes {
            None => votes.update(&msg.votes),
            Some(ours) => {
                let has_votes = votes.sub(ours).or(&msg.votes);
                votes.update(&has_votes);
            }
        }
    }

    /// Counts a vote received from the peer, returning the new total.
    pub fn record_vote(&self) -> usize {
        let mut inner = self.inner.lock();
        inner.1.votes += 1;
        inner.1.votes
    }

    pub fn votes_sent(&self) -> usize {
        self.inner.lock().1.votes
    }

    pub fn record_block_part(&self) -> usize {
        let mut inner = self.inner.lock();
        inner.1.block_parts += 1;
        inner.1.block_parts
    }

    pub fn block_parts_sent(&self) -> usize {
        self.inner.lock().1.block_parts
    }
}

fn start_time(seconds_since_start_time: i64) -> SystemTime {
    let now = meridian_common::time::now();
    let offset = Duration::from_secs(seconds_since_start_time.unsigned_abs());
    if seconds_since_start_time >= 0 {
        now.checked_sub(offset).unwrap_or(SystemTime::UNIX_EPOCH)
    } else {
        now.checked_add(offset).unwrap_or(now)
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use meridian_common::BlockId;
    use rstest::rstest;

    use super::*;
    use crate::test_utils::{block_id, Validators};

    fn peer_at(height: i64, round: i32, step: Step) -> PeerState {
        let peer = PeerState::new(NodeId::from("peer"));
        peer.apply_new_round_step_message(&NewRoundStep {
            height,
            round,
            step,
            seconds_since_start_time: 0,
            last_commit_round: if height > 1 { 0 } else { -1 },
        });
        peer
    }

    fn proposal(height: i64, round: i32, total: u32) -> Proposal {
        let mut block_id = block_id(1);
        block_id.part_set_header.total = total;
        Proposal::new(height, round, -1, block_id)
    }

    #[rstest]
    #[case::one(1)]
    #[case::max(MAX_BLOCK_PARTS_COUNT)]
    fn proposal_allocates_claimed_parts(#[case] total: u32) {
        let peer = peer_at(1, 0, Step::Propose);
        peer.set_has_proposal(&proposal(1, 0, total));
        let prs = peer.get_round_state();
        assert!(prs.proposal);
        assert_eq!(prs.proposal_block_parts.map(|parts| parts.size()), Some(total as usize));
    }

    #[rstest]
    #[case::just_above(MAX_BLOCK_PARTS_COUNT + 1)]
    #[case::huge(u32::MAX)]
    fn oversized_part_counts_are_ignored(#[case] total: u32) {
        let peer = peer_at(1, 0, Step::Propose);
        peer.set_has_proposal(&proposal(1, 0, total));
        let prs = peer.get_round_state();
        assert!(!prs.proposal);
        assert_eq!(prs.proposal_block_parts, None);

        let mut header = block_id(1).part_set_header;
        header.total = total;
        peer.init_proposal_block_parts(&header);
        assert_eq!(peer.get_round_state().proposal_block_parts, None);
    }

    #[test]
    fn proposal_for_another_round_is_ignored() {
        let peer = peer_at(1, 1, Step::Propose);
        peer.set_has_proposal(&proposal(1, 0, 1));
        assert!(!peer.get_round_state().proposal);
    }

    #[test]
    fn first_part_header_wins() {
        let peer = peer_at(2, 0, Step::NewHeight);
        let first = block_id(1).part_set_header;
        let mut second = block_id(2).part_set_header;
        second.total = 3;
        peer.init_proposal_block_parts(&first);
        peer.init_proposal_block_parts(&second);
        assert_eq!(peer.get_round_state().proposal_block_part_set_header, first);
    }

    #[test]
    fn vote_indexes_are_checked_against_the_validator_set() {
        let validators = Validators::new(4);
        let peer = peer_at(1, 0, Step::Prevote);
        peer.ensure_vote_bit_arrays(1, 4);

        let mut vote = validators.vote(0, 1, 0, VoteType::Prevote, block_id(1));
        vote.validator_index = -1;
        assert_matches!(
            peer.set_has_vote(&vote),
            Err(PeerStateError::InvalidVoteIndex { index: -1, size: 4 })
        );
        vote.validator_index = 4;
        assert_matches!(
            peer.set_has_vote(&vote),
            Err(PeerStateError::InvalidVoteIndex { index: 4, size: 4 })
        );

        vote.validator_index = 2;
        assert_eq!(peer.set_has_vote(&vote), Ok(()));
        let prevotes = peer.get_round_state().prevotes.unwrap();
        assert_eq!(prevotes.iter_ones().collect::<Vec<_>>(), vec![2]);
    }

    #[test]
    fn picks_only_votes_the_peer_lacks() {
        let validators = Validators::new(2);
        let mut votes = validators.vote_set(1, 0, VoteType::Prevote);
        for index in 0..2 {
            votes
                .add_vote(validators.vote(index, 1, 0, VoteType::Prevote, block_id(1)))
                .unwrap();
        }
        let peer = peer_at(1, 0, Step::Prevote);

        let first = peer.pick_vote_to_send(&votes).unwrap();
        peer.set_has_vote(&first).unwrap();
        let second = peer.pick_vote_to_send(&votes).unwrap();
        assert_ne!(first.validator_index, second.validator_index);
        peer.set_has_vote(&second).unwrap();
        assert_eq!(peer.pick_vote_to_send(&votes), None);
    }

    #[test]
    fn precommits_become_last_commit_on_the_next_height() {
        let peer = peer_at(1, 0, Step::Precommit);
        peer.ensure_vote_bit_arrays(1, 3);
        peer.apply_has_vote_message(&HasVote {
            height: 1,
            round: 0,
            vote_type: VoteType::Precommit,
            index: 1,
        })
        .unwrap();

        peer.apply_new_round_step_message(&NewRoundStep {
            height: 2,
            round: 0,
            step: Step::NewHeight,
            seconds_since_start_time: 0,
            last_commit_round: 0,
        });
        let prs = peer.get_round_state();
        assert_eq!(prs.last_commit_round, 0);
        assert_eq!(
            prs.last_commit.map(|bits| bits.iter_ones().collect::<Vec<_>>()),
            Some(vec![1])
        );
        assert_eq!(prs.precommits, None);
        assert!(!prs.proposal);
    }

    #[test]
    fn stale_round_steps_are_ignored() {
        let peer = peer_at(3, 2, Step::Prevote);
        peer.apply_new_round_step_message(&NewRoundStep {
            height: 3,
            round: 1,
            step: Step::Commit,
            seconds_since_start_time: 0,
            last_commit_round: 0,
        });
        let prs = peer.get_round_state();
        assert_eq!((prs.height, prs.round, prs.step), (3, 2, Step::Prevote));
    }

    #[test]
    fn vote_set_bits_keep_votes_we_do_not_have() {
        let peer = peer_at(1, 0, Step::Prevote);
        peer.ensure_vote_bit_arrays(1, 4);
        for index in [0, 3] {
            peer.apply_has_vote_message(&HasVote {
                height: 1,
                round: 0,
                vote_type: VoteType::Prevote,
                index,
            })
            .unwrap();
        }

        let bits = |ones: &[usize]| {
            let mut bits = BitArray::new(4);
            for &i in ones {
                bits.set_index(i, true);
            }
            bits
        };
        let msg = VoteSetBits {
            height: 1,
            round: 0,
            vote_type: VoteType::Prevote,
            block_id: BlockId::default(),
            votes: bits(&[1]),
        };
        // We hold votes 0 and 1 for the block: the peer's vote 0 is
        // replaced by its report, vote 3 is kept.
        peer.apply_vote_set_bits_message(&msg, Some(&bits(&[0, 1])));
        assert_eq!(peer.get_round_state().prevotes, Some(bits(&[1, 3])));

        peer.apply_vote_set_bits_message(&msg, None);
        assert_eq!(peer.get_round_state().prevotes, Some(bits(&[1])));
    }

    #[test]
    fn new_valid_block_replaces_parts_on_commit() {
        let peer = peer_at(1, 2, Step::Prevote);
        let header = block_id(5).part_set_header;
        let mut msg = NewValidBlock {
            height: 1,
            round: 0,
            block_part_set_header: header.clone(),
            block_parts: BitArray::new(1),
            is_commit: false,
        };
        peer.apply_new_valid_block_message(&msg);
        assert_eq!(peer.get_round_state().proposal_block_parts, None);

        msg.is_commit = true;
        peer.apply_new_valid_block_message(&msg);
        let prs = peer.get_round_state();
        assert_eq!(prs.proposal_block_part_set_header, header);
        assert_eq!(prs.proposal_block_parts, Some(BitArray::new(1)));
    }
}
