use std::fmt;
use std::sync::Arc;
use std::time::SystemTime;

use meridian_common::{Block, PartSet, PartSetHeader, Proposal, RoundStateEvent, ValidatorSet, VoteSet, VoteSetReader};

use crate::height_vote_set::HeightVoteSet;
use crate::messages::{NewRoundStep, NewValidBlock};

/// The step of the state machine within a round. Ordered, so that
/// `(height, round, step)` compares the way consensus progresses.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Step {
    /// Waiting for the commit timeout of the previous height.
    NewHeight = 1,
    NewRound = 2,
    Propose = 3,
    Prevote = 4,
    /// Saw +2/3 prevotes for anything, waiting for more.
    PrevoteWait = 5,
    Precommit = 6,
    /// Saw +2/3 precommits for anything, waiting for more.
    PrecommitWait = 7,
    /// Saw +2/3 precommits for a block, waiting for it to arrive.
    Commit = 8,
}

impl Step {
    pub fn from_u32(value: u32) -> Option<Self> {
        Some(match value {
            1 => Step::NewHeight,
            2 => Step::NewRound,
            3 => Step::Propose,
            4 => Step::Prevote,
            5 => Step::PrevoteWait,
            6 => Step::Precommit,
            7 => Step::PrecommitWait,
            8 => Step::Commit,
            _ => return None,
        })
    }

    pub fn as_u32(self) -> u32 {
        self as u32
    }

    pub fn name(self) -> &'static str {
        match self {
            Step::NewHeight => "RoundStepNewHeight",
            Step::NewRound => "RoundStepNewRound",
            Step::Propose => "RoundStepPropose",
            Step::Prevote => "RoundStepPrevote",
            Step::PrevoteWait => "RoundStepPrevoteWait",
            Step::Precommit => "RoundStepPrecommit",
            Step::PrecommitWait => "RoundStepPrecommitWait",
            Step::Commit => "RoundStepCommit",
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Everything the state machine knows about the current height.
///
/// Only the state machine mutates it; everyone else sees immutable snapshots
/// behind an `Arc`. Blocks and part sets are shared between snapshots, so a
/// snapshot costs little more than the vote sets.
#[derive(Clone, Debug)]
pub struct RoundState {
    pub height: i64,
    pub round: i32,
    pub step: Step,
    /// When the current height started, or is scheduled to start.
    pub start_time: SystemTime,
    /// When +2/3 precommits for a block were first seen.
    pub commit_time: SystemTime,
    pub validators: Arc<ValidatorSet>,
    pub proposal: Option<Proposal>,
    pub proposal_receive_time: Option<SystemTime>,
    pub proposal_block: Option<Arc<Block>>,
    pub proposal_block_parts: Option<PartSet>,
    pub locked_round: i32,
    pub locked_block: Option<Arc<Block>>,
    pub locked_block_parts: Option<PartSet>,
    /// The last round with a polka for a block we have.
    pub valid_round: i32,
    pub valid_block: Option<Arc<Block>>,
    pub valid_block_parts: Option<PartSet>,
    pub votes: HeightVoteSet,
    pub commit_round: i32,
    /// Precommits of the previous height.
    pub last_commit: Option<VoteSet>,
    pub last_validators: Arc<ValidatorSet>,
    pub triggered_timeout_precommit: bool,
}

impl Default for RoundState {
    fn default() -> Self {
        Self {
            height: 0,
            round: 0,
            step: Step::NewHeight,
            start_time: SystemTime::UNIX_EPOCH,
            commit_time: SystemTime::UNIX_EPOCH,
            validators: Default::default(),
            proposal: None,
            proposal_receive_time: None,
            proposal_block: None,
            proposal_block_parts: None,
            locked_round: -1,
            locked_block: None,
            locked_block_parts: None,
            valid_round: -1,
            valid_block: None,
            valid_block_parts: None,
            votes: HeightVoteSet::default(),
            commit_round: -1,
            last_commit: None,
            last_validators: Default::default(),
            triggered_timeout_precommit: false,
        }
    }
}

/// A cheap summary of a [`RoundState`]: equal revisions mean a reader would
/// see nothing new.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub(crate) struct Revision {
    height: i64,
    round: i32,
    step: Option<Step>,
    proposal: bool,
    proposal_block: bool,
    proposal_block_parts: Option<(PartSetHeader, u32)>,
    locked_round: i32,
    valid_round: i32,
    commit_round: i32,
    votes: u64,
    last_commit_power: Option<i64>,
    triggered_timeout_precommit: bool,
}

impl RoundState {
    pub(crate) fn revision(&self) -> Revision {
        Revision {
            height: self.height,
            round: self.round,
            step: Some(self.step),
            proposal: self.proposal.is_some(),
            proposal_block: self.proposal_block.is_some(),
            proposal_block_parts: self
                .proposal_block_parts
                .as_ref()
                .map(|parts| (parts.header(), parts.count())),
            locked_round: self.locked_round,
            valid_round: self.valid_round,
            commit_round: self.commit_round,
            votes: self.votes.changes(),
            last_commit_power: self.last_commit.as_ref().map(VoteSet::sum),
            triggered_timeout_precommit: self.triggered_timeout_precommit,
        }
    }

    pub fn event(&self) -> RoundStateEvent {
        RoundStateEvent {
            height: self.height,
            round: self.round,
            step: self.step.name().to_owned(),
        }
    }

    /// The round of the previous height's commit, -1 without one.
    pub fn last_commit_round(&self) -> i32 {
        self.last_commit
            .as_ref()
            .map(VoteSetReader::round)
            .unwrap_or(-1)
    }

    pub fn new_round_step_message(&self) -> NewRoundStep {
        let seconds_since_start_time = match SystemTime::now().duration_since(self.start_time) {
            Ok(elapsed) => elapsed.as_secs() as i64,
            Err(ahead) => -(ahead.duration().as_secs() as i64),
        };
        NewRoundStep {
            height: self.height,
            round: self.round,
            step: self.step,
            seconds_since_start_time,
            last_commit_round: self.last_commit_round(),
        }
    }

    /// Announces the block parts we have, if we know which block we want.
    pub fn new_valid_block_message(&self) -> Option<NewValidBlock> {
        let parts = self.proposal_block_parts.as_ref()?;
        Some(NewValidBlock {
            height: self.height,
            round: self.round,
            block_part_set_header: parts.header(),
            block_parts: parts.bit_array(),
            is_commit: self.step == Step::Commit,
        })
    }

    /// Whether the proposal and its block are in, and if the proposal
    /// carries a POL round, whether we saw that polka ourselves.
    pub fn is_proposal_complete(&self) -> bool {
        let (Some(proposal), Some(_)) = (&self.proposal, &self.proposal_block) else {
            return false;
        };
        if proposal.pol_round < 0 {
            return true;
        }
        self.votes
            .prevotes(proposal.pol_round)
            .is_some_and(|prevotes| prevotes.has_two_thirds_majority())
    }
}

impl fmt::Display for RoundState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.height, self.round, self.step)
    }
}
