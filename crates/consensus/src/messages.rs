//! Consensus messages exchanged between peers and recorded in the WAL.
//!
//! Every message converts losslessly to and from the protobuf envelope in
//! [`p2p_proto::consensus`]. Conversion only checks what the type system
//! needs; [`Message::validate_basic`] checks the rest.

use std::time::{Duration, SystemTime};

use meridian_common::bits::BitArrayError;
use meridian_common::block::BlockError;
use meridian_common::part_set::PartSetError;
use meridian_common::{
    time,
    BitArray,
    BlockId,
    NodeId,
    Part,
    PartSetHeader,
    Proposal,
    ProposalError,
    RoundStateEvent,
    Vote,
    VoteError,
    VoteType,
    MAX_BLOCK_PARTS_COUNT,
};
use p2p_proto::consensus as proto;
use p2p_proto::consensus::{message, wal_message};

use crate::round_state::Step;

/// Upper bound on the size of a validator set, and so on vote bit arrays.
pub const MAX_VOTES_COUNT: usize = 10_000;

#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    #[error("negative height")]
    NegativeHeight,
    #[error("negative round")]
    NegativeRound,
    #[error("negative POL round")]
    NegativePolRound,
    #[error("negative vote index")]
    NegativeIndex,
    #[error("invalid step {0}")]
    InvalidStep(u32),
    #[error("invalid last commit round {0}, cannot be < -1")]
    InvalidLastCommitRound(i32),
    #[error("invalid height {height}: {reason}")]
    InvalidHeight { height: i64, reason: String },
    #[error("empty {0} bit array")]
    EmptyBitArray(&'static str),
    #[error("{what} bit array of {size} bits is too big, max {max}")]
    BitArrayTooBig {
        what: &'static str,
        size: usize,
        max: usize,
    },
    #[error("block parts bit array of {size} bits does not match part set total {total}")]
    PartsSizeMismatch { size: usize, total: u32 },
    #[error("missing field {0}")]
    MissingField(&'static str),
    #[error("wrong block id: {0}")]
    Block(#[from] BlockError),
    #[error("wrong vote: {0}")]
    Vote(#[from] VoteError),
    #[error("wrong proposal: {0}")]
    Proposal(#[from] ProposalError),
    #[error("wrong part: {0}")]
    Part(#[from] PartSetError),
    #[error("wrong bit array: {0}")]
    BitArray(#[from] BitArrayError),
    #[error("invalid timeout duration")]
    InvalidDuration,
}

/// Announces a change of height, round or step.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NewRoundStep {
    pub height: i64,
    pub round: i32,
    pub step: Step,
    /// May be negative while the height has not started yet.
    pub seconds_since_start_time: i64,
    pub last_commit_round: i32,
}

impl NewRoundStep {
    pub fn validate_basic(&self) -> Result<(), MessageError> {
        check_height_round(self.height, self.round)?;
        // -1 at the initial height, checked against it in `validate_height`.
        if self.last_commit_round < -1 {
            return Err(MessageError::InvalidLastCommitRound(self.last_commit_round));
        }
        Ok(())
    }

    /// Checks the height against the chain's initial height, which
    /// `validate_basic` does not know.
    pub fn validate_height(&self, initial_height: i64) -> Result<(), MessageError> {
        let invalid = |reason: String| MessageError::InvalidHeight {
            height: self.height,
            reason,
        };
        if self.height < initial_height {
            return Err(invalid(format!("lower than initial height {initial_height}")));
        }
        if self.height == initial_height && self.last_commit_round != -1 {
            return Err(invalid(format!(
                "last commit round {} must be -1 at the initial height",
                self.last_commit_round
            )));
        }
        if self.height > initial_height && self.last_commit_round < 0 {
            return Err(invalid(format!(
                "last commit round can only be negative at initial height {initial_height}"
            )));
        }
        Ok(())
    }
}

/// Tells peers which block we are after for a round, and which of its parts
/// we have. Sent when a round's valid block changes and on commit.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NewValidBlock {
    pub height: i64,
    pub round: i32,
    pub block_part_set_header: PartSetHeader,
    pub block_parts: BitArray,
    pub is_commit: bool,
}

impl NewValidBlock {
    pub fn validate_basic(&self) -> Result<(), MessageError> {
        check_height_round(self.height, self.round)?;
        self.block_part_set_header.validate_basic()?;
        let size = self.block_parts.size();
        if size == 0 {
            return Err(MessageError::EmptyBitArray("block parts"));
        }
        if size != self.block_part_set_header.total as usize {
            return Err(MessageError::PartsSizeMismatch {
                size,
                total: self.block_part_set_header.total,
            });
        }
        if size > MAX_BLOCK_PARTS_COUNT as usize {
            return Err(MessageError::BitArrayTooBig {
                what: "block parts",
                size,
                max: MAX_BLOCK_PARTS_COUNT as usize,
            });
        }
        Ok(())
    }
}

/// The prevotes we have for a proposal's POL round.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProposalPol {
    pub height: i64,
    pub proposal_pol_round: i32,
    pub proposal_pol: BitArray,
}

impl ProposalPol {
    pub fn validate_basic(&self) -> Result<(), MessageError> {
        if self.height < 0 {
            return Err(MessageError::NegativeHeight);
        }
        if self.proposal_pol_round < 0 {
            return Err(MessageError::NegativePolRound);
        }
        check_votes_size("proposal POL", &self.proposal_pol, false)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockPart {
    pub height: i64,
    pub round: i32,
    pub part: Part,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HasVote {
    pub height: i64,
    pub round: i32,
    pub vote_type: VoteType,
    pub index: i32,
}

/// Claims +2/3 of `vote_type` votes for `block_id` at a height and round.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VoteSetMaj23 {
    pub height: i64,
    pub round: i32,
    pub vote_type: VoteType,
    pub block_id: BlockId,
}

/// The votes we have for the block of a [`VoteSetMaj23`] claim.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VoteSetBits {
    pub height: i64,
    pub round: i32,
    pub vote_type: VoteType,
    pub block_id: BlockId,
    pub votes: BitArray,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Message {
    NewRoundStep(NewRoundStep),
    NewValidBlock(NewValidBlock),
    Proposal(Proposal),
    ProposalPol(ProposalPol),
    BlockPart(BlockPart),
    Vote(Vote),
    HasVote(HasVote),
    VoteSetMaj23(VoteSetMaj23),
    VoteSetBits(VoteSetBits),
}

impl Message {
    pub fn name(&self) -> &'static str {
        match self {
            Message::NewRoundStep(_) => "NewRoundStep",
            Message::NewValidBlock(_) => "NewValidBlock",
            Message::Proposal(_) => "Proposal",
            Message::ProposalPol(_) => "ProposalPOL",
            Message::BlockPart(_) => "BlockPart",
            Message::Vote(_) => "Vote",
            Message::HasVote(_) => "HasVote",
            Message::VoteSetMaj23(_) => "VoteSetMaj23",
            Message::VoteSetBits(_) => "VoteSetBits",
        }
    }

    pub fn validate_basic(&self) -> Result<(), MessageError> {
        match self {
            Message::NewRoundStep(m) => m.validate_basic(),
            Message::NewValidBlock(m) => m.validate_basic(),
            Message::Proposal(p) => Ok(p.validate_basic()?),
            Message::ProposalPol(m) => m.validate_basic(),
            Message::BlockPart(m) => {
                check_height_round(m.height, m.round)?;
                Ok(m.part.validate_basic()?)
            }
            Message::Vote(v) => Ok(v.validate_basic()?),
            Message::HasVote(m) => {
                check_height_round(m.height, m.round)?;
                if m.index < 0 {
                    return Err(MessageError::NegativeIndex);
                }
                Ok(())
            }
            Message::VoteSetMaj23(m) => {
                check_height_round(m.height, m.round)?;
                Ok(m.block_id.validate_basic()?)
            }
            Message::VoteSetBits(m) => {
                check_height_round(m.height, m.round)?;
                m.block_id.validate_basic()?;
                // Empty when we have none of the votes.
                check_votes_size("votes", &m.votes, true)
            }
        }
    }

    pub fn to_proto(&self) -> proto::Message {
        let sum = match self {
            Message::NewRoundStep(m) => message::Sum::NewRoundStep(proto::NewRoundStep {
                height: m.height,
                round: m.round,
                step: m.step.as_u32(),
                seconds_since_start_time: m.seconds_since_start_time,
                last_commit_round: m.last_commit_round,
            }),
            Message::NewValidBlock(m) => message::Sum::NewValidBlock(proto::NewValidBlock {
                height: m.height,
                round: m.round,
                block_part_set_header: Some(m.block_part_set_header.to_proto()),
                block_parts: Some(m.block_parts.to_proto()),
                is_commit: m.is_commit,
            }),
            Message::Proposal(p) => message::Sum::Proposal(proto::Proposal {
                proposal: Some(p.to_proto()),
            }),
            Message::ProposalPol(m) => message::Sum::ProposalPol(proto::ProposalPol {
                height: m.height,
                proposal_pol_round: m.proposal_pol_round,
                proposal_pol: Some(m.proposal_pol.to_proto()),
            }),
            Message::BlockPart(m) => message::Sum::BlockPart(proto::BlockPart {
                height: m.height,
                round: m.round,
                part: Some(m.part.to_proto()),
            }),
            Message::Vote(v) => message::Sum::Vote(proto::Vote {
                vote: Some(v.to_proto()),
            }),
            Message::HasVote(m) => message::Sum::HasVote(proto::HasVote {
                height: m.height,
                round: m.round,
                r#type: m.vote_type.to_proto() as i32,
                index: m.index,
            }),
            Message::VoteSetMaj23(m) => message::Sum::VoteSetMaj23(proto::VoteSetMaj23 {
                height: m.height,
                round: m.round,
                r#type: m.vote_type.to_proto() as i32,
                block_id: Some(m.block_id.to_proto()),
            }),
            Message::VoteSetBits(m) => message::Sum::VoteSetBits(proto::VoteSetBits {
                height: m.height,
                round: m.round,
                r#type: m.vote_type.to_proto() as i32,
                block_id: Some(m.block_id.to_proto()),
                votes: Some(m.votes.to_proto()),
            }),
        };
        proto::Message { sum: Some(sum) }
    }

    pub fn from_proto(msg: proto::Message) -> Result<Self, MessageError> {
        let sum = msg.sum.ok_or(MessageError::MissingField("sum"))?;
        Ok(match sum {
            message::Sum::NewRoundStep(m) => Message::NewRoundStep(NewRoundStep {
                height: m.height,
                round: m.round,
                step: Step::from_u32(m.step).ok_or(MessageError::InvalidStep(m.step))?,
                seconds_since_start_time: m.seconds_since_start_time,
                last_commit_round: m.last_commit_round,
            }),
            message::Sum::NewValidBlock(m) => Message::NewValidBlock(NewValidBlock {
                height: m.height,
                round: m.round,
                block_part_set_header: PartSetHeader::from_proto(
                    m.block_part_set_header
                        .ok_or(MessageError::MissingField("block_part_set_header"))?,
                ),
                block_parts: bit_array(m.block_parts.as_ref(), "block_parts")?,
                is_commit: m.is_commit,
            }),
            message::Sum::Proposal(m) => Message::Proposal(Proposal::from_proto(
                m.proposal.ok_or(MessageError::MissingField("proposal"))?,
            )?),
            message::Sum::ProposalPol(m) => Message::ProposalPol(ProposalPol {
                height: m.height,
                proposal_pol_round: m.proposal_pol_round,
                proposal_pol: bit_array(m.proposal_pol.as_ref(), "proposal_pol")?,
            }),
            message::Sum::BlockPart(m) => Message::BlockPart(BlockPart {
                height: m.height,
                round: m.round,
                part: Part::from_proto(m.part.ok_or(MessageError::MissingField("part"))?)?,
            }),
            message::Sum::Vote(m) => {
                Message::Vote(Vote::from_proto(m.vote.ok_or(MessageError::MissingField("vote"))?)?)
            }
            message::Sum::HasVote(m) => Message::HasVote(HasVote {
                height: m.height,
                round: m.round,
                vote_type: VoteType::from_proto(m.r#type)?,
                index: m.index,
            }),
            message::Sum::VoteSetMaj23(m) => Message::VoteSetMaj23(VoteSetMaj23 {
                height: m.height,
                round: m.round,
                vote_type: VoteType::from_proto(m.r#type)?,
                block_id: BlockId::from_proto(m.block_id),
            }),
            message::Sum::VoteSetBits(m) => Message::VoteSetBits(VoteSetBits {
                height: m.height,
                round: m.round,
                vote_type: VoteType::from_proto(m.r#type)?,
                block_id: BlockId::from_proto(m.block_id),
                // A missing bit array means we have none of the votes.
                votes: match m.votes {
                    Some(votes) => BitArray::from_proto(&votes)?,
                    None => BitArray::new(0),
                },
            }),
        })
    }
}

fn check_height_round(height: i64, round: i32) -> Result<(), MessageError> {
    if height < 0 {
        return Err(MessageError::NegativeHeight);
    }
    if round < 0 {
        return Err(MessageError::NegativeRound);
    }
    Ok(())
}

fn check_votes_size(what: &'static str, votes: &BitArray, may_be_empty: bool) -> Result<(), MessageError> {
    if !may_be_empty && votes.size() == 0 {
        return Err(MessageError::EmptyBitArray(what));
    }
    if votes.size() > MAX_VOTES_COUNT {
        return Err(MessageError::BitArrayTooBig {
            what,
            size: votes.size(),
            max: MAX_VOTES_COUNT,
        });
    }
    Ok(())
}

fn bit_array(
    proto: Option<&p2p_proto::libs::BitArray>,
    field: &'static str,
) -> Result<BitArray, MessageError> {
    Ok(BitArray::from_proto(proto.ok_or(MessageError::MissingField(field))?)?)
}

/// A message for the state machine, from a peer or from ourselves.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MsgInfo {
    pub msg: Message,
    /// Empty for messages we produced.
    pub peer_id: NodeId,
    pub receive_time: SystemTime,
}

impl MsgInfo {
    pub fn internal(msg: Message) -> Self {
        Self {
            msg,
            peer_id: NodeId::default(),
            receive_time: time::now(),
        }
    }

    pub fn from_peer(msg: Message, peer_id: NodeId) -> Self {
        Self {
            msg,
            peer_id,
            receive_time: time::now(),
        }
    }
}

/// A timeout request, and the timeout once it fires.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TimeoutInfo {
    pub duration: Duration,
    pub height: i64,
    pub round: i32,
    pub step: Step,
}

impl TimeoutInfo {
    /// Whether `self` is for a later point of consensus than `other`.
    pub fn is_after(&self, other: &TimeoutInfo) -> bool {
        (self.height, self.round, self.step) > (other.height, other.round, other.step)
    }
}

/// One entry of the write-ahead log.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WalMessage {
    RoundState(RoundStateEvent),
    MsgInfo(MsgInfo),
    Timeout(TimeoutInfo),
    /// Everything of this height has been processed and its block saved.
    EndHeight(i64),
}

impl WalMessage {
    pub fn to_proto(&self) -> proto::WalMessage {
        let sum = match self {
            WalMessage::RoundState(event) => wal_message::Sum::EventDataRoundState(event.to_proto()),
            WalMessage::MsgInfo(info) => wal_message::Sum::MsgInfo(proto::MsgInfo {
                msg: Some(info.msg.to_proto()),
                peer_id: info.peer_id.to_string(),
                receive_time: Some(time::to_proto(info.receive_time)),
            }),
            WalMessage::Timeout(timeout) => wal_message::Sum::TimeoutInfo(proto::TimeoutInfo {
                // Durations this large do not occur, saturate instead of failing.
                duration: Some(prost_types::Duration::try_from(timeout.duration).unwrap_or(
                    prost_types::Duration {
                        seconds: i64::MAX,
                        nanos: 0,
                    },
                )),
                height: timeout.height,
                round: timeout.round,
                step: timeout.step.as_u32(),
            }),
            WalMessage::EndHeight(height) => wal_message::Sum::EndHeight(proto::EndHeight { height: *height }),
        };
        proto::WalMessage { sum: Some(sum) }
    }

    pub fn from_proto(msg: proto::WalMessage) -> Result<Self, MessageError> {
        let sum = msg.sum.ok_or(MessageError::MissingField("sum"))?;
        Ok(match sum {
            wal_message::Sum::EventDataRoundState(event) => WalMessage::RoundState(RoundStateEvent {
                height: event.height,
                round: event.round,
                step: event.step,
            }),
            wal_message::Sum::MsgInfo(info) => WalMessage::MsgInfo(MsgInfo {
                msg: Message::from_proto(info.msg.ok_or(MessageError::MissingField("msg"))?)?,
                peer_id: NodeId::new(info.peer_id),
                receive_time: time::from_proto(info.receive_time.as_ref()),
            }),
            wal_message::Sum::TimeoutInfo(timeout) => WalMessage::Timeout(TimeoutInfo {
                duration: timeout
                    .duration
                    .map(Duration::try_from)
                    .transpose()
                    .map_err(|_| MessageError::InvalidDuration)?
                    .unwrap_or_default(),
                height: timeout.height,
                round: timeout.round,
                step: Step::from_u32(timeout.step).ok_or(MessageError::InvalidStep(timeout.step))?,
            }),
            wal_message::Sum::EndHeight(end) => WalMessage::EndHeight(end.height),
        })
    }
}

/// A WAL entry together with the time it was written.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TimedWalMessage {
    pub time: SystemTime,
    pub msg: WalMessage,
}

impl TimedWalMessage {
    pub fn to_proto(&self) -> proto::TimedWalMessage {
        proto::TimedWalMessage {
            time: Some(time::to_proto(self.time)),
            msg: Some(self.msg.to_proto()),
        }
    }

    pub fn from_proto(proto: proto::TimedWalMessage) -> Result<Self, MessageError> {
        Ok(Self {
            time: time::from_proto(proto.time.as_ref()),
            msg: WalMessage::from_proto(proto.msg.ok_or(MessageError::MissingField("msg"))?)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use rstest::rstest;

    use super::*;

    fn new_round_step(height: i64, last_commit_round: i32) -> NewRoundStep {
        NewRoundStep {
            height,
            round: 0,
            step: Step::NewHeight,
            seconds_since_start_time: 0,
            last_commit_round,
        }
    }

    #[rstest]
    #[case(1, -1, 1, true)]
    #[case(1, 0, 1, false)]
    #[case(2, 0, 1, true)]
    #[case(2, -1, 1, false)]
    #[case(4, -1, 5, false)]
    #[case(5, -1, 5, true)]
    fn new_round_step_height_checks(
        #[case] height: i64,
        #[case] last_commit_round: i32,
        #[case] initial_height: i64,
        #[case] valid: bool,
    ) {
        let msg = new_round_step(height, last_commit_round);
        assert!(msg.validate_basic().is_ok());
        assert_eq!(msg.validate_height(initial_height).is_ok(), valid);
    }

    #[test]
    fn new_round_step_rejects_bad_fields() {
        let mut msg = new_round_step(-1, -1);
        assert_matches!(msg.validate_basic(), Err(MessageError::NegativeHeight));
        msg.height = 1;
        msg.last_commit_round = -2;
        assert_matches!(msg.validate_basic(), Err(MessageError::InvalidLastCommitRound(-2)));

        let mut proto = Message::NewRoundStep(new_round_step(1, -1)).to_proto();
        if let Some(message::Sum::NewRoundStep(m)) = proto.sum.as_mut() {
            m.step = 42;
        }
        assert_matches!(Message::from_proto(proto), Err(MessageError::InvalidStep(42)));
    }

    #[test]
    fn new_valid_block_parts_must_match_the_header() {
        let header = PartSetHeader {
            total: 2,
            hash: vec![7; 32],
        };
        let mut msg = NewValidBlock {
            height: 3,
            round: 0,
            block_part_set_header: header.clone(),
            block_parts: BitArray::new(2),
            is_commit: false,
        };
        assert!(msg.validate_basic().is_ok());

        msg.block_parts = BitArray::new(3);
        assert_matches!(msg.validate_basic(), Err(MessageError::PartsSizeMismatch { size: 3, total: 2 }));

        msg.block_parts = BitArray::new(0);
        assert_matches!(msg.validate_basic(), Err(MessageError::EmptyBitArray(_)));

        msg.block_part_set_header.total = MAX_BLOCK_PARTS_COUNT + 1;
        msg.block_parts = BitArray::new(1);
        assert_matches!(msg.validate_basic(), Err(MessageError::Block(_)));
    }

    #[test]
    fn vote_bit_arrays_are_bounded() {
        let pol = ProposalPol {
            height: 1,
            proposal_pol_round: 0,
            proposal_pol: BitArray::new(MAX_VOTES_COUNT + 1),
        };
        assert_matches!(pol.validate_basic(), Err(MessageError::BitArrayTooBig { .. }));

        let bits = Message::VoteSetBits(VoteSetBits {
            height: 1,
            round: 0,
            vote_type: VoteType::Prevote,
            block_id: BlockId::default(),
            votes: BitArray::new(0),
        });
        assert!(bits.validate_basic().is_ok());
    }

    #[test]
    fn has_vote_round_trips_and_rejects_negative_index() {
        let msg = Message::HasVote(HasVote {
            height: 2,
            round: 1,
            vote_type: VoteType::Precommit,
            index: 3,
        });
        assert_eq!(Message::from_proto(msg.to_proto()).unwrap(), msg);

        let bad = Message::HasVote(HasVote {
            height: 2,
            round: 1,
            vote_type: VoteType::Precommit,
            index: -1,
        });
        assert_matches!(bad.validate_basic(), Err(MessageError::NegativeIndex));
    }

    #[test]
    fn empty_envelopes_are_rejected() {
        assert_matches!(
            Message::from_proto(proto::Message { sum: None }),
            Err(MessageError::MissingField("sum"))
        );
        assert_matches!(
            WalMessage::from_proto(proto::WalMessage { sum: None }),
            Err(MessageError::MissingField("sum"))
        );
    }

    #[test]
    fn wal_messages_keep_peer_and_timeout_details() {
        let entries = [
            WalMessage::MsgInfo(MsgInfo {
                msg: Message::HasVote(HasVote {
                    height: 1,
                    round: 0,
                    vote_type: VoteType::Prevote,
                    index: 0,
                }),
                peer_id: NodeId::from("peer"),
                receive_time: time::now(),
            }),
            WalMessage::Timeout(TimeoutInfo {
                duration: Duration::from_millis(1500),
                height: 4,
                round: 2,
                step: Step::PrevoteWait,
            }),
            WalMessage::RoundState(RoundStateEvent {
                height: 4,
                round: 2,
                step: "RoundStepPrevote".into(),
            }),
            WalMessage::EndHeight(3),
        ];
        for entry in entries {
            let timed = TimedWalMessage {
                time: time::now(),
                msg: entry,
            };
            assert_eq!(TimedWalMessage::from_proto(timed.to_proto()).unwrap(), timed);
        }
    }

    #[test]
    fn timeouts_order_by_height_round_and_step() {
        let at = |height, round, step| TimeoutInfo {
            duration: Duration::ZERO,
            height,
            round,
            step,
        };
        assert!(at(2, 0, Step::NewHeight).is_after(&at(1, 5, Step::Commit)));
        assert!(at(1, 1, Step::Propose).is_after(&at(1, 0, Step::PrecommitWait)));
        assert!(at(1, 1, Step::PrevoteWait).is_after(&at(1, 1, Step::Propose)));
        assert!(!at(1, 1, Step::Propose).is_after(&at(1, 1, Step::Propose)));
    }
}
