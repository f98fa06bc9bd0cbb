//! The consensus state machine.
//!
//! [`ConsensusState`] owns the [`RoundState`] and is driven by one task: its
//! [`run`](ConsensusState::run) loop receives proposals, block parts and votes
//! from peers and from itself, fired timeouts and mempool notifications.
//! Every input is written to the WAL before it is processed. Everyone else
//! talks to the machine through a cloneable [`StateHandle`], and sees
//! immutable snapshots of the round state.

use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use meridian_common::{
    fmt_hex,
    time,
    BitArray,
    Block,
    BlockId,
    BlockIdFlag,
    Commit,
    Event,
    EventBus,
    NodeId,
    Part,
    PartSet,
    PrivValidator,
    Proposal,
    PublicKey,
    Vote,
    VoteSet,
    VoteSetError,
    VoteType,
    BLOCK_PART_SIZE_BYTES,
};
use meridian_common::block::BlockError;
use meridian_common::part_set::MAX_BLOCK_SIZE_BYTES;
use futures::FutureExt;
use meridian_state::{BlockExecutor, BlockStore, EvidencePool, State};
use tokio::sync::{mpsc, oneshot, watch, Notify};
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::error::{panic_message, ConsensusError, FatalError};
use crate::height_vote_set::{HeightVoteSet, HeightVoteSetError};
use crate::messages::{BlockPart, HasVote, Message, MsgInfo, NewRoundStep, NewValidBlock, TimeoutInfo, VoteSetBits, VoteSetMaj23, WalMessage};
use crate::round_state::{Revision, RoundState, Step};
use crate::ticker::TimeoutTicker;
use crate::wal::Wal;

/// Capacity of the queue of inputs from peers and handles.
const INPUT_QUEUE_SIZE: usize = 1000;

/// Minimum time between two blocks, and between a block and the votes for it.
const TIME_IOTA: Duration = Duration::from_millis(1);

/// An input of the state machine.
#[derive(Debug)]
pub enum StateInput {
    Msg(MsgInfo),
    /// A peer claims +2/3 votes for a block. Answered with the votes we have
    /// for that block, or `None` when the claim is not for our height.
    PeerMaj23 {
        peer: NodeId,
        maj23: VoteSetMaj23,
        reply: oneshot::Sender<Result<Option<VoteSetBits>, HeightVoteSetError>>,
    },
}

/// What the state machine tells the reactor.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReactorEvent {
    NewRoundStep(NewRoundStep),
    ValidBlock(NewValidBlock),
    HasVote(HasVote),
    /// A vote from this peer was added.
    PeerVote(NodeId),
    /// A block part from this peer was added.
    PeerBlockPart(NodeId),
}

/// A signature withheld while replaying the WAL. The WAL may already hold
/// what we signed before the crash, so signing is decided once replay is
/// over.
#[derive(Clone, Debug)]
enum Deferred {
    Proposal { height: i64, round: i32 },
    Vote {
        height: i64,
        round: i32,
        vote_type: VoteType,
        block_id: BlockId,
    },
}

/// The single owner of the round state.
pub struct ConsensusState {
    pub(crate) config: Config,
    /// Chain state after the last committed block.
    pub(crate) state: State,
    pub(crate) rs: RoundState,
    pub(crate) block_exec: Arc<BlockExecutor>,
    pub(crate) block_store: Arc<dyn BlockStore>,
    evidence_pool: Arc<dyn EvidencePool>,
    priv_validator: Option<Arc<dyn PrivValidator>>,
    priv_validator_pub_key: Option<PublicKey>,
    pub(crate) wal: Box<dyn Wal>,
    event_bus: EventBus,
    ticker: TimeoutTicker,
    tocks: mpsc::UnboundedReceiver<TimeoutInfo>,
    internal_queue: VecDeque<MsgInfo>,
    inputs: mpsc::Receiver<StateInput>,
    input_tx: mpsc::Sender<StateInput>,
    snapshot: watch::Sender<Arc<RoundState>>,
    /// Revision of the last snapshot.
    published: Revision,
    reactor_events: Option<mpsc::UnboundedSender<ReactorEvent>>,
    txs_available: Arc<Notify>,
    pub(crate) replay_mode: bool,
    deferred: Vec<Deferred>,
    pub(crate) do_wal_catchup: bool,
}

impl ConsensusState {
    pub fn new(
        config: Config,
        state: State,
        block_exec: Arc<BlockExecutor>,
        block_store: Arc<dyn BlockStore>,
        evidence_pool: Arc<dyn EvidencePool>,
        wal: Box<dyn Wal>,
        event_bus: EventBus,
    ) -> Result<Self, FatalError> {
        let (ticker, tocks) = TimeoutTicker::spawn();
        let (input_tx, inputs) = mpsc::channel(INPUT_QUEUE_SIZE);
        let (snapshot, _) = watch::channel(Arc::new(RoundState::default()));
        let txs_available = block_exec.mempool().txs_available();
        let mut cs = Self {
            config,
            state: State::default(),
            rs: RoundState::default(),
            block_exec,
            block_store,
            evidence_pool,
            priv_validator: None,
            priv_validator_pub_key: None,
            wal,
            event_bus,
            ticker,
            tocks,
            internal_queue: VecDeque::new(),
            inputs,
            input_tx,
            snapshot,
            published: Revision::default(),
            reactor_events: None,
            txs_available,
            replay_mode: false,
            deferred: Vec::new(),
            do_wal_catchup: true,
        };
        if state.last_block_height > 0 {
            cs.reconstruct_last_commit(&state)?;
        }
        cs.update_to_state(state)?;
        cs.publish();
        Ok(cs)
    }

    pub fn with_priv_validator(mut self, priv_validator: Arc<dyn PrivValidator>) -> Self {
        self.priv_validator_pub_key = Some(priv_validator.pub_key());
        self.priv_validator = Some(priv_validator);
        self
    }

    /// Skip replaying the WAL on start.
    pub fn without_wal_catchup(mut self) -> Self {
        self.do_wal_catchup = false;
        self
    }

    pub fn handle(&self) -> StateHandle {
        StateHandle {
            inputs: self.input_tx.clone(),
            round_state: self.snapshot.subscribe(),
            event_bus: self.event_bus.clone(),
        }
    }

    /// Events for the reactor. Nothing is queued before this is called.
    pub fn take_reactor_events(&mut self) -> mpsc::UnboundedReceiver<ReactorEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.reactor_events = Some(tx);
        rx
    }

    pub fn round_state(&self) -> &RoundState {
        &self.rs
    }

    pub fn chain_state(&self) -> &State {
        &self.state
    }

    /// Adopts a state reached by other means, typically block sync.
    pub fn switch_to_state(&mut self, state: State, skip_wal: bool) -> Result<(), FatalError> {
        if state.last_block_height > 0 {
            self.reconstruct_last_commit(&state)?;
        }
        self.update_to_state(state)?;
        if skip_wal {
            self.do_wal_catchup = false;
        }
        self.publish();
        Ok(())
    }

    /// Runs the state machine until `cancel` fires or a fatal error occurs.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<(), FatalError> {
        if self.do_wal_catchup {
            self.catchup_replay(self.rs.height).await?;
        }
        self.check_double_signing_risk(self.rs.height)?;
        self.schedule_round0();
        self.publish();

        let mut flush = tokio::time::interval(self.config.wal_flush_interval);
        flush.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        flush.tick().await;
        let txs_available = self.txs_available.clone();

        let result = loop {
            // Our own messages go first, and are synced to disk before they
            // take effect.
            if let Some(mi) = self.internal_queue.pop_front() {
                if let Err(e) = self.wal.write_sync(WalMessage::MsgInfo(mi.clone())) {
                    break Err(e.into());
                }
                if let Err(e) = self.handle_msg(mi).await {
                    break Err(e);
                }
                self.publish();
                continue;
            }

            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => break Ok(()),
                Some(input) = self.inputs.recv() => self.handle_input(input).await,
                Some(tock) = self.tocks.recv() => {
                    if let Err(e) = self.wal.write(WalMessage::Timeout(tock.clone())) {
                        tracing::error!(error = %e, "Failed writing timeout to the WAL");
                    }
                    self.handle_timeout(tock).await
                }
                _ = flush.tick() => {
                    if let Err(e) = self.wal.flush_and_sync() {
                        tracing::error!(error = %e, "Failed flushing the WAL");
                    }
                    Ok(())
                }
                _ = txs_available.notified(), if self.config.wait_for_txs() => {
                    self.handle_txs_available().await
                }
            };
            if let Err(e) = outcome {
                break Err(e);
            }
            self.publish();
        };

        self.ticker.stop();
        if let Err(e) = self.wal.flush_and_sync() {
            tracing::error!(error = %e, "Failed flushing the WAL on shutdown");
        }
        match &result {
            Ok(()) => tracing::debug!(height = self.rs.height, "Consensus stopped"),
            Err(e) => tracing::error!(error = %e, height = self.rs.height, "Consensus halted"),
        }
        result
    }

    async fn handle_input(&mut self, input: StateInput) -> Result<(), FatalError> {
        match input {
            StateInput::Msg(mi) if mi.peer_id.is_empty() => {
                self.internal_queue.push_back(mi);
                Ok(())
            }
            StateInput::Msg(mi) => {
                if let Err(e) = self.wal.write(WalMessage::MsgInfo(mi.clone())) {
                    tracing::error!(error = %e, "Failed writing message to the WAL");
                }
                self.handle_msg(mi).await
            }
            StateInput::PeerMaj23 { peer, maj23, reply } => {
                let _ = reply.send(self.set_peer_maj23(peer, maj23));
                Ok(())
            }
        }
    }

    fn set_peer_maj23(
        &mut self,
        peer: NodeId,
        maj23: VoteSetMaj23,
    ) -> Result<Option<VoteSetBits>, HeightVoteSetError> {
        if maj23.height != self.rs.height {
            return Ok(None);
        }
        self.rs
            .votes
            .set_peer_maj23(maj23.round, maj23.vote_type, peer, maj23.block_id.clone())?;
        let votes = self
            .rs
            .votes
            .vote_set(maj23.round, maj23.vote_type)
            .and_then(|votes| votes.bit_array_by_block_id(&maj23.block_id))
            .unwrap_or_else(|| BitArray::new(0));
        Ok(Some(VoteSetBits {
            height: maj23.height,
            round: maj23.round,
            vote_type: maj23.vote_type,
            block_id: maj23.block_id,
            votes,
        }))
    }

    /// Shares a snapshot of the round state, unless readers would find
    /// nothing new in it.
    fn publish(&mut self) {
        let revision = self.rs.revision();
        if revision == self.published {
            return;
        }
        self.snapshot.send_replace(Arc::new(self.rs.clone()));
        self.published = revision;
    }

    fn notify_reactor(&self, event: ReactorEvent) {
        if let Some(tx) = &self.reactor_events {
            let _ = tx.send(event);
        }
    }

    fn send_internal_message(&mut self, msg: Message) {
        self.internal_queue.push_back(MsgInfo::internal(msg));
    }

    // ---------------------------------------------------------------------
    // Messages and timeouts

    pub(crate) async fn handle_msg(&mut self, mi: MsgInfo) -> Result<(), FatalError> {
        let MsgInfo {
            msg,
            peer_id,
            receive_time,
        } = mi;
        let msg_type = msg.name();
        let result = match msg {
            Message::Proposal(proposal) => self.set_proposal(proposal, receive_time),
            Message::BlockPart(block_part) => {
                let round = block_part.round;
                match self.add_proposal_block_part(block_part) {
                    Ok(true) => {
                        if !peer_id.is_empty() {
                            self.notify_reactor(ReactorEvent::PeerBlockPart(peer_id.clone()));
                        }
                        if self.rs.proposal_block_parts.as_ref().is_some_and(PartSet::is_complete) {
                            self.handle_complete_proposal(self.rs.height).await?;
                        }
                        Ok(())
                    }
                    Ok(false) => Ok(()),
                    // Parts of blocks from other rounds are expected while
                    // catching up.
                    Err(e) if round != self.rs.round => {
                        tracing::debug!(height = self.rs.height, %round, error = %e, "Received block part from wrong round");
                        Ok(())
                    }
                    Err(e) => Err(e),
                }
            }
            Message::Vote(vote) => match self.try_add_vote(vote, &peer_id).await? {
                Ok(true) => {
                    if !peer_id.is_empty() {
                        self.notify_reactor(ReactorEvent::PeerVote(peer_id.clone()));
                    }
                    Ok(())
                }
                Ok(false) => Ok(()),
                Err(e) => Err(e),
            },
            other => {
                tracing::error!(msg_type = other.name(), "Unexpected message for the state machine");
                return Ok(());
            }
        };
        if let Err(error) = result {
            tracing::error!(
                height = self.rs.height,
                round = self.rs.round,
                peer = %peer_id,
                %msg_type,
                %error,
                "Failed to process message"
            );
        }
        Ok(())
    }

    pub(crate) async fn handle_timeout(&mut self, ti: TimeoutInfo) -> Result<(), FatalError> {
        let rs = &self.rs;
        if ti.height != rs.height || ti.round < rs.round || (ti.round == rs.round && ti.step < rs.step) {
            tracing::debug!(timeout = ?ti, current = %rs, "Ignoring tock because we are ahead");
            return Ok(());
        }
        match ti.step {
            Step::NewHeight => self.enter_new_round(ti.height, 0).await,
            Step::NewRound => self.enter_propose(ti.height, ti.round).await,
            Step::Propose => {
                self.event_bus.publish(Event::TimeoutPropose(self.rs.event()));
                self.enter_prevote(ti.height, ti.round).await
            }
            Step::PrevoteWait => {
                self.event_bus.publish(Event::TimeoutWait(self.rs.event()));
                self.enter_precommit(ti.height, ti.round)
            }
            Step::PrecommitWait => {
                self.event_bus.publish(Event::TimeoutWait(self.rs.event()));
                self.enter_precommit(ti.height, ti.round)?;
                self.enter_new_round(ti.height, ti.round + 1).await
            }
            step => Err(FatalError::Inconsistent(format!("invalid timeout step {step}"))),
        }
    }

    async fn handle_txs_available(&mut self) -> Result<(), FatalError> {
        if self.rs.round != 0 {
            return Ok(());
        }
        match self.rs.step {
            Step::NewHeight => {
                if self.need_proof_block(self.rs.height)? {
                    // Round 0 proposes right away anyway.
                    return Ok(());
                }
                // +1ms so the NewRound timeout lands after the NewHeight one.
                let until_start = self
                    .rs
                    .start_time
                    .duration_since(time::now())
                    .unwrap_or_default();
                self.schedule_timeout(until_start + TIME_IOTA, self.rs.height, 0, Step::NewRound);
                Ok(())
            }
            Step::NewRound => self.enter_propose(self.rs.height, 0).await,
            _ => Ok(()),
        }
    }

    fn schedule_timeout(&self, duration: Duration, height: i64, round: i32, step: Step) {
        self.ticker.schedule_timeout(TimeoutInfo {
            duration,
            height,
            round,
            step,
        });
    }

    fn schedule_round0(&self) {
        let sleep = self
            .rs
            .start_time
            .duration_since(time::now())
            .unwrap_or_default();
        self.schedule_timeout(sleep, self.rs.height, 0, Step::NewHeight);
    }

    // ---------------------------------------------------------------------
    // Proposals

    /// Accepts the proposal of the current round from its proposer.
    pub(crate) fn set_proposal(&mut self, proposal: Proposal, receive_time: SystemTime) -> Result<(), ConsensusError> {
        if self.rs.proposal.is_some() {
            return Ok(());
        }
        if proposal.height != self.rs.height || proposal.round != self.rs.round {
            return Ok(());
        }
        if proposal.pol_round < -1 || (proposal.pol_round >= 0 && proposal.pol_round >= proposal.round) {
            return Err(ConsensusError::InvalidProposalPolRound {
                pol_round: proposal.pol_round,
                round: proposal.round,
            });
        }

        let proposer = self
            .rs
            .validators
            .get_proposer()
            .ok_or_else(|| ConsensusError::UnknownValidator(-1))?;
        proposal
            .verify(&self.state.chain_id, &proposer.pub_key)
            .map_err(ConsensusError::InvalidProposalSignature)?;

        let max_bytes = self.max_block_bytes();
        let total = proposal.block_id.part_set_header.total;
        if total as i64 > (max_bytes - 1) / BLOCK_PART_SIZE_BYTES as i64 + 1 {
            return Err(ConsensusError::TooManyBlockParts(total));
        }

        tracing::info!(
            height = proposal.height,
            round = proposal.round,
            pol_round = proposal.pol_round,
            proposer = %fmt_hex(&proposer.address),
            "Received proposal"
        );
        // Keep the parts we already collect: we may be in the commit step, or
        // have a valid block for this round.
        if self.rs.proposal_block_parts.is_none() {
            self.rs.proposal_block_parts = Some(PartSet::from_header(&proposal.block_id.part_set_header));
        }
        self.rs.proposal = Some(proposal);
        self.rs.proposal_receive_time = Some(receive_time);
        Ok(())
    }

    /// Adds a part of the block we are waiting for. Once complete, the block
    /// is decoded and becomes the proposal block. Parts of any round are
    /// accepted since blocks are reused across rounds.
    pub(crate) fn add_proposal_block_part(&mut self, msg: BlockPart) -> Result<bool, ConsensusError> {
        if msg.height != self.rs.height {
            tracing::debug!(height = msg.height, round = msg.round, "Received block part from wrong height");
            return Ok(false);
        }
        let max_bytes = self.max_block_bytes();
        let Some(parts) = self.rs.proposal_block_parts.as_mut() else {
            tracing::debug!(height = msg.height, round = msg.round, "Received a block part when we are not expecting any");
            return Ok(false);
        };

        let added = parts.add_part(msg.part)?;
        if parts.byte_size() as i64 > max_bytes {
            return Err(ConsensusError::BlockTooBig {
                size: parts.byte_size(),
                max: max_bytes,
            });
        }
        if added && parts.is_complete() {
            let bytes = parts.assemble().ok_or_else(|| {
                ConsensusError::BlockDecode(BlockError::Decode("complete part set did not assemble".into()))
            })?;
            let block = Arc::new(Block::from_bytes(&bytes)?);
            let block_id = BlockId::new(block.hash(), parts.header());
            tracing::info!(height = block.height(), hash = %fmt_hex(&block_id.hash), "Received complete proposal block");
            self.rs.proposal_block = Some(block);
            self.event_bus.publish(Event::CompleteProposal {
                round_state: self.rs.event(),
                block_id,
            });
        }
        Ok(added)
    }

    async fn handle_complete_proposal(&mut self, height: i64) -> Result<(), FatalError> {
        let round = self.rs.round;
        let polka = self
            .rs
            .votes
            .prevotes(round)
            .and_then(|prevotes| prevotes.two_thirds_majority())
            .cloned();
        if let Some(block_id) = &polka {
            if !block_id.is_nil() && self.rs.valid_round < round && self.proposal_block_hashes_to(&block_id.hash) {
                tracing::debug!(%height, %round, "Updating valid block to new proposal block");
                self.rs.valid_round = round;
                self.rs.valid_block = self.rs.proposal_block.clone();
                self.rs.valid_block_parts = self.rs.proposal_block_parts.clone();
            }
        }

        if self.rs.step <= Step::Propose && self.rs.is_proposal_complete() {
            self.enter_prevote(height, round).await?;
            if polka.is_some() {
                self.enter_precommit(height, round)?;
            }
        } else if self.rs.step == Step::Commit {
            self.try_finalize_commit(height).await?;
        }
        Ok(())
    }

    fn proposal_block_hashes_to(&self, hash: &[u8]) -> bool {
        self.rs
            .proposal_block
            .as_ref()
            .is_some_and(|block| block.hashes_to(hash))
    }

    fn locked_block_hashes_to(&self, hash: &[u8]) -> bool {
        self.rs
            .locked_block
            .as_ref()
            .is_some_and(|block| block.hashes_to(hash))
    }

    fn max_block_bytes(&self) -> i64 {
        match self.state.consensus_params.block.max_bytes {
            -1 => MAX_BLOCK_SIZE_BYTES,
            max => max,
        }
    }

    /// Whether the next block has to be proposed right away to commit to a
    /// changed application hash.
    fn need_proof_block(&self, height: i64) -> Result<bool, FatalError> {
        if height == self.state.initial_height {
            return Ok(true);
        }
        let meta = self
            .block_store
            .load_block_meta(height - 1)
            .ok_or_else(|| FatalError::Inconsistent(format!("block meta for height {} not found", height - 1)))?;
        Ok(self.state.app_hash != meta.header.app_hash)
    }

    // ---------------------------------------------------------------------
    // Votes

    /// Adds a vote, reporting equivocation to the evidence pool. The outer
    /// result carries fatal errors, the inner one rejected votes.
    async fn try_add_vote(
        &mut self,
        vote: Vote,
        peer: &NodeId,
    ) -> Result<Result<bool, ConsensusError>, FatalError> {
        match self.add_vote(vote, peer).await? {
            Ok(added) => Ok(Ok(added)),
            Err(ConsensusError::VoteSet(VoteSetError::ConflictingVote { existing, new, added })) => {
                let own = self
                    .own_address()
                    .is_some_and(|address| address == new.validator_address);
                if own {
                    tracing::error!(
                        height = new.height,
                        round = new.round,
                        vote_type = %new.vote_type,
                        "Found conflicting vote from ourselves; did you reset a validator?"
                    );
                } else {
                    tracing::debug!(
                        height = new.height,
                        round = new.round,
                        validator = %fmt_hex(&new.validator_address),
                        "Found conflicting votes, reporting them as evidence"
                    );
                    self.evidence_pool
                        .report_conflicting_votes((*existing).clone(), (*new).clone());
                }
                Ok(Err(ConsensusError::VoteSet(VoteSetError::ConflictingVote { existing, new, added })))
            }
            Err(e) => {
                tracing::info!(error = %e, "Failed attempting to add vote");
                Ok(Err(e))
            }
        }
    }

    /// Adds a vote and advances the state machine on the majorities it
    /// completes. A conflicting vote that was still tracked is processed
    /// before the conflict is returned.
    pub(crate) async fn add_vote(
        &mut self,
        vote: Vote,
        peer: &NodeId,
    ) -> Result<Result<bool, ConsensusError>, FatalError> {
        // Late precommits for the previous height, while waiting for the
        // commit timeout.
        if vote.height + 1 == self.rs.height && vote.vote_type == VoteType::Precommit {
            if self.rs.step != Step::NewHeight {
                tracing::debug!(%vote, "Precommit vote came in after commit timeout and has been ignored");
                return Ok(Ok(false));
            }
            let Some(last_commit) = self.rs.last_commit.as_mut() else {
                return Ok(Ok(false));
            };
            let added = match last_commit.add_vote(vote.clone()) {
                Ok(added) => added,
                Err(e) => return Ok(Err(e.into())),
            };
            if !added {
                return Ok(Ok(false));
            }
            let has_all = last_commit.has_all();
            tracing::debug!(%vote, "Added vote to last precommits");
            self.vote_added(&vote);
            if self.config.skip_timeout_commit && has_all {
                self.enter_new_round(self.rs.height, 0).await?;
            }
            return Ok(Ok(true));
        }

        if vote.height != self.rs.height {
            tracing::debug!(vote_height = vote.height, height = self.rs.height, %peer, "Vote ignored and not added");
            return Ok(Ok(false));
        }

        let height = self.rs.height;
        let (added, conflict) = match self.rs.votes.add_vote(vote.clone(), peer) {
            Ok(added) => (added, None),
            Err(HeightVoteSetError::VoteSet(VoteSetError::ConflictingVote { existing, new, added })) => {
                (added, Some(VoteSetError::ConflictingVote { existing, new, added }))
            }
            Err(e) => return Ok(Err(e.into())),
        };
        if !added {
            return Ok(conflict.map_or(Ok(false), |e| Err(e.into())));
        }
        self.vote_added(&vote);

        match vote.vote_type {
            VoteType::Prevote => self.on_prevote_added(height, &vote).await?,
            VoteType::Precommit => self.on_precommit_added(height, &vote).await?,
        }
        Ok(conflict.map_or(Ok(true), |e| Err(e.into())))
    }

    fn vote_added(&self, vote: &Vote) {
        self.event_bus.publish(Event::Vote(vote.clone()));
        self.notify_reactor(ReactorEvent::HasVote(HasVote {
            height: vote.height,
            round: vote.round,
            vote_type: vote.vote_type,
            index: vote.validator_index,
        }));
    }

    async fn on_prevote_added(&mut self, height: i64, vote: &Vote) -> Result<(), FatalError> {
        let (polka, has_two_thirds_any) = match self.rs.votes.prevotes(vote.round) {
            Some(prevotes) => (prevotes.two_thirds_majority().cloned(), prevotes.has_two_thirds_any()),
            None => return Ok(()),
        };
        tracing::debug!(%vote, votes = %self.rs.votes, "Added vote to prevotes");

        if let Some(block_id) = &polka {
            // A more recent polka for another block releases our lock.
            if self.rs.locked_block.is_some()
                && self.rs.locked_round < vote.round
                && vote.round <= self.rs.round
                && !self.locked_block_hashes_to(&block_id.hash)
            {
                tracing::debug!(locked_round = self.rs.locked_round, pol_round = vote.round, "Unlocking because of POL");
                self.rs.locked_round = -1;
                self.rs.locked_block = None;
                self.rs.locked_block_parts = None;
            }

            if !block_id.is_nil() && self.rs.valid_round < vote.round && vote.round == self.rs.round {
                if self.proposal_block_hashes_to(&block_id.hash) {
                    tracing::debug!(valid_round = self.rs.valid_round, pol_round = vote.round, "Updating valid block because of POL");
                    self.rs.valid_round = vote.round;
                    self.rs.valid_block = self.rs.proposal_block.clone();
                    self.rs.valid_block_parts = self.rs.proposal_block_parts.clone();
                } else {
                    tracing::debug!(block = %fmt_hex(&block_id.hash), "Valid block we do not know about, dropping the proposal block");
                    self.rs.proposal_block = None;
                }
                if !self
                    .rs
                    .proposal_block_parts
                    .as_ref()
                    .is_some_and(|parts| parts.has_header(&block_id.part_set_header))
                {
                    self.rs.proposal_block_parts = Some(PartSet::from_header(&block_id.part_set_header));
                }
                self.fire_valid_block();
            }
        }

        if self.rs.round < vote.round && has_two_thirds_any {
            // Skip to the round others are in.
            self.enter_new_round(height, vote.round).await?;
        } else if self.rs.round == vote.round && Step::Prevote <= self.rs.step {
            match &polka {
                Some(block_id) if self.rs.is_proposal_complete() || block_id.is_nil() => {
                    self.enter_precommit(height, vote.round)?;
                }
                _ if has_two_thirds_any => self.enter_prevote_wait(height, vote.round)?,
                _ => {}
            }
        } else if self
            .rs
            .proposal
            .as_ref()
            .is_some_and(|proposal| proposal.pol_round >= 0 && proposal.pol_round == vote.round)
        {
            // The polka the proposal refers to is now complete.
            if self.rs.is_proposal_complete() {
                self.enter_prevote(height, self.rs.round).await?;
            }
        }
        Ok(())
    }

    async fn on_precommit_added(&mut self, height: i64, vote: &Vote) -> Result<(), FatalError> {
        let (maj23, has_two_thirds_any, has_all) = match self.rs.votes.precommits(vote.round) {
            Some(precommits) => (
                precommits.two_thirds_majority().cloned(),
                precommits.has_two_thirds_any(),
                precommits.has_all(),
            ),
            None => return Ok(()),
        };
        tracing::debug!(%vote, votes = %self.rs.votes, "Added vote to precommits");

        match maj23 {
            Some(block_id) => {
                // The majority may be from a later round.
                self.enter_new_round(height, vote.round).await?;
                self.enter_precommit(height, vote.round)?;
                if !block_id.is_nil() {
                    self.enter_commit(height, vote.round).await?;
                    if self.config.skip_timeout_commit && has_all {
                        self.enter_new_round(self.rs.height, 0).await?;
                    }
                } else {
                    self.enter_precommit_wait(height, vote.round)?;
                }
            }
            None if self.rs.round <= vote.round && has_two_thirds_any => {
                self.enter_new_round(height, vote.round).await?;
                self.enter_precommit_wait(height, vote.round)?;
            }
            None => {}
        }
        Ok(())
    }

    fn vote_time(&self) -> SystemTime {
        let now = time::now();
        let min_vote_time = match (&self.rs.locked_block, &self.rs.proposal_block) {
            (Some(block), _) | (None, Some(block)) => block.header.time + TIME_IOTA,
            (None, None) => now,
        };
        now.max(min_vote_time)
    }

    fn own_address(&self) -> Option<Vec<u8>> {
        self.priv_validator_pub_key.as_ref().map(PublicKey::address)
    }

    fn sign_vote(&mut self, vote_type: VoteType, block_id: BlockId) -> Result<Vote, ConsensusError> {
        // Flush first, so a restart cannot make us sign something different
        // for the same step.
        if let Err(e) = self.wal.flush_and_sync() {
            tracing::error!(error = %e, "Failed flushing the WAL before signing");
        }
        let (Some(priv_validator), Some(address)) = (&self.priv_validator, self.own_address()) else {
            return Err(ConsensusError::Sign(anyhow::anyhow!("no private validator")));
        };
        let (validator_index, _) = self
            .rs
            .validators
            .get_by_address(&address)
            .ok_or(ConsensusError::UnknownValidator(-1))?;
        let mut vote = Vote {
            vote_type,
            height: self.rs.height,
            round: self.rs.round,
            block_id,
            timestamp: self.vote_time(),
            validator_address: address,
            validator_index,
            signature: Vec::new(),
        };
        priv_validator
            .sign_vote(&self.state.chain_id, &mut vote)
            .map_err(|e| ConsensusError::Sign(e.into()))?;
        Ok(vote)
    }

    /// Signs a vote for the current round and queues it for ourselves. Does
    /// nothing unless we are a validator of this height.
    fn sign_add_vote(&mut self, vote_type: VoteType, block_id: BlockId) {
        let Some(address) = self.own_address() else {
            return;
        };
        if self.priv_validator.is_none() || !self.rs.validators.has_address(&address) {
            return;
        }
        if self.replay_mode {
            self.deferred.push(Deferred::Vote {
                height: self.rs.height,
                round: self.rs.round,
                vote_type,
                block_id,
            });
            return;
        }
        match self.sign_vote(vote_type, block_id) {
            Ok(vote) => {
                tracing::debug!(height = self.rs.height, round = self.rs.round, %vote, "Signed and pushed vote");
                self.send_internal_message(Message::Vote(vote));
            }
            Err(error) => {
                tracing::error!(height = self.rs.height, round = self.rs.round, %vote_type, %error, "Failed signing vote");
            }
        }
    }

    /// Signs whatever replay left unsigned and is still current.
    pub(crate) async fn resume_deferred_signing(&mut self) -> Result<(), FatalError> {
        let address = self.own_address();
        for deferred in std::mem::take(&mut self.deferred) {
            match deferred {
                Deferred::Proposal { height, round } => {
                    if height == self.rs.height
                        && round == self.rs.round
                        && self.rs.proposal.is_none()
                        && self.rs.step <= Step::Propose
                    {
                        tracing::info!(%height, %round, "Proposing after replay");
                        self.decide_proposal(height, round).await;
                    }
                }
                Deferred::Vote {
                    height,
                    round,
                    vote_type,
                    block_id,
                } => {
                    let signed = address.as_ref().is_some_and(|address| {
                        self.rs
                            .votes
                            .vote_set(round, vote_type)
                            .is_some_and(|votes| votes.get_by_address(address).is_some())
                    });
                    if height == self.rs.height && round == self.rs.round && !signed {
                        tracing::info!(%height, %round, %vote_type, "Voting after replay");
                        self.sign_add_vote(vote_type, block_id);
                    }
                }
            }
        }
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Steps

    fn update_round_step(&mut self, round: i32, step: Step) {
        self.rs.round = round;
        self.rs.step = step;
    }

    /// Announces the current step: WAL, event bus and reactor.
    fn new_step(&mut self) {
        let event = self.rs.event();
        if let Err(e) = self.wal.write(WalMessage::RoundState(event.clone())) {
            tracing::error!(error = %e, "Failed writing round state to the WAL");
        }
        self.event_bus.publish(Event::NewRoundStep(event));
        self.notify_reactor(ReactorEvent::NewRoundStep(self.rs.new_round_step_message()));
    }

    fn fire_valid_block(&mut self) {
        self.event_bus.publish(Event::ValidBlock(self.rs.event()));
        if let Some(msg) = self.rs.new_valid_block_message() {
            self.notify_reactor(ReactorEvent::ValidBlock(msg));
        }
    }

    pub(crate) async fn enter_new_round(&mut self, height: i64, round: i32) -> Result<(), FatalError> {
        let rs = &self.rs;
        if rs.height != height || round < rs.round || (rs.round == round && rs.step != Step::NewHeight) {
            tracing::debug!(%height, %round, current = %rs, "Entering new round with invalid args");
            return Ok(());
        }
        tracing::debug!(%height, %round, current = %rs, "Entering new round");

        if self.rs.round < round {
            self.rs.validators = Arc::new(
                self.rs
                    .validators
                    .copy_increment_proposer_priority(round - self.rs.round),
            );
        }
        self.update_round_step(round, Step::NewRound);
        // Round 0 proposal data was reset with the height, and a proposal
        // for it may already be in.
        if round != 0 {
            self.rs.proposal = None;
            self.rs.proposal_receive_time = None;
            self.rs.proposal_block = None;
            self.rs.proposal_block_parts = None;
        }
        // Track the next round too, to allow round skipping.
        self.rs.votes.set_round(round + 1);
        self.rs.triggered_timeout_precommit = false;

        let proposer = self
            .rs
            .validators
            .get_proposer()
            .map(|validator| validator.address.clone())
            .unwrap_or_default();
        self.event_bus.publish(Event::NewRound {
            round_state: self.rs.event(),
            proposer,
        });

        let wait_for_txs = self.config.wait_for_txs() && round == 0 && !self.need_proof_block(height)?;
        if wait_for_txs {
            if !self.config.create_empty_blocks_interval.is_zero() {
                self.schedule_timeout(self.config.create_empty_blocks_interval, height, round, Step::NewRound);
            }
            Ok(())
        } else {
            self.enter_propose(height, round).await
        }
    }

    pub(crate) async fn enter_propose(&mut self, height: i64, round: i32) -> Result<(), FatalError> {
        let rs = &self.rs;
        if rs.height != height || round < rs.round || (rs.round == round && Step::Propose <= rs.step) {
            tracing::debug!(%height, %round, current = %rs, "Entering propose step with invalid args");
            return Ok(());
        }
        tracing::debug!(%height, %round, current = %rs, "Entering propose step");

        self.schedule_timeout(self.config.propose(round), height, round, Step::Propose);

        if let Some(address) = self.own_address() {
            if !self.rs.validators.has_address(&address) {
                tracing::debug!(%height, %round, "Not proposing, not in the validator set");
            } else if self
                .rs
                .validators
                .get_proposer()
                .is_some_and(|proposer| proposer.address == address)
            {
                tracing::debug!(%height, %round, "Our turn to propose");
                if self.replay_mode {
                    self.deferred.push(Deferred::Proposal { height, round });
                } else {
                    self.decide_proposal(height, round).await;
                }
            } else {
                tracing::debug!(%height, %round, "Not our turn to propose");
            }
        }

        self.update_round_step(round, Step::Propose);
        self.new_step();
        if self.rs.is_proposal_complete() {
            self.enter_prevote(height, self.rs.round).await?;
        }
        Ok(())
    }

    /// Signs a proposal for the valid block, or a fresh block, and queues it
    /// with its parts for ourselves.
    async fn decide_proposal(&mut self, height: i64, round: i32) {
        let (block, parts) = match (&self.rs.valid_block, &self.rs.valid_block_parts) {
            (Some(block), Some(parts)) => (block.clone(), parts.clone()),
            _ => match self.create_proposal_block(height).await {
                Ok(block) => {
                    let parts = block.make_part_set(BLOCK_PART_SIZE_BYTES);
                    (Arc::new(block), parts)
                }
                Err(error) => {
                    tracing::error!(%height, %round, %error, "Unable to create proposal block");
                    return;
                }
            },
        };

        if let Err(error) = self.wal.flush_and_sync() {
            tracing::error!(%error, "Failed flushing the WAL before signing the proposal");
        }

        let block_id = BlockId::new(block.hash(), parts.header());
        let mut proposal = Proposal::new(height, round, self.rs.valid_round, block_id);
        let Some(priv_validator) = &self.priv_validator else {
            return;
        };
        if let Err(error) = priv_validator.sign_proposal(&self.state.chain_id, &mut proposal) {
            tracing::error!(%height, %round, %error, "Failed signing proposal");
            return;
        }
        tracing::debug!(%height, %round, %proposal, "Signed proposal");
        self.send_internal_message(Message::Proposal(proposal));
        for index in 0..parts.total() as usize {
            if let Some(part) = parts.get_part(index) {
                self.send_internal_message(Message::BlockPart(BlockPart {
                    height,
                    round,
                    part: (*part).clone(),
                }));
            }
        }
    }

    async fn create_proposal_block(&self, height: i64) -> Result<Block, ConsensusError> {
        let last_commit = if height == self.state.initial_height {
            Commit::default()
        } else {
            self.rs
                .last_commit
                .as_ref()
                .ok_or(VoteSetError::NoMajority)?
                .make_commit()?
        };
        let proposer = self
            .own_address()
            .ok_or_else(|| ConsensusError::Sign(anyhow::anyhow!("no private validator")))?;
        let time = time::now().max(self.state.last_block_time + TIME_IOTA);
        // The application builds the block; a panic there must not take the
        // state machine down with it.
        let creating = self
            .block_exec
            .create_proposal_block(height, &self.state, last_commit, proposer, time);
        match AssertUnwindSafe(creating).catch_unwind().await {
            Ok(block) => block.map_err(ConsensusError::CreateBlock),
            Err(panic) => Err(ConsensusError::CreateBlockPanicked(panic_message(panic.as_ref()))),
        }
    }

    pub(crate) async fn enter_prevote(&mut self, height: i64, round: i32) -> Result<(), FatalError> {
        let rs = &self.rs;
        if rs.height != height || round < rs.round || (rs.round == round && Step::Prevote <= rs.step) {
            tracing::debug!(%height, %round, current = %rs, "Entering prevote step with invalid args");
            return Ok(());
        }
        tracing::debug!(%height, %round, current = %rs, "Entering prevote step");
        self.do_prevote(height, round).await?;
        self.update_round_step(round, Step::Prevote);
        self.new_step();
        Ok(())
    }

    async fn do_prevote(&mut self, height: i64, round: i32) -> Result<(), FatalError> {
        if let (Some(block), Some(parts)) = (&self.rs.locked_block, &self.rs.locked_block_parts) {
            tracing::debug!(%height, %round, "Already locked on a block, prevoting it");
            let block_id = BlockId::new(block.hash(), parts.header());
            self.sign_add_vote(VoteType::Prevote, block_id);
            return Ok(());
        }

        let (Some(block), Some(parts)) = (self.rs.proposal_block.clone(), &self.rs.proposal_block_parts) else {
            tracing::debug!(%height, %round, "Proposal block is nil, prevoting nil");
            self.sign_add_vote(VoteType::Prevote, BlockId::default());
            return Ok(());
        };
        let block_id = BlockId::new(block.hash(), parts.header());

        if let Err(error) = self.block_exec.validate_block(&self.state, &block) {
            tracing::error!(%height, %round, %error, "Proposal block is invalid, prevoting nil");
            self.sign_add_vote(VoteType::Prevote, BlockId::default());
            return Ok(());
        }

        let accepted = self
            .block_exec
            .process_proposal(&block, &self.state)
            .await
            .map_err(FatalError::ProcessProposal)?;
        if !accepted {
            tracing::error!(%height, %round, "Application rejected the proposal block, prevoting nil");
            self.sign_add_vote(VoteType::Prevote, BlockId::default());
            return Ok(());
        }

        tracing::debug!(%height, %round, "Proposal block is valid");
        self.sign_add_vote(VoteType::Prevote, block_id);
        Ok(())
    }

    fn enter_prevote_wait(&mut self, height: i64, round: i32) -> Result<(), FatalError> {
        let rs = &self.rs;
        if rs.height != height || round < rs.round || (rs.round == round && Step::PrevoteWait <= rs.step) {
            tracing::debug!(%height, %round, current = %rs, "Entering prevote wait step with invalid args");
            return Ok(());
        }
        if !self
            .rs
            .votes
            .prevotes(round)
            .is_some_and(VoteSet::has_two_thirds_any)
        {
            return Err(FatalError::Inconsistent(format!(
                "entering prevote wait at {height}/{round} without +2/3 prevotes"
            )));
        }
        tracing::debug!(%height, %round, current = %self.rs, "Entering prevote wait step");
        self.schedule_timeout(self.config.prevote(round), height, round, Step::PrevoteWait);
        self.update_round_step(round, Step::PrevoteWait);
        self.new_step();
        Ok(())
    }

    /// Precommits the block with a polka in `round`, locking on it, or nil
    /// without one.
    pub(crate) fn enter_precommit(&mut self, height: i64, round: i32) -> Result<(), FatalError> {
        let rs = &self.rs;
        if rs.height != height || round < rs.round || (rs.round == round && Step::Precommit <= rs.step) {
            tracing::debug!(%height, %round, current = %rs, "Entering precommit step with invalid args");
            return Ok(());
        }
        tracing::debug!(%height, %round, current = %rs, "Entering precommit step");
        self.do_precommit(height, round)?;
        self.update_round_step(round, Step::Precommit);
        self.new_step();
        Ok(())
    }

    fn do_precommit(&mut self, height: i64, round: i32) -> Result<(), FatalError> {
        let polka = self
            .rs
            .votes
            .prevotes(round)
            .and_then(|prevotes| prevotes.two_thirds_majority())
            .cloned();
        let Some(block_id) = polka else {
            tracing::debug!(%height, %round, locked = self.rs.locked_block.is_some(), "No +2/3 prevotes, precommitting nil");
            self.sign_add_vote(VoteType::Precommit, BlockId::default());
            return Ok(());
        };

        self.event_bus.publish(Event::Polka(self.rs.event()));
        match self.rs.votes.pol_info() {
            Some((pol_round, _)) if pol_round >= round => {}
            other => {
                return Err(FatalError::Inconsistent(format!(
                    "POL round should be {round}, got {:?}",
                    other.map(|(r, _)| r)
                )))
            }
        }

        if block_id.is_nil() {
            if self.rs.locked_block.is_some() {
                tracing::debug!(%height, %round, "+2/3 prevoted for nil, unlocking");
                self.rs.locked_round = -1;
                self.rs.locked_block = None;
                self.rs.locked_block_parts = None;
            } else {
                tracing::debug!(%height, %round, "+2/3 prevoted for nil");
            }
            self.sign_add_vote(VoteType::Precommit, BlockId::default());
            return Ok(());
        }

        if self.locked_block_hashes_to(&block_id.hash) {
            tracing::debug!(%height, %round, "+2/3 prevoted the locked block, relocking");
            self.rs.locked_round = round;
            self.event_bus.publish(Event::Relock(self.rs.event()));
            self.sign_add_vote(VoteType::Precommit, block_id);
            return Ok(());
        }

        if let Some(block) = self.rs.proposal_block.clone() {
            if block.hashes_to(&block_id.hash) {
                tracing::debug!(%height, %round, hash = %fmt_hex(&block_id.hash), "+2/3 prevoted the proposal block, locking");
                self.block_exec
                    .validate_block(&self.state, &block)
                    .map_err(|source| FatalError::InvalidPolkaBlock { height, source })?;
                self.rs.locked_round = round;
                self.rs.locked_block = Some(block);
                self.rs.locked_block_parts = self.rs.proposal_block_parts.clone();
                self.event_bus.publish(Event::Lock(self.rs.event()));
                self.sign_add_vote(VoteType::Precommit, block_id);
                return Ok(());
            }
        }

        // A polka for a block we do not have: unlock, fetch it, vote nil.
        tracing::debug!(%height, %round, block = %block_id, "+2/3 prevotes for a block we do not have, precommitting nil");
        self.rs.locked_round = -1;
        self.rs.locked_block = None;
        self.rs.locked_block_parts = None;
        if !self
            .rs
            .proposal_block_parts
            .as_ref()
            .is_some_and(|parts| parts.has_header(&block_id.part_set_header))
        {
            self.rs.proposal_block = None;
            self.rs.proposal_block_parts = Some(PartSet::from_header(&block_id.part_set_header));
        }
        self.sign_add_vote(VoteType::Precommit, BlockId::default());
        Ok(())
    }

    fn enter_precommit_wait(&mut self, height: i64, round: i32) -> Result<(), FatalError> {
        let rs = &self.rs;
        if rs.height != height || round < rs.round || (rs.round == round && rs.triggered_timeout_precommit) {
            tracing::debug!(%height, %round, current = %rs, triggered = rs.triggered_timeout_precommit, "Entering precommit wait step with invalid args");
            return Ok(());
        }
        if !self
            .rs
            .votes
            .precommits(round)
            .is_some_and(VoteSet::has_two_thirds_any)
        {
            return Err(FatalError::Inconsistent(format!(
                "entering precommit wait at {height}/{round} without +2/3 precommits"
            )));
        }
        tracing::debug!(%height, %round, current = %self.rs, "Entering precommit wait step");
        self.schedule_timeout(self.config.precommit(round), height, round, Step::PrecommitWait);
        self.rs.triggered_timeout_precommit = true;
        self.new_step();
        Ok(())
    }

    pub(crate) async fn enter_commit(&mut self, height: i64, commit_round: i32) -> Result<(), FatalError> {
        if self.rs.height != height || Step::Commit <= self.rs.step {
            tracing::debug!(%height, %commit_round, current = %self.rs, "Entering commit step with invalid args");
            return Ok(());
        }
        tracing::debug!(%height, %commit_round, current = %self.rs, "Entering commit step");

        let block_id = self
            .rs
            .votes
            .precommits(commit_round)
            .and_then(|precommits| precommits.two_thirds_majority())
            .cloned()
            .ok_or_else(|| FatalError::Inconsistent("entering commit without +2/3 precommits".into()))?;

        // The lock no longer matters. Keep the locked block if it is the one
        // being committed.
        if self.locked_block_hashes_to(&block_id.hash) {
            tracing::debug!(%height, hash = %fmt_hex(&block_id.hash), "Commit is for the locked block");
            self.rs.proposal_block = self.rs.locked_block.clone();
            self.rs.proposal_block_parts = self.rs.locked_block_parts.clone();
        }

        let mut fetch = false;
        if !self.proposal_block_hashes_to(&block_id.hash)
            && !self
                .rs
                .proposal_block_parts
                .as_ref()
                .is_some_and(|parts| parts.has_header(&block_id.part_set_header))
        {
            tracing::info!(%height, block = %block_id, "Commit is for a block we do not know about");
            self.rs.proposal_block = None;
            self.rs.proposal_block_parts = Some(PartSet::from_header(&block_id.part_set_header));
            fetch = true;
        }

        self.update_round_step(self.rs.round, Step::Commit);
        self.rs.commit_round = commit_round;
        self.rs.commit_time = time::now();
        self.new_step();
        // Announced after the step changes, so peers learn we are committing.
        if fetch {
            self.fire_valid_block();
        }

        self.try_finalize_commit(height).await
    }

    async fn try_finalize_commit(&mut self, height: i64) -> Result<(), FatalError> {
        if self.rs.height != height {
            return Err(FatalError::Inconsistent(format!(
                "finalizing height {height} at height {}",
                self.rs.height
            )));
        }
        let block_id = self
            .rs
            .votes
            .precommits(self.rs.commit_round)
            .and_then(|precommits| precommits.two_thirds_majority())
            .cloned();
        match block_id {
            Some(block_id) if !block_id.is_nil() => {
                if !self.proposal_block_hashes_to(&block_id.hash) {
                    tracing::debug!(%height, block = %block_id, "Cannot finalize commit yet, we do not have the block");
                    return Ok(());
                }
                self.finalize_commit(height).await
            }
            _ => {
                tracing::error!(%height, "Failed attempt to finalize commit, no +2/3 majority for a block");
                Ok(())
            }
        }
    }

    /// Saves, executes and commits the decided block, then moves on to the
    /// next height.
    pub(crate) async fn finalize_commit(&mut self, height: i64) -> Result<(), FatalError> {
        if self.rs.height != height || self.rs.step != Step::Commit {
            tracing::debug!(%height, current = %self.rs, "Entering finalize commit step with invalid args");
            return Ok(());
        }

        let precommits = self
            .rs
            .votes
            .precommits(self.rs.commit_round)
            .ok_or_else(|| FatalError::Inconsistent("no precommits for the commit round".into()))?;
        let block_id = precommits
            .two_thirds_majority()
            .cloned()
            .ok_or_else(|| FatalError::Inconsistent("cannot finalize commit without +2/3 majority".into()))?;
        let (Some(block), Some(parts)) = (self.rs.proposal_block.clone(), self.rs.proposal_block_parts.clone()) else {
            return Err(FatalError::Inconsistent("finalizing commit without the block".into()));
        };
        if !parts.has_header(&block_id.part_set_header) {
            return Err(FatalError::Inconsistent("block parts do not match the commit".into()));
        }
        if !block.hashes_to(&block_id.hash) {
            return Err(FatalError::Inconsistent("proposal block does not hash to the commit".into()));
        }
        self.block_exec
            .validate_block(&self.state, &block)
            .map_err(|source| FatalError::InvalidCommittedBlock { height, source })?;

        tracing::info!(
            %height,
            hash = %fmt_hex(&block_id.hash),
            app_hash = %fmt_hex(&block.header.app_hash),
            num_txs = block.data.txs.len(),
            "Finalizing commit of block"
        );

        if self.block_store.height() < block.height() {
            let seen_commit = precommits.make_commit().map_err(FatalError::LastCommit)?;
            self.block_store.save_block(block.clone(), &parts, seen_commit);
        } else {
            // Saved before a crash, but never applied.
            tracing::debug!(%height, "Calling finalize commit on an already stored block");
        }

        // The block is stored: after a restart the handshake applies it if
        // we crash before doing so here.
        self.wal.write_sync(WalMessage::EndHeight(height))?;

        let (state, _) = self
            .block_exec
            .apply_block(self.state.clone(), block_id, &block)
            .await
            .map_err(|source| FatalError::ApplyBlock { height, source })?;

        self.update_to_state(state)?;
        if let Some(priv_validator) = &self.priv_validator {
            self.priv_validator_pub_key = Some(priv_validator.pub_key());
        }
        self.schedule_round0();
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Heights

    /// Rebuilds the precommits of the last height from the stored commit.
    pub(crate) fn reconstruct_last_commit(&mut self, state: &State) -> Result<(), FatalError> {
        let height = state.last_block_height;
        let commit = self
            .block_store
            .load_seen_commit()
            .filter(|commit| commit.height == height)
            .or_else(|| self.block_store.load_block_commit(height))
            .ok_or_else(|| FatalError::Inconsistent(format!("commit for height {height} not found")))?;
        let votes = VoteSet::from_commit(
            state.chain_id.clone(),
            &commit,
            Arc::new(state.last_validators.clone()),
        )
        .map_err(FatalError::LastCommit)?;
        if !votes.has_two_thirds_majority() {
            return Err(FatalError::LastCommit(VoteSetError::NoMajority));
        }
        self.rs.last_commit = Some(votes);
        Ok(())
    }

    /// Resets the round state for the height after `state`.
    pub(crate) fn update_to_state(&mut self, state: State) -> Result<(), FatalError> {
        if self.rs.commit_round > -1 && self.rs.height > 0 && self.rs.height != state.last_block_height {
            return Err(FatalError::Inconsistent(format!(
                "expected state height {}, found {}",
                self.rs.height, state.last_block_height
            )));
        }
        if !self.state.is_empty() {
            if self.state.last_block_height > 0 && self.state.last_block_height + 1 != self.rs.height {
                return Err(FatalError::Inconsistent(format!(
                    "state height {} does not precede round state height {}",
                    self.state.last_block_height, self.rs.height
                )));
            }
            if state.last_block_height <= self.state.last_block_height {
                // Nothing new, but peers still need our step.
                tracing::debug!(
                    new_height = state.last_block_height + 1,
                    old_height = self.state.last_block_height + 1,
                    "Ignoring update to an older state"
                );
                self.new_step();
                return Ok(());
            }
        }

        if state.last_block_height == 0 {
            self.rs.last_commit = None;
        } else if self.rs.commit_round > -1 {
            let precommits = self
                .rs
                .votes
                .precommits(self.rs.commit_round)
                .filter(|precommits| precommits.has_two_thirds_majority())
                .ok_or_else(|| {
                    FatalError::Inconsistent(format!(
                        "precommits of round {} have no +2/3 majority",
                        self.rs.commit_round
                    ))
                })?;
            self.rs.last_commit = Some(precommits.clone());
        } else if self.rs.last_commit.is_none() {
            return Err(FatalError::Inconsistent(format!(
                "last commit cannot be empty after the initial block (height {})",
                state.last_block_height + 1
            )));
        }

        let height = state.next_height();
        let validators = Arc::new(state.validators.clone());
        self.rs.height = height;
        self.update_round_step(0, Step::NewHeight);
        self.rs.start_time = if self.rs.commit_time == SystemTime::UNIX_EPOCH {
            // Leave time for transactions to come in for the first block.
            self.config.commit(time::now())
        } else {
            self.config.commit(self.rs.commit_time)
        };
        self.rs.validators = validators.clone();
        self.rs.proposal = None;
        self.rs.proposal_receive_time = None;
        self.rs.proposal_block = None;
        self.rs.proposal_block_parts = None;
        self.rs.locked_round = -1;
        self.rs.locked_block = None;
        self.rs.locked_block_parts = None;
        self.rs.valid_round = -1;
        self.rs.valid_block = None;
        self.rs.valid_block_parts = None;
        self.rs.votes = HeightVoteSet::new(state.chain_id.clone(), height, validators);
        self.rs.commit_round = -1;
        self.rs.last_validators = Arc::new(state.last_validators.clone());
        self.rs.triggered_timeout_precommit = false;
        self.state = state;

        self.new_step();
        Ok(())
    }

    /// Refuses to start when our signature is in one of the last commits: a
    /// second instance of this validator may be running.
    fn check_double_signing_risk(&self, height: i64) -> Result<(), FatalError> {
        let check_height = self.config.double_sign_check_height;
        let Some(address) = self.own_address() else {
            return Ok(());
        };
        if self.priv_validator.is_none() || check_height <= 0 || height <= 0 {
            return Ok(());
        }
        for i in 1..check_height.min(height) {
            let Some(commit) = load_commit(self.block_store.as_ref(), height - i) else {
                continue;
            };
            let signed = commit
                .signatures
                .iter()
                .any(|sig| sig.block_id_flag == BlockIdFlag::Commit && sig.validator_address == address);
            if signed {
                tracing::info!(height = height - i, "Found a signature from our key");
                return Err(FatalError::DoubleSignRisk(height - i));
            }
        }
        Ok(())
    }
}

/// The commit of `height`: the seen commit for the latest block, the
/// canonical one from the next block otherwise.
pub fn load_commit(block_store: &dyn BlockStore, height: i64) -> Option<Commit> {
    if height == block_store.height() {
        block_store
            .load_seen_commit()
            .filter(|commit| commit.height == height)
    } else {
        block_store.load_block_commit(height)
    }
}

/// A cloneable handle to a running [`ConsensusState`].
#[derive(Clone, Debug)]
pub struct StateHandle {
    inputs: mpsc::Sender<StateInput>,
    round_state: watch::Receiver<Arc<RoundState>>,
    event_bus: EventBus,
}

/// The state machine is gone.
#[derive(Debug, thiserror::Error)]
#[error("consensus state machine is not running")]
pub struct StateStopped;

impl StateHandle {
    /// The latest snapshot of the round state.
    pub fn get_round_state(&self) -> Arc<RoundState> {
        self.round_state.borrow().clone()
    }

    /// Notified whenever a new snapshot is published.
    pub fn subscribe_round_state(&self) -> watch::Receiver<Arc<RoundState>> {
        self.round_state.clone()
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.event_bus
    }

    /// Queues a message. An empty `peer_id` marks it as our own: it is synced
    /// to the WAL before it is processed.
    pub async fn send(&self, mi: MsgInfo) -> Result<(), StateStopped> {
        self.inputs
            .send(StateInput::Msg(mi))
            .await
            .map_err(|_| StateStopped)
    }

    pub async fn add_vote(&self, vote: Vote, peer_id: NodeId) -> Result<(), StateStopped> {
        self.send(MsgInfo::from_peer(Message::Vote(vote), peer_id))
            .await
    }

    pub async fn set_proposal(&self, proposal: Proposal, peer_id: NodeId) -> Result<(), StateStopped> {
        self.send(MsgInfo::from_peer(Message::Proposal(proposal), peer_id))
            .await
    }

    pub async fn add_proposal_block_part(
        &self,
        height: i64,
        round: i32,
        part: Part,
        peer_id: NodeId,
    ) -> Result<(), StateStopped> {
        let msg = Message::BlockPart(BlockPart { height, round, part });
        self.send(MsgInfo::from_peer(msg, peer_id)).await
    }

    /// Queues a proposal followed by every part of its block.
    pub async fn set_proposal_and_block(
        &self,
        proposal: Proposal,
        parts: &PartSet,
        peer_id: NodeId,
    ) -> Result<(), StateStopped> {
        let (height, round) = (proposal.height, proposal.round);
        self.set_proposal(proposal, peer_id.clone()).await?;
        for index in 0..parts.total() as usize {
            if let Some(part) = parts.get_part(index) {
                self.add_proposal_block_part(height, round, (*part).clone(), peer_id.clone())
                    .await?;
            }
        }
        Ok(())
    }

    /// Records a peer's +2/3 claim and returns the votes we have for that
    /// block. `Ok(None)` when the claim is not for our height.
    pub async fn peer_maj23(
        &self,
        peer: NodeId,
        maj23: VoteSetMaj23,
    ) -> Result<Result<Option<VoteSetBits>, HeightVoteSetError>, StateStopped> {
        let (reply, rx) = oneshot::channel();
        self.inputs
            .send(StateInput::PeerMaj23 { peer, maj23, reply })
            .await
            .map_err(|_| StateStopped)?;
        rx.await.map_err(|_| StateStopped)
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use meridian_abci::{
        Application,
        KvStoreApplication,
        RequestFinalizeBlock,
        RequestInfo,
        RequestInitChain,
        RequestPrepareProposal,
        ResponseCommit,
        ResponseFinalizeBlock,
        ResponseInfo,
        ResponseInitChain,
        ResponsePrepareProposal,
    };
    use meridian_common::{MockPrivValidator, Validator};
    use meridian_state::{EmptyEvidencePool, EmptyMempool, MemoryBlockStore, MemoryStore};
    use rstest::rstest;

    use super::*;
    use crate::test_utils::{self, Validators, CHAIN_ID};
    use crate::wal::NilWal;

    /// Lets the block executor build blocks, but blows up the moment it asks
    /// for transactions.
    struct PanicOnPrepare;

    #[async_trait::async_trait]
    impl Application for PanicOnPrepare {
        async fn info(&self, _request: RequestInfo) -> anyhow::Result<ResponseInfo> {
            Ok(ResponseInfo::default())
        }

        async fn init_chain(&self, _request: RequestInitChain) -> anyhow::Result<ResponseInitChain> {
            Ok(ResponseInitChain::default())
        }

        async fn prepare_proposal(
            &self,
            _request: RequestPrepareProposal,
        ) -> anyhow::Result<ResponsePrepareProposal> {
            panic!("prepare_proposal exploded")
        }

        async fn finalize_block(&self, _request: RequestFinalizeBlock) -> anyhow::Result<ResponseFinalizeBlock> {
            anyhow::bail!("no blocks expected")
        }

        async fn commit(&self) -> anyhow::Result<ResponseCommit> {
            anyhow::bail!("no blocks expected")
        }
    }

    /// A machine at height 1 of a four validator chain, without a signer.
    fn consensus(app: Arc<dyn Application>) -> ConsensusState {
        let state = State::from_genesis(&test_utils::genesis(4)).unwrap();
        let block_store: Arc<dyn BlockStore> = Arc::new(MemoryBlockStore::new());
        let block_exec = BlockExecutor::new(
            Arc::new(MemoryStore::new()),
            block_store.clone(),
            app,
            Arc::new(EmptyMempool::default()),
            Arc::new(EmptyEvidencePool),
        );
        ConsensusState::new(
            Config::default(),
            state,
            Arc::new(block_exec),
            block_store,
            Arc::new(EmptyEvidencePool),
            Box::new(NilWal),
            EventBus::new(),
        )
        .unwrap()
    }

    /// A validator that proposes neither round 0 nor round 1.
    fn bystander() -> ConsensusState {
        let cs = consensus(Arc::new(KvStoreApplication::new()));
        let round0 = seed_of(cs.rs.validators.get_proposer().unwrap());
        let round1 = seed_of(
            cs.rs
                .validators
                .copy_increment_proposer_priority(1)
                .get_proposer()
                .unwrap(),
        );
        let seed = (1..=4).find(|seed| *seed != round0 && *seed != round1).unwrap();
        cs.with_priv_validator(signer(seed))
    }

    fn seed_of(validator: &Validator) -> u8 {
        (1..=4)
            .find(|seed| PublicKey::from(test_utils::signing_key(*seed).verification_key()) == validator.pub_key)
            .expect("a test validator")
    }

    fn signer(seed: u8) -> Arc<dyn PrivValidator> {
        Arc::new(MockPrivValidator::new(test_utils::signing_key(seed)))
    }

    /// Indexes of every validator but ourselves.
    fn others(cs: &ConsensusState) -> Vec<i32> {
        let own = cs.own_address();
        (0..4)
            .filter(|index| {
                cs.rs
                    .validators
                    .get_by_index(*index)
                    .is_some_and(|validator| Some(&validator.address) != own.as_ref())
            })
            .collect()
    }

    /// A proposal for a fresh block, signed by the proposer of the current
    /// round.
    async fn signed_proposal(cs: &ConsensusState, pol_round: i32) -> (Proposal, PartSet) {
        let proposer = cs.rs.validators.get_proposer().unwrap().clone();
        let block = cs
            .block_exec
            .create_proposal_block(cs.rs.height, &cs.state, Commit::default(), proposer.address.clone(), time::now())
            .await
            .unwrap();
        let parts = block.make_part_set(BLOCK_PART_SIZE_BYTES);
        let block_id = BlockId::new(block.hash(), parts.header());
        let mut proposal = Proposal::new(cs.rs.height, cs.rs.round, pol_round, block_id);
        signer(seed_of(&proposer))
            .sign_proposal(CHAIN_ID, &mut proposal)
            .unwrap();
        (proposal, parts)
    }

    /// Hands the proposal and all of its parts to the machine.
    async fn deliver(cs: &mut ConsensusState, proposal: Proposal, parts: &PartSet) {
        let (height, round) = (proposal.height, proposal.round);
        cs.handle_msg(MsgInfo::from_peer(Message::Proposal(proposal), NodeId::from("proposer")))
            .await
            .unwrap();
        for index in 0..parts.total() as usize {
            let part = parts.get_part(index).unwrap();
            cs.handle_msg(MsgInfo::from_peer(
                Message::BlockPart(BlockPart {
                    height,
                    round,
                    part: (*part).clone(),
                }),
                NodeId::from("proposer"),
            ))
            .await
            .unwrap();
        }
    }

    async fn add_votes(cs: &mut ConsensusState, votes: Vec<Vote>) {
        let peer = NodeId::from("peer");
        for vote in votes {
            assert_matches!(cs.add_vote(vote, &peer).await, Ok(Ok(true)));
        }
    }

    /// Three votes of the other validators: two for `block_id`, one for nil.
    fn split_votes(cs: &ConsensusState, round: i32, vote_type: VoteType, block_id: BlockId) -> Vec<Vote> {
        let validators = Validators::new(4);
        others(cs)
            .into_iter()
            .enumerate()
            .map(|(n, index)| {
                let block_id = if n < 2 { block_id.clone() } else { BlockId::default() };
                validators.vote(index, cs.rs.height, round, vote_type, block_id)
            })
            .collect()
    }

    fn unanimous_votes(cs: &ConsensusState, round: i32, vote_type: VoteType, block_id: &BlockId) -> Vec<Vote> {
        let validators = Validators::new(4);
        others(cs)
            .into_iter()
            .map(|index| validators.vote(index, cs.rs.height, round, vote_type, block_id.clone()))
            .collect()
    }

    fn timeout(height: i64, round: i32, step: Step) -> TimeoutInfo {
        TimeoutInfo {
            duration: Duration::ZERO,
            height,
            round,
            step,
        }
    }

    /// The last vote we signed for ourselves.
    fn own_vote(cs: &ConsensusState) -> Option<&Vote> {
        cs.internal_queue.iter().rev().find_map(|mi| match &mi.msg {
            Message::Vote(vote) => Some(vote),
            _ => None,
        })
    }

    #[tokio::test]
    async fn proposal_for_another_height_or_round_is_ignored() {
        let mut cs = consensus(Arc::new(KvStoreApplication::new()));
        cs.enter_new_round(1, 0).await.unwrap();
        let (proposal, _) = signed_proposal(&cs, -1).await;

        let mut future_height = proposal.clone();
        future_height.height = 2;
        cs.set_proposal(future_height, time::now()).unwrap();
        let mut later_round = proposal.clone();
        later_round.round = 1;
        cs.set_proposal(later_round, time::now()).unwrap();
        assert!(cs.rs.proposal.is_none());

        cs.set_proposal(proposal.clone(), time::now()).unwrap();
        assert_eq!(cs.rs.proposal.as_ref(), Some(&proposal));
        assert!(cs
            .rs
            .proposal_block_parts
            .as_ref()
            .is_some_and(|parts| parts.has_header(&proposal.block_id.part_set_header)));
    }

    #[rstest]
    #[case::below_nil(-2)]
    #[case::not_before_the_proposal_round(0)]
    #[tokio::test]
    async fn proposal_with_bad_pol_round_is_rejected(#[case] pol_round: i32) {
        let mut cs = consensus(Arc::new(KvStoreApplication::new()));
        cs.enter_new_round(1, 0).await.unwrap();
        let (proposal, _) = signed_proposal(&cs, pol_round).await;

        assert_matches!(
            cs.set_proposal(proposal, time::now()),
            Err(ConsensusError::InvalidProposalPolRound { pol_round: p, round: 0 }) if p == pol_round
        );
        assert!(cs.rs.proposal.is_none());
    }

    #[tokio::test]
    async fn proposal_not_signed_by_the_proposer_is_rejected() {
        let mut cs = consensus(Arc::new(KvStoreApplication::new()));
        cs.enter_new_round(1, 0).await.unwrap();
        let (mut proposal, _) = signed_proposal(&cs, -1).await;

        let proposer = seed_of(cs.rs.validators.get_proposer().unwrap());
        let impostor = (1..=4).find(|seed| *seed != proposer).unwrap();
        signer(impostor).sign_proposal(CHAIN_ID, &mut proposal).unwrap();

        assert_matches!(
            cs.set_proposal(proposal, time::now()),
            Err(ConsensusError::InvalidProposalSignature(_))
        );
        assert!(cs.rs.proposal.is_none());
    }

    #[tokio::test]
    async fn timeouts_drive_the_round_forward() {
        let mut cs = bystander();
        assert_eq!(cs.rs.step, Step::NewHeight);

        cs.handle_timeout(timeout(1, 0, Step::NewHeight)).await.unwrap();
        assert_eq!((cs.rs.round, cs.rs.step), (0, Step::Propose));

        // Nothing was proposed, so we prevote nil.
        cs.handle_timeout(timeout(1, 0, Step::Propose)).await.unwrap();
        assert_eq!(cs.rs.step, Step::Prevote);
        assert_matches!(own_vote(&cs), Some(vote) if vote.vote_type == VoteType::Prevote && vote.block_id.is_nil());

        let votes = split_votes(&cs, 0, VoteType::Prevote, test_utils::block_id(1));
        add_votes(&mut cs, votes).await;
        assert_eq!(cs.rs.step, Step::PrevoteWait);

        cs.handle_timeout(timeout(1, 0, Step::PrevoteWait)).await.unwrap();
        assert_eq!(cs.rs.step, Step::Precommit);
        assert_matches!(own_vote(&cs), Some(vote) if vote.vote_type == VoteType::Precommit && vote.block_id.is_nil());

        let votes = split_votes(&cs, 0, VoteType::Precommit, test_utils::block_id(1));
        add_votes(&mut cs, votes).await;
        assert!(cs.rs.triggered_timeout_precommit);

        cs.handle_timeout(timeout(1, 0, Step::PrecommitWait)).await.unwrap();
        assert_eq!((cs.rs.round, cs.rs.step), (1, Step::Propose));
        assert!(!cs.rs.triggered_timeout_precommit);
    }

    #[tokio::test]
    async fn stale_timeouts_are_ignored() {
        let mut cs = bystander();
        cs.enter_new_round(1, 0).await.unwrap();
        cs.handle_timeout(timeout(1, 0, Step::Propose)).await.unwrap();
        let queued = cs.internal_queue.len();

        cs.handle_timeout(timeout(1, 0, Step::NewHeight)).await.unwrap();
        cs.handle_timeout(timeout(1, 0, Step::Propose)).await.unwrap();
        cs.handle_timeout(timeout(2, 0, Step::Propose)).await.unwrap();

        assert_eq!((cs.rs.round, cs.rs.step), (0, Step::Prevote));
        assert_eq!(cs.internal_queue.len(), queued);
    }

    #[tokio::test]
    async fn two_thirds_of_any_prevotes_from_a_later_round_skip_to_it() {
        let mut cs = bystander();
        cs.enter_new_round(1, 0).await.unwrap();

        let mut votes = split_votes(&cs, 1, VoteType::Prevote, test_utils::block_id(1));
        let last = votes.pop().unwrap();
        add_votes(&mut cs, votes).await;
        assert_eq!(cs.rs.round, 0);

        add_votes(&mut cs, vec![last]).await;
        assert_eq!((cs.rs.round, cs.rs.step), (1, Step::Propose));
    }

    #[tokio::test]
    async fn two_thirds_of_any_precommits_from_a_later_round_start_the_wait() {
        let mut cs = bystander();
        cs.enter_new_round(1, 0).await.unwrap();

        let votes = split_votes(&cs, 1, VoteType::Precommit, test_utils::block_id(1));
        add_votes(&mut cs, votes).await;

        assert_eq!(cs.rs.round, 1);
        assert!(cs.rs.triggered_timeout_precommit);
    }

    #[test_log::test(tokio::test)]
    async fn polka_locks_the_proposal_block_until_a_later_polka_for_another() {
        let mut cs = bystander();
        cs.enter_new_round(1, 0).await.unwrap();
        let (proposal, parts) = signed_proposal(&cs, -1).await;
        let block_id = proposal.block_id.clone();
        deliver(&mut cs, proposal, &parts).await;

        // A complete, valid proposal gets our prevote.
        assert_eq!(cs.rs.step, Step::Prevote);
        assert_matches!(own_vote(&cs), Some(vote) if vote.vote_type == VoteType::Prevote && vote.block_id == block_id);

        let votes = unanimous_votes(&cs, 0, VoteType::Prevote, &block_id);
        add_votes(&mut cs, votes).await;
        assert_eq!(cs.rs.step, Step::Precommit);
        assert_eq!(cs.rs.locked_round, 0);
        assert!(cs.rs.locked_block.as_ref().is_some_and(|block| block.hashes_to(&block_id.hash)));
        assert_matches!(own_vote(&cs), Some(vote) if vote.vote_type == VoteType::Precommit && vote.block_id == block_id);

        // No decision in round 0.
        let votes = split_votes(&cs, 0, VoteType::Precommit, block_id.clone());
        add_votes(&mut cs, votes).await;
        cs.handle_timeout(timeout(1, 0, Step::PrecommitWait)).await.unwrap();
        assert_eq!((cs.rs.round, cs.rs.step), (1, Step::Propose));

        // Round 1 has no proposal, yet the lock makes us prevote our block.
        cs.handle_timeout(timeout(1, 1, Step::Propose)).await.unwrap();
        assert_matches!(
            own_vote(&cs),
            Some(vote) if vote.vote_type == VoteType::Prevote && vote.round == 1 && vote.block_id == block_id
        );
        assert_eq!(cs.rs.locked_round, 0);

        let other = test_utils::block_id(9);
        let votes = unanimous_votes(&cs, 1, VoteType::Prevote, &other);
        add_votes(&mut cs, votes).await;
        assert_eq!(cs.rs.locked_round, -1);
        assert!(cs.rs.locked_block.is_none());
        assert!(cs.rs.locked_block_parts.is_none());
    }

    #[test_log::test(tokio::test)]
    async fn panic_while_creating_the_proposal_block_is_contained() {
        let cs = consensus(Arc::new(PanicOnPrepare));
        let proposer = seed_of(cs.rs.validators.get_proposer().unwrap());
        let mut cs = cs.with_priv_validator(signer(proposer));

        assert_matches!(
            cs.create_proposal_block(1).await,
            Err(ConsensusError::CreateBlockPanicked(reason)) if reason.contains("prepare_proposal exploded")
        );

        // Our turn to propose: nothing gets proposed, and the round goes on.
        cs.enter_new_round(1, 0).await.unwrap();
        assert_eq!(cs.rs.step, Step::Propose);
        assert!(cs.rs.proposal.is_none());
        assert!(cs.internal_queue.is_empty());

        cs.handle_timeout(timeout(1, 0, Step::Propose)).await.unwrap();
        assert_eq!(cs.rs.step, Step::Prevote);
        assert_matches!(own_vote(&cs), Some(vote) if vote.block_id.is_nil());
    }

    #[tokio::test]
    async fn snapshots_are_only_taken_when_something_changed() {
        let mut cs = bystander();
        cs.enter_new_round(1, 0).await.unwrap();
        cs.publish();
        let mut snapshots = cs.snapshot.subscribe();
        snapshots.borrow_and_update();

        cs.publish();
        assert!(!snapshots.has_changed().unwrap());

        let vote = Validators::new(4).vote(others(&cs)[0], 1, 0, VoteType::Prevote, test_utils::block_id(1));
        add_votes(&mut cs, vec![vote.clone()]).await;
        cs.publish();
        assert!(snapshots.has_changed().unwrap());
        assert_eq!(snapshots.borrow_and_update().votes.prevotes(0).unwrap().sum(), 10);

        // The same vote gossiped again changes nothing.
        assert_matches!(cs.add_vote(vote, &NodeId::from("another peer")).await, Ok(Ok(false)));
        cs.publish();
        assert!(!snapshots.has_changed().unwrap());
    }
}
