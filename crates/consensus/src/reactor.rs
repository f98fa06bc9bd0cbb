//! Connects the state machine to peers.
//!
//! Four channels carry consensus messages: round steps and +2/3 claims on the
//! state channel, proposals and block parts on the data channel, votes on the
//! vote channel and answers to claims on the vote set bits channel. For every
//! connected peer three routines decide, from what the peer reported, what
//! to send it next: block data, votes, and +2/3 claims.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use futures::FutureExt;
use meridian_common::{Event, EventBus, NodeId, VoteSetReader, VoteType};
use meridian_state::{BlockStore, State};
use p2p::{ChannelDescriptor, ChannelId, ChannelReceiver, ChannelSender, Envelope, PeerError, PeerStatus, Router, RouterError};
use p2p_proto::consensus as proto;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use util::task::TaskGroup;

use crate::config::Config;
use crate::error::{panic_message, FatalError};
use crate::messages::{BlockPart, HasVote, Message, MsgInfo, ProposalPol, VoteSetMaj23};
use crate::peer_state::{PeerRoundState, PeerState};
use crate::round_state::{RoundState, Step};
use crate::state::{load_commit, ConsensusState, ReactorEvent, StateHandle};

pub const STATE_CHANNEL: ChannelId = 0x20;
pub const DATA_CHANNEL: ChannelId = 0x21;
pub const VOTE_CHANNEL: ChannelId = 0x22;
pub const VOTE_SET_BITS_CHANNEL: ChannelId = 0x23;

/// Larger than any block part message.
const MAX_MSG_SIZE: usize = 4 * 1024 * 1024;

/// How often the valid block announcement is repeated, for peers that
/// dropped it.
const VALID_BLOCK_REBROADCAST_INTERVAL: Duration = Duration::from_secs(1);

pub fn state_channel() -> ChannelDescriptor {
    ChannelDescriptor {
        id: STATE_CHANNEL,
        name: "state",
        priority: 8,
        send_queue_capacity: 64,
        recv_buffer_capacity: 128,
        recv_message_capacity: MAX_MSG_SIZE,
    }
}

pub fn data_channel() -> ChannelDescriptor {
    ChannelDescriptor {
        id: DATA_CHANNEL,
        name: "data",
        priority: 12,
        send_queue_capacity: 64,
        recv_buffer_capacity: 512,
        recv_message_capacity: MAX_MSG_SIZE,
    }
}

pub fn vote_channel() -> ChannelDescriptor {
    ChannelDescriptor {
        id: VOTE_CHANNEL,
        name: "vote",
        priority: 10,
        send_queue_capacity: 64,
        recv_buffer_capacity: 128,
        recv_message_capacity: MAX_MSG_SIZE,
    }
}

pub fn vote_set_bits_channel() -> ChannelDescriptor {
    ChannelDescriptor {
        id: VOTE_SET_BITS_CHANNEL,
        name: "vote_set_bits",
        priority: 5,
        send_queue_capacity: 8,
        recv_buffer_capacity: 128,
        recv_message_capacity: MAX_MSG_SIZE,
    }
}

struct Channels {
    state: ChannelSender<proto::Message>,
    data: ChannelSender<proto::Message>,
    vote: ChannelSender<proto::Message>,
    vote_set_bits: ChannelSender<proto::Message>,
}

/// Everything `start` hands to the reactor's routines.
struct Startup {
    state: ChannelReceiver<proto::Message>,
    data: ChannelReceiver<proto::Message>,
    vote: ChannelReceiver<proto::Message>,
    vote_set_bits: ChannelReceiver<proto::Message>,
    reactor_events: mpsc::UnboundedReceiver<ReactorEvent>,
}

struct Peer {
    state: Arc<PeerState>,
    /// The gossip routines, once consensus runs.
    gossip: Option<TaskGroup>,
}

struct Inner {
    config: Config,
    router: Router,
    channels: Channels,
    handle: StateHandle,
    block_store: Arc<dyn BlockStore>,
    event_bus: EventBus,
    initial_height: i64,
    peers: RwLock<HashMap<NodeId, Peer>>,
    /// The state machine, until it starts running.
    pending: Mutex<Option<ConsensusState>>,
    startup: Mutex<Option<Startup>>,
    running: AtomicBool,
    fatal: Mutex<Option<FatalError>>,
    tasks: TaskGroup,
}

/// The consensus reactor. Cheap to clone.
#[derive(Clone)]
pub struct Reactor {
    inner: Arc<Inner>,
}

impl Reactor {
    /// Opens the consensus channels on `router`. With `wait_sync` the state
    /// machine only starts on [`Reactor::switch_to_consensus`], once block
    /// sync is done.
    pub fn new(
        mut cs: ConsensusState,
        router: &Router,
        block_store: Arc<dyn BlockStore>,
        event_bus: EventBus,
        wait_sync: bool,
    ) -> Result<Self, RouterError> {
        let (state_tx, state_rx) = router.open_channel(state_channel())?.split();
        let (data_tx, data_rx) = router.open_channel(data_channel())?.split();
        let (vote_tx, vote_rx) = router.open_channel(vote_channel())?.split();
        let (bits_tx, bits_rx) = router.open_channel(vote_set_bits_channel())?.split();

        let startup = Startup {
            state: state_rx,
            data: data_rx,
            vote: vote_rx,
            vote_set_bits: bits_rx,
            reactor_events: cs.take_reactor_events(),
        };
        let inner = Inner {
            config: cs.config.clone(),
            router: router.clone(),
            channels: Channels {
                state: state_tx,
                data: data_tx,
                vote: vote_tx,
                vote_set_bits: bits_tx,
            },
            handle: cs.handle(),
            block_store,
            event_bus,
            initial_height: cs.chain_state().initial_height,
            peers: Default::default(),
            pending: Mutex::new(Some(cs)),
            startup: Mutex::new(Some(startup)),
            running: AtomicBool::new(false),
            fatal: Mutex::new(None),
            tasks: TaskGroup::new(format!("consensus {}", router.node_id())),
        };
        let reactor = Self { inner: Arc::new(inner) };
        if wait_sync {
            tracing::debug!("Consensus waits for block sync");
        }
        // Remembered for `start`.
        reactor.inner.running.store(!wait_sync, Ordering::SeqCst);
        Ok(reactor)
    }

    /// Starts processing the channels, and the state machine unless the
    /// reactor waits for sync. Calling it again has no effect.
    pub fn start(&self) {
        let Some(startup) = self.inner.startup.lock().take() else {
            return;
        };
        let Startup {
            state,
            data,
            vote,
            vote_set_bits,
            reactor_events,
        } = startup;

        let tasks = &self.inner.tasks;
        tasks.spawn(process_channel(
            self.inner.clone(),
            state,
            self.inner.channels.state.clone(),
            "consensus.state",
            Inner::handle_state_message,
        ));
        tasks.spawn(process_channel(
            self.inner.clone(),
            data,
            self.inner.channels.state.clone(),
            "consensus.data",
            Inner::handle_data_message,
        ));
        tasks.spawn(process_channel(
            self.inner.clone(),
            vote,
            self.inner.channels.state.clone(),
            "consensus.vote",
            Inner::handle_vote_message,
        ));
        tasks.spawn(process_channel(
            self.inner.clone(),
            vote_set_bits,
            self.inner.channels.state.clone(),
            "consensus.vote_set_bits",
            Inner::handle_vote_set_bits_message,
        ));
        tasks.spawn(self.inner.clone().process_reactor_events(reactor_events));
        tasks.spawn(self.inner.clone().process_peer_updates());

        if self.inner.running.load(Ordering::SeqCst) {
            if let Some(cs) = self.inner.pending.lock().take() {
                self.inner.clone().start_consensus(cs);
            }
        }
    }

    /// Whether the state machine is still waiting for block sync.
    pub fn wait_sync(&self) -> bool {
        !self.inner.running.load(Ordering::SeqCst)
    }

    /// Starts the state machine from `state`, reached by block sync.
    pub fn switch_to_consensus(&self, state: State, skip_wal: bool) -> Result<(), FatalError> {
        tracing::info!(height = state.last_block_height, "Switching to consensus");
        self.inner.event_bus.publish(Event::BlockSyncStatus {
            complete: true,
            height: state.last_block_height,
        });

        let Some(mut cs) = self.inner.pending.lock().take() else {
            tracing::warn!("Consensus is already running");
            return Ok(());
        };
        cs.switch_to_state(state, skip_wal)?;
        self.inner.running.store(true, Ordering::SeqCst);
        if self.inner.startup.lock().is_none() {
            self.inner.clone().start_consensus(cs);
        } else {
            // Not started yet, `start` picks it up.
            *self.inner.pending.lock() = Some(cs);
        }
        Ok(())
    }

    pub fn get_peer_state(&self, peer: &NodeId) -> Option<Arc<PeerState>> {
        self.inner
            .peers
            .read()
            .get(peer)
            .map(|peer| peer.state.clone())
    }

    pub fn state(&self) -> &StateHandle {
        &self.inner.handle
    }

    /// Stops every routine of the reactor, and the state machine.
    pub fn stop(&self) {
        self.inner.stop();
    }

    /// Resolves once the reactor is stopped, by [`Reactor::stop`], a fatal
    /// error or graceful shutdown.
    pub async fn stopped(&self) {
        self.inner.tasks.token().cancelled().await;
        self.inner.tasks.wait().await;
    }

    /// The error that halted the state machine, if any.
    pub fn take_fatal_error(&self) -> Option<FatalError> {
        self.inner.fatal.lock().take()
    }
}

/// Feeds every message of a channel to `handle`. A peer whose message fails
/// to be handled, or makes the handler panic, is evicted through `errors`;
/// the channel keeps serving everyone else.
async fn process_channel<C, F, Fut>(
    ctx: C,
    mut receiver: ChannelReceiver<proto::Message>,
    errors: ChannelSender<proto::Message>,
    name: &'static str,
    handle: F,
) where
    C: Clone + Send + 'static,
    F: Fn(C, NodeId, proto::Message) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = anyhow::Result<()>> + Send,
{
    while let Some(Envelope { from, message, .. }) = receiver.recv().await {
        let handled = AssertUnwindSafe(handle(ctx.clone(), from.clone(), message))
            .catch_unwind()
            .await;
        let err = match handled {
            Ok(Ok(())) => continue,
            Ok(Err(err)) => err,
            Err(panic) => {
                let reason = panic_message(panic.as_ref());
                tracing::error!(peer = %from, channel = name, %reason, "Panicked while handling peer message");
                anyhow::anyhow!("handler panicked: {reason}")
            }
        };
        tracing::debug!(peer = %from, error = %err, channel = name, "Evicting peer");
        errors.send_error(PeerError {
            node_id: from,
            err: err.context(name),
        });
    }
}

fn decode(message: proto::Message) -> anyhow::Result<Message> {
    let msg = Message::from_proto(message)?;
    msg.validate_basic()?;
    Ok(msg)
}

impl Inner {
    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn peer(&self, node_id: &NodeId) -> Option<Arc<PeerState>> {
        self.peers.read().get(node_id).map(|peer| peer.state.clone())
    }

    fn stop(&self) {
        for (_, peer) in self.peers.write().drain() {
            if let Some(gossip) = peer.gossip {
                gossip.cancel();
            }
        }
        self.tasks.cancel();
    }

    fn start_consensus(self: Arc<Self>, cs: ConsensusState) {
        self.running.store(true, Ordering::SeqCst);
        // Peers that connected during sync start gossiping now.
        let idle: Vec<_> = self
            .peers
            .read()
            .values()
            .filter(|peer| peer.gossip.is_none())
            .map(|peer| peer.state.clone())
            .collect();
        for ps in idle {
            let group = self.clone().start_gossip(ps.clone());
            if let Some(peer) = self.peers.write().get_mut(ps.node_id()) {
                peer.gossip = Some(group);
            } else {
                group.cancel();
            }
        }

        // The state machine checks the token between inputs, so a stop never
        // lands in the middle of a commit.
        let token = self.tasks.token().clone();
        let tasks = self.tasks.clone();
        let inner = self;
        tasks.spawn_cooperative(async move {
            if let Err(e) = cs.run(token).await {
                tracing::error!(error = %e, "Consensus failed, stopping the reactor");
                *inner.fatal.lock() = Some(e);
                inner.stop();
            }
        });
    }

    async fn handle_state_message(self: Arc<Self>, from: NodeId, message: proto::Message) -> anyhow::Result<()> {
        let Some(ps) = self.peer(&from) else {
            tracing::debug!(peer = %from, "No state for peer, dropping state message");
            return Ok(());
        };
        match decode(message)? {
            Message::NewRoundStep(msg) => {
                msg.validate_height(self.initial_height)?;
                ps.apply_new_round_step_message(&msg);
            }
            Message::NewValidBlock(msg) => ps.apply_new_valid_block_message(&msg),
            Message::HasVote(msg) => ps.apply_has_vote_message(&msg)?,
            Message::VoteSetMaj23(msg) => self.handle_vote_set_maj23(from, msg).await?,
            other => anyhow::bail!("unexpected {} message on the state channel", other.name()),
        }
        Ok(())
    }

    /// Records the peer's claim and answers with the votes we have for the
    /// claimed block, so the peer knows which ones we miss.
    async fn handle_vote_set_maj23(&self, from: NodeId, msg: VoteSetMaj23) -> anyhow::Result<()> {
        if !self.is_running() {
            return Ok(());
        }
        let Ok(reply) = self.handle.peer_maj23(from.clone(), msg).await else {
            tracing::debug!("State machine stopped, ignoring +2/3 claim");
            return Ok(());
        };
        if let Some(bits) = reply? {
            self.channels
                .vote_set_bits
                .send(&from, &Message::VoteSetBits(bits).to_proto());
        }
        Ok(())
    }

    async fn handle_data_message(self: Arc<Self>, from: NodeId, message: proto::Message) -> anyhow::Result<()> {
        let Some(ps) = self.peer(&from) else {
            tracing::debug!(peer = %from, "No state for peer, dropping data message");
            return Ok(());
        };
        let msg = decode(message)?;
        if !self.is_running() {
            tracing::debug!(msg_type = msg.name(), "Ignoring message received during sync");
            return Ok(());
        }
        match msg {
            Message::Proposal(proposal) => {
                ps.set_has_proposal(&proposal);
                self.send_to_state(Message::Proposal(proposal), from).await;
            }
            Message::ProposalPol(msg) => ps.apply_proposal_pol_message(&msg),
            Message::BlockPart(msg) => {
                ps.set_has_proposal_block_part(msg.height, msg.round, msg.part.index as usize);
                self.send_to_state(Message::BlockPart(msg), from).await;
            }
            other => anyhow::bail!("unexpected {} message on the data channel", other.name()),
        }
        Ok(())
    }

    async fn handle_vote_message(self: Arc<Self>, from: NodeId, message: proto::Message) -> anyhow::Result<()> {
        let Some(ps) = self.peer(&from) else {
            tracing::debug!(peer = %from, "No state for peer, dropping vote");
            return Ok(());
        };
        let msg = decode(message)?;
        if !self.is_running() {
            tracing::debug!(msg_type = msg.name(), "Ignoring message received during sync");
            return Ok(());
        }
        let Message::Vote(vote) = msg else {
            anyhow::bail!("unexpected {} message on the vote channel", msg.name());
        };

        let rs = self.handle.get_round_state();
        ps.ensure_vote_bit_arrays(rs.height, rs.validators.size());
        let last_commit_size = rs.last_commit.as_ref().map_or(0, |c| c.size());
        if last_commit_size > 0 {
            ps.ensure_vote_bit_arrays(rs.height - 1, last_commit_size);
        }
        ps.set_has_vote(&vote).context("vote index")?;
        self.send_to_state(Message::Vote(vote), from).await;
        Ok(())
    }

    async fn handle_vote_set_bits_message(self: Arc<Self>, from: NodeId, message: proto::Message) -> anyhow::Result<()> {
        let Some(ps) = self.peer(&from) else {
            tracing::debug!(peer = %from, "No state for peer, dropping vote set bits");
            return Ok(());
        };
        let msg = decode(message)?;
        if !self.is_running() {
            tracing::debug!(msg_type = msg.name(), "Ignoring message received during sync");
            return Ok(());
        }
        let Message::VoteSetBits(msg) = msg else {
            anyhow::bail!("unexpected {} message on the vote set bits channel", msg.name());
        };

        let rs = self.handle.get_round_state();
        if rs.height == msg.height {
            let ours = rs
                .votes
                .vote_set(msg.round, msg.vote_type)
                .and_then(|votes| votes.bit_array_by_block_id(&msg.block_id));
            ps.apply_vote_set_bits_message(&msg, ours.as_ref());
        } else {
            ps.apply_vote_set_bits_message(&msg, None);
        }
        Ok(())
    }

    async fn send_to_state(&self, msg: Message, from: NodeId) {
        if self.handle.send(MsgInfo::from_peer(msg, from)).await.is_err() {
            tracing::debug!("State machine stopped, dropping peer message");
        }
    }

    async fn process_peer_updates(self: Arc<Self>) {
        let mut updates = self.router.subscribe_peer_updates();
        while let Some(update) = updates.recv().await {
            match update.status {
                PeerStatus::Up => self.clone().add_peer(update.node_id),
                PeerStatus::Down => {
                    if let Some(peer) = self.peers.write().remove(&update.node_id) {
                        tracing::debug!(peer = %update.node_id, "Peer removed");
                        if let Some(gossip) = peer.gossip {
                            gossip.cancel();
                        }
                    }
                }
            }
        }
    }

    fn add_peer(self: Arc<Self>, node_id: NodeId) {
        let ps = {
            let mut peers = self.peers.write();
            if peers.contains_key(&node_id) {
                return;
            }
            let ps = Arc::new(PeerState::new(node_id.clone()));
            let gossip = self
                .is_running()
                .then(|| self.clone().start_gossip(ps.clone()));
            peers.insert(
                node_id.clone(),
                Peer {
                    state: ps.clone(),
                    gossip,
                },
            );
            ps
        };
        tracing::debug!(peer = %node_id, "Peer added");

        let rs = self.handle.get_round_state();
        self.channels.state.send(
            ps.node_id(),
            &Message::NewRoundStep(rs.new_round_step_message()).to_proto(),
        );
    }

    fn start_gossip(self: Arc<Self>, ps: Arc<PeerState>) -> TaskGroup {
        let tasks = TaskGroup::new(format!("consensus peer {}", ps.node_id()));
        tasks.spawn(self.clone().gossip_data(ps.clone()));
        tasks.spawn(self.clone().gossip_votes(ps.clone()));
        tasks.spawn(self.query_maj23(ps));
        tasks
    }

    /// Sends the peer the proposal and block parts of its round, or helps it
    /// catch up on a block we already committed.
    async fn gossip_data(self: Arc<Self>, ps: Arc<PeerState>) {
        loop {
            tokio::time::sleep(self.config.peer_gossip_sleep_duration).await;

            let rs = self.handle.get_round_state();
            let prs = ps.get_round_state();

            if let (Some(parts), Some(peer_parts)) = (&rs.proposal_block_parts, &prs.proposal_block_parts) {
                if parts.has_header(&prs.proposal_block_part_set_header) {
                    if let Some(index) = parts.bit_array().sub(peer_parts).pick_random() {
                        if let Some(part) = parts.get_part(index) {
                            tracing::trace!(peer = %ps.node_id(), height = prs.height, round = prs.round, %index, "Sending block part");
                            let msg = Message::BlockPart(BlockPart {
                                height: rs.height,
                                round: rs.round,
                                part: (*part).clone(),
                            });
                            self.channels.data.send(ps.node_id(), &msg.to_proto());
                            ps.set_has_proposal_block_part(prs.height, prs.round, index);
                        }
                        continue;
                    }
                }
            }

            let base = self.block_store.base();
            if base > 0 && 0 < prs.height && prs.height < rs.height && prs.height >= base {
                if prs.proposal_block_parts.is_none() {
                    // The peer never told us what it has of that block.
                    match self.block_store.load_block_meta(prs.height) {
                        Some(meta) => ps.init_proposal_block_parts(&meta.block_id.part_set_header),
                        None => tracing::error!(
                            height = prs.height,
                            store_base = base,
                            store_height = self.block_store.height(),
                            "Failed to load block meta"
                        ),
                    }
                    continue;
                }
                self.gossip_data_for_catchup(&rs, &prs, &ps);
                continue;
            }

            if rs.height != prs.height || rs.round != prs.round {
                continue;
            }

            if let Some(proposal) = &rs.proposal {
                if !prs.proposal {
                    self.channels
                        .data
                        .send(ps.node_id(), &Message::Proposal(proposal.clone()).to_proto());
                    ps.set_has_proposal(proposal);

                    if proposal.pol_round >= 0 {
                        if let Some(prevotes) = rs.votes.prevotes(proposal.pol_round) {
                            let msg = Message::ProposalPol(ProposalPol {
                                height: rs.height,
                                proposal_pol_round: proposal.pol_round,
                                proposal_pol: prevotes.bit_array(),
                            });
                            self.channels.data.send(ps.node_id(), &msg.to_proto());
                        }
                    }
                }
            }
        }
    }

    fn gossip_data_for_catchup(&self, rs: &RoundState, prs: &PeerRoundState, ps: &PeerState) {
        let Some(index) = prs
            .proposal_block_parts
            .as_ref()
            .and_then(|parts| parts.not().pick_random())
        else {
            return;
        };
        let Some(meta) = self.block_store.load_block_meta(prs.height) else {
            tracing::error!(
                height = prs.height,
                our_height = rs.height,
                store_base = self.block_store.base(),
                store_height = self.block_store.height(),
                "Failed to load block meta"
            );
            return;
        };
        if meta.block_id.part_set_header != prs.proposal_block_part_set_header {
            tracing::debug!(peer = %ps.node_id(), height = prs.height, "Peer is after another block of its height");
            return;
        }
        let Some(part) = self.block_store.load_block_part(prs.height, index) else {
            tracing::error!(height = prs.height, %index, "Failed to load block part");
            return;
        };
        tracing::debug!(peer = %ps.node_id(), height = prs.height, %index, "Sending block part for catchup");
        // The peer's height and round, so that it accepts the part.
        let msg = Message::BlockPart(BlockPart {
            height: prs.height,
            round: prs.round,
            part: (*part).clone(),
        });
        self.channels.data.send(ps.node_id(), &msg.to_proto());
        ps.set_has_proposal_block_part(prs.height, prs.round, index);
    }

    /// Sends the peer the votes it misses, one at a time.
    async fn gossip_votes(self: Arc<Self>, ps: Arc<PeerState>) {
        loop {
            let rs = self.handle.get_round_state();
            let prs = ps.get_round_state();

            if self.pick_votes(&rs, &prs, &ps) {
                tokio::task::yield_now().await;
                continue;
            }
            tokio::time::sleep(self.config.peer_gossip_sleep_duration).await;
        }
    }

    fn pick_votes(&self, rs: &RoundState, prs: &PeerRoundState, ps: &PeerState) -> bool {
        if rs.height == prs.height && self.gossip_votes_for_height(rs, prs, ps) {
            return true;
        }

        // A peer one height behind needs our last commit.
        if prs.height != 0 && rs.height == prs.height + 1 {
            if let Some(last_commit) = &rs.last_commit {
                if self.pick_send_vote(ps, last_commit) {
                    tracing::trace!(peer = %ps.node_id(), height = prs.height, "Picked last commit to send");
                    return true;
                }
            }
        }

        // Further behind, the commit from the block store.
        let base = self.block_store.base();
        if base > 0 && prs.height != 0 && rs.height >= prs.height + 2 && prs.height >= base {
            if let Some(commit) = self.block_store.load_block_commit(prs.height) {
                ps.ensure_catchup_commit_round(prs.height, commit.round, commit.size());
                if self.pick_send_vote(ps, &commit) {
                    tracing::trace!(peer = %ps.node_id(), height = prs.height, "Picked catchup commit to send");
                    return true;
                }
            }
        }
        false
    }

    fn gossip_votes_for_height(&self, rs: &RoundState, prs: &PeerRoundState, ps: &PeerState) -> bool {
        let in_round = prs.round != -1 && prs.round <= rs.round;

        if prs.step == Step::NewHeight {
            if let Some(last_commit) = &rs.last_commit {
                if self.pick_send_vote(ps, last_commit) {
                    return true;
                }
            }
        }

        if prs.step <= Step::Propose && in_round && prs.proposal_pol_round != -1 {
            if let Some(pol) = rs.votes.prevotes(prs.proposal_pol_round) {
                if self.pick_send_vote(ps, pol) {
                    return true;
                }
            }
        }

        if prs.step <= Step::PrevoteWait && in_round {
            if let Some(prevotes) = rs.votes.prevotes(prs.round) {
                if self.pick_send_vote(ps, prevotes) {
                    return true;
                }
            }
        }

        if prs.step <= Step::PrecommitWait && in_round {
            if let Some(precommits) = rs.votes.precommits(prs.round) {
                if self.pick_send_vote(ps, precommits) {
                    return true;
                }
            }
        }

        // Prevotes in any step, for the valid block mechanism.
        if in_round {
            if let Some(prevotes) = rs.votes.prevotes(prs.round) {
                if self.pick_send_vote(ps, prevotes) {
                    return true;
                }
            }
        }

        if prs.proposal_pol_round != -1 {
            if let Some(pol) = rs.votes.prevotes(prs.proposal_pol_round) {
                if self.pick_send_vote(ps, pol) {
                    return true;
                }
            }
        }
        false
    }

    fn pick_send_vote(&self, ps: &PeerState, votes: &impl VoteSetReader) -> bool {
        let Some(vote) = ps.pick_vote_to_send(votes) else {
            return false;
        };
        tracing::trace!(peer = %ps.node_id(), %vote, "Sending vote");
        self.channels
            .vote
            .send(ps.node_id(), &Message::Vote(vote.clone()).to_proto());
        if let Err(e) = ps.set_has_vote(&vote) {
            tracing::error!(peer = %ps.node_id(), error = %e, "Picked a vote the peer cannot have");
        }
        true
    }

    /// Tells the peer which blocks we saw +2/3 for, so that it can tell us
    /// which of those votes we miss.
    async fn query_maj23(self: Arc<Self>, ps: Arc<PeerState>) {
        loop {
            let rs = self.handle.get_round_state();
            let prs = ps.get_round_state();

            if rs.height == prs.height {
                let mut claims = vec![(prs.round, VoteType::Prevote), (prs.round, VoteType::Precommit)];
                if prs.proposal_pol_round >= 0 {
                    claims.push((prs.proposal_pol_round, VoteType::Prevote));
                }
                for (round, vote_type) in claims {
                    let maj23 = rs
                        .votes
                        .vote_set(round, vote_type)
                        .and_then(|votes| votes.two_thirds_majority());
                    if let Some(block_id) = maj23 {
                        self.send_maj23(&ps, prs.height, round, vote_type, block_id.clone());
                    }
                }
            }

            let store_height = self.block_store.height();
            if prs.catchup_commit_round != -1
                && prs.height > 0
                && prs.height <= store_height
                && prs.height >= self.block_store.base()
            {
                if let Some(commit) = load_commit(self.block_store.as_ref(), prs.height) {
                    self.send_maj23(&ps, prs.height, commit.round, VoteType::Precommit, commit.block_id);
                }
            }

            tokio::time::sleep(self.config.peer_query_maj23_sleep_duration).await;
        }
    }

    fn send_maj23(&self, ps: &PeerState, height: i64, round: i32, vote_type: VoteType, block_id: meridian_common::BlockId) {
        let msg = Message::VoteSetMaj23(VoteSetMaj23 {
            height,
            round,
            vote_type,
            block_id,
        });
        self.channels.state.send(ps.node_id(), &msg.to_proto());
    }

    /// Broadcasts what the state machine announces, and keeps repeating the
    /// latest valid block.
    async fn process_reactor_events(self: Arc<Self>, mut events: mpsc::UnboundedReceiver<ReactorEvent>) {
        let mut rebroadcast = tokio::time::interval(VALID_BLOCK_REBROADCAST_INTERVAL);
        rebroadcast.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut valid_block_height = None;

        loop {
            tokio::select! {
                event = events.recv() => {
                    let Some(event) = event else {
                        return;
                    };
                    match event {
                        ReactorEvent::NewRoundStep(msg) => self.broadcast_new_round_step(Message::NewRoundStep(msg)),
                        ReactorEvent::ValidBlock(msg) => {
                            valid_block_height = Some(msg.height);
                            self.broadcast_new_valid_block(Message::NewValidBlock(msg));
                        }
                        ReactorEvent::HasVote(msg) => self.broadcast_has_vote(msg),
                        ReactorEvent::PeerVote(peer) => {
                            if let Some(ps) = self.peer(&peer) {
                                ps.record_vote();
                            }
                        }
                        ReactorEvent::PeerBlockPart(peer) => {
                            if let Some(ps) = self.peer(&peer) {
                                ps.record_block_part();
                            }
                        }
                    }
                }
                _ = rebroadcast.tick() => {
                    let Some(height) = valid_block_height else {
                        continue;
                    };
                    let rs = self.handle.get_round_state();
                    if rs.height != height {
                        valid_block_height = None;
                        continue;
                    }
                    // The parts we have change, so the message is rebuilt.
                    if let Some(msg) = rs.new_valid_block_message() {
                        self.broadcast_new_valid_block(Message::NewValidBlock(msg));
                    }
                }
            }
        }
    }

    fn broadcast_new_round_step(&self, msg: Message) {
        self.channels.state.broadcast(&msg.to_proto());
    }

    fn broadcast_new_valid_block(&self, msg: Message) {
        self.channels.state.broadcast(&msg.to_proto());
    }

    fn broadcast_has_vote(&self, msg: HasVote) {
        self.channels
            .state
            .broadcast(&Message::HasVote(msg).to_proto());
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    #[test]
    fn channels_are_prioritised_for_data_then_votes() {
        let descriptors = [state_channel(), data_channel(), vote_channel(), vote_set_bits_channel()];
        let ids: Vec<_> = descriptors.iter().map(|d| d.id).collect();
        assert_eq!(ids, vec![0x20, 0x21, 0x22, 0x23]);

        let priority = |id| descriptors.iter().find(|d| d.id == id).unwrap().priority;
        assert!(priority(DATA_CHANNEL) > priority(VOTE_CHANNEL));
        assert!(priority(VOTE_CHANNEL) > priority(STATE_CHANNEL));
        assert!(priority(STATE_CHANNEL) > priority(VOTE_SET_BITS_CHANNEL));
        assert!(descriptors.iter().all(|d| d.recv_message_capacity == MAX_MSG_SIZE));
    }

    fn has_vote(index: i32) -> proto::Message {
        proto::Message {
            sum: Some(proto::message::Sum::HasVote(proto::HasVote {
                height: 1,
                round: 0,
                r#type: 1,
                index,
            })),
        }
    }

    #[test_log::test(tokio::test)]
    async fn panicking_handler_evicts_the_peer_and_keeps_serving() {
        let node = Router::new(NodeId::from("node"), p2p::Config::default());
        let bad = Router::new(NodeId::from("bad"), p2p::Config::default());
        let good = Router::new(NodeId::from("good"), p2p::Config::default());
        let (errors, receiver) = node.open_channel::<proto::Message>(state_channel()).unwrap().split();
        let from_bad = bad.open_channel::<proto::Message>(state_channel()).unwrap().sender();
        let from_good = good.open_channel::<proto::Message>(state_channel()).unwrap().sender();
        let mut updates = node.subscribe_peer_updates();
        p2p::transport::connect(&node, &bad).unwrap();
        p2p::transport::connect(&node, &good).unwrap();

        let handled = Arc::new(AtomicUsize::new(0));
        util::task::spawn(process_channel(
            handled.clone(),
            receiver,
            errors,
            "test",
            |handled: Arc<AtomicUsize>, _from, message: proto::Message| async move {
                if let Some(proto::message::Sum::HasVote(vote)) = &message.sum {
                    assert!(vote.index != 0, "vote index zero");
                }
                handled.fetch_add(1, Ordering::SeqCst);
                anyhow::Ok(())
            },
        ));

        assert!(from_bad.send(&NodeId::from("node"), &has_vote(0)));
        tokio::time::timeout(Duration::from_secs(5), async {
            while let Some(update) = updates.recv().await {
                if update.node_id == NodeId::from("bad") && update.status == PeerStatus::Down {
                    return;
                }
            }
        })
        .await
        .expect("the panicking peer is evicted");

        assert!(from_good.send(&NodeId::from("node"), &has_vote(1)));
        tokio::time::timeout(Duration::from_secs(5), async {
            while handled.load(Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("later messages are still handled");
        assert_eq!(node.peers(), vec![NodeId::from("good")]);
    }
}
