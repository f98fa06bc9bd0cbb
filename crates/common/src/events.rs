use std::sync::Arc;

use tokio::sync::broadcast;

use crate::block::{Block, BlockId};
use crate::evidence::DuplicateVoteEvidence;
use crate::validator::Validator;
use crate::vote::Vote;

const EVENT_BUS_CAPACITY: usize = 1024;

/// Height, round and step of the state machine when an event fired.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RoundStateEvent {
    pub height: i64,
    pub round: i32,
    pub step: String,
}

impl RoundStateEvent {
    pub fn to_proto(&self) -> p2p_proto::types::EventDataRoundState {
        p2p_proto::types::EventDataRoundState {
            height: self.height,
            round: self.round,
            step: self.step.clone(),
        }
    }
}

#[derive(Clone, Debug)]
pub enum Event {
    NewRoundStep(RoundStateEvent),
    NewRound {
        round_state: RoundStateEvent,
        proposer: Vec<u8>,
    },
    CompleteProposal {
        round_state: RoundStateEvent,
        block_id: BlockId,
    },
    TimeoutPropose(RoundStateEvent),
    TimeoutWait(RoundStateEvent),
    Polka(RoundStateEvent),
    Lock(RoundStateEvent),
    Relock(RoundStateEvent),
    ValidBlock(RoundStateEvent),
    Vote(Vote),
    NewBlock {
        block: Arc<Block>,
        block_id: BlockId,
    },
    NewEvidence {
        evidence: DuplicateVoteEvidence,
        height: i64,
    },
    ValidatorSetUpdates(Vec<Validator>),
    BlockSyncStatus {
        complete: bool,
        height: i64,
    },
}

impl Event {
    pub fn name(&self) -> &'static str {
        match self {
            Event::NewRoundStep(_) => "NewRoundStep",
            Event::NewRound { .. } => "NewRound",
            Event::CompleteProposal { .. } => "CompleteProposal",
            Event::TimeoutPropose(_) => "TimeoutPropose",
            Event::TimeoutWait(_) => "TimeoutWait",
            Event::Polka(_) => "Polka",
            Event::Lock(_) => "Lock",
            Event::Relock(_) => "Relock",
            Event::ValidBlock(_) => "ValidBlock",
            Event::Vote(_) => "Vote",
            Event::NewBlock { .. } => "NewBlock",
            Event::NewEvidence { .. } => "NewEvidence",
            Event::ValidatorSetUpdates(_) => "ValidatorSetUpdates",
            Event::BlockSyncStatus { .. } => "BlockSyncStatus",
        }
    }
}

/// Fan-out of events to any number of subscribers. Slow subscribers lag and
/// lose events rather than blocking the publisher.
#[derive(Clone, Debug)]
pub struct EventBus {
    sender: broadcast::Sender<Event>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    pub fn publish(&self, event: Event) {
        tracing::trace!(event = event.name(), "Publishing event");
        // No subscribers is fine.
        let _ = self.sender.send(event);
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[tokio::test]
    async fn subscribers_receive_published_events() {
        let bus = EventBus::new();
        bus.publish(Event::BlockSyncStatus {
            complete: false,
            height: 1,
        });

        let mut rx = bus.subscribe();
        bus.publish(Event::BlockSyncStatus {
            complete: true,
            height: 5,
        });
        assert_matches!(
            rx.recv().await,
            Ok(Event::BlockSyncStatus {
                complete: true,
                height: 5
            })
        );
    }
}
