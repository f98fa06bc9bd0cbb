//! Tendermint-style BFT consensus.
//!
//! The [`ConsensusState`] machine decides one block per height through
//! rounds of proposal, prevote and precommit. The [`Reactor`] connects it to
//! peers over four channels and gossips proposals, block parts and votes to
//! every peer according to what that peer is known to have. Inputs are
//! logged to a [`wal::Wal`] first, and on restart the [`Handshaker`] and the
//! WAL replay bring the node back to where it stopped.

pub mod config;
pub mod error;
pub mod height_vote_set;
pub mod messages;
pub mod peer_state;
pub mod reactor;
pub mod replay;
pub mod round_state;
pub mod state;
pub mod ticker;
pub mod wal;

pub use config::{Config, TimeoutValues};
pub use error::{ConsensusError, FatalError, HandshakeError};
pub use height_vote_set::{HeightVoteSet, HeightVoteSetError};
pub use messages::{Message, MsgInfo, TimeoutInfo, WalMessage};
pub use peer_state::{PeerRoundState, PeerState};
pub use reactor::Reactor;
pub use replay::Handshaker;
pub use round_state::{RoundState, Step};
pub use state::{load_commit, ConsensusState, StateHandle, StateStopped};
pub use ticker::TimeoutTicker;
pub use wal::{FileWal, NilWal, Wal, WalError};
