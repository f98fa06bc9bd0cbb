//! Protobuf schema shared by the consensus wire protocol and the write-ahead
//! log.
//!
//! The message structs mirror the `tendermint.types`, `tendermint.crypto`,
//! `tendermint.libs.bits` and `tendermint.consensus` packages field for field
//! (same tags, same scalar types) so that encodings stay byte compatible with
//! other implementations of the protocol.

pub mod consensus;
pub mod crypto;
pub mod libs;
pub mod types;

pub use prost::Message;
pub use prost_types::{Duration, Timestamp};
