//! Chain state and the collaborators consensus drives when it commits a
//! block: the state and block stores, the mempool, the evidence pool and the
//! [`BlockExecutor`] that ties them to the application.

pub mod block_store;
pub mod evidence;
pub mod execution;
pub mod mempool;
pub mod state;
pub mod store;

pub use block_store::{BlockStore, MemoryBlockStore};
pub use evidence::{EmptyEvidencePool, EvidencePool, MemoryEvidencePool};
pub use execution::{BlockExecError, BlockExecutor};
pub use mempool::{EmptyMempool, Mempool, TxMempool};
pub use state::State;
pub use store::{MemoryStore, Store, StoreError};
