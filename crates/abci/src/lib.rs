//! The interface between consensus and the replicated application.
//!
//! Consensus treats the application as an opaque state transition function:
//! it proposes and finalizes blocks of transactions and records the app hash
//! the application reports back.

pub mod kvstore;
pub mod types;

pub use kvstore::KvStoreApplication;
pub use types::*;

#[async_trait::async_trait]
pub trait Application: Send + Sync {
    /// The last block the application committed.
    async fn info(&self, request: RequestInfo) -> anyhow::Result<ResponseInfo>;

    /// Called once, before the first block, when the application has no
    /// state.
    async fn init_chain(&self, request: RequestInitChain) -> anyhow::Result<ResponseInitChain>;

    /// Lets the proposer reorder, drop or add transactions. By default the
    /// mempool transactions are kept as they are, up to `max_tx_bytes`.
    async fn prepare_proposal(
        &self,
        request: RequestPrepareProposal,
    ) -> anyhow::Result<ResponsePrepareProposal> {
        let mut total = 0i64;
        let txs = request
            .txs
            .into_iter()
            .take_while(|tx| {
                total += tx.len() as i64;
                request.max_tx_bytes < 0 || total <= request.max_tx_bytes
            })
            .collect();
        Ok(ResponsePrepareProposal { txs })
    }

    async fn process_proposal(
        &self,
        _request: RequestProcessProposal,
    ) -> anyhow::Result<ResponseProcessProposal> {
        Ok(ResponseProcessProposal {
            status: ProposalStatus::Accept,
        })
    }

    /// Executes a decided block. State changes must not become visible
    /// until [`Application::commit`].
    async fn finalize_block(
        &self,
        request: RequestFinalizeBlock,
    ) -> anyhow::Result<ResponseFinalizeBlock>;

    async fn commit(&self) -> anyhow::Result<ResponseCommit>;

    async fn check_tx(&self, _request: RequestCheckTx) -> anyhow::Result<ResponseCheckTx> {
        Ok(ResponseCheckTx::default())
    }
}
