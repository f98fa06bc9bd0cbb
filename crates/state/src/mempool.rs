use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use meridian_abci::{Application, CheckTxKind, ExecTxResult, RequestCheckTx, ResponseCheckTx};
use meridian_common::Tx;
use tokio::sync::{Mutex as AsyncMutex, Notify, OwnedMutexGuard};

/// The pool of transactions waiting to be included in a block.
///
/// Consensus holds [`Mempool::lock`] from the moment it starts executing a
/// block until [`Mempool::update`] returns, so no transaction is checked
/// against application state that is about to change.
#[async_trait::async_trait]
pub trait Mempool: Send + Sync {
    /// Runs `CheckTx` on the application and adds the transaction if it
    /// passes.
    async fn check_tx(&self, tx: Tx) -> anyhow::Result<ResponseCheckTx>;

    /// Transactions in arrival order, as many as fit in `max_bytes` and
    /// `max_gas`. Negative limits mean no limit.
    fn reap_max_bytes_max_gas(&self, max_bytes: i64, max_gas: i64) -> Vec<Tx>;

    /// Removes the transactions committed at `height` and rechecks the rest.
    /// Must be called with the lock held.
    async fn update(&self, height: i64, txs: &[Tx], results: &[ExecTxResult]) -> anyhow::Result<()>;

    async fn lock(&self) -> OwnedMutexGuard<()>;

    fn size(&self) -> usize;

    /// Notified once per height, when the pool first holds transactions.
    fn txs_available(&self) -> Arc<Notify>;
}

/// A mempool that never has transactions.
#[derive(Default)]
pub struct EmptyMempool {
    lock: Arc<AsyncMutex<()>>,
    notify: Arc<Notify>,
}

#[async_trait::async_trait]
impl Mempool for EmptyMempool {
    async fn check_tx(&self, _tx: Tx) -> anyhow::Result<ResponseCheckTx> {
        Ok(ResponseCheckTx::default())
    }

    fn reap_max_bytes_max_gas(&self, _max_bytes: i64, _max_gas: i64) -> Vec<Tx> {
        Vec::new()
    }

    async fn update(&self, _height: i64, _txs: &[Tx], _results: &[ExecTxResult]) -> anyhow::Result<()> {
        Ok(())
    }

    async fn lock(&self) -> OwnedMutexGuard<()> {
        self.lock.clone().lock_owned().await
    }

    fn size(&self) -> usize {
        0
    }

    fn txs_available(&self) -> Arc<Notify> {
        self.notify.clone()
    }
}

struct PoolTx {
    tx: Tx,
    gas_wanted: i64,
}

#[derive(Default)]
struct Pool {
    txs: VecDeque<PoolTx>,
    keys: HashSet<Tx>,
    height: i64,
    notified: bool,
}

impl Pool {
    fn notify_if_available(&mut self, notify: &Notify) {
        if !self.notified && !self.txs.is_empty() {
            self.notified = true;
            notify.notify_one();
        }
    }
}

/// A FIFO mempool backed by the application's `CheckTx`.
pub struct TxMempool {
    app: Arc<dyn Application>,
    pool: parking_lot::Mutex<Pool>,
    lock: Arc<AsyncMutex<()>>,
    notify: Arc<Notify>,
    max_txs: usize,
}

impl TxMempool {
    pub const DEFAULT_MAX_TXS: usize = 5000;

    pub fn new(app: Arc<dyn Application>) -> Self {
        Self {
            app,
            pool: Default::default(),
            lock: Default::default(),
            notify: Default::default(),
            max_txs: Self::DEFAULT_MAX_TXS,
        }
    }

    pub fn with_max_txs(mut self, max_txs: usize) -> Self {
        self.max_txs = max_txs;
        self
    }
}

#[async_trait::async_trait]
impl Mempool for TxMempool {
    async fn check_tx(&self, tx: Tx) -> anyhow::Result<ResponseCheckTx> {
        let _guard = self.lock.lock().await;
        {
            let pool = self.pool.lock();
            anyhow::ensure!(!pool.keys.contains(&tx), "tx already exists in the mempool");
            anyhow::ensure!(pool.txs.len() < self.max_txs, "mempool is full");
        }

        let response = self
            .app
            .check_tx(RequestCheckTx {
                tx: tx.clone(),
                kind: CheckTxKind::New,
            })
            .await?;
        if !response.is_ok() {
            tracing::debug!(code = response.code, log = %response.log, "Rejected tx");
            return Ok(response);
        }

        let mut pool = self.pool.lock();
        if pool.keys.insert(tx.clone()) {
            pool.txs.push_back(PoolTx {
                tx,
                gas_wanted: response.gas_wanted,
            });
            pool.notify_if_available(&self.notify);
        }
        Ok(response)
    }

    fn reap_max_bytes_max_gas(&self, max_bytes: i64, max_gas: i64) -> Vec<Tx> {
        let pool = self.pool.lock();
        let mut total_bytes = 0i64;
        let mut total_gas = 0i64;
        let mut txs = Vec::new();
        for entry in &pool.txs {
            total_bytes += entry.tx.len() as i64;
            if max_bytes > -1 && total_bytes > max_bytes {
                break;
            }
            total_gas += entry.gas_wanted;
            if max_gas > -1 && total_gas > max_gas {
                break;
            }
            txs.push(entry.tx.clone());
        }
        txs
    }

    async fn update(&self, height: i64, txs: &[Tx], _results: &[ExecTxResult]) -> anyhow::Result<()> {
        let remaining: Vec<Tx> = {
            let mut pool = self.pool.lock();
            pool.height = height;
            pool.notified = false;
            for tx in txs {
                pool.keys.remove(tx);
            }
            let Pool { txs: queue, keys, .. } = &mut *pool;
            queue.retain(|entry| keys.contains(&entry.tx));
            queue.iter().map(|entry| entry.tx.clone()).collect()
        };

        let mut invalid = HashSet::new();
        for tx in remaining {
            let response = self
                .app
                .check_tx(RequestCheckTx {
                    tx: tx.clone(),
                    kind: CheckTxKind::Recheck,
                })
                .await?;
            if !response.is_ok() {
                invalid.insert(tx);
            }
        }

        let mut pool = self.pool.lock();
        if !invalid.is_empty() {
            tracing::debug!(%height, count = invalid.len(), "Dropping txs that failed recheck");
            pool.txs.retain(|entry| !invalid.contains(&entry.tx));
            for tx in &invalid {
                pool.keys.remove(tx);
            }
        }
        pool.notify_if_available(&self.notify);
        Ok(())
    }

    async fn lock(&self) -> OwnedMutexGuard<()> {
        self.lock.clone().lock_owned().await
    }

    fn size(&self) -> usize {
        self.pool.lock().txs.len()
    }

    fn txs_available(&self) -> Arc<Notify> {
        self.notify.clone()
    }
}

#[cfg(test)]
mod tests {
    use meridian_abci::KvStoreApplication;

    use super::*;

    fn mempool() -> TxMempool {
        TxMempool::new(Arc::new(KvStoreApplication::new()))
    }

    #[tokio::test]
    async fn reaps_in_arrival_order_within_limits() {
        let mempool = mempool();
        for tx in ["a=1", "b=2", "c=3"] {
            assert!(mempool.check_tx(tx.into()).await.unwrap().is_ok());
        }
        assert_eq!(mempool.size(), 3);
        assert_eq!(mempool.reap_max_bytes_max_gas(-1, -1).len(), 3);
        assert_eq!(
            mempool.reap_max_bytes_max_gas(6, -1),
            vec![b"a=1".to_vec(), b"b=2".to_vec()]
        );
        assert_eq!(mempool.reap_max_bytes_max_gas(-1, 1), vec![b"a=1".to_vec()]);
    }

    #[tokio::test]
    async fn rejects_duplicates_and_invalid_txs() {
        let mempool = mempool();
        mempool.check_tx(b"a".to_vec()).await.unwrap();
        assert!(mempool.check_tx(b"a".to_vec()).await.is_err());
        assert!(!mempool.check_tx(Vec::new()).await.unwrap().is_ok());
        assert_eq!(mempool.size(), 1);
    }

    #[tokio::test]
    async fn update_removes_committed_txs_and_renotifies() {
        let mempool = mempool();
        let available = mempool.txs_available();
        mempool.check_tx(b"a".to_vec()).await.unwrap();
        mempool.check_tx(b"b".to_vec()).await.unwrap();
        available.notified().await;

        let guard = mempool.lock().await;
        mempool.update(1, &[b"a".to_vec()], &[]).await.unwrap();
        drop(guard);

        assert_eq!(mempool.reap_max_bytes_max_gas(-1, -1), vec![b"b".to_vec()]);
        available.notified().await;
    }
}
