//! A key/value store application.
//!
//! Transactions are `key=value` (or just `key`, storing the key as its own
//! value). A transaction of the form `val:<hex pubkey>!<power>` updates the
//! validator set instead.

use std::collections::BTreeMap;

use anyhow::Context;
use meridian_common::PublicKey;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};

use crate::types::*;
use crate::Application;

const VALIDATOR_TX_PREFIX: &str = "val:";
const CODE_INVALID_TX: u32 = 1;

#[derive(Debug, Default)]
struct KvState {
    store: BTreeMap<Vec<u8>, Vec<u8>>,
    height: i64,
    app_hash: Vec<u8>,
    staged: Option<Staged>,
}

#[derive(Debug)]
struct Staged {
    height: i64,
    app_hash: Vec<u8>,
    writes: Vec<(Vec<u8>, Vec<u8>)>,
}

#[derive(Debug, Default)]
pub struct KvStoreApplication {
    state: Mutex<KvState>,
    retain_blocks: i64,
}

impl KvStoreApplication {
    pub fn new() -> Self {
        Self::default()
    }

    /// Asks consensus to prune all but the last `retain_blocks` blocks.
    pub fn with_retain_blocks(mut self, retain_blocks: i64) -> Self {
        self.retain_blocks = retain_blocks;
        self
    }

    pub fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.state.lock().store.get(key).cloned()
    }

    pub fn height(&self) -> i64 {
        self.state.lock().height
    }

    pub fn app_hash(&self) -> Vec<u8> {
        self.state.lock().app_hash.clone()
    }
}

fn parse_validator_tx(tx: &[u8]) -> anyhow::Result<ValidatorUpdate> {
    let tx = std::str::from_utf8(tx).context("validator tx is not utf-8")?;
    let body = tx
        .strip_prefix(VALIDATOR_TX_PREFIX)
        .context("missing validator prefix")?;
    let (key, power) = body.split_once('!').context("expected <pubkey>!<power>")?;
    let bytes: [u8; 32] = hex::decode(key)
        .context("public key is not hex")?
        .try_into()
        .map_err(|_| anyhow::anyhow!("public key must be 32 bytes"))?;
    let power: i64 = power.parse().context("power is not a number")?;
    anyhow::ensure!(power >= 0, "power cannot be negative");
    Ok(ValidatorUpdate {
        pub_key: PublicKey::from_bytes(bytes),
        power,
    })
}

fn split_kv(tx: &[u8]) -> (Vec<u8>, Vec<u8>) {
    match tx.iter().position(|b| *b == b'=') {
        Some(i) => (tx[..i].to_vec(), tx[i + 1..].to_vec()),
        None => (tx.to_vec(), tx.to_vec()),
    }
}

#[async_trait::async_trait]
impl Application for KvStoreApplication {
    async fn info(&self, _request: RequestInfo) -> anyhow::Result<ResponseInfo> {
        let state = self.state.lock();
        Ok(ResponseInfo {
            data: format!("{{\"size\":{}}}", state.store.len()),
            version: env!("CARGO_PKG_VERSION").to_owned(),
            app_version: 1,
            last_block_height: state.height,
            last_block_app_hash: state.app_hash.clone(),
        })
    }

    async fn init_chain(&self, request: RequestInitChain) -> anyhow::Result<ResponseInitChain> {
        let mut state = self.state.lock();
        state.app_hash = Sha256::digest(&request.app_state_bytes).to_vec();
        tracing::info!(chain_id = %request.chain_id, validators = request.validators.len(), "Initialized chain");
        Ok(ResponseInitChain {
            consensus_params: None,
            validators: Vec::new(),
            app_hash: state.app_hash.clone(),
        })
    }

    async fn process_proposal(
        &self,
        request: RequestProcessProposal,
    ) -> anyhow::Result<ResponseProcessProposal> {
        let valid = request.txs.iter().all(|tx| {
            !tx.is_empty() && (!tx.starts_with(VALIDATOR_TX_PREFIX.as_bytes()) || parse_validator_tx(tx).is_ok())
        });
        Ok(ResponseProcessProposal {
            status: if valid {
                ProposalStatus::Accept
            } else {
                ProposalStatus::Reject
            },
        })
    }

    async fn finalize_block(
        &self,
        request: RequestFinalizeBlock,
    ) -> anyhow::Result<ResponseFinalizeBlock> {
        let mut state = self.state.lock();

        let mut hasher = Sha256::new();
        hasher.update(&state.app_hash);
        hasher.update(request.height.to_be_bytes());

        let mut writes = Vec::new();
        let mut tx_results = Vec::with_capacity(request.txs.len());
        let mut validator_updates = Vec::new();
        for tx in &request.txs {
            hasher.update(tx);
            if tx.starts_with(VALIDATOR_TX_PREFIX.as_bytes()) {
                match parse_validator_tx(tx) {
                    Ok(update) => {
                        validator_updates.push(update);
                        tx_results.push(ExecTxResult::default());
                    }
                    Err(e) => tx_results.push(ExecTxResult {
                        code: CODE_INVALID_TX,
                        log: e.to_string(),
                        ..Default::default()
                    }),
                }
                continue;
            }
            let (key, value) = split_kv(tx);
            tx_results.push(ExecTxResult {
                events: vec![Event {
                    kind: "app".into(),
                    attributes: vec![("key".into(), String::from_utf8_lossy(&key).into_owned())],
                }],
                ..Default::default()
            });
            writes.push((key, value));
        }

        let app_hash = hasher.finalize().to_vec();
        state.staged = Some(Staged {
            height: request.height,
            app_hash: app_hash.clone(),
            writes,
        });
        Ok(ResponseFinalizeBlock {
            events: Vec::new(),
            tx_results,
            validator_updates,
            consensus_param_updates: None,
            app_hash,
        })
    }

    async fn commit(&self) -> anyhow::Result<ResponseCommit> {
        let mut state = self.state.lock();
        let staged = state
            .staged
            .take()
            .context("commit called without a finalized block")?;
        state.store.extend(staged.writes);
        state.height = staged.height;
        state.app_hash = staged.app_hash;

        let retain_height = if self.retain_blocks > 0 && state.height >= self.retain_blocks {
            state.height - self.retain_blocks + 1
        } else {
            0
        };
        Ok(ResponseCommit { retain_height })
    }

    async fn check_tx(&self, request: RequestCheckTx) -> anyhow::Result<ResponseCheckTx> {
        if request.tx.is_empty() {
            return Ok(ResponseCheckTx {
                code: CODE_INVALID_TX,
                log: "empty transaction".into(),
                ..Default::default()
            });
        }
        if request.tx.starts_with(VALIDATOR_TX_PREFIX.as_bytes()) {
            if let Err(e) = parse_validator_tx(&request.tx) {
                return Ok(ResponseCheckTx {
                    code: CODE_INVALID_TX,
                    log: e.to_string(),
                    ..Default::default()
                });
            }
        }
        Ok(ResponseCheckTx {
            gas_wanted: 1,
            ..Default::default()
        })
    }
}
