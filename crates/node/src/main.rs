#![deny(rust_2018_idioms)]

use std::time::Duration;

use anyhow::Context;
use tracing::info;

mod config;
mod testnet;

/// Time given to tasks to wind down after shutdown was requested.
const SHUTDOWN_GRACE_PERIOD: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if std::env::var_os("RUST_LOG").is_none() {
        std::env::set_var("RUST_LOG", "info");
    }
    setup_tracing();

    let config = config::Config::parse_cmd_line().context("Parsing configuration")?;
    info!(version = env!("CARGO_PKG_VERSION"), validators = config.validators, "Starting network");

    // Keeps a temporary home alive until the end of main.
    let (home, _scratch) = match &config.home {
        Some(home) => {
            std::fs::create_dir_all(home).with_context(|| format!("Creating {}", home.display()))?;
            (home.clone(), None)
        }
        None => {
            let dir = tempfile::tempdir().context("Creating a temporary home")?;
            (dir.path().to_path_buf(), Some(dir))
        }
    };

    let (genesis, signers) = testnet::init(&home, &config)?;
    let mut validators = Vec::with_capacity(signers.len());
    for (index, signer) in signers.into_iter().enumerate() {
        validators.push(testnet::validator(index, &home, &config, &genesis, signer).await?);
    }

    let routers: Vec<_> = validators.iter().map(|v| v.router.clone()).collect();
    p2p::transport::connect_all(&routers).context("Connecting validators")?;
    let mut new_blocks = validators[0].event_bus.subscribe();
    for v in &validators {
        v.reactor.start();
    }
    info!(home = %home.display(), "Validators started");

    if let Some(interval) = config.tx_interval {
        util::task::spawn(submit_txs(validators[0].mempool.clone(), interval));
    }

    let outcome = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted, shutting down");
            Ok(())
        }
        _ = futures::future::select_all(validators.iter().map(|v| Box::pin(v.reactor.stopped()))) => {
            let failed = validators
                .iter()
                .find_map(|v| v.reactor.take_fatal_error().map(|e| (v.id.clone(), e)));
            match failed {
                Some((id, error)) => Err(anyhow::Error::new(error).context(format!("Consensus of {id} halted"))),
                None => Err(anyhow::anyhow!("A validator stopped unexpectedly")),
            }
        }
        reached = wait_for_target(&validators, &mut new_blocks, config.target_height) => {
            info!(height = reached, "Target height reached on every validator");
            Ok(())
        }
    };

    for v in &validators {
        v.reactor.stop();
        v.router.stop();
    }
    util::task::tracker::close();
    if tokio::time::timeout(SHUTDOWN_GRACE_PERIOD, util::task::tracker::wait())
        .await
        .is_err()
    {
        tracing::warn!("Shutdown timed out");
        util::task::tracker::log_registry();
    }

    for v in &validators {
        info!(node = %v.id, height = v.block_store.height(), "Final height");
    }
    outcome
}

/// Resolves once every validator committed `target`, never without one.
async fn wait_for_target(
    validators: &[testnet::Validator],
    events: &mut tokio::sync::broadcast::Receiver<meridian_common::Event>,
    target: Option<i64>,
) -> i64 {
    let Some(target) = target else {
        return std::future::pending().await;
    };
    let mut check = tokio::time::interval(Duration::from_millis(100));
    loop {
        tokio::select! {
            event = events.recv() => {
                if let Ok(meridian_common::Event::NewBlock { block, .. }) = event {
                    info!(height = block.header.height, txs = block.data.txs.len(), "Committed block");
                }
            }
            _ = check.tick() => {}
        }
        if validators.iter().all(|v| v.block_store.height() >= target) {
            return target;
        }
    }
}

async fn submit_txs(mempool: std::sync::Arc<dyn meridian_state::Mempool>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    for n in 0u64.. {
        ticker.tick().await;
        let tx = format!("key{n}=value{n}").into_bytes();
        match mempool.check_tx(tx).await {
            Ok(response) if response.code == 0 => tracing::debug!(n, "Submitted transaction"),
            Ok(response) => tracing::warn!(code = response.code, log = %response.log, "Transaction rejected"),
            Err(error) => tracing::warn!(%error, "Submitting transaction failed"),
        }
    }
}

fn setup_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();
}
