use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use meridian_consensus::{Config as ConsensusConfig, TimeoutValues};

#[derive(Parser, Debug)]
#[command(name = "meridian")]
#[command(version)]
#[command(about = "Runs a network of meridian validators inside one process.")]
struct Cli {
    #[arg(
        long,
        value_name = "N",
        long_help = "Number of validators, each with equal voting power",
        env = "MERIDIAN_VALIDATORS",
        default_value = "4",
        value_parser = clap::value_parser!(u16).range(1..)
    )]
    validators: u16,

    #[arg(
        long,
        value_name = "DIR",
        value_hint = clap::ValueHint::DirPath,
        long_help = "Directory for the genesis, validator keys and WAL files. Must not hold a previous network. A temporary directory is used when unset",
        env = "MERIDIAN_HOME"
    )]
    home: Option<PathBuf>,

    #[arg(
        long,
        value_name = "HEIGHT",
        long_help = "Stop once every validator committed this height. Runs until interrupted when unset",
        env = "MERIDIAN_BLOCKS"
    )]
    blocks: Option<i64>,

    #[arg(
        long = "chain-id",
        value_name = "ID",
        env = "MERIDIAN_CHAIN_ID",
        default_value = "meridian-testnet"
    )]
    chain_id: String,

    #[arg(
        long = "timeout-propose",
        value_name = "MILLIS",
        long_help = "How long to wait for a proposal in round 0",
        env = "MERIDIAN_TIMEOUT_PROPOSE",
        default_value = "3000"
    )]
    timeout_propose: u64,

    #[arg(
        long = "timeout-vote",
        value_name = "MILLIS",
        long_help = "How long to wait for more votes after +2/3 of any votes in round 0",
        env = "MERIDIAN_TIMEOUT_VOTE",
        default_value = "1000"
    )]
    timeout_vote: u64,

    #[arg(
        long = "timeout-commit",
        value_name = "MILLIS",
        long_help = "Pause after a commit before the next height starts",
        env = "MERIDIAN_TIMEOUT_COMMIT",
        default_value = "1000"
    )]
    timeout_commit: u64,

    #[arg(
        long = "skip-timeout-commit",
        long_help = "Start the next height as soon as all precommits are in",
        env = "MERIDIAN_SKIP_TIMEOUT_COMMIT",
        default_value = "false",
        action = clap::ArgAction::Set
    )]
    skip_timeout_commit: bool,

    #[arg(
        long = "tx-interval",
        value_name = "MILLIS",
        long_help = "Submit a key=value transaction to the first validator this often. No transactions when unset",
        env = "MERIDIAN_TX_INTERVAL"
    )]
    tx_interval: Option<u64>,
}

pub struct Config {
    pub validators: usize,
    pub home: Option<PathBuf>,
    pub target_height: Option<i64>,
    pub chain_id: String,
    pub consensus: ConsensusConfig,
    pub tx_interval: Option<Duration>,
}

impl Config {
    pub fn parse_cmd_line() -> anyhow::Result<Self> {
        Self::from_cli(Cli::parse())
    }

    fn from_cli(cli: Cli) -> anyhow::Result<Self> {
        if let Some(blocks) = cli.blocks {
            anyhow::ensure!(blocks > 0, "--blocks must be positive, got {blocks}");
        }
        anyhow::ensure!(!cli.chain_id.is_empty(), "--chain-id must not be empty");

        let defaults = TimeoutValues::default();
        let timeouts = TimeoutValues {
            propose: Duration::from_millis(cli.timeout_propose),
            vote: Duration::from_millis(cli.timeout_vote),
            commit: Duration::from_millis(cli.timeout_commit),
            ..defaults
        };
        let consensus = ConsensusConfig::default()
            .with_timeout_values(timeouts)
            .with_skip_timeout_commit(cli.skip_timeout_commit);

        Ok(Self {
            validators: cli.validators.into(),
            home: cli.home,
            target_height: cli.blocks,
            chain_id: cli.chain_id,
            consensus,
            tx_interval: cli.tx_interval.map(Duration::from_millis),
        })
    }
}
