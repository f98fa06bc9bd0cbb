use std::path::PathBuf;
use std::time::{Duration, SystemTime};

/// The configuration for the consensus engine.
#[derive(Clone, Debug)]
pub struct Config {
    /// Directory holding the write-ahead log segments.
    pub wal_path: PathBuf,
    /// The timeout configuration.
    pub timeout_values: TimeoutValues,
    /// Start the next height as soon as all precommits are in, instead of
    /// waiting for the commit timeout.
    pub skip_timeout_commit: bool,
    /// Propose blocks without transactions. When disabled the proposer waits
    /// for the mempool.
    pub create_empty_blocks: bool,
    /// Propose an empty block after this long even without transactions.
    /// Zero disables the interval.
    pub create_empty_blocks_interval: Duration,
    /// Pause of the gossip routines when there is nothing to send.
    pub peer_gossip_sleep_duration: Duration,
    /// How often peers are told about the majorities we have seen.
    pub peer_query_maj23_sleep_duration: Duration,
    /// How often buffered WAL writes are flushed to disk.
    pub wal_flush_interval: Duration,
    /// Refuse to start when our own signature is found in any of this many
    /// last commits. Zero disables the check.
    pub double_sign_check_height: i64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            wal_path: PathBuf::from("data/cs.wal"),
            timeout_values: TimeoutValues::default(),
            skip_timeout_commit: false,
            create_empty_blocks: true,
            create_empty_blocks_interval: Duration::ZERO,
            peer_gossip_sleep_duration: Duration::from_millis(100),
            peer_query_maj23_sleep_duration: Duration::from_secs(2),
            wal_flush_interval: Duration::from_secs(2),
            double_sign_check_height: 0,
        }
    }
}

impl Config {
    /// Set the WAL directory.
    pub fn with_wal_path(mut self, wal_path: impl Into<PathBuf>) -> Self {
        self.wal_path = wal_path.into();
        self
    }

    /// Set the timeout values.
    pub fn with_timeout_values(mut self, timeout_values: TimeoutValues) -> Self {
        self.timeout_values = timeout_values;
        self
    }

    pub fn with_skip_timeout_commit(mut self, skip: bool) -> Self {
        self.skip_timeout_commit = skip;
        self
    }

    /// Set whether empty blocks are proposed, and how often when they are
    /// not.
    pub fn with_create_empty_blocks(mut self, create: bool, interval: Duration) -> Self {
        self.create_empty_blocks = create;
        self.create_empty_blocks_interval = interval;
        self
    }

    /// Set the gossip and majority query intervals.
    pub fn with_peer_gossip(mut self, gossip_sleep: Duration, query_maj23_sleep: Duration) -> Self {
        self.peer_gossip_sleep_duration = gossip_sleep;
        self.peer_query_maj23_sleep_duration = query_maj23_sleep;
        self
    }

    pub fn with_wal_flush_interval(mut self, interval: Duration) -> Self {
        self.wal_flush_interval = interval;
        self
    }

    pub fn with_double_sign_check_height(mut self, height: i64) -> Self {
        self.double_sign_check_height = height;
        self
    }

    /// Whether the proposer has to wait for transactions before proposing.
    pub fn wait_for_txs(&self) -> bool {
        !self.create_empty_blocks || !self.create_empty_blocks_interval.is_zero()
    }

    pub fn propose(&self, round: i32) -> Duration {
        let t = &self.timeout_values;
        t.propose + t.propose_delta * round.max(0) as u32
    }

    pub fn prevote(&self, round: i32) -> Duration {
        self.vote(round)
    }

    pub fn precommit(&self, round: i32) -> Duration {
        self.vote(round)
    }

    fn vote(&self, round: i32) -> Duration {
        let t = &self.timeout_values;
        t.vote + t.vote_delta * round.max(0) as u32
    }

    /// When to start the next height, given the time the last one committed.
    pub fn commit(&self, commit_time: SystemTime) -> SystemTime {
        commit_time + self.timeout_values.commit
    }
}

/// The timeout values for the consensus engine. Timeouts grow linearly with
/// the round: round `r` waits `base + delta * r`.
#[derive(Debug, Clone)]
pub struct TimeoutValues {
    /// How long to wait for a proposal.
    pub propose: Duration,
    pub propose_delta: Duration,
    /// How long to wait for more votes after seeing +2/3 of any votes.
    pub vote: Duration,
    pub vote_delta: Duration,
    /// How long to wait after committing a block before starting the next
    /// height, to collect the remaining precommits.
    pub commit: Duration,
}

impl Default for TimeoutValues {
    fn default() -> Self {
        Self {
            propose: Duration::from_secs(3),
            propose_delta: Duration::from_millis(500),
            vote: Duration::from_secs(1),
            vote_delta: Duration::from_millis(500),
            commit: Duration::from_secs(1),
        }
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(0, 3000, 1000)]
    #[case(1, 3500, 1500)]
    #[case(4, 5000, 3000)]
    fn timeouts_grow_with_the_round(#[case] round: i32, #[case] propose_ms: u64, #[case] vote_ms: u64) {
        let config = Config::default();
        assert_eq!(config.propose(round), Duration::from_millis(propose_ms));
        assert_eq!(config.prevote(round), Duration::from_millis(vote_ms));
        assert_eq!(config.precommit(round), Duration::from_millis(vote_ms));
    }

    #[test]
    fn waiting_for_txs() {
        let config = Config::default();
        assert!(!config.wait_for_txs());
        assert!(config
            .clone()
            .with_create_empty_blocks(false, Duration::ZERO)
            .wait_for_txs());
        assert!(config
            .with_create_empty_blocks(true, Duration::from_secs(1))
            .wait_for_txs());
    }
}
