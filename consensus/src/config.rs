/// Consensus engine parameters

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Round timeout must be non-zero")]
    ZeroRoundTimeout,

    #[error("Max round timeout {max_ms}ms is below the initial timeout {initial_ms}ms")]
    MaxTimeoutBelowInitial { initial_ms: u64, max_ms: u64 },

    #[error("Contiguous rounds per leader must be non-zero")]
    ZeroContiguousRounds,

    #[error("Blocks per retrieval must be non-zero")]
    ZeroRetrievalBatch,
}

/// How the leader of a round is chosen
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProposerElectionConfig {
    /// Validators lead in list order, each for `contiguous_rounds` rounds
    RoundRobin { contiguous_rounds: u64 },
    /// Validators lead in proportion to their voting power
    WeightedRoundRobin,
}

impl Default for ProposerElectionConfig {
    fn default() -> Self {
        ProposerElectionConfig::RoundRobin { contiguous_rounds: 1 }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsensusConfig {
    /// Base round timeout, before backoff
    pub round_initial_timeout_ms: u64,
    pub max_round_timeout_ms: u64,
    /// Backoff stops doubling after this many uncommitted rounds
    pub max_timeout_exponent: u32,
    pub max_block_txns: usize,
    /// Also broadcast votes, not just send them to the next leader
    pub gossip_votes: bool,
    pub proposer_election: ProposerElectionConfig,
    pub max_blocks_per_retrieval: u64,
    /// How long a block retrieval may stay unanswered before it is retried
    pub block_retrieval_timeout_ms: u64,
    /// Proposals stamped further than this ahead of the local clock are rejected
    pub max_clock_skew_ms: u64,
    /// Messages from a later epoch held until this node reconfigures
    pub max_future_epoch_messages: usize,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            round_initial_timeout_ms: 1_000,
            max_round_timeout_ms: 60_000,
            max_timeout_exponent: 6,
            max_block_txns: 10_000,
            gossip_votes: false,
            proposer_election: ProposerElectionConfig::default(),
            max_blocks_per_retrieval: 100,
            block_retrieval_timeout_ms: 5_000,
            max_clock_skew_ms: 10_000,
            max_future_epoch_messages: 64,
        }
    }
}

impl ConsensusConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.round_initial_timeout_ms == 0 {
            return Err(ConfigError::ZeroRoundTimeout);
        }
        if self.max_round_timeout_ms < self.round_initial_timeout_ms {
            return Err(ConfigError::MaxTimeoutBelowInitial {
                initial_ms: self.round_initial_timeout_ms,
                max_ms: self.max_round_timeout_ms,
            });
        }
        if let ProposerElectionConfig::RoundRobin { contiguous_rounds: 0 } = self.proposer_election {
            return Err(ConfigError::ZeroContiguousRounds);
        }
        if self.max_blocks_per_retrieval == 0 {
            return Err(ConfigError::ZeroRetrievalBatch);
        }
        Ok(())
    }

    pub fn round_initial_timeout(&self) -> Duration {
        Duration::from_millis(self.round_initial_timeout_ms)
    }

    pub fn max_round_timeout(&self) -> Duration {
        Duration::from_millis(self.max_round_timeout_ms)
    }

    pub fn block_retrieval_timeout(&self) -> Duration {
        Duration::from_millis(self.block_retrieval_timeout_ms)
    }

    /// Parameters as JSON, for status reporting
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "round_initial_timeout_ms": self.round_initial_timeout_ms,
            "max_round_timeout_ms": self.max_round_timeout_ms,
            "max_timeout_exponent": self.max_timeout_exponent,
            "max_block_txns": self.max_block_txns,
            "gossip_votes": self.gossip_votes,
            "proposer_election": self.proposer_election,
            "max_blocks_per_retrieval": self.max_blocks_per_retrieval,
            "block_retrieval_timeout_ms": self.block_retrieval_timeout_ms,
            "max_clock_skew_ms": self.max_clock_skew_ms,
            "max_future_epoch_messages": self.max_future_epoch_messages,
        })
    }
}
