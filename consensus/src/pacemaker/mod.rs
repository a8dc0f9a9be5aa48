// Pacemaker: round progression and timeouts
//
// Rounds advance on certificates (QC or TC), whether formed locally or
// learned through SyncInfo. Each round gets a deadline; the timeout grows
// exponentially with the number of consecutive rounds that ended without a
// QC, and drops back to the base once a QC or a commit arrives.

pub mod proposer_election;

use crate::config::ConsensusConfig;
use crate::hotstuff::types::{Author, Round};
use crate::sync::SyncInfo;
use std::fmt;
use std::time::{Duration, Instant};
use tracing::{debug, info};

pub use proposer_election::{
    create_proposer_election, ProposerElection, RotatingProposer, WeightedProposer,
};

/// Why a new round started
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NewRoundReason {
    QcReady,
    Timeout,
}

/// Emitted whenever the pacemaker enters a higher round
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NewRoundEvent {
    pub round: Round,
    pub reason: NewRoundReason,
    pub timeout: Duration,
}

impl fmt::Display for NewRoundEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "NewRoundEvent[round: {}, reason: {:?}, timeout: {:?}]",
            self.round, self.reason, self.timeout
        )
    }
}

/// Emitted when the current round's deadline passes
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TimeoutEvent {
    pub round: Round,
    /// Time until the timeout fires again if the round still does not end
    pub next_timeout: Duration,
}

/// Exponential backoff over QC-less rounds
///
/// Formula: min(base * 2^min(index, max_exponent), max), where index is
/// the number of rounds since the highest certified (or committed) round
/// that ended on a timeout rather than a QC.
#[derive(Clone, Debug)]
pub struct ExponentialTimeInterval {
    base: Duration,
    max: Duration,
    max_exponent: u32,
}

impl ExponentialTimeInterval {
    pub fn new(base: Duration, max: Duration, max_exponent: u32) -> Self {
        Self {
            base,
            max,
            max_exponent,
        }
    }

    pub fn from_config(config: &ConsensusConfig) -> Self {
        Self::new(
            config.round_initial_timeout(),
            config.max_round_timeout(),
            config.max_timeout_exponent,
        )
    }

    pub fn get_round_duration(&self, round_index: u64) -> Duration {
        let exponent = round_index.min(u64::from(self.max_exponent)).min(31) as u32;
        let multiplier = 2u32.saturating_pow(exponent);
        self.base.saturating_mul(multiplier).min(self.max)
    }
}

/// Pacemaker ensures liveness by managing round progression and leader election
pub struct Pacemaker {
    /// Current round; non-decreasing over the epoch
    current_round: Round,

    highest_committed_round: Round,

    /// Highest round known to have produced a QC
    highest_certified_round: Round,

    /// When the current round times out
    round_deadline: Option<Instant>,

    time_interval: ExponentialTimeInterval,

    proposer_election: Box<dyn ProposerElection>,
}

impl Pacemaker {
    /// Create a pacemaker that has not yet entered any round
    ///
    /// # Arguments
    /// * `time_interval` - Timeout schedule
    /// * `proposer_election` - Leader election for the epoch
    /// * `highest_committed_round` - Round of the last committed block
    pub fn new(
        time_interval: ExponentialTimeInterval,
        proposer_election: Box<dyn ProposerElection>,
        highest_committed_round: Round,
    ) -> Self {
        Self {
            current_round: 0,
            highest_committed_round,
            highest_certified_round: highest_committed_round,
            round_deadline: None,
            time_interval,
            proposer_election,
        }
    }

    pub fn current_round(&self) -> Round {
        self.current_round
    }

    pub fn highest_committed_round(&self) -> Round {
        self.highest_committed_round
    }

    pub fn highest_certified_round(&self) -> Round {
        self.highest_certified_round
    }

    pub fn round_deadline(&self) -> Option<Instant> {
        self.round_deadline
    }

    pub fn current_leader(&self) -> Author {
        self.proposer_election.get_valid_proposer(self.current_round)
    }

    pub fn valid_proposer(&self, round: Round) -> Author {
        self.proposer_election.get_valid_proposer(round)
    }

    pub fn is_valid_proposer(&self, author: Author, round: Round) -> bool {
        self.proposer_election.is_valid_proposer(author, round)
    }

    /// Timeout for `round`: rounds `last + 1 .. round` all ended on a TC,
    /// where `last` is the highest certified or committed round.
    pub fn round_timeout(&self, round: Round) -> Duration {
        let last = self.highest_certified_round.max(self.highest_committed_round);
        let round_index = round.saturating_sub(last.saturating_add(1));
        self.time_interval.get_round_duration(round_index)
    }

    fn enter_round(&mut self, round: Round, reason: NewRoundReason) -> NewRoundEvent {
        self.current_round = round;
        let timeout = self.round_timeout(round);
        self.round_deadline = Some(Instant::now() + timeout);
        info!("Entering round {} ({:?}), timeout {:?}", round, reason, timeout);
        NewRoundEvent {
            round,
            reason,
            timeout,
        }
    }

    /// Move to `round` if it is above the current round
    pub fn start_round(&mut self, round: Round) -> Option<NewRoundEvent> {
        if round <= self.current_round {
            return None;
        }
        Some(self.enter_round(round, NewRoundReason::QcReady))
    }

    /// Advance past the certificates in `sync_info`: the new round is one
    /// above the highest QC or TC round, if that is above the current one.
    pub fn process_certificates(&mut self, sync_info: &SyncInfo) -> Option<NewRoundEvent> {
        let qc_round = sync_info.highest_certified_round();
        let tc_round = sync_info.highest_timeout_round();
        if qc_round > self.highest_certified_round {
            self.highest_certified_round = qc_round;
        }
        let new_round = qc_round.max(tc_round) + 1;
        if new_round <= self.current_round {
            return None;
        }
        let reason = if tc_round > qc_round {
            NewRoundReason::Timeout
        } else {
            NewRoundReason::QcReady
        };
        Some(self.enter_round(new_round, reason))
    }

    /// Record a commit, which resets the backoff for later rounds
    pub fn update_highest_committed_round(&mut self, round: Round) {
        if round > self.highest_committed_round {
            self.highest_committed_round = round;
        }
    }

    /// Called when the deadline for `round` passes. Stale rounds are
    /// ignored. For the current round the deadline is re-armed so the
    /// timeout is sent again until the round ends.
    pub fn process_local_timeout(&mut self, round: Round) -> Option<TimeoutEvent> {
        if round != self.current_round {
            debug!(
                "Ignoring local timeout for round {}, current round {}",
                round, self.current_round
            );
            return None;
        }
        let next_timeout = self.round_timeout(round);
        self.round_deadline = Some(Instant::now() + next_timeout);
        info!("Local timeout in round {}", round);
        Some(TimeoutEvent {
            round,
            next_timeout,
        })
    }
}
