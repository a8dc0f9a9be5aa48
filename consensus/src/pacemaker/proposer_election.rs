// Leader election
//
// Leaders are a pure function of the round and the epoch's validator set,
// so every honest node agrees on them without talking.

use crate::config::ProposerElectionConfig;
use crate::hotstuff::types::{Author, Round};
use crate::hotstuff::validator::ValidatorSet;

pub trait ProposerElection: Send + Sync {
    /// The only author allowed to propose in `round`
    fn get_valid_proposer(&self, round: Round) -> Author;

    fn is_valid_proposer(&self, author: Author, round: Round) -> bool {
        self.get_valid_proposer(round) == author
    }
}

/// Round-robin over the validator list, `contiguous_rounds` rounds each
pub struct RotatingProposer {
    proposers: Vec<Author>,
    contiguous_rounds: u64,
}

impl RotatingProposer {
    pub fn new(proposers: Vec<Author>, contiguous_rounds: u64) -> Self {
        Self {
            proposers,
            contiguous_rounds: contiguous_rounds.max(1),
        }
    }
}

impl ProposerElection for RotatingProposer {
    fn get_valid_proposer(&self, round: Round) -> Author {
        let index = (round / self.contiguous_rounds) % self.proposers.len() as u64;
        self.proposers[index as usize]
    }
}

/// Round-robin where each validator holds a number of slots proportional
/// to its voting power. Weights are reduced by their gcd first, so equal
/// weights rotate exactly like `RotatingProposer`.
pub struct WeightedProposer {
    proposers: Vec<(Author, u64)>,
    cycle: u64,
}

fn gcd(a: u64, b: u64) -> u64 {
    if b == 0 {
        a
    } else {
        gcd(b, a % b)
    }
}

impl WeightedProposer {
    pub fn new(set: &ValidatorSet) -> Self {
        let divisor = set
            .validators()
            .iter()
            .fold(0, |acc, v| gcd(acc, v.voting_power))
            .max(1);
        let proposers: Vec<(Author, u64)> = set
            .validators()
            .iter()
            .map(|v| (v.author, v.voting_power / divisor))
            .collect();
        let cycle = proposers.iter().map(|(_, slots)| slots).sum();
        Self { proposers, cycle }
    }
}

impl ProposerElection for WeightedProposer {
    fn get_valid_proposer(&self, round: Round) -> Author {
        let mut slot = round % self.cycle;
        for (author, slots) in &self.proposers {
            if slot < *slots {
                return *author;
            }
            slot -= slots;
        }
        // Slots sum to `cycle`, so the loop always returns
        self.proposers[0].0
    }
}

/// Build the election scheme `config` names for `set`
pub fn create_proposer_election(
    config: &ProposerElectionConfig,
    set: &ValidatorSet,
) -> Box<dyn ProposerElection> {
    match config {
        ProposerElectionConfig::RoundRobin { contiguous_rounds } => {
            Box::new(RotatingProposer::new(set.authors(), *contiguous_rounds))
        }
        ProposerElectionConfig::WeightedRoundRobin => Box::new(WeightedProposer::new(set)),
    }
}
