/// Proposal assembly for the round leader

use crate::hotstuff::block::Block;
use crate::hotstuff::quorum_cert::QuorumCert;
use crate::hotstuff::safety_rules::{SafetyError, SafetyRules};
use crate::hotstuff::types::{now_usecs, Round};
use crate::ledger::PayloadClient;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum ProposalError {
    #[error("Already proposed in round {round} (last generated {last_round_generated})")]
    AlreadyGenerated { round: Round, last_round_generated: Round },

    #[error("Round {round} does not extend highest QC round {qc_round}")]
    StaleRound { round: Round, qc_round: Round },

    #[error(transparent)]
    Safety(#[from] SafetyError),
}

pub struct ProposalGenerator {
    payload_client: Arc<dyn PayloadClient>,
    max_block_txns: usize,
    /// At most one proposal per round
    last_round_generated: Round,
}

impl ProposalGenerator {
    pub fn new(payload_client: Arc<dyn PayloadClient>, max_block_txns: usize) -> Self {
        Self {
            payload_client,
            max_block_txns,
            last_round_generated: 0,
        }
    }

    pub fn last_round_generated(&self) -> Round {
        self.last_round_generated
    }

    /// Build and sign the block for `round`, extending `highest_qc`.
    ///
    /// Takes whatever payload is ready; an empty block is proposed rather
    /// than waiting. The timestamp never goes below the parent's.
    pub fn generate_proposal(
        &mut self,
        round: Round,
        highest_qc: &QuorumCert,
        safety_rules: &SafetyRules,
    ) -> Result<Block, ProposalError> {
        if round <= self.last_round_generated {
            return Err(ProposalError::AlreadyGenerated {
                round,
                last_round_generated: self.last_round_generated,
            });
        }
        if round <= highest_qc.round() {
            return Err(ProposalError::StaleRound {
                round,
                qc_round: highest_qc.round(),
            });
        }

        let payload = self.payload_client.pull_payload(self.max_block_txns);
        let parent_timestamp = highest_qc.certified_block().timestamp_usecs;
        let timestamp_usecs = now_usecs().max(parent_timestamp.saturating_add(1));
        debug!(
            "Generating proposal for round {} with {} txns on {}",
            round,
            payload.len(),
            highest_qc.certified_block()
        );

        let block = safety_rules.sign_proposal(payload, round, timestamp_usecs, highest_qc.clone())?;
        self.last_round_generated = round;
        Ok(block)
    }
}
