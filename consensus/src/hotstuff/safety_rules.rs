/// Local voting rules
/// 
/// Everything that decides whether this validator may sign lives here,
/// together with the data that must survive a restart. `SafetyData` is
/// written to storage before any signature leaves this module.

use crate::crypto::{BLSError, Signature, ValidatorSigner};
use crate::hotstuff::block::Block;
use crate::hotstuff::executed_block::ExecutedBlock;
use crate::hotstuff::quorum_cert::QuorumCert;
use crate::hotstuff::types::{Author, Epoch, Payload, Round};
use crate::hotstuff::vote::{Timeout, Vote, VoteData};
use crate::storage::{PersistentLivenessStorage, StorageError};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum SafetyError {
    #[error("Incorrect epoch: expected {expected}, got {got}")]
    IncorrectEpoch { expected: Epoch, got: Epoch },

    #[error("Round {round} is not above last voted round {last_voted_round}")]
    IncorrectLastVotedRound { round: Round, last_voted_round: Round },

    #[error("Parent QC round {qc_round} is below preferred round {preferred_round}")]
    IncorrectPreferredRound { qc_round: Round, preferred_round: Round },

    #[error("Proposal round {round} does not extend QC round {qc_round}")]
    InvalidProposalRound { round: Round, qc_round: Round },

    #[error("Signing failed: {0}")]
    SigningFailed(#[from] BLSError),

    #[error("Could not persist safety data: {0}")]
    Persistence(#[from] StorageError),
}

impl SafetyError {
    /// Failures of local resources rather than of the input
    pub fn is_local(&self) -> bool {
        matches!(self, SafetyError::SigningFailed(_) | SafetyError::Persistence(_))
    }
}

pub type Result<T> = std::result::Result<T, SafetyError>;

/// State the voting rules depend on
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SafetyData {
    pub epoch: Epoch,
    /// Highest round this node signed a vote or timeout for
    pub last_voted_round: Round,
    /// Highest two-chain head seen in a voted proposal; proposals must
    /// extend a QC at least this high
    pub preferred_round: Round,
    /// Most recent vote, replayed if the same proposal is seen again
    pub last_vote: Option<Vote>,
}

impl SafetyData {
    pub fn new(epoch: Epoch) -> Self {
        Self {
            epoch,
            last_voted_round: 0,
            preferred_round: 0,
            last_vote: None,
        }
    }
}

pub struct SafetyRules {
    signer: Arc<dyn ValidatorSigner>,
    storage: Arc<dyn PersistentLivenessStorage>,
    data: SafetyData,
}

impl SafetyRules {
    pub fn new(
        signer: Arc<dyn ValidatorSigner>,
        storage: Arc<dyn PersistentLivenessStorage>,
        data: SafetyData,
    ) -> Self {
        Self {
            signer,
            storage,
            data,
        }
    }

    pub fn author(&self) -> Author {
        self.signer.author()
    }

    pub fn safety_data(&self) -> &SafetyData {
        &self.data
    }

    fn ensure_epoch(&self, epoch: Epoch) -> Result<()> {
        if epoch != self.data.epoch {
            return Err(SafetyError::IncorrectEpoch {
                expected: self.data.epoch,
                got: epoch,
            });
        }
        Ok(())
    }

    fn persist(&mut self, data: SafetyData) -> Result<()> {
        self.storage.save_safety_data(&data)?;
        self.data = data;
        Ok(())
    }

    /// Build and sign a proposal for `round` extending `parent_qc`
    pub fn sign_proposal(
        &self,
        payload: Payload,
        round: Round,
        timestamp_usecs: u64,
        parent_qc: QuorumCert,
    ) -> Result<Block> {
        self.ensure_epoch(parent_qc.epoch())?;
        if round <= self.data.last_voted_round {
            return Err(SafetyError::IncorrectLastVotedRound {
                round,
                last_voted_round: self.data.last_voted_round,
            });
        }
        if round <= parent_qc.round() {
            return Err(SafetyError::InvalidProposalRound {
                round,
                qc_round: parent_qc.round(),
            });
        }
        Ok(Block::new_proposal(
            payload,
            round,
            timestamp_usecs,
            parent_qc,
            self.signer.as_ref(),
        )?)
    }

    /// Vote for `proposal` if the voting rules allow it.
    ///
    /// The proposal must already be validated and executed; the vote
    /// signs its executed state. Asking again for the same proposal returns
    /// the recorded vote.
    pub fn construct_and_sign_vote(&mut self, proposal: &ExecutedBlock) -> Result<Vote> {
        self.ensure_epoch(proposal.epoch())?;

        if let Some(vote) = &self.data.last_vote {
            if vote.round() == proposal.round() && vote.vote_data().proposed().id == proposal.id() {
                debug!("Replaying vote for round {}", proposal.round());
                return Ok(vote.clone());
            }
        }
        if proposal.round() <= self.data.last_voted_round {
            return Err(SafetyError::IncorrectLastVotedRound {
                round: proposal.round(),
                last_voted_round: self.data.last_voted_round,
            });
        }
        let qc = proposal.quorum_cert();
        if qc.round() < self.data.preferred_round {
            return Err(SafetyError::IncorrectPreferredRound {
                qc_round: qc.round(),
                preferred_round: self.data.preferred_round,
            });
        }

        let vote = Vote::new(proposal.vote_data(), self.signer.as_ref())?;
        let data = SafetyData {
            epoch: self.data.epoch,
            last_voted_round: proposal.round(),
            preferred_round: self.data.preferred_round.max(qc.parent_block().round),
            last_vote: Some(vote.clone()),
        };
        self.persist(data)?;
        Ok(vote)
    }

    /// Sign `timeout`, raising the last voted round to it so no proposal
    /// of that round can be voted for afterwards.
    pub fn sign_timeout(&mut self, timeout: &Timeout) -> Result<Signature> {
        self.ensure_epoch(timeout.epoch)?;
        if timeout.round < self.data.last_voted_round {
            return Err(SafetyError::IncorrectLastVotedRound {
                round: timeout.round,
                last_voted_round: self.data.last_voted_round,
            });
        }
        let signature = self.signer.sign(&timeout.hash())?;
        if timeout.round > self.data.last_voted_round {
            let mut data = self.data.clone();
            data.last_voted_round = timeout.round;
            self.persist(data)?;
        }
        Ok(signature)
    }

    /// Timeout vote for `round`.
    ///
    /// Reuses this round's vote when there is one; otherwise signs
    /// `fallback` (nil vote data extending the highest QC).
    pub fn sign_timeout_vote(&mut self, round: Round, fallback: VoteData) -> Result<Vote> {
        let previous = self
            .data
            .last_vote
            .as_ref()
            .filter(|vote| vote.round() == round)
            .cloned();

        let mut vote = match previous {
            Some(vote) if vote.is_timeout() => return Ok(vote),
            Some(vote) => vote,
            None => {
                self.ensure_epoch(fallback.proposed().epoch)?;
                if round <= self.data.last_voted_round {
                    return Err(SafetyError::IncorrectLastVotedRound {
                        round,
                        last_voted_round: self.data.last_voted_round,
                    });
                }
                Vote::new(fallback, self.signer.as_ref())?
            }
        };

        let timeout = vote.timeout();
        let signature = self.sign_timeout(&timeout)?;
        vote.add_timeout_signature(signature);

        let mut data = self.data.clone();
        data.last_vote = Some(vote.clone());
        self.persist(data)?;
        Ok(vote)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hotstuff::test_utils::TestCommittee;
    use crate::hotstuff::types::BlockInfo;
    use crate::storage::MemoryStorage;

    fn safety_rules(committee: &TestCommittee, index: usize) -> (SafetyRules, Arc<MemoryStorage>) {
        let storage = Arc::new(MemoryStorage::new());
        let rules = SafetyRules::new(committee.signer(index), storage.clone(), SafetyData::new(1));
        (rules, storage)
    }

    #[test]
    fn test_vote_once_per_round() {
        let committee = TestCommittee::new(4);
        let (mut rules, _) = safety_rules(&committee, 0);
        let genesis_qc = committee.genesis().quorum_cert();
        let a = committee.make_block(1, 1, genesis_qc);
        let b = committee.make_block(2, 1, genesis_qc);

        let vote = rules.construct_and_sign_vote(&committee.execute(&a)).unwrap();
        assert_eq!(vote.vote_data(), &committee.vote_data(&a));
        // Same proposal again: same vote
        assert_eq!(rules.construct_and_sign_vote(&committee.execute(&a)).unwrap(), vote);
        // Conflicting proposal in the same round: refused
        assert!(matches!(
            rules.construct_and_sign_vote(&committee.execute(&b)),
            Err(SafetyError::IncorrectLastVotedRound { round: 1, last_voted_round: 1 })
        ));
    }

    #[test]
    fn test_safety_data_persisted_before_vote_returned() {
        let committee = TestCommittee::new(4);
        let (mut rules, storage) = safety_rules(&committee, 0);
        let b1 = committee.make_block(1, 1, committee.genesis().quorum_cert());

        let vote = rules.construct_and_sign_vote(&committee.execute(&b1)).unwrap();
        let persisted = storage.safety_data().unwrap();
        assert_eq!(persisted.last_voted_round, 1);
        assert_eq!(persisted.last_vote, Some(vote));
    }

    #[test]
    fn test_storage_failure_blocks_vote() {
        let committee = TestCommittee::new(4);
        let (mut rules, storage) = safety_rules(&committee, 0);
        storage.set_fail_writes(true);
        let b1 = committee.make_block(1, 1, committee.genesis().quorum_cert());

        let err = rules.construct_and_sign_vote(&committee.execute(&b1)).unwrap_err();
        assert!(err.is_local());
        assert_eq!(rules.safety_data().last_voted_round, 0);
    }

    #[test]
    fn test_preferred_round_lock() {
        let committee = TestCommittee::new(4);
        let (mut rules, _) = safety_rules(&committee, 0);
        let (blocks, qcs) = committee.certified_chain(3);

        // Voting for B3 (parent QC2, whose parent is round 1) locks round 1
        for block in &blocks {
            rules.construct_and_sign_vote(&committee.execute(block)).unwrap();
        }
        assert_eq!(rules.safety_data().preferred_round, 1);

        // A fork at round 4 extending only the genesis QC is refused
        let fork = committee.make_block(3, 4, committee.genesis().quorum_cert());
        assert!(matches!(
            rules.construct_and_sign_vote(&committee.execute(&fork)),
            Err(SafetyError::IncorrectPreferredRound { qc_round: 0, preferred_round: 1 })
        ));
        // Extending QC1 is still allowed
        let ok = committee.make_block(3, 4, &qcs[0]);
        assert!(rules.construct_and_sign_vote(&committee.execute(&ok)).is_ok());
    }

    #[test]
    fn test_timeout_blocks_later_vote_in_same_round() {
        let committee = TestCommittee::new(4);
        let (mut rules, _) = safety_rules(&committee, 0);
        let genesis = committee.block_info(committee.genesis());
        let nil = VoteData::new(BlockInfo::nil(1, &genesis), genesis);

        let timeout_vote = rules.sign_timeout_vote(1, nil).unwrap();
        assert!(timeout_vote.is_timeout());
        assert_eq!(rules.safety_data().last_voted_round, 1);

        let b1 = committee.make_block(1, 1, committee.genesis().quorum_cert());
        assert!(rules.construct_and_sign_vote(&committee.execute(&b1)).is_err());
    }

    #[test]
    fn test_timeout_vote_upgrades_existing_vote() {
        let committee = TestCommittee::new(4);
        let (mut rules, _) = safety_rules(&committee, 0);
        let b1 = committee.make_block(1, 1, committee.genesis().quorum_cert());
        let vote = rules.construct_and_sign_vote(&committee.execute(&b1)).unwrap();

        let genesis = committee.block_info(committee.genesis());
        let nil = VoteData::new(BlockInfo::nil(1, &genesis), genesis);
        let timeout_vote = rules.sign_timeout_vote(1, nil.clone()).unwrap();
        assert_eq!(timeout_vote.vote_data(), vote.vote_data());
        assert!(timeout_vote.is_timeout());
        assert!(timeout_vote.verify(&committee.epoch_state.verifier).is_ok());

        // Re-asking returns the same timeout vote
        assert_eq!(rules.sign_timeout_vote(1, nil).unwrap(), timeout_vote);
    }

    #[test]
    fn test_sign_proposal_checks_rounds() {
        let committee = TestCommittee::new(4);
        let (mut rules, _) = safety_rules(&committee, 1);
        let genesis_qc = committee.genesis().quorum_cert().clone();

        let proposal = rules.sign_proposal(vec![], 1, 1_000, genesis_qc.clone()).unwrap();
        assert_eq!(proposal.author(), Some(committee.author(1)));
        rules.construct_and_sign_vote(&committee.execute(&proposal)).unwrap();
        assert!(matches!(
            rules.sign_proposal(vec![], 1, 2_000, genesis_qc),
            Err(SafetyError::IncorrectLastVotedRound { .. })
        ));
    }

    #[test]
    fn test_wrong_epoch_rejected() {
        let committee = TestCommittee::with_epoch(4, 2);
        let (mut rules, _) = safety_rules(&committee, 0);
        let b1 = committee.make_block(1, 1, committee.genesis().quorum_cert());
        assert!(matches!(
            rules.construct_and_sign_vote(&committee.execute(&b1)),
            Err(SafetyError::IncorrectEpoch { expected: 1, got: 2 })
        ));
    }
}
