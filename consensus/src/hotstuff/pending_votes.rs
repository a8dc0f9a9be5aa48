/// Vote aggregation for a single round
/// 
/// Votes are grouped by the digest of their `VoteData`, so identical votes
/// from different authors grow one signature set. Timeout votes feed a
/// separate partial timeout certificate, and also the signature set of
/// the block they vote for unless their data is nil. Each author gets one vote per
/// round; a timeout vote may follow a regular vote for the same data.

use crate::crypto::{Hash, Signature};
use crate::hotstuff::quorum_cert::{QuorumCert, TimeoutCertificate};
use crate::hotstuff::types::{Author, Epoch, Round};
use crate::hotstuff::validator::{is_quorum, ValidatorVerifier, VerifyError};
use crate::hotstuff::vote::{Vote, VoteData};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PendingVotesError {
    #[error("Invalid signature: {0}")]
    InvalidSignature(#[from] VerifyError),
}

/// Two different votes signed by the same author in the same round
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EquivocationEvidence {
    pub author: Author,
    pub epoch: Epoch,
    pub round: Round,
    pub first: Vote,
    pub second: Vote,
}

/// Outcome of adding a vote
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum VoteAddedResult {
    /// Accepted; quorum not reached yet
    NotEnough { voting_power: u64 },
    /// The vote completed (or extended) a quorum for its vote data
    QcReady(QuorumCert),
    /// The vote completed (or extended) a quorum of timeouts
    TimeoutCertReady(TimeoutCertificate),
    /// Author is not in this epoch's validator set
    InvalidAuthor(Author),
    /// Exact repeat of an earlier vote
    DuplicateVote,
    /// Same author, same round, different vote data
    DuplicateButDifferent(Box<EquivocationEvidence>),
}

#[derive(Default)]
pub struct PendingVotes {
    /// First accepted vote per author (upgraded in place by a timeout vote)
    author_to_vote: HashMap<Author, Vote>,
    /// Signature sets per vote-data digest
    digest_to_votes: HashMap<Hash, (VoteData, BTreeMap<Author, Signature>)>,
    /// Timeout signatures collected for this round
    partial_tc: Option<TimeoutCertificate>,
}

impl PendingVotes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a vote, verifying it against `verifier` before any state change.
    pub fn add_vote(
        &mut self,
        vote: &Vote,
        verifier: &ValidatorVerifier,
    ) -> Result<VoteAddedResult, PendingVotesError> {
        let author = vote.author();
        if !verifier.contains(&author) {
            return Ok(VoteAddedResult::InvalidAuthor(author));
        }
        vote.verify(verifier)?;

        let digest = vote.vote_data().hash();
        if let Some(previous) = self.author_to_vote.get(&author) {
            if previous.vote_data().hash() != digest {
                return Ok(VoteAddedResult::DuplicateButDifferent(Box::new(
                    EquivocationEvidence {
                        author,
                        epoch: vote.epoch(),
                        round: vote.round(),
                        first: previous.clone(),
                        second: vote.clone(),
                    },
                )));
            }
            if !vote.is_timeout() || previous.is_timeout() {
                return Ok(VoteAddedResult::DuplicateVote);
            }
        }
        self.author_to_vote.insert(author, vote.clone());

        // A timeout vote that re-sends a real vote still counts toward that
        // block's QC; nil vote data never certifies anything.
        let qc_result = if vote.is_timeout() && vote.vote_data().is_nil() {
            None
        } else {
            Some(self.add_to_qc(digest, vote, verifier))
        };

        match vote.timeout_signature() {
            None => Ok(qc_result.unwrap_or(VoteAddedResult::NotEnough { voting_power: 0 })),
            Some(timeout_signature) => {
                if let Some(ready @ VoteAddedResult::QcReady(_)) = qc_result {
                    self.add_to_tc(vote, timeout_signature, verifier);
                    return Ok(ready);
                }
                Ok(self.add_to_tc(vote, timeout_signature, verifier))
            }
        }
    }

    fn add_to_qc(&mut self, digest: Hash, vote: &Vote, verifier: &ValidatorVerifier) -> VoteAddedResult {
        let (vote_data, signatures) = self
            .digest_to_votes
            .entry(digest)
            .or_insert_with(|| (vote.vote_data().clone(), BTreeMap::new()));
        signatures.insert(vote.author(), vote.signature().clone());

        let voting_power = Self::voting_power(verifier, signatures);
        if is_quorum(voting_power, verifier.total_voting_power()) {
            return VoteAddedResult::QcReady(QuorumCert::new(vote_data.clone(), signatures.clone()));
        }
        VoteAddedResult::NotEnough { voting_power }
    }

    fn add_to_tc(
        &mut self,
        vote: &Vote,
        timeout_signature: &Signature,
        verifier: &ValidatorVerifier,
    ) -> VoteAddedResult {
        let tc = self
            .partial_tc
            .get_or_insert_with(|| TimeoutCertificate::new(vote.timeout()));
        tc.add_signature(vote.author(), timeout_signature.clone());

        let voting_power = Self::voting_power(verifier, tc.signatures());
        if is_quorum(voting_power, verifier.total_voting_power()) {
            return VoteAddedResult::TimeoutCertReady(tc.clone());
        }
        VoteAddedResult::NotEnough { voting_power }
    }

    fn voting_power(verifier: &ValidatorVerifier, signatures: &BTreeMap<Author, Signature>) -> u64 {
        signatures
            .keys()
            .filter_map(|author| verifier.voting_power(author))
            .sum()
    }

    pub fn vote_count(&self) -> usize {
        self.author_to_vote.len()
    }

    /// Timeout signatures gathered so far, if any
    pub fn partial_timeout_certificate(&self) -> Option<&TimeoutCertificate> {
        self.partial_tc.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{BLSKeyPair, BlsSigner};
    use crate::hotstuff::test_utils::TestCommittee;
    use crate::hotstuff::types::BlockInfo;
    use proptest::prelude::*;

    #[test]
    fn test_qc_ready_exactly_at_quorum() {
        let committee = TestCommittee::new(4);
        let verifier = committee.epoch_state.verifier.clone();
        let b1 = committee.make_block(1, 1, committee.genesis().quorum_cert());
        let mut pending = PendingVotes::new();

        assert_eq!(
            pending.add_vote(&committee.make_vote(0, &b1), &verifier).unwrap(),
            VoteAddedResult::NotEnough { voting_power: 1 }
        );
        assert_eq!(
            pending.add_vote(&committee.make_vote(1, &b1), &verifier).unwrap(),
            VoteAddedResult::NotEnough { voting_power: 2 }
        );
        match pending.add_vote(&committee.make_vote(2, &b1), &verifier).unwrap() {
            VoteAddedResult::QcReady(qc) => {
                assert_eq!(qc.certified_block_id(), b1.id());
                assert_eq!(qc.signatures().len(), 3);
                assert!(qc.verify(&committee.epoch_state).is_ok());
            }
            other => panic!("expected QcReady, got {:?}", other),
        }
    }

    #[test]
    fn test_split_votes_do_not_merge() {
        let committee = TestCommittee::new(4);
        let verifier = committee.epoch_state.verifier.clone();
        let genesis_qc = committee.genesis().quorum_cert();
        let a = committee.make_block(1, 1, genesis_qc);
        let b = committee.make_block(2, 1, genesis_qc);
        let mut pending = PendingVotes::new();

        pending.add_vote(&committee.make_vote(0, &a), &verifier).unwrap();
        pending.add_vote(&committee.make_vote(1, &a), &verifier).unwrap();
        assert_eq!(
            pending.add_vote(&committee.make_vote(2, &b), &verifier).unwrap(),
            VoteAddedResult::NotEnough { voting_power: 1 }
        );
    }

    #[test]
    fn test_duplicate_vote() {
        let committee = TestCommittee::new(4);
        let verifier = committee.epoch_state.verifier.clone();
        let b1 = committee.make_block(1, 1, committee.genesis().quorum_cert());
        let vote = committee.make_vote(0, &b1);
        let mut pending = PendingVotes::new();

        pending.add_vote(&vote, &verifier).unwrap();
        assert_eq!(pending.add_vote(&vote, &verifier).unwrap(), VoteAddedResult::DuplicateVote);
        assert_eq!(pending.vote_count(), 1);
    }

    #[test]
    fn test_equivocation_reported_not_counted() {
        let committee = TestCommittee::new(4);
        let verifier = committee.epoch_state.verifier.clone();
        let genesis_qc = committee.genesis().quorum_cert();
        let a = committee.make_block(1, 1, genesis_qc);
        let b = committee.make_block(2, 1, genesis_qc);
        let mut pending = PendingVotes::new();

        let first = committee.make_vote(3, &a);
        let second = committee.make_vote(3, &b);
        pending.add_vote(&first, &verifier).unwrap();
        match pending.add_vote(&second, &verifier).unwrap() {
            VoteAddedResult::DuplicateButDifferent(evidence) => {
                assert_eq!(evidence.author, committee.author(3));
                assert_eq!(evidence.round, 1);
                assert_eq!(evidence.first, first);
                assert_eq!(evidence.second, second);
            }
            other => panic!("expected equivocation, got {:?}", other),
        }
        // The second vote never reached the aggregation for `b`
        pending.add_vote(&committee.make_vote(0, &b), &verifier).unwrap();
        assert_eq!(
            pending.add_vote(&committee.make_vote(1, &b), &verifier).unwrap(),
            VoteAddedResult::NotEnough { voting_power: 2 }
        );
    }

    #[test]
    fn test_invalid_author() {
        let committee = TestCommittee::new(4);
        let verifier = committee.epoch_state.verifier.clone();
        let b1 = committee.make_block(1, 1, committee.genesis().quorum_cert());
        let outsider = BlsSigner::new(BLSKeyPair::from_seed(100).unwrap());
        let vote = Vote::new(committee.vote_data(&b1), &outsider).unwrap();
        let mut pending = PendingVotes::new();

        assert_eq!(
            pending.add_vote(&vote, &verifier).unwrap(),
            VoteAddedResult::InvalidAuthor(vote.author())
        );
        assert_eq!(pending.vote_count(), 0);
    }

    #[test]
    fn test_invalid_signature_rejected_without_mutation() {
        let committee = TestCommittee::new(4);
        let verifier = committee.epoch_state.verifier.clone();
        let b1 = committee.make_block(1, 1, committee.genesis().quorum_cert());
        let honest = committee.make_vote(0, &b1);
        let forged = Vote::new_with_signature(
            committee.vote_data(&b1),
            committee.author(1),
            honest.signature().clone(),
        );
        let mut pending = PendingVotes::new();

        assert!(matches!(
            pending.add_vote(&forged, &verifier),
            Err(PendingVotesError::InvalidSignature(_))
        ));
        assert_eq!(pending.vote_count(), 0);
    }

    #[test]
    fn test_timeout_votes_form_tc_not_qc() {
        let committee = TestCommittee::new(4);
        let verifier = committee.epoch_state.verifier.clone();
        let genesis = committee.block_info(committee.genesis());
        let nil = VoteData::new(BlockInfo::nil(2, &genesis), genesis);
        let mut pending = PendingVotes::new();

        for i in 0..2 {
            let result = pending
                .add_vote(&committee.make_timeout_vote(i, nil.clone()), &verifier)
                .unwrap();
            assert_eq!(result, VoteAddedResult::NotEnough { voting_power: i as u64 + 1 });
        }
        match pending
            .add_vote(&committee.make_timeout_vote(2, nil), &verifier)
            .unwrap()
        {
            VoteAddedResult::TimeoutCertReady(tc) => {
                assert_eq!(tc.round(), 2);
                assert!(tc.verify(&committee.epoch_state).is_ok());
            }
            other => panic!("expected TimeoutCertReady, got {:?}", other),
        }
    }

    #[test]
    fn test_timeout_upgrade_of_regular_vote() {
        let committee = TestCommittee::new(4);
        let verifier = committee.epoch_state.verifier.clone();
        let b1 = committee.make_block(1, 1, committee.genesis().quorum_cert());
        let mut pending = PendingVotes::new();

        pending.add_vote(&committee.make_vote(0, &b1), &verifier).unwrap();
        let upgraded = committee.make_timeout_vote(0, committee.vote_data(&b1));
        assert_eq!(
            pending.add_vote(&upgraded, &verifier).unwrap(),
            VoteAddedResult::NotEnough { voting_power: 1 }
        );
        assert!(pending.partial_timeout_certificate().is_some());
        // A repeated timeout vote is a plain duplicate
        assert_eq!(
            pending.add_vote(&upgraded, &verifier).unwrap(),
            VoteAddedResult::DuplicateVote
        );
    }

    #[test]
    fn test_timeout_votes_for_real_block_also_form_qc() {
        let committee = TestCommittee::new(4);
        let verifier = committee.epoch_state.verifier.clone();
        let b1 = committee.make_block(1, 1, committee.genesis().quorum_cert());
        let mut pending = PendingVotes::new();

        pending.add_vote(&committee.make_vote(0, &b1), &verifier).unwrap();
        pending
            .add_vote(&committee.make_timeout_vote(1, committee.vote_data(&b1)), &verifier)
            .unwrap();
        match pending
            .add_vote(&committee.make_timeout_vote(2, committee.vote_data(&b1)), &verifier)
            .unwrap()
        {
            VoteAddedResult::QcReady(qc) => assert_eq!(qc.certified_block_id(), b1.id()),
            other => panic!("expected QcReady, got {:?}", other),
        }
        // Both timeout signatures were still collected
        assert_eq!(pending.partial_timeout_certificate().unwrap().signatures().len(), 2);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]

        #[test]
        fn qc_ready_only_at_threshold(
            n in testutil::committee_size_strategy(2),
            order in Just((0..10usize).collect::<Vec<_>>()).prop_shuffle(),
        ) {
            let f = (n - 1) / 3;
            let committee = TestCommittee::new(n);
            let verifier = committee.epoch_state.verifier.clone();
            let block = committee.make_block(0, 1, committee.genesis().quorum_cert());
            let mut pending = PendingVotes::new();
            let voters: Vec<usize> = order.into_iter().filter(|&i| i < n).collect();

            for (count, &voter) in voters.iter().enumerate() {
                let result = pending.add_vote(&committee.make_vote(voter, &block), &verifier).unwrap();
                let ready = matches!(result, VoteAddedResult::QcReady(_));
                prop_assert_eq!(ready, count + 1 >= 2 * f + 1);
            }
        }
    }
}
