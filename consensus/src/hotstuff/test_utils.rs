// Fixtures shared by unit and integration tests in this crate.

use crate::crypto::{BLSKeyPair, BlsSigner, Signature, ValidatorSigner};
use crate::hotstuff::block::Block;
use crate::hotstuff::executed_block::ExecutedBlock;
use crate::hotstuff::quorum_cert::{QuorumCert, TimeoutCertificate};
use crate::hotstuff::types::{Author, BlockInfo, Epoch, Payload, Round};
use crate::hotstuff::validator::{EpochState, ValidatorSet};
use crate::hotstuff::vote::{Timeout, Vote, VoteData};
use crate::ledger::{InMemoryLedger, StateComputeResult};
use std::collections::BTreeMap;
use std::sync::Arc;

/// A committee of deterministic BLS signers. Validator `i` is seeded with
/// `i`, and the validator set lists them in index order.
pub struct TestCommittee {
    pub signers: Vec<Arc<BlsSigner>>,
    pub epoch_state: EpochState,
    genesis: Block,
}

impl TestCommittee {
    pub fn new(size: usize) -> Self {
        Self::with_epoch(size, 1)
    }

    pub fn with_epoch(size: usize, epoch: Epoch) -> Self {
        let signers: Vec<_> = (0..size as u64)
            .map(|i| Arc::new(BlsSigner::new(BLSKeyPair::from_seed(i).unwrap())))
            .collect();
        let set = ValidatorSet::from_public_keys(
            signers.iter().map(|s| s.keypair().public_key.clone()).collect(),
        )
        .unwrap();
        Self {
            signers,
            epoch_state: EpochState::new(epoch, set),
            genesis: Block::make_genesis_block(epoch, None),
        }
    }

    pub fn genesis(&self) -> &Block {
        &self.genesis
    }

    pub fn validator_set(&self) -> ValidatorSet {
        self.epoch_state.verifier.validator_set().clone()
    }

    pub fn author(&self, index: usize) -> Author {
        self.signers[index].author()
    }

    pub fn signer(&self, index: usize) -> Arc<BlsSigner> {
        self.signers[index].clone()
    }

    pub fn make_block(&self, proposer: usize, round: Round, parent_qc: &QuorumCert) -> Block {
        self.make_block_with_payload(proposer, round, parent_qc, vec![round.to_le_bytes().to_vec()])
    }

    pub fn make_block_with_payload(
        &self,
        proposer: usize,
        round: Round,
        parent_qc: &QuorumCert,
        payload: Payload,
    ) -> Block {
        let timestamp = parent_qc.certified_block().timestamp_usecs + 1_000;
        Block::new_proposal(payload, round, timestamp, parent_qc.clone(), &*self.signers[proposer])
            .unwrap()
    }

    /// Execute `block` the way an `InMemoryLedger` node does, on top of the
    /// state its parent certificate agreed on
    pub fn execute(&self, block: &Block) -> ExecutedBlock {
        if block.is_genesis() {
            return ExecutedBlock::from_certified_root(block.clone(), block.quorum_cert());
        }
        let parent_state = block.quorum_cert().certified_block().executed_state_id;
        let executed = InMemoryLedger::apply_payload(parent_state, block.payload());
        ExecutedBlock::new(block.clone(), StateComputeResult::new(parent_state, executed))
    }

    pub fn block_info(&self, block: &Block) -> BlockInfo {
        self.execute(block).block_info()
    }

    pub fn vote_data(&self, block: &Block) -> VoteData {
        self.execute(block).vote_data()
    }

    pub fn make_vote(&self, voter: usize, block: &Block) -> Vote {
        Vote::new(self.vote_data(block), &*self.signers[voter]).unwrap()
    }

    /// Timeout vote over `vote_data`, as sent after a local timeout
    pub fn make_timeout_vote(&self, voter: usize, vote_data: VoteData) -> Vote {
        let mut vote = Vote::new(vote_data, &*self.signers[voter]).unwrap();
        let sig = self.signers[voter].sign(&vote.timeout().hash()).unwrap();
        vote.add_timeout_signature(sig);
        vote
    }

    pub fn make_qc(&self, block: &Block, voters: &[usize]) -> QuorumCert {
        let vote_data = self.vote_data(block);
        let digest = vote_data.hash();
        let signatures: BTreeMap<_, _> = voters
            .iter()
            .map(|&i| (self.author(i), self.signers[i].sign(&digest).unwrap()))
            .collect();
        QuorumCert::new(vote_data, signatures)
    }

    pub fn sign_timeout(&self, voter: usize, timeout: &Timeout) -> (Author, Signature) {
        (self.author(voter), self.signers[voter].sign(&timeout.hash()).unwrap())
    }

    pub fn make_tc(&self, round: Round, voters: &[usize]) -> TimeoutCertificate {
        let timeout = Timeout::new(self.epoch_state.epoch, round);
        let mut tc = TimeoutCertificate::new(timeout);
        for &i in voters {
            let (author, sig) = self.sign_timeout(i, &timeout);
            tc.add_signature(author, sig);
        }
        tc
    }

    /// Build a chain of certified blocks for rounds `1..=rounds` on top of
    /// genesis. Returns the blocks and their certificates, index-aligned.
    pub fn certified_chain(&self, rounds: Round) -> (Vec<Block>, Vec<QuorumCert>) {
        let quorum: Vec<usize> = (0..self.signers.len()).collect();
        let mut blocks = Vec::new();
        let mut qcs = Vec::new();
        let mut parent_qc = self.genesis.quorum_cert().clone();
        for round in 1..=rounds {
            let proposer = (round as usize) % self.signers.len();
            let block = self.make_block(proposer, round, &parent_qc);
            let qc = self.make_qc(&block, &quorum);
            parent_qc = qc.clone();
            blocks.push(block);
            qcs.push(qc);
        }
        (blocks, qcs)
    }
}
