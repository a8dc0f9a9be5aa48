/// Quorum and timeout certificates

use crate::crypto::Signature;
use crate::hotstuff::types::{Author, BlockId, BlockInfo, Epoch, Round};
use crate::hotstuff::validator::{EpochState, VerifyError};
use crate::hotstuff::vote::{Timeout, VoteData};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Proof that a quorum of the epoch's voting power signed the same `VoteData`
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuorumCert {
    vote_data: VoteData,
    signatures: BTreeMap<Author, Signature>,
}

impl QuorumCert {
    pub fn new(vote_data: VoteData, signatures: BTreeMap<Author, Signature>) -> Self {
        Self {
            vote_data,
            signatures,
        }
    }

    /// The certificate every epoch starts from: it certifies the epoch's
    /// genesis block, names it as its own parent and carries no signatures.
    pub fn certificate_for_genesis(genesis: BlockInfo) -> Self {
        Self {
            vote_data: VoteData::new(genesis.clone(), genesis),
            signatures: BTreeMap::new(),
        }
    }

    pub fn vote_data(&self) -> &VoteData {
        &self.vote_data
    }

    pub fn certified_block(&self) -> &BlockInfo {
        self.vote_data.proposed()
    }

    pub fn parent_block(&self) -> &BlockInfo {
        self.vote_data.parent()
    }

    pub fn certified_block_id(&self) -> BlockId {
        self.certified_block().id
    }

    /// Round of the certified block
    pub fn round(&self) -> Round {
        self.certified_block().round
    }

    pub fn epoch(&self) -> Epoch {
        self.certified_block().epoch
    }

    pub fn signatures(&self) -> &BTreeMap<Author, Signature> {
        &self.signatures
    }

    pub fn is_genesis(&self) -> bool {
        self.round() == 0
    }

    /// Check the certificate against the epoch it claims to belong to.
    pub fn verify(&self, epoch_state: &EpochState) -> Result<(), VerifyError> {
        epoch_state.ensure_epoch(self.epoch())?;
        if self.is_genesis() {
            if self.certified_block() != self.parent_block() {
                return Err(VerifyError::Malformed("genesis QC must certify its own parent".into()));
            }
            if !self.signatures.is_empty() {
                return Err(VerifyError::Malformed("genesis QC carries signatures".into()));
            }
            return Ok(());
        }
        self.vote_data.verify()?;
        epoch_state
            .verifier
            .check_voting_power(self.signatures.keys())?;
        epoch_state
            .verifier
            .verify_aggregated(&self.vote_data.hash(), &self.signatures)
    }
}

impl fmt::Debug for QuorumCert {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self)
    }
}

impl fmt::Display for QuorumCert {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "QuorumCert: [certified {}, parent {}, signers {}]",
            self.certified_block(),
            self.parent_block(),
            self.signatures.len()
        )
    }
}

/// Proof that a quorum timed out in `timeout.round`
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutCertificate {
    timeout: Timeout,
    signatures: BTreeMap<Author, Signature>,
}

impl TimeoutCertificate {
    pub fn new(timeout: Timeout) -> Self {
        Self {
            timeout,
            signatures: BTreeMap::new(),
        }
    }

    pub fn timeout(&self) -> &Timeout {
        &self.timeout
    }

    pub fn epoch(&self) -> Epoch {
        self.timeout.epoch
    }

    pub fn round(&self) -> Round {
        self.timeout.round
    }

    pub fn signatures(&self) -> &BTreeMap<Author, Signature> {
        &self.signatures
    }

    /// Add an author's timeout signature; a second signature from the
    /// same author is ignored.
    pub fn add_signature(&mut self, author: Author, signature: Signature) {
        self.signatures.entry(author).or_insert(signature);
    }

    pub fn verify(&self, epoch_state: &EpochState) -> Result<(), VerifyError> {
        epoch_state.ensure_epoch(self.epoch())?;
        epoch_state
            .verifier
            .check_voting_power(self.signatures.keys())?;
        epoch_state
            .verifier
            .verify_aggregated(&self.timeout.hash(), &self.signatures)
    }
}

impl fmt::Debug for TimeoutCertificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self)
    }
}

impl fmt::Display for TimeoutCertificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "TimeoutCertificate: [epoch {}, round {}, signers {}]",
            self.epoch(),
            self.round(),
            self.signatures.len()
        )
    }
}
