/// Validator sets, quorum arithmetic and signature verification
/// 
/// A `ValidatorVerifier` is built once per epoch and shared (via
/// `EpochState`) by everything that needs to check a signature or a quorum.

use crate::crypto::{aggregate_verify, BLSPublicKey, Hash, Signature};
use crate::hotstuff::types::{Author, Epoch};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use thiserror::Error;

/// Verification failures for signed consensus data
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VerifyError {
    #[error("Unknown author: {0}")]
    UnknownAuthor(Author),

    #[error("Invalid signature from {0}")]
    InvalidSignature(Author),

    #[error("Invalid aggregated signature")]
    InvalidAggregatedSignature,

    #[error("Insufficient voting power: got {voting_power}, need {quorum}")]
    TooLittleVotingPower { voting_power: u64, quorum: u64 },

    #[error("Epoch mismatch: expected {expected}, got {got}")]
    EpochMismatch { expected: Epoch, got: Epoch },

    #[error("Block id does not match block content")]
    InvalidBlockId,

    #[error("Missing signature")]
    MissingSignature,

    #[error("Malformed: {0}")]
    Malformed(String),
}

/// Errors building a validator set
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidatorSetError {
    #[error("Empty validator set")]
    Empty,
    #[error("Duplicate validator: {0}")]
    DuplicateAuthor(Author),
    #[error("Validator {0} has zero voting power")]
    ZeroVotingPower(Author),
}

/// `true` when `voting_power` is strictly more than two thirds of `total`.
///
/// With equal weights and `total = 3f + 1` this is the familiar `2f + 1`.
pub fn is_quorum(voting_power: u64, total: u64) -> bool {
    (voting_power as u128) * 3 > (total as u128) * 2
}

/// Smallest voting power satisfying `is_quorum` for `total`
pub fn quorum_threshold(total: u64) -> u64 {
    ((total as u128) * 2 / 3 + 1) as u64
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidatorInfo {
    pub author: Author,
    pub public_key: BLSPublicKey,
    pub voting_power: u64,
}

impl ValidatorInfo {
    pub fn new(public_key: BLSPublicKey, voting_power: u64) -> Self {
        Self {
            author: Author::from_public_key(&public_key),
            public_key,
            voting_power,
        }
    }
}

/// Ordered validator list for one epoch. Order is significant: leader
/// election indexes into it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidatorSet {
    validators: Vec<ValidatorInfo>,
}

impl ValidatorSet {
    pub fn new(validators: Vec<ValidatorInfo>) -> Result<Self, ValidatorSetError> {
        if validators.is_empty() {
            return Err(ValidatorSetError::Empty);
        }
        let mut seen = BTreeSet::new();
        for v in &validators {
            if v.voting_power == 0 {
                return Err(ValidatorSetError::ZeroVotingPower(v.author));
            }
            if !seen.insert(v.author) {
                return Err(ValidatorSetError::DuplicateAuthor(v.author));
            }
        }
        Ok(Self { validators })
    }

    /// Equal-weight set, one unit of voting power per key
    pub fn from_public_keys(keys: Vec<BLSPublicKey>) -> Result<Self, ValidatorSetError> {
        Self::new(keys.into_iter().map(|pk| ValidatorInfo::new(pk, 1)).collect())
    }

    pub fn len(&self) -> usize {
        self.validators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.validators.is_empty()
    }

    pub fn validators(&self) -> &[ValidatorInfo] {
        &self.validators
    }

    pub fn authors(&self) -> Vec<Author> {
        self.validators.iter().map(|v| v.author).collect()
    }

    pub fn total_voting_power(&self) -> u64 {
        self.validators.iter().map(|v| v.voting_power).sum()
    }
}

/// Signature and quorum checks against a fixed validator set
#[derive(Debug)]
pub struct ValidatorVerifier {
    set: ValidatorSet,
    index: HashMap<Author, usize>,
    total_voting_power: u64,
}

impl ValidatorVerifier {
    pub fn new(set: ValidatorSet) -> Self {
        let index = set
            .validators
            .iter()
            .enumerate()
            .map(|(i, v)| (v.author, i))
            .collect();
        let total_voting_power = set.total_voting_power();
        Self {
            set,
            index,
            total_voting_power,
        }
    }

    pub fn validator_set(&self) -> &ValidatorSet {
        &self.set
    }

    pub fn len(&self) -> usize {
        self.set.len()
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty()
    }

    pub fn contains(&self, author: &Author) -> bool {
        self.index.contains_key(author)
    }

    pub fn voting_power(&self, author: &Author) -> Option<u64> {
        self.index.get(author).map(|&i| self.set.validators[i].voting_power)
    }

    pub fn total_voting_power(&self) -> u64 {
        self.total_voting_power
    }

    pub fn quorum_voting_power(&self) -> u64 {
        quorum_threshold(self.total_voting_power)
    }

    fn public_key(&self, author: &Author) -> Result<&BLSPublicKey, VerifyError> {
        self.index
            .get(author)
            .map(|&i| &self.set.validators[i].public_key)
            .ok_or(VerifyError::UnknownAuthor(*author))
    }

    /// Verify one author's signature over `digest`
    pub fn verify_signature(
        &self,
        author: &Author,
        digest: &Hash,
        signature: &Signature,
    ) -> Result<(), VerifyError> {
        self.public_key(author)?
            .verify(digest.as_bytes(), signature)
            .map_err(|_| VerifyError::InvalidSignature(*author))
    }

    /// Sum the voting power of `authors` (each counted once) and require a quorum.
    /// Unknown authors fail the whole check.
    pub fn check_voting_power<'a>(
        &self,
        authors: impl Iterator<Item = &'a Author>,
    ) -> Result<u64, VerifyError> {
        let mut seen = BTreeSet::new();
        let mut voting_power = 0u64;
        for author in authors {
            let power = self
                .voting_power(author)
                .ok_or(VerifyError::UnknownAuthor(*author))?;
            if seen.insert(*author) {
                voting_power += power;
            }
        }
        if !is_quorum(voting_power, self.total_voting_power) {
            return Err(VerifyError::TooLittleVotingPower {
                voting_power,
                quorum: self.quorum_voting_power(),
            });
        }
        Ok(voting_power)
    }

    /// Verify a certificate's signature map: every entry signed `digest`.
    pub fn verify_aggregated(
        &self,
        digest: &Hash,
        signatures: &BTreeMap<Author, Signature>,
    ) -> Result<(), VerifyError> {
        if signatures.is_empty() {
            return Err(VerifyError::MissingSignature);
        }
        let mut keys = Vec::with_capacity(signatures.len());
        let mut sigs = Vec::with_capacity(signatures.len());
        for (author, sig) in signatures {
            keys.push(self.public_key(author)?);
            sigs.push(sig);
        }
        aggregate_verify(digest.as_bytes(), &sigs, &keys)
            .map_err(|_| VerifyError::InvalidAggregatedSignature)
    }
}

/// Everything a component needs to know about the current epoch
#[derive(Clone, Debug)]
pub struct EpochState {
    pub epoch: Epoch,
    pub verifier: Arc<ValidatorVerifier>,
}

impl EpochState {
    pub fn new(epoch: Epoch, set: ValidatorSet) -> Self {
        Self {
            epoch,
            verifier: Arc::new(ValidatorVerifier::new(set)),
        }
    }

    pub fn ensure_epoch(&self, epoch: Epoch) -> Result<(), VerifyError> {
        if epoch != self.epoch {
            return Err(VerifyError::EpochMismatch {
                expected: self.epoch,
                got: epoch,
            });
        }
        Ok(())
    }
}

/// Source of validator sets, consulted at start-up
pub trait ValidatorSetProvider: Send + Sync {
    fn validators(&self, epoch: Epoch) -> Option<ValidatorSet>;
}

/// Provider backed by a fixed table of epochs
#[derive(Clone, Debug, Default)]
pub struct StaticValidatorSetProvider {
    sets: BTreeMap<Epoch, ValidatorSet>,
}

impl StaticValidatorSetProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_epoch(mut self, epoch: Epoch, set: ValidatorSet) -> Self {
        self.sets.insert(epoch, set);
        self
    }
}

impl ValidatorSetProvider for StaticValidatorSetProvider {
    fn validators(&self, epoch: Epoch) -> Option<ValidatorSet> {
        self.sets.get(&epoch).cloned()
    }
}
