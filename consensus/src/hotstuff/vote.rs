/// Votes, vote data and timeouts

use crate::crypto::{BLSError, CryptoHasher, Hash, Signature, ValidatorSigner};
use crate::hotstuff::types::{Author, BlockInfo, Epoch, Round};
use crate::hotstuff::validator::{ValidatorVerifier, VerifyError};
use serde::{Deserialize, Serialize};
use std::fmt;

/// What a vote endorses: a block together with the block it extends.
///
/// Carrying the parent lets the commit rule be checked from certificates
/// alone, without walking the tree.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VoteData {
    proposed: BlockInfo,
    parent: BlockInfo,
}

impl VoteData {
    pub fn new(proposed: BlockInfo, parent: BlockInfo) -> Self {
        Self { proposed, parent }
    }

    pub fn proposed(&self) -> &BlockInfo {
        &self.proposed
    }

    pub fn parent(&self) -> &BlockInfo {
        &self.parent
    }

    /// Placeholder data a node signs when it times out without voting
    pub fn is_nil(&self) -> bool {
        self.proposed == BlockInfo::nil(self.proposed.round, &self.parent)
    }

    /// Digest that votes sign and certificates aggregate over
    pub fn hash(&self) -> Hash {
        let mut hasher = CryptoHasher::new("VoteData");
        self.proposed.hash_into(&mut hasher);
        self.parent.hash_into(&mut hasher);
        hasher.finish()
    }

    /// Structural checks; genesis data (proposed == parent at round 0) is valid.
    pub fn verify(&self) -> Result<(), VerifyError> {
        if self.proposed.epoch != self.parent.epoch {
            return Err(VerifyError::Malformed(format!(
                "vote data spans epochs {} and {}",
                self.parent.epoch, self.proposed.epoch
            )));
        }
        let genesis = self.proposed.round == 0 && self.proposed == self.parent;
        if !genesis && self.parent.round >= self.proposed.round {
            return Err(VerifyError::Malformed(format!(
                "parent round {} not below proposed round {}",
                self.parent.round, self.proposed.round
            )));
        }
        if self.parent.timestamp_usecs > self.proposed.timestamp_usecs {
            return Err(VerifyError::Malformed(
                "parent timestamp after proposed timestamp".into(),
            ));
        }
        Ok(())
    }
}

/// Signed content of a timeout
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Timeout {
    pub epoch: Epoch,
    pub round: Round,
}

impl Timeout {
    pub fn new(epoch: Epoch, round: Round) -> Self {
        Self { epoch, round }
    }

    pub fn hash(&self) -> Hash {
        CryptoHasher::new("Timeout")
            .update_u64(self.epoch)
            .update_u64(self.round)
            .finish()
    }
}

/// A single validator's vote. A timeout vote additionally carries a
/// signature over `Timeout { epoch, round }`.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vote {
    vote_data: VoteData,
    author: Author,
    signature: Signature,
    timeout_signature: Option<Signature>,
}

impl Vote {
    /// Sign `vote_data` with the local validator's key
    pub fn new(vote_data: VoteData, signer: &dyn ValidatorSigner) -> Result<Self, BLSError> {
        let signature = signer.sign(&vote_data.hash())?;
        Ok(Self {
            vote_data,
            author: signer.author(),
            signature,
            timeout_signature: None,
        })
    }

    pub fn new_with_signature(vote_data: VoteData, author: Author, signature: Signature) -> Self {
        Self {
            vote_data,
            author,
            signature,
            timeout_signature: None,
        }
    }

    pub fn add_timeout_signature(&mut self, signature: Signature) {
        self.timeout_signature = Some(signature);
    }

    pub fn vote_data(&self) -> &VoteData {
        &self.vote_data
    }

    pub fn author(&self) -> Author {
        self.author
    }

    pub fn signature(&self) -> &Signature {
        &self.signature
    }

    pub fn timeout_signature(&self) -> Option<&Signature> {
        self.timeout_signature.as_ref()
    }

    pub fn is_timeout(&self) -> bool {
        self.timeout_signature.is_some()
    }

    pub fn epoch(&self) -> Epoch {
        self.vote_data.proposed.epoch
    }

    pub fn round(&self) -> Round {
        self.vote_data.proposed.round
    }

    pub fn timeout(&self) -> Timeout {
        Timeout::new(self.epoch(), self.round())
    }

    /// Check vote data shape and both signatures.
    pub fn verify(&self, verifier: &ValidatorVerifier) -> Result<(), VerifyError> {
        self.vote_data.verify()?;
        verifier.verify_signature(&self.author, &self.vote_data.hash(), &self.signature)?;
        if let Some(sig) = &self.timeout_signature {
            verifier.verify_signature(&self.author, &self.timeout().hash(), sig)?;
        }
        Ok(())
    }
}

impl fmt::Debug for Vote {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self)
    }
}

impl fmt::Display for Vote {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Vote: [block {}, author {}, timeout: {}]",
            self.vote_data.proposed,
            self.author,
            self.is_timeout()
        )
    }
}
