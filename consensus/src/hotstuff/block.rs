/// Blocks: the unit a round agrees on

use crate::crypto::{BLSError, CryptoHasher, Hash, Signature, ValidatorSigner};
use crate::hotstuff::quorum_cert::QuorumCert;
use crate::hotstuff::types::{Author, BlockId, BlockInfo, Epoch, Payload, Round, PRE_GENESIS_STATE_ID};
use crate::hotstuff::validator::{EpochState, VerifyError};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A proposed block. Immutable once built; `id` is a content hash over
/// everything except the signature.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    id: BlockId,
    epoch: Epoch,
    round: Round,
    timestamp_usecs: u64,
    /// `None` only for an epoch's genesis block
    author: Option<Author>,
    payload: Payload,
    parent_qc: QuorumCert,
    signature: Option<Signature>,
}

impl Block {
    /// Genesis block of `epoch`.
    ///
    /// For the first epoch `anchor` is `None`. After a reconfiguration the
    /// anchor is the committed block that ended the previous epoch, so the
    /// new tree hangs off it and inherits its executed state.
    pub fn make_genesis_block(epoch: Epoch, anchor: Option<&BlockInfo>) -> Self {
        let mut hasher = CryptoHasher::new("GenesisBlock");
        hasher.update_u64(epoch);
        let (timestamp_usecs, state_id) = match anchor {
            Some(info) => {
                hasher.update(info.id.as_bytes()).update_u64(info.round);
                (info.timestamp_usecs, info.executed_state_id)
            }
            None => (0, PRE_GENESIS_STATE_ID),
        };
        hasher.update_u64(timestamp_usecs);
        let id = hasher.finish();
        let info = BlockInfo::new(epoch, 0, id, timestamp_usecs, state_id);

        Self {
            id,
            epoch,
            round: 0,
            timestamp_usecs,
            author: None,
            payload: Vec::new(),
            parent_qc: QuorumCert::certificate_for_genesis(info),
            signature: None,
        }
    }

    /// Build and sign a proposal extending `parent_qc`
    pub fn new_proposal(
        payload: Payload,
        round: Round,
        timestamp_usecs: u64,
        parent_qc: QuorumCert,
        signer: &dyn ValidatorSigner,
    ) -> Result<Self, BLSError> {
        let epoch = parent_qc.epoch();
        let author = signer.author();
        let id = Self::compute_id(epoch, round, Some(&author), &parent_qc, &payload, timestamp_usecs);
        let signature = signer.sign(&id)?;
        Ok(Self {
            id,
            epoch,
            round,
            timestamp_usecs,
            author: Some(author),
            payload,
            parent_qc,
            signature: Some(signature),
        })
    }

    fn compute_id(
        epoch: Epoch,
        round: Round,
        author: Option<&Author>,
        parent_qc: &QuorumCert,
        payload: &Payload,
        timestamp_usecs: u64,
    ) -> Hash {
        let mut hasher = CryptoHasher::new("Block");
        hasher.update_u64(epoch).update_u64(round);
        match author {
            Some(author) => hasher.update(&[1]).update(author.as_bytes()),
            None => hasher.update(&[0]),
        };
        hasher
            .update(parent_qc.certified_block_id().as_bytes())
            .update_u64(payload.len() as u64);
        for txn in payload {
            hasher.update_bytes(txn);
        }
        hasher.update_u64(timestamp_usecs);
        hasher.finish()
    }

    pub fn id(&self) -> BlockId {
        self.id
    }

    pub fn epoch(&self) -> Epoch {
        self.epoch
    }

    pub fn round(&self) -> Round {
        self.round
    }

    pub fn timestamp_usecs(&self) -> u64 {
        self.timestamp_usecs
    }

    pub fn author(&self) -> Option<Author> {
        self.author
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn quorum_cert(&self) -> &QuorumCert {
        &self.parent_qc
    }

    pub fn parent_id(&self) -> BlockId {
        self.parent_qc.certified_block_id()
    }

    pub fn signature(&self) -> Option<&Signature> {
        self.signature.as_ref()
    }

    pub fn is_genesis(&self) -> bool {
        self.author.is_none()
    }

    /// Describe this block as executed to `executed_state_id`
    pub fn gen_block_info(&self, executed_state_id: Hash) -> BlockInfo {
        BlockInfo::new(self.epoch, self.round, self.id, self.timestamp_usecs, executed_state_id)
    }

    /// Content checks that need no keys: the id matches, rounds strictly
    /// increase, epoch and timestamps are consistent with the parent.
    pub fn verify_well_formed(&self) -> Result<(), VerifyError> {
        let parent = self.parent_qc.certified_block();
        if self.is_genesis() {
            if self.round != 0 || !self.payload.is_empty() || self.signature.is_some() {
                return Err(VerifyError::Malformed("genesis block with content".into()));
            }
            if parent.id != self.id {
                return Err(VerifyError::Malformed("genesis block must certify itself".into()));
            }
            return Ok(());
        }
        if self.round <= parent.round {
            return Err(VerifyError::Malformed(format!(
                "block round {} does not exceed parent round {}",
                self.round, parent.round
            )));
        }
        if self.epoch != parent.epoch {
            return Err(VerifyError::EpochMismatch {
                expected: parent.epoch,
                got: self.epoch,
            });
        }
        if self.timestamp_usecs < parent.timestamp_usecs {
            return Err(VerifyError::Malformed("timestamp before parent".into()));
        }
        let expected = Self::compute_id(
            self.epoch,
            self.round,
            self.author.as_ref(),
            &self.parent_qc,
            &self.payload,
            self.timestamp_usecs,
        );
        if expected != self.id {
            return Err(VerifyError::InvalidBlockId);
        }
        Ok(())
    }

    /// Full check of a received proposal: shape, author signature and parent QC.
    pub fn validate_signature(&self, epoch_state: &EpochState) -> Result<(), VerifyError> {
        self.verify_well_formed()?;
        epoch_state.ensure_epoch(self.epoch)?;
        let author = self
            .author
            .ok_or_else(|| VerifyError::Malformed("proposal without author".into()))?;
        let signature = self.signature.as_ref().ok_or(VerifyError::MissingSignature)?;
        epoch_state
            .verifier
            .verify_signature(&author, &self.id, signature)?;
        self.parent_qc.verify(epoch_state)
    }
}

impl fmt::Debug for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self)
    }
}

impl fmt::Display for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let author = self
            .author
            .map(|a| a.to_string())
            .unwrap_or_else(|| "genesis".to_string());
        write!(
            f,
            "[id: {}, author: {}, epoch: {}, round: {}, parent_id: {}, txns: {}]",
            self.id,
            author,
            self.epoch,
            self.round,
            self.parent_id(),
            self.payload.len()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hotstuff::test_utils::TestCommittee;

    #[test]
    fn test_genesis_block_shape() {
        let genesis = Block::make_genesis_block(1, None);
        assert!(genesis.is_genesis());
        assert_eq!(genesis.round(), 0);
        assert_eq!(genesis.parent_id(), genesis.id());
        assert!(genesis.verify_well_formed().is_ok());
        // Same epoch, same genesis
        assert_eq!(genesis.id(), Block::make_genesis_block(1, None).id());
        assert_ne!(genesis.id(), Block::make_genesis_block(2, None).id());
    }

    #[test]
    fn test_genesis_anchored_at_reconfiguration_block() {
        let committee = TestCommittee::new(4);
        let b1 = committee.make_block(1, 1, committee.genesis().quorum_cert());
        let anchor = committee.block_info(&b1);
        let anchored = Block::make_genesis_block(2, Some(&anchor));
        assert_eq!(anchored.epoch(), 2);
        assert_eq!(anchored.timestamp_usecs(), b1.timestamp_usecs());
        assert_eq!(
            anchored.quorum_cert().certified_block().executed_state_id,
            anchor.executed_state_id
        );
        assert_ne!(anchored.id(), Block::make_genesis_block(2, None).id());
    }

    #[test]
    fn test_proposal_validates() {
        let committee = TestCommittee::new(4);
        let b1 = committee.make_block(1, 1, committee.genesis().quorum_cert());
        assert_eq!(b1.author(), Some(committee.author(1)));
        assert_eq!(b1.parent_id(), committee.genesis().id());
        assert!(b1.validate_signature(&committee.epoch_state).is_ok());
    }

    #[test]
    fn test_id_commits_to_payload() {
        let committee = TestCommittee::new(4);
        let genesis = committee.genesis();
        let a = committee.make_block_with_payload(0, 1, genesis.quorum_cert(), testutil::random_payload(3, 32));
        let b = committee.make_block_with_payload(0, 1, genesis.quorum_cert(), testutil::random_payload(3, 32));
        assert_ne!(a.id(), b.id());
        assert!(b.verify_well_formed().is_ok());
    }

    #[test]
    fn test_tampered_payload_detected() {
        let committee = TestCommittee::new(4);
        let mut block = committee.make_block(0, 1, committee.genesis().quorum_cert());
        block.payload.push(b"injected".to_vec());
        assert_eq!(block.verify_well_formed(), Err(VerifyError::InvalidBlockId));
    }

    #[test]
    fn test_signature_from_wrong_key_rejected() {
        let committee = TestCommittee::new(4);
        let mut block = committee.make_block(0, 1, committee.genesis().quorum_cert());
        block.author = Some(committee.author(2));
        // Id changes with the author, so re-seal it under the claimed author
        block.id = Block::compute_id(
            block.epoch,
            block.round,
            block.author.as_ref(),
            &block.parent_qc,
            &block.payload,
            block.timestamp_usecs,
        );
        assert!(matches!(
            block.validate_signature(&committee.epoch_state),
            Err(VerifyError::InvalidSignature(_))
        ));
    }

    #[test]
    fn test_round_must_exceed_parent() {
        let committee = TestCommittee::new(4);
        let b1 = committee.make_block(0, 1, committee.genesis().quorum_cert());
        let qc1 = committee.make_qc(&b1, &[0, 1, 2]);
        let stale = committee.make_block(1, 1, &qc1);
        assert!(matches!(stale.verify_well_formed(), Err(VerifyError::Malformed(_))));
    }
}
