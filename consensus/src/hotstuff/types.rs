/// Core types shared by every consensus component

use crate::crypto::{BLSPublicKey, CryptoHasher, Hash};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Round number, monotonic within an epoch
pub type Round = u64;

/// Epoch number; a new epoch starts with every validator-set change
pub type Epoch = u64;

/// Content hash of a block
pub type BlockId = Hash;

/// Opaque ordered transactions carried by a block
pub type Payload = Vec<Vec<u8>>;

/// Validator identity: the BLAKE3 hash of the validator's BLS public key
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Author([u8; 32]);

impl Author {
    pub fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn from_public_key(public_key: &BLSPublicKey) -> Self {
        Self(*blake3::hash(&public_key.to_bytes()).as_bytes())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for Author {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0[..4]))
    }
}

impl fmt::Debug for Author {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Author({})", hex::encode(self.0))
    }
}

/// State id before the first block of the first epoch is executed
pub const PRE_GENESIS_STATE_ID: Hash = Hash::new([0u8; 32]);

/// Compact description of a block, as carried inside votes and certificates
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockInfo {
    pub epoch: Epoch,
    pub round: Round,
    pub id: BlockId,
    pub timestamp_usecs: u64,
    /// Ledger state after executing the block; votes bind to it
    pub executed_state_id: Hash,
}

impl BlockInfo {
    pub fn new(
        epoch: Epoch,
        round: Round,
        id: BlockId,
        timestamp_usecs: u64,
        executed_state_id: Hash,
    ) -> Self {
        Self {
            epoch,
            round,
            id,
            timestamp_usecs,
            executed_state_id,
        }
    }

    /// Placeholder proposed-block info used by a timeout vote when the
    /// node has not voted in `round`. Deterministic per (round, parent).
    pub fn nil(round: Round, parent: &BlockInfo) -> Self {
        let id = CryptoHasher::new("NilBlock")
            .update_u64(parent.epoch)
            .update_u64(round)
            .update(parent.id.as_bytes())
            .finish();
        Self {
            epoch: parent.epoch,
            round,
            id,
            timestamp_usecs: parent.timestamp_usecs,
            executed_state_id: parent.executed_state_id,
        }
    }

    pub(crate) fn hash_into(&self, hasher: &mut CryptoHasher) {
        hasher
            .update_u64(self.epoch)
            .update_u64(self.round)
            .update(self.id.as_bytes())
            .update_u64(self.timestamp_usecs)
            .update(self.executed_state_id.as_bytes());
    }
}

impl fmt::Display for BlockInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[id: {}, epoch: {}, round: {}]", self.id, self.epoch, self.round)
    }
}

/// Microseconds since the Unix epoch; zero if the clock is before 1970.
pub fn now_usecs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{hash_data, BLSKeyPair};

    #[test]
    fn test_author_is_stable_per_key() {
        let kp = BLSKeyPair::from_seed(1).unwrap();
        assert_eq!(
            Author::from_public_key(&kp.public_key),
            Author::from_public_key(&kp.public_key)
        );
        let other = BLSKeyPair::from_seed(2).unwrap();
        assert_ne!(
            Author::from_public_key(&kp.public_key),
            Author::from_public_key(&other.public_key)
        );
    }

    #[test]
    fn test_nil_block_info_is_deterministic() {
        let parent = BlockInfo::new(1, 3, hash_data(b"parent"), 10, hash_data(b"state"));
        let a = BlockInfo::nil(5, &parent);
        let b = BlockInfo::nil(5, &parent);
        assert_eq!(a, b);
        assert_eq!(a.round, 5);
        assert_eq!(a.epoch, 1);
        assert_eq!(a.executed_state_id, parent.executed_state_id);
        assert_ne!(a.id, BlockInfo::nil(6, &parent).id);
    }
}
