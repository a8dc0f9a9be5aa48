/// BLAKE3 digests for block ids and signed messages

use serde::{Deserialize, Serialize};
use std::fmt;

pub const HASH_SIZE: usize = 32;

/// Hash output (32 bytes)
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Hash([u8; HASH_SIZE]);

impl Hash {
    pub const fn new(bytes: [u8; HASH_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; HASH_SIZE] {
        &self.0
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0[..8]))
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash({})", hex::encode(self.0))
    }
}

impl AsRef<[u8]> for Hash {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Undomained digest of `data`. Protocol structures go through `CryptoHasher`.
pub fn hash_data(data: &[u8]) -> Hash {
    Hash::new(*blake3::hash(data).as_bytes())
}

/// Incremental, domain-separated hasher.
///
/// Every signed or content-addressed structure hashes through one of these
/// so that a block id can never collide with a vote digest.
pub struct CryptoHasher {
    inner: blake3::Hasher,
}

impl CryptoHasher {
    pub fn new(domain: &str) -> Self {
        let mut inner = blake3::Hasher::new();
        inner.update(&(domain.len() as u64).to_le_bytes());
        inner.update(domain.as_bytes());
        Self { inner }
    }

    pub fn update(&mut self, bytes: &[u8]) -> &mut Self {
        self.inner.update(bytes);
        self
    }

    pub fn update_u64(&mut self, value: u64) -> &mut Self {
        self.inner.update(&value.to_le_bytes());
        self
    }

    /// Length-prefixed write, for variable-sized fields.
    pub fn update_bytes(&mut self, bytes: &[u8]) -> &mut Self {
        self.update_u64(bytes.len() as u64);
        self.inner.update(bytes);
        self
    }

    pub fn finish(&self) -> Hash {
        Hash::new(*self.inner.finalize().as_bytes())
    }
}
