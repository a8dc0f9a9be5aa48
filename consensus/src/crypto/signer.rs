// Signing capability handed to the engine.
//
// The engine never touches secret keys directly; safety rules and the
// proposal generator sign through this trait so that keys can live in a
// separate process or device.

use crate::crypto::{BLSError, BLSKeyPair, Hash, Signature};
use crate::hotstuff::types::Author;

pub trait ValidatorSigner: Send + Sync {
    /// Identity of the local validator
    fn author(&self) -> Author;

    /// Sign a 32-byte digest
    fn sign(&self, digest: &Hash) -> Result<Signature, BLSError>;
}

/// In-process signer backed by a BLS key pair
pub struct BlsSigner {
    author: Author,
    keypair: BLSKeyPair,
}

impl BlsSigner {
    pub fn new(keypair: BLSKeyPair) -> Self {
        let author = Author::from_public_key(&keypair.public_key);
        Self { author, keypair }
    }

    pub fn keypair(&self) -> &BLSKeyPair {
        &self.keypair
    }
}

impl ValidatorSigner for BlsSigner {
    fn author(&self) -> Author {
        self.author
    }

    fn sign(&self, digest: &Hash) -> Result<Signature, BLSError> {
        Ok(self.keypair.secret_key.sign(digest.as_bytes()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::hash_data;

    #[test]
    fn test_signer_author_matches_public_key() {
        let keypair = BLSKeyPair::from_seed(3).unwrap();
        let expected = Author::from_public_key(&keypair.public_key);
        let signer = BlsSigner::new(keypair);
        assert_eq!(signer.author(), expected);
    }

    #[test]
    fn test_signer_produces_verifiable_signature() {
        let signer = BlsSigner::new(BLSKeyPair::from_seed(4).unwrap());
        let digest = hash_data(&testutil::random_message());
        let sig = signer.sign(&digest).unwrap();
        assert!(signer.keypair().public_key.verify(digest.as_bytes(), &sig).is_ok());
    }
}
