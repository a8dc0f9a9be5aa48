/// Cryptography module for the consensus engine
/// 
/// Implements:
/// - BLS signatures with aggregate verification for QCs and TCs
/// - BLAKE3 digests and domain-separated hashing
/// - The signing capability a validator hands to the engine

pub mod bls;
pub mod hash;
pub mod signer;

pub use bls::{aggregate_verify, BLSError, BLSKeyPair, BLSPublicKey, BLSSecretKey, BLSSignature};
pub use hash::{hash_data, CryptoHasher, Hash};
pub use signer::{BlsSigner, ValidatorSigner};

/// Signature type carried by votes, blocks and certificates
pub type Signature = BLSSignature;
