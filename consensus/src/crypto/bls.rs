/// BLS signatures over BLS12-381 (min-pk variant)
/// 
/// Validators sign 32-byte digests. Quorum and timeout certificates keep
/// the individual signatures keyed by author, and verify them in one shot
/// by aggregating signatures and public keys over the common digest.

use blst::min_pk::{
    AggregatePublicKey, AggregateSignature, PublicKey as BlstPublicKey,
    SecretKey as BlstSecretKey, Signature as BlstSignature,
};
use blst::BLST_ERROR;
use thiserror::Error;

/// Domain separation tag (hash-to-curve, proof-of-possession ciphersuite)
pub const BLS_DST: &[u8] = b"BLS_SIG_BLS12381G2_XMD:SHA-256_SSWU_RO_POP_";

/// Compressed G1 public key
pub const BLS_PUBLIC_KEY_SIZE: usize = 48;
/// Compressed G2 signature
pub const BLS_SIGNATURE_SIZE: usize = 96;
pub const BLS_SECRET_KEY_SIZE: usize = 32;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BLSError {
    #[error("Invalid signature encoding")]
    InvalidSignature,
    #[error("Invalid key")]
    InvalidKey,
    #[error("Signature verification failed")]
    VerificationFailed,
    #[error("Key material too short: need at least 32 bytes, got {0}")]
    ShortKeyMaterial(usize),
    #[error("Nothing to aggregate")]
    EmptyAggregate,
}

/// BLS secret key wrapper
#[derive(Clone)]
pub struct BLSSecretKey {
    inner: BlstSecretKey,
}

impl BLSSecretKey {
    /// Generate a new random secret key
    pub fn generate() -> Result<Self, BLSError> {
        let mut ikm = [0u8; 32];
        rand::Rng::fill(&mut rand::thread_rng(), &mut ikm);
        Self::from_ikm(&ikm)
    }

    /// Deterministic key derivation from input key material (>= 32 bytes)
    pub fn from_ikm(ikm: &[u8]) -> Result<Self, BLSError> {
        if ikm.len() < 32 {
            return Err(BLSError::ShortKeyMaterial(ikm.len()));
        }
        let inner = BlstSecretKey::key_gen(ikm, &[]).map_err(|_| BLSError::InvalidKey)?;
        Ok(Self { inner })
    }

    /// Create from raw bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, BLSError> {
        let inner = BlstSecretKey::from_bytes(bytes).map_err(|_| BLSError::InvalidKey)?;
        Ok(Self { inner })
    }

    /// Get the corresponding public key
    pub fn public_key(&self) -> BLSPublicKey {
        BLSPublicKey {
            inner: self.inner.sk_to_pk(),
        }
    }

    /// Sign a message under the consensus domain tag
    pub fn sign(&self, message: &[u8]) -> BLSSignature {
        BLSSignature {
            inner: self.inner.sign(message, BLS_DST, &[]),
        }
    }
}

/// BLS public key wrapper
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BLSPublicKey {
    inner: BlstPublicKey,
}

impl BLSPublicKey {
    /// Create from raw bytes (compressed or serialized form)
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, BLSError> {
        let inner = BlstPublicKey::from_bytes(bytes).map_err(|_| BLSError::InvalidKey)?;
        Ok(Self { inner })
    }

    /// Serialize to compressed bytes
    pub fn to_bytes(&self) -> Vec<u8> {
        self.inner.to_bytes().to_vec()
    }

    /// Verify a single signature over `message`
    pub fn verify(&self, message: &[u8], signature: &BLSSignature) -> Result<(), BLSError> {
        match signature.inner.verify(true, message, BLS_DST, &[], &self.inner, true) {
            BLST_ERROR::BLST_SUCCESS => Ok(()),
            _ => Err(BLSError::VerificationFailed),
        }
    }
}

/// BLS signature wrapper
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BLSSignature {
    inner: BlstSignature,
}

impl BLSSignature {
    /// Create from raw bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, BLSError> {
        let inner = BlstSignature::from_bytes(bytes).map_err(|_| BLSError::InvalidSignature)?;
        Ok(Self { inner })
    }

    /// Serialize to compressed bytes
    pub fn to_bytes(&self) -> Vec<u8> {
        self.inner.to_bytes().to_vec()
    }
}

/// BLS Key pair (secret + public key)
#[derive(Clone)]
pub struct BLSKeyPair {
    pub secret_key: BLSSecretKey,
    pub public_key: BLSPublicKey,
}

impl BLSKeyPair {
    /// Generate a new random key pair
    pub fn generate() -> Result<Self, BLSError> {
        let secret_key = BLSSecretKey::generate()?;
        let public_key = secret_key.public_key();
        Ok(Self { secret_key, public_key })
    }

    /// Deterministic key pair from a seed, for tests and local clusters
    pub fn from_seed(seed: u64) -> Result<Self, BLSError> {
        let ikm = blake3::hash(&seed.to_le_bytes());
        let secret_key = BLSSecretKey::from_ikm(ikm.as_bytes())?;
        let public_key = secret_key.public_key();
        Ok(Self { secret_key, public_key })
    }
}

/// Verify that every `(public_key, signature)` pair signed the same `message`.
///
/// Signatures and keys are aggregated and checked with a single pairing.
/// Keys must come from a registered validator set; rogue-key resistance
/// relies on that registration.
///
/// # Arguments
/// * `message` - The common signed digest
/// * `signatures` - One signature per signer
/// * `public_keys` - Signer keys, in the same order
pub fn aggregate_verify(
    message: &[u8],
    signatures: &[&BLSSignature],
    public_keys: &[&BLSPublicKey],
) -> Result<(), BLSError> {
    if signatures.is_empty() || signatures.len() != public_keys.len() {
        return Err(BLSError::EmptyAggregate);
    }

    let sigs: Vec<&BlstSignature> = signatures.iter().map(|s| &s.inner).collect();
    let aggregated_sig = AggregateSignature::aggregate(&sigs, true)
        .map_err(|_| BLSError::InvalidSignature)?
        .to_signature();

    let pks: Vec<&BlstPublicKey> = public_keys.iter().map(|pk| &pk.inner).collect();
    let aggregated_pk = AggregatePublicKey::aggregate(&pks, false)
        .map_err(|_| BLSError::InvalidKey)?
        .to_public_key();

    match aggregated_sig.verify(true, message, BLS_DST, &[], &aggregated_pk, true) {
        BLST_ERROR::BLST_SUCCESS => Ok(()),
        _ => Err(BLSError::VerificationFailed),
    }
}

impl serde::Serialize for BLSPublicKey {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_bytes(&self.to_bytes())
    }
}

impl<'de> serde::Deserialize<'de> for BLSPublicKey {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let bytes = deserializer.deserialize_bytes(BytesVisitor("a compressed BLS public key"))?;
        BLSPublicKey::from_bytes(&bytes).map_err(serde::de::Error::custom)
    }
}

impl serde::Serialize for BLSSignature {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_bytes(&self.to_bytes())
    }
}

impl<'de> serde::Deserialize<'de> for BLSSignature {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let bytes = deserializer.deserialize_bytes(BytesVisitor("a compressed BLS signature"))?;
        BLSSignature::from_bytes(&bytes).map_err(serde::de::Error::custom)
    }
}

// Accepts both native byte strings (bincode) and sequences (self-describing formats).
struct BytesVisitor(&'static str);

impl<'de> serde::de::Visitor<'de> for BytesVisitor {
    type Value = Vec<u8>;

    fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
        formatter.write_str(self.0)
    }

    fn visit_bytes<E>(self, v: &[u8]) -> Result<Self::Value, E>
    where
        E: serde::de::Error,
    {
        Ok(v.to_vec())
    }

    fn visit_byte_buf<E>(self, v: Vec<u8>) -> Result<Self::Value, E>
    where
        E: serde::de::Error,
    {
        Ok(v)
    }

    fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
    where
        A: serde::de::SeqAccess<'de>,
    {
        let mut bytes = Vec::new();
        while let Some(byte) = seq.next_element()? {
            bytes.push(byte);
        }
        Ok(bytes)
    }
}
