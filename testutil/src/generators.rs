/// Test data generators

use rand::Rng;

/// Generate random bytes
pub fn random_bytes(len: usize) -> Vec<u8> {
    let mut rng = rand::thread_rng();
    (0..len).map(|_| rng.gen()).collect()
}

/// Generate a random 32-byte message for signing tests
pub fn random_message() -> Vec<u8> {
    random_bytes(32)
}

/// Generate a block payload of `count` random transactions, each `tx_len` bytes
pub fn random_payload(count: usize, tx_len: usize) -> Vec<Vec<u8>> {
    (0..count).map(|_| random_bytes(tx_len)).collect()
}
