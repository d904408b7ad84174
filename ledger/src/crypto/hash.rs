//! # Hashing Utilities
//!
//! SHA-256 is the only hash function the ledger uses. Block identity,
//! hash chaining and the proof-of-work puzzle all run through the helpers
//! below, so there is exactly one place where the digest is computed.

use sha2::{Digest, Sha256};

use crate::config::HASH_LENGTH;

/// A 32-byte SHA-256 digest identifying a block.
pub type BlockHash = [u8; HASH_LENGTH];

/// Compute the SHA-256 hash of the input data.
///
/// Returns the digest as a `Vec<u8>` for callers that store hashes as owned
/// byte strings. Use [`sha256_array`] on hot paths (mining).
///
/// # Example
///
/// ```
/// use pow_ledger::crypto::sha256;
///
/// let hash = sha256(b"ledger");
/// assert_eq!(hash.len(), 32);
/// ```
pub fn sha256(data: &[u8]) -> Vec<u8> {
    sha256_array(data).to_vec()
}

/// Compute the SHA-256 hash and return a fixed-size array.
pub fn sha256_array(data: &[u8]) -> BlockHash {
    let mut hasher = Sha256::new();
    hasher.update(data);
    let result = hasher.finalize();
    let mut output = [0u8; HASH_LENGTH];
    output.copy_from_slice(&result);
    output
}

/// Interpret a stored byte string as a [`BlockHash`].
///
/// Returns `None` unless `bytes` is exactly 32 bytes long.
pub fn hash_from_slice(bytes: &[u8]) -> Option<BlockHash> {
    bytes.try_into().ok()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
