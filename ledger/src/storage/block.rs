//! # Block Structure
//!
//! A block is one immutable, hash-identified record of the ledger: an
//! opaque payload, a link to its predecessor and the proof-of-work that
//! admitted it.
//!
//! ## Header Layout
//!
//! ```text
//! ┌────────────────────────────────────────────────┐
//! │  previous_hash    0 or 32 bytes (empty=genesis)│
//! │  data             arbitrary bytes              │
//! │  timestamp        i64, big-endian              │
//! │  difficulty_bits  u32, big-endian              │
//! │  nonce            u64, big-endian              │
//! └────────────────────────────────────────────────┘
//! hash = SHA-256(header)
//! ```
//!
//! [`compute_header_bytes`] is the only function that lays these bytes out.
//! Mining and verification both go through it, so the two can never drift.
//!
//! Fields are private. A `Block` only comes into existence by being mined
//! ([`Block::new_block`]) or decoded from storage, and there is no way to
//! change a field afterwards.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::{validate_difficulty, GENESIS_DATA};
use crate::crypto::hash::{sha256_array, BlockHash};
use crate::pow::{meets_target, PowResult, ProofOfWork, Solution};

// ---------------------------------------------------------------------------
// Header Bytes
// ---------------------------------------------------------------------------

/// Produce the exact byte sequence that is hashed for a block.
///
/// `previous_hash` is empty for the genesis block and 32 bytes otherwise.
pub fn compute_header_bytes(
    previous_hash: &[u8],
    data: &[u8],
    timestamp: i64,
    difficulty_bits: u32,
    nonce: u64,
) -> Vec<u8> {
    let mut preimage = header_prefix(previous_hash, data, timestamp, difficulty_bits);
    preimage.extend_from_slice(&nonce.to_be_bytes());
    preimage
}

/// Everything in the header except the trailing nonce. The miner builds this
/// once and rewrites only the last 8 bytes per attempt.
pub(crate) fn header_prefix(
    previous_hash: &[u8],
    data: &[u8],
    timestamp: i64,
    difficulty_bits: u32,
) -> Vec<u8> {
    let mut preimage = Vec::with_capacity(previous_hash.len() + data.len() + 20);
    preimage.extend_from_slice(previous_hash);
    preimage.extend_from_slice(data);
    preimage.extend_from_slice(&timestamp.to_be_bytes());
    preimage.extend_from_slice(&difficulty_bits.to_be_bytes());
    preimage
}

// ---------------------------------------------------------------------------
// Verification Errors
// ---------------------------------------------------------------------------

/// Reasons a block fails [`Block::verify`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BlockVerifyError {
    #[error("hash mismatch: stored={stored}, computed={computed}")]
    HashMismatch { stored: String, computed: String },

    #[error("hash {hash} does not meet difficulty {difficulty_bits}")]
    InsufficientWork { hash: String, difficulty_bits: u32 },

    #[error("difficulty {0} out of range")]
    InvalidDifficulty(u32),
}

// ---------------------------------------------------------------------------
// BlockCandidate
// ---------------------------------------------------------------------------

/// A block whose payload, link and timestamp are fixed but whose nonce has
/// not been found yet. Handed to [`ProofOfWork`] for sealing.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockCandidate {
    timestamp: i64,
    data: Vec<u8>,
    previous_hash: Option<BlockHash>,
}

impl BlockCandidate {
    /// Prepare a candidate stamped with the current wall-clock time.
    pub fn new(data: Vec<u8>, previous_hash: Option<BlockHash>) -> Self {
        Self {
            timestamp: chrono::Utc::now().timestamp(),
            data,
            previous_hash,
        }
    }

    /// Override the timestamp. Mining is deterministic for a fixed header,
    /// so pinning the clock pins the nonce.
    pub fn with_timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn previous_hash(&self) -> Option<&BlockHash> {
        self.previous_hash.as_ref()
    }

    /// Header bytes minus the nonce, at the given difficulty.
    pub(crate) fn header_prefix(&self, difficulty_bits: u32) -> Vec<u8> {
        header_prefix(
            self.previous_hash_bytes(),
            &self.data,
            self.timestamp,
            difficulty_bits,
        )
    }

    /// Full header bytes for a given difficulty and nonce.
    pub fn header_bytes(&self, difficulty_bits: u32, nonce: u64) -> Vec<u8> {
        compute_header_bytes(
            self.previous_hash_bytes(),
            &self.data,
            self.timestamp,
            difficulty_bits,
            nonce,
        )
    }

    fn previous_hash_bytes(&self) -> &[u8] {
        self.previous_hash.as_ref().map(|h| h.as_slice()).unwrap_or(&[])
    }

    /// Attach a proof-of-work solution. Only the miner calls this.
    pub(crate) fn seal(self, solution: Solution) -> Block {
        Block {
            timestamp: self.timestamp,
            data: self.data,
            previous_hash: self.previous_hash,
            hash: solution.hash,
            nonce: solution.nonce,
            difficulty_bits: solution.difficulty_bits,
        }
    }
}

// ---------------------------------------------------------------------------
// Block
// ---------------------------------------------------------------------------

/// One committed ledger record.
///
/// Deserializing goes through [`BlockFields`] and only succeeds for blocks
/// that pass [`Block::verify`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "BlockFields")]
pub struct Block {
    /// Seconds since the Unix epoch at which the block was prepared.
    timestamp: i64,
    /// Opaque caller payload.
    data: Vec<u8>,
    /// Hash of the predecessor. `None` only for genesis.
    previous_hash: Option<BlockHash>,
    /// SHA-256 of the header. Derived, never set by callers.
    hash: BlockHash,
    /// Proof-of-work solution.
    nonce: u64,
    /// Difficulty the block was mined at. Part of the hashed header.
    difficulty_bits: u32,
}

impl Block {
    /// Mine the genesis block: fixed payload, no predecessor.
    pub fn new_genesis_block(pow: &ProofOfWork) -> PowResult<Self> {
        Self::new_block(GENESIS_DATA.to_vec(), None, pow)
    }

    /// Mine a block carrying `data` on top of `previous_hash`.
    pub fn new_block(
        data: Vec<u8>,
        previous_hash: Option<BlockHash>,
        pow: &ProofOfWork,
    ) -> PowResult<Self> {
        pow.seal(BlockCandidate::new(data, previous_hash))
    }

    /// Rebuild a block from decoded fields. The caller is responsible for
    /// running [`Block::verify`] if it does not trust the source.
    pub(crate) fn from_parts(
        timestamp: i64,
        data: Vec<u8>,
        previous_hash: Option<BlockHash>,
        hash: BlockHash,
        nonce: u64,
        difficulty_bits: u32,
    ) -> Self {
        Self {
            timestamp,
            data,
            previous_hash,
            hash,
            nonce,
            difficulty_bits,
        }
    }

    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn previous_hash(&self) -> Option<&BlockHash> {
        self.previous_hash.as_ref()
    }

    pub fn hash(&self) -> &BlockHash {
        &self.hash
    }

    pub fn nonce(&self) -> u64 {
        self.nonce
    }

    pub fn difficulty_bits(&self) -> u32 {
        self.difficulty_bits
    }

    /// True for the root block (no predecessor).
    pub fn is_genesis(&self) -> bool {
        self.previous_hash.is_none()
    }

    /// Return the block hash as a hex string.
    pub fn hash_hex(&self) -> String {
        hex::encode(self.hash)
    }

    /// Return the previous hash as a hex string (empty for genesis).
    pub fn previous_hash_hex(&self) -> String {
        self.previous_hash.map(hex::encode).unwrap_or_default()
    }

    /// Re-derive the header bytes from the stored fields.
    pub fn header_bytes(&self) -> Vec<u8> {
        compute_header_bytes(
            self.previous_hash.as_ref().map(|h| h.as_slice()).unwrap_or(&[]),
            &self.data,
            self.timestamp,
            self.difficulty_bits,
            self.nonce,
        )
    }

    /// Recompute the block hash from header fields.
    pub fn compute_hash(&self) -> BlockHash {
        sha256_array(&self.header_bytes())
    }

    /// Check hash integrity and proof-of-work validity.
    ///
    /// 1. `difficulty_bits` is within the accepted range.
    /// 2. The stored hash matches the recomputed hash.
    /// 3. The hash, as a big-endian integer, is below `2^(256 - difficulty_bits)`.
    pub fn verify(&self) -> Result<(), BlockVerifyError> {
        validate_difficulty(self.difficulty_bits)
            .map_err(|_| BlockVerifyError::InvalidDifficulty(self.difficulty_bits))?;

        let computed = self.compute_hash();
        if computed != self.hash {
            return Err(BlockVerifyError::HashMismatch {
                stored: self.hash_hex(),
                computed: hex::encode(computed),
            });
        }

        if !meets_target(&self.hash, self.difficulty_bits) {
            return Err(BlockVerifyError::InsufficientWork {
                hash: self.hash_hex(),
                difficulty_bits: self.difficulty_bits,
            });
        }

        Ok(())
    }
}

/// Unchecked wire shape of a [`Block`], used only on the way in.
#[derive(Deserialize)]
struct BlockFields {
    timestamp: i64,
    data: Vec<u8>,
    previous_hash: Option<BlockHash>,
    hash: BlockHash,
    nonce: u64,
    difficulty_bits: u32,
}

impl TryFrom<BlockFields> for Block {
    type Error = BlockVerifyError;

    fn try_from(fields: BlockFields) -> Result<Self, Self::Error> {
        let block = Block::from_parts(
            fields.timestamp,
            fields.data,
            fields.previous_hash,
            fields.hash,
            fields.nonce,
            fields.difficulty_bits,
        );
        block.verify()?;
        Ok(block)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_BITS: u32 = 8;

    fn pow() -> ProofOfWork {
        ProofOfWork::new(TEST_BITS).expect("valid difficulty")
    }

    #[test]
    fn header_bytes_layout() {
        let prev = [0xAB; 32];
        let bytes = compute_header_bytes(&prev, b"xyz", -2, 24, 7);

        assert_eq!(bytes.len(), 32 + 3 + 8 + 4 + 8);
        assert_eq!(&bytes[..32], &prev);
        assert_eq!(&bytes[32..35], b"xyz");
        assert_eq!(&bytes[35..43], &(-2i64).to_be_bytes());
        assert_eq!(&bytes[43..47], &24u32.to_be_bytes());
        assert_eq!(&bytes[47..], &7u64.to_be_bytes());
    }

    #[test]
    fn header_bytes_depend_on_every_field() {
        let base = compute_header_bytes(&[1; 32], b"data", 100, 8, 0);
        assert_ne!(base, compute_header_bytes(&[2; 32], b"data", 100, 8, 0));
        assert_ne!(base, compute_header_bytes(&[1; 32], b"datb", 100, 8, 0));
        assert_ne!(base, compute_header_bytes(&[1; 32], b"data", 101, 8, 0));
        assert_ne!(base, compute_header_bytes(&[1; 32], b"data", 100, 9, 0));
        assert_ne!(base, compute_header_bytes(&[1; 32], b"data", 100, 8, 1));
    }

    #[test]
    fn genesis_block_properties() {
        let genesis = Block::new_genesis_block(&pow()).unwrap();
        assert!(genesis.is_genesis());
        assert!(genesis.previous_hash().is_none());
        assert_eq!(genesis.previous_hash_hex(), "");
        assert_eq!(genesis.data(), GENESIS_DATA);
        assert_eq!(genesis.difficulty_bits(), TEST_BITS);
        assert!(genesis.verify().is_ok());
    }

    #[test]
    fn new_block_links_to_parent() {
        let genesis = Block::new_genesis_block(&pow()).unwrap();
        let block = Block::new_block(b"A".to_vec(), Some(*genesis.hash()), &pow()).unwrap();

        assert!(!block.is_genesis());
        assert_eq!(block.previous_hash(), Some(genesis.hash()));
        assert_eq!(block.previous_hash_hex(), genesis.hash_hex());
        assert!(block.verify().is_ok());
    }

    #[test]
    fn hash_matches_header_digest() {
        let block = Block::new_block(b"payload".to_vec(), Some([9; 32]), &pow()).unwrap();
        assert_eq!(block.compute_hash(), *block.hash());
        assert_eq!(sha256_array(&block.header_bytes()), *block.hash());
        // 8 bits of difficulty means the first byte is zero.
        assert_eq!(block.hash()[0], 0);
    }

    #[test]
    fn tampered_data_fails_verification() {
        let mut block = Block::new_block(b"honest".to_vec(), None, &pow()).unwrap();
        block.data = b"forged".to_vec();
        assert!(matches!(
            block.verify(),
            Err(BlockVerifyError::HashMismatch { .. })
        ));
    }

    #[test]
    fn tampered_nonce_fails_verification() {
        let mut block = Block::new_block(b"x".to_vec(), None, &pow()).unwrap();
        block.nonce = block.nonce.wrapping_add(1);
        assert!(block.verify().is_err());
    }

    #[test]
    fn consistent_hash_without_work_is_rejected() {
        // Nonce search skipped: the hash is self-consistent but not below target.
        let candidate = BlockCandidate::new(b"lazy".to_vec(), None).with_timestamp(1);
        let mut nonce = 0;
        let (nonce, hash) = loop {
            let hash = sha256_array(&candidate.header_bytes(TEST_BITS, nonce));
            if hash[0] != 0 {
                break (nonce, hash);
            }
            nonce += 1;
        };
        let block = candidate.seal(Solution {
            nonce,
            hash,
            difficulty_bits: TEST_BITS,
        });

        assert!(matches!(
            block.verify(),
            Err(BlockVerifyError::InsufficientWork { .. })
        ));
    }

    #[test]
    fn out_of_range_difficulty_is_rejected() {
        let mut block = Block::new_block(b"x".to_vec(), None, &pow()).unwrap();
        block.difficulty_bits = 0;
        assert_eq!(block.verify(), Err(BlockVerifyError::InvalidDifficulty(0)));
    }

    #[test]
    fn candidate_prefix_is_header_without_nonce() {
        let candidate = BlockCandidate::new(b"abc".to_vec(), Some([3; 32])).with_timestamp(42);
        let mut prefix = candidate.header_prefix(12);
        prefix.extend_from_slice(&99u64.to_be_bytes());
        assert_eq!(prefix, candidate.header_bytes(12, 99));
    }

    #[test]
    fn block_serialization_roundtrip() {
        let genesis = Block::new_genesis_block(&pow()).unwrap();
        let json = serde_json::to_string(&genesis).expect("serialize");
        let recovered: Block = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(genesis, recovered);
    }

    #[test]
    fn deserializing_a_forged_hash_fails() {
        let block = Block::new_block(b"payload".to_vec(), Some([5; 32]), &pow()).unwrap();
        let mut value = serde_json::to_value(&block).expect("serialize");
        value["hash"] = serde_json::to_value([0u8; 32]).expect("hash value");

        let err = serde_json::from_value::<Block>(value).unwrap_err();
        assert!(err.to_string().contains("hash mismatch"), "{err}");
    }

    #[test]
    fn deserializing_edited_data_fails() {
        let block = Block::new_block(b"payload".to_vec(), None, &pow()).unwrap();
        let mut value = serde_json::to_value(&block).expect("serialize");
        value["data"] = serde_json::to_value(b"other".to_vec()).expect("data value");

        assert!(serde_json::from_value::<Block>(value).is_err());
    }
}
